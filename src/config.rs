//! Experiment-factory configuration
//!
//! JSON describing the server, the query shape and the domain of every
//! tunable parameter, plus the scorers and GA settings. Query factories are
//! tagged by `"type"` and feature domains by `"kind"`; each slot accepts
//! exactly one domain kind.

use serde::Deserialize;
use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::experiment::ExperimentFactory;
use crate::factory::{
    FloatFactory, IntFactory, OperatorWeights, QueryOperatorFactory, StringFactory,
    StringListFactory, WeightedFieldsFactory,
};
use crate::feature::Operator;
use crate::ga::GaConfig;
use crate::param_string::{ParamStringFactory, ParamStringListFactory};
use crate::query::{
    BooleanQueryFactory, BoostingQueryFactory, DisMaxQueryFactory, LuceneQueryFactory,
    MultiMatchQueryFactory, MultiMatchType, Occur, Query, QueryFactory, TermQuery, TermsQuery,
};
use crate::scorer::{check_scorers, ScorerConfig, ScorerKind};

fn default_field_weights() -> Vec<f64> {
    vec![0.0, 1.0, 2.0, 5.0]
}

fn default_operators() -> Vec<Operator> {
    vec![Operator::And, Operator::Or]
}

fn default_match_types() -> Vec<MultiMatchType> {
    vec![MultiMatchType::BestFields]
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    pub id: String,
    pub template: String,
}

/// Domain of one tunable parameter.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureConfig {
    WeightedFields {
        /// `field` or `field^weight`; a declared weight is never tuned.
        fields: Vec<String>,
        #[serde(default = "default_field_weights")]
        default_weights: Vec<f64>,
        #[serde(default)]
        min_set_size: usize,
        #[serde(default)]
        max_set_size: Option<usize>,
    },
    Float {
        values: Vec<f64>,
    },
    Int {
        min: i64,
        max: i64,
    },
    String {
        values: Vec<String>,
    },
    StringList {
        values: Vec<String>,
        #[serde(default)]
        min_set_size: usize,
        #[serde(default)]
        max_set_size: Option<usize>,
    },
    ParamStringList {
        templates: Vec<TemplateConfig>,
        #[serde(default)]
        min_set_size: usize,
        #[serde(default)]
        max_set_size: Option<usize>,
        #[serde(default)]
        modify_probability: Option<f64>,
    },
    QueryOperator {
        #[serde(default = "default_operators")]
        operators: Vec<Operator>,
        #[serde(default)]
        int_mm: Option<(i64, i64)>,
        #[serde(default)]
        float_mm: Option<(f64, f64)>,
        #[serde(default)]
        weights: OperatorWeights,
    },
}

impl FeatureConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            FeatureConfig::WeightedFields { .. } => "weighted_fields",
            FeatureConfig::Float { .. } => "float",
            FeatureConfig::Int { .. } => "int",
            FeatureConfig::String { .. } => "string",
            FeatureConfig::StringList { .. } => "string_list",
            FeatureConfig::ParamStringList { .. } => "param_string_list",
            FeatureConfig::QueryOperator { .. } => "query_operator",
        }
    }

    fn wrong_kind(&self, name: &str, expected: &str) -> ConfigError {
        ConfigError::Parse(format!(
            "'{}' needs a {} domain, got {}",
            name,
            expected,
            self.kind()
        ))
    }

    pub fn weighted_fields(&self, name: &str) -> Result<WeightedFieldsFactory, ConfigError> {
        match self {
            FeatureConfig::WeightedFields {
                fields,
                default_weights,
                min_set_size,
                max_set_size,
            } => WeightedFieldsFactory::new(
                name,
                fields,
                default_weights,
                *min_set_size,
                max_set_size.unwrap_or(usize::MAX),
            ),
            other => Err(other.wrong_kind(name, "weighted_fields")),
        }
    }

    pub fn float(&self, name: &str) -> Result<FloatFactory, ConfigError> {
        match self {
            FeatureConfig::Float { values } => FloatFactory::new(name, values),
            other => Err(other.wrong_kind(name, "float")),
        }
    }

    pub fn int(&self, name: &str) -> Result<IntFactory, ConfigError> {
        match self {
            FeatureConfig::Int { min, max } => IntFactory::new(name, *min, *max),
            other => Err(other.wrong_kind(name, "int")),
        }
    }

    pub fn string(&self, name: &str) -> Result<StringFactory, ConfigError> {
        match self {
            FeatureConfig::String { values } => StringFactory::new(name, values),
            other => Err(other.wrong_kind(name, "string")),
        }
    }

    pub fn string_list(&self, name: &str) -> Result<StringListFactory, ConfigError> {
        match self {
            FeatureConfig::StringList {
                values,
                min_set_size,
                max_set_size,
            } => StringListFactory::new(name, values, *min_set_size, max_set_size.unwrap_or(usize::MAX)),
            other => Err(other.wrong_kind(name, "string_list")),
        }
    }

    pub fn param_string_list(&self, name: &str) -> Result<ParamStringListFactory, ConfigError> {
        match self {
            FeatureConfig::ParamStringList {
                templates,
                min_set_size,
                max_set_size,
                modify_probability,
            } => {
                let factories = templates
                    .iter()
                    .map(|t| ParamStringFactory::new(&t.id, &t.template))
                    .collect::<Result<Vec<_>, _>>()?;
                let list = ParamStringListFactory::new(
                    name,
                    factories,
                    *min_set_size,
                    max_set_size.unwrap_or(usize::MAX),
                )?;
                Ok(match modify_probability {
                    Some(p) => list.with_modify_probability(*p),
                    None => list,
                })
            }
            other => Err(other.wrong_kind(name, "param_string_list")),
        }
    }

    pub fn query_operator(&self, name: &str) -> Result<QueryOperatorFactory, ConfigError> {
        match self {
            FeatureConfig::QueryOperator {
                operators,
                int_mm,
                float_mm,
                weights,
            } => QueryOperatorFactory::new(name, operators, *int_mm, *float_mm, *weights),
            other => Err(other.wrong_kind(name, "query_operator")),
        }
    }
}

fn opt<T>(
    config: &Option<FeatureConfig>,
    name: &str,
    build: impl Fn(&FeatureConfig, &str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError> {
    config.as_ref().map(|c| build(c, name)).transpose()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisMaxConfig {
    #[serde(default)]
    pub query_string_name: Option<String>,
    pub qf: FeatureConfig,
    pub pf: Option<FeatureConfig>,
    pub pf2: Option<FeatureConfig>,
    pub pf3: Option<FeatureConfig>,
    pub ps: Option<FeatureConfig>,
    pub ps2: Option<FeatureConfig>,
    pub ps3: Option<FeatureConfig>,
    pub tie: Option<FeatureConfig>,
    pub q_op: Option<FeatureConfig>,
    pub bq: Option<FeatureConfig>,
    pub bf: Option<FeatureConfig>,
    pub boost: Option<FeatureConfig>,
}

impl DisMaxConfig {
    fn build(&self, edismax: bool) -> Result<DisMaxQueryFactory, ConfigError> {
        let mut f = DisMaxQueryFactory::new(edismax, self.qf.weighted_fields("qf")?);
        f.query_string_name = self.query_string_name.clone();
        f.pf = opt(&self.pf, "pf", FeatureConfig::weighted_fields)?;
        f.pf2 = opt(&self.pf2, "pf2", FeatureConfig::weighted_fields)?;
        f.pf3 = opt(&self.pf3, "pf3", FeatureConfig::weighted_fields)?;
        f.ps = opt(&self.ps, "ps", FeatureConfig::int)?;
        f.ps2 = opt(&self.ps2, "ps2", FeatureConfig::int)?;
        f.ps3 = opt(&self.ps3, "ps3", FeatureConfig::int)?;
        f.tie = opt(&self.tie, "tie", FeatureConfig::float)?;
        f.q_op = opt(&self.q_op, "q.op", FeatureConfig::query_operator)?;
        f.bq = opt(&self.bq, "bq", FeatureConfig::string_list)?;
        f.bf = opt(&self.bf, "bf", FeatureConfig::param_string_list)?;
        f.boost = opt(&self.boost, "boost", FeatureConfig::param_string_list)?;
        Ok(f)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClauseConfig {
    pub occur: Occur,
    pub query: QueryConfig,
}

/// Shape of the tuned query.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryConfig {
    Lucene {
        #[serde(default)]
        query_string_name: Option<String>,
        default_field: FeatureConfig,
        #[serde(default)]
        operator: Option<FeatureConfig>,
    },
    Term {
        field: String,
        term: String,
    },
    Terms {
        field: String,
        terms: Vec<String>,
    },
    MultiMatch {
        #[serde(default)]
        query_string_name: Option<String>,
        qf: FeatureConfig,
        #[serde(default = "default_match_types")]
        types: Vec<MultiMatchType>,
        #[serde(default)]
        tie: Option<FeatureConfig>,
        #[serde(default)]
        operator: Option<FeatureConfig>,
    },
    Dismax(DisMaxConfig),
    Edismax(DisMaxConfig),
    Boolean {
        clauses: Vec<ClauseConfig>,
    },
    Boosting {
        positive: Box<QueryConfig>,
        negative: Box<QueryConfig>,
        negative_boost: FeatureConfig,
    },
}

impl QueryConfig {
    pub fn build(&self) -> Result<QueryFactory, ConfigError> {
        Ok(match self {
            QueryConfig::Lucene {
                query_string_name,
                default_field,
                operator,
            } => QueryFactory::Lucene(LuceneQueryFactory {
                query_string_name: query_string_name.clone(),
                default_field: default_field.string("df")?,
                operator: opt(operator, "q.op", FeatureConfig::query_operator)?,
            }),
            QueryConfig::Term { field, term } => QueryFactory::Fixed(Query::Term(TermQuery {
                field: field.clone(),
                term: term.clone(),
            })),
            QueryConfig::Terms { field, terms } => {
                if terms.is_empty() {
                    return Err(ConfigError::Query(format!("terms query on '{}' has no terms", field)));
                }
                QueryFactory::Fixed(Query::Terms(TermsQuery {
                    field: field.clone(),
                    terms: terms.clone(),
                }))
            }
            QueryConfig::MultiMatch {
                query_string_name,
                qf,
                types,
                tie,
                operator,
            } => {
                if types.is_empty() {
                    return Err(ConfigError::EmptyDomain {
                        name: "type".to_string(),
                    });
                }
                QueryFactory::MultiMatch(MultiMatchQueryFactory {
                    query_string_name: query_string_name.clone(),
                    qf: qf.weighted_fields("fields")?,
                    types: types.clone(),
                    tie: opt(tie, "tie_breaker", FeatureConfig::float)?,
                    operator: opt(operator, "operator", FeatureConfig::query_operator)?,
                })
            }
            QueryConfig::Dismax(c) => QueryFactory::DisMax(c.build(false)?),
            QueryConfig::Edismax(c) => QueryFactory::DisMax(c.build(true)?),
            QueryConfig::Boolean { clauses } => {
                if clauses.is_empty() {
                    return Err(ConfigError::Query("boolean query has no clauses".to_string()));
                }
                let clauses = clauses
                    .iter()
                    .map(|c| Ok((c.occur, c.query.build()?)))
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                QueryFactory::Boolean(BooleanQueryFactory { clauses })
            }
            QueryConfig::Boosting {
                positive,
                negative,
                negative_boost,
            } => QueryFactory::Boosting(BoostingQueryFactory::new(
                positive.build()?,
                negative.build()?,
                negative_boost.float("negative_boost")?,
            )?),
        })
    }
}

fn default_scorers() -> Vec<ScorerConfig> {
    vec![ScorerConfig::new(ScorerKind::Ndcg, 10)]
}

/// Everything needed to generate, run and evolve experiments.
#[derive(Debug, Clone, Deserialize)]
pub struct TuningConfig {
    pub search_server_url: String,
    #[serde(default)]
    pub custom_handler: Option<String>,
    #[serde(default)]
    pub filter_queries: Vec<String>,
    pub query: QueryConfig,
    #[serde(default = "default_scorers")]
    pub scorers: Vec<ScorerConfig>,
    #[serde(default)]
    pub ga: GaConfig,
}

impl TuningConfig {
    /// Parse and validate. Nothing is built from an invalid config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scorers(&self.scorers)?;
        self.ga.validate()?;
        self.experiment_factory().map(|_| ())
    }

    pub fn experiment_factory(&self) -> Result<ExperimentFactory, ConfigError> {
        ExperimentFactory::new(
            &self.search_server_url,
            self.custom_handler.clone(),
            self.filter_queries.clone(),
            self.query.build()?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FeatureFactory;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const EDISMAX: &str = r#"{
        "search_server_url": "memory://data/products.jsonl",
        "filter_queries": ["in_stock:true"],
        "query": {
            "type": "edismax",
            "qf": {"kind": "weighted_fields", "fields": ["title", "body", "brand^2.0"], "default_weights": [0.0, 1.0, 3.0]},
            "pf": {"kind": "weighted_fields", "fields": ["title"], "max_set_size": 1},
            "ps": {"kind": "int", "min": 0, "max": 3},
            "tie": {"kind": "float", "values": [0.0, 0.1, 0.3]},
            "q_op": {"kind": "query_operator", "int_mm": [1, 3]},
            "bq": {"kind": "string_list", "values": ["brand:acme", "color:red"], "max_set_size": 1},
            "bf": {"kind": "param_string_list", "templates": [
                {"id": "recency", "template": "recip(rord(date),[1,2,3],1000,1000)"}
            ]}
        },
        "scorers": [
            {"kind": "ndcg", "at_n": 10, "use_for_train": true},
            {"kind": "precision", "at_n": 5, "use_for_test": true}
        ],
        "ga": {"population": 8, "generations": 3, "n_folds": 2}
    }"#;

    fn seeded_rng() -> StdRng {
        StdRng::seed_from_u64(12345)
    }

    // =========================================================================
    // Parsing Tests
    // =========================================================================

    #[test]
    fn test_full_edismax_config_builds() {
        let config = TuningConfig::from_json(EDISMAX).unwrap();
        assert_eq!(config.scorers.len(), 2);
        assert_eq!(config.ga.population, 8);
        assert_eq!(config.ga.mutation_amplitude, GaConfig::default().mutation_amplitude);

        let factory = config.experiment_factory().unwrap();
        assert_eq!(factory.search_server_url(), "memory://data/products.jsonl");
        let mut rng = seeded_rng();
        let experiment = factory.random("exp_0", &mut rng);
        assert_eq!(experiment.query.kind(), "edismax");
        assert_eq!(experiment.filter_queries, vec!["in_stock:true"]);
        match &experiment.query {
            Query::EDisMax(q) => {
                assert_eq!(q.qf.get("brand").map(|f| f.weight), Some(2.0));
                assert!(q.bf.is_some());
            }
            other => panic!("expected edismax, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults_fill_scorers_and_ga() {
        let json = r#"{
            "search_server_url": "memory://docs.jsonl",
            "query": {"type": "lucene", "default_field": {"kind": "string", "values": ["title", "body"]}}
        }"#;
        let config = TuningConfig::from_json(json).unwrap();
        assert_eq!(config.scorers[0].name(), "ndcg@10");
        assert_eq!(config.ga, GaConfig::default());
    }

    #[test]
    fn test_boolean_and_boosting_configs() {
        let json = r#"{
            "search_server_url": "memory://docs.jsonl",
            "query": {"type": "boolean", "clauses": [
                {"occur": "AND", "query": {"type": "boosting",
                    "positive": {"type": "dismax", "qf": {"kind": "weighted_fields", "fields": ["title"]}},
                    "negative": {"type": "lucene", "query_string_name": "brand", "default_field": {"kind": "string", "values": ["brand"]}},
                    "negative_boost": {"kind": "float", "values": [0.1, 0.5]}}},
                {"occur": "FILTER", "query": {"type": "term", "field": "in_stock", "term": "true"}}
            ]}
        }"#;
        let config = TuningConfig::from_json(json).unwrap();
        let query = config.query.build().unwrap();
        assert_eq!(query.name(), "boolean");
        assert!(!query.produces_single_string());
    }

    // =========================================================================
    // Rejection Tests
    // =========================================================================

    #[test]
    fn test_wrong_domain_kind_rejected() {
        let json = EDISMAX.replace(r#""ps": {"kind": "int", "min": 0, "max": 3}"#, r#""ps": {"kind": "float", "values": [1.0]}"#);
        let err = TuningConfig::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("'ps' needs a int domain"), "{}", err);
    }

    #[test]
    fn test_bad_probabilities_rejected() {
        let json = EDISMAX.replace(
            r#""ga": {"population": 8, "generations": 3, "n_folds": 2}"#,
            r#""ga": {"crossover_probability": 0.3, "mutation_probability": 0.3, "reproduction_probability": 0.3}"#,
        );
        assert!(matches!(
            TuningConfig::from_json(&json),
            Err(ConfigError::Probabilities(_))
        ));
    }

    #[test]
    fn test_duplicate_test_scorers_rejected() {
        let json = EDISMAX.replace(r#""use_for_train": true"#, r#""use_for_test": true"#);
        assert!(matches!(
            TuningConfig::from_json(&json),
            Err(ConfigError::DuplicateAggregator("use_for_test"))
        ));
    }

    #[test]
    fn test_unknown_tags_rejected() {
        let unknown_scorer = EDISMAX.replace(r#""kind": "precision""#, r#""kind": "map""#);
        assert!(matches!(
            TuningConfig::from_json(&unknown_scorer),
            Err(ConfigError::Parse(_))
        ));
        let unknown_query = EDISMAX.replace(r#""type": "edismax""#, r#""type": "knn""#);
        assert!(matches!(
            TuningConfig::from_json(&unknown_query),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_bad_template_reference_rejected() {
        let json = EDISMAX.replace("recip(rord(date),[1,2,3],1000,1000)", "recip(rord(date),[$1],1000,1000)");
        assert!(matches!(
            TuningConfig::from_json(&json),
            Err(ConfigError::UndeclaredReference { .. })
        ));
    }

    #[test]
    fn test_boosting_with_boolean_child_rejected() {
        let json = r#"{
            "search_server_url": "memory://docs.jsonl",
            "query": {"type": "boosting",
                "positive": {"type": "boolean", "clauses": [{"occur": "OR", "query": {"type": "term", "field": "a", "term": "b"}}]},
                "negative": {"type": "dismax", "qf": {"kind": "weighted_fields", "fields": ["title"]}},
                "negative_boost": {"kind": "float", "values": [0.5]}}
        }"#;
        assert!(matches!(TuningConfig::from_json(json), Err(ConfigError::Query(_))));
    }
}
