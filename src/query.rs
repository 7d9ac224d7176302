//! Query model and query factories
//!
//! Queries are a closed tree of variants. Single-string queries
//! (lucene, multi_match, dismax, edismax) take their text from a named query
//! string of the judged query at request time; the rest are structural.

use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;
use crate::factory::{
    pick_pair, FeatureFactory, FloatFactory, IntFactory, QueryOperatorFactory, StringFactory,
    StringListFactory, WeightedFieldsFactory,
};
use crate::feature::{Feature, QueryOperator, StringList, WeightedFields};
use crate::param_string::{ParamStringList, ParamStringListFactory};

/// Query string used when a query names none.
pub const DEFAULT_QUERY_STRING_NAME: &str = "query";

/// Named query texts of one judged query.
pub type QueryStrings = BTreeMap<String, String>;

/// Text for a query-string slot. Without a name, the default slot is used,
/// or the only slot if there is exactly one.
pub fn query_text<'a>(strings: &'a QueryStrings, name: Option<&str>) -> Option<&'a str> {
    match name {
        Some(name) => strings.get(name).map(String::as_str),
        None => strings
            .get(DEFAULT_QUERY_STRING_NAME)
            .or_else(|| {
                if strings.len() == 1 {
                    strings.values().next()
                } else {
                    None
                }
            })
            .map(String::as_str),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LuceneQuery {
    #[serde(default)]
    pub query_string_name: Option<String>,
    pub default_field: String,
    #[serde(default)]
    pub operator: QueryOperator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermQuery {
    pub field: String,
    pub term: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermsQuery {
    pub field: String,
    pub terms: Vec<String>,
}

impl TermsQuery {
    /// `field:(a OR b)` for backends without a terms query parser.
    pub fn to_lucene_or(&self) -> String {
        format!("{}:({})", self.field, self.terms.join(" OR "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiMatchType {
    BestFields,
    MostFields,
    CrossFields,
    Phrase,
    PhrasePrefix,
}

impl fmt::Display for MultiMatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MultiMatchType::BestFields => "best_fields",
            MultiMatchType::MostFields => "most_fields",
            MultiMatchType::CrossFields => "cross_fields",
            MultiMatchType::Phrase => "phrase",
            MultiMatchType::PhrasePrefix => "phrase_prefix",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiMatchQuery {
    #[serde(default)]
    pub query_string_name: Option<String>,
    pub qf: WeightedFields,
    pub match_type: MultiMatchType,
    #[serde(default)]
    pub tie: Option<f64>,
    #[serde(default)]
    pub operator: Option<QueryOperator>,
}

/// Shared by dismax and edismax; `boost` only applies to edismax.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DisMaxQuery {
    #[serde(default)]
    pub query_string_name: Option<String>,
    pub qf: WeightedFields,
    #[serde(default)]
    pub pf: Option<WeightedFields>,
    #[serde(default)]
    pub pf2: Option<WeightedFields>,
    #[serde(default)]
    pub pf3: Option<WeightedFields>,
    #[serde(default)]
    pub ps: Option<i64>,
    #[serde(default)]
    pub ps2: Option<i64>,
    #[serde(default)]
    pub ps3: Option<i64>,
    #[serde(default)]
    pub tie: Option<f64>,
    #[serde(default)]
    pub q_op: Option<QueryOperator>,
    #[serde(default)]
    pub bq: Option<StringList>,
    #[serde(default)]
    pub bf: Option<ParamStringList>,
    #[serde(default)]
    pub boost: Option<ParamStringList>,
}

impl DisMaxQuery {
    /// Parameters in a fixed order.
    pub fn features(&self) -> Vec<(&'static str, Feature)> {
        let mut out = vec![("qf", Feature::WeightedFields(self.qf.clone()))];
        let lists = [("pf", &self.pf), ("pf2", &self.pf2), ("pf3", &self.pf3)];
        for (name, value) in lists {
            if let Some(v) = value {
                out.push((name, Feature::WeightedFields(v.clone())));
            }
        }
        for (name, value) in [("ps", self.ps), ("ps2", self.ps2), ("ps3", self.ps3)] {
            if let Some(v) = value {
                out.push((name, Feature::Int(v)));
            }
        }
        if let Some(tie) = self.tie {
            out.push(("tie", Feature::Float(tie)));
        }
        if let Some(op) = self.q_op {
            out.push(("q.op", Feature::QueryOperator(op)));
        }
        if let Some(bq) = &self.bq {
            out.push(("bq", Feature::StringList(bq.clone())));
        }
        if let Some(bf) = &self.bf {
            out.push(("bf", Feature::ParamStringList(bf.clone())));
        }
        if let Some(boost) = &self.boost {
            out.push(("boost", Feature::ParamStringList(boost.clone())));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Occur {
    And,
    Or,
    Filter,
    Not,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanClause {
    pub occur: Occur,
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanQuery {
    pub clauses: Vec<BooleanClause>,
}

/// Positive query whose hits are demoted by `negative_boost` when they also
/// match the negative query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostingQuery {
    pub positive: Box<Query>,
    pub negative: Box<Query>,
    pub negative_boost: f64,
}

impl BoostingQuery {
    pub fn new(positive: Query, negative: Query, negative_boost: f64) -> Result<Self, ConfigError> {
        let q = Self {
            positive: Box::new(positive),
            negative: Box::new(negative),
            negative_boost,
        };
        q.validate()?;
        Ok(q)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.positive.is_single_string() || !self.negative.is_single_string() {
            return Err(ConfigError::Query(
                "boosting query children must be single-string queries".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.negative_boost) {
            return Err(ConfigError::Query(format!(
                "negative boost {} must be within [0, 1]",
                self.negative_boost
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Query {
    #[serde(rename = "lucene")]
    Lucene(LuceneQuery),
    #[serde(rename = "term")]
    Term(TermQuery),
    #[serde(rename = "terms")]
    Terms(TermsQuery),
    #[serde(rename = "multi_match")]
    MultiMatch(MultiMatchQuery),
    #[serde(rename = "dismax")]
    DisMax(DisMaxQuery),
    #[serde(rename = "edismax")]
    EDisMax(DisMaxQuery),
    #[serde(rename = "boolean")]
    Boolean(BooleanQuery),
    #[serde(rename = "boosting")]
    Boosting(BoostingQuery),
}

impl Query {
    pub fn kind(&self) -> &'static str {
        match self {
            Query::Lucene(_) => "lucene",
            Query::Term(_) => "term",
            Query::Terms(_) => "terms",
            Query::MultiMatch(_) => "multi_match",
            Query::DisMax(_) => "dismax",
            Query::EDisMax(_) => "edismax",
            Query::Boolean(_) => "boolean",
            Query::Boosting(_) => "boosting",
        }
    }

    /// Whether the query reads its text from a query string.
    pub fn is_single_string(&self) -> bool {
        matches!(
            self,
            Query::Lucene(_) | Query::MultiMatch(_) | Query::DisMax(_) | Query::EDisMax(_)
        )
    }

    pub fn query_string_name(&self) -> Option<&str> {
        match self {
            Query::Lucene(q) => q.query_string_name.as_deref(),
            Query::MultiMatch(q) => q.query_string_name.as_deref(),
            Query::DisMax(q) | Query::EDisMax(q) => q.query_string_name.as_deref(),
            _ => None,
        }
    }

    /// Lucene OR form of a terms query, for backends without a terms parser.
    pub fn terms_as_lucene_or(&self) -> Option<String> {
        match self {
            Query::Terms(t) => Some(t.to_lucene_or()),
            _ => None,
        }
    }

    /// Check structural constraints, e.g. after loading from JSON.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Query::Boosting(b) => b.validate(),
            Query::Boolean(b) => {
                if b.clauses.is_empty() {
                    return Err(ConfigError::Query("boolean query without clauses".to_string()));
                }
                b.clauses.iter().try_for_each(|c| c.query.validate())
            }
            Query::Terms(t) if t.terms.is_empty() => {
                Err(ConfigError::Query(format!("terms query on '{}' without terms", t.field)))
            }
            _ => Ok(()),
        }
    }

    /// Flat request parameters for a single-string or term query.
    ///
    /// Lists expand to one parameter per entry under the same key. Returns
    /// `None` for boolean and boosting trees, which need a structured
    /// request, or when the query text is missing.
    pub fn to_params(&self, strings: &QueryStrings) -> Option<Vec<(String, String)>> {
        let text = || query_text(strings, self.query_string_name()).map(str::to_string);
        let mut params: Vec<(String, String)> = Vec::new();
        match self {
            Query::Lucene(q) => {
                params.push(("q".into(), text()?));
                params.push(("defType".into(), "lucene".into()));
                params.push(("df".into(), q.default_field.clone()));
                params.extend(Feature::QueryOperator(q.operator).to_params("q.op"));
            }
            Query::Term(t) => {
                params.push(("q".into(), format!("{}:{}", t.field, t.term)));
            }
            Query::Terms(t) => {
                params.push(("q".into(), format!("{{!terms f={}}}{}", t.field, t.terms.join(","))));
            }
            Query::MultiMatch(q) => {
                params.push(("q".into(), text()?));
                params.push(("type".into(), q.match_type.to_string()));
                params.extend(Feature::WeightedFields(q.qf.clone()).to_params("qf"));
                if let Some(tie) = q.tie {
                    params.extend(Feature::Float(tie).to_params("tie"));
                }
                if let Some(op) = q.operator {
                    params.extend(Feature::QueryOperator(op).to_params("q.op"));
                }
            }
            Query::DisMax(q) | Query::EDisMax(q) => {
                params.push(("q".into(), text()?));
                params.push(("defType".into(), self.kind().into()));
                for (name, feature) in q.features() {
                    if name == "boost" && matches!(self, Query::DisMax(_)) {
                        continue;
                    }
                    params.extend(feature.to_params(name));
                }
            }
            Query::Boolean(_) | Query::Boosting(_) => return None,
        }
        Some(params)
    }
}

// =============================================================================
// Query factories
// =============================================================================

fn opt_random<F: FeatureFactory, R: Rng>(f: &Option<F>, rng: &mut R) -> Option<F::Value> {
    f.as_ref().map(|f| f.random(rng))
}

fn opt_mutate<F: FeatureFactory, R: Rng>(
    f: &Option<F>,
    value: &Option<F::Value>,
    probability: f64,
    amplitude: f64,
    rng: &mut R,
) -> Option<F::Value> {
    match (f, value) {
        (Some(f), Some(v)) => Some(f.mutate(v, probability, amplitude, rng)),
        (Some(f), None) => Some(f.random(rng)),
        (None, _) => None,
    }
}

fn opt_crossover<F: FeatureFactory, R: Rng>(
    f: &Option<F>,
    a: &Option<F::Value>,
    b: &Option<F::Value>,
    rng: &mut R,
) -> (Option<F::Value>, Option<F::Value>) {
    match (f, a, b) {
        (Some(f), Some(a), Some(b)) => {
            let (x, y) = f.crossover(a, b, rng);
            (Some(x), Some(y))
        }
        _ => pick_pair(a, b, rng),
    }
}

/// Cartesian expansion: every existing item combined with every value,
/// stopping at `max_size`. An absent factory leaves the items as they are.
fn expand<T: Clone, V: Clone>(
    items: Vec<T>,
    values: Option<Vec<V>>,
    max_size: usize,
    set: impl Fn(&mut T, V),
) -> Vec<T> {
    let Some(values) = values else { return items };
    if values.is_empty() {
        return items;
    }
    let mut out = Vec::new();
    'outer: for item in &items {
        for v in &values {
            if out.len() >= max_size {
                break 'outer;
            }
            let mut next = item.clone();
            set(&mut next, v.clone());
            out.push(next);
        }
    }
    out
}

fn opt_permute<F: FeatureFactory>(f: &Option<F>, max_size: usize) -> Option<Vec<F::Value>> {
    f.as_ref().map(|f| f.permute(max_size))
}

#[derive(Debug, Clone)]
pub struct LuceneQueryFactory {
    pub query_string_name: Option<String>,
    pub default_field: StringFactory,
    pub operator: Option<QueryOperatorFactory>,
}

#[derive(Debug, Clone)]
pub struct MultiMatchQueryFactory {
    pub query_string_name: Option<String>,
    pub qf: WeightedFieldsFactory,
    pub types: Vec<MultiMatchType>,
    pub tie: Option<FloatFactory>,
    pub operator: Option<QueryOperatorFactory>,
}

#[derive(Debug, Clone)]
pub struct DisMaxQueryFactory {
    pub edismax: bool,
    pub query_string_name: Option<String>,
    pub qf: WeightedFieldsFactory,
    pub pf: Option<WeightedFieldsFactory>,
    pub pf2: Option<WeightedFieldsFactory>,
    pub pf3: Option<WeightedFieldsFactory>,
    pub ps: Option<IntFactory>,
    pub ps2: Option<IntFactory>,
    pub ps3: Option<IntFactory>,
    pub tie: Option<FloatFactory>,
    pub q_op: Option<QueryOperatorFactory>,
    pub bq: Option<StringListFactory>,
    pub bf: Option<ParamStringListFactory>,
    pub boost: Option<ParamStringListFactory>,
}

impl DisMaxQueryFactory {
    /// Only `qf` set.
    pub fn new(edismax: bool, qf: WeightedFieldsFactory) -> Self {
        Self {
            edismax,
            query_string_name: None,
            qf,
            pf: None,
            pf2: None,
            pf3: None,
            ps: None,
            ps2: None,
            ps3: None,
            tie: None,
            q_op: None,
            bq: None,
            bf: None,
            boost: None,
        }
    }

    fn wrap(&self, q: DisMaxQuery) -> Query {
        if self.edismax {
            Query::EDisMax(q)
        } else {
            Query::DisMax(q)
        }
    }

    fn random<R: Rng>(&self, rng: &mut R) -> DisMaxQuery {
        DisMaxQuery {
            query_string_name: self.query_string_name.clone(),
            qf: self.qf.random(rng),
            pf: opt_random(&self.pf, rng),
            pf2: opt_random(&self.pf2, rng),
            pf3: opt_random(&self.pf3, rng),
            ps: opt_random(&self.ps, rng),
            ps2: opt_random(&self.ps2, rng),
            ps3: opt_random(&self.ps3, rng),
            tie: opt_random(&self.tie, rng),
            q_op: opt_random(&self.q_op, rng),
            bq: opt_random(&self.bq, rng),
            bf: opt_random(&self.bf, rng),
            boost: if self.edismax { opt_random(&self.boost, rng) } else { None },
        }
    }

    fn permute(&self, max_size: usize) -> Vec<DisMaxQuery> {
        let base = DisMaxQuery {
            query_string_name: self.query_string_name.clone(),
            ..DisMaxQuery::default()
        };
        let m = max_size;
        let mut out = expand(vec![base], Some(self.qf.permute(m)), m, |q, v| q.qf = v);
        out = expand(out, opt_permute(&self.pf, m), m, |q, v| q.pf = Some(v));
        out = expand(out, opt_permute(&self.pf2, m), m, |q, v| q.pf2 = Some(v));
        out = expand(out, opt_permute(&self.pf3, m), m, |q, v| q.pf3 = Some(v));
        out = expand(out, opt_permute(&self.ps, m), m, |q, v| q.ps = Some(v));
        out = expand(out, opt_permute(&self.ps2, m), m, |q, v| q.ps2 = Some(v));
        out = expand(out, opt_permute(&self.ps3, m), m, |q, v| q.ps3 = Some(v));
        out = expand(out, opt_permute(&self.tie, m), m, |q, v| q.tie = Some(v));
        out = expand(out, opt_permute(&self.q_op, m), m, |q, v| q.q_op = Some(v));
        out = expand(out, opt_permute(&self.bq, m), m, |q, v| q.bq = Some(v));
        out = expand(out, opt_permute(&self.bf, m), m, |q, v| q.bf = Some(v));
        if self.edismax {
            out = expand(out, opt_permute(&self.boost, m), m, |q, v| q.boost = Some(v));
        }
        out.truncate(max_size);
        out
    }

    fn mutate<R: Rng>(&self, q: &DisMaxQuery, p: f64, amp: f64, rng: &mut R) -> DisMaxQuery {
        DisMaxQuery {
            query_string_name: q.query_string_name.clone(),
            qf: self.qf.mutate(&q.qf, p, amp, rng),
            pf: opt_mutate(&self.pf, &q.pf, p, amp, rng),
            pf2: opt_mutate(&self.pf2, &q.pf2, p, amp, rng),
            pf3: opt_mutate(&self.pf3, &q.pf3, p, amp, rng),
            ps: opt_mutate(&self.ps, &q.ps, p, amp, rng),
            ps2: opt_mutate(&self.ps2, &q.ps2, p, amp, rng),
            ps3: opt_mutate(&self.ps3, &q.ps3, p, amp, rng),
            tie: opt_mutate(&self.tie, &q.tie, p, amp, rng),
            q_op: opt_mutate(&self.q_op, &q.q_op, p, amp, rng),
            bq: opt_mutate(&self.bq, &q.bq, p, amp, rng),
            bf: opt_mutate(&self.bf, &q.bf, p, amp, rng),
            boost: if self.edismax {
                opt_mutate(&self.boost, &q.boost, p, amp, rng)
            } else {
                None
            },
        }
    }

    fn crossover<R: Rng>(
        &self,
        a: &DisMaxQuery,
        b: &DisMaxQuery,
        rng: &mut R,
    ) -> (DisMaxQuery, DisMaxQuery) {
        let (qf1, qf2) = self.qf.crossover(&a.qf, &b.qf, rng);
        let (pf1, pf2_) = opt_crossover(&self.pf, &a.pf, &b.pf, rng);
        let (pf21, pf22) = opt_crossover(&self.pf2, &a.pf2, &b.pf2, rng);
        let (pf31, pf32) = opt_crossover(&self.pf3, &a.pf3, &b.pf3, rng);
        let (ps1, ps2_) = opt_crossover(&self.ps, &a.ps, &b.ps, rng);
        let (ps21, ps22) = opt_crossover(&self.ps2, &a.ps2, &b.ps2, rng);
        let (ps31, ps32) = opt_crossover(&self.ps3, &a.ps3, &b.ps3, rng);
        let (tie1, tie2) = opt_crossover(&self.tie, &a.tie, &b.tie, rng);
        let (op1, op2) = opt_crossover(&self.q_op, &a.q_op, &b.q_op, rng);
        let (bq1, bq2) = opt_crossover(&self.bq, &a.bq, &b.bq, rng);
        let (bf1, bf2) = opt_crossover(&self.bf, &a.bf, &b.bf, rng);
        let (boost1, boost2) = opt_crossover(&self.boost, &a.boost, &b.boost, rng);
        let first = DisMaxQuery {
            query_string_name: a.query_string_name.clone(),
            qf: qf1,
            pf: pf1,
            pf2: pf21,
            pf3: pf31,
            ps: ps1,
            ps2: ps21,
            ps3: ps31,
            tie: tie1,
            q_op: op1,
            bq: bq1,
            bf: bf1,
            boost: boost1,
        };
        let second = DisMaxQuery {
            query_string_name: b.query_string_name.clone(),
            qf: qf2,
            pf: pf2_,
            pf2: pf22,
            pf3: pf32,
            ps: ps2_,
            ps2: ps22,
            ps3: ps32,
            tie: tie2,
            q_op: op2,
            bq: bq2,
            bf: bf2,
            boost: boost2,
        };
        (first, second)
    }
}

#[derive(Debug, Clone)]
pub struct BooleanQueryFactory {
    pub clauses: Vec<(Occur, QueryFactory)>,
}

#[derive(Debug, Clone)]
pub struct BoostingQueryFactory {
    positive: Box<QueryFactory>,
    negative: Box<QueryFactory>,
    negative_boost: FloatFactory,
}

impl BoostingQueryFactory {
    pub fn new(
        positive: QueryFactory,
        negative: QueryFactory,
        negative_boost: FloatFactory,
    ) -> Result<Self, ConfigError> {
        if !positive.produces_single_string() || !negative.produces_single_string() {
            return Err(ConfigError::Query(
                "boosting query children must be single-string queries".to_string(),
            ));
        }
        let (lo, hi) = negative_boost.range();
        if lo < 0.0 || hi > 1.0 {
            return Err(ConfigError::Query(format!(
                "negative boost range [{}, {}] must be within [0, 1]",
                lo, hi
            )));
        }
        Ok(Self {
            positive: Box::new(positive),
            negative: Box::new(negative),
            negative_boost,
        })
    }
}

/// Generator for whole queries, one variant per query kind.
#[derive(Debug, Clone)]
pub enum QueryFactory {
    Lucene(LuceneQueryFactory),
    MultiMatch(MultiMatchQueryFactory),
    DisMax(DisMaxQueryFactory),
    Boolean(BooleanQueryFactory),
    Boosting(BoostingQueryFactory),
    /// Query with nothing to tune, e.g. a term filter.
    Fixed(Query),
}

impl QueryFactory {
    pub fn produces_single_string(&self) -> bool {
        match self {
            QueryFactory::Lucene(_) | QueryFactory::MultiMatch(_) | QueryFactory::DisMax(_) => true,
            QueryFactory::Fixed(q) => q.is_single_string(),
            QueryFactory::Boolean(_) | QueryFactory::Boosting(_) => false,
        }
    }

    fn mismatch(&self, a: &Query, b: &Query) -> (Query, Query) {
        warn!(
            "{} factory cannot combine {} and {} queries, keeping parents",
            self.name(),
            a.kind(),
            b.kind()
        );
        (a.clone(), b.clone())
    }
}

impl FeatureFactory for QueryFactory {
    type Value = Query;

    fn name(&self) -> &str {
        match self {
            QueryFactory::Lucene(_) => "lucene",
            QueryFactory::MultiMatch(_) => "multi_match",
            QueryFactory::DisMax(f) if f.edismax => "edismax",
            QueryFactory::DisMax(_) => "dismax",
            QueryFactory::Boolean(_) => "boolean",
            QueryFactory::Boosting(_) => "boosting",
            QueryFactory::Fixed(q) => q.kind(),
        }
    }

    fn random<R: Rng>(&self, rng: &mut R) -> Query {
        match self {
            QueryFactory::Lucene(f) => Query::Lucene(LuceneQuery {
                query_string_name: f.query_string_name.clone(),
                default_field: f.default_field.random(rng),
                operator: opt_random(&f.operator, rng).unwrap_or_default(),
            }),
            QueryFactory::MultiMatch(f) => Query::MultiMatch(MultiMatchQuery {
                query_string_name: f.query_string_name.clone(),
                qf: f.qf.random(rng),
                match_type: f.types.choose(rng).copied().unwrap_or(MultiMatchType::BestFields),
                tie: opt_random(&f.tie, rng),
                operator: opt_random(&f.operator, rng),
            }),
            QueryFactory::DisMax(f) => f.wrap(f.random(rng)),
            QueryFactory::Boolean(f) => Query::Boolean(BooleanQuery {
                clauses: f
                    .clauses
                    .iter()
                    .map(|(occur, qf)| BooleanClause {
                        occur: *occur,
                        query: qf.random(rng),
                    })
                    .collect(),
            }),
            QueryFactory::Boosting(f) => Query::Boosting(BoostingQuery {
                positive: Box::new(f.positive.random(rng)),
                negative: Box::new(f.negative.random(rng)),
                negative_boost: f.negative_boost.random(rng),
            }),
            QueryFactory::Fixed(q) => q.clone(),
        }
    }

    fn permute(&self, max_size: usize) -> Vec<Query> {
        let m = max_size;
        let mut out = match self {
            QueryFactory::Lucene(f) => {
                let base = LuceneQuery {
                    query_string_name: f.query_string_name.clone(),
                    default_field: String::new(),
                    operator: QueryOperator::default(),
                };
                let items = expand(vec![base], Some(f.default_field.permute(m)), m, |q, v| {
                    q.default_field = v
                });
                expand(items, opt_permute(&f.operator, m), m, |q, v| q.operator = v)
                    .into_iter()
                    .map(Query::Lucene)
                    .collect()
            }
            QueryFactory::MultiMatch(f) => {
                let base = MultiMatchQuery {
                    query_string_name: f.query_string_name.clone(),
                    qf: WeightedFields::default(),
                    match_type: MultiMatchType::BestFields,
                    tie: None,
                    operator: None,
                };
                let mut items = expand(vec![base], Some(f.qf.permute(m)), m, |q, v| q.qf = v);
                items = expand(items, Some(f.types.clone()), m, |q, v| q.match_type = v);
                items = expand(items, opt_permute(&f.tie, m), m, |q, v| q.tie = Some(v));
                items = expand(items, opt_permute(&f.operator, m), m, |q, v| q.operator = Some(v));
                items.into_iter().map(Query::MultiMatch).collect()
            }
            QueryFactory::DisMax(f) => f.permute(m).into_iter().map(|q| f.wrap(q)).collect(),
            QueryFactory::Boolean(f) => {
                let mut items: Vec<Vec<BooleanClause>> = vec![Vec::new()];
                for (occur, qf) in &f.clauses {
                    let occur = *occur;
                    items = expand(items, Some(qf.permute(m)), m, |clauses, query| {
                        clauses.push(BooleanClause { occur, query })
                    });
                }
                items
                    .into_iter()
                    .map(|clauses| Query::Boolean(BooleanQuery { clauses }))
                    .collect()
            }
            QueryFactory::Boosting(f) => {
                let base = BoostingQuery {
                    positive: Box::new(Query::Term(TermQuery {
                        field: String::new(),
                        term: String::new(),
                    })),
                    negative: Box::new(Query::Term(TermQuery {
                        field: String::new(),
                        term: String::new(),
                    })),
                    negative_boost: 0.0,
                };
                let mut items = expand(vec![base], Some(f.positive.permute(m)), m, |q, v| {
                    q.positive = Box::new(v)
                });
                items = expand(items, Some(f.negative.permute(m)), m, |q, v| {
                    q.negative = Box::new(v)
                });
                items = expand(items, Some(f.negative_boost.permute(m)), m, |q, v| {
                    q.negative_boost = v
                });
                items.into_iter().map(Query::Boosting).collect()
            }
            QueryFactory::Fixed(q) => vec![q.clone()],
        };
        out.truncate(max_size);
        out
    }

    fn mutate<R: Rng>(&self, value: &Query, probability: f64, amplitude: f64, rng: &mut R) -> Query {
        let (p, amp) = (probability, amplitude);
        match (self, value) {
            (QueryFactory::Lucene(f), Query::Lucene(q)) => Query::Lucene(LuceneQuery {
                query_string_name: q.query_string_name.clone(),
                default_field: f.default_field.mutate(&q.default_field, p, amp, rng),
                operator: match &f.operator {
                    Some(of) => of.mutate(&q.operator, p, amp, rng),
                    None => q.operator,
                },
            }),
            (QueryFactory::MultiMatch(f), Query::MultiMatch(q)) => {
                let match_type = if rng.gen::<f64>() < p {
                    f.types.choose(rng).copied().unwrap_or(q.match_type)
                } else {
                    q.match_type
                };
                Query::MultiMatch(MultiMatchQuery {
                    query_string_name: q.query_string_name.clone(),
                    qf: f.qf.mutate(&q.qf, p, amp, rng),
                    match_type,
                    tie: opt_mutate(&f.tie, &q.tie, p, amp, rng),
                    operator: opt_mutate(&f.operator, &q.operator, p, amp, rng),
                })
            }
            (QueryFactory::DisMax(f), Query::DisMax(q) | Query::EDisMax(q)) => {
                f.wrap(f.mutate(q, p, amp, rng))
            }
            (QueryFactory::Boolean(f), Query::Boolean(q)) if q.clauses.len() == f.clauses.len() => {
                Query::Boolean(BooleanQuery {
                    clauses: f
                        .clauses
                        .iter()
                        .zip(&q.clauses)
                        .map(|((_, qf), clause)| BooleanClause {
                            occur: clause.occur,
                            query: qf.mutate(&clause.query, p, amp, rng),
                        })
                        .collect(),
                })
            }
            (QueryFactory::Boosting(f), Query::Boosting(q)) => Query::Boosting(BoostingQuery {
                positive: Box::new(f.positive.mutate(&q.positive, p, amp, rng)),
                negative: Box::new(f.negative.mutate(&q.negative, p, amp, rng)),
                negative_boost: f.negative_boost.mutate(&q.negative_boost, p, amp, rng),
            }),
            (QueryFactory::Fixed(_), q) => q.clone(),
            (_, q) => {
                warn!("{} factory cannot mutate a {} query", self.name(), q.kind());
                q.clone()
            }
        }
    }

    fn crossover<R: Rng>(&self, a: &Query, b: &Query, rng: &mut R) -> (Query, Query) {
        match (self, a, b) {
            (QueryFactory::Lucene(f), Query::Lucene(x), Query::Lucene(y)) => {
                let (df1, df2) = f.default_field.crossover(&x.default_field, &y.default_field, rng);
                let (op1, op2) = pick_pair(&x.operator, &y.operator, rng);
                (
                    Query::Lucene(LuceneQuery {
                        query_string_name: x.query_string_name.clone(),
                        default_field: df1,
                        operator: op1,
                    }),
                    Query::Lucene(LuceneQuery {
                        query_string_name: y.query_string_name.clone(),
                        default_field: df2,
                        operator: op2,
                    }),
                )
            }
            (QueryFactory::MultiMatch(f), Query::MultiMatch(x), Query::MultiMatch(y)) => {
                let (qf1, qf2) = f.qf.crossover(&x.qf, &y.qf, rng);
                let (t1, t2) = pick_pair(&x.match_type, &y.match_type, rng);
                let (tie1, tie2) = opt_crossover(&f.tie, &x.tie, &y.tie, rng);
                let (op1, op2) = opt_crossover(&f.operator, &x.operator, &y.operator, rng);
                (
                    Query::MultiMatch(MultiMatchQuery {
                        query_string_name: x.query_string_name.clone(),
                        qf: qf1,
                        match_type: t1,
                        tie: tie1,
                        operator: op1,
                    }),
                    Query::MultiMatch(MultiMatchQuery {
                        query_string_name: y.query_string_name.clone(),
                        qf: qf2,
                        match_type: t2,
                        tie: tie2,
                        operator: op2,
                    }),
                )
            }
            (
                QueryFactory::DisMax(f),
                Query::DisMax(x) | Query::EDisMax(x),
                Query::DisMax(y) | Query::EDisMax(y),
            ) => {
                let (c1, c2) = f.crossover(x, y, rng);
                (f.wrap(c1), f.wrap(c2))
            }
            (QueryFactory::Boolean(f), Query::Boolean(x), Query::Boolean(y))
                if x.clauses.len() == f.clauses.len() && y.clauses.len() == f.clauses.len() =>
            {
                let mut first = Vec::with_capacity(f.clauses.len());
                let mut second = Vec::with_capacity(f.clauses.len());
                for (((occur, qf), cx), cy) in f.clauses.iter().zip(&x.clauses).zip(&y.clauses) {
                    let (q1, q2) = qf.crossover(&cx.query, &cy.query, rng);
                    first.push(BooleanClause { occur: *occur, query: q1 });
                    second.push(BooleanClause { occur: *occur, query: q2 });
                }
                (
                    Query::Boolean(BooleanQuery { clauses: first }),
                    Query::Boolean(BooleanQuery { clauses: second }),
                )
            }
            (QueryFactory::Boosting(f), Query::Boosting(x), Query::Boosting(y)) => {
                let (p1, p2) = f.positive.crossover(&x.positive, &y.positive, rng);
                let (n1, n2) = f.negative.crossover(&x.negative, &y.negative, rng);
                let (b1, b2) = f.negative_boost.crossover(&x.negative_boost, &y.negative_boost, rng);
                (
                    Query::Boosting(BoostingQuery {
                        positive: Box::new(p1),
                        negative: Box::new(n1),
                        negative_boost: b1,
                    }),
                    Query::Boosting(BoostingQuery {
                        positive: Box::new(p2),
                        negative: Box::new(n2),
                        negative_boost: b2,
                    }),
                )
            }
            (QueryFactory::Fixed(_), x, y) => (x.clone(), y.clone()),
            _ => self.mismatch(a, b),
        }
    }
}
