//! Experiments
//!
//! An experiment is one point in the search space: a fully materialized
//! query bound to the server it runs against.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::factory::FeatureFactory;
use crate::judgments::Judgments;
use crate::query::{Query, QueryFactory};
use crate::search_client::QueryRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub search_server_url: String,
    #[serde(default)]
    pub custom_handler: Option<String>,
    #[serde(default)]
    pub filter_queries: Vec<String>,
    pub query: Query,
}

impl Experiment {
    /// Copy under a new name.
    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn request(&self, judgments: &Judgments, rows: usize) -> QueryRequest {
        QueryRequest {
            query: self.query.clone(),
            query_strings: judgments.query_info.query_strings.clone(),
            filter_queries: self.filter_queries.clone(),
            custom_handler: self.custom_handler.clone(),
            rows,
        }
    }
}

/// Builds experiments for one server from a query factory.
#[derive(Debug, Clone)]
pub struct ExperimentFactory {
    search_server_url: String,
    custom_handler: Option<String>,
    filter_queries: Vec<String>,
    query: QueryFactory,
}

impl ExperimentFactory {
    pub fn new(
        search_server_url: &str,
        custom_handler: Option<String>,
        filter_queries: Vec<String>,
        query: QueryFactory,
    ) -> Result<Self, ConfigError> {
        if search_server_url.trim().is_empty() {
            return Err(ConfigError::Parse("search_server_url is empty".to_string()));
        }
        Ok(Self {
            search_server_url: search_server_url.to_string(),
            custom_handler,
            filter_queries,
            query,
        })
    }

    pub fn search_server_url(&self) -> &str {
        &self.search_server_url
    }

    fn wrap(&self, name: &str, query: Query) -> Experiment {
        Experiment {
            name: name.to_string(),
            search_server_url: self.search_server_url.clone(),
            custom_handler: self.custom_handler.clone(),
            filter_queries: self.filter_queries.clone(),
            query,
        }
    }

    pub fn random<R: Rng>(&self, name: &str, rng: &mut R) -> Experiment {
        self.wrap(name, self.query.random(rng))
    }

    /// Up to `max_size` experiments named `<prefix><n>`.
    pub fn permute(&self, prefix: &str, max_size: usize) -> Vec<Experiment> {
        self.query
            .permute(max_size)
            .into_iter()
            .enumerate()
            .map(|(i, q)| self.wrap(&format!("{}{}", prefix, i), q))
            .collect()
    }

    pub fn mutate<R: Rng>(
        &self,
        parent: &Experiment,
        name: &str,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> Experiment {
        let query = self.query.mutate(&parent.query, probability, amplitude, rng);
        Experiment {
            name: name.to_string(),
            query,
            ..parent.clone()
        }
    }

    pub fn crossover<R: Rng>(
        &self,
        a: &Experiment,
        b: &Experiment,
        names: (&str, &str),
        rng: &mut R,
    ) -> (Experiment, Experiment) {
        let (qa, qb) = self.query.crossover(&a.query, &b.query, rng);
        (
            Experiment {
                name: names.0.to_string(),
                query: qa,
                ..a.clone()
            },
            Experiment {
                name: names.1.to_string(),
                query: qb,
                ..b.clone()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::WeightedFieldsFactory;
    use crate::judgments::QueryInfo;
    use crate::query::DisMaxQueryFactory;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn seeded_rng() -> StdRng {
        StdRng::seed_from_u64(12345)
    }

    fn factory() -> ExperimentFactory {
        let fields: Vec<String> = ["title", "body^0.5"].iter().map(|s| s.to_string()).collect();
        let qf = WeightedFieldsFactory::new("qf", &fields, &[0.0, 1.0, 3.0], 1, 2).unwrap();
        ExperimentFactory::new(
            "memory://docs.jsonl",
            Some("/select".to_string()),
            vec!["in_stock:true".to_string()],
            QueryFactory::DisMax(DisMaxQueryFactory::new(false, qf)),
        )
        .unwrap()
    }

    #[test]
    fn test_random_binds_server_and_filters() {
        let mut rng = seeded_rng();
        let e = factory().random("exp_0", &mut rng);
        assert_eq!(e.name, "exp_0");
        assert_eq!(e.search_server_url, "memory://docs.jsonl");
        assert_eq!(e.filter_queries, vec!["in_stock:true"]);

        let request = e.request(&Judgments::new(QueryInfo::new("s", "q", "red")), 10);
        assert_eq!(request.rows, 10);
        assert_eq!(request.custom_handler.as_deref(), Some("/select"));
    }

    #[test]
    fn test_permute_names_sequentially() {
        let all = factory().permute("perm_", 100);
        // body pinned; title omitted, 1.0 or 3.0
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].name, "perm_2");
    }

    #[test]
    fn test_mutate_leaves_parent_untouched() {
        let mut rng = seeded_rng();
        let f = factory();
        let parent = f.random("p", &mut rng);
        let snapshot = parent.clone();
        let child = f.mutate(&parent, "c", 1.0, 1.0, &mut rng);
        assert_eq!(parent, snapshot);
        assert_eq!(child.name, "c");

        let copy = f.mutate(&parent, "same", 0.0, 1.0, &mut rng);
        assert_eq!(copy.query, parent.query);
    }

    #[test]
    fn test_crossover_names_children() {
        let mut rng = seeded_rng();
        let f = factory();
        let a = f.random("a", &mut rng);
        let b = f.random("b", &mut rng);
        let (x, y) = f.crossover(&a, &b, ("x", "y"), &mut rng);
        assert_eq!((x.name.as_str(), y.name.as_str()), ("x", "y"));
        assert_eq!(x.search_server_url, a.search_server_url);
    }
}
