//! Judgment validation and concurrent experiment execution

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::db::ExperimentStore;
use crate::error::Result;
use crate::experiment::Experiment;
use crate::judgments::{JudgmentList, Judgments, QueryInfo};
use crate::query::{Query, QueryStrings, TermQuery};
use crate::scorer::{ScoreAggregator, ScorerConfig, SummaryStatistics};
use crate::search_client::{ClientRegistry, QueryRequest, SearchClient};

pub const DEFAULT_NUM_THREADS: usize = 8;
pub const DEFAULT_ROWS: usize = 10;

/// Prunes judged ids that do not resolve to exactly one document.
///
/// Lookups are cached per server URL for the lifetime of the validator, so
/// train and test subsets of the same judgments only query each id once.
#[derive(Debug, Default)]
pub struct JudgmentValidator {
    known: Mutex<HashMap<String, HashMap<String, bool>>>,
}

impl JudgmentValidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(client: &dyn SearchClient, id: &str) -> bool {
        let query = Query::Term(TermQuery {
            field: client.id_field().to_string(),
            term: id.to_string(),
        });
        match client.search(&QueryRequest::new(query, QueryStrings::new(), 2)) {
            Ok(rs) if rs.total_hits == 1 => true,
            Ok(rs) if rs.total_hits == 0 => {
                warn!("Judged document '{}' not found in {}, dropping", id, client.url());
                false
            }
            Ok(rs) => {
                warn!(
                    "Judged document '{}' matches {} documents in {}, dropping",
                    id,
                    rs.total_hits,
                    client.url()
                );
                false
            }
            Err(e) => {
                warn!("Could not look up judged document '{}': {}", id, e);
                false
            }
        }
    }

    pub fn validate(&self, client: &dyn SearchClient, judgments: &JudgmentList) -> JudgmentList {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let verdicts = known.entry(client.url().to_string()).or_default();
        for id in judgments.doc_ids() {
            if !verdicts.contains_key(&id) {
                let ok = Self::lookup(client, &id);
                verdicts.insert(id, ok);
            }
        }

        let mut kept = Vec::with_capacity(judgments.len());
        for j in judgments.iter() {
            let mut pruned = Judgments::new(j.query_info.clone());
            for (doc, grade) in &j.judgments {
                if verdicts.get(doc).copied().unwrap_or(false) {
                    pruned.add(doc, *grade);
                }
            }
            if pruned.judgments.is_empty() {
                warn!(
                    "Query {}/{} has no valid judgments left, dropping it",
                    j.query_info.query_set, j.query_info.query_id
                );
                continue;
            }
            kept.push(pruned);
        }
        JudgmentList::new(kept)
    }
}

/// Scores of one scorer for one experiment.
#[derive(Debug, Clone)]
pub struct ScorerResult {
    pub config: ScorerConfig,
    pub per_query: HashMap<QueryInfo, f64>,
    pub summary: SummaryStatistics,
}

#[derive(Debug, Clone)]
pub struct ExperimentScores {
    pub experiment: String,
    pub results: Vec<ScorerResult>,
    /// Validated queries handed to the workers.
    pub queries: usize,
    /// Queries skipped after a search error.
    pub failed: usize,
    pub worker_panics: usize,
}

impl ExperimentScores {
    pub fn summary(&self, config: &ScorerConfig) -> Option<&SummaryStatistics> {
        self.results
            .iter()
            .find(|r| r.config.name() == config.name())
            .map(|r| &r.summary)
    }

    /// Primary statistic for `config`, NaN when the scorer did not run.
    pub fn primary(&self, config: &ScorerConfig) -> f64 {
        self.summary(config).map_or(f64::NAN, SummaryStatistics::primary)
    }

    pub fn store(&self, store: &dyn ExperimentStore) -> Result<()> {
        for r in &self.results {
            let scorer = r.config.name();
            store.insert_query_scores(&self.experiment, &scorer, &r.per_query)?;
            store.insert_aggregate_scores(&self.experiment, &scorer, &r.summary)?;
        }
        Ok(())
    }
}

/// Runs experiments against their servers.
///
/// Holds the client registry and the validation cache shared by every run
/// of one process.
pub struct ExperimentRunner {
    registry: Arc<ClientRegistry>,
    validator: JudgmentValidator,
    num_threads: usize,
    rows: usize,
}

impl ExperimentRunner {
    pub fn new(registry: Arc<ClientRegistry>, num_threads: usize, rows: usize) -> Self {
        Self {
            registry,
            validator: JudgmentValidator::new(),
            num_threads: num_threads.max(1),
            rows: rows.max(1),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Validate `judgments` against the experiment's server, then score
    /// every remaining query with `num_threads` workers.
    ///
    /// Search errors skip the query. A panicking worker is logged and
    /// counted; the others keep draining the queue.
    pub fn run(
        &self,
        experiment: &Experiment,
        judgments: &JudgmentList,
        scorers: &[ScorerConfig],
    ) -> Result<ExperimentScores> {
        let start = Instant::now();
        let client = self.registry.get(&experiment.search_server_url)?;
        let validated = self.validator.validate(client.as_ref(), judgments);
        let aggregators: Vec<ScoreAggregator> =
            scorers.iter().cloned().map(ScoreAggregator::new).collect();

        let threads = self.num_threads.min(validated.len()).max(1);
        let (tx, rx) = mpsc::sync_channel::<&Judgments>(validated.len() + threads);
        for j in validated.iter() {
            if tx.send(j).is_err() {
                break;
            }
        }
        drop(tx);
        let rx = Mutex::new(rx);
        let failed = AtomicUsize::new(0);
        let mut worker_panics = 0;

        thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|worker| {
                    let rx = &rx;
                    let failed = &failed;
                    let aggregators = &aggregators;
                    let client = client.as_ref();
                    s.spawn(move || {
                        let mut done = 0usize;
                        loop {
                            let next = rx.lock().unwrap_or_else(|e| e.into_inner()).recv();
                            let Ok(j) = next else { break };
                            let request = experiment.request(j, self.rows);
                            match client.search(&request) {
                                Ok(rs) => {
                                    for agg in aggregators {
                                        agg.add(j, &rs);
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        "{}: query {}/{} failed: {}",
                                        experiment.name, j.query_info.query_set, j.query_info.query_id, e
                                    );
                                    failed.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            done += 1;
                        }
                        debug!("worker {} scored {} queries", worker, done);
                        done
                    })
                })
                .collect();

            let mut remaining = handles.len();
            for handle in handles {
                if handle.join().is_err() {
                    error!("{}: worker panicked", experiment.name);
                    worker_panics += 1;
                }
                remaining -= 1;
                debug!("{} worker(s) still running", remaining);
            }
        });

        let results = aggregators
            .iter()
            .map(|agg| ScorerResult {
                config: agg.config().clone(),
                per_query: agg.scores(),
                summary: agg.summary(),
            })
            .collect();
        let scores = ExperimentScores {
            experiment: experiment.name.clone(),
            results,
            queries: validated.len(),
            failed: failed.load(Ordering::Relaxed),
            worker_panics,
        };
        info!(
            "{}: {} queries ({} failed) in {:.2}s",
            experiment.name,
            scores.queries,
            scores.failed,
            start.elapsed().as_secs_f64()
        );
        Ok(scores)
    }

    /// Run and persist per-query and aggregate scores.
    pub fn run_and_store(
        &self,
        store: &dyn ExperimentStore,
        experiment: &Experiment,
        judgments: &JudgmentList,
        scorers: &[ScorerConfig],
    ) -> Result<ExperimentScores> {
        store.add_experiment(experiment)?;
        let scores = self.run(experiment, judgments, scorers)?;
        scores.store(store)?;
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchClientError;
    use crate::feature::{WeightedField, WeightedFields};
    use crate::query::DisMaxQuery;
    use crate::scorer::ScorerKind;
    use crate::search_client::{FacetRequest, FacetResult, ResultSet};
    use std::collections::HashSet;

    /// Answers id lookups from fixed sets and returns one fixed ranking.
    struct StubClient {
        url: String,
        present: HashSet<String>,
        duplicated: HashSet<String>,
        ranking: Vec<String>,
        fail_text: Option<String>,
        lookups: AtomicUsize,
    }

    impl StubClient {
        fn new(url: &str, present: &[&str], ranking: &[&str]) -> Self {
            Self {
                url: url.to_string(),
                present: present.iter().map(|s| s.to_string()).collect(),
                duplicated: HashSet::new(),
                ranking: ranking.iter().map(|s| s.to_string()).collect(),
                fail_text: None,
                lookups: AtomicUsize::new(0),
            }
        }
    }

    impl SearchClient for StubClient {
        fn url(&self) -> &str {
            &self.url
        }

        fn id_field(&self) -> &str {
            "id"
        }

        fn search(&self, request: &QueryRequest) -> std::result::Result<ResultSet, SearchClientError> {
            if let Query::Term(t) = &request.query {
                self.lookups.fetch_add(1, Ordering::Relaxed);
                let hits = if self.duplicated.contains(&t.term) {
                    2
                } else if self.present.contains(&t.term) {
                    1
                } else {
                    0
                };
                return Ok(ResultSet {
                    total_hits: hits,
                    ids: Vec::new(),
                    elapsed_ms: 0.0,
                });
            }
            let text = request.query_strings.values().next().cloned().unwrap_or_default();
            if self.fail_text.as_deref() == Some(text.as_str()) {
                return Err(SearchClientError::Request("backend returned 500".to_string()));
            }
            Ok(ResultSet {
                total_hits: self.ranking.len() as u64,
                ids: self.ranking.iter().take(request.rows).cloned().collect(),
                elapsed_ms: 1.0,
            })
        }

        fn facet(&self, _request: &FacetRequest) -> std::result::Result<FacetResult, SearchClientError> {
            Ok(FacetResult::default())
        }
    }

    fn judgment(id: &str, text: &str, grades: &[(&str, f64)]) -> Judgments {
        let mut j = Judgments::new(QueryInfo::new("test", id, text));
        for (doc, g) in grades {
            j.add(doc, *g);
        }
        j
    }

    fn experiment(url: &str) -> Experiment {
        Experiment {
            name: "exp".to_string(),
            search_server_url: url.to_string(),
            custom_handler: None,
            filter_queries: Vec::new(),
            query: Query::DisMax(DisMaxQuery {
                qf: WeightedFields::new(vec![WeightedField::new("title", 1.0)]),
                ..DisMaxQuery::default()
            }),
        }
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_missing_ids_pruned_and_empty_queries_dropped() {
        let client = StubClient::new("stub://a", &["a", "b"], &[]);
        let list = JudgmentList::new(vec![
            judgment("q1", "one", &[("a", 1.0), ("X", 2.0)]),
            judgment("q2", "two", &[("X", 3.0)]),
        ]);
        let validated = JudgmentValidator::new().validate(&client, &list);
        assert_eq!(validated.len(), 1);
        assert_eq!(validated.judgments[0].query_info.query_id, "q1");
        assert!(validated.judgments[0].grade("X").is_none());
        assert_eq!(validated.judgments[0].grade("a"), Some(1.0));
    }

    #[test]
    fn test_ambiguous_ids_pruned() {
        let mut client = StubClient::new("stub://a", &["a", "b"], &[]);
        client.duplicated.insert("b".to_string());
        let list = JudgmentList::new(vec![judgment("q1", "one", &[("a", 1.0), ("b", 2.0)])]);
        let validated = JudgmentValidator::new().validate(&client, &list);
        assert!(validated.judgments[0].grade("b").is_none());
    }

    #[test]
    fn test_lookups_cached_per_url() {
        let client = StubClient::new("stub://a", &["a", "b"], &[]);
        let validator = JudgmentValidator::new();
        let full = JudgmentList::new(vec![
            judgment("q1", "one", &[("a", 1.0)]),
            judgment("q2", "two", &[("b", 1.0)]),
        ]);
        validator.validate(&client, &full);
        let subset = JudgmentList::new(vec![judgment("q2", "two", &[("b", 1.0)])]);
        let again = validator.validate(&client, &subset);
        assert_eq!(client.lookups.load(Ordering::Relaxed), 2);
        assert_eq!(again.len(), 1);
        assert_eq!(again.judgments[0].query_info.query_id, "q2");
    }

    // =========================================================================
    // Execution Tests
    // =========================================================================

    #[test]
    fn test_run_scores_every_query_concurrently() {
        let registry = Arc::new(ClientRegistry::new("id"));
        registry.register(Arc::new(StubClient::new("stub://a", &["a", "b", "c"], &["a", "b", "c"])));
        let runner = ExperimentRunner::new(registry, 4, 10);

        let list = JudgmentList::new(
            (0..50)
                .map(|i| judgment(&format!("q{}", i), &format!("text {}", i), &[("a", 1.0), ("c", 2.0)]))
                .collect(),
        );
        let scorers = vec![
            ScorerConfig::new(ScorerKind::Ndcg, 10),
            ScorerConfig::new(ScorerKind::Precision, 1),
        ];
        let scores = runner.run(&experiment("stub://a"), &list, &scorers).unwrap();
        assert_eq!(scores.queries, 50);
        assert_eq!(scores.failed, 0);
        assert_eq!(scores.results[0].per_query.len(), 50);
        assert_eq!(scores.primary(&scorers[1]), 1.0);
    }

    #[test]
    fn test_search_errors_skip_query() {
        let registry = Arc::new(ClientRegistry::new("id"));
        let mut client = StubClient::new("stub://a", &["a"], &["a"]);
        client.fail_text = Some("bad".to_string());
        registry.register(Arc::new(client));
        let runner = ExperimentRunner::new(registry, 2, 10);

        let list = JudgmentList::new(vec![
            judgment("q1", "good", &[("a", 1.0)]),
            judgment("q2", "bad", &[("a", 1.0)]),
        ]);
        let scorers = vec![ScorerConfig::new(ScorerKind::AtLeastOne, 10)];
        let scores = runner.run(&experiment("stub://a"), &list, &scorers).unwrap();
        assert_eq!(scores.failed, 1);
        assert_eq!(scores.results[0].per_query.len(), 1);
    }

    #[test]
    fn test_unknown_server_is_an_error() {
        let runner = ExperimentRunner::new(Arc::new(ClientRegistry::new("id")), 2, 10);
        let scorers = vec![ScorerConfig::new(ScorerKind::Ndcg, 10)];
        assert!(runner
            .run(&experiment("https://nowhere"), &JudgmentList::default(), &scorers)
            .is_err());
    }
}
