//! Scorers and score aggregation
//!
//! A scorer turns one judged query and its ranked result into a number. A
//! `ScoreAggregator` collects those numbers per query while workers race
//! through the judgments, then summarizes them.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::ConfigError;
use crate::judgments::{Judgments, QueryInfo};
use crate::search_client::ResultSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    Ndcg,
    Precision,
    Recall,
    AtLeastOne,
    ReciprocalRank,
    TotalHits,
    Elapsed,
}

impl ScorerKind {
    fn label(&self) -> &'static str {
        match self {
            ScorerKind::Ndcg => "ndcg",
            ScorerKind::Precision => "precision",
            ScorerKind::Recall => "recall",
            ScorerKind::AtLeastOne => "at_least_one",
            ScorerKind::ReciprocalRank => "reciprocal_rank",
            ScorerKind::TotalHits => "total_hits",
            ScorerKind::Elapsed => "elapsed",
        }
    }

    fn uses_cutoff(&self) -> bool {
        !matches!(self, ScorerKind::TotalHits | ScorerKind::Elapsed)
    }
}

fn default_at_n() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub kind: ScorerKind,
    #[serde(default = "default_at_n")]
    pub at_n: usize,
    #[serde(default)]
    pub use_for_train: bool,
    #[serde(default)]
    pub use_for_test: bool,
}

impl ScorerConfig {
    pub fn new(kind: ScorerKind, at_n: usize) -> Self {
        Self {
            kind,
            at_n,
            use_for_train: false,
            use_for_test: false,
        }
    }

    /// e.g. `ndcg@10`, `total_hits`
    pub fn name(&self) -> String {
        if self.kind.uses_cutoff() {
            format!("{}@{}", self.kind.label(), self.at_n)
        } else {
            self.kind.label().to_string()
        }
    }

    pub fn score(&self, judgments: &Judgments, results: &ResultSet) -> f64 {
        let n = self.at_n;
        match self.kind {
            ScorerKind::Ndcg => ndcg(judgments, &results.ids, n),
            ScorerKind::Precision => {
                if n == 0 {
                    return 0.0;
                }
                relevant_in_top(judgments, &results.ids, n) as f64 / n as f64
            }
            ScorerKind::Recall => {
                let relevant = judgments.relevant_count();
                if relevant == 0 {
                    return 0.0;
                }
                relevant_in_top(judgments, &results.ids, n) as f64 / relevant as f64
            }
            ScorerKind::AtLeastOne => {
                if relevant_in_top(judgments, &results.ids, n) > 0 {
                    1.0
                } else {
                    0.0
                }
            }
            ScorerKind::ReciprocalRank => distinct_top(&results.ids, n)
                .iter()
                .position(|id| judgments.grade(id).is_some_and(|g| g > 0.0))
                .map_or(0.0, |rank| 1.0 / (rank as f64 + 1.0)),
            ScorerKind::TotalHits => results.total_hits as f64,
            ScorerKind::Elapsed => results.elapsed_ms,
        }
    }
}

/// First `n` ids, duplicates counted once.
fn distinct_top(ids: &[String], n: usize) -> Vec<&str> {
    let mut seen = HashSet::new();
    ids.iter()
        .take(n)
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect()
}

fn relevant_in_top(judgments: &Judgments, ids: &[String], n: usize) -> usize {
    distinct_top(ids, n)
        .into_iter()
        .filter(|id| judgments.grade(id).is_some_and(|g| g > 0.0))
        .count()
}

/// Graded NDCG with gain `2^rel - 1` and a log2 rank discount. Unjudged
/// documents have no gain.
pub fn ndcg(judgments: &Judgments, ids: &[String], n: usize) -> f64 {
    let gain = |g: f64| 2f64.powf(g.max(0.0)) - 1.0;
    let discount = |rank: usize| (rank as f64 + 2.0).log2();

    let dcg: f64 = distinct_top(ids, n)
        .iter()
        .enumerate()
        .map(|(i, id)| gain(judgments.grade(id).unwrap_or(0.0)) / discount(i))
        .sum();
    let idcg: f64 = judgments
        .ideal_grades()
        .into_iter()
        .take(n)
        .enumerate()
        .map(|(i, g)| gain(g) / discount(i))
        .sum();
    if idcg == 0.0 {
        0.0
    } else {
        dcg / idcg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryStatistics {
    /// Population statistics. Non-finite values are ignored.
    pub fn from_values(values: &[f64]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let median = if count % 2 == 1 {
            sorted[count / 2]
        } else {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        };
        Self {
            count,
            mean,
            median,
            stddev: variance.sqrt(),
            min: sorted[0],
            max: sorted[count - 1],
        }
    }

    /// Statistic used to rank experiments.
    pub fn primary(&self) -> f64 {
        self.mean
    }
}

/// Per-query scores of one scorer, safe to feed from many workers.
#[derive(Debug)]
pub struct ScoreAggregator {
    config: ScorerConfig,
    scores: Mutex<HashMap<QueryInfo, f64>>,
}

impl ScoreAggregator {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> String {
        self.config.name()
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score one query and keep the score under its identity.
    pub fn add(&self, judgments: &Judgments, results: &ResultSet) -> f64 {
        let score = self.config.score(judgments, results);
        if let Ok(mut scores) = self.scores.lock() {
            scores.insert(judgments.query_info.clone(), score);
        }
        score
    }

    pub fn scores(&self) -> HashMap<QueryInfo, f64> {
        self.scores.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn summary(&self) -> SummaryStatistics {
        let values: Vec<f64> = self
            .scores
            .lock()
            .map(|s| s.values().copied().collect())
            .unwrap_or_default();
        SummaryStatistics::from_values(&values)
    }
}

/// At least one scorer, at most one flagged for train and one for test.
pub fn check_scorers(configs: &[ScorerConfig]) -> Result<(), ConfigError> {
    if configs.is_empty() {
        return Err(ConfigError::NoScorers);
    }
    if configs.iter().filter(|c| c.use_for_train).count() > 1 {
        return Err(ConfigError::DuplicateAggregator("use_for_train"));
    }
    if configs.iter().filter(|c| c.use_for_test).count() > 1 {
        return Err(ConfigError::DuplicateAggregator("use_for_test"));
    }
    Ok(())
}

/// Scorer ranking training runs: the flagged one, else the first.
pub fn train_scorer(configs: &[ScorerConfig]) -> Option<&ScorerConfig> {
    configs.iter().find(|c| c.use_for_train).or_else(|| configs.first())
}

/// Scorer reported on held-out folds: the flagged one, else the train scorer.
pub fn test_scorer(configs: &[ScorerConfig]) -> Option<&ScorerConfig> {
    configs.iter().find(|c| c.use_for_test).or_else(|| train_scorer(configs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn judged() -> Judgments {
        let mut j = Judgments::new(QueryInfo::new("s", "q1", "red shoes"));
        j.add("a", 3.0);
        j.add("b", 2.0);
        j.add("c", 0.0);
        j
    }

    fn results(ids: &[&str]) -> ResultSet {
        ResultSet {
            total_hits: 42,
            ids: ids.iter().map(|s| s.to_string()).collect(),
            elapsed_ms: 3.5,
        }
    }

    // =========================================================================
    // Scorer Tests
    // =========================================================================

    #[test]
    fn test_ndcg_perfect_and_reversed() {
        let j = judged();
        assert!((ndcg(&j, &results(&["a", "b", "c"]).ids, 10) - 1.0).abs() < 1e-12);
        let reversed = ndcg(&j, &results(&["c", "b", "a"]).ids, 10);
        assert!(reversed > 0.0 && reversed < 1.0);
        assert_eq!(ndcg(&j, &results(&["x", "y"]).ids, 10), 0.0);
    }

    #[test]
    fn test_ndcg_counts_duplicates_once() {
        let j = judged();
        let dup = ndcg(&j, &results(&["a", "a", "b"]).ids, 10);
        assert!((dup - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cutoff_scorers() {
        let j = judged();
        let r = results(&["x", "b", "a", "c"]);
        assert_eq!(ScorerConfig::new(ScorerKind::Precision, 2).score(&j, &r), 0.5);
        assert_eq!(ScorerConfig::new(ScorerKind::Recall, 2).score(&j, &r), 0.5);
        assert_eq!(ScorerConfig::new(ScorerKind::AtLeastOne, 1).score(&j, &r), 0.0);
        assert_eq!(ScorerConfig::new(ScorerKind::ReciprocalRank, 10).score(&j, &r), 0.5);
        assert_eq!(ScorerConfig::new(ScorerKind::TotalHits, 10).score(&j, &r), 42.0);
        assert_eq!(ScorerConfig::new(ScorerKind::Elapsed, 10).name(), "elapsed");
        assert_eq!(ScorerConfig::new(ScorerKind::Ndcg, 10).name(), "ndcg@10");
    }

    // =========================================================================
    // Aggregation Tests
    // =========================================================================

    #[test]
    fn test_summary_statistics() {
        let s = SummaryStatistics::from_values(&[1.0, 2.0, 3.0, 4.0, f64::NAN]);
        assert_eq!(s.count, 4);
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.median, 2.5);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        assert!((s.stddev - 1.25f64.sqrt()).abs() < 1e-12);
        assert_eq!(SummaryStatistics::from_values(&[]).count, 0);
    }

    #[test]
    fn test_aggregator_keys_by_query() {
        let agg = ScoreAggregator::new(ScorerConfig::new(ScorerKind::Precision, 1));
        let j = judged();
        agg.add(&j, &results(&["x"]));
        agg.add(&j, &results(&["a"]));
        let scores = agg.scores();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[&j.query_info], 1.0);
    }

    #[test]
    fn test_check_scorers_rejects_duplicate_flags() {
        let mut a = ScorerConfig::new(ScorerKind::Ndcg, 10);
        let mut b = ScorerConfig::new(ScorerKind::Precision, 10);
        a.use_for_train = true;
        b.use_for_train = true;
        assert!(matches!(
            check_scorers(&[a.clone(), b.clone()]),
            Err(ConfigError::DuplicateAggregator("use_for_train"))
        ));
        b.use_for_train = false;
        b.use_for_test = true;
        assert!(check_scorers(&[a.clone(), b.clone()]).is_ok());
        assert_eq!(train_scorer(&[a.clone(), b.clone()]).map(|c| c.kind), Some(ScorerKind::Ndcg));
        assert_eq!(test_scorer(&[a, b]).map(|c| c.kind), Some(ScorerKind::Precision));
        assert!(matches!(check_scorers(&[]), Err(ConfigError::NoScorers)));
    }
}
