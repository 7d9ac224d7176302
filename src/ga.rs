//! Genetic search over experiments with n-fold train/test evaluation
//!
//! Each fold evolves its own population against the training queries,
//! then replays the best training experiment on the held-out queries.
//! Selection is fitness-proportional with a floor so that the worst
//! experiment of a generation can still be picked.

use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::db::ExperimentStore;
use crate::error::{ConfigError, Result, TunerError};
use crate::experiment::{Experiment, ExperimentFactory};
use crate::judgments::JudgmentList;
use crate::runner::ExperimentRunner;
use crate::scorer::{check_scorers, test_scorer, train_scorer, ScorerConfig, SummaryStatistics};

/// Allowed slack on the operator probability sum
pub const PROBABILITY_TOLERANCE: f64 = 0.001;

/// Share of the selection weight every experiment gets regardless of score
pub const FITNESS_FLOOR: f64 = 0.1;

/// Attempts at drawing a second parent different from the first
const MAX_CROSSOVER_RETRIES: usize = 5;

/// Configuration for the genetic search
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaConfig {
    pub population: usize,
    pub generations: usize,
    pub n_folds: usize,
    pub crossover_probability: f64,
    pub mutation_probability: f64,
    pub reproduction_probability: f64,
    /// Step size handed to the feature factories on mutation
    pub mutation_amplitude: f64,
    /// Chance that any single feature changes when an experiment mutates
    pub feature_mutation_probability: f64,
    pub num_threads: usize,
    pub seed: u64,
}

impl Default for GaConfig {
    fn default() -> Self {
        Self {
            population: 20,
            generations: 10,
            n_folds: 4,
            crossover_probability: 0.4,
            mutation_probability: 0.4,
            reproduction_probability: 0.2,
            mutation_amplitude: 0.2,
            feature_mutation_probability: 0.3,
            num_threads: crate::runner::DEFAULT_NUM_THREADS,
            seed: 42,
        }
    }
}

impl GaConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let sum = self.crossover_probability + self.mutation_probability + self.reproduction_probability;
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(ConfigError::Probabilities(sum));
        }
        for (name, p) in [
            ("crossover_probability", self.crossover_probability),
            ("mutation_probability", self.mutation_probability),
            ("reproduction_probability", self.reproduction_probability),
            ("feature_mutation_probability", self.feature_mutation_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Ga(format!("{} must be within [0, 1], got {}", name, p)));
            }
        }
        if self.population == 0 {
            return Err(ConfigError::Ga("population must be at least 1".to_string()));
        }
        if self.n_folds == 0 {
            return Err(ConfigError::Ga("n_folds must be at least 1".to_string()));
        }
        if self.num_threads == 0 {
            return Err(ConfigError::Ga("num_threads must be at least 1".to_string()));
        }
        if !self.mutation_amplitude.is_finite() || self.mutation_amplitude < 0.0 {
            return Err(ConfigError::Ga(format!(
                "mutation_amplitude must be non-negative, got {}",
                self.mutation_amplitude
            )));
        }
        Ok(())
    }
}

/// Selection weights for `scores`, summing to 1.
///
/// Linear in `(score - min) / (max - min)` plus [`FITNESS_FLOOR`]. Non-finite
/// scores count as the minimum. A flat generation gets uniform weights.
pub fn fitness_proportions(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let finite = scores.iter().copied().filter(|s| s.is_finite());
    let min = finite.clone().fold(f64::INFINITY, f64::min);
    let max = finite.fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return vec![1.0 / scores.len() as f64; scores.len()];
    }

    let raw: Vec<f64> = scores
        .iter()
        .map(|&s| {
            let relative = if s.is_finite() { (s - min) / range } else { 0.0 };
            relative + FITNESS_FLOOR
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Crossover,
    Mutate,
    Reproduce,
}

fn choose_operation<R: Rng>(config: &GaConfig, rng: &mut R) -> Operation {
    let r: f64 = rng.gen();
    if r < config.crossover_probability {
        Operation::Crossover
    } else if r < config.crossover_probability + config.mutation_probability {
        Operation::Mutate
    } else {
        Operation::Reproduce
    }
}

/// An experiment with its primary training score
#[derive(Debug, Clone)]
pub struct ScoredExperiment {
    pub experiment: Experiment,
    pub score: f64,
}

/// Statistics for a generation
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationStats {
    pub generation: usize,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    pub worst_fitness: f64,
    pub best_experiment: String,
}

impl GenerationStats {
    fn compute(generation: usize, population: &[ScoredExperiment]) -> Self {
        let scores: Vec<f64> = population.iter().map(|s| s.score).collect();
        let summary = SummaryStatistics::from_values(&scores);
        Self {
            generation,
            best_fitness: summary.max,
            avg_fitness: summary.mean,
            worst_fitness: summary.min,
            best_experiment: best_of(population)
                .map(|b| b.experiment.name.clone())
                .unwrap_or_default(),
        }
    }
}

/// Outcome of one fold
#[derive(Debug, Clone, Serialize)]
pub struct FoldResult {
    pub fold: usize,
    pub best_train_experiment: String,
    pub train_score: f64,
    pub test_experiment: String,
    /// NaN when the fold has no test queries.
    pub test_score: f64,
    pub history: Vec<GenerationStats>,
}

/// Summary of a whole GA run
#[derive(Debug, Clone, Serialize)]
pub struct GaReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub train_scorer: String,
    pub test_scorer: String,
    pub folds: Vec<FoldResult>,
    /// Statistics over the folds' test scores.
    pub test_summary: SummaryStatistics,
    pub interrupted: bool,
}

/// Best by score; NaN scores lose to everything.
fn best_of(population: &[ScoredExperiment]) -> Option<&ScoredExperiment> {
    population.iter().max_by(|a, b| {
        let a = if a.score.is_nan() { f64::NEG_INFINITY } else { a.score };
        let b = if b.score.is_nan() { f64::NEG_INFINITY } else { b.score };
        a.total_cmp(&b)
    })
}

pub fn train_name(fold: usize, generation: usize, index: usize) -> String {
    format!("train_fold_{}_gen_{}_exp_{}", fold, generation, index)
}

pub fn test_name(fold: usize, train_name: &str) -> String {
    format!("test_fold_{}_{}", fold, train_name)
}

/// Drives the fold and generation loops.
pub struct GeneticOptimizer<'a> {
    config: GaConfig,
    factory: &'a ExperimentFactory,
    scorers: &'a [ScorerConfig],
    runner: &'a ExperimentRunner,
    store: &'a dyn ExperimentStore,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a> GeneticOptimizer<'a> {
    /// Fails on an invalid config before anything is run or stored.
    pub fn new(
        config: GaConfig,
        factory: &'a ExperimentFactory,
        scorers: &'a [ScorerConfig],
        runner: &'a ExperimentRunner,
        store: &'a dyn ExperimentStore,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        check_scorers(scorers)?;
        Ok(Self {
            config,
            factory,
            scorers,
            runner,
            store,
            interrupt: None,
        })
    }

    /// Stop between generations once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }

    /// Run every fold. `seeds`, when given, replace the random initial
    /// population of each fold.
    pub fn run(&self, seeds: Option<&[Experiment]>) -> Result<GaReport> {
        let started_at = Utc::now();
        let (train_cfg, test_cfg) = match (train_scorer(self.scorers), test_scorer(self.scorers)) {
            (Some(train), Some(test)) => (train, test),
            _ => return Err(ConfigError::NoScorers.into()),
        };

        let all = self.store.get_judgments()?;
        if all.is_empty() {
            return Err(TunerError::Data("no judgments loaded".to_string()));
        }
        if self.config.n_folds > 1 {
            self.store.create_folds(self.config.n_folds, self.config.seed)?;
        }

        info!("═══════════════════════════════════════════════════════════════");
        info!(
            "GA: {} fold(s), population {}, {} generation(s), {} queries",
            self.config.n_folds,
            self.config.population,
            self.config.generations,
            all.len()
        );
        info!("Train scorer: {}, test scorer: {}", train_cfg.name(), test_cfg.name());
        info!("═══════════════════════════════════════════════════════════════");

        let mut folds = Vec::with_capacity(self.config.n_folds);
        let mut interrupted = false;
        for fold in 0..self.config.n_folds {
            let (train, test) = if self.config.n_folds == 1 {
                (all.clone(), all.clone())
            } else {
                (
                    self.store.get_train_judgments(fold)?,
                    self.store.get_test_judgments(fold)?,
                )
            };
            let (result, stopped) = self.run_fold(fold, &train, &test, seeds, train_cfg, test_cfg)?;
            folds.push(result);
            if stopped {
                interrupted = true;
                break;
            }
        }

        let test_scores: Vec<f64> = folds.iter().map(|f| f.test_score).collect();
        let report = GaReport {
            started_at,
            finished_at: Utc::now(),
            train_scorer: train_cfg.name(),
            test_scorer: test_cfg.name(),
            folds,
            test_summary: SummaryStatistics::from_values(&test_scores),
            interrupted,
        };
        info!(
            "GA finished: test {} mean {:.4}, median {:.4}, stddev {:.4} over {} fold(s)",
            report.test_scorer,
            report.test_summary.mean,
            report.test_summary.median,
            report.test_summary.stddev,
            report.test_summary.count
        );
        Ok(report)
    }

    fn fold_rng(&self, fold: usize) -> StdRng {
        let seed = self
            .config
            .seed
            .wrapping_add(fold as u64)
            .wrapping_mul(6364136223846793005);
        StdRng::seed_from_u64(seed)
    }

    fn score_all(
        &self,
        experiments: Vec<Experiment>,
        judgments: &JudgmentList,
        train_cfg: &ScorerConfig,
    ) -> Result<Vec<ScoredExperiment>> {
        let mut scored = Vec::with_capacity(experiments.len());
        for experiment in experiments {
            let scores = self
                .runner
                .run_and_store(self.store, &experiment, judgments, self.scorers)?;
            scored.push(ScoredExperiment {
                score: scores.primary(train_cfg),
                experiment,
            });
        }
        Ok(scored)
    }

    fn initial_population(&self, fold: usize, seeds: Option<&[Experiment]>, rng: &mut StdRng) -> Vec<Experiment> {
        match seeds {
            Some(seeds) if !seeds.is_empty() => seeds
                .iter()
                .enumerate()
                .map(|(i, s)| s.renamed(&train_name(fold, 0, i)))
                .collect(),
            _ => (0..self.config.population)
                .map(|i| self.factory.random(&train_name(fold, 0, i), rng))
                .collect(),
        }
    }

    /// Breed `population` children from `parents`.
    fn next_generation(
        &self,
        fold: usize,
        generation: usize,
        parents: &[ScoredExperiment],
        rng: &mut StdRng,
    ) -> Vec<Experiment> {
        let scores: Vec<f64> = parents.iter().map(|p| p.score).collect();
        let weights = fitness_proportions(&scores);
        let Ok(selector) = WeightedIndex::new(&weights) else {
            warn!("Could not build selection weights, falling back to reproduction");
            return parents
                .iter()
                .cycle()
                .take(self.config.population)
                .enumerate()
                .map(|(i, p)| p.experiment.renamed(&train_name(fold, generation, i)))
                .collect();
        };

        let target = self.config.population;
        let mut children: Vec<Experiment> = Vec::with_capacity(target);
        while children.len() < target {
            let index = children.len();
            let name = train_name(fold, generation, index);
            match choose_operation(&self.config, rng) {
                Operation::Crossover => {
                    let a = selector.sample(rng);
                    let mut b = selector.sample(rng);
                    let mut retries = 0;
                    while b == a && retries < MAX_CROSSOVER_RETRIES && parents.len() > 1 {
                        b = selector.sample(rng);
                        retries += 1;
                    }
                    if a == b {
                        warn!(
                            "Crossing {} with itself after {} retries",
                            parents[a].experiment.name, retries
                        );
                    }
                    let second = train_name(fold, generation, index + 1);
                    let (x, y) = self.factory.crossover(
                        &parents[a].experiment,
                        &parents[b].experiment,
                        (&name, &second),
                        rng,
                    );
                    children.push(x);
                    if children.len() < target {
                        children.push(y);
                    }
                }
                Operation::Mutate => {
                    let parent = &parents[selector.sample(rng)].experiment;
                    children.push(self.factory.mutate(
                        parent,
                        &name,
                        self.config.feature_mutation_probability,
                        self.config.mutation_amplitude,
                        rng,
                    ));
                }
                Operation::Reproduce => {
                    let parent = &parents[selector.sample(rng)].experiment;
                    children.push(parent.renamed(&name));
                }
            }
        }
        children
    }

    /// Returns the fold result and whether the run was interrupted.
    fn run_fold(
        &self,
        fold: usize,
        train: &JudgmentList,
        test: &JudgmentList,
        seeds: Option<&[Experiment]>,
        train_cfg: &ScorerConfig,
        test_cfg: &ScorerConfig,
    ) -> Result<(FoldResult, bool)> {
        info!(
            "Fold {}: {} training / {} test queries",
            fold,
            train.len(),
            test.len()
        );
        let mut rng = self.fold_rng(fold);
        let initial = self.initial_population(fold, seeds, &mut rng);
        let mut population = self.score_all(initial, train, train_cfg)?;

        let mut history = vec![GenerationStats::compute(0, &population)];
        log_generation(fold, &history[0]);

        let mut stopped = false;
        for generation in 1..=self.config.generations {
            if self.interrupted() {
                warn!("Interrupted, stopping fold {} before generation {}", fold, generation);
                stopped = true;
                break;
            }
            let children = self.next_generation(fold, generation, &population, &mut rng);
            population = self.score_all(children, train, train_cfg)?;
            let stats = GenerationStats::compute(generation, &population);
            log_generation(fold, &stats);
            history.push(stats);
        }

        let best = best_of(&population)
            .cloned()
            .ok_or_else(|| TunerError::Data(format!("fold {} has an empty population", fold)))?;
        let test_experiment = best.experiment.renamed(&test_name(fold, &best.experiment.name));
        let test_score = if test.is_empty() {
            warn!("Fold {} has no test queries", fold);
            f64::NAN
        } else {
            self.runner
                .run_and_store(self.store, &test_experiment, test, self.scorers)?
                .primary(test_cfg)
        };
        info!(
            "Fold {}: best {} train {:.4}, test {:.4}",
            fold, best.experiment.name, best.score, test_score
        );

        Ok((
            FoldResult {
                fold,
                best_train_experiment: best.experiment.name,
                train_score: best.score,
                test_experiment: test_experiment.name,
                test_score,
                history,
            },
            stopped,
        ))
    }
}

fn log_generation(fold: usize, stats: &GenerationStats) {
    info!(
        "Fold {} gen {:4} | best: {:.4} | avg: {:.4} | worst: {:.4} | {}",
        fold,
        stats.generation,
        stats.best_fitness,
        stats.avg_fitness,
        stats.worst_fitness,
        stats.best_experiment
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::factory::WeightedFieldsFactory;
    use crate::judgments::{Judgments, QueryInfo};
    use crate::memory_index::MemoryIndex;
    use crate::query::{DisMaxQueryFactory, QueryFactory};
    use crate::scorer::ScorerKind;
    use crate::search_client::ClientRegistry;
    use serde_json::json;
    use tempfile::tempdir;

    const URL: &str = "memory://ga";

    fn config(population: usize, generations: usize, n_folds: usize) -> GaConfig {
        GaConfig {
            population,
            generations,
            n_folds,
            num_threads: 2,
            seed: 12345,
            ..GaConfig::default()
        }
    }

    fn runner() -> ExperimentRunner {
        let registry = Arc::new(ClientRegistry::new("id"));
        registry.register(Arc::new(MemoryIndex::from_documents(
            URL,
            "id",
            vec![
                json!({"id": "1", "title": "red shoes", "body": "blue hat"}),
                json!({"id": "2", "title": "blue hat", "body": "red shoes"}),
                json!({"id": "3", "title": "green socks", "body": "wool socks"}),
                json!({"id": "4", "title": "wool hat", "body": "green scarf"}),
            ],
        )));
        ExperimentRunner::new(registry, 2, 10)
    }

    fn factory() -> ExperimentFactory {
        let fields: Vec<String> = ["title", "body"].iter().map(|s| s.to_string()).collect();
        let qf = WeightedFieldsFactory::new("qf", &fields, &[0.0, 1.0, 5.0], 1, 2).unwrap();
        ExperimentFactory::new(
            URL,
            None,
            Vec::new(),
            QueryFactory::DisMax(DisMaxQueryFactory::new(false, qf)),
        )
        .unwrap()
    }

    fn store_with_judgments() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ga.db").to_str().unwrap()).unwrap();
        let rows = [
            ("q1", "red shoes", "1"),
            ("q2", "blue hat", "2"),
            ("q3", "green socks", "3"),
            ("q4", "wool hat", "4"),
            ("q5", "shoes", "1"),
            ("q6", "socks", "3"),
        ];
        let list = JudgmentList::new(
            rows.iter()
                .map(|(id, text, doc)| {
                    let mut j = Judgments::new(QueryInfo::new("ga", id, text));
                    j.add(doc, 3.0);
                    j
                })
                .collect(),
        );
        store.add_judgments(&list).unwrap();
        (dir, store)
    }

    fn scorers() -> Vec<ScorerConfig> {
        vec![ScorerConfig::new(ScorerKind::Ndcg, 10)]
    }

    // =========================================================================
    // Config Tests
    // =========================================================================

    #[test]
    fn test_probabilities_must_sum_to_one() {
        assert!(GaConfig::default().validate().is_ok());

        let thirds = GaConfig {
            crossover_probability: 0.3333,
            mutation_probability: 0.3333,
            reproduction_probability: 0.3333,
            ..GaConfig::default()
        };
        assert!(thirds.validate().is_ok());

        let short = GaConfig {
            crossover_probability: 0.3,
            mutation_probability: 0.3,
            reproduction_probability: 0.3,
            ..GaConfig::default()
        };
        assert!(matches!(short.validate(), Err(ConfigError::Probabilities(_))));
    }

    #[test]
    fn test_zero_population_and_folds_rejected() {
        assert!(config(0, 1, 1).validate().is_err());
        assert!(config(2, 1, 0).validate().is_err());
    }

    #[test]
    fn test_invalid_config_rejected_before_any_run() {
        let (_dir, store) = store_with_judgments();
        let runner = runner();
        let factory = factory();
        let scorers = scorers();
        let mut bad = config(4, 1, 1);
        bad.mutation_probability = 0.9;
        assert!(GeneticOptimizer::new(bad, &factory, &scorers, &runner, &store).is_err());

        let mut dup = scorers.clone();
        dup[0].use_for_train = true;
        let mut second = ScorerConfig::new(ScorerKind::Precision, 5);
        second.use_for_train = true;
        dup.push(second);
        assert!(matches!(
            GeneticOptimizer::new(config(4, 1, 1), &factory, &dup, &runner, &store),
            Err(ConfigError::DuplicateAggregator(_))
        ));
        assert!(store.get_experiments().unwrap().is_empty());
    }

    // =========================================================================
    // Selection Tests
    // =========================================================================

    #[test]
    fn test_fitness_proportions_favor_better_scores() {
        let w = fitness_proportions(&[0.2, 0.5, 0.8]);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(w[0] > 0.0);
        assert!(w[0] < w[1] && w[1] < w[2]);
    }

    #[test]
    fn test_fitness_proportions_handle_flat_and_negative_scores() {
        assert_eq!(fitness_proportions(&[0.4, 0.4]), vec![0.5, 0.5]);
        assert_eq!(fitness_proportions(&[f64::NAN, f64::NAN]), vec![0.5, 0.5]);
        assert!(fitness_proportions(&[]).is_empty());

        let w = fitness_proportions(&[-2.0, -1.0, f64::NAN]);
        assert!(w.iter().all(|&x| x > 0.0));
        assert_eq!(w[0], w[2]);
    }

    #[test]
    fn test_operation_choice_follows_probabilities() {
        let mut rng = StdRng::seed_from_u64(12345);
        let cfg = GaConfig {
            crossover_probability: 0.0,
            mutation_probability: 0.0,
            reproduction_probability: 1.0,
            ..GaConfig::default()
        };
        assert!((0..100).all(|_| choose_operation(&cfg, &mut rng) == Operation::Reproduce));
    }

    // =========================================================================
    // Orchestration Tests
    // =========================================================================

    #[test]
    fn test_single_fold_run_names_and_persists_experiments() {
        let (_dir, store) = store_with_judgments();
        let runner = runner();
        let factory = factory();
        let scorers = scorers();
        let ga = GeneticOptimizer::new(config(4, 2, 1), &factory, &scorers, &runner, &store).unwrap();
        let report = ga.run(None).unwrap();

        assert_eq!(report.folds.len(), 1);
        assert!(!report.interrupted);
        let fold = &report.folds[0];
        assert_eq!(fold.history.len(), 3);
        assert!(fold.best_train_experiment.starts_with("train_fold_0_gen_2_exp_"));
        assert_eq!(fold.test_experiment, test_name(0, &fold.best_train_experiment));

        for i in 0..4 {
            assert!(store.get_experiment(&train_name(0, 2, i)).unwrap().is_some());
        }
        assert!(store.get_experiment(&fold.test_experiment).unwrap().is_some());
        let stored = store.get_aggregate_scores(&fold.test_experiment).unwrap();
        assert_eq!(stored[0].0, "ndcg@10");
    }

    #[test]
    fn test_each_fold_tests_on_held_out_queries() {
        let (_dir, store) = store_with_judgments();
        let runner = runner();
        let factory = factory();
        let scorers = scorers();
        let ga = GeneticOptimizer::new(config(3, 1, 3), &factory, &scorers, &runner, &store).unwrap();
        let report = ga.run(None).unwrap();

        assert_eq!(report.folds.len(), 3);
        assert_eq!(report.test_summary.count, 3);
        for fold in &report.folds {
            let stats = store.get_aggregate_scores(&fold.test_experiment).unwrap();
            assert_eq!(stats[0].1.count, 2);
        }
    }

    #[test]
    fn test_seeds_replace_random_population() {
        let (_dir, store) = store_with_judgments();
        let runner = runner();
        let factory = factory();
        let scorers = scorers();
        let mut rng = StdRng::seed_from_u64(12345);
        let seeds = vec![factory.random("seed_a", &mut rng), factory.random("seed_b", &mut rng)];
        let ga = GeneticOptimizer::new(config(2, 0, 1), &factory, &scorers, &runner, &store).unwrap();
        let report = ga.run(Some(seeds.as_slice())).unwrap();

        let first = store.get_experiment(&train_name(0, 0, 0)).unwrap().unwrap();
        assert_eq!(first.query, seeds[0].query);
        assert_eq!(report.folds[0].history.len(), 1);
    }

    #[test]
    fn test_interrupt_stops_between_generations() {
        let (_dir, store) = store_with_judgments();
        let runner = runner();
        let factory = factory();
        let scorers = scorers();
        let flag = Arc::new(AtomicBool::new(true));
        let ga = GeneticOptimizer::new(config(2, 5, 2), &factory, &scorers, &runner, &store)
            .unwrap()
            .with_interrupt(flag);
        let report = ga.run(None).unwrap();

        assert!(report.interrupted);
        assert_eq!(report.folds.len(), 1);
        assert_eq!(report.folds[0].history.len(), 1);
        assert!(store.get_experiment(&train_name(0, 1, 0)).unwrap().is_none());
    }

    #[test]
    fn test_run_without_judgments_is_an_error() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("empty.db").to_str().unwrap()).unwrap();
        let runner = runner();
        let factory = factory();
        let scorers = scorers();
        let ga = GeneticOptimizer::new(config(2, 1, 1), &factory, &scorers, &runner, &store).unwrap();
        assert!(matches!(ga.run(None), Err(TunerError::Data(_))));
    }
}
