//! Subcommand implementations

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relevance_tuner::config::TuningConfig;
use relevance_tuner::db::ExperimentStore;
use relevance_tuner::error::{Result, TunerError};
use relevance_tuner::experiment::Experiment;
use relevance_tuner::ga::{GaReport, GeneticOptimizer};
use relevance_tuner::judgments::JudgmentList;
use relevance_tuner::runner::ExperimentRunner;
use relevance_tuner::scorer::{ScorerConfig, ScorerKind};
use relevance_tuner::search_client::ClientRegistry;

use crate::config::Config;

fn runner(config: &Config, num_threads: usize) -> ExperimentRunner {
    let registry = Arc::new(ClientRegistry::new(&config.runner.id_field));
    ExperimentRunner::new(registry, num_threads, config.runner.rows)
}

pub fn load_judgments(store: &dyn ExperimentStore, path: &str, clear: bool) -> Result<()> {
    let list = JudgmentList::load(Path::new(path))?;
    if clear {
        store.clear_judgments()?;
    }
    let inserted = store.add_judgments(&list)?;
    println!("Loaded {} queries ({} judgments) from {}", list.len(), inserted, path);
    Ok(())
}

pub fn generate(
    store: &dyn ExperimentStore,
    factory_path: &str,
    permute: bool,
    max: usize,
    prefix: &str,
) -> Result<()> {
    let tuning = TuningConfig::load(Path::new(factory_path))?;
    let factory = tuning.experiment_factory()?;

    let experiments: Vec<Experiment> = if permute {
        factory.permute(prefix, max)
    } else {
        let mut rng = StdRng::seed_from_u64(tuning.ga.seed);
        (0..max)
            .map(|i| factory.random(&format!("{}{}", prefix, i), &mut rng))
            .collect()
    };
    for e in &experiments {
        store.add_experiment(e)?;
    }
    println!(
        "Stored {} {} experiment(s) for {}",
        experiments.len(),
        if permute { "permuted" } else { "random" },
        factory.search_server_url()
    );
    Ok(())
}

pub fn run(
    store: &dyn ExperimentStore,
    config: &Config,
    factory_path: Option<&str>,
    names: &[String],
    interrupt_flag: &AtomicBool,
) -> Result<()> {
    let scorers = match factory_path {
        Some(path) => TuningConfig::load(Path::new(path))?.scorers,
        None => vec![ScorerConfig::new(ScorerKind::Ndcg, 10)],
    };
    let experiments = if names.is_empty() {
        store.get_experiments()?
    } else {
        let mut found = Vec::with_capacity(names.len());
        for name in names {
            match store.get_experiment(name)? {
                Some(e) => found.push(e),
                None => warn!("No experiment named '{}'", name),
            }
        }
        found
    };
    if experiments.is_empty() {
        return Err(TunerError::Data("no experiments to run".to_string()));
    }

    let judgments = store.get_judgments()?;
    if judgments.is_empty() {
        return Err(TunerError::Data("no judgments loaded".to_string()));
    }

    let runner = runner(config, config.runner.num_threads);
    for experiment in &experiments {
        if interrupt_flag.load(Ordering::SeqCst) {
            warn!("Interrupted, skipping remaining experiments");
            break;
        }
        let scores = runner.run_and_store(store, experiment, &judgments, &scorers)?;
        println!("{}", experiment.name);
        for r in &scores.results {
            println!(
                "  {:<16} mean {:.4}  median {:.4}  stddev {:.4}  n={}",
                r.config.name(),
                r.summary.mean,
                r.summary.median,
                r.summary.stddev,
                r.summary.count
            );
        }
        if scores.failed > 0 {
            println!("  {} quer{} failed", scores.failed, if scores.failed == 1 { "y" } else { "ies" });
        }
    }
    Ok(())
}

pub fn ga(
    store: &dyn ExperimentStore,
    config: &Config,
    factory_path: &str,
    seeds_path: Option<&str>,
    interrupt_flag: Arc<AtomicBool>,
) -> Result<()> {
    let tuning = TuningConfig::load(Path::new(factory_path))?;
    let factory = tuning.experiment_factory()?;
    let seeds: Option<Vec<Experiment>> = match seeds_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            let seeds: Vec<Experiment> = serde_json::from_str(&json)?;
            info!("Seeding every fold with {} experiment(s) from {}", seeds.len(), path);
            Some(seeds)
        }
        None => None,
    };

    let runner = runner(config, tuning.ga.num_threads);
    let optimizer = GeneticOptimizer::new(tuning.ga.clone(), &factory, &tuning.scorers, &runner, store)?
        .with_interrupt(interrupt_flag);
    let report = optimizer.run(seeds.as_deref())?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &GaReport) {
    println!();
    println!("═══════════════════════════════════════════════════════════════");
    println!("  GA REPORT");
    println!(
        "  {} → {}{}",
        report.started_at.format("%Y-%m-%d %H:%M:%S"),
        report.finished_at.format("%Y-%m-%d %H:%M:%S"),
        if report.interrupted { " (interrupted)" } else { "" }
    );
    println!("═══════════════════════════════════════════════════════════════");
    println!(
        "  {:<5} {:<36} {:>10} {:>10}",
        "fold", "best experiment", report.train_scorer, report.test_scorer
    );
    for fold in &report.folds {
        println!(
            "  {:<5} {:<36} {:>10.4} {:>10.4}",
            fold.fold, fold.best_train_experiment, fold.train_score, fold.test_score
        );
    }
    println!();
    println!(
        "  Test {}: mean {:.4}  median {:.4}  stddev {:.4}",
        report.test_scorer, report.test_summary.mean, report.test_summary.median, report.test_summary.stddev
    );
}

pub fn dump(store: &dyn ExperimentStore, scorer: &str, prefix: Option<&str>, limit: usize) -> Result<()> {
    let top = store.top_experiments(scorer, prefix, limit)?;
    if top.is_empty() {
        println!("No scores for {}", scorer);
        return Ok(());
    }
    println!("  {:<4} {:<40} {:>8} {:>8} {:>8} {:>6}", "#", "experiment", "mean", "median", "stddev", "n");
    for (i, (name, stats)) in top.iter().enumerate() {
        println!(
            "  {:<4} {:<40} {:>8.4} {:>8.4} {:>8.4} {:>6}",
            i + 1,
            name,
            stats.mean,
            stats.median,
            stats.stddev,
            stats.count
        );
    }
    if let Some((best, _)) = top.first() {
        if let Some(experiment) = store.get_experiment(best)? {
            println!();
            println!("Best: {}", serde_json::to_string_pretty(&experiment)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relevance_tuner::db::SqliteStore;
    use std::io::Write;
    use tempfile::tempdir;

    const FACTORY: &str = r#"{
        "search_server_url": "memory://unused.jsonl",
        "query": {"type": "dismax", "qf": {"kind": "weighted_fields", "fields": ["title", "body"], "default_weights": [0.0, 1.0, 2.0]}}
    }"#;

    #[test]
    fn test_generate_permute_stores_every_combination() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let factory_path = dir.path().join("factory.json");
        std::fs::File::create(&factory_path)
            .unwrap()
            .write_all(FACTORY.as_bytes())
            .unwrap();

        generate(&store, factory_path.to_str().unwrap(), true, 100, "perm_").unwrap();
        // 3 x 3 weight choices minus the empty field set
        assert_eq!(store.get_experiments().unwrap().len(), 8);
        assert!(store.get_experiment("perm_0").unwrap().is_some());
    }

    #[test]
    fn test_run_without_experiments_fails() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let flag = AtomicBool::new(false);
        assert!(run(&store, &Config::default(), None, &[], &flag).is_err());
    }
}
