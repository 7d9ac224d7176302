//! Configuration loading and CLI argument parsing

use clap::{Parser, Subcommand};
use serde::Deserialize;

use relevance_tuner::db::DEFAULT_DB_PATH;
use relevance_tuner::runner::{DEFAULT_NUM_THREADS, DEFAULT_ROWS};

#[derive(Parser, Debug)]
#[command(name = "tuner")]
#[command(about = "Genetic relevance tuning of search query parameters")]
pub struct Args {
    /// Path to config file
    #[arg(short = 'c', long, default_value = "tuner.toml")]
    pub config: String,

    /// Path to experiment database (overrides config)
    #[arg(short = 'd', long)]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read JSONL judgments into the store
    LoadJudgments {
        /// Judgments file (defaults to paths.judgments)
        file: Option<String>,

        /// Drop previously loaded judgments first
        #[arg(long)]
        clear: bool,
    },

    /// Store random or permuted experiments from a factory config
    Generate {
        /// Experiment factory JSON
        #[arg(short = 'f', long)]
        factory: String,

        /// Enumerate the search space instead of sampling it
        #[arg(long)]
        permute: bool,

        /// Maximum number of experiments
        #[arg(short = 'n', long, default_value_t = 100)]
        max: usize,

        /// Experiment name prefix
        #[arg(long, default_value = "exp_")]
        prefix: String,
    },

    /// Run stored experiments against the stored judgments
    Run {
        /// Factory config supplying the scorers (ndcg@10 otherwise)
        #[arg(short = 'f', long)]
        factory: Option<String>,

        /// Experiments to run (all stored experiments when empty)
        names: Vec<String>,
    },

    /// Genetic search with n-fold train/test evaluation
    Ga {
        /// Experiment factory JSON
        #[arg(short = 'f', long)]
        factory: String,

        /// JSON array of experiments seeding every fold
        #[arg(long)]
        seeds: Option<String>,
    },

    /// Print the best experiments for a scorer
    Dump {
        /// Scorer name, e.g. ndcg@10
        #[arg(short = 's', long)]
        scorer: String,

        /// Only experiments whose name starts with this
        #[arg(short = 'p', long)]
        prefix: Option<String>,

        #[arg(short = 'l', long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_judgments")]
    pub judgments: String,
}

fn default_database() -> String {
    DEFAULT_DB_PATH.to_string()
}
fn default_judgments() -> String {
    "data/judgments.jsonl".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            judgments: default_judgments(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_rows")]
    pub rows: usize,
}

fn default_num_threads() -> usize {
    DEFAULT_NUM_THREADS
}
fn default_id_field() -> String {
    "id".to_string()
}
fn default_rows() -> usize {
    DEFAULT_ROWS
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            id_field: default_id_field(),
            rows: default_rows(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("Failed to parse {}: {}", path, e);
                Config::default()
            }),
            Err(_) => {
                log::warn!("No config file at {}, using defaults", path);
                Config::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str("[runner]\nnum_threads = 2\n").unwrap();
        assert_eq!(config.runner.num_threads, 2);
        assert_eq!(config.runner.id_field, "id");
        assert_eq!(config.runner.rows, DEFAULT_ROWS);
        assert_eq!(config.paths.database, DEFAULT_DB_PATH);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/tuner.toml");
        assert_eq!(config.runner.num_threads, DEFAULT_NUM_THREADS);
    }

    #[test]
    fn test_subcommands_parse() {
        let args = Args::parse_from(["tuner", "-d", "x.db", "dump", "-s", "ndcg@10", "-p", "test_"]);
        assert_eq!(args.database.as_deref(), Some("x.db"));
        match args.command {
            Command::Dump { scorer, prefix, limit } => {
                assert_eq!(scorer, "ndcg@10");
                assert_eq!(prefix.as_deref(), Some("test_"));
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
