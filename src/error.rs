//! Error types
//!
//! Configuration problems are fatal and surface before anything touches the
//! store. Search client failures are per-query and never abort a run.

use thiserror::Error;

/// A malformed factory domain, template or GA setting.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Template slot could not be parsed.
    #[error("bad template '{template}': {reason}")]
    Template { template: String, reason: String },

    /// `$n` reference to a slot that was never declared.
    #[error("template '{template}' references ${index} but only {declared} slot(s) are declared")]
    UndeclaredReference {
        template: String,
        index: usize,
        declared: usize,
    },

    /// A factory was built with nothing to choose from.
    #[error("factory '{name}' has an empty domain")]
    EmptyDomain { name: String },

    /// min/max set sizes are inconsistent with the domain.
    #[error("factory '{name}': {reason}")]
    SetSize { name: String, reason: String },

    #[error("crossover + mutation + reproduction probabilities must sum to 1.0, got {0:.4}")]
    Probabilities(f64),

    #[error("more than one scorer is marked {0}")]
    DuplicateAggregator(&'static str),

    #[error("no scorers configured")]
    NoScorers,

    #[error("invalid GA setting: {0}")]
    Ga(String),

    #[error("invalid query: {0}")]
    Query(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Failure talking to a search backend.
#[derive(Debug, Error)]
pub enum SearchClientError {
    /// Backend rejected or could not interpret the request.
    #[error("search request failed: {0}")]
    Request(String),

    #[error("search backend i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("no search client for url '{0}'")]
    UnsupportedUrl(String),
}

#[derive(Debug, Error)]
pub enum TunerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Search(#[from] SearchClientError),

    #[error("store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Bad records in an input file.
    #[error("data: {0}")]
    Data(String),

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T, E = TunerError> = std::result::Result<T, E>;
