//! Relevance Tuner - Library
//!
//! This crate runs parameterized query experiments against a search
//! backend, scores them against relevance judgments and evolves the
//! query parameters with a genetic algorithm.

pub mod config;
pub mod db;
pub mod error;
pub mod experiment;
pub mod factory;
pub mod feature;
pub mod ga;
pub mod judgments;
pub mod memory_index;
pub mod param_string;
pub mod query;
pub mod runner;
pub mod scorer;
pub mod search_client;
