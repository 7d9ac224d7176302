//! SQLite experiment store
//!
//! Experiments, judgments, per-query and aggregate scores, and the fold
//! assignment used by GA runs. Uses schema versioning with migrations.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ConfigError, Result as TunerResult};
use crate::experiment::Experiment;
use crate::judgments::{JudgmentList, Judgments, QueryInfo};
use crate::query::QueryStrings;
use crate::scorer::SummaryStatistics;

/// Default database path
pub const DEFAULT_DB_PATH: &str = "data/relevance_tuner.db";

/// Initialize database with a specific path
pub fn init_database(path: &str) -> rusqlite::Result<Arc<Mutex<Connection>>> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let conn = Connection::open(path)?;

    // busy_timeout prevents "database is locked" errors under contention
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 30000;",
    )?;

    run_migrations(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// Run all pending migrations
fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now')),
            description TEXT
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (version, description, sql) in get_migrations() {
        if version > current_version {
            log::info!("Applying migration {}: {}", version, description);
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
                params![version, description],
            )?;
        }
    }

    Ok(())
}

/// Get all migrations as (version, description, sql)
fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (1, "Initial schema", include_str!("../migrations/001_initial_schema.sql")),
        (2, "GA folds", include_str!("../migrations/002_ga_folds.sql")),
    ]
}

// =============================================================================
// Experiments
// =============================================================================

/// Insert or replace an experiment by name
pub fn upsert_experiment(
    conn: &Connection,
    name: &str,
    search_server_url: &str,
    query_type: &str,
    body: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO experiments (name, search_server_url, query_type, body)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            search_server_url = excluded.search_server_url,
            query_type = excluded.query_type,
            body = excluded.body,
            updated_at = datetime('now')",
        params![name, search_server_url, query_type, body],
    )?;
    Ok(())
}

pub fn get_experiment_body(conn: &Connection, name: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT body FROM experiments WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()
}

pub fn get_latest_experiment_body(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT body FROM experiments ORDER BY id DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()
}

pub fn get_experiment_bodies(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT body FROM experiments ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

// =============================================================================
// Judgments
// =============================================================================

/// Insert judgments, replacing grades of already known (query, doc) pairs
pub fn insert_judgments(conn: &mut Connection, list: &JudgmentList) -> TunerResult<usize> {
    let tx = conn.transaction()?;
    let mut inserted = 0;
    for j in list.iter() {
        let info = &j.query_info;
        let strings = serde_json::to_string(&info.query_strings)?;
        tx.execute(
            "INSERT INTO queries (query_set, query_id, query_strings, count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(query_set, query_id) DO UPDATE SET
                query_strings = excluded.query_strings,
                count = excluded.count",
            params![info.query_set, info.query_id, strings, info.count as i64],
        )?;
        let query_pk: i64 = tx.query_row(
            "SELECT id FROM queries WHERE query_set = ?1 AND query_id = ?2",
            params![info.query_set, info.query_id],
            |row| row.get(0),
        )?;
        for (doc, relevance) in &j.judgments {
            tx.execute(
                "INSERT OR REPLACE INTO judgments (query_pk, doc_id, relevance) VALUES (?1, ?2, ?3)",
                params![query_pk, doc, relevance],
            )?;
            inserted += 1;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Fold filter applied when reading judgments back
#[derive(Debug, Clone, Copy)]
enum FoldFilter {
    All,
    Train(i64),
    Test(i64),
}

/// (query pk, query_set, query_id, query_strings json, count, doc_id, relevance)
type JudgmentRow = (i64, String, String, String, i64, String, f64);

fn judgment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JudgmentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn load_judgments(conn: &Connection, filter: FoldFilter) -> TunerResult<JudgmentList> {
    let (clause, fold) = match filter {
        FoldFilter::All => ("", -1),
        FoldFilter::Train(f) => (
            "WHERE q.id IN (SELECT query_pk FROM query_folds WHERE fold != ?1)",
            f,
        ),
        FoldFilter::Test(f) => (
            "WHERE q.id IN (SELECT query_pk FROM query_folds WHERE fold = ?1)",
            f,
        ),
    };
    let sql = format!(
        "SELECT q.id, q.query_set, q.query_id, q.query_strings, q.count, j.doc_id, j.relevance
         FROM queries q JOIN judgments j ON j.query_pk = q.id
         {}
         ORDER BY q.id, j.doc_id",
        clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<JudgmentRow> = if matches!(filter, FoldFilter::All) {
        stmt.query_map([], judgment_row)?
            .collect::<rusqlite::Result<_>>()?
    } else {
        stmt.query_map(params![fold], judgment_row)?
            .collect::<rusqlite::Result<_>>()?
    };

    let mut judgments: Vec<Judgments> = Vec::new();
    let mut last_pk = None;
    for (pk, query_set, query_id, strings, count, doc, relevance) in rows {
        if last_pk != Some(pk) {
            let query_strings: QueryStrings = serde_json::from_str(&strings)?;
            judgments.push(Judgments::new(QueryInfo {
                query_set,
                query_id,
                query_strings,
                count: count.max(0) as u64,
            }));
            last_pk = Some(pk);
        }
        if let Some(current) = judgments.last_mut() {
            current.add(&doc, relevance);
        }
    }
    Ok(JudgmentList::new(judgments))
}

/// Assign every query to one of `n_folds` test folds, shuffled by `seed`
pub fn assign_folds(conn: &mut Connection, n_folds: usize, seed: u64) -> rusqlite::Result<()> {
    let mut ids: Vec<i64> = {
        let mut stmt = conn.prepare("SELECT id FROM queries ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    let mut rng = StdRng::seed_from_u64(seed);
    ids.shuffle(&mut rng);

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM query_folds", [])?;
    for (i, id) in ids.iter().enumerate() {
        tx.execute(
            "INSERT INTO query_folds (query_pk, fold) VALUES (?1, ?2)",
            params![id, (i % n_folds) as i64],
        )?;
    }
    tx.commit()
}

// =============================================================================
// Scores
// =============================================================================

pub fn insert_query_scores(
    conn: &mut Connection,
    experiment: &str,
    scorer: &str,
    scores: &HashMap<QueryInfo, f64>,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for (info, score) in scores {
        tx.execute(
            "INSERT OR REPLACE INTO query_scores (experiment, scorer, query_set, query_id, score)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![experiment, scorer, info.query_set, info.query_id, score],
        )?;
    }
    tx.commit()
}

pub fn insert_aggregate_scores(
    conn: &Connection,
    experiment: &str,
    scorer: &str,
    stats: &SummaryStatistics,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO aggregate_scores
            (experiment, scorer, count, mean, median, stddev, min, max)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            experiment,
            scorer,
            stats.count as i64,
            stats.mean,
            stats.median,
            stats.stddev,
            stats.min,
            stats.max
        ],
    )?;
    Ok(())
}

fn stats_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<SummaryStatistics> {
    Ok(SummaryStatistics {
        count: row.get::<_, i64>(offset)?.max(0) as usize,
        mean: row.get(offset + 1)?,
        median: row.get(offset + 2)?,
        stddev: row.get(offset + 3)?,
        min: row.get(offset + 4)?,
        max: row.get(offset + 5)?,
    })
}

pub fn get_aggregate_scores(
    conn: &Connection,
    experiment: &str,
) -> rusqlite::Result<Vec<(String, SummaryStatistics)>> {
    let mut stmt = conn.prepare(
        "SELECT scorer, count, mean, median, stddev, min, max
         FROM aggregate_scores WHERE experiment = ?1 ORDER BY scorer",
    )?;
    let rows = stmt.query_map(params![experiment], |row| {
        Ok((row.get(0)?, stats_from_row(row, 1)?))
    })?;
    rows.collect()
}

/// Best experiments by mean score, optionally restricted to a name prefix
pub fn get_top_experiments(
    conn: &Connection,
    scorer: &str,
    prefix: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<(String, SummaryStatistics)>> {
    let mut stmt = conn.prepare(
        "SELECT experiment, count, mean, median, stddev, min, max
         FROM aggregate_scores
         WHERE scorer = ?1 AND substr(experiment, 1, length(?2)) = ?2
         ORDER BY mean DESC, experiment
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![scorer, prefix.unwrap_or(""), limit as i64], |row| {
        Ok((row.get(0)?, stats_from_row(row, 1)?))
    })?;
    rows.collect()
}

// =============================================================================
// Store trait
// =============================================================================

/// Persistence used by the runner, the GA and the CLI.
pub trait ExperimentStore {
    fn add_experiment(&self, experiment: &Experiment) -> TunerResult<()>;
    fn get_experiment(&self, name: &str) -> TunerResult<Option<Experiment>>;
    fn latest_experiment(&self) -> TunerResult<Option<Experiment>>;
    fn get_experiments(&self) -> TunerResult<Vec<Experiment>>;
    fn clear_experiments(&self) -> TunerResult<()>;

    fn add_judgments(&self, judgments: &JudgmentList) -> TunerResult<usize>;
    fn get_judgments(&self) -> TunerResult<JudgmentList>;
    fn clear_judgments(&self) -> TunerResult<()>;

    fn insert_query_scores(
        &self,
        experiment: &str,
        scorer: &str,
        scores: &HashMap<QueryInfo, f64>,
    ) -> TunerResult<()>;
    fn insert_aggregate_scores(
        &self,
        experiment: &str,
        scorer: &str,
        stats: &SummaryStatistics,
    ) -> TunerResult<()>;
    fn get_aggregate_scores(&self, experiment: &str) -> TunerResult<Vec<(String, SummaryStatistics)>>;
    fn top_experiments(
        &self,
        scorer: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> TunerResult<Vec<(String, SummaryStatistics)>>;
    fn clear_scores(&self) -> TunerResult<()>;

    /// Partition the stored queries into `n_folds` test folds.
    fn create_folds(&self, n_folds: usize, seed: u64) -> TunerResult<()>;
    /// Queries outside `fold`.
    fn get_train_judgments(&self, fold: usize) -> TunerResult<JudgmentList>;
    /// Queries in `fold`.
    fn get_test_judgments(&self, fold: usize) -> TunerResult<JudgmentList>;
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> TunerResult<Self> {
        Ok(Self {
            conn: init_database(path)?,
        })
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_experiments(bodies: Vec<String>) -> TunerResult<Vec<Experiment>> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(Into::into))
        .collect()
}

impl ExperimentStore for SqliteStore {
    fn add_experiment(&self, experiment: &Experiment) -> TunerResult<()> {
        let body = serde_json::to_string(experiment)?;
        upsert_experiment(
            &self.conn(),
            &experiment.name,
            &experiment.search_server_url,
            experiment.query.kind(),
            &body,
        )?;
        Ok(())
    }

    fn get_experiment(&self, name: &str) -> TunerResult<Option<Experiment>> {
        let body = get_experiment_body(&self.conn(), name)?;
        Ok(parse_experiments(body.into_iter().collect())?.pop())
    }

    fn latest_experiment(&self) -> TunerResult<Option<Experiment>> {
        let body = get_latest_experiment_body(&self.conn())?;
        Ok(parse_experiments(body.into_iter().collect())?.pop())
    }

    fn get_experiments(&self) -> TunerResult<Vec<Experiment>> {
        let bodies = get_experiment_bodies(&self.conn())?;
        parse_experiments(bodies)
    }

    fn clear_experiments(&self) -> TunerResult<()> {
        self.conn().execute("DELETE FROM experiments", [])?;
        Ok(())
    }

    fn add_judgments(&self, judgments: &JudgmentList) -> TunerResult<usize> {
        insert_judgments(&mut self.conn(), judgments)
    }

    fn get_judgments(&self) -> TunerResult<JudgmentList> {
        load_judgments(&self.conn(), FoldFilter::All)
    }

    fn clear_judgments(&self) -> TunerResult<()> {
        self.conn().execute("DELETE FROM queries", [])?;
        Ok(())
    }

    fn insert_query_scores(
        &self,
        experiment: &str,
        scorer: &str,
        scores: &HashMap<QueryInfo, f64>,
    ) -> TunerResult<()> {
        insert_query_scores(&mut self.conn(), experiment, scorer, scores)?;
        Ok(())
    }

    fn insert_aggregate_scores(
        &self,
        experiment: &str,
        scorer: &str,
        stats: &SummaryStatistics,
    ) -> TunerResult<()> {
        insert_aggregate_scores(&self.conn(), experiment, scorer, stats)?;
        Ok(())
    }

    fn get_aggregate_scores(&self, experiment: &str) -> TunerResult<Vec<(String, SummaryStatistics)>> {
        Ok(get_aggregate_scores(&self.conn(), experiment)?)
    }

    fn top_experiments(
        &self,
        scorer: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> TunerResult<Vec<(String, SummaryStatistics)>> {
        Ok(get_top_experiments(&self.conn(), scorer, prefix, limit)?)
    }

    fn clear_scores(&self) -> TunerResult<()> {
        self.conn()
            .execute_batch("DELETE FROM query_scores; DELETE FROM aggregate_scores;")?;
        Ok(())
    }

    fn create_folds(&self, n_folds: usize, seed: u64) -> TunerResult<()> {
        if n_folds == 0 {
            return Err(ConfigError::Ga("n_folds must be at least 1".to_string()).into());
        }
        assign_folds(&mut self.conn(), n_folds, seed)?;
        Ok(())
    }

    fn get_train_judgments(&self, fold: usize) -> TunerResult<JudgmentList> {
        load_judgments(&self.conn(), FoldFilter::Train(fold as i64))
    }

    fn get_test_judgments(&self, fold: usize) -> TunerResult<JudgmentList> {
        load_judgments(&self.conn(), FoldFilter::Test(fold as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{WeightedField, WeightedFields};
    use crate::query::{DisMaxQuery, Query};
    use std::collections::HashSet;
    use tempfile::tempdir;

    /// Helper to create a test store
    fn test_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = SqliteStore::open(db_path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn experiment(name: &str, weight: f64) -> Experiment {
        Experiment {
            name: name.to_string(),
            search_server_url: "memory://docs.jsonl".to_string(),
            custom_handler: None,
            filter_queries: vec!["brand:acme".to_string()],
            query: Query::EDisMax(DisMaxQuery {
                qf: WeightedFields::new(vec![WeightedField::new("title", weight)]),
                tie: Some(0.3),
                ..DisMaxQuery::default()
            }),
        }
    }

    fn judgments(n: usize) -> JudgmentList {
        JudgmentList::new(
            (0..n)
                .map(|i| {
                    let mut j = Judgments::new(QueryInfo::new("web", &format!("q{}", i), &format!("text {}", i)));
                    j.add("d1", 1.0);
                    j.add(&format!("d{}", i + 2), 2.0);
                    j
                })
                .collect(),
        )
    }

    // =========================================================================
    // Database Initialization Tests
    // =========================================================================

    #[test]
    fn test_database_init_creates_all_tables() {
        let (_dir, store) = test_store();
        let conn = store.conn();
        let expected_tables = [
            "schema_version",
            "experiments",
            "queries",
            "judgments",
            "query_scores",
            "aggregate_scores",
            "query_folds",
        ];
        for table in expected_tables {
            let count: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[test]
    fn test_database_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let _conn1 = init_database(db_path.to_str().unwrap()).unwrap();
        let conn2 = init_database(db_path.to_str().unwrap()).unwrap();
        let version: i32 = conn2
            .lock()
            .unwrap()
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    // =========================================================================
    // Experiment Tests
    // =========================================================================

    #[test]
    fn test_experiment_round_trip_and_upsert() {
        let (_dir, store) = test_store();
        store.add_experiment(&experiment("a", 1.0)).unwrap();
        store.add_experiment(&experiment("b", 2.0)).unwrap();
        store.add_experiment(&experiment("a", 5.0)).unwrap();

        let a = store.get_experiment("a").unwrap().unwrap();
        assert_eq!(a, experiment("a", 5.0));
        assert_eq!(store.get_experiments().unwrap().len(), 2);
        assert_eq!(store.latest_experiment().unwrap().unwrap().name, "b");
        assert!(store.get_experiment("missing").unwrap().is_none());

        store.clear_experiments().unwrap();
        assert!(store.latest_experiment().unwrap().is_none());
    }

    // =========================================================================
    // Judgment and Fold Tests
    // =========================================================================

    #[test]
    fn test_judgments_round_trip() {
        let (_dir, store) = test_store();
        let list = judgments(3);
        assert_eq!(store.add_judgments(&list).unwrap(), 6);
        let loaded = store.get_judgments().unwrap();
        assert_eq!(loaded, list);

        store.clear_judgments().unwrap();
        assert!(store.get_judgments().unwrap().is_empty());
    }

    #[test]
    fn test_folds_partition_queries() {
        let (_dir, store) = test_store();
        store.add_judgments(&judgments(10)).unwrap();
        store.create_folds(3, 7).unwrap();

        let mut seen = HashSet::new();
        for fold in 0..3 {
            let train = store.get_train_judgments(fold).unwrap();
            let test = store.get_test_judgments(fold).unwrap();
            assert_eq!(train.len() + test.len(), 10);
            for j in test.iter() {
                assert!(seen.insert(j.query_info.query_id.clone()), "query in two test folds");
                assert!(train.iter().all(|t| t.query_info != j.query_info));
            }
        }
        assert_eq!(seen.len(), 10);
        assert!(store.create_folds(0, 7).is_err());
    }

    // =========================================================================
    // Score Tests
    // =========================================================================

    #[test]
    fn test_scores_and_top_experiments() {
        let (_dir, store) = test_store();
        let info = QueryInfo::new("web", "q1", "text");
        let mut per_query = HashMap::new();
        per_query.insert(info, 0.5);
        store.insert_query_scores("train_a", "ndcg@10", &per_query).unwrap();

        for (name, mean) in [("train_a", 0.4), ("train_b", 0.7), ("test_c", 0.9)] {
            let stats = SummaryStatistics {
                count: 1,
                mean,
                median: mean,
                stddev: 0.0,
                min: mean,
                max: mean,
            };
            store.insert_aggregate_scores(name, "ndcg@10", &stats).unwrap();
        }

        let top = store.top_experiments("ndcg@10", Some("train_"), 10).unwrap();
        let names: Vec<&str> = top.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["train_b", "train_a"]);
        assert_eq!(store.top_experiments("ndcg@10", None, 1).unwrap()[0].0, "test_c");
        assert_eq!(store.get_aggregate_scores("train_a").unwrap()[0].1.mean, 0.4);

        store.clear_scores().unwrap();
        assert!(store.top_experiments("ndcg@10", None, 10).unwrap().is_empty());
    }
}
