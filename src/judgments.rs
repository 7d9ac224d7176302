//! Relevance judgments
//!
//! One `Judgments` per judged query: its identity plus the graded documents.
//! Files are JSONL with one (query, document, grade) row per line.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::BufRead;

use crate::error::Result;
use crate::query::{QueryStrings, DEFAULT_QUERY_STRING_NAME};

/// Identity of a judged query. Scores are keyed by this, never by arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query_set: String,
    pub query_id: String,
    pub query_strings: QueryStrings,
    /// How often the query was issued, e.g. from logs.
    pub count: u64,
}

impl QueryInfo {
    pub fn new(query_set: &str, query_id: &str, text: &str) -> Self {
        let mut query_strings = QueryStrings::new();
        query_strings.insert(DEFAULT_QUERY_STRING_NAME.to_string(), text.to_string());
        Self {
            query_set: query_set.to_string(),
            query_id: query_id.to_string(),
            query_strings,
            count: 1,
        }
    }

    fn key(&self) -> (String, String) {
        (self.query_set.clone(), self.query_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgments {
    pub query_info: QueryInfo,
    /// document id -> relevance grade
    pub judgments: BTreeMap<String, f64>,
}

impl Judgments {
    pub fn new(query_info: QueryInfo) -> Self {
        Self {
            query_info,
            judgments: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, doc_id: &str, grade: f64) {
        self.judgments.insert(doc_id.to_string(), grade);
    }

    pub fn grade(&self, doc_id: &str) -> Option<f64> {
        self.judgments.get(doc_id).copied()
    }

    /// Documents with a positive grade.
    pub fn relevant_count(&self) -> usize {
        self.judgments.values().filter(|g| **g > 0.0).count()
    }

    /// Grades sorted from best to worst.
    pub fn ideal_grades(&self) -> Vec<f64> {
        let mut grades: Vec<f64> = self.judgments.values().copied().collect();
        grades.sort_by(|a, b| b.total_cmp(a));
        grades
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgmentList {
    pub judgments: Vec<Judgments>,
}

/// One line of a judgments file.
#[derive(Debug, Deserialize)]
struct JudgmentRow {
    #[serde(default = "default_query_set")]
    query_set: String,
    query_id: String,
    #[serde(default)]
    query_strings: Option<QueryStrings>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default = "default_count")]
    count: u64,
    doc_id: String,
    relevance: f64,
}

fn default_query_set() -> String {
    "default".to_string()
}

fn default_count() -> u64 {
    1
}

impl JudgmentList {
    pub fn new(judgments: Vec<Judgments>) -> Self {
        Self { judgments }
    }

    pub fn len(&self) -> usize {
        self.judgments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.judgments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Judgments> {
        self.judgments.iter()
    }

    /// Distinct judged document ids across all queries.
    pub fn doc_ids(&self) -> BTreeSet<String> {
        self.judgments
            .iter()
            .flat_map(|j| j.judgments.keys().cloned())
            .collect()
    }

    /// Read JSONL rows, merging rows of the same query.
    ///
    /// Malformed lines and rows whose query metadata disagrees with an
    /// earlier row of the same query are skipped with a warning.
    pub fn read_jsonl<R: BufRead>(reader: R) -> Result<Self> {
        let mut order: Vec<(String, String)> = Vec::new();
        let mut by_query: HashMap<(String, String), Judgments> = HashMap::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: JudgmentRow = match serde_json::from_str(line) {
                Ok(row) => row,
                Err(e) => {
                    warn!("Skipping judgment line {}: {}", line_no + 1, e);
                    continue;
                }
            };
            let query_strings = match (row.query_strings, row.query) {
                (Some(qs), _) if !qs.is_empty() => qs,
                (_, Some(text)) => {
                    let mut qs = QueryStrings::new();
                    qs.insert(DEFAULT_QUERY_STRING_NAME.to_string(), text);
                    qs
                }
                _ => {
                    warn!("Skipping judgment line {}: no query text", line_no + 1);
                    continue;
                }
            };
            let info = QueryInfo {
                query_set: row.query_set,
                query_id: row.query_id,
                query_strings,
                count: row.count,
            };

            let key = info.key();
            match by_query.get_mut(&key) {
                Some(existing) => {
                    if existing.query_info != info {
                        warn!(
                            "Judgment line {} redeclares query {}/{} with different metadata, skipping",
                            line_no + 1,
                            info.query_set,
                            info.query_id
                        );
                        continue;
                    }
                    if let Some(prev) = existing.grade(&row.doc_id) {
                        if prev != row.relevance {
                            warn!(
                                "Conflicting grades for doc {} in query {}: keeping {}",
                                row.doc_id, info.query_id, prev
                            );
                        }
                        continue;
                    }
                    existing.add(&row.doc_id, row.relevance);
                }
                None => {
                    let mut j = Judgments::new(info);
                    j.add(&row.doc_id, row.relevance);
                    order.push(key.clone());
                    by_query.insert(key, j);
                }
            }
        }

        let judgments = order
            .into_iter()
            .filter_map(|k| by_query.remove(&k))
            .collect();
        Ok(Self { judgments })
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::read_jsonl(std::io::BufReader::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROWS: &str = r#"
{"query_set":"web","query_id":"q1","query":"red shoes","doc_id":"d1","relevance":3}
{"query_set":"web","query_id":"q1","query":"red shoes","doc_id":"d2","relevance":0}
{"query_set":"web","query_id":"q2","query_strings":{"query":"blue hat","brand":"acme"},"count":7,"doc_id":"d3","relevance":1}
this is not json
{"query_set":"web","query_id":"q1","query":"red boots","doc_id":"d4","relevance":2}
{"query_set":"web","query_id":"q1","query":"red shoes","doc_id":"d1","relevance":1}
"#;

    #[test]
    fn test_rows_merge_by_query() {
        let list = JudgmentList::read_jsonl(ROWS.as_bytes()).unwrap();
        assert_eq!(list.len(), 2);

        let q1 = &list.judgments[0];
        assert_eq!(q1.query_info.query_id, "q1");
        assert_eq!(q1.judgments.len(), 2);
        assert_eq!(q1.grade("d1"), Some(3.0));
        assert_eq!(q1.relevant_count(), 1);

        let q2 = &list.judgments[1];
        assert_eq!(q2.query_info.count, 7);
        assert_eq!(q2.query_info.query_strings.get("brand").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_mismatched_metadata_is_skipped() {
        let list = JudgmentList::read_jsonl(ROWS.as_bytes()).unwrap();
        assert!(list.doc_ids().iter().all(|d| d != "d4"));
    }

    #[test]
    fn test_ideal_grades_sorted_descending() {
        let mut j = Judgments::new(QueryInfo::new("s", "q", "text"));
        j.add("a", 1.0);
        j.add("b", 3.0);
        j.add("c", 2.0);
        assert_eq!(j.ideal_grades(), vec![3.0, 2.0, 1.0]);
    }
}
