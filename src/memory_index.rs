//! In-process search backend
//!
//! Documents are loaded from JSONL and scored with per-field BM25. Only the
//! parts of the query model that affect ranking quality are evaluated;
//! function boosts (`bf`, `boost`) are accepted and ignored.

use log::{debug, warn};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;
use std::time::Instant;

use crate::error::SearchClientError;
use crate::feature::{QueryOperator, WeightedFields};
use crate::query::{query_text, DisMaxQuery, MultiMatchType, Occur, Query, QueryStrings};
use crate::search_client::{FacetRequest, FacetResult, QueryRequest, ResultSet, SearchClient};

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Lowercase and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

fn raw_values(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Number(n) => vec![n.to_string()],
        Value::Bool(b) => vec![b.to_string()],
        Value::Array(items) => items.iter().flat_map(raw_values).collect(),
        Value::Null | Value::Object(_) => Vec::new(),
    }
}

/// Phrase occurrence with up to `slop` extra tokens between neighbours.
/// With `prefix_last`, the last phrase term only has to prefix a token.
fn contains_phrase(tokens: &[String], phrase: &[String], slop: usize, prefix_last: bool) -> bool {
    if phrase.is_empty() || tokens.len() < phrase.len() {
        return false;
    }
    let last = phrase.len() - 1;
    let term_matches = |token: &str, idx: usize| {
        if prefix_last && idx == last {
            token.starts_with(phrase[idx].as_str())
        } else {
            token == phrase[idx]
        }
    };
    'start: for i in 0..tokens.len() {
        if !term_matches(&tokens[i], 0) {
            continue;
        }
        let mut pos = i;
        for idx in 1..phrase.len() {
            let end = (pos + 2 + slop).min(tokens.len());
            match tokens[pos + 1..end].iter().position(|t| term_matches(t, idx)) {
                Some(offset) => pos += 1 + offset,
                None => continue 'start,
            }
        }
        return true;
    }
    false
}

/// `field:value` with an optional `^boost`.
fn parse_field_clause(clause: &str) -> Option<(&str, &str, f64)> {
    let (body, boost) = match clause.rsplit_once('^') {
        Some((body, w)) => match w.trim().parse::<f64>() {
            Ok(w) => (body, w),
            Err(_) => (clause, 1.0),
        },
        None => (clause, 1.0),
    };
    let (field, value) = body.split_once(':')?;
    let value = value.trim().trim_matches('"');
    Some((field.trim(), value, boost))
}

#[derive(Debug, Default)]
struct FieldValue {
    raw: Vec<String>,
    tokens: Vec<String>,
    tf: HashMap<String, f64>,
}

#[derive(Debug)]
struct Document {
    id: String,
    fields: HashMap<String, FieldValue>,
}

#[derive(Debug, Default)]
struct FieldStats {
    doc_freq: HashMap<String, usize>,
    total_len: usize,
    docs: usize,
}

impl FieldStats {
    fn avg_len(&self) -> f64 {
        if self.docs == 0 || self.total_len == 0 {
            1.0
        } else {
            self.total_len as f64 / self.docs as f64
        }
    }
}

pub struct MemoryIndex {
    url: String,
    id_field: String,
    docs: Vec<Document>,
    stats: HashMap<String, FieldStats>,
}

impl MemoryIndex {
    /// Build from JSON objects. Objects without an id are skipped.
    pub fn from_documents(url: &str, id_field: &str, documents: Vec<Value>) -> Self {
        let mut docs = Vec::with_capacity(documents.len());
        let mut stats: HashMap<String, FieldStats> = HashMap::new();

        for (n, doc) in documents.into_iter().enumerate() {
            let Value::Object(map) = doc else {
                warn!("Skipping document {}: not an object", n + 1);
                continue;
            };
            let Some(id) = map.get(id_field).and_then(|v| raw_values(v).into_iter().next()) else {
                warn!("Skipping document {}: no '{}' field", n + 1, id_field);
                continue;
            };
            let mut fields = HashMap::new();
            for (name, value) in &map {
                let raw = raw_values(value);
                if raw.is_empty() {
                    continue;
                }
                let tokens: Vec<String> = raw.iter().flat_map(|r| tokenize(r)).collect();
                let mut tf: HashMap<String, f64> = HashMap::new();
                for t in &tokens {
                    *tf.entry(t.clone()).or_default() += 1.0;
                }
                let field_stats = stats.entry(name.clone()).or_default();
                field_stats.docs += 1;
                field_stats.total_len += tokens.len();
                for term in tf.keys() {
                    *field_stats.doc_freq.entry(term.clone()).or_default() += 1;
                }
                fields.insert(name.clone(), FieldValue { raw, tokens, tf });
            }
            docs.push(Document { id, fields });
        }

        Self {
            url: url.to_string(),
            id_field: id_field.to_string(),
            docs,
            stats,
        }
    }

    /// Read one JSON document per line. Malformed lines are skipped.
    pub fn load(url: &str, path: &Path, id_field: &str) -> Result<Self, SearchClientError> {
        let file = std::fs::File::open(path)?;
        let mut documents = Vec::new();
        for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(v) => documents.push(v),
                Err(e) => warn!("Skipping line {} of {}: {}", n + 1, path.display(), e),
            }
        }
        let index = Self::from_documents(url, id_field, documents);
        log::info!("Loaded {} documents into {}", index.len(), url);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn bm25(&self, doc: &Document, field: &str, term: &str) -> f64 {
        let Some(fv) = doc.fields.get(field) else { return 0.0 };
        let tf = fv.tf.get(term).copied().unwrap_or(0.0);
        if tf == 0.0 {
            return 0.0;
        }
        let Some(stats) = self.stats.get(field) else { return 0.0 };
        let n = self.docs.len() as f64;
        let df = stats.doc_freq.get(term).copied().unwrap_or(0) as f64;
        let idf = ((n - df + 0.5) / (df + 0.5)).ln_1p();
        let len = fv.tokens.len() as f64;
        idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * len / stats.avg_len()))
    }

    fn has_term(doc: &Document, field: &str, term: &str) -> bool {
        doc.fields.get(field).is_some_and(|fv| fv.tf.contains_key(term))
    }

    fn matches_value(doc: &Document, field: &str, value: &str) -> bool {
        let Some(fv) = doc.fields.get(field) else { return false };
        if value == "*" {
            return true;
        }
        if fv.raw.iter().any(|r| r.eq_ignore_ascii_case(value)) {
            return true;
        }
        contains_phrase(&fv.tokens, &tokenize(value), 0, false)
    }

    fn matches_filter(doc: &Document, fq: &str) -> Result<bool, SearchClientError> {
        if fq.trim() == "*:*" {
            return Ok(true);
        }
        let (field, value, _) = parse_field_clause(fq)
            .ok_or_else(|| SearchClientError::Request(format!("unsupported filter query '{}'", fq)))?;
        Ok(Self::matches_value(doc, field, value))
    }

    /// Sum of weighted BM25 for `terms`, combined dismax-style across fields.
    /// Returns (matched terms, score).
    fn dismax_terms(&self, doc: &Document, qf: &WeightedFields, terms: &[String], tie: f64) -> (usize, f64) {
        let mut matched = 0;
        let mut score = 0.0;
        for term in terms {
            let mut max: f64 = 0.0;
            let mut sum = 0.0;
            let mut hit = false;
            for wf in &qf.fields {
                if Self::has_term(doc, &wf.field, term) {
                    hit = true;
                }
                let s = wf.weight * self.bm25(doc, &wf.field, term);
                max = max.max(s);
                sum += s;
            }
            if hit {
                matched += 1;
                score += max + tie * (sum - max);
            }
        }
        (matched, score)
    }

    /// Bonus for fields containing the query phrase (`shingle == 0`) or its
    /// word n-grams.
    fn phrase_bonus(&self, doc: &Document, pf: &WeightedFields, terms: &[String], shingle: usize, slop: usize) -> f64 {
        let windows: Vec<&[String]> = if shingle == 0 {
            if terms.len() < 2 {
                return 0.0;
            }
            vec![terms]
        } else {
            terms.windows(shingle).collect()
        };
        let mut bonus = 0.0;
        for wf in &pf.fields {
            let Some(fv) = doc.fields.get(&wf.field) else { continue };
            for window in &windows {
                if contains_phrase(&fv.tokens, window, slop, false) {
                    bonus += wf.weight * window.iter().map(|t| self.bm25(doc, &wf.field, t)).sum::<f64>();
                }
            }
        }
        bonus
    }

    fn eval_dismax(&self, doc: &Document, q: &DisMaxQuery, text: &str) -> Option<f64> {
        let terms = tokenize(text);
        if terms.is_empty() {
            return None;
        }
        let (matched, mut score) = self.dismax_terms(doc, &q.qf, &terms, q.tie.unwrap_or(0.0));
        let op = q.q_op.unwrap_or_default();
        if matched == 0 || matched < op.required(terms.len()) {
            return None;
        }
        let phrases = [(&q.pf, 0, q.ps), (&q.pf2, 2, q.ps2), (&q.pf3, 3, q.ps3)];
        for (pf, shingle, slop) in phrases {
            if let Some(pf) = pf {
                let slop = slop.unwrap_or(0).max(0) as usize;
                score += self.phrase_bonus(doc, pf, &terms, shingle, slop);
            }
        }
        if let Some(bq) = &q.bq {
            for clause in &bq.values {
                if let Some((field, value, boost)) = parse_field_clause(clause) {
                    if Self::matches_value(doc, field, value) {
                        score += boost;
                    }
                }
            }
        }
        Some(score)
    }

    fn eval(&self, doc: &Document, query: &Query, strings: &QueryStrings) -> Option<f64> {
        let text = || query_text(strings, query.query_string_name());
        match query {
            Query::Lucene(q) => {
                let terms = tokenize(text()?);
                let mut matched = 0;
                let mut score = 0.0;
                for term in &terms {
                    if Self::has_term(doc, &q.default_field, term) {
                        matched += 1;
                        score += self.bm25(doc, &q.default_field, term);
                    }
                }
                if matched == 0 || matched < q.operator.required(terms.len()) {
                    return None;
                }
                Some(score)
            }
            Query::Term(t) => Self::matches_value(doc, &t.field, &t.term).then_some(1.0),
            Query::Terms(t) => t
                .terms
                .iter()
                .any(|term| Self::matches_value(doc, &t.field, term))
                .then_some(1.0),
            Query::MultiMatch(q) => {
                let terms = tokenize(text()?);
                if terms.is_empty() {
                    return None;
                }
                match q.match_type {
                    MultiMatchType::Phrase | MultiMatchType::PhrasePrefix => {
                        let prefix = q.match_type == MultiMatchType::PhrasePrefix;
                        let mut best: Option<f64> = None;
                        for wf in &q.qf.fields {
                            let Some(fv) = doc.fields.get(&wf.field) else { continue };
                            if contains_phrase(&fv.tokens, &terms, 0, prefix) {
                                let s: f64 = terms.iter().map(|t| wf.weight * self.bm25(doc, &wf.field, t)).sum();
                                best = Some(best.map_or(s, |b: f64| b.max(s)));
                            }
                        }
                        best
                    }
                    other => {
                        let tie = match other {
                            MultiMatchType::BestFields => q.tie.unwrap_or(0.0),
                            _ => 1.0,
                        };
                        let (matched, score) = self.dismax_terms(doc, &q.qf, &terms, tie);
                        let op = q.operator.unwrap_or_else(QueryOperator::default);
                        if matched == 0 || matched < op.required(terms.len()) {
                            return None;
                        }
                        Some(score)
                    }
                }
            }
            Query::DisMax(q) | Query::EDisMax(q) => self.eval_dismax(doc, q, text()?),
            Query::Boolean(b) => {
                let mut score = 0.0;
                let mut any_should = false;
                let mut has_required = false;
                for clause in &b.clauses {
                    let result = self.eval(doc, &clause.query, strings);
                    match clause.occur {
                        Occur::And => {
                            has_required = true;
                            score += result?;
                        }
                        Occur::Filter => {
                            has_required = true;
                            result?;
                        }
                        Occur::Not => {
                            if result.is_some() {
                                return None;
                            }
                        }
                        Occur::Or => {
                            if let Some(s) = result {
                                any_should = true;
                                score += s;
                            }
                        }
                    }
                }
                (has_required || any_should).then_some(score)
            }
            Query::Boosting(b) => {
                let score = self.eval(doc, &b.positive, strings)?;
                match self.eval(doc, &b.negative, strings) {
                    Some(_) => Some(score * b.negative_boost),
                    None => Some(score),
                }
            }
        }
    }

    /// Every query string the request will read must be present.
    fn check_query_text(query: &Query, strings: &QueryStrings) -> Result<(), SearchClientError> {
        if query.is_single_string() && query_text(strings, query.query_string_name()).is_none() {
            return Err(SearchClientError::Request(format!(
                "no query string '{}'",
                query.query_string_name().unwrap_or(crate::query::DEFAULT_QUERY_STRING_NAME)
            )));
        }
        match query {
            Query::Boolean(b) => b
                .clauses
                .iter()
                .try_for_each(|c| Self::check_query_text(&c.query, strings)),
            Query::Boosting(b) => {
                Self::check_query_text(&b.positive, strings)?;
                Self::check_query_text(&b.negative, strings)
            }
            _ => Ok(()),
        }
    }

    /// Matching document indices with scores, best first.
    fn matching(
        &self,
        query: &Query,
        strings: &QueryStrings,
        filter_queries: &[String],
    ) -> Result<Vec<(usize, f64)>, SearchClientError> {
        Self::check_query_text(query, strings)?;
        for fq in filter_queries {
            if fq.trim() != "*:*" && parse_field_clause(fq).is_none() {
                return Err(SearchClientError::Request(format!("unsupported filter query '{}'", fq)));
            }
        }
        let mut hits: Vec<(usize, f64)> = self
            .docs
            .par_iter()
            .enumerate()
            .filter_map(|(i, doc)| {
                let passes = filter_queries
                    .iter()
                    .all(|fq| Self::matches_filter(doc, fq).unwrap_or(false));
                if !passes {
                    return None;
                }
                self.eval(doc, query, strings).map(|s| (i, s))
            })
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(hits)
    }
}

impl SearchClient for MemoryIndex {
    fn url(&self) -> &str {
        &self.url
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn search(&self, request: &QueryRequest) -> Result<ResultSet, SearchClientError> {
        let start = Instant::now();
        if let Some(handler) = &request.custom_handler {
            debug!("{}: ignoring custom handler {}", self.url, handler);
        }
        let hits = self.matching(&request.query, &request.query_strings, &request.filter_queries)?;
        let ids = hits
            .iter()
            .take(request.rows)
            .map(|(i, _)| self.docs[*i].id.clone())
            .collect();
        Ok(ResultSet {
            total_hits: hits.len() as u64,
            ids,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn facet(&self, request: &FacetRequest) -> Result<FacetResult, SearchClientError> {
        let hits = self.matching(&request.query, &request.query_strings, &request.filter_queries)?;
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for (i, _) in &hits {
            if let Some(fv) = self.docs[*i].fields.get(&request.field) {
                let distinct: HashSet<&str> = fv.raw.iter().map(String::as_str).collect();
                for value in distinct {
                    *counts.entry(value).or_default() += 1;
                }
            }
        }
        let mut counts: Vec<(String, u64)> = counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if request.limit > 0 {
            counts.truncate(request.limit);
        }
        Ok(FacetResult {
            total_docs: hits.len() as u64,
            counts,
        })
    }
}
