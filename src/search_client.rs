//! Search backend boundary
//!
//! The runner only talks to `SearchClient`. Backends are picked by URL
//! through `ClientRegistry`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::SearchClientError;
use crate::memory_index::MemoryIndex;
use crate::query::{Query, QueryStrings};

/// Scheme of URLs served by `MemoryIndex`.
pub const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: Query,
    pub query_strings: QueryStrings,
    /// `field:value` restrictions that do not contribute to scoring.
    pub filter_queries: Vec<String>,
    pub custom_handler: Option<String>,
    pub rows: usize,
}

impl QueryRequest {
    pub fn new(query: Query, query_strings: QueryStrings, rows: usize) -> Self {
        Self {
            query,
            query_strings,
            filter_queries: Vec::new(),
            custom_handler: None,
            rows,
        }
    }

    /// Flat parameters for backends that take them, `None` for
    /// structured queries.
    pub fn params(&self) -> Option<Vec<(String, String)>> {
        let mut params = self.query.to_params(&self.query_strings)?;
        for fq in &self.filter_queries {
            params.push(("fq".to_string(), fq.clone()));
        }
        params.push(("rows".to_string(), self.rows.to_string()));
        if let Some(handler) = &self.custom_handler {
            params.push(("qt".to_string(), handler.clone()));
        }
        Some(params)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub total_hits: u64,
    /// Ranked document ids, best first.
    pub ids: Vec<String>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone)]
pub struct FacetRequest {
    pub query: Query,
    pub query_strings: QueryStrings,
    pub filter_queries: Vec<String>,
    pub field: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacetResult {
    pub total_docs: u64,
    pub counts: Vec<(String, u64)>,
}

pub trait SearchClient: Send + Sync {
    fn url(&self) -> &str;

    /// Field holding the unique document key.
    fn id_field(&self) -> &str;

    fn search(&self, request: &QueryRequest) -> Result<ResultSet, SearchClientError>;

    fn facet(&self, request: &FacetRequest) -> Result<FacetResult, SearchClientError>;
}

/// Clients by URL, built on first use and shared afterwards.
#[derive(Default)]
pub struct ClientRegistry {
    id_field: String,
    clients: Mutex<HashMap<String, Arc<dyn SearchClient>>>,
}

impl ClientRegistry {
    pub fn new(id_field: &str) -> Self {
        Self {
            id_field: id_field.to_string(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Make `client` answer for its URL.
    pub fn register(&self, client: Arc<dyn SearchClient>) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(client.url().to_string(), client);
        }
    }

    pub fn get(&self, url: &str) -> Result<Arc<dyn SearchClient>, SearchClientError> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| SearchClientError::Request("client registry poisoned".to_string()))?;
        if let Some(client) = clients.get(url) {
            return Ok(Arc::clone(client));
        }
        let client: Arc<dyn SearchClient> = match url.strip_prefix(MEMORY_SCHEME) {
            Some(path) => Arc::new(MemoryIndex::load(url, std::path::Path::new(path), &self.id_field)?),
            None => return Err(SearchClientError::UnsupportedUrl(url.to_string())),
        };
        clients.insert(url.to_string(), Arc::clone(&client));
        Ok(client)
    }
}
