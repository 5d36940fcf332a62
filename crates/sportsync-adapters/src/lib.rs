//! Source adapter contracts, the retrying feed adapter, and its payload parsers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use sportsync_core::{Record, RecordType};
use thiserror::Error;
use uuid::Uuid;

pub mod feed;
pub mod parse;

pub use feed::{FeedAdapter, FeedSource};
pub use parse::{excerpt, HtmlTableParser, JsonFeedParser, ParseError, RecordParser, EXCERPT_LIMIT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub params: BTreeMap<String, String>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, params: BTreeMap<String, String>) -> Self {
        Self { run_id, params }
    }
}

/// Terminal failure of one `collect` call, after any retries.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("{source_id}: giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        source_id: String,
        attempts: usize,
        last_error: String,
    },
    #[error("{source_id}: request failed: {message}")]
    Permanent { source_id: String, message: String },
    #[error("{source_id}: structural parse error: {message} (payload begins {excerpt:?})")]
    StructuralParse {
        source_id: String,
        message: String,
        excerpt: String,
    },
    #[error("{source_id} does not serve {record_type}")]
    UnsupportedRecordType {
        source_id: String,
        record_type: RecordType,
    },
    #[error("{source_id}: invalid endpoint `{url}`: {message}")]
    InvalidEndpoint {
        source_id: String,
        url: String,
        message: String,
    },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn collect(
        &self,
        ctx: &AdapterContext,
        record_type: RecordType,
    ) -> Result<Vec<Record>, CollectionError>;
}

/// Adapters keyed by the source id jobs refer to.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.source_ids())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one for the same source.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters
            .insert(adapter.source_id().to_string(), adapter);
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id).cloned()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.adapters.contains_key(source_id)
    }

    pub fn source_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
