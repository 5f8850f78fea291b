//! Source adapter trait and registry.
//!
//! Every upstream provider is reached through a [`SourceAdapter`]. The
//! integration pipeline only ever sees adapters as trait objects, so
//! built-in and custom adapters are interchangeable.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │              AdapterRegistry              │
//! │  ┌───────────┐ ┌────────┐ ┌────────────┐ │
//! │  │filesystem │ │  http  │ │  staging   │ │
//! │  │ json/jsonl│ │ paged  │ │  (sqlite)  │ │
//! │  └───────────┘ └────────┘ └────────────┘ │
//! └──────────────────┬────────────────────────┘
//!                    ▼
//!          run_integration() → normalize → resolve → merge → store
//! ```
//!
//! # Usage
//!
//! ```rust
//! use article_integrator::traits::AdapterRegistry;
//!
//! let mut adapters = AdapterRegistry::new();
//! // adapters.register(Arc::new(MyAdapter::new()));
//! assert!(adapters.is_empty());
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::SqlitePool;
use std::sync::Arc;

use article_integrator_core::{RawRecord, SourceError};

use crate::adapter_fs::FilesystemAdapter;
use crate::adapter_http::HttpAdapter;
use crate::adapter_staging::StagingAdapter;
use crate::config::Config;

/// One page of records from a source.
///
/// `records` is lazy: the adapter may still be reading while the pipeline
/// drains it. `next_cursor` resumes the source after this page; `None`
/// means the source has nothing further to offer right now.
pub struct FetchBatch {
    pub records: BoxStream<'static, Result<RawRecord, SourceError>>,
    pub next_cursor: Option<String>,
    /// Entries on this page that could not become records.
    pub rejected: Vec<RejectedRecord>,
}

/// An upstream entry dropped by the adapter. It is reported with the
/// run's skipped records; its siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub record_key: String,
    pub reason: String,
}

impl FetchBatch {
    /// A batch over records that are already in memory.
    pub fn from_records(records: Vec<RawRecord>, next_cursor: Option<String>) -> Self {
        Self {
            records: stream::iter(records.into_iter().map(Ok)).boxed(),
            next_cursor,
            rejected: Vec::new(),
        }
    }

    pub fn with_rejected(mut self, rejected: Vec<RejectedRecord>) -> Self {
        self.rejected = rejected;
        self
    }

    pub fn empty() -> Self {
        Self::from_records(Vec::new(), None)
    }
}

/// A data source that produces raw article records.
///
/// # Lifecycle
///
/// 1. The adapter is registered via [`AdapterRegistry::register`].
/// 2. [`fetch`](SourceAdapter::fetch) is called with the stored cursor
///    (or `None`), then again with each returned `next_cursor` until the
///    cursor stops advancing.
/// 3. After the run persisted the adapter's records,
///    [`acknowledge`](SourceAdapter::acknowledge) is called with their
///    native ids.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use article_integrator::traits::{FetchBatch, SourceAdapter};
/// use article_integrator_core::{RawRecord, SourceError};
/// use chrono::Utc;
///
/// pub struct FixedAdapter;
///
/// #[async_trait]
/// impl SourceAdapter for FixedAdapter {
///     fn name(&self) -> &str { "fixed" }
///
///     async fn fetch(&self, _cursor: Option<&str>) -> Result<FetchBatch, SourceError> {
///         let record = RawRecord::new(
///             self.source_id(),
///             "1",
///             serde_json::json!({ "title": "Dune" }),
///             Utc::now(),
///         );
///         Ok(FetchBatch::from_records(vec![record], None))
///     }
/// }
/// ```
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Instance name (e.g. `"catalog"`, `"openlibrary"`).
    fn name(&self) -> &str;

    /// Adapter type (`"filesystem"`, `"http"`, `"staging"`, `"custom"`).
    fn adapter_type(&self) -> &str {
        "custom"
    }

    /// One-line description, shown by `integrator sources`.
    fn description(&self) -> &str {
        ""
    }

    /// Label stamped on every record: `"{adapter_type}:{name}"`.
    fn source_id(&self) -> String {
        format!("{}:{}", self.adapter_type(), self.name())
    }

    /// Whether records leave the source once they are
    /// [acknowledged](SourceAdapter::acknowledge).
    ///
    /// A non-draining source is a snapshot: a fetch from no cursor returns
    /// everything it holds, so records it stopped returning are dropped
    /// from the ledger, and its final cursor is resumed from on the next
    /// incremental run. A draining source only pages with its cursor
    /// within a run, and the records it already delivered stay in the
    /// ledger.
    fn drains(&self) -> bool {
        false
    }

    /// Fetch one page of records starting after `cursor`.
    ///
    /// Errors are retried by the pipeline with backoff; adapters should
    /// not retry internally.
    async fn fetch(&self, cursor: Option<&str>) -> Result<FetchBatch, SourceError>;

    /// Called after records with these native ids were persisted.
    async fn acknowledge(&self, _native_ids: &[String]) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Registry of the adapters available to a run.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty adapter registry.
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Create a registry with one adapter per configured source.
    ///
    /// Staging adapters read from `pool`.
    pub fn from_config(config: &Config, pool: &SqlitePool) -> Result<Self> {
        let mut registry = Self::new();
        for (name, fs) in &config.sources.filesystem {
            registry.register(Arc::new(FilesystemAdapter::new(name, fs.clone())?));
        }
        for (name, http) in &config.sources.http {
            registry.register(Arc::new(HttpAdapter::new(name, http.clone())?));
        }
        for (name, staging) in &config.sources.staging {
            registry.register(Arc::new(StagingAdapter::new(
                name,
                staging.clone(),
                pool.clone(),
            )));
        }
        Ok(registry)
    }

    /// Register an adapter.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.push(adapter);
    }

    /// Get all registered adapters.
    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    /// Find an adapter by its `"{type}:{name}"` label.
    pub fn find(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.source_id() == source_id)
            .cloned()
    }

    /// Adapters matching any selector.
    ///
    /// A selector is `all`, an adapter type (`http`), or a full label
    /// (`http:openlibrary`). An empty selector list selects everything.
    pub fn select(&self, selectors: &[String]) -> Result<Vec<Arc<dyn SourceAdapter>>> {
        if selectors.is_empty() || selectors.iter().any(|s| s == "all") {
            return Ok(self.adapters.clone());
        }

        let mut selected: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        for selector in selectors {
            let matches: Vec<_> = self
                .adapters
                .iter()
                .filter(|a| a.source_id() == *selector || a.adapter_type() == selector)
                .collect();
            if matches.is_empty() {
                bail!(
                    "Unknown source: '{}'. Available: {}",
                    selector,
                    self.labels().join(", ")
                );
            }
            for adapter in matches {
                if !selected.iter().any(|s| s.source_id() == adapter.source_id()) {
                    selected.push(adapter.clone());
                }
            }
        }
        Ok(selected)
    }

    pub fn labels(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.source_id()).collect()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Return the count of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl SourceAdapter for Named {
        fn name(&self) -> &str {
            self.1
        }

        fn adapter_type(&self) -> &str {
            self.0
        }

        async fn fetch(&self, _cursor: Option<&str>) -> Result<FetchBatch, SourceError> {
            Ok(FetchBatch::empty())
        }
    }

    fn registry() -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(Named("http", "ol")));
        registry.register(Arc::new(Named("http", "crossref")));
        registry.register(Arc::new(Named("filesystem", "catalog")));
        registry
    }

    #[test]
    fn source_id_joins_type_and_name() {
        assert_eq!(Named("http", "ol").source_id(), "http:ol");
    }

    #[test]
    fn select_by_type_label_or_all() {
        let registry = registry();
        assert_eq!(registry.select(&[]).unwrap().len(), 3);
        assert_eq!(registry.select(&["all".into()]).unwrap().len(), 3);
        assert_eq!(registry.select(&["http".into()]).unwrap().len(), 2);

        let picked = registry
            .select(&["filesystem:catalog".into(), "filesystem".into()])
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert!(registry.select(&["git".into()]).is_err());
    }

    #[tokio::test]
    async fn in_memory_batch_streams_records() {
        let record = RawRecord::new("custom:x", "1", serde_json::json!({}), chrono::Utc::now());
        let batch = FetchBatch::from_records(vec![record.clone()], Some("c1".into()));
        let records: Vec<RawRecord> = batch.records.try_collect().await.unwrap();
        assert_eq!(records, vec![record]);
        assert_eq!(batch.next_cursor.as_deref(), Some("c1"));
    }
}
