//! Storage abstraction for Article Integrator.
//!
//! The [`Store`] trait defines every persistence operation the integration
//! pipeline needs, enabling pluggable backends (SQLite in the application
//! crate, [`memory::InMemoryStore`] for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{ArticleRecord, IntegratedArticle};

/// Abstract storage backend for integrated articles.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](Store::get) | Fetch an article by canonical id |
/// | [`put_if_version`](Store::put_if_version) | Optimistic write |
/// | [`find_by_identifier`](Store::find_by_identifier) | Live article carrying an identifier |
/// | [`find_by_member`](Store::find_by_member) | Live article that folded a record |
/// | [`upsert_records`](Store::upsert_records) / [`replace_source_records`](Store::replace_source_records) / [`load_records`](Store::load_records) | Record ledger |
/// | [`get_cursor`](Store::get_cursor) / [`set_cursor`](Store::set_cursor) | Per-source checkpoints |
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, canonical_id: &str) -> Result<Option<IntegratedArticle>, StoreError>;

    /// Write `article` if the stored version equals `expected_version`.
    ///
    /// `expected_version == 0` means the article must not exist yet. On
    /// mismatch nothing is written and [`StoreError::VersionConflict`] is
    /// returned.
    async fn put_if_version(
        &self,
        article: &IntegratedArticle,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// The live article carrying `value` under `scheme`. When several do,
    /// the smallest canonical id is returned.
    async fn find_by_identifier(
        &self,
        scheme: &str,
        value: &str,
    ) -> Result<Option<IntegratedArticle>, StoreError>;

    /// The live article whose members include `record_key`.
    async fn find_by_member(
        &self,
        record_key: &str,
    ) -> Result<Option<IntegratedArticle>, StoreError>;

    /// Insert or replace ledger entries, keyed by record key.
    async fn upsert_records(&self, records: &[ArticleRecord]) -> Result<(), StoreError>;

    /// Make `records` the whole ledger slice of `source_id`: its entries
    /// with other keys are removed.
    async fn replace_source_records(
        &self,
        source_id: &str,
        records: &[ArticleRecord],
    ) -> Result<(), StoreError>;

    /// Every ledger entry, ordered by record key.
    async fn load_records(&self) -> Result<Vec<ArticleRecord>, StoreError>;

    async fn get_cursor(&self, source_id: &str) -> Result<Option<String>, StoreError>;

    async fn set_cursor(&self, source_id: &str, cursor: &str) -> Result<(), StoreError>;

    /// Number of live articles.
    async fn count_articles(&self) -> Result<u64, StoreError>;
}
