//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All state lives behind one `std::sync::RwLock`, so every operation is
//! atomic with respect to the others. Identifier and member indexes only
//! cover live articles.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{ArticleRecord, IntegratedArticle};

use super::Store;

#[derive(Default)]
struct State {
    articles: HashMap<String, IntegratedArticle>,
    by_identifier: HashMap<(String, String), BTreeSet<String>>,
    by_member: HashMap<String, BTreeSet<String>>,
    records: BTreeMap<String, ArticleRecord>,
    cursors: HashMap<String, String>,
}

impl State {
    fn unindex(&mut self, article: &IntegratedArticle) {
        for (scheme, value) in article.identifiers() {
            if let Some(ids) = self.by_identifier.get_mut(&(scheme, value)) {
                ids.remove(&article.canonical_id);
            }
        }
        for member in &article.members {
            if let Some(ids) = self.by_member.get_mut(member) {
                ids.remove(&article.canonical_id);
            }
        }
    }

    fn index(&mut self, article: &IntegratedArticle) {
        if !article.is_live() {
            return;
        }
        for key in article.identifiers() {
            self.by_identifier
                .entry(key)
                .or_default()
                .insert(article.canonical_id.clone());
        }
        for member in &article.members {
            self.by_member
                .entry(member.clone())
                .or_default()
                .insert(article.canonical_id.clone());
        }
    }

    fn first_live(&self, ids: Option<&BTreeSet<String>>) -> Option<IntegratedArticle> {
        ids?.iter().find_map(|id| self.articles.get(id)).cloned()
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    /// Every stored article, live or superseded, ordered by id.
    pub fn articles(&self) -> Result<Vec<IntegratedArticle>, StoreError> {
        let state = self.read()?;
        let mut all: Vec<_> = state.articles.values().cloned().collect();
        all.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        Ok(all)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, canonical_id: &str) -> Result<Option<IntegratedArticle>, StoreError> {
        Ok(self.read()?.articles.get(canonical_id).cloned())
    }

    async fn put_if_version(
        &self,
        article: &IntegratedArticle,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let actual = state
            .articles
            .get(&article.canonical_id)
            .map(|a| a.version)
            .unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                canonical_id: article.canonical_id.clone(),
                expected: expected_version,
                actual,
            });
        }

        if let Some(previous) = state.articles.remove(&article.canonical_id) {
            state.unindex(&previous);
        }
        state.index(article);
        state
            .articles
            .insert(article.canonical_id.clone(), article.clone());
        Ok(())
    }

    async fn find_by_identifier(
        &self,
        scheme: &str,
        value: &str,
    ) -> Result<Option<IntegratedArticle>, StoreError> {
        let state = self.read()?;
        let key = (scheme.to_string(), value.to_string());
        Ok(state.first_live(state.by_identifier.get(&key)))
    }

    async fn find_by_member(
        &self,
        record_key: &str,
    ) -> Result<Option<IntegratedArticle>, StoreError> {
        let state = self.read()?;
        Ok(state.first_live(state.by_member.get(record_key)))
    }

    async fn upsert_records(&self, records: &[ArticleRecord]) -> Result<(), StoreError> {
        let mut state = self.write()?;
        for record in records {
            state.records.insert(record.record_key(), record.clone());
        }
        Ok(())
    }

    async fn replace_source_records(
        &self,
        source_id: &str,
        records: &[ArticleRecord],
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.records.retain(|_, r| r.source_id != source_id);
        for record in records {
            state.records.insert(record.record_key(), record.clone());
        }
        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<ArticleRecord>, StoreError> {
        Ok(self.read()?.records.values().cloned().collect())
    }

    async fn get_cursor(&self, source_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read()?.cursors.get(source_id).cloned())
    }

    async fn set_cursor(&self, source_id: &str, cursor: &str) -> Result<(), StoreError> {
        self.write()?
            .cursors
            .insert(source_id.to_string(), cursor.to_string());
        Ok(())
    }

    async fn count_articles(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.articles.values().filter(|a| a.is_live()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fields, FieldValue};
    use chrono::Utc;

    fn article(id: &str, version: u64, isbn: &str, members: &[&str]) -> IntegratedArticle {
        IntegratedArticle {
            canonical_id: id.into(),
            fields: BTreeMap::from([
                (fields::TITLE.to_string(), FieldValue::Text("Dune".into())),
                (fields::identifier("isbn"), FieldValue::Text(isbn.into())),
            ]),
            provenance: BTreeMap::new(),
            contributing_sources: BTreeSet::new(),
            members: members.iter().map(|m| m.to_string()).collect(),
            version,
            last_merged_at: Utc::now(),
            superseded_by: None,
        }
    }

    #[tokio::test]
    async fn put_if_version_enforces_expected_version() {
        let store = InMemoryStore::new();
        store.put_if_version(&article("art_1", 1, "1", &[]), 0).await.unwrap();

        let err = store
            .put_if_version(&article("art_1", 1, "1", &[]), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 0, actual: 1, .. }
        ));

        store.put_if_version(&article("art_1", 2, "1", &[]), 1).await.unwrap();
        assert_eq!(store.get("art_1").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn indexes_follow_the_latest_version() {
        let store = InMemoryStore::new();
        store
            .put_if_version(&article("art_1", 1, "111", &["a/1"]), 0)
            .await
            .unwrap();
        store
            .put_if_version(&article("art_1", 2, "222", &["a/2"]), 1)
            .await
            .unwrap();

        assert!(store.find_by_identifier("isbn", "111").await.unwrap().is_none());
        assert!(store.find_by_member("a/1").await.unwrap().is_none());
        assert_eq!(
            store
                .find_by_identifier("isbn", "222")
                .await
                .unwrap()
                .map(|a| a.canonical_id),
            Some("art_1".to_string())
        );
        assert!(store.find_by_member("a/2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn superseded_articles_are_not_found_by_lookups() {
        let store = InMemoryStore::new();
        store
            .put_if_version(&article("art_old", 1, "111", &["a/1"]), 0)
            .await
            .unwrap();
        let mut gone = article("art_old", 2, "111", &["a/1"]);
        gone.superseded_by = Some("art_new".into());
        store.put_if_version(&gone, 1).await.unwrap();

        assert!(store.find_by_identifier("isbn", "111").await.unwrap().is_none());
        assert!(store.find_by_member("a/1").await.unwrap().is_none());
        assert!(store.get("art_old").await.unwrap().is_some());
        assert_eq!(store.count_articles().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cursors_and_ledger_round_trip() {
        let store = InMemoryStore::new();
        assert_eq!(store.get_cursor("fs:a").await.unwrap(), None);
        store.set_cursor("fs:a", "42").await.unwrap();
        assert_eq!(store.get_cursor("fs:a").await.unwrap().as_deref(), Some("42"));
        assert!(store.load_records().await.unwrap().is_empty());
    }

    fn ledger_entry(source: &str, native: &str) -> ArticleRecord {
        ArticleRecord {
            title: "Dune".into(),
            title_key: "dune".into(),
            authors: vec!["Frank Herbert".into()],
            identifiers: BTreeMap::new(),
            published_date: None,
            publisher: None,
            language: None,
            summary: None,
            source_id: source.into(),
            source_native_id: native.into(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn replacing_a_source_slice_leaves_other_sources() {
        let store = InMemoryStore::new();
        store
            .upsert_records(&[
                ledger_entry("fs:a", "old"),
                ledger_entry("fs:a", "kept"),
                ledger_entry("fs:b", "1"),
            ])
            .await
            .unwrap();

        store
            .replace_source_records("fs:a", &[ledger_entry("fs:a", "kept"), ledger_entry("fs:a", "new")])
            .await
            .unwrap();

        let keys: Vec<String> = store
            .load_records()
            .await
            .unwrap()
            .iter()
            .map(|r| r.record_key())
            .collect();
        assert_eq!(keys, vec!["fs:a/kept", "fs:a/new", "fs:b/1"]);

        store.replace_source_records("fs:b", &[]).await.unwrap();
        assert_eq!(store.load_records().await.unwrap().len(), 2);
    }
}
