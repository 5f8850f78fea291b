//! SQLite-backed [`Store`] implementation.
//!
//! Articles are stored as JSON in `articles.article_json`, with the
//! identifier and member indexes kept in `article_identifiers` and
//! `article_members`. Only live articles are indexed.
//!
//! Optimistic writes issue the conditional statement first, so the write
//! lock is taken before anything is read inside the transaction.

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use article_integrator_core::{ArticleRecord, IntegratedArticle, Store, StoreError};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn backend(err: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Backend(err.into())
}

fn decode_article(json: &str) -> Result<IntegratedArticle, StoreError> {
    serde_json::from_str(json).map_err(backend)
}

async fn write_record(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ArticleRecord,
) -> Result<(), StoreError> {
    let json = serde_json::to_string(record).map_err(backend)?;
    sqlx::query(
        r#"
        INSERT INTO source_records (record_key, source_id, record_json, fetched_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(record_key) DO UPDATE SET
            record_json = excluded.record_json,
            fetched_at = excluded.fetched_at
        "#,
    )
    .bind(record.record_key())
    .bind(&record.source_id)
    .bind(&json)
    .bind(record.fetched_at.timestamp())
    .execute(&mut **tx)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn stored_version(
    tx: &mut Transaction<'_, Sqlite>,
    canonical_id: &str,
) -> Result<u64, StoreError> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM articles WHERE canonical_id = ?")
            .bind(canonical_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(backend)?;
    Ok(version.unwrap_or(0) as u64)
}

async fn reindex(
    tx: &mut Transaction<'_, Sqlite>,
    article: &IntegratedArticle,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM article_identifiers WHERE canonical_id = ?")
        .bind(&article.canonical_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    sqlx::query("DELETE FROM article_members WHERE canonical_id = ?")
        .bind(&article.canonical_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;

    if !article.is_live() {
        return Ok(());
    }

    for (scheme, value) in article.identifiers() {
        sqlx::query(
            "INSERT OR IGNORE INTO article_identifiers (scheme, value, canonical_id) VALUES (?, ?, ?)",
        )
        .bind(&scheme)
        .bind(&value)
        .bind(&article.canonical_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    }
    for member in &article.members {
        sqlx::query("INSERT OR IGNORE INTO article_members (record_key, canonical_id) VALUES (?, ?)")
            .bind(member)
            .bind(&article.canonical_id)
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, canonical_id: &str) -> Result<Option<IntegratedArticle>, StoreError> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT article_json FROM articles WHERE canonical_id = ?")
                .bind(canonical_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        json.as_deref().map(decode_article).transpose()
    }

    async fn put_if_version(
        &self,
        article: &IntegratedArticle,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let article_json = serde_json::to_string(article).map_err(backend)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let written = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO articles (canonical_id, title, version, superseded_by, last_merged_at, article_json)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(canonical_id) DO NOTHING
                "#,
            )
            .bind(&article.canonical_id)
            .bind(article.title())
            .bind(article.version as i64)
            .bind(&article.superseded_by)
            .bind(article.last_merged_at.timestamp())
            .bind(&article_json)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
        } else {
            sqlx::query(
                r#"
                UPDATE articles
                SET title = ?, version = ?, superseded_by = ?, last_merged_at = ?, article_json = ?
                WHERE canonical_id = ? AND version = ?
                "#,
            )
            .bind(article.title())
            .bind(article.version as i64)
            .bind(&article.superseded_by)
            .bind(article.last_merged_at.timestamp())
            .bind(&article_json)
            .bind(&article.canonical_id)
            .bind(expected_version as i64)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
        };

        if written.rows_affected() != 1 {
            let actual = stored_version(&mut tx, &article.canonical_id).await?;
            tx.rollback().await.map_err(backend)?;
            return Err(StoreError::VersionConflict {
                canonical_id: article.canonical_id.clone(),
                expected: expected_version,
                actual,
            });
        }

        reindex(&mut tx, article).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn find_by_identifier(
        &self,
        scheme: &str,
        value: &str,
    ) -> Result<Option<IntegratedArticle>, StoreError> {
        let json: Option<String> = sqlx::query_scalar(
            r#"
            SELECT a.article_json
            FROM article_identifiers i
            JOIN articles a ON a.canonical_id = i.canonical_id
            WHERE i.scheme = ? AND i.value = ? AND a.superseded_by IS NULL
            ORDER BY a.canonical_id ASC
            LIMIT 1
            "#,
        )
        .bind(scheme)
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        json.as_deref().map(decode_article).transpose()
    }

    async fn find_by_member(
        &self,
        record_key: &str,
    ) -> Result<Option<IntegratedArticle>, StoreError> {
        let json: Option<String> = sqlx::query_scalar(
            r#"
            SELECT a.article_json
            FROM article_members m
            JOIN articles a ON a.canonical_id = m.canonical_id
            WHERE m.record_key = ? AND a.superseded_by IS NULL
            ORDER BY a.canonical_id ASC
            LIMIT 1
            "#,
        )
        .bind(record_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        json.as_deref().map(decode_article).transpose()
    }

    async fn upsert_records(&self, records: &[ArticleRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for record in records {
            write_record(&mut tx, record).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn replace_source_records(
        &self,
        source_id: &str,
        records: &[ArticleRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let removed = sqlx::query("DELETE FROM source_records WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();
        for record in records {
            write_record(&mut tx, record).await?;
        }
        tx.commit().await.map_err(backend)?;
        tracing::debug!(
            source = %source_id,
            removed,
            written = records.len(),
            "replaced ledger slice"
        );
        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<ArticleRecord>, StoreError> {
        let rows = sqlx::query("SELECT record_json FROM source_records ORDER BY record_key ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| {
                let json: String = row.get("record_json");
                serde_json::from_str(&json).map_err(backend)
            })
            .collect()
    }

    async fn get_cursor(&self, source_id: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)
    }

    async fn set_cursor(&self, source_id: &str, cursor: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(source_id)
        .bind(cursor)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn count_articles(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE superseded_by IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use article_integrator_core::models::fields;
    use article_integrator_core::FieldValue;
    use chrono::{TimeZone, Utc};
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> SqliteStore {
        let pool = db::connect_path(&tmp.path().join("store.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn article(id: &str, version: u64, isbn: &str, members: &[&str]) -> IntegratedArticle {
        IntegratedArticle {
            canonical_id: id.into(),
            fields: BTreeMap::from([
                (fields::TITLE.to_string(), FieldValue::Text("Dune".into())),
                (fields::identifier("isbn"), FieldValue::Text(isbn.into())),
            ]),
            provenance: BTreeMap::from([(fields::TITLE.to_string(), "http:ol".to_string())]),
            contributing_sources: BTreeSet::from(["http:ol".to_string()]),
            members: members.iter().map(|m| m.to_string()).collect(),
            version,
            last_merged_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            superseded_by: None,
        }
    }

    fn record(source: &str, id: &str) -> ArticleRecord {
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
            source_native_id: id.into(),
            fetched_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn articles_round_trip_with_optimistic_versions() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let first = article("art_1", 1, "9780441013593", &["http:ol/1"]);

        store.put_if_version(&first, 0).await.unwrap();
        assert_eq!(store.get("art_1").await.unwrap(), Some(first.clone()));

        let err = store.put_if_version(&first, 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 0, actual: 1, .. }
        ));

        let err = store
            .put_if_version(&article("art_1", 3, "x", &[]), 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 2, actual: 1, .. }
        ));

        store
            .put_if_version(&article("art_1", 2, "9780441013593", &["http:ol/1"]), 1)
            .await
            .unwrap();
        assert_eq!(store.get("art_1").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn lookups_only_see_live_articles() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store
            .put_if_version(&article("art_a", 1, "111", &["fs:x/1"]), 0)
            .await
            .unwrap();

        let found = store.find_by_identifier("isbn", "111").await.unwrap();
        assert_eq!(found.map(|a| a.canonical_id).as_deref(), Some("art_a"));
        assert!(store.find_by_member("fs:x/1").await.unwrap().is_some());
        assert_eq!(store.count_articles().await.unwrap(), 1);

        let mut gone = article("art_a", 2, "111", &["fs:x/1"]);
        gone.superseded_by = Some("art_b".into());
        store.put_if_version(&gone, 1).await.unwrap();

        assert!(store.find_by_identifier("isbn", "111").await.unwrap().is_none());
        assert!(store.find_by_member("fs:x/1").await.unwrap().is_none());
        assert_eq!(store.count_articles().await.unwrap(), 0);
        assert_eq!(
            store.get("art_a").await.unwrap().unwrap().superseded_by.as_deref(),
            Some("art_b")
        );
    }

    #[tokio::test]
    async fn ledger_and_cursors() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;

        store
            .upsert_records(&[record("http:ol", "2"), record("fs:cat", "1")])
            .await
            .unwrap();
        let mut newer = record("http:ol", "2");
        newer.title = "Dune Messiah".into();
        store.upsert_records(&[newer.clone()]).await.unwrap();

        let records = store.load_records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_key(), "fs:cat/1");
        assert_eq!(records[1], newer);

        assert_eq!(store.get_cursor("http:ol").await.unwrap(), None);
        store.set_cursor("http:ol", "p3").await.unwrap();
        store.set_cursor("http:ol", "p4").await.unwrap();
        assert_eq!(store.get_cursor("http:ol").await.unwrap().as_deref(), Some("p4"));
    }

    #[tokio::test]
    async fn full_fetch_replaces_only_its_own_ledger_slice() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store
            .upsert_records(&[record("http:ol", "gone"), record("http:ol", "1"), record("fs:cat", "1")])
            .await
            .unwrap();

        let mut updated = record("http:ol", "1");
        updated.title = "Dune Messiah".into();
        store
            .replace_source_records("http:ol", &[updated.clone(), record("http:ol", "2")])
            .await
            .unwrap();

        let records = store.load_records().await.unwrap();
        let keys: Vec<String> = records.iter().map(|r| r.record_key()).collect();
        assert_eq!(keys, vec!["fs:cat/1", "http:ol/1", "http:ol/2"]);
        assert_eq!(records[1], updated);
    }
}
