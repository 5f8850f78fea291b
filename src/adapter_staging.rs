//! Staging source adapter.
//!
//! Upstream processors drop article documents into the local
//! `staging_articles` table and flip their `status` to `processed` when
//! they are ready. This adapter feeds ready rows into the pipeline and,
//! once the run has persisted them, deletes them from staging.
//!
//! The cursor is the last staged id seen (keyset pagination over the
//! primary key). It only pages within a run and is never checkpointed:
//! acknowledged rows are deleted, so every run starts from the top. Any
//! `status` key inside the payload is dropped: status is staging
//! bookkeeping, not article data.
//!
//! Acknowledging only deletes a row that still holds what was fetched. A
//! document re-staged in between stays for the next run.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use article_integrator_core::{RawRecord, SourceError};

use crate::config::StagingSourceConfig;
use crate::traits::{FetchBatch, SourceAdapter};

const PAGE_SIZE: i64 = 500;

/// `updated_at` and payload of every row handed out, by id.
type Delivered = HashMap<String, (i64, String)>;

pub struct StagingAdapter {
    name: String,
    config: StagingSourceConfig,
    pool: SqlitePool,
    only: Option<Vec<String>>,
    delivered: Mutex<Delivered>,
}

impl StagingAdapter {
    pub fn new(name: &str, config: StagingSourceConfig, pool: SqlitePool) -> Self {
        Self {
            name: name.to_string(),
            config,
            pool,
            only: None,
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Restrict the adapter to the given staged ids.
    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.only = Some(ids);
        self
    }

    fn unavailable(&self, err: impl ToString) -> SourceError {
        SourceError::unavailable(self.source_id(), err)
    }

    fn delivered(&self) -> Result<MutexGuard<'_, Delivered>, SourceError> {
        self.delivered
            .lock()
            .map_err(|_| self.unavailable("staging adapter state poisoned"))
    }
}

#[async_trait]
impl SourceAdapter for StagingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> &str {
        "staging"
    }

    fn description(&self) -> &str {
        "Documents staged in the local staging_articles table"
    }

    fn drains(&self) -> bool {
        true
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<FetchBatch, SourceError> {
        let mut sql = String::from(
            "SELECT id, payload_json, updated_at FROM staging_articles WHERE status = ? AND id > ?",
        );
        if let Some(ids) = &self.only {
            if ids.is_empty() {
                return Ok(FetchBatch::empty());
            }
            sql.push_str(" AND id IN (");
            sql.push_str(&vec!["?"; ids.len()].join(", "));
            sql.push(')');
        }
        sql.push_str(" ORDER BY id ASC LIMIT ?");

        let mut query = sqlx::query(&sql)
            .bind(&self.config.status)
            .bind(cursor.unwrap_or(""));
        for id in self.only.iter().flatten() {
            query = query.bind(id);
        }
        let rows = query
            .bind(PAGE_SIZE)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.unavailable(e))?;

        let source_id = self.source_id();
        let mut records = Vec::with_capacity(rows.len());
        let mut delivered = self.delivered()?;
        for row in &rows {
            let id: String = row.get("id");
            let payload_json: String = row.get("payload_json");
            let updated_at: i64 = row.get("updated_at");
            delivered.insert(id.clone(), (updated_at, payload_json.clone()));

            let payload = match serde_json::from_str::<Value>(&payload_json) {
                Ok(Value::Object(mut map)) => {
                    map.remove("status");
                    Value::Object(map)
                }
                Ok(other) => other,
                Err(e) => {
                    tracing::warn!(source = %source_id, id = %id, error = %e, "staged payload is not valid JSON");
                    Value::Null
                }
            };
            let fetched_at = Utc
                .timestamp_opt(updated_at, 0)
                .single()
                .unwrap_or_else(Utc::now);
            records.push(RawRecord::new(&source_id, id, payload, fetched_at));
        }
        drop(delivered);

        let next_cursor = records
            .last()
            .map(|r| r.source_native_id.clone())
            .or_else(|| cursor.map(str::to_string));
        Ok(FetchBatch::from_records(records, next_cursor))
    }

    async fn acknowledge(&self, native_ids: &[String]) -> Result<(), SourceError> {
        let fetched: Vec<(String, i64, String)> = {
            let delivered = self.delivered()?;
            native_ids
                .iter()
                .filter_map(|id| {
                    let (updated_at, payload) = delivered.get(id)?;
                    Some((id.clone(), *updated_at, payload.clone()))
                })
                .collect()
        };

        let mut tx = self.pool.begin().await.map_err(|e| self.unavailable(e))?;
        let mut removed = 0u64;
        for (id, updated_at, payload) in &fetched {
            let result = sqlx::query(
                "DELETE FROM staging_articles WHERE id = ? AND status = ? AND updated_at = ? AND payload_json = ?",
            )
            .bind(id)
            .bind(&self.config.status)
            .bind(updated_at)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.unavailable(e))?;
            if result.rows_affected() == 0 {
                tracing::debug!(source = %self.source_id(), id = %id, "staged row changed since fetch, keeping it");
            }
            removed += result.rows_affected();
        }
        tx.commit().await.map_err(|e| self.unavailable(e))?;

        let mut delivered = self.delivered()?;
        for (id, _, _) in &fetched {
            delivered.remove(id);
        }
        tracing::debug!(source = %self.source_id(), removed, "removed promoted staging rows");
        Ok(())
    }
}

/// Insert or replace a staged document.
pub async fn stage_document(
    pool: &SqlitePool,
    id: &str,
    payload: &Value,
    status: &str,
) -> anyhow::Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO staging_articles (id, status, payload_json, staged_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            payload_json = excluded.payload_json,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(serde_json::to_string(payload)?)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Status of a staged document, or `None` if it is not staged.
pub async fn staged_status(pool: &SqlitePool, id: &str) -> anyhow::Result<Option<String>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM staging_articles WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(status)
}
