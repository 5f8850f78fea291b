//! Run history.
//!
//! Every non-dry run leaves one row in `runs`: its id, start and finish
//! time, final stage and the full [`RunResult`] as JSON. Runs that abort
//! on a store failure are recorded with stage `failed` and the error.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::pipeline::{RunResult, RunStage};

pub async fn record_run(pool: &SqlitePool, result: &RunResult) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (run_id, started_at, finished_at, stage, result_json)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(run_id) DO NOTHING
        "#,
    )
    .bind(&result.run_id)
    .bind(result.started_at.timestamp())
    .bind(result.finished_at.timestamp())
    .bind(result.final_stage.as_str())
    .bind(serde_json::to_string(result)?)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_failure(
    pool: &SqlitePool,
    started_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO runs (run_id, started_at, finished_at, stage, result_json) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(started_at.timestamp())
    .bind(Utc::now().timestamp())
    .bind(RunStage::Failed.as_str())
    .bind(serde_json::json!({ "error": error }).to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// One row of run history.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub stage: String,
    pub result: serde_json::Value,
}

/// Most recent runs first.
pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<RunRow>> {
    let rows = sqlx::query(
        "SELECT run_id, started_at, finished_at, stage, result_json FROM runs ORDER BY started_at DESC, run_id ASC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let json: String = row.get("result_json");
            RunRow {
                run_id: row.get("run_id"),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                stage: row.get("stage"),
                result: serde_json::from_str(&json).unwrap_or(serde_json::Value::Null),
            }
        })
        .collect())
}
