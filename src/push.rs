//! Push-triggered promotion of staged documents.
//!
//! An upstream processor announces a finished document with a push
//! envelope:
//!
//! ```json
//! { "message": { "data": "<base64 of the staged document id>" } }
//! ```
//!
//! [`promote`] runs the pipeline restricted to that one staged document.
//! Once its article is persisted the staging row is deleted. Documents that
//! are missing or not yet `processed` are logged and left alone.

use std::sync::Arc;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use article_integrator_core::{models::record_key, Store};

use crate::adapter_staging::{staged_status, StagingAdapter};
use crate::config::{Config, StagingSourceConfig};
use crate::db;
use crate::pipeline::{run_integration, RunOptions, RunResult};
use crate::runs;
use crate::sqlite_store::SqliteStore;
use crate::traits::SourceAdapter;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(String),
    #[error("envelope has no message.data string")]
    MissingData,
    #[error("message.data is not valid base64: {0}")]
    Base64(String),
    #[error("message.data does not decode to UTF-8 text")]
    NotUtf8,
    #[error("message.data decodes to an empty document id")]
    EmptyId,
}

/// Extract the staged document id from a push envelope.
pub fn decode_envelope(body: &str) -> Result<String, EnvelopeError> {
    let envelope: Value =
        serde_json::from_str(body).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    let data = envelope
        .pointer("/message/data")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingData)?;

    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| EnvelopeError::Base64(e.to_string()))?;
    let id = String::from_utf8(bytes).map_err(|_| EnvelopeError::NotUtf8)?;
    let id = id.trim();
    if id.is_empty() {
        return Err(EnvelopeError::EmptyId);
    }
    Ok(id.to_string())
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromoteOutcome {
    Promoted {
        doc_id: String,
        canonical_id: Option<String>,
        result: Box<RunResult>,
    },
    NotFound {
        doc_id: String,
    },
    NotReady {
        doc_id: String,
        status: String,
    },
}

/// The staging source promotions run under: the first configured one, or a
/// default `staging:inbox`.
fn staging_source(config: &Config) -> (String, StagingSourceConfig) {
    config
        .sources
        .staging
        .iter()
        .next()
        .map(|(name, cfg)| (name.clone(), cfg.clone()))
        .unwrap_or_else(|| ("inbox".to_string(), StagingSourceConfig::default()))
}

/// Promote one staged document into the integrated dataset.
pub async fn promote(config: &Config, doc_id: &str) -> Result<PromoteOutcome> {
    let pool = db::connect(config).await?;
    let (name, staging) = staging_source(config);

    let outcome = match staged_status(&pool, doc_id).await? {
        None => {
            tracing::warn!(doc_id, "staged document not found, nothing to promote");
            PromoteOutcome::NotFound {
                doc_id: doc_id.to_string(),
            }
        }
        Some(status) if status != staging.status => {
            tracing::info!(doc_id, status = %status, "staged document is not ready");
            PromoteOutcome::NotReady {
                doc_id: doc_id.to_string(),
                status,
            }
        }
        Some(_) => {
            let adapter = StagingAdapter::new(&name, staging, pool.clone())
                .with_ids(vec![doc_id.to_string()]);
            let key = record_key(&adapter.source_id(), doc_id);
            let store = Arc::new(SqliteStore::new(pool.clone()));

            let mut pipeline = config.pipeline_config();
            pipeline.incremental = false;

            let started = chrono::Utc::now();
            let sources: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(adapter)];
            let result = match run_integration(
                sources,
                store.clone(),
                &pipeline,
                RunOptions::default(),
            )
            .await
            {
                Ok(result) => result,
                Err(e) => {
                    runs::record_failure(&pool, started, &e.to_string()).await?;
                    pool.close().await;
                    return Err(e.into());
                }
            };
            runs::record_run(&pool, &result).await?;

            let canonical_id = store.find_by_member(&key).await?.map(|a| a.canonical_id);
            tracing::info!(doc_id, canonical_id = ?canonical_id, "staged document promoted");
            PromoteOutcome::Promoted {
                doc_id: doc_id.to_string(),
                canonical_id,
                result: Box::new(result),
            }
        }
    };

    pool.close().await;
    Ok(outcome)
}

/// CLI entry point for `push`: read an envelope, promote, print the outcome.
pub async fn run_push(config: &Config, body: &str) -> Result<()> {
    let doc_id = decode_envelope(body)?;
    match promote(config, &doc_id).await? {
        PromoteOutcome::Promoted {
            doc_id,
            canonical_id,
            result,
        } => {
            println!(
                "promoted {} -> {}",
                doc_id,
                canonical_id.as_deref().unwrap_or("(not integrated)")
            );
            if !result.skipped.is_empty() {
                for skipped in &result.skipped {
                    println!("  skipped {}: {}", skipped.record_key, skipped.reason);
                }
            }
        }
        PromoteOutcome::NotFound { doc_id } => {
            println!("{} not found in staging; ignored", doc_id)
        }
        PromoteOutcome::NotReady { doc_id, status } => println!(
            "{} has status '{}' (expected '{}'); ignored",
            doc_id,
            status,
            staging_source(config).1.status
        ),
    }
    Ok(())
}
