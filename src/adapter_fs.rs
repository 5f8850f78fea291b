//! Filesystem source adapter.
//!
//! Walks a local directory and reads article records from JSON files:
//!
//! - `*.json`: a single record object, or an array of record objects
//! - `*.jsonl`: one record object per line
//!
//! The native id of a record is its `id` field when present, otherwise
//! `"<relative path>#<index>"`. A record's `fetched_at` is the modification
//! time of its file, so re-reading an unchanged file yields identical
//! records.
//!
//! The cursor is a modification-time watermark (unix seconds): only files
//! modified after it are read.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::path::Path;
use walkdir::WalkDir;

use article_integrator_core::{RawRecord, SourceError};

use crate::config::FilesystemSourceConfig;
use crate::traits::{FetchBatch, SourceAdapter};

#[derive(Clone)]
pub struct FilesystemAdapter {
    name: String,
    config: FilesystemSourceConfig,
    include: GlobSet,
    exclude: GlobSet,
}

impl FilesystemAdapter {
    pub fn new(name: &str, config: FilesystemSourceConfig) -> anyhow::Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        Ok(Self {
            name: name.to_string(),
            config,
            include,
            exclude,
        })
    }

    fn scan(&self, watermark: i64) -> Result<(Vec<RawRecord>, i64), SourceError> {
        let source_id = self.source_id();
        let root = &self.config.root;
        if !root.exists() {
            return Err(SourceError::unavailable(
                &source_id,
                format!("root does not exist: {}", root.display()),
            ));
        }

        let mut records = Vec::new();
        let mut newest = watermark;

        let walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|e| SourceError::unavailable(&source_id, e))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let modified =
                modified_secs(path).map_err(|e| SourceError::unavailable(&source_id, e))?;
            if modified <= watermark {
                continue;
            }
            newest = newest.max(modified);

            let fetched_at = Utc
                .timestamp_opt(modified, 0)
                .single()
                .unwrap_or_else(Utc::now);
            records.extend(self.read_file(path, &rel_str, fetched_at)?);
        }

        Ok((records, newest))
    }

    fn read_file(
        &self,
        path: &Path,
        rel_str: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let source_id = self.source_id();
        let body = std::fs::read_to_string(path)
            .map_err(|e| SourceError::unavailable(&source_id, format!("{}: {}", rel_str, e)))?;

        let payloads: Vec<Value> = if rel_str.ends_with(".jsonl") {
            body.lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .filter_map(|(n, line)| match serde_json::from_str(line) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::warn!(
                            source = %source_id,
                            file = rel_str,
                            line = n + 1,
                            error = %e,
                            "skipping malformed JSON line"
                        );
                        None
                    }
                })
                .collect()
        } else {
            match serde_json::from_str(&body) {
                Ok(Value::Array(items)) => items,
                Ok(value) => vec![value],
                Err(e) => {
                    tracing::warn!(
                        source = %source_id,
                        file = rel_str,
                        error = %e,
                        "skipping malformed JSON file"
                    );
                    Vec::new()
                }
            }
        };

        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(idx, payload)| {
                let native_id =
                    native_id(&payload).unwrap_or_else(|| format!("{}#{}", rel_str, idx));
                RawRecord::new(&source_id, native_id, payload, fetched_at)
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for FilesystemAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> &str {
        "filesystem"
    }

    fn description(&self) -> &str {
        "JSON / JSON Lines files under a local directory"
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<FetchBatch, SourceError> {
        let watermark = match cursor {
            None => i64::MIN,
            Some(c) => c.parse::<i64>().map_err(|_| {
                SourceError::protocol(self.source_id(), format!("invalid cursor '{}'", c))
            })?,
        };

        let scanner = self.clone();
        let (records, newest) = tokio::task::spawn_blocking(move || scanner.scan(watermark))
            .await
            .map_err(|e| SourceError::unavailable(self.source_id(), e))??;
        let next_cursor = (newest != i64::MIN).then(|| newest.to_string());
        Ok(FetchBatch::from_records(records, next_cursor))
    }
}

/// The record's own `id` field, when it is a non-empty string or a number.
pub(crate) fn native_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn modified_secs(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    Ok(modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64)
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
