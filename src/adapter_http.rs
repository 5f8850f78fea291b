//! HTTP source adapter for paged JSON APIs.
//!
//! Each page is requested with
//! `GET {url}?{page_size_param}={page_size}[&{cursor_param}={cursor}]`
//! and the configured headers. The response body must be JSON:
//!
//! ```json
//! { "records": [ { "id": "ol-1", "title": "Dune", ... } ], "next": "p2" }
//! ```
//!
//! `records_pointer` and `next_pointer` (JSON pointers) locate the record
//! array and the next-page token, so most providers can be consumed
//! without code. A missing, null or empty token ends pagination.
//!
//! Transport failures, timeouts and non-success statuses are
//! [`SourceError::Unavailable`]; bodies of the wrong shape are
//! [`SourceError::Protocol`]. A record without a usable `id_field` is
//! dropped on its own and reported as rejected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use article_integrator_core::models::record_key;
use article_integrator_core::{RawRecord, SourceError};

use crate::config::HttpSourceConfig;
use crate::traits::{FetchBatch, RejectedRecord, SourceAdapter};

pub struct HttpAdapter {
    name: String,
    config: HttpSourceConfig,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(name: &str, config: HttpSourceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("article-integrator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            name: name.to_string(),
            config,
            client,
        })
    }
}

#[async_trait]
impl SourceAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> &str {
        "http"
    }

    fn description(&self) -> &str {
        "Paged JSON API"
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<FetchBatch, SourceError> {
        let source_id = self.source_id();

        let mut query = vec![(
            self.config.page_size_param.clone(),
            self.config.page_size.to_string(),
        )];
        if let Some(token) = cursor {
            query.push((self.config.cursor_param.clone(), token.to_string()));
        }

        let mut request = self.client.get(&self.config.url).query(&query);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::unavailable(&source_id, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::unavailable(
                &source_id,
                format!("HTTP {} from {}", status, self.config.url),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::protocol(&source_id, format!("invalid JSON body: {}", e)))?;

        let page = parse_page(&body, &self.config)
            .map_err(|reason| SourceError::protocol(&source_id, reason))?;

        let fetched_at = Utc::now();
        let position = cursor.unwrap_or("start");
        let mut records = Vec::with_capacity(page.records.len());
        let mut rejected = Vec::new();
        for (idx, payload) in page.records.into_iter().enumerate() {
            let Some(native_id) = record_id(&payload, &self.config.id_field) else {
                let key = record_key(&source_id, &format!("#{}:{}", position, idx));
                tracing::warn!(record = %key, id_field = %self.config.id_field, "dropping record without an id");
                rejected.push(RejectedRecord {
                    record_key: key,
                    reason: format!("record {} has no usable `{}` field", idx, self.config.id_field),
                });
                continue;
            };
            let at = record_timestamp(&payload).unwrap_or(fetched_at);
            records.push(RawRecord::new(&source_id, native_id, payload, at));
        }

        Ok(FetchBatch::from_records(records, page.next).with_rejected(rejected))
    }
}

#[derive(Debug, PartialEq)]
struct Page {
    records: Vec<Value>,
    next: Option<String>,
}

fn parse_page(body: &Value, config: &HttpSourceConfig) -> Result<Page, String> {
    let records = match body.pointer(&config.records_pointer) {
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(format!("`{}` is not an array", config.records_pointer)),
        None => return Err(format!("`{}` not found in response", config.records_pointer)),
    };

    let next = match body.pointer(&config.next_pointer) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(format!(
                "`{}` must be a string or number, got {}",
                config.next_pointer, other
            ))
        }
    };

    Ok(Page { records, next })
}

fn record_id(payload: &Value, id_field: &str) -> Option<String> {
    match payload.get(id_field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Provider-side modification time, when the record carries one.
fn record_timestamp(payload: &Value) -> Option<DateTime<Utc>> {
    ["updated_at", "modified", "last_modified"]
        .iter()
        .filter_map(|k| payload.get(*k)?.as_str())
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
