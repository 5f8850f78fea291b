//! Concurrent source fetching with timeouts, retries and cancellation.
//!
//! Every selected adapter is drained on its own tokio task; a semaphore
//! caps how many run at once. Each page attempt (the `fetch` call plus
//! draining its record stream) is bounded by the fetch timeout. Failed
//! attempts are retried with exponential backoff; once a source exhausts
//! its attempts it is reported as failed and the records it produced in
//! this run are dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tokio::sync::Semaphore;

use article_integrator_core::{RawRecord, SourceError};

use crate::cancel::CancellationToken;
use crate::progress::{RunProgressEvent, RunProgressReporter};
use crate::traits::{RejectedRecord, SourceAdapter};

/// Exponential backoff between fetch attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per page, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// What a source produced during one run.
#[derive(Debug)]
pub enum FetchOutcome {
    Completed {
        records: Vec<RawRecord>,
        /// Entries the adapter dropped instead of failing the page.
        rejected: Vec<RejectedRecord>,
        /// Cursor to resume from next time.
        cursor: Option<String>,
        pages: u64,
    },
    Failed(SourceError),
    Cancelled,
}

#[derive(Debug)]
pub struct SourceFetch {
    pub source_id: String,
    pub outcome: FetchOutcome,
}

/// One adapter to drain, starting after `cursor`.
pub struct FetchRequest {
    pub adapter: Arc<dyn SourceAdapter>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// Drain every requested source. Results come back in request order.
pub async fn fetch_all(
    requests: Vec<FetchRequest>,
    settings: &FetchSettings,
    cancel: &CancellationToken,
    progress: Arc<dyn RunProgressReporter>,
) -> Vec<SourceFetch> {
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));

    let mut tasks = Vec::with_capacity(requests.len());
    for request in requests {
        let source_id = request.adapter.source_id();
        let semaphore = semaphore.clone();
        let settings = settings.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();

        let task = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return FetchOutcome::Cancelled,
            };
            fetch_source(
                request.adapter.as_ref(),
                request.cursor,
                &settings,
                &cancel,
                progress.as_ref(),
            )
            .await
        });
        tasks.push((source_id, task));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (source_id, task) in tasks {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(source = %source_id, error = %e, "fetch task failed");
                FetchOutcome::Failed(SourceError::unavailable(
                    &source_id,
                    format!("fetch task failed: {}", e),
                ))
            }
        };
        if let FetchOutcome::Failed(err) = &outcome {
            progress.report(RunProgressEvent::SourceFailed {
                source: source_id.clone(),
                reason: err.to_string(),
            });
        }
        results.push(SourceFetch { source_id, outcome });
    }
    results
}

/// Follow a source's cursors until it stops advancing.
pub async fn fetch_source(
    adapter: &dyn SourceAdapter,
    start: Option<String>,
    settings: &FetchSettings,
    cancel: &CancellationToken,
    progress: &dyn RunProgressReporter,
) -> FetchOutcome {
    let source_id = adapter.source_id();
    let mut cursor = start;
    let mut records = Vec::new();
    let mut rejected = Vec::new();
    let mut pages = 0u64;

    loop {
        if cancel.is_cancelled() {
            return FetchOutcome::Cancelled;
        }

        let page = match fetch_page_with_retry(adapter, cursor.as_deref(), settings, cancel).await
        {
            Ok(Some(page)) => page,
            Ok(None) => return FetchOutcome::Cancelled,
            Err(err) => {
                tracing::warn!(source = %source_id, pages, error = %err, "source failed");
                return FetchOutcome::Failed(err);
            }
        };

        pages += 1;
        records.extend(page.records);
        rejected.extend(page.rejected);
        progress.report(RunProgressEvent::Fetched {
            source: source_id.clone(),
            pages,
            records: records.len() as u64,
        });
        tracing::debug!(source = %source_id, pages, records = records.len(), "page fetched");

        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            next => {
                return FetchOutcome::Completed {
                    records,
                    rejected,
                    cursor: next.or(cursor),
                    pages,
                };
            }
        }
    }
}

struct Page {
    records: Vec<RawRecord>,
    rejected: Vec<RejectedRecord>,
    next_cursor: Option<String>,
}

/// `Ok(None)` means the run was cancelled while waiting.
async fn fetch_page_with_retry(
    adapter: &dyn SourceAdapter,
    cursor: Option<&str>,
    settings: &FetchSettings,
    cancel: &CancellationToken,
) -> Result<Option<Page>, SourceError> {
    let mut attempt = 1u32;
    loop {
        let result = tokio::select! {
            result = fetch_page(adapter, cursor, settings.timeout) => result,
            _ = cancel.cancelled() => return Ok(None),
        };

        match result {
            Ok(page) => return Ok(Some(page)),
            Err(err) if err.is_retryable() && attempt < settings.retry.max_attempts => {
                let delay = settings.retry.backoff(attempt);
                tracing::warn!(
                    source = %adapter.source_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "fetch attempt failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Ok(None),
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn fetch_page(
    adapter: &dyn SourceAdapter,
    cursor: Option<&str>,
    limit: Duration,
) -> Result<Page, SourceError> {
    let work = async {
        let batch = adapter.fetch(cursor).await?;
        let records: Vec<RawRecord> = batch.records.try_collect().await?;
        Ok::<_, SourceError>(Page {
            records,
            rejected: batch.rejected,
            next_cursor: batch.next_cursor,
        })
    };

    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::unavailable(
            adapter.source_id(),
            format!("timed out after {}s", limit.as_secs_f64()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::traits::FetchBatch;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings() -> FetchSettings {
        FetchSettings {
            concurrency: 2,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
            },
        }
    }

    fn raw(source: &str, id: &str) -> RawRecord {
        RawRecord::new(source, id, serde_json::json!({ "title": id }), Utc::now())
    }

    /// Three pages keyed by cursor, failing the first `flaky` attempts.
    struct Paged {
        flaky: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SourceAdapter for Paged {
        fn name(&self) -> &str {
            "paged"
        }

        async fn fetch(&self, cursor: Option<&str>) -> Result<FetchBatch, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.flaky {
                return Err(SourceError::unavailable(self.source_id(), "flaky"));
            }
            let id = self.source_id();
            Ok(match cursor {
                None => FetchBatch::from_records(vec![raw(&id, "1"), raw(&id, "2")], Some("p2".into())),
                Some("p2") => FetchBatch::from_records(vec![raw(&id, "3")], Some("p3".into()))
                    .with_rejected(vec![RejectedRecord {
                        record_key: format!("{}/#p2:1", id),
                        reason: "no id".into(),
                    }]),
                // Cursor stops advancing: done.
                _ => FetchBatch::from_records(vec![], Some("p3".into())),
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl SourceAdapter for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn fetch(&self, _cursor: Option<&str>) -> Result<FetchBatch, SourceError> {
            Err(SourceError::protocol(self.source_id(), "not json"))
        }
    }

    struct Slow;

    #[async_trait]
    impl SourceAdapter for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, _cursor: Option<&str>) -> Result<FetchBatch, SourceError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(FetchBatch::empty())
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn follows_cursor_until_it_stops_advancing() {
        let adapter = Paged {
            flaky: 0,
            calls: AtomicU32::new(0),
        };
        let outcome =
            fetch_source(&adapter, None, &settings(), &CancellationToken::new(), &NoProgress).await;
        match outcome {
            FetchOutcome::Completed {
                records,
                rejected,
                cursor,
                pages,
            } => {
                assert_eq!(records.len(), 3);
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].record_key, "custom:paged/#p2:1");
                assert_eq!(cursor.as_deref(), Some("p3"));
                assert_eq!(pages, 3);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let adapter = Paged {
            flaky: 2,
            calls: AtomicU32::new(0),
        };
        let outcome =
            fetch_source(&adapter, None, &settings(), &CancellationToken::new(), &NoProgress).await;
        assert!(matches!(outcome, FetchOutcome::Completed { .. }));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_source_only() {
        let requests = vec![
            FetchRequest {
                adapter: Arc::new(Broken),
                cursor: None,
            },
            FetchRequest {
                adapter: Arc::new(Paged {
                    flaky: 0,
                    calls: AtomicU32::new(0),
                }),
                cursor: None,
            },
        ];
        let results = fetch_all(
            requests,
            &settings(),
            &CancellationToken::new(),
            Arc::new(NoProgress),
        )
        .await;

        assert_eq!(results[0].source_id, "custom:broken");
        assert!(matches!(
            results[0].outcome,
            FetchOutcome::Failed(SourceError::Protocol { .. })
        ));
        assert!(matches!(results[1].outcome, FetchOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn slow_pages_time_out() {
        let mut settings = settings();
        settings.timeout = Duration::from_millis(20);
        settings.retry.max_attempts = 1;
        let outcome =
            fetch_source(&Slow, None, &settings, &CancellationToken::new(), &NoProgress).await;
        match outcome {
            FetchOutcome::Failed(SourceError::Unavailable { reason, .. }) => {
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_in_flight_fetches() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.cancel();
        });
        let outcome = fetch_source(&Slow, None, &settings(), &cancel, &NoProgress).await;
        assert!(matches!(outcome, FetchOutcome::Cancelled));
    }
}
