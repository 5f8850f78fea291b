//! Error taxonomy for the integration pipeline.
//!
//! Failures are scoped to the smallest unit that can absorb them:
//!
//! | Error | Unit | Effect on the run |
//! |-------|------|-------------------|
//! | [`SourceError`] | one source | retried with backoff, then the source is skipped |
//! | [`NormalizationError`] | one record | record skipped |
//! | [`IntegrationError::MergeConflictUnresolved`] | one field of one article | previous value kept |
//! | [`StoreError::VersionConflict`] | one article | re-read, re-merge, re-write |
//! | [`IntegrationError::PipelineFatal`] | whole run | run aborted |

use serde::Serialize;
use thiserror::Error;

/// Failure raised by a source adapter while fetching.
///
/// Both variants are retryable; the pipeline never inspects payloads.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceError {
    /// The provider could not be reached, or the fetch timed out.
    #[error("source {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },

    /// The provider answered with a payload of the wrong shape.
    #[error("source {source_id} protocol error: {reason}")]
    Protocol { source_id: String, reason: String },
}

impl SourceError {
    pub fn unavailable(source_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(source_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Protocol {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            Self::Unavailable { source_id, .. } | Self::Protocol { source_id, .. } => source_id,
        }
    }

    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Per-record normalization failure. The record is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("record {record_key}: payload is not a JSON object")]
    NotAnObject { record_key: String },

    #[error("record {record_key}: title is missing or empty")]
    MissingTitle { record_key: String },

    #[error("record {record_key}: field `{field}` has an unsupported shape")]
    InvalidField { record_key: String, field: String },
}

impl NormalizationError {
    pub fn record_key(&self) -> &str {
        match self {
            Self::NotAnObject { record_key }
            | Self::MissingTitle { record_key }
            | Self::InvalidField { record_key, .. } => record_key,
        }
    }
}

/// Failure reported by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed. `actual` is `0` when the
    /// article does not exist.
    #[error("version conflict on {canonical_id}: expected {expected}, found {actual}")]
    VersionConflict {
        canonical_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Errors surfaced by an integration run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrationError {
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("source {source_id} returned malformed data: {reason}")]
    SourceProtocolError { source_id: String, reason: String },

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error("unresolved conflict on {canonical_id}, field `{field}`")]
    MergeConflictUnresolved { canonical_id: String, field: String },

    #[error("version conflict on {canonical_id}: expected {expected}, found {actual}")]
    VersionConflict {
        canonical_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("pipeline aborted: {0}")]
    PipelineFatal(String),
}

impl From<SourceError> for IntegrationError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable { source_id, reason } => {
                Self::SourceUnavailable { source_id, reason }
            }
            SourceError::Protocol { source_id, reason } => {
                Self::SourceProtocolError { source_id, reason }
            }
        }
    }
}

impl From<StoreError> for IntegrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                canonical_id,
                expected,
                actual,
            } => Self::VersionConflict {
                canonical_id,
                expected,
                actual,
            },
            other => Self::PipelineFatal(other.to_string()),
        }
    }
}
