//! # Article Integrator Core
//!
//! Shared, runtime-agnostic logic for Article Integrator: the record model,
//! the normalizer, the identity resolver, the merge engine, and the store
//! abstraction.
//!
//! This crate contains no tokio, sqlx, network or filesystem I/O. Everything
//! here is a pure computation over in-memory values, except the [`store`]
//! trait which only declares the persistence contract.
//!
//! ## Data flow
//!
//! ```text
//! RawRecord ──normalize──▶ ArticleRecord ──resolve──▶ MatchGroup ──merge──▶ IntegratedArticle
//! ```

pub mod error;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod resolve;
pub mod store;

pub use error::{IntegrationError, NormalizationError, SourceError, StoreError};
pub use merge::{
    canonical_id_for, ConflictCandidate, MergeEngine, MergeOutcome, TrustTable, UnresolvedConflict,
};
pub use models::{ArticleRecord, FieldValue, IntegratedArticle, MatchGroup, RawRecord};
pub use normalize::{normalize, NormalizationWarning, NormalizedRecord};
pub use resolve::{IdentityResolver, ResolverConfig};
pub use store::memory::InMemoryStore;
pub use store::Store;
