//! # Article Integrator
//!
//! Integrates book articles from heterogeneous sources into one
//! deduplicated, merged dataset.
//!
//! Each run pulls raw records from every configured source, normalizes
//! them, groups records that denote the same article, merges each group
//! into an [`IntegratedArticle`](article_integrator_core::IntegratedArticle)
//! by per-source trust rank and recency, and persists the result in SQLite
//! with optimistic versioning.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────────┐   ┌──────────┐
//! │   Sources    │──▶│           Pipeline            │──▶│  SQLite  │
//! │ FS/HTTP/Stage│   │ normalize▶resolve▶merge▶write │   │ articles │
//! └──────────────┘   └───────────────────────────────┘   └────┬─────┘
//!                                                             │
//!                                      ┌──────────────────────┤
//!                                      ▼                      ▼
//!                                 ┌──────────┐          ┌──────────┐
//!                                 │   CLI    │          │   push   │
//!                                 │(integrator)         │ promote  │
//!                                 └──────────┘          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! integrator init                   # create database
//! integrator sources                # list configured sources
//! integrator run                    # integrate every source
//! integrator lookup isbn 9780441013593
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`traits`] | `SourceAdapter` trait and adapter registry |
//! | [`adapter_fs`] | JSON / JSON Lines files on disk |
//! | [`adapter_http`] | Paged JSON APIs |
//! | [`adapter_staging`] | Documents staged in SQLite |
//! | [`fetch`] | Concurrent fetching with timeouts and retries |
//! | [`pipeline`] | `run_integration` |
//! | [`sqlite_store`] | SQLite `Store` implementation |
//! | [`push`] | Push envelopes and staged-document promotion |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapter_fs;
pub mod adapter_http;
pub mod adapter_staging;
pub mod cancel;
pub mod config;
pub mod db;
pub mod fetch;
pub mod get;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod push;
pub mod runs;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
pub mod traits;
