//! Configuration parsing and validation.
//!
//! Article Integrator is configured via a TOML file (default: `config/integrator.toml`).
//! The file is loaded once at startup and validated before any command runs.
//!
//! # Example Configuration
//!
//! ```toml
//! [db]
//! path = "./data/articles.sqlite"
//!
//! [pipeline]
//! fetch_concurrency = 4
//! merge_concurrency = 8
//! fetch_timeout_secs = 30
//! max_merge_retries = 5
//! incremental = false
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 200
//! max_backoff_ms = 5000
//! multiplier = 2.0
//!
//! [resolver]
//! min_shared_authors = 1
//! # max_chain_depth = 3
//!
//! [trust]
//! default_rank = 0
//!
//! [trust.ranks]
//! "filesystem:catalog" = 10
//!
//! [sources.filesystem.catalog]
//! root = "./data/catalog"
//!
//! [sources.http.openlibrary]
//! url = "https://example.org/articles"
//!
//! [sources.staging.inbox]
//! status = "processed"
//! ```
//!
//! Sources are named instances: every `[sources.<type>.<name>]` table
//! becomes one adapter labelled `"<type>:<name>"`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use article_integrator_core::{ResolverConfig, TrustTable};

use crate::fetch::RetryPolicy;
use crate::pipeline::PipelineConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub trust: TrustSection,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSection {
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_merge_concurrency")]
    pub merge_concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_merge_retries")]
    pub max_merge_retries: u32,
    /// Resume each source from its stored cursor.
    #[serde(default)]
    pub incremental: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            merge_concurrency: default_merge_concurrency(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_merge_retries: default_max_merge_retries(),
            incremental: false,
        }
    }
}

fn default_fetch_concurrency() -> usize {
    4
}
fn default_merge_concurrency() -> usize {
    8
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_merge_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5000
}
fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverSection {
    #[serde(default = "default_min_shared_authors")]
    pub min_shared_authors: usize,
    #[serde(default)]
    pub max_chain_depth: Option<usize>,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            min_shared_authors: default_min_shared_authors(),
            max_chain_depth: None,
        }
    }
}

fn default_min_shared_authors() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrustSection {
    #[serde(default)]
    pub default_rank: i32,
    /// Source label (`"http:openlibrary"`) to rank. Higher wins.
    #[serde(default)]
    pub ranks: BTreeMap<String, i32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub filesystem: BTreeMap<String, FilesystemSourceConfig>,
    #[serde(default)]
    pub http: BTreeMap<String, HttpSourceConfig>,
    #[serde(default)]
    pub staging: BTreeMap<String, StagingSourceConfig>,
}

impl SourcesConfig {
    pub fn is_empty(&self) -> bool {
        self.filesystem.is_empty() && self.http.is_empty() && self.staging.is_empty()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string(), "**/*.jsonl".to_string()]
}

/// A paged JSON API.
///
/// Each page is requested as `GET {url}?{page_size_param}={page_size}[&{cursor_param}={cursor}]`.
/// Records are read from `records_pointer` and the next cursor from
/// `next_pointer` (both RFC 6901 JSON pointers into the response body).
#[derive(Debug, Deserialize, Clone)]
pub struct HttpSourceConfig {
    pub url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_records_pointer")]
    pub records_pointer: String,
    #[serde(default = "default_next_pointer")]
    pub next_pointer: String,
    /// Field of each record holding the provider's id.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_page_size() -> usize {
    100
}
fn default_records_pointer() -> String {
    "/records".to_string()
}
fn default_next_pointer() -> String {
    "/next".to_string()
}
fn default_id_field() -> String {
    "id".to_string()
}
fn default_cursor_param() -> String {
    "cursor".to_string()
}
fn default_page_size_param() -> String {
    "limit".to_string()
}

/// Documents staged in the local `staging_articles` table.
#[derive(Debug, Deserialize, Clone)]
pub struct StagingSourceConfig {
    /// Only rows with this status are picked up.
    #[serde(default = "default_staging_status")]
    pub status: String,
}

impl Default for StagingSourceConfig {
    fn default() -> Self {
        Self {
            status: default_staging_status(),
        }
    }
}

pub fn default_staging_status() -> String {
    "processed".to_string()
}

impl Config {
    /// Run-level settings handed to [`run_integration`](crate::pipeline::run_integration).
    pub fn pipeline_config(&self) -> PipelineConfig {
        let trust = self
            .trust
            .ranks
            .iter()
            .fold(TrustTable::new(self.trust.default_rank), |t, (source, rank)| {
                t.with_rank(source.clone(), *rank)
            });

        PipelineConfig {
            fetch_concurrency: self.pipeline.fetch_concurrency,
            merge_concurrency: self.pipeline.merge_concurrency,
            fetch_timeout: Duration::from_secs(self.pipeline.fetch_timeout_secs),
            max_merge_retries: self.pipeline.max_merge_retries,
            incremental: self.pipeline.incremental,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                multiplier: self.retry.multiplier,
            },
            resolver: ResolverConfig {
                min_shared_authors: self.resolver.min_shared_authors,
                max_chain_depth: self.resolver.max_chain_depth,
            },
            trust,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate pipeline
    if config.pipeline.fetch_concurrency == 0 {
        bail!("pipeline.fetch_concurrency must be >= 1");
    }
    if config.pipeline.merge_concurrency == 0 {
        bail!("pipeline.merge_concurrency must be >= 1");
    }
    if config.pipeline.fetch_timeout_secs == 0 {
        bail!("pipeline.fetch_timeout_secs must be >= 1");
    }

    // Validate retry
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if !config.retry.multiplier.is_finite() || config.retry.multiplier < 1.0 {
        bail!("retry.multiplier must be >= 1.0");
    }
    if config.retry.max_backoff_ms < config.retry.initial_backoff_ms {
        bail!("retry.max_backoff_ms must be >= retry.initial_backoff_ms");
    }

    if config.resolver.max_chain_depth == Some(0) {
        bail!("resolver.max_chain_depth must be >= 1 when set");
    }

    // Validate sources
    for (name, http) in &config.sources.http {
        if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
            bail!(
                "sources.http.{}.url must start with http:// or https:// (got '{}')",
                name,
                http.url
            );
        }
        if http.page_size == 0 {
            bail!("sources.http.{}.page_size must be >= 1", name);
        }
        for (field, pointer) in [
            ("records_pointer", &http.records_pointer),
            ("next_pointer", &http.next_pointer),
        ] {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                bail!(
                    "sources.http.{}.{} must be a JSON pointer starting with '/'",
                    name,
                    field
                );
            }
        }
    }
    for (name, fs) in &config.sources.filesystem {
        if fs.include_globs.is_empty() {
            bail!("sources.filesystem.{}.include_globs must not be empty", name);
        }
    }
    for (name, staging) in &config.sources.staging {
        if staging.status.trim().is_empty() {
            bail!("sources.staging.{}.status must not be empty", name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/a.sqlite\"\n").unwrap();
        assert_eq!(config.pipeline.fetch_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.resolver.min_shared_authors, 1);
        assert!(config.sources.is_empty());

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.fetch_timeout, Duration::from_secs(30));
        assert_eq!(pipeline.resolver.max_chain_depth, None);
    }

    #[test]
    fn named_sources_and_trust_ranks() {
        let config = parse(
            r#"
            [db]
            path = "a.sqlite"

            [trust]
            default_rank = 1
            [trust.ranks]
            "http:ol" = 9

            [sources.filesystem.catalog]
            root = "./catalog"

            [sources.http.ol]
            url = "https://example.org/api"

            [sources.staging.inbox]
            "#,
        )
        .unwrap();

        assert_eq!(
            config.sources.filesystem["catalog"].include_globs,
            vec!["**/*.json", "**/*.jsonl"]
        );
        assert_eq!(config.sources.http["ol"].records_pointer, "/records");
        assert_eq!(config.sources.staging["inbox"].status, "processed");

        let trust = config.pipeline_config().trust;
        assert_eq!(trust.rank("http:ol"), 9);
        assert_eq!(trust.rank("filesystem:catalog"), 1);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse("[db]\npath = \"a\"\n[pipeline]\nfetch_concurrency = 0\n").is_err());
        assert!(parse("[db]\npath = \"a\"\n[retry]\nmultiplier = 0.5\n").is_err());
        assert!(parse("[db]\npath = \"a\"\n[resolver]\nmax_chain_depth = 0\n").is_err());
        assert!(parse("[db]\npath = \"a\"\n[sources.http.x]\nurl = \"ftp://x\"\n").is_err());
    }
}
