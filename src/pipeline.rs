//! Integration run orchestration.
//!
//! Coordinates one run end to end:
//!
//! ```text
//! Fetching ─▶ Normalizing ─▶ Resolving ─▶ Merging ─▶ Persisting ─▶ Completed
//!     │                                      │
//!     └──────────────▶ Cancelled ◀───────────┘        (Failed on a fatal store error)
//! ```
//!
//! Sources are fetched concurrently (see [`crate::fetch`]). Every fresh
//! record is normalized and written to the record ledger; resolution then
//! runs over the whole ledger so that incremental fetches still see every
//! record they could match. A source fetched from the start replaces its
//! slice of the ledger instead. Groups are assigned to existing articles in a
//! sequential planning pass, then merged and persisted concurrently with
//! optimistic versioning. Writes are per article: a run stopped half way
//! leaves the store valid, and running again converges it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use article_integrator_core::{
    canonical_id_for, normalize, ArticleRecord, IdentityResolver, IntegratedArticle,
    IntegrationError, MatchGroup, MergeEngine, ResolverConfig, Store, StoreError, TrustTable,
    UnresolvedConflict,
};

use crate::cancel::CancellationToken;
use crate::fetch::{fetch_all, FetchOutcome, FetchRequest, FetchSettings, RetryPolicy};
use crate::progress::{NoProgress, RunProgressEvent, RunProgressReporter};
use crate::traits::SourceAdapter;

/// Settings for one run, usually built by [`Config::pipeline_config`](crate::config::Config::pipeline_config).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_concurrency: usize,
    pub merge_concurrency: usize,
    pub fetch_timeout: Duration,
    pub max_merge_retries: u32,
    /// Resume each source from its stored cursor.
    pub incremental: bool,
    pub retry: RetryPolicy,
    pub resolver: ResolverConfig,
    pub trust: TrustTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 4,
            merge_concurrency: 8,
            fetch_timeout: Duration::from_secs(30),
            max_merge_retries: 5,
            incremental: false,
            retry: RetryPolicy::default(),
            resolver: ResolverConfig::default(),
            trust: TrustTable::default(),
        }
    }
}

impl PipelineConfig {
    fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            concurrency: self.fetch_concurrency,
            timeout: self.fetch_timeout,
            retry: self.retry.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Normalizing,
    Resolving,
    Merging,
    Persisting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Fetching => "fetching",
            RunStage::Normalizing => "normalizing",
            RunStage::Resolving => "resolving",
            RunStage::Merging => "merging",
            RunStage::Persisting => "persisting",
            RunStage::Completed => "completed",
            RunStage::Failed => "failed",
            RunStage::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-invocation switches.
#[derive(Clone)]
pub struct RunOptions {
    /// Fetch, normalize, resolve and merge, but write nothing.
    pub dry_run: bool,
    /// Ignore stored cursors and fetch every source from the start.
    pub full: bool,
    pub cancel: CancellationToken,
    pub progress: Arc<dyn RunProgressReporter>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            full: false,
            cancel: CancellationToken::new(),
            progress: Arc::new(NoProgress),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub record_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub source_id: String,
    pub reason: String,
}

/// A group whose article could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEntity {
    pub canonical_id: String,
    pub members: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub status: SourceStatus,
    pub pages: u64,
    pub fetched: u64,
    pub normalized: u64,
    pub skipped: u64,
    /// Cursor the next incremental run resumes from.
    pub cursor: Option<String>,
    pub acknowledged: u64,
}

/// Everything an operator needs to know about a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub final_stage: RunStage,
    /// Groups merged and persisted (written or already up to date).
    pub completed_count: u64,
    pub written_count: u64,
    pub unchanged_count: u64,
    pub superseded_count: u64,
    pub skipped_count: u64,
    pub warning_count: u64,
    pub record_count: u64,
    pub group_count: u64,
    pub skipped: Vec<SkippedRecord>,
    pub failed_sources: Vec<FailedSource>,
    pub unresolved_conflicts: Vec<UnresolvedConflict>,
    pub failed_entities: Vec<FailedEntity>,
    pub sources: Vec<SourceSummary>,
}

/// State owned by a single run.
struct RunContext {
    stage: RunStage,
    cancel: CancellationToken,
    progress: Arc<dyn RunProgressReporter>,
    result: RunResult,
}

impl RunContext {
    fn new(options: &RunOptions) -> Self {
        let now = Utc::now();
        Self {
            stage: RunStage::Fetching,
            cancel: options.cancel.clone(),
            progress: options.progress.clone(),
            result: RunResult {
                run_id: Uuid::new_v4().to_string(),
                started_at: now,
                finished_at: now,
                dry_run: options.dry_run,
                final_stage: RunStage::Fetching,
                completed_count: 0,
                written_count: 0,
                unchanged_count: 0,
                superseded_count: 0,
                skipped_count: 0,
                warning_count: 0,
                record_count: 0,
                group_count: 0,
                skipped: Vec::new(),
                failed_sources: Vec::new(),
                unresolved_conflicts: Vec::new(),
                failed_entities: Vec::new(),
                sources: Vec::new(),
            },
        }
    }

    fn enter(&mut self, stage: RunStage) {
        self.stage = stage;
        self.result.final_stage = stage;
        tracing::info!(run_id = %self.result.run_id, stage = %stage, "run stage");
        self.progress.report(RunProgressEvent::Stage { stage });
    }

    /// Abort on a store failure. The stage the run died in is logged.
    fn fail(&mut self, err: StoreError) -> IntegrationError {
        let failed_in = self.stage;
        self.enter(RunStage::Failed);
        tracing::error!(
            run_id = %self.result.run_id,
            stage = %failed_in,
            error = %err,
            "run aborted"
        );
        match IntegrationError::from(err) {
            IntegrationError::PipelineFatal(reason) => IntegrationError::PipelineFatal(reason),
            other => IntegrationError::PipelineFatal(other.to_string()),
        }
    }

    fn finish(mut self, stage: RunStage) -> RunResult {
        self.enter(stage);
        self.result.skipped_count = self.result.skipped.len() as u64;
        self.result.finished_at = Utc::now();
        tracing::info!(
            run_id = %self.result.run_id,
            stage = %stage,
            completed = self.result.completed_count,
            written = self.result.written_count,
            skipped = self.result.skipped_count,
            failed_sources = self.result.failed_sources.len(),
            "run finished"
        );
        self.result
    }
}

/// Run one integration pass over `sources`.
///
/// Returns `Err` only when the store fails in a way other than a version
/// conflict; every other problem is reported inside the [`RunResult`].
pub async fn run_integration(
    sources: Vec<Arc<dyn SourceAdapter>>,
    store: Arc<dyn Store>,
    config: &PipelineConfig,
    options: RunOptions,
) -> Result<RunResult, IntegrationError> {
    let mut ctx = RunContext::new(&options);
    ctx.enter(RunStage::Fetching);

    // Cursors. A non-draining source fetched from the start is a snapshot.
    let mut requests = Vec::with_capacity(sources.len());
    let mut snapshots: HashSet<String> = HashSet::new();
    for adapter in &sources {
        let cursor = if config.incremental && !options.full && !adapter.drains() {
            match store.get_cursor(&adapter.source_id()).await {
                Ok(cursor) => cursor,
                Err(e) => return Err(ctx.fail(e)),
            }
        } else {
            None
        };
        if cursor.is_none() && !adapter.drains() {
            snapshots.insert(adapter.source_id());
        }
        requests.push(FetchRequest {
            adapter: adapter.clone(),
            cursor,
        });
    }

    let fetched = fetch_all(
        requests,
        &config.fetch_settings(),
        &ctx.cancel,
        ctx.progress.clone(),
    )
    .await;

    if ctx.cancel.is_cancelled() {
        for fetch in &fetched {
            ctx.result.sources.push(SourceSummary {
                source_id: fetch.source_id.clone(),
                status: SourceStatus::Cancelled,
                pages: 0,
                fetched: 0,
                normalized: 0,
                skipped: 0,
                cursor: None,
                acknowledged: 0,
            });
        }
        return Ok(ctx.finish(RunStage::Cancelled));
    }

    // Normalize
    ctx.enter(RunStage::Normalizing);
    let mut fresh: Vec<ArticleRecord> = Vec::new();
    let mut fresh_by_source: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    let mut replaced: BTreeSet<String> = BTreeSet::new();
    for fetch in fetched {
        let mut summary = SourceSummary {
            source_id: fetch.source_id.clone(),
            status: SourceStatus::Completed,
            pages: 0,
            fetched: 0,
            normalized: 0,
            skipped: 0,
            cursor: None,
            acknowledged: 0,
        };

        match fetch.outcome {
            FetchOutcome::Completed {
                records,
                rejected,
                cursor,
                pages,
            } => {
                summary.pages = pages;
                summary.fetched = (records.len() + rejected.len()) as u64;
                summary.cursor = cursor;
                if snapshots.contains(&fetch.source_id) {
                    replaced.insert(fetch.source_id.clone());
                }
                for entry in rejected {
                    summary.skipped += 1;
                    ctx.result.skipped.push(SkippedRecord {
                        record_key: entry.record_key,
                        reason: entry.reason,
                    });
                }
                for raw in &records {
                    match normalize(raw) {
                        Ok(normalized) => {
                            for warning in &normalized.warnings {
                                tracing::debug!(record = %raw.record_key(), warning = ?warning, "normalization warning");
                            }
                            ctx.result.warning_count += normalized.warnings.len() as u64;
                            summary.normalized += 1;
                            fresh_by_source
                                .entry(fetch.source_id.clone())
                                .or_default()
                                .push((normalized.record.record_key(), raw.source_native_id.clone()));
                            fresh.push(normalized.record);
                        }
                        Err(err) => {
                            tracing::warn!(record = %err.record_key(), error = %err, "skipping record");
                            summary.skipped += 1;
                            ctx.result.skipped.push(SkippedRecord {
                                record_key: err.record_key().to_string(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            }
            FetchOutcome::Failed(err) => {
                summary.status = SourceStatus::Failed;
                ctx.result.failed_sources.push(FailedSource {
                    source_id: fetch.source_id.clone(),
                    reason: err.to_string(),
                });
            }
            FetchOutcome::Cancelled => summary.status = SourceStatus::Cancelled,
        }
        ctx.result.sources.push(summary);
    }

    // Ledger ∪ fresh. Fresh records replace ledger entries with the same
    // key; a record whose content is unchanged keeps its first fetch time.
    // Sources fetched in full drop the ledger entries they no longer return.
    let mut working: BTreeMap<String, ArticleRecord> = match store.load_records().await {
        Ok(ledger) => ledger.into_iter().map(|r| (r.record_key(), r)).collect(),
        Err(e) => return Err(ctx.fail(e)),
    };
    for record in fresh.iter_mut() {
        if let Some(previous) = working.get(&record.record_key()) {
            if same_content(record, previous) {
                record.fetched_at = previous.fetched_at;
            }
        }
    }
    let before = working.len();
    working.retain(|_, r| !replaced.contains(&r.source_id));
    let dropped = before - working.len();
    for record in &fresh {
        working.insert(record.record_key(), record.clone());
    }
    if dropped > 0 {
        tracing::debug!(sources = replaced.len(), dropped, "replacing ledger slices of fully fetched sources");
    }

    if !options.dry_run {
        let (snapshot, incremental): (Vec<ArticleRecord>, Vec<ArticleRecord>) = fresh
            .iter()
            .cloned()
            .partition(|r| replaced.contains(&r.source_id));
        for source_id in &replaced {
            let slice: Vec<ArticleRecord> = snapshot
                .iter()
                .filter(|r| &r.source_id == source_id)
                .cloned()
                .collect();
            if let Err(e) = store.replace_source_records(source_id, &slice).await {
                return Err(ctx.fail(e));
            }
        }
        if !incremental.is_empty() {
            if let Err(e) = store.upsert_records(&incremental).await {
                return Err(ctx.fail(e));
            }
        }
    }

    // Resolve
    ctx.enter(RunStage::Resolving);
    let records: Vec<ArticleRecord> = working.into_values().collect();
    ctx.result.record_count = records.len() as u64;
    let groups = IdentityResolver::new(config.resolver.clone()).resolve(&records);
    ctx.result.group_count = groups.len() as u64;
    tracing::info!(records = records.len(), groups = groups.len(), "resolved match groups");

    // Merge + persist
    ctx.enter(RunStage::Merging);
    let plans = match plan_groups(store.as_ref(), groups).await {
        Ok(plans) => plans,
        Err(e) => return Err(ctx.fail(e)),
    };

    let engine = MergeEngine::new(config.trust.clone());
    let total = plans.len() as u64;
    let mut done = 0u64;
    let mut completed_keys: HashSet<String> = HashSet::new();
    let mut cancelled = false;

    let cancel = ctx.cancel.clone();
    let dry_run = options.dry_run;
    let max_retries = config.max_merge_retries;
    let (engine_ref, cancel_ref, store_ref) = (&engine, &cancel, store.as_ref());
    let mut merges = stream::iter(plans.iter())
        .map(move |plan| async move {
            if cancel_ref.is_cancelled() {
                return (plan, None);
            }
            let outcome = execute_plan(store_ref, engine_ref, plan, max_retries, dry_run).await;
            (plan, Some(outcome))
        })
        .buffer_unordered(config.merge_concurrency.max(1));

    let mut fatal = None;
    while let Some((plan, outcome)) = merges.next().await {
        match outcome {
            None => cancelled = true,
            Some(Ok(group)) => {
                for conflict in &group.unresolved {
                    tracing::warn!(
                        canonical_id = %conflict.canonical_id,
                        field = %conflict.field,
                        kept = %conflict.kept,
                        "unresolved merge conflict"
                    );
                }
                ctx.result.unresolved_conflicts.extend(group.unresolved);
                ctx.result.completed_count += 1;
                ctx.result.superseded_count += group.superseded;
                if group.written {
                    ctx.result.written_count += 1;
                } else {
                    ctx.result.unchanged_count += 1;
                }
                completed_keys.extend(plan.group.record_keys());
            }
            Some(Err(StoreError::VersionConflict {
                canonical_id,
                expected,
                actual,
            })) => {
                tracing::warn!(
                    canonical_id = %canonical_id,
                    expected,
                    actual,
                    "giving up on article after repeated version conflicts"
                );
                ctx.result.failed_entities.push(FailedEntity {
                    canonical_id: canonical_id.clone(),
                    members: plan.group.record_keys().into_iter().collect(),
                    reason: IntegrationError::VersionConflict {
                        canonical_id,
                        expected,
                        actual,
                    }
                    .to_string(),
                });
            }
            Some(Err(e)) => {
                fatal = Some(e);
                break;
            }
        }
        done += 1;
        ctx.progress.report(RunProgressEvent::Merging { n: done, total });
    }
    drop(merges);
    if let Some(e) = fatal {
        return Err(ctx.fail(e));
    }
    if cancelled || ctx.cancel.is_cancelled() {
        return Ok(ctx.finish(RunStage::Cancelled));
    }

    // Checkpoints and acknowledgements
    ctx.enter(RunStage::Persisting);
    if !options.dry_run {
        for idx in 0..ctx.result.sources.len() {
            let summary = ctx.result.sources[idx].clone();
            if summary.status != SourceStatus::Completed {
                continue;
            }
            let adapter = sources.iter().find(|a| a.source_id() == summary.source_id);
            if config.incremental && adapter.is_some_and(|a| !a.drains()) {
                if let Some(cursor) = &summary.cursor {
                    if let Err(e) = store.set_cursor(&summary.source_id, cursor).await {
                        return Err(ctx.fail(e));
                    }
                }
            }

            let ids: Vec<String> = fresh_by_source
                .get(&summary.source_id)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|(key, _)| completed_keys.contains(key))
                        .map(|(_, native_id)| native_id.clone())
                        .collect()
                })
                .unwrap_or_default();
            if ids.is_empty() {
                continue;
            }
            let Some(adapter) = adapter else {
                continue;
            };
            match adapter.acknowledge(&ids).await {
                Ok(()) => ctx.result.sources[idx].acknowledged = ids.len() as u64,
                Err(e) => {
                    tracing::warn!(source = %summary.source_id, error = %e, "acknowledge failed")
                }
            }
        }
    }

    Ok(ctx.finish(RunStage::Completed))
}

/// Equal apart from when it was fetched.
fn same_content(record: &ArticleRecord, previous: &ArticleRecord) -> bool {
    let mut restamped = record.clone();
    restamped.fetched_at = previous.fetched_at;
    restamped == *previous
}

/// A group together with the article it will be merged into.
#[derive(Debug)]
struct GroupPlan {
    group: MatchGroup,
    canonical_id: String,
    /// Live articles folded into this one.
    supersede: Vec<String>,
}

/// Assign every group the article it continues.
///
/// Each existing live article that owns any member of the run belongs to
/// the group holding most of its members (ties: earliest group). A group
/// continues the owned article covering most of its members (ties:
/// smallest id) and supersedes the rest. Groups owning nothing fall back to
/// an unclaimed article sharing an identifier, then to a fresh id.
async fn plan_groups(
    store: &dyn Store,
    groups: Vec<MatchGroup>,
) -> Result<Vec<GroupPlan>, StoreError> {
    let mut coverage: Vec<BTreeMap<String, usize>> = Vec::with_capacity(groups.len());
    for group in &groups {
        let mut counts = BTreeMap::new();
        for key in group.record_keys() {
            if let Some(article) = store.find_by_member(&key).await? {
                *counts.entry(article.canonical_id).or_insert(0usize) += 1;
            }
        }
        coverage.push(counts);
    }

    let mut owner: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (idx, counts) in coverage.iter().enumerate() {
        for (id, &count) in counts {
            match owner.get(id) {
                Some(&(best, _)) if best >= count => {}
                _ => {
                    owner.insert(id.clone(), (count, idx));
                }
            }
        }
    }

    let mut owned: Vec<Vec<(String, usize)>> = vec![Vec::new(); groups.len()];
    for (id, (count, idx)) in &owner {
        owned[*idx].push((id.clone(), *count));
    }
    let mut claimed: BTreeSet<String> = owner.keys().cloned().collect();

    let mut plans = Vec::with_capacity(groups.len());
    for (idx, group) in groups.into_iter().enumerate() {
        let mut candidates = std::mem::take(&mut owned[idx]);
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut ids = candidates.into_iter().map(|(id, _)| id);

        let canonical_id = match ids.next() {
            Some(id) => id,
            None => {
                let mut found = None;
                for (scheme, value) in group.identifiers() {
                    if let Some(article) = store.find_by_identifier(&scheme, &value).await? {
                        if !claimed.contains(&article.canonical_id) {
                            found = Some(article.canonical_id);
                            break;
                        }
                    }
                }
                found.unwrap_or_else(|| fresh_id(&group, &claimed))
            }
        };
        claimed.insert(canonical_id.clone());

        plans.push(GroupPlan {
            group,
            canonical_id,
            supersede: ids.collect(),
        });
    }
    Ok(plans)
}

/// Id for a group that continues no article: derived from its smallest
/// record key not already taken by another group in this run.
fn fresh_id(group: &MatchGroup, claimed: &BTreeSet<String>) -> String {
    group
        .record_keys()
        .iter()
        .map(|key| canonical_id_for(key))
        .find(|id| !claimed.contains(id))
        .unwrap_or_else(|| canonical_id_for(&group.anchor_key()))
}

struct GroupResult {
    written: bool,
    superseded: u64,
    unresolved: Vec<UnresolvedConflict>,
}

/// Read, merge, write; on a version conflict, start over.
async fn execute_plan(
    store: &dyn Store,
    engine: &MergeEngine,
    plan: &GroupPlan,
    max_retries: u32,
    dry_run: bool,
) -> Result<GroupResult, StoreError> {
    let mut attempt = 0u32;
    let (article, written, unresolved) = loop {
        let existing = store.get(&plan.canonical_id).await?;
        let mut outcome = engine.merge(&plan.group, existing.as_ref(), Utc::now());
        if existing.is_none() {
            outcome.article.canonical_id = plan.canonical_id.clone();
            for conflict in &mut outcome.unresolved {
                conflict.canonical_id = plan.canonical_id.clone();
            }
        }

        if dry_run || !outcome.changed {
            break (outcome.article, outcome.changed, outcome.unresolved);
        }

        let expected = existing.as_ref().map(|a| a.version).unwrap_or(0);
        match store.put_if_version(&outcome.article, expected).await {
            Ok(()) => break (outcome.article, true, outcome.unresolved),
            Err(StoreError::VersionConflict { .. }) if attempt < max_retries => {
                attempt += 1;
                tracing::debug!(canonical_id = %plan.canonical_id, attempt, "version conflict, re-merging");
            }
            Err(e) => return Err(e),
        }
    };

    let mut superseded = 0u64;
    for old in &plan.supersede {
        if dry_run || supersede(store, old, &article, max_retries).await? {
            superseded += 1;
        }
    }

    Ok(GroupResult {
        written,
        superseded,
        unresolved,
    })
}

/// Point `old_id` at `survivor`. Returns `false` if there was nothing to do.
async fn supersede(
    store: &dyn Store,
    old_id: &str,
    survivor: &IntegratedArticle,
    max_retries: u32,
) -> Result<bool, StoreError> {
    let mut attempt = 0u32;
    loop {
        let Some(mut old) = store.get(old_id).await? else {
            return Ok(false);
        };
        if old.superseded_by.as_deref() == Some(survivor.canonical_id.as_str()) {
            return Ok(false);
        }

        let expected = old.version;
        old.superseded_by = Some(survivor.canonical_id.clone());
        old.version += 1;
        old.last_merged_at = Utc::now();
        match store.put_if_version(&old, expected).await {
            Ok(()) => {
                tracing::info!(canonical_id = %old_id, survivor = %survivor.canonical_id, "article superseded");
                return Ok(true);
            }
            Err(StoreError::VersionConflict { .. }) if attempt < max_retries => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}
