//! Merge engine: fold a [`MatchGroup`] into one [`IntegratedArticle`].
//!
//! Every field is resolved independently from the values the group's
//! members supply:
//!
//! 1. A single distinct non-empty value wins outright.
//! 2. Otherwise the value from the source with the highest trust rank wins.
//! 3. Rank ties go to the most recently fetched record.
//! 4. If rank and fetch time both tie between different values the field is
//!    an [`UnresolvedConflict`]: the previously persisted value and its
//!    provenance are kept (a brand-new article takes the value of the
//!    member with the smallest record key).
//!
//! Identifiers are merged per scheme with the same rules, so the article
//! carries the union of all schemes seen across the group.
//!
//! Merging is deterministic: the same group and the same previous article
//! always produce the same fields. The version is bumped only when the
//! resolved content actually changes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IntegrationError;
use crate::models::{fields, FieldValue, IntegratedArticle, MatchGroup};

/// Per-source trust ranks. Higher wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustTable {
    pub default_rank: i32,
    pub ranks: BTreeMap<String, i32>,
}

impl TrustTable {
    pub fn new(default_rank: i32) -> Self {
        Self {
            default_rank,
            ranks: BTreeMap::new(),
        }
    }

    pub fn with_rank(mut self, source_id: impl Into<String>, rank: i32) -> Self {
        self.ranks.insert(source_id.into(), rank);
        self
    }

    pub fn rank(&self, source_id: &str) -> i32 {
        self.ranks
            .get(source_id)
            .copied()
            .unwrap_or(self.default_rank)
    }
}

/// One contender in an unresolved field conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictCandidate {
    pub source_id: String,
    pub value: FieldValue,
}

/// A field whose contenders tied on both trust rank and fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedConflict {
    pub canonical_id: String,
    pub field: String,
    pub candidates: Vec<ConflictCandidate>,
    /// The value the article carries after the merge.
    pub kept: FieldValue,
}

impl From<&UnresolvedConflict> for IntegrationError {
    fn from(conflict: &UnresolvedConflict) -> Self {
        IntegrationError::MergeConflictUnresolved {
            canonical_id: conflict.canonical_id.clone(),
            field: conflict.field.clone(),
        }
    }
}

/// Result of merging one group.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub article: IntegratedArticle,
    /// `false` when the group reproduced the previous article exactly; the
    /// previous article is then returned unchanged.
    pub changed: bool,
    pub unresolved: Vec<UnresolvedConflict>,
}

/// Deterministic id for a new article, derived from its smallest record key.
pub fn canonical_id_for(anchor_record_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(anchor_record_key.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("art_{}", &digest[..16])
}

enum Resolution {
    Absent,
    Winner { value: FieldValue, source_id: String },
    Tied(Vec<ConflictCandidate>),
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    trust: TrustTable,
}

impl MergeEngine {
    pub fn new(trust: TrustTable) -> Self {
        Self { trust }
    }

    pub fn trust(&self) -> &TrustTable {
        &self.trust
    }

    /// Merge `group` on top of the previously persisted `existing` article.
    pub fn merge(
        &self,
        group: &MatchGroup,
        existing: Option<&IntegratedArticle>,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let canonical_id = existing
            .map(|a| a.canonical_id.clone())
            .unwrap_or_else(|| canonical_id_for(&group.anchor_key()));

        let schemes: BTreeSet<&str> = group
            .records()
            .iter()
            .flat_map(|r| r.identifiers.keys().map(String::as_str))
            .collect();
        let field_names = fields::SCALAR
            .iter()
            .map(|f| f.to_string())
            .chain(schemes.into_iter().map(fields::identifier));

        let mut resolved = BTreeMap::new();
        let mut provenance = BTreeMap::new();
        let mut unresolved = Vec::new();

        for field in field_names {
            match self.resolve_field(group, &field) {
                Resolution::Absent => {}
                Resolution::Winner { value, source_id } => {
                    resolved.insert(field.clone(), value);
                    provenance.insert(field, source_id);
                }
                Resolution::Tied(candidates) => {
                    let previous = existing.and_then(|a| {
                        Some((a.fields.get(&field)?.clone(), a.provenance.get(&field)?.clone()))
                    });
                    let (value, source_id) = match previous {
                        Some(kept) => kept,
                        None => (candidates[0].value.clone(), candidates[0].source_id.clone()),
                    };
                    unresolved.push(UnresolvedConflict {
                        canonical_id: canonical_id.clone(),
                        field: field.clone(),
                        candidates,
                        kept: value.clone(),
                    });
                    resolved.insert(field.clone(), value);
                    provenance.insert(field, source_id);
                }
            }
        }

        let mut article = IntegratedArticle {
            canonical_id,
            fields: resolved,
            provenance,
            contributing_sources: group.sources(),
            members: group.record_keys(),
            version: existing.map(|a| a.version).unwrap_or(0),
            last_merged_at: now,
            superseded_by: None,
        };

        if let Some(previous) = existing {
            if !article.content_differs(previous) {
                return MergeOutcome {
                    article: previous.clone(),
                    changed: false,
                    unresolved,
                };
            }
        }

        article.version += 1;
        MergeOutcome {
            article,
            changed: true,
            unresolved,
        }
    }

    fn resolve_field(&self, group: &MatchGroup, field: &str) -> Resolution {
        // Members are sorted by record key, so `candidates` is too.
        let candidates: Vec<(i32, DateTime<Utc>, &str, FieldValue)> = group
            .records()
            .iter()
            .filter_map(|r| {
                let value = r.field_value(field)?;
                Some((self.trust.rank(&r.source_id), r.fetched_at, r.source_id.as_str(), value))
            })
            .collect();

        let Some(best) = candidates.iter().map(|(rank, at, _, _)| (*rank, *at)).max() else {
            return Resolution::Absent;
        };

        let mut top: Vec<ConflictCandidate> = Vec::new();
        for (rank, at, source_id, value) in candidates {
            if (rank, at) != best || top.iter().any(|c| c.value == value) {
                continue;
            }
            top.push(ConflictCandidate {
                source_id: source_id.to_string(),
                value,
            });
        }

        if top.len() == 1 {
            let winner = top.remove(0);
            Resolution::Winner {
                value: winner.value,
                source_id: winner.source_id,
            }
        } else {
            Resolution::Tied(top)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArticleRecord;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn record(source: &str, id: &str, title: &str) -> ArticleRecord {
        ArticleRecord {
            title: title.into(),
            title_key: title.to_lowercase(),
            authors: vec!["Frank Herbert".into()],
            identifiers: BTreeMap::new(),
            published_date: None,
            publisher: None,
            language: None,
            summary: None,
            source_id: source.into(),
            source_native_id: id.into(),
            fetched_at: t0(),
        }
    }

    fn group(records: Vec<ArticleRecord>) -> MatchGroup {
        MatchGroup::new(records).unwrap()
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    #[test]
    fn dune_example() {
        let mut a = record("A", "1", "Dune");
        a.identifiers.insert("isbn".into(), "9780441013593".into());
        let b = record("B", "9", "dune");

        let trust = TrustTable::new(0).with_rank("A", 5);
        let out = MergeEngine::new(trust).merge(&group(vec![a, b]), None, t0());

        let article = out.article;
        assert!(out.changed);
        assert_eq!(article.version, 1);
        assert_eq!(article.title(), Some("Dune"));
        assert_eq!(article.field("identifier.isbn"), Some(&text("9780441013593")));
        assert_eq!(article.provenance["identifier.isbn"], "A");
        assert_eq!(
            article.contributing_sources,
            BTreeSet::from(["A".to_string(), "B".to_string()])
        );
        assert!(out.unresolved.is_empty());
    }

    #[test]
    fn higher_trust_beats_recency() {
        let mut low = record("low", "1", "Dune");
        low.publisher = Some("Ace".into());
        low.fetched_at = t0() + Duration::hours(1);
        let mut high = record("high", "1", "Dune");
        high.publisher = Some("Chilton".into());

        let engine = MergeEngine::new(TrustTable::new(0).with_rank("high", 1));
        let out = engine.merge(&group(vec![low, high]), None, t0());
        assert_eq!(out.article.field("publisher"), Some(&text("Chilton")));
        assert_eq!(out.article.provenance["publisher"], "high");
    }

    #[test]
    fn equal_trust_prefers_most_recent_fetch() {
        let mut old = record("a", "1", "Dune");
        old.published_date = NaiveDate::from_ymd_opt(1965, 1, 1);
        let mut new = record("b", "1", "Dune");
        new.published_date = NaiveDate::from_ymd_opt(1965, 8, 1);
        new.fetched_at = t0() + Duration::minutes(5);

        let out = MergeEngine::default().merge(&group(vec![old, new]), None, t0());
        assert_eq!(
            out.article.field("published_date"),
            Some(&FieldValue::Date(NaiveDate::from_ymd_opt(1965, 8, 1).unwrap()))
        );
        assert_eq!(out.article.provenance["published_date"], "b");
    }

    #[test]
    fn identifiers_are_unioned_per_scheme() {
        let mut a = record("a", "1", "Dune");
        a.identifiers.insert("isbn".into(), "9780441013593".into());
        let mut b = record("b", "1", "Dune");
        b.identifiers.insert("doi".into(), "10.1000/dune".into());

        let ids = MergeEngine::default()
            .merge(&group(vec![a, b]), None, t0())
            .article
            .identifiers();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids["isbn"], "9780441013593");
        assert_eq!(ids["doi"], "10.1000/dune");
    }

    #[test]
    fn full_tie_on_new_article_takes_smallest_record_key_and_reports() {
        let mut a = record("a", "1", "Dune");
        a.language = Some("en".into());
        let mut b = record("b", "1", "Dune");
        b.language = Some("fr".into());

        let out = MergeEngine::default().merge(&group(vec![b, a]), None, t0());
        assert_eq!(out.article.field("language"), Some(&text("en")));
        assert_eq!(out.unresolved.len(), 1);
        let conflict = &out.unresolved[0];
        assert_eq!(conflict.field, "language");
        assert_eq!(conflict.candidates.len(), 2);

        let err: IntegrationError = conflict.into();
        assert!(matches!(err, IntegrationError::MergeConflictUnresolved { .. }));
    }

    #[test]
    fn full_tie_keeps_previous_value() {
        let mut a = record("a", "1", "Dune");
        a.language = Some("en".into());
        let mut b = record("b", "1", "Dune");
        b.language = Some("fr".into());
        let engine = MergeEngine::default();

        let mut previous = engine
            .merge(&group(vec![a.clone(), b.clone()]), None, t0())
            .article;
        previous
            .fields
            .insert("language".into(), text("fr"));
        previous.provenance.insert("language".into(), "b".into());

        let out = engine.merge(&group(vec![a, b]), Some(&previous), t0());
        assert!(!out.changed);
        assert_eq!(out.article.field("language"), Some(&text("fr")));
        assert_eq!(out.article.provenance["language"], "b");
        assert_eq!(out.unresolved.len(), 1);
    }

    #[test]
    fn remerge_without_changes_is_a_no_op() {
        let engine = MergeEngine::default();
        let g = group(vec![record("a", "1", "Dune"), record("b", "2", "Dune")]);
        let first = engine.merge(&g, None, t0()).article;

        let later = t0() + Duration::days(1);
        let again = engine.merge(&g, Some(&first), later);
        assert!(!again.changed);
        assert_eq!(again.article, first);
    }

    #[test]
    fn content_change_bumps_version_and_keeps_id() {
        let engine = MergeEngine::default();
        let first = engine
            .merge(&group(vec![record("a", "1", "Dune")]), None, t0())
            .article;

        let mut updated = record("a", "1", "Dune");
        updated.summary = Some("Spice.".into());
        let later = t0() + Duration::days(1);
        let out = engine.merge(&group(vec![updated]), Some(&first), later);

        assert!(out.changed);
        assert_eq!(out.article.canonical_id, first.canonical_id);
        assert_eq!(out.article.version, 2);
        assert_eq!(out.article.last_merged_at, later);
    }

    #[test]
    fn canonical_id_is_stable() {
        let id = canonical_id_for("a/1");
        assert_eq!(id, canonical_id_for("a/1"));
        assert_ne!(id, canonical_id_for("a/2"));
        assert!(id.starts_with("art_"));
        assert_eq!(id.len(), 20);
    }
}
