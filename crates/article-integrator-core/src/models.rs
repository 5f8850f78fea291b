//! Data models flowing through the integration pipeline.
//!
//! ```text
//! RawRecord ─▶ ArticleRecord ─▶ MatchGroup ─▶ IntegratedArticle
//! (adapter)    (normalizer)     (resolver)    (merge engine, persisted)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::author_key;

/// Names of the resolved fields of an [`IntegratedArticle`].
pub mod fields {
    pub const TITLE: &str = "title";
    pub const AUTHORS: &str = "authors";
    pub const PUBLISHED_DATE: &str = "published_date";
    pub const PUBLISHER: &str = "publisher";
    pub const LANGUAGE: &str = "language";
    pub const SUMMARY: &str = "summary";

    /// Prefix of per-scheme identifier fields (`identifier.isbn`).
    pub const IDENTIFIER_PREFIX: &str = "identifier.";

    /// Scalar fields resolved by trust rank, in resolution order.
    pub const SCALAR: [&str; 6] = [TITLE, AUTHORS, PUBLISHED_DATE, PUBLISHER, LANGUAGE, SUMMARY];

    pub fn identifier(scheme: &str) -> String {
        format!("{}{}", IDENTIFIER_PREFIX, scheme)
    }
}

/// Stable key of a source record: `"{source_id}/{source_native_id}"`.
pub fn record_key(source_id: &str, source_native_id: &str) -> String {
    format!("{}/{}", source_id, source_native_id)
}

/// A record exactly as an adapter produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Label of the adapter that produced the record (e.g. `"http:openlibrary"`).
    pub source_id: String,
    /// The provider's own identifier for the record.
    pub source_native_id: String,
    /// Provider-specific payload. Interpreted only by the normalizer.
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(
        source_id: impl Into<String>,
        source_native_id: impl Into<String>,
        payload: serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source_native_id: source_native_id.into(),
            payload,
            fetched_at,
        }
    }

    pub fn record_key(&self) -> String {
        record_key(&self.source_id, &self.source_native_id)
    }
}

/// Canonical, schema-conformant form of one [`RawRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    /// Display title: trimmed, whitespace collapsed, original casing.
    pub title: String,
    /// Case-folded, punctuation-free title used for matching.
    pub title_key: String,
    pub authors: Vec<String>,
    /// Identifier scheme (`isbn`, `doi`, `issn`, ...) to canonical value.
    pub identifiers: BTreeMap<String, String>,
    pub published_date: Option<NaiveDate>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub summary: Option<String>,
    pub source_id: String,
    pub source_native_id: String,
    pub fetched_at: DateTime<Utc>,
}

impl ArticleRecord {
    pub fn record_key(&self) -> String {
        record_key(&self.source_id, &self.source_native_id)
    }

    /// Normalized author names, for overlap checks.
    pub fn author_keys(&self) -> BTreeSet<String> {
        self.authors
            .iter()
            .map(|a| author_key(a))
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// The value this record supplies for a resolved field, if non-empty.
    pub fn field_value(&self, field: &str) -> Option<FieldValue> {
        match field {
            fields::TITLE => non_empty_text(&self.title),
            fields::AUTHORS if !self.authors.is_empty() => {
                Some(FieldValue::List(self.authors.clone()))
            }
            fields::PUBLISHED_DATE => self.published_date.map(FieldValue::Date),
            fields::PUBLISHER => self.publisher.as_deref().and_then(non_empty_text),
            fields::LANGUAGE => self.language.as_deref().and_then(non_empty_text),
            fields::SUMMARY => self.summary.as_deref().and_then(non_empty_text),
            other => other
                .strip_prefix(fields::IDENTIFIER_PREFIX)
                .and_then(|scheme| self.identifiers.get(scheme))
                .and_then(|v| non_empty_text(v)),
        }
    }
}

fn non_empty_text(s: &str) -> Option<FieldValue> {
    if s.trim().is_empty() {
        None
    } else {
        Some(FieldValue::Text(s.to_string()))
    }
}

/// A resolved field value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::List(items) => f.write_str(&items.join("; ")),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// Records believed to denote one real-world article.
///
/// Always non-empty; members are sorted by record key so that equal groups
/// compare equal regardless of the order the resolver saw them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchGroup {
    records: Vec<ArticleRecord>,
}

impl MatchGroup {
    /// Build a group. Returns `None` for an empty record list.
    pub fn new(mut records: Vec<ArticleRecord>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        records.sort_by_key(|r| r.record_key());
        Some(Self { records })
    }

    pub fn records(&self) -> &[ArticleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_keys(&self) -> BTreeSet<String> {
        self.records.iter().map(|r| r.record_key()).collect()
    }

    pub fn sources(&self) -> BTreeSet<String> {
        self.records.iter().map(|r| r.source_id.clone()).collect()
    }

    /// All `(scheme, value)` identifier pairs across members.
    pub fn identifiers(&self) -> BTreeSet<(String, String)> {
        self.records
            .iter()
            .flat_map(|r| r.identifiers.iter().map(|(s, v)| (s.clone(), v.clone())))
            .collect()
    }

    /// Smallest record key; seeds the canonical id of a new article.
    pub fn anchor_key(&self) -> String {
        self.records[0].record_key()
    }
}

/// The merged, authoritative article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegratedArticle {
    pub canonical_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Field name to the `source_id` whose value won.
    pub provenance: BTreeMap<String, String>,
    pub contributing_sources: BTreeSet<String>,
    /// Record keys folded into this article.
    #[serde(default)]
    pub members: BTreeSet<String>,
    pub version: u64,
    pub last_merged_at: DateTime<Utc>,
    /// Set when another article absorbed this one.
    #[serde(default)]
    pub superseded_by: Option<String>,
}

impl IntegratedArticle {
    pub fn title(&self) -> Option<&str> {
        self.fields.get(fields::TITLE).and_then(FieldValue::as_text)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Identifier scheme to value, taken from the `identifier.*` fields.
    pub fn identifiers(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter_map(|(name, value)| {
                let scheme = name.strip_prefix(fields::IDENTIFIER_PREFIX)?;
                Some((scheme.to_string(), value.as_text()?.to_string()))
            })
            .collect()
    }

    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// True if the resolved content differs, ignoring version and timestamp.
    pub fn content_differs(&self, other: &IntegratedArticle) -> bool {
        self.fields != other.fields
            || self.provenance != other.provenance
            || self.contributing_sources != other.contributing_sources
            || self.members != other.members
            || self.superseded_by != other.superseded_by
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source: &str, id: &str) -> ArticleRecord {
        ArticleRecord {
            title: "Dune".into(),
            title_key: "dune".into(),
            authors: vec!["Frank Herbert".into()],
            identifiers: BTreeMap::from([("isbn".to_string(), "9780441013593".to_string())]),
            published_date: None,
            publisher: Some("  ".into()),
            language: None,
            summary: None,
            source_id: source.into(),
            source_native_id: id.into(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn match_group_rejects_empty_and_sorts_members() {
        assert!(MatchGroup::new(vec![]).is_none());
        let group = MatchGroup::new(vec![record("b", "1"), record("a", "2")]).unwrap();
        assert_eq!(group.anchor_key(), "a/2");
        assert_eq!(group.sources().len(), 2);
    }

    #[test]
    fn blank_values_are_not_supplied() {
        let r = record("a", "1");
        assert_eq!(r.field_value(fields::PUBLISHER), None);
        assert_eq!(
            r.field_value("identifier.isbn"),
            Some(FieldValue::Text("9780441013593".into()))
        );
        assert_eq!(r.field_value("identifier.doi"), None);
    }

    #[test]
    fn identifiers_are_read_back_from_fields() {
        let mut article = IntegratedArticle {
            canonical_id: "art_x".into(),
            fields: BTreeMap::new(),
            provenance: BTreeMap::new(),
            contributing_sources: BTreeSet::new(),
            members: BTreeSet::new(),
            version: 1,
            last_merged_at: Utc::now(),
            superseded_by: None,
        };
        article
            .fields
            .insert(fields::identifier("doi"), FieldValue::Text("10.1/x".into()));
        article
            .fields
            .insert(fields::TITLE.into(), FieldValue::Text("X".into()));
        assert_eq!(article.identifiers().get("doi").map(String::as_str), Some("10.1/x"));
        assert_eq!(article.title(), Some("X"));
    }
}
