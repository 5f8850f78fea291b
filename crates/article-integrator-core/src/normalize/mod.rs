//! Normalization: [`RawRecord`] → [`ArticleRecord`].
//!
//! A pure function over the payload. Adapters map their providers onto a
//! loose JSON object; this module accepts the field aliases and value shapes
//! seen across providers and produces the canonical form:
//!
//! | Canonical field | Accepted payload keys |
//! |-----------------|-----------------------|
//! | `title` (required) | `title`, `name` |
//! | `authors` | `authors`, `author`, `creators` |
//! | `identifiers` | `identifiers` (object or `[{scheme, value}]`), `isbn`, `isbn10`, `isbn13`, `doi`, `issn` |
//! | `published_date` | `published_date`, `published`, `publication_date`, `date`, `year` |
//! | `publisher` | `publisher` |
//! | `language` | `language`, `lang` |
//! | `summary` | `summary`, `abstract`, `description` |
//!
//! Only a missing or unusable title fails the record. Everything else
//! degrades to a [`NormalizationWarning`].

pub mod authors;
pub mod dates;
pub mod identifiers;

use std::fmt;

use serde_json::{Map, Value};

use crate::error::NormalizationError;
use crate::models::{ArticleRecord, RawRecord};

pub use authors::{author_key, parse_authors};
pub use dates::{parse_date, parse_date_value};
pub use identifiers::{canonical_scheme, canonicalize_identifier};

/// A successfully normalized record plus the non-fatal issues found.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub record: ArticleRecord,
    pub warnings: Vec<NormalizationWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizationWarning {
    /// A malformed identifier was dropped.
    RejectedIdentifier {
        scheme: String,
        value: String,
        reason: &'static str,
    },
    /// The same scheme appeared twice with different values; the first was kept.
    DuplicateIdentifier { scheme: String, dropped: String },
    UnparseableDate(String),
    /// A field was present but had a shape we do not understand.
    IgnoredField(String),
}

impl fmt::Display for NormalizationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RejectedIdentifier {
                scheme,
                value,
                reason,
            } => write!(f, "rejected {} identifier {:?}: {}", scheme, value, reason),
            Self::DuplicateIdentifier { scheme, dropped } => {
                write!(f, "dropped second {} identifier {:?}", scheme, dropped)
            }
            Self::UnparseableDate(raw) => write!(f, "unparseable date {:?}", raw),
            Self::IgnoredField(field) => write!(f, "ignored field `{}`", field),
        }
    }
}

/// Normalize one raw record.
pub fn normalize(raw: &RawRecord) -> Result<NormalizedRecord, NormalizationError> {
    let record_key = raw.record_key();
    let obj = raw
        .payload
        .as_object()
        .ok_or_else(|| NormalizationError::NotAnObject {
            record_key: record_key.clone(),
        })?;

    let title = match first_present(obj, &["title", "name"]) {
        Some(Value::String(s)) => clean_title(s),
        Some(_) => {
            return Err(NormalizationError::InvalidField {
                record_key,
                field: "title".to_string(),
            })
        }
        None => String::new(),
    };
    let title_key = title_key(&title);
    if title_key.is_empty() {
        return Err(NormalizationError::MissingTitle { record_key });
    }

    let mut warnings = Vec::new();

    let authors = match first_present(obj, &["authors", "author", "creators"]) {
        None => Vec::new(),
        Some(value) => parse_authors(value).unwrap_or_else(|| {
            warnings.push(NormalizationWarning::IgnoredField("authors".to_string()));
            Vec::new()
        }),
    };

    let identifiers = identifiers::collect_identifiers(obj, &mut warnings);

    let published_date = match first_present(
        obj,
        &["published_date", "published", "publication_date", "date", "year"],
    ) {
        None => None,
        Some(value) => parse_date_value(value).unwrap_or_else(|raw| {
            warnings.push(NormalizationWarning::UnparseableDate(raw));
            None
        }),
    };

    let publisher = text_field(obj, &["publisher"], &mut warnings);
    let language =
        text_field(obj, &["language", "lang"], &mut warnings).map(|l| l.to_lowercase());
    let summary = text_field(obj, &["summary", "abstract", "description"], &mut warnings);

    Ok(NormalizedRecord {
        record: ArticleRecord {
            title,
            title_key,
            authors,
            identifiers,
            published_date,
            publisher,
            language,
            summary,
            source_id: raw.source_id.clone(),
            source_native_id: raw.source_native_id.clone(),
            fetched_at: raw.fetched_at,
        },
        warnings,
    })
}

/// Display form of a title: trimmed, wrapping quotes removed, whitespace collapsed.
pub fn clean_title(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '«' | '»'))
        .trim();
    collapse_whitespace(trimmed)
}

/// Match key of a title: lowercase words with punctuation removed.
pub fn title_key(title: &str) -> String {
    let folded: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&folded)
}

pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn text_field(
    obj: &Map<String, Value>,
    keys: &[&str],
    warnings: &mut Vec<NormalizationWarning>,
) -> Option<String> {
    match first_present(obj, keys)? {
        Value::String(s) => {
            let cleaned = collapse_whitespace(s);
            (!cleaned.is_empty()).then_some(cleaned)
        }
        _ => {
            warnings.push(NormalizationWarning::IgnoredField(keys[0].to_string()));
            None
        }
    }
}
