//! Identifier validation and canonicalization.
//!
//! Known schemes are validated and rewritten to a single canonical form:
//!
//! - `isbn`: ISBN-13 digits (ISBN-10 is checksum-validated and converted)
//! - `doi`: lowercase `10.<registrant>/<suffix>`, resolver prefixes removed
//! - `issn`: `NNNN-NNNC` with a valid check character
//!
//! Unknown schemes are kept verbatim (trimmed) under a lowercase key.
//! Malformed values are rejected, never repaired by guessing.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::NormalizationWarning;

/// Top-level payload keys that carry a single identifier.
const TOP_LEVEL_KEYS: [(&str, &str); 5] = [
    ("isbn", "isbn"),
    ("isbn13", "isbn"),
    ("isbn10", "isbn"),
    ("doi", "doi"),
    ("issn", "issn"),
];

fn doi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^10\.\d{4,9}/\S+$").expect("static regex"))
}

pub(crate) fn collect_identifiers(
    obj: &Map<String, Value>,
    warnings: &mut Vec<NormalizationWarning>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    match obj.get("identifiers") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (scheme, value) in map {
                add_identifier(&mut out, scheme, value, warnings);
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let scheme = item
                    .get("scheme")
                    .or_else(|| item.get("type"))
                    .and_then(Value::as_str);
                match (scheme, item.get("value")) {
                    (Some(scheme), Some(value)) => {
                        add_identifier(&mut out, scheme, value, warnings)
                    }
                    _ => warnings.push(NormalizationWarning::IgnoredField(
                        "identifiers".to_string(),
                    )),
                }
            }
        }
        Some(_) => warnings.push(NormalizationWarning::IgnoredField(
            "identifiers".to_string(),
        )),
    }

    for (key, scheme) in TOP_LEVEL_KEYS {
        if let Some(value) = obj.get(key) {
            add_identifier(&mut out, scheme, value, warnings);
        }
    }

    out
}

fn add_identifier(
    out: &mut BTreeMap<String, String>,
    raw_scheme: &str,
    value: &Value,
    warnings: &mut Vec<NormalizationWarning>,
) {
    let scheme = canonical_scheme(raw_scheme);
    let text = match value {
        Value::Null => return,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => {
            warnings.push(NormalizationWarning::IgnoredField(format!(
                "identifiers.{}",
                scheme
            )));
            return;
        }
    };
    if text.is_empty() || scheme.is_empty() {
        return;
    }

    match canonicalize_identifier(&scheme, &text) {
        Ok(canonical) => match out.get(&scheme) {
            Some(existing) if existing != &canonical => {
                warnings.push(NormalizationWarning::DuplicateIdentifier {
                    scheme,
                    dropped: canonical,
                });
            }
            Some(_) => {}
            None => {
                out.insert(scheme, canonical);
            }
        },
        Err(reason) => warnings.push(NormalizationWarning::RejectedIdentifier {
            scheme,
            value: text,
            reason,
        }),
    }
}

/// Map scheme spellings (`ISBN-13`, `isbn_10`, `DOI`) to a canonical key.
pub fn canonical_scheme(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let compact: String = lowered
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect();
    match compact.as_str() {
        "isbn" | "isbn10" | "isbn13" => "isbn".to_string(),
        "doi" => "doi".to_string(),
        "issn" | "eissn" | "pissn" => "issn".to_string(),
        _ => lowered,
    }
}

/// Validate and canonicalize one identifier value.
pub fn canonicalize_identifier(scheme: &str, value: &str) -> Result<String, &'static str> {
    match scheme {
        "isbn" => canonical_isbn(value),
        "doi" => canonical_doi(value),
        "issn" => canonical_issn(value),
        _ => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err("empty value")
            } else {
                Ok(trimmed.to_string())
            }
        }
    }
}

fn canonical_isbn(value: &str) -> Result<String, &'static str> {
    let upper = value.trim().to_ascii_uppercase();
    let body = upper
        .strip_prefix("ISBN")
        .map(|rest| rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace()))
        .unwrap_or(&upper);
    let compact: String = body.chars().filter(|c| !matches!(c, '-' | ' ')).collect();
    if !compact.is_ascii() {
        return Err("non-digit character");
    }

    match compact.len() {
        13 => {
            let digits = to_digits(&compact).ok_or("non-digit character")?;
            let sum: u32 = digits
                .iter()
                .enumerate()
                .map(|(i, d)| if i % 2 == 0 { *d } else { d * 3 })
                .sum();
            if sum % 10 == 0 {
                Ok(compact)
            } else {
                Err("bad ISBN-13 checksum")
            }
        }
        10 => {
            let (head, check) = compact.split_at(9);
            let digits = to_digits(head).ok_or("non-digit character")?;
            let check = match check {
                "X" => 10,
                d => d.parse::<u32>().map_err(|_| "non-digit character")?,
            };
            let sum: u32 = digits
                .iter()
                .enumerate()
                .map(|(i, d)| (10 - i as u32) * d)
                .sum::<u32>()
                + check;
            if sum % 11 != 0 {
                return Err("bad ISBN-10 checksum");
            }
            let mut isbn13 = format!("978{}", head);
            let digits13 = to_digits(&isbn13).ok_or("non-digit character")?;
            let partial: u32 = digits13
                .iter()
                .enumerate()
                .map(|(i, d)| if i % 2 == 0 { *d } else { d * 3 })
                .sum();
            isbn13.push_str(&((10 - partial % 10) % 10).to_string());
            Ok(isbn13)
        }
        _ => Err("ISBN must have 10 or 13 digits"),
    }
}

fn canonical_doi(value: &str) -> Result<String, &'static str> {
    let lowered = value.trim().to_lowercase();
    let mut doi = lowered.as_str();
    for prefix in [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ] {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.trim();
            break;
        }
    }
    if doi_re().is_match(doi) {
        Ok(doi.to_string())
    } else {
        Err("not a 10.<registrant>/<suffix> DOI")
    }
}

fn canonical_issn(value: &str) -> Result<String, &'static str> {
    let compact: String = value
        .trim()
        .to_ascii_uppercase()
        .chars()
        .filter(|c| !matches!(c, '-' | ' '))
        .collect();
    if !compact.is_ascii() || compact.len() != 8 {
        return Err("ISSN must have 8 characters");
    }
    let (head, check) = compact.split_at(7);
    let digits = to_digits(head).ok_or("non-digit character")?;
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| (8 - i as u32) * d)
        .sum();
    let expected = match (11 - sum % 11) % 11 {
        10 => "X".to_string(),
        n => n.to_string(),
    };
    if check != expected {
        return Err("bad ISSN check character");
    }
    Ok(format!("{}-{}", &compact[..4], &compact[4..]))
}

fn to_digits(s: &str) -> Option<Vec<u32>> {
    s.chars().map(|c| c.to_digit(10)).collect()
}
