//! Author list parsing.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::collapse_whitespace;

fn conjunction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s+(?:and|&)\s+").expect("static regex"))
}

/// Parse an author value into an ordered, de-duplicated list of names.
///
/// Returns `None` when the value has a shape that cannot hold authors.
pub fn parse_authors(value: &Value) -> Option<Vec<String>> {
    let names: Vec<String> = match value {
        Value::Null => Vec::new(),
        Value::String(s) => split_author_string(s),
        Value::Array(items) => items.iter().filter_map(author_from_value).collect(),
        Value::Object(_) => author_from_value(value).into_iter().collect(),
        _ => return None,
    };

    let mut seen = HashSet::new();
    Some(
        names
            .into_iter()
            .filter(|n| !n.is_empty())
            .filter(|n| seen.insert(author_key(n)))
            .collect(),
    )
}

/// Matching key for an author name: lowercase alphanumeric words.
pub fn author_key(name: &str) -> String {
    let folded: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&folded)
}

fn author_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(reorder_name(s)),
        Value::Object(map) => {
            if let Some(Value::String(name)) = map.get("name") {
                return Some(reorder_name(name));
            }
            let given = map.get("given").and_then(Value::as_str).unwrap_or("");
            let family = map.get("family").and_then(Value::as_str).unwrap_or("");
            let joined = collapse_whitespace(&format!("{} {}", given, family));
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    }
}

fn split_author_string(s: &str) -> Vec<String> {
    if s.contains(';') {
        return s.split(';').map(reorder_name).collect();
    }
    if conjunction_re().is_match(s) {
        return conjunction_re().split(s).map(reorder_name).collect();
    }
    if s.matches(',').count() >= 2 {
        let parts: Vec<String> = s.split(',').map(collapse_whitespace).collect();
        if let Some(pairs) = last_initials_pairs(&parts) {
            return pairs;
        }
        return parts;
    }
    vec![reorder_name(s)]
}

/// `"Smith, J., Doe, K."` is a run of `Last, Initials` pairs, not four names.
fn last_initials_pairs(parts: &[String]) -> Option<Vec<String>> {
    if parts.len() % 2 != 0 {
        return None;
    }
    parts
        .chunks(2)
        .map(|pair| {
            let (last, initials) = (&pair[0], &pair[1]);
            let is_pair = !last.is_empty()
                && !initials_re().is_match(last)
                && initials_re().is_match(initials);
            is_pair.then(|| collapse_whitespace(&format!("{} {}", initials, last)))
        })
        .collect()
}

/// `"Herbert, Frank"` → `"Frank Herbert"`; other names are only cleaned.
fn reorder_name(raw: &str) -> String {
    let cleaned = collapse_whitespace(raw);
    match cleaned.split_once(',') {
        Some((last, first)) if !last.trim().is_empty() && !first.trim().is_empty() => {
            collapse_whitespace(&format!("{} {}", first, last))
        }
        _ => cleaned.trim_matches(',').trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_delimited_strings() {
        assert_eq!(
            parse_authors(&json!("Herbert, Frank; Anderson, Kevin J.")).unwrap(),
            vec!["Frank Herbert", "Kevin J. Anderson"]
        );
        assert_eq!(
            parse_authors(&json!("Terry Pratchett and Neil Gaiman")).unwrap(),
            vec!["Terry Pratchett", "Neil Gaiman"]
        );
        assert_eq!(
            parse_authors(&json!("A. One, B. Two, C. Three")).unwrap(),
            vec!["A. One", "B. Two", "C. Three"]
        );
    }

    #[test]
    fn pairs_surnames_with_initials() {
        assert_eq!(
            parse_authors(&json!("Smith, J., Doe, K.")).unwrap(),
            vec!["J. Smith", "K. Doe"]
        );
        assert_eq!(
            parse_authors(&json!("Le Guin, U. K., Butler, O. E.")).unwrap(),
            vec!["U. K. Le Guin", "O. E. Butler"]
        );
        // Full names stay a plain comma list.
        assert_eq!(
            parse_authors(&json!("Jane Smith, John Doe, Ann Lee, Bo Park")).unwrap(),
            vec!["Jane Smith", "John Doe", "Ann Lee", "Bo Park"]
        );
    }

    #[test]
    fn accepts_structured_authors() {
        let parsed = parse_authors(&json!([
            {"given": "Ursula K.", "family": "Le Guin"},
            {"name": "Le Guin, Ursula K."},
            "Someone Else"
        ]))
        .unwrap();
        assert_eq!(parsed, vec!["Ursula K. Le Guin", "Someone Else"]);
    }

    #[test]
    fn rejects_numbers() {
        assert!(parse_authors(&json!(12)).is_none());
    }

    #[test]
    fn author_key_ignores_case_and_punctuation() {
        assert_eq!(author_key("Kevin J. Anderson"), "kevin j anderson");
        assert_eq!(author_key("FRANK  HERBERT"), author_key("frank herbert"));
    }
}
