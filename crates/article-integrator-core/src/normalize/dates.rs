//! Publication date parsing.
//!
//! Partial dates are widened to their first day: `1965-08` → 1965-08-01,
//! `1965` → 1965-01-01.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

const FULL_DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Parse a payload date value.
///
/// `Ok(None)` for null or blank values; `Err(raw)` when a value is present
/// but unparseable.
pub fn parse_date_value(value: &Value) -> Result<Option<NaiveDate>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .and_then(|y| i32::try_from(y).ok())
            .and_then(year_start)
            .map(Some)
            .ok_or_else(|| n.to_string()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_date(s).map(Some).ok_or_else(|| s.clone()),
        other => Err(other.to_string()),
    }
}

/// Parse one of the supported textual date formats.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in FULL_DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }

    // "August 1965"
    if let Ok(d) = NaiveDate::parse_from_str(&format!("1 {}", s), "%d %B %Y") {
        return Some(d);
    }

    // "1965-08" / "1965/08"
    if let Some((y, m)) = s.split_once(|c: char| c == '-' || c == '/') {
        if y.len() == 4 && (1..=2).contains(&m.len()) {
            let year = y.parse::<i32>().ok()?;
            let month = m.parse::<u32>().ok()?;
            return NaiveDate::from_ymd_opt(year, month, 1);
        }
    }

    if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse::<i32>().ok().and_then(year_start);
    }

    None
}

fn year_start(year: i32) -> Option<NaiveDate> {
    if (1..=9999).contains(&year) {
        NaiveDate::from_ymd_opt(year, 1, 1)
    } else {
        None
    }
}
