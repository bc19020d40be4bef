//! Loose coercion of raw cells into typed values. Anything unusable becomes `None`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use plhub_core::RawValue;

const NULL_SENTINELS: &[&str] = &["", "-", "--", "n/a", "na", "null", "none", "nan", "?"];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%d/%m/%y",
    "%d %b %Y",
    "%d %B %Y",
    "%a %d %b %Y",
    "%A %d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
];

fn is_null_sentinel(text: &str) -> bool {
    NULL_SENTINELS
        .iter()
        .any(|s| text.eq_ignore_ascii_case(s))
}

/// Trimmed text with inner whitespace collapsed; null sentinels become `None`.
pub fn clean_text(raw: Option<&RawValue>) -> Option<String> {
    let text = raw?.as_text()?;
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if is_null_sentinel(&collapsed) {
        None
    } else {
        Some(collapsed)
    }
}

fn numeric_text(raw: Option<&RawValue>) -> Option<String> {
    let text = clean_text(raw)?;
    let stripped: String = text
        .trim_end_matches('%')
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' ' | '\u{a0}'))
        .collect();
    (!stripped.is_empty()).then_some(stripped)
}

pub fn clean_float(raw: Option<&RawValue>) -> Option<f64> {
    if let Some(RawValue::Number(n)) = raw {
        return n.is_finite().then_some(*n);
    }
    numeric_text(raw)?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Integral values only: "3", "3.0" and "1,024" parse; "2.5" does not.
pub fn clean_int(raw: Option<&RawValue>) -> Option<i64> {
    if let Some(RawValue::Number(n)) = raw {
        return float_to_int(*n);
    }
    let text = numeric_text(raw)?;
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().and_then(float_to_int))
}

fn float_to_int(value: f64) -> Option<i64> {
    (value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64)
        .then_some(value as i64)
}

pub fn clean_bool(raw: Option<&RawValue>) -> Option<bool> {
    if let Some(RawValue::Number(n)) = raw {
        return match *n {
            v if v == 1.0 => Some(true),
            v if v == 0.0 => Some(false),
            _ => None,
        };
    }
    let text = clean_text(raw)?.to_lowercase();
    match text.as_str() {
        "true" | "t" | "yes" | "y" | "1" | "starter" | "started" | "xi" => Some(true),
        "false" | "f" | "no" | "n" | "0" | "sub" | "substitute" | "bench" => Some(false),
        _ => None,
    }
}

/// Calendar date from common export formats. A time of day, if present, is dropped.
pub fn clean_date(raw: Option<&RawValue>) -> Option<NaiveDate> {
    let text = clean_text(raw)?;
    parse_date(&text)
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
    {
        return Some(date);
    }
    if let Some(stamp) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
    {
        return Some(stamp.date());
    }
    DateTime::parse_from_rfc3339(text).ok().map(|d| d.date_naive())
}
