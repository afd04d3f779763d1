pub mod energy;
pub mod merge;
pub mod weather;

use crate::quality::QualityWarning;
use chrono::NaiveDate;
use serde_json::Value;

pub use self::energy::normalize_energy;
pub use self::merge::merge_city;
pub use self::weather::normalize_weather;

/// A normalizer's output: the table (None when the input could not be
/// turned into one) and every warning raised on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub rows: Option<Vec<T>>,
    pub warnings: Vec<QualityWarning>,
}

impl<T> Normalized<T> {
    pub fn empty() -> Self {
        Self {
            rows: Some(Vec::new()),
            warnings: Vec::new(),
        }
    }

    pub fn failed(warnings: Vec<QualityWarning>) -> Self {
        Self { rows: None, warnings }
    }
}

// ── Parsers ───────────────────────────────────────────────────────────────────

/// Calendar date of a provider timestamp.
/// "2024-01-01T00:00:00" | "2024-01-01T13" | "2024-01-01" → 2024-01-01
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let head = s.get(..10)?;
    let rest = &s[10..];
    if !rest.is_empty() && !rest.starts_with('T') && !rest.starts_with(' ') {
        return None;
    }
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Lenient numeric coercion: numbers and numeric strings pass, anything
/// else (including NaN/inf) becomes None.
pub fn coerce_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|x| x.is_finite())
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_date() {
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1);
        assert_eq!(parse_date("2024-01-01T00:00:00"), jan1);
        assert_eq!(parse_date("2024-01-01T13"), jan1);
        assert_eq!(parse_date(" 2024-01-01 "), jan1);
        assert_eq!(parse_date("2024-01-01 06:00"), jan1);
        assert_eq!(parse_date("2024-13-01"), None);
        assert_eq!(parse_date("2024-01-015"), None);
        assert_eq!(parse_date("Jan 1"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_coerce_number() {
        assert_eq!(coerce_number(&json!(12.5)), Some(12.5));
        assert_eq!(coerce_number(&json!("100")), Some(100.0));
        assert_eq!(coerce_number(&json!(" -50.25 ")), Some(-50.25));
        assert_eq!(coerce_number(&json!("1,234")), Some(1234.0));
        assert_eq!(coerce_number(&json!("N/A")), None);
        assert_eq!(coerce_number(&json!("nan")), None);
        assert_eq!(coerce_number(&json!(null)), None);
        assert_eq!(coerce_number(&json!({ "v": 1 })), None);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(50.0), 50.0);
        assert_eq!(round2(33.456), 33.46);
        assert_eq!(round2(-0.004), -0.0);
    }
}
