//! PBIP typed literals
//!
//! Power BI serializes filter and slicer values with type suffixes:
//! `'text'L` for strings, `123L` for integers, `123.45D`/`123.45M` for
//! decimals, `trueL`/`falseL` for booleans. The tag survives parsing so the
//! value formats back to DAX losslessly; in particular the string `"0"`
//! never degrades to the integer `0`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A literal with its preserved type tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
    /// ISO `YYYY-MM-DD`; emits `DATE(y, m, d)`
    Date(String),
    /// Unrecognized raw token; the DAX emitter re-inspects it
    Unknown(String),
}

impl TypedValue {
    /// Parse a PBIP literal token. Rules are applied in order: quoted+L,
    /// quoted, boolean+L, integer+L, decimal D/M, booleans, then unknown.
    pub fn parse_literal(raw: &str) -> TypedValue {
        let value = raw.trim();

        // 'text'L / "text"L
        if value.len() >= 3 && value.ends_with("'L") && value.starts_with('\'') {
            return TypedValue::Text(value[1..value.len() - 2].to_string());
        }
        if value.len() >= 3 && value.ends_with("\"L") && value.starts_with('"') {
            return TypedValue::Text(value[1..value.len() - 2].to_string());
        }

        // bare quoted strings
        if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            return TypedValue::Text(value[1..value.len() - 1].to_string());
        }
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            return TypedValue::Text(value[1..value.len() - 1].to_string());
        }

        let lower = value.to_ascii_lowercase();
        if lower == "truel" || lower == "falsel" {
            return TypedValue::Boolean(lower == "truel");
        }

        // 123L
        if let Some(digits) = value.strip_suffix(['L', 'l']) {
            let unsigned = digits.strip_prefix('-').unwrap_or(digits);
            if !unsigned.is_empty() && unsigned.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = digits.parse::<i64>() {
                    return TypedValue::Integer(n);
                }
            }
        }

        // 123.45D / 123.45M
        if let Some(num) = value.strip_suffix(['D', 'd', 'M', 'm']) {
            if num.contains('.') {
                if let Ok(f) = num.parse::<f64>() {
                    return TypedValue::Decimal(f);
                }
            }
        }

        if lower == "true" || lower == "false" {
            return TypedValue::Boolean(lower == "true");
        }

        TypedValue::Unknown(value.to_string())
    }

    /// Convert a JSON value (already typed by the bundle parser)
    pub fn from_json(value: &Value) -> TypedValue {
        match value {
            Value::Bool(b) => TypedValue::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    TypedValue::Integer(i)
                } else {
                    TypedValue::Decimal(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => TypedValue::parse_literal(s),
            Value::Null => TypedValue::Unknown("null".to_string()),
            other => TypedValue::Unknown(other.to_string()),
        }
    }

    /// NULL sentinel check: `null`, `'null'L`, `blank` (case-insensitive)
    pub fn is_null(&self) -> bool {
        match self {
            TypedValue::Text(s) | TypedValue::Unknown(s) => {
                let lower = s.trim().to_ascii_lowercase();
                matches!(
                    lower.as_str(),
                    "null" | "'null'l" | "\"null\"l" | "blank" | "'blank'l"
                )
            }
            _ => false,
        }
    }

    /// Display form without DAX quoting
    pub fn display(&self) -> String {
        match self {
            TypedValue::Boolean(b) => b.to_string(),
            TypedValue::Integer(n) => n.to_string(),
            TypedValue::Decimal(f) => f.to_string(),
            TypedValue::Text(s) | TypedValue::Date(s) | TypedValue::Unknown(s) => s.clone(),
        }
    }

    /// Format for DAX. Known tags are emitted losslessly; unknown tokens are
    /// re-inspected: a clean numeric literal without leading zeros is
    /// numeric, ISO dates become `DATE(y, m, d)`, anything else is a
    /// double-quoted string with embedded quotes doubled.
    pub fn to_dax(&self) -> String {
        match self {
            TypedValue::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            TypedValue::Integer(n) => n.to_string(),
            TypedValue::Decimal(f) => f.to_string(),
            TypedValue::Text(s) => quote_dax_string(s),
            TypedValue::Date(s) => {
                iso_date_to_dax(s).unwrap_or_else(|| quote_dax_string(s))
            }
            TypedValue::Unknown(s) => {
                if self.is_null() {
                    return "BLANK()".to_string();
                }
                if let Some(date) = iso_date_to_dax(s) {
                    return date;
                }
                let stripped = s.trim();
                if is_clean_integer(stripped) || is_clean_decimal(stripped) {
                    return stripped.to_string();
                }
                let lower = stripped.to_ascii_lowercase();
                if lower == "true" || lower == "false" {
                    return lower.to_ascii_uppercase();
                }
                quote_dax_string(stripped)
            }
        }
    }

    /// Retag an unknown/text value using the target column's model data type
    pub fn coerce(self, target: ValueTag) -> TypedValue {
        match (target, &self) {
            (ValueTag::Date, TypedValue::Text(s) | TypedValue::Unknown(s))
                if parse_iso_date(s).is_some() =>
            {
                TypedValue::Date(s.clone())
            }
            (ValueTag::Integer, TypedValue::Unknown(s)) => {
                s.trim().parse::<i64>().map(TypedValue::Integer).unwrap_or(self)
            }
            (ValueTag::Decimal, TypedValue::Unknown(s)) => {
                s.trim().parse::<f64>().map(TypedValue::Decimal).unwrap_or(self)
            }
            (ValueTag::Boolean, TypedValue::Unknown(s)) => {
                let lower = s.trim().to_ascii_lowercase();
                match lower.as_str() {
                    "true" => TypedValue::Boolean(true),
                    "false" => TypedValue::Boolean(false),
                    _ => self,
                }
            }
            (ValueTag::Text, TypedValue::Unknown(s)) => TypedValue::Text(s.clone()),
            _ => self,
        }
    }

    pub fn tag(&self) -> ValueTag {
        match self {
            TypedValue::Boolean(_) => ValueTag::Boolean,
            TypedValue::Integer(_) => ValueTag::Integer,
            TypedValue::Decimal(_) => ValueTag::Decimal,
            TypedValue::Text(_) => ValueTag::Text,
            TypedValue::Date(_) => ValueTag::Date,
            TypedValue::Unknown(_) => ValueTag::Unknown,
        }
    }
}

/// Type tags, also used for model column types loaded from the COLUMNS DMV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueTag {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Unknown,
}

impl ValueTag {
    /// Map a Power BI model data-type name
    pub fn from_model_type(data_type: &str) -> ValueTag {
        match data_type {
            "String" | "Binary" => ValueTag::Text,
            "Int64" => ValueTag::Integer,
            "Double" | "Decimal" | "Currency" => ValueTag::Decimal,
            "DateTime" | "Date" => ValueTag::Date,
            "Boolean" => ValueTag::Boolean,
            _ => ValueTag::Unknown,
        }
    }
}

fn quote_dax_string(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn is_clean_integer(s: &str) -> bool {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    unsigned.len() == 1 || !unsigned.starts_with('0')
}

fn is_clean_decimal(s: &str) -> bool {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    let Some((int_part, frac_part)) = unsigned.split_once('.') else {
        return false;
    };
    !int_part.is_empty()
        && !frac_part.is_empty()
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && frac_part.bytes().all(|b| b.is_ascii_digit())
}

fn parse_iso_date(s: &str) -> Option<(i32, u32, u32)> {
    let s = s.trim();
    if s.len() != 10 {
        return None;
    }
    let bytes = s.as_bytes();
    if bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[5..7].parse().ok()?;
    let day: u32 = s[8..10].parse().ok()?;
    (1..=12).contains(&month).then_some(())?;
    (1..=31).contains(&day).then_some(())?;
    Some((year, month, day))
}

fn iso_date_to_dax(s: &str) -> Option<String> {
    let (y, m, d) = parse_iso_date(s)?;
    Some(format!("DATE({y}, {m}, {d})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_parsing() {
        assert_eq!(TypedValue::parse_literal("'EU'L"), TypedValue::Text("EU".into()));
        assert_eq!(TypedValue::parse_literal("\"EU\"L"), TypedValue::Text("EU".into()));
        assert_eq!(TypedValue::parse_literal("'0'L"), TypedValue::Text("0".into()));
        assert_eq!(TypedValue::parse_literal("123L"), TypedValue::Integer(123));
        assert_eq!(TypedValue::parse_literal("-7L"), TypedValue::Integer(-7));
        assert_eq!(TypedValue::parse_literal("1.25D"), TypedValue::Decimal(1.25));
        assert_eq!(TypedValue::parse_literal("99.5M"), TypedValue::Decimal(99.5));
        assert_eq!(TypedValue::parse_literal("trueL"), TypedValue::Boolean(true));
        assert_eq!(TypedValue::parse_literal("FALSE"), TypedValue::Boolean(false));
    }

    #[test]
    fn test_string_zero_round_trip() {
        // "0" tagged as string must never render as integer 0
        let v = TypedValue::parse_literal("'0'L");
        assert_eq!(v.to_dax(), "\"0\"");

        let reparsed = TypedValue::parse_literal(&v.to_dax());
        assert_eq!(reparsed, TypedValue::Text("0".into()));
        assert_eq!(reparsed.to_dax(), "\"0\"");
    }

    #[test]
    fn test_known_tags_round_trip() {
        for raw in ["123L", "1.5D", "trueL", "'abc'L"] {
            let v = TypedValue::parse_literal(raw);
            let emitted = v.to_dax();
            let reparsed = TypedValue::parse_literal(&emitted);
            assert_eq!(reparsed.to_dax(), emitted, "value changed for {raw}");
        }

        // string and boolean tags survive exactly
        assert_eq!(TypedValue::parse_literal("\"abc\"").tag(), ValueTag::Text);
        assert_eq!(TypedValue::parse_literal("TRUE").tag(), ValueTag::Boolean);
    }

    #[test]
    fn test_null_sentinels() {
        assert!(TypedValue::parse_literal("null").is_null());
        assert!(TypedValue::parse_literal("'null'L").is_null());
        assert!(TypedValue::parse_literal("BLANK").is_null());
        assert!(!TypedValue::parse_literal("'EU'L").is_null());
        assert!(!TypedValue::Integer(0).is_null());
    }

    #[test]
    fn test_unknown_numeric_detection() {
        assert_eq!(TypedValue::Unknown("42".into()).to_dax(), "42");
        assert_eq!(TypedValue::Unknown("4.5".into()).to_dax(), "4.5");
        // leading zero means it is an identifier-like string, not a number
        assert_eq!(TypedValue::Unknown("007".into()).to_dax(), "\"007\"");
        assert_eq!(TypedValue::Unknown("0".into()).to_dax(), "0");
    }

    #[test]
    fn test_iso_date_emission() {
        assert_eq!(
            TypedValue::Unknown("2024-03-05".into()).to_dax(),
            "DATE(2024, 3, 5)"
        );
        assert_eq!(TypedValue::Date("2024-12-31".into()).to_dax(), "DATE(2024, 12, 31)");
        // not a date shape
        assert_eq!(TypedValue::Unknown("2024-13-05".into()).to_dax(), "\"2024-13-05\"");
    }

    #[test]
    fn test_embedded_quotes_doubled() {
        assert_eq!(
            TypedValue::Text("he said \"hi\"".into()).to_dax(),
            "\"he said \"\"hi\"\"\""
        );
    }

    #[test]
    fn test_coerce_by_model_type() {
        let v = TypedValue::Unknown("2024-01-15".into()).coerce(ValueTag::Date);
        assert_eq!(v, TypedValue::Date("2024-01-15".into()));

        let v = TypedValue::Unknown("12".into()).coerce(ValueTag::Integer);
        assert_eq!(v, TypedValue::Integer(12));

        // strings keep their tag regardless of target
        let v = TypedValue::Text("0".into()).coerce(ValueTag::Integer);
        assert_eq!(v, TypedValue::Text("0".into()));
    }
}
