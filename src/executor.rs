//! Query Executor contract
//!
//! The engine never talks to an Analysis Services endpoint directly; the
//! consumer supplies an implementation of [`QueryExecutor`] wired to its
//! connection layer. All result records carry an explicit success flag so
//! executor failures can be surfaced verbatim in operation responses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single result row: column name -> JSON value
pub type Row = serde_json::Map<String, Value>;

/// Result of a raw `$SYSTEM` DMV query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DmvResult {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of an `INFO.*` catalog query (MEASURES, TABLES, COLUMNS,
/// RELATIONSHIPS, PARTITIONS)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoResult {
    pub success: bool,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of executing a DAX query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaxResult {
    pub success: bool,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Storage/formula engine split captured by a profiled execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnginePerformance {
    /// Total execution time (ms)
    #[serde(rename = "Total")]
    pub total_ms: f64,
    /// Storage engine time (ms)
    #[serde(rename = "SE")]
    pub se_ms: f64,
    /// Formula engine time (ms)
    #[serde(rename = "FE")]
    pub fe_ms: f64,
    #[serde(rename = "SE_Queries")]
    pub se_queries: u32,
    #[serde(rename = "FE_Queries")]
    pub fe_queries: u32,
}

/// Result of a profiled DAX execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilingResult {
    pub success: bool,
    #[serde(default)]
    pub performance: EnginePerformance,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Abstract query executor supplied by the consumer
///
/// Implementations are expected to be thread-safe; the debug orchestrator
/// dispatches up to `max_workers` concurrent calls during page profiling.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute a raw `$SYSTEM` DMV catalog query
    async fn execute_dmv_query(&self, dmv_sql: &str) -> DmvResult;

    /// Execute an `INFO.*` catalog query by name (e.g. "MEASURES")
    async fn execute_info_query(&self, catalog: &str) -> InfoResult;

    /// Validate and execute a DAX query, returning at most `top_n` rows
    async fn validate_and_execute_dax(&self, dax_query: &str, top_n: usize) -> DaxResult;

    /// Execute a DAX query with server-side trace capture
    async fn execute_dax_with_profiling(&self, dax: &str, timeout_secs: u64) -> ProfilingResult;
}

/// Look up a row field by canonical name, falling back to the bracketed form.
///
/// DMV result column names vary by engine version (`Name` vs `[Name]`); every
/// field access goes through this adapter so the variance is handled once.
pub fn row_field<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    row.get(name).or_else(|| row.get(&format!("[{name}]")))
}

/// String-typed row field via [`row_field`], empty-trimmed to `None`
pub fn row_str(row: &Row, name: &str) -> Option<String> {
    match row_field(row, name)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Integer-typed row field via [`row_field`]
pub fn row_i64(row: &Row, name: &str) -> Option<i64> {
    match row_field(row, name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Boolean-typed row field via [`row_field`]
pub fn row_bool(row: &Row, name: &str) -> Option<bool> {
    match row_field(row, name)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_i64().unwrap_or(0) != 0),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        _ => None,
    }
}

/// First cell of a row in column order (single-value queries)
pub fn first_cell(row: &Row) -> Option<&Value> {
    row.values().next()
}

/// Interpret a JSON cell as f64 when numeric
pub fn cell_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_row_field_tries_bracketed_key() {
        let r = row(&[("[Name]", json!("Total Sales"))]);
        assert_eq!(row_str(&r, "Name").as_deref(), Some("Total Sales"));

        let r = row(&[("Name", json!("Total Sales"))]);
        assert_eq!(row_str(&r, "Name").as_deref(), Some("Total Sales"));
    }

    #[test]
    fn test_row_i64_parses_strings() {
        let r = row(&[("SystemFlags", json!("2"))]);
        assert_eq!(row_i64(&r, "SystemFlags"), Some(2));

        let r = row(&[("[SystemFlags]", json!(2))]);
        assert_eq!(row_i64(&r, "SystemFlags"), Some(2));
    }

    #[test]
    fn test_row_bool_accepts_numbers() {
        let r = row(&[("IsActive", json!(1))]);
        assert_eq!(row_bool(&r, "IsActive"), Some(true));
        let r = row(&[("IsActive", json!("FALSE"))]);
        assert_eq!(row_bool(&r, "IsActive"), Some(false));
    }
}
