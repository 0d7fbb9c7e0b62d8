//! Semantic filter classification
//!
//! Classifies tables as data / field-parameter / UI-control using model
//! metadata rather than name patterns: `SystemFlags = 2` in the TABLES
//! catalog, `SWITCH(SELECTEDVALUE('T'[col]))` shapes in measure expressions,
//! and `NAMEOF('T'[col])` in calculated-table partition sources. Composite
//! keys alone are deliberately not evidence: dimension tables carry them
//! legitimately. The model scan runs once per classifier lifetime and
//! results memoize per `Table[Column]` key.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::debug::filters::{self, FilterClassification};
use crate::executor::{self, QueryExecutor};

/// How a classification was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    NameofPattern,
    SwitchPattern,
    SystemFlags,
    UiPattern,
    NamingConvention,
}

/// Result of classifying one table/column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticClassification {
    pub table: String,
    pub column: String,
    pub classification: FilterClassification,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub detection_method: DetectionMethod,
    /// Columns a field parameter exposes (from NAMEOF/SWITCH branches)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub references: Vec<String>,
}

static SWITCH_SELECTEDVALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)SWITCH\s*\(\s*(?:TRUE\s*\(\s*\)\s*,\s*)?SELECTEDVALUE\s*\(\s*(?:'([^']+)'|([A-Za-z_][A-Za-z0-9_]*))\s*\[",
    )
    .unwrap()
});

static NAMEOF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)NAMEOF\s*\(\s*(?:'([^']+)'|([A-Za-z_][A-Za-z0-9_]*))\s*\[\s*([^\]]+)\s*\]\s*\)",
    )
    .unwrap()
});

fn captured_table(cap: &regex::Captures) -> String {
    cap.get(1)
        .or_else(|| cap.get(2))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

static BRACKET_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]").unwrap());

/// DMV-driven filter classifier with per-instance memoization
pub struct SemanticClassifier {
    executor: Option<Arc<dyn QueryExecutor>>,
    analyzed: OnceCell<bool>,
    field_param_tables: DashSet<String>,
    system_flag_tables: DashSet<String>,
    table_references: DashMap<String, Vec<String>>,
    cache: DashMap<String, SemanticClassification>,
}

impl SemanticClassifier {
    pub fn new(executor: Option<Arc<dyn QueryExecutor>>) -> Self {
        Self {
            executor,
            analyzed: OnceCell::new(),
            field_param_tables: DashSet::new(),
            system_flag_tables: DashSet::new(),
            table_references: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    /// Run the model scan once; later calls are no-ops
    pub async fn analyze_model(&self) -> bool {
        *self
            .analyzed
            .get_or_init(|| async {
                let Some(qe) = &self.executor else {
                    tracing::debug!("no executor; semantic classification uses name patterns");
                    return false;
                };

                self.detect_from_system_flags(qe.as_ref()).await;
                self.detect_from_measures(qe.as_ref()).await;
                self.detect_from_partitions(qe.as_ref()).await;

                tracing::info!(
                    field_param_tables = self.field_param_tables.len(),
                    "semantic model analysis complete"
                );
                true
            })
            .await
    }

    /// `SystemFlags = 2` in the TABLES catalog marks a field parameter
    async fn detect_from_system_flags(&self, qe: &dyn QueryExecutor) {
        let result = qe.execute_info_query("TABLES").await;
        if !result.success {
            tracing::debug!(
                error = result.error.as_deref().unwrap_or("unknown"),
                "TABLES catalog unavailable"
            );
            return;
        }

        for row in &result.rows {
            let name = executor::row_str(row, "Name").unwrap_or_default();
            let flags = executor::row_i64(row, "SystemFlags").unwrap_or(0);
            if flags == 2 && !name.is_empty() {
                self.field_param_tables.insert(name.clone());
                self.system_flag_tables.insert(name);
            }
        }
    }

    /// `SWITCH(SELECTEDVALUE('T'[col]))` in a measure marks T
    async fn detect_from_measures(&self, qe: &dyn QueryExecutor) {
        let result = qe.execute_info_query("MEASURES").await;
        if !result.success {
            return;
        }

        for row in &result.rows {
            let Some(expression) = executor::row_str(row, "Expression") else { continue };
            for cap in SWITCH_SELECTEDVALUE.captures_iter(&expression) {
                let table = captured_table(&cap);
                if table.is_empty() {
                    continue;
                }
                let refs = extract_bracket_references(&expression);
                if !refs.is_empty() {
                    self.table_references.insert(table.clone(), refs);
                }
                self.field_param_tables.insert(table);
            }
        }
    }

    /// `NAMEOF('T'[col])` inside calculated-table partition sources
    async fn detect_from_partitions(&self, qe: &dyn QueryExecutor) {
        let query = "EVALUATE SELECTCOLUMNS(INFO.PARTITIONS(), \"Table\", [TableName], \
                     \"Source\", [QueryDefinition])";
        let result = qe.validate_and_execute_dax(query, 500).await;
        if !result.success {
            return;
        }

        for row in &result.rows {
            let table = executor::row_str(row, "Table").unwrap_or_default();
            let Some(source) = executor::row_str(row, "Source") else { continue };
            if table.is_empty() || !source.to_ascii_uppercase().contains("NAMEOF") {
                continue;
            }

            let refs: Vec<String> = NAMEOF
                .captures_iter(&source)
                .map(|cap| format!("'{}'[{}]", captured_table(&cap), cap[3].trim()))
                .collect();
            if !refs.is_empty() {
                self.table_references.insert(table.clone(), refs);
            }
            self.field_param_tables.insert(table);
        }
    }

    /// Classify one table/column; memoized
    pub async fn classify(&self, table: &str, column: &str) -> SemanticClassification {
        let cache_key = format!("'{table}'[{column}]");
        if let Some(hit) = self.cache.get(&cache_key) {
            return hit.clone();
        }

        self.analyze_model().await;

        let clean = table.trim_matches(['\'', '"']);
        let result = if self.field_param_tables.contains(clean) {
            let references =
                self.table_references.get(clean).map(|r| r.clone()).unwrap_or_default();
            let detection_method = if self.table_references.contains_key(clean) {
                DetectionMethod::NameofPattern
            } else if self.system_flag_tables.contains(clean) {
                DetectionMethod::SystemFlags
            } else {
                DetectionMethod::SwitchPattern
            };
            SemanticClassification {
                table: table.to_string(),
                column: column.to_string(),
                classification: FilterClassification::FieldParameter,
                confidence: 0.95,
                detection_method,
                references,
            }
        } else if filters::is_ui_control_table(table) {
            SemanticClassification {
                table: table.to_string(),
                column: column.to_string(),
                classification: FilterClassification::UiControl,
                confidence: 0.80,
                detection_method: DetectionMethod::UiPattern,
                references: Vec::new(),
            }
        } else {
            // name-pattern fallback at reduced confidence
            let classification = filters::classify_by_name(table);
            let confidence = match classification {
                FilterClassification::Data => 0.50,
                _ => 0.70,
            };
            SemanticClassification {
                table: table.to_string(),
                column: column.to_string(),
                classification,
                confidence,
                detection_method: DetectionMethod::NamingConvention,
                references: Vec::new(),
            }
        };

        self.cache.insert(cache_key, result.clone());
        result
    }

    /// All field-parameter tables detected so far
    pub async fn field_parameter_tables(&self) -> Vec<String> {
        self.analyze_model().await;
        self.field_param_tables.iter().map(|t| t.clone()).collect()
    }

    /// Drop memoized classifications; the model is rescanned lazily only if
    /// a fresh classifier is built (the scan-once cell cannot re-arm)
    pub fn reset(&self) {
        self.cache.clear();
        self.field_param_tables.clear();
        self.system_flag_tables.clear();
        self.table_references.clear();
    }
}

/// Bracketed references inside a SWITCH body, deduped, capped at 10
fn extract_bracket_references(expression: &str) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    for cap in BRACKET_REF.captures_iter(expression) {
        let name = cap[1].trim().to_string();
        if !refs.contains(&name) {
            refs.push(name);
        }
        if refs.len() == 10 {
            break;
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_without_executor() {
        let classifier = SemanticClassifier::new(None);

        let c = classifier.classify("sf Slicer 1", "Value").await;
        assert_eq!(c.classification, FilterClassification::FieldParameter);
        assert_eq!(c.detection_method, DetectionMethod::NamingConvention);
        assert!((c.confidence - 0.70).abs() < f64::EPSILON);

        let c = classifier.classify("d Region", "Code").await;
        assert_eq!(c.classification, FilterClassification::Data);
        assert!((c.confidence - 0.50).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_classification_memoized() {
        let classifier = SemanticClassifier::new(None);
        let first = classifier.classify("d Region", "Code").await;
        let second = classifier.classify("d Region", "Code").await;
        assert_eq!(first.classification, second.classification);
        assert_eq!(classifier.cache.len(), 1);
    }

    #[test]
    fn test_switch_selectedvalue_pattern() {
        let expr = "SWITCH(TRUE(), SELECTEDVALUE('sf Period'[Choice]) = \"YTD\", [YTD], [Total])";
        let caps = SWITCH_SELECTEDVALUE.captures(expr).unwrap();
        assert_eq!(captured_table(&caps), "sf Period");

        let expr = "SWITCH(SELECTEDVALUE(Params[Name]), \"Rev\", [Revenue], [Cost])";
        let caps = SWITCH_SELECTEDVALUE.captures(expr).unwrap();
        assert_eq!(captured_table(&caps), "Params");
    }

    #[test]
    fn test_nameof_pattern() {
        let source = "{(\"Region\", NAMEOF('d Region'[Name]), 0), (\"Country\", NAMEOF('d Country'[Name]), 1)}";
        let tables: Vec<String> =
            NAMEOF.captures_iter(source).map(|c| captured_table(&c)).collect();
        assert_eq!(tables, vec!["d Region".to_string(), "d Country".to_string()]);
    }
}
