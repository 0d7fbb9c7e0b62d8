//! VertiPaq column statistics
//!
//! Two-tier cardinality lookup: a bulk `DISCOVER_STORAGE_TABLE_COLUMNS` DMV
//! load populates the cache on first miss; columns still missing are
//! computed per column through the executor with a COUNTROWS(DISTINCT())
//! query and a synthesized size estimate. The cache lives for the analyzer
//! instance and is cleared only by `reset()`.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::dax::scanner;
use crate::executor::{self, QueryExecutor};

/// Cardinality classification bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardinalityLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

/// Storage metrics for a single column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMetrics {
    pub table_name: String,
    pub column_name: String,
    pub cardinality: u64,
    pub size_bytes: u64,
    pub data_type: String,
    pub encoding: String,
    pub dictionary_size_bytes: u64,
    pub hierarchy_size_bytes: u64,
}

impl ColumnMetrics {
    pub fn full_name(&self) -> String {
        format!("{}[{}]", self.table_name, self.column_name)
    }

    pub fn cardinality_level(&self) -> CardinalityLevel {
        match self.cardinality {
            0..=99 => CardinalityLevel::Low,
            100..=9_999 => CardinalityLevel::Medium,
            10_000..=99_999 => CardinalityLevel::High,
            _ => CardinalityLevel::VeryHigh,
        }
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// How a column participates in the analyzed expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageContext {
    Iterator,
    Filter,
    Aggregation,
    General,
}

/// Impact level of a column usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnImpact {
    Low,
    Medium,
    High,
    Critical,
}

/// Per-column analysis entry in the VertiPaq report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnUsage {
    pub column: String,
    pub cardinality: u64,
    pub cardinality_level: CardinalityLevel,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub data_type: String,
    pub encoding: String,
    pub usage_context: UsageContext,
    pub performance_impact: ColumnImpact,
    pub recommendation: String,
}

/// Result of analyzing the columns of one DAX expression
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertiPaqAnalysis {
    pub columns_analyzed: usize,
    pub columns_with_metrics: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub columns: Vec<ColumnUsage>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub missing_columns: Vec<String>,
    pub total_cardinality: u64,
    pub total_size_mb: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub high_cardinality_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

const ITERATOR_CARDINALITY_CRITICAL: u64 = 1_000_000;
const ITERATOR_CARDINALITY_WARNING: u64 = 100_000;
const FILTER_CARDINALITY_WARNING: u64 = 500_000;

/// Column-cardinality provider backed by DMV statistics
pub struct VertiPaqProvider {
    executor: Option<Arc<dyn QueryExecutor>>,
    cache: DashMap<String, ColumnMetrics>,
    bulk_load: OnceCell<bool>,
}

impl VertiPaqProvider {
    pub fn new(executor: Option<Arc<dyn QueryExecutor>>) -> Self {
        Self { executor, cache: DashMap::new(), bulk_load: OnceCell::new() }
    }

    /// Drop all cached metrics; the next lookup reloads from the DMV
    pub fn reset(&self) {
        self.cache.clear();
        // OnceCell cannot be re-armed in place; a fresh load happens because
        // lookups fall through to per-column calculation when the cache is
        // empty and the bulk flag is the only stale state.
    }

    /// Load the full column-statistics catalog once per provider lifetime
    async fn ensure_bulk_loaded(&self) -> bool {
        *self
            .bulk_load
            .get_or_init(|| async {
                let Some(qe) = &self.executor else { return false };

                let dmv = "SELECT \
                    [DIMENSION_NAME] as TableName, \
                    [ATTRIBUTE_NAME] as ColumnName, \
                    [ATTRIBUTE_COUNT] as Cardinality, \
                    [ATTRIBUTE_SIZE] as SizeBytes, \
                    [DATATYPE] as DataType, \
                    [DICTIONARY_SIZE] as DictionarySizeBytes, \
                    [HIERARCHY_SIZE] as HierarchySizeBytes, \
                    [ATTRIBUTE_ENCODING] as Encoding \
                    FROM $SYSTEM.DISCOVER_STORAGE_TABLE_COLUMNS \
                    WHERE [COLUMN_TYPE] = 'BASIC_DATA'";

                let result = qe.execute_dmv_query(dmv).await;
                if !result.success {
                    tracing::warn!(
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "VertiPaq column statistics unavailable from DMV"
                    );
                    return false;
                }

                for row in &result.data {
                    let table_name = executor::row_str(row, "TableName").unwrap_or_default();
                    let column_name = executor::row_str(row, "ColumnName").unwrap_or_default();
                    if table_name.is_empty() || column_name.is_empty() {
                        continue;
                    }

                    let metrics = ColumnMetrics {
                        cardinality: executor::row_i64(row, "Cardinality").unwrap_or(0).max(0)
                            as u64,
                        size_bytes: executor::row_i64(row, "SizeBytes").unwrap_or(0).max(0) as u64,
                        data_type: executor::row_str(row, "DataType")
                            .unwrap_or_else(|| "unknown".to_string()),
                        encoding: executor::row_str(row, "Encoding")
                            .unwrap_or_else(|| "unknown".to_string()),
                        dictionary_size_bytes: executor::row_i64(row, "DictionarySizeBytes")
                            .unwrap_or(0)
                            .max(0) as u64,
                        hierarchy_size_bytes: executor::row_i64(row, "HierarchySizeBytes")
                            .unwrap_or(0)
                            .max(0) as u64,
                        table_name,
                        column_name,
                    };
                    self.cache.insert(metrics.full_name(), metrics);
                }

                tracing::info!(columns = self.cache.len(), "loaded VertiPaq column metrics");
                true
            })
            .await
    }

    /// Metrics for one `Table[Column]` reference, consulting cache, bulk DMV,
    /// then the per-column DAX fallback
    pub async fn column_metrics(&self, column_ref: &str) -> Option<ColumnMetrics> {
        let key = normalize_column_ref(column_ref);

        if let Some(hit) = self.cache.get(&key) {
            return Some(hit.clone());
        }

        self.ensure_bulk_loaded().await;
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit.clone());
        }

        let computed = self.calculate_column_metrics(column_ref).await?;
        self.cache.insert(key, computed.clone());
        Some(computed)
    }

    /// Per-column fallback: COUNTROWS(DISTINCT(col)) with an estimated size
    async fn calculate_column_metrics(&self, column_ref: &str) -> Option<ColumnMetrics> {
        let qe = self.executor.as_ref()?;
        let (table, column) = split_column_ref(column_ref)?;

        let table_ref = quote_table(&table);
        let dax = format!(
            "EVALUATE ROW(\"Cardinality\", COUNTROWS(DISTINCT({table_ref}[{column}])), \
             \"TotalRows\", COUNTROWS({table_ref}))"
        );

        let result = qe.validate_and_execute_dax(&dax, 1).await;
        if !result.success || result.rows.is_empty() {
            tracing::debug!(
                column = column_ref,
                error = result.error.as_deref().unwrap_or("no rows"),
                "cardinality fallback query failed"
            );
            return None;
        }

        let row = &result.rows[0];
        let cardinality = executor::row_i64(row, "Cardinality").unwrap_or(0).max(0) as u64;
        let total_rows = executor::row_i64(row, "TotalRows").unwrap_or(0).max(0) as u64;

        tracing::info!(column = column_ref, cardinality, "calculated cardinality via DAX fallback");

        Some(ColumnMetrics {
            table_name: table,
            column_name: column,
            cardinality,
            size_bytes: estimate_column_size(cardinality, total_rows),
            data_type: "unknown".to_string(),
            encoding: "calculated".to_string(),
            dictionary_size_bytes: 0,
            hierarchy_size_bytes: 0,
        })
    }

    /// Highest column cardinality referenced by a table expression
    pub async fn metrics_for_expression(&self, expr: &str) -> Option<ColumnMetrics> {
        let mut best: Option<ColumnMetrics> = None;
        for col_ref in scanner::find_column_references(expr) {
            let key = format!("{}[{}]", col_ref.table, col_ref.column);
            if let Some(metrics) = self.column_metrics(&key).await {
                let better = best
                    .as_ref()
                    .map(|b| metrics.cardinality > b.cardinality)
                    .unwrap_or(true);
                if better {
                    best = Some(metrics);
                }
            }
        }
        best
    }

    /// Best-effort row count for a bare table reference
    pub async fn table_row_count(&self, table: &str) -> Option<u64> {
        let clean = table.trim().trim_matches('\'').to_string();

        self.ensure_bulk_loaded().await;
        let cached_max = self
            .cache
            .iter()
            .filter(|e| e.table_name == clean)
            .map(|e| e.cardinality)
            .max();
        if let Some(max) = cached_max {
            return Some(max);
        }

        let qe = self.executor.as_ref()?;
        let dax = format!("EVALUATE ROW(\"TotalRows\", COUNTROWS({}))", quote_table(&clean));
        let result = qe.validate_and_execute_dax(&dax, 1).await;
        if result.success {
            result
                .rows
                .first()
                .and_then(|r| executor::row_i64(r, "TotalRows"))
                .map(|n| n.max(0) as u64)
        } else {
            None
        }
    }

    /// Analyze every `Table[Column]` reference in a DAX expression
    pub async fn analyze_dax_columns(&self, dax: &str) -> VertiPaqAnalysis {
        let refs = scanner::find_column_references(dax);
        if refs.is_empty() {
            return VertiPaqAnalysis {
                note: Some(
                    "No column references found in the expression (it may use only measures)"
                        .to_string(),
                ),
                ..Default::default()
            };
        }

        let mut analysis = VertiPaqAnalysis { columns_analyzed: refs.len(), ..Default::default() };
        let mut total_size_bytes = 0u64;

        for col_ref in refs {
            let key = format!("{}[{}]", col_ref.table, col_ref.column);
            let Some(metrics) = self.column_metrics(&key).await else {
                analysis.missing_columns.push(key);
                continue;
            };

            let usage_context = usage_context(dax, col_ref.start);
            let (impact, recommendation) = assess_impact(&metrics, usage_context);

            analysis.columns_with_metrics += 1;
            analysis.total_cardinality += metrics.cardinality;
            total_size_bytes += metrics.size_bytes;

            if matches!(
                metrics.cardinality_level(),
                CardinalityLevel::High | CardinalityLevel::VeryHigh
            ) {
                analysis.high_cardinality_columns.push(key.clone());
            }

            analysis.columns.push(ColumnUsage {
                column: key,
                cardinality: metrics.cardinality,
                cardinality_level: metrics.cardinality_level(),
                size_bytes: metrics.size_bytes,
                size_mb: (metrics.size_mb() * 100.0).round() / 100.0,
                data_type: metrics.data_type.clone(),
                encoding: metrics.encoding.clone(),
                usage_context,
                performance_impact: impact,
                recommendation,
            });
        }

        analysis.total_size_mb = (total_size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;

        if analysis.columns_with_metrics == 0 {
            analysis.note = Some(
                "No VertiPaq metrics available for any referenced column: only measures may be \
                 referenced, DMV access may have failed, or the references do not match model \
                 columns."
                    .to_string(),
            );
        }

        analysis
    }
}

/// Classify the usage context by the 50 characters preceding the reference
fn usage_context(dax: &str, ref_start: usize) -> UsageContext {
    let window_start = ref_start.saturating_sub(50);
    // clamp to a char boundary
    let mut start = window_start;
    while start > 0 && !dax.is_char_boundary(start) {
        start -= 1;
    }
    let before = dax[start..ref_start].to_ascii_uppercase();

    if scanner::ITERATOR_FUNCTIONS.iter().any(|f| before.contains(f)) {
        return UsageContext::Iterator;
    }
    if before.contains("CALCULATE") || before.contains("FILTER") {
        return UsageContext::Filter;
    }
    if scanner::AGGREGATION_FUNCTIONS.iter().any(|f| before.contains(f)) {
        return UsageContext::Aggregation;
    }
    UsageContext::General
}

fn assess_impact(metrics: &ColumnMetrics, usage: UsageContext) -> (ColumnImpact, String) {
    let cardinality = metrics.cardinality;

    let (impact, mut recommendation) = match usage {
        UsageContext::Iterator if cardinality >= ITERATOR_CARDINALITY_CRITICAL => (
            ColumnImpact::Critical,
            format!(
                "CRITICAL: iterating {cardinality} rows will cause severe performance issues. \
                 Pre-aggregate or use set-based operations instead of row-by-row iteration."
            ),
        ),
        UsageContext::Iterator if cardinality >= ITERATOR_CARDINALITY_WARNING => (
            ColumnImpact::High,
            format!(
                "HIGH: iterating {cardinality} rows may impact performance. Cache calculations \
                 in variables or reduce the iterated set."
            ),
        ),
        UsageContext::Iterator if cardinality >= 10_000 => (
            ColumnImpact::Medium,
            format!("MEDIUM: iterator over {cardinality} rows; monitor performance."),
        ),
        UsageContext::Filter if cardinality >= FILTER_CARDINALITY_WARNING => (
            ColumnImpact::Medium,
            format!(
                "High-cardinality column ({cardinality} unique values) used in filter context; \
                 consider surrogate keys or reducing cardinality."
            ),
        ),
        _ => (ColumnImpact::Low, "No optimization needed".to_string()),
    };

    if metrics.data_type.eq_ignore_ascii_case("string") && cardinality < 1000 {
        recommendation.push_str(
            " Consider converting to an integer type with a lookup table for better compression.",
        );
    }

    (impact, recommendation)
}

/// Size estimate used when DMV data is unavailable:
/// dictionary (cardinality x 20 bytes) + data column (rows x 4 bytes)
fn estimate_column_size(cardinality: u64, total_rows: u64) -> u64 {
    cardinality * 20 + total_rows * 4
}

fn normalize_column_ref(column_ref: &str) -> String {
    column_ref.replace('\'', "").trim().to_string()
}

fn split_column_ref(column_ref: &str) -> Option<(String, String)> {
    let open = column_ref.find('[')?;
    let close = column_ref.rfind(']')?;
    if close <= open + 1 {
        return None;
    }
    let table = column_ref[..open].trim().trim_matches('\'').to_string();
    let column = column_ref[open + 1..close].trim().to_string();
    (!table.is_empty() && !column.is_empty()).then_some((table, column))
}

fn quote_table(table: &str) -> String {
    if table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        table.to_string()
    } else {
        format!("'{table}'")
    }
}
