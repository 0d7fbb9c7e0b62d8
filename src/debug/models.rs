//! Debug operation response records
//!
//! One typed record per orchestrator operation. These are the crate's outer
//! surface for visual debugging; optional sections are omitted from JSON
//! when absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::debug::anomaly::AnomalyReport;
use crate::debug::bundle::{PbipWarning, VisualInfo};
use crate::debug::filters::FilterExpression;
use crate::debug::relationships::RelationshipHint;

/// Retry record attached to a response after a composite-key retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryInfo {
    pub retried: bool,
    pub original_error: String,
    /// `'Table'[Column]` of every excluded field-parameter filter
    pub excluded_filters: Vec<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_error: Option<String>,
    pub note: String,
}

/// Filter counts grouped by level and classification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterCounts {
    pub report: usize,
    pub page: usize,
    pub visual: usize,
    pub slicer: usize,
    pub total: usize,
    pub data_applied: usize,
    pub field_params_excluded: usize,
    pub ui_controls_excluded: usize,
    pub with_nulls: usize,
}

/// A slicer persisting no selection (often an authoring oversight)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptySlicer {
    pub field: String,
    pub table: String,
    pub column: String,
}

/// Full visual-debug response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualDebugResponse {
    pub visual: VisualInfo,
    /// All converted filters with their classifications, precedence order
    pub filters: Vec<FilterExpression>,
    pub filter_counts: FilterCounts,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryRows>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_info: Option<RetryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomalies: Option<AnomalyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbip_warning: Option<PbipWarning>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub slicers_without_selection: Vec<EmptySlicer>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub relationship_hints: Vec<RelationshipHint>,
}

/// Executed rows with timing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRows {
    pub rows: Vec<crate::executor::Row>,
    pub row_count: usize,
    pub execution_time_ms: f64,
}

/// One visual's value in a cross-visual validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualValue {
    pub page: String,
    pub visual: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub time_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A value point in a discrepancy record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuePoint {
    pub page: String,
    pub visual: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// A detected cross-visual discrepancy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub baseline: ValuePoint,
    pub different: ValuePoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference: Option<f64>,
}

/// Cross-visual validation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossVisualReport {
    pub measure: String,
    pub visuals_checked: usize,
    pub results: Vec<VisualValue>,
    pub discrepancies: Vec<Discrepancy>,
    pub has_discrepancies: bool,
}

/// Expected-value assertion result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedValueReport {
    pub test_passed: bool,
    pub page: String,
    pub visual_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference: Option<f64>,
    pub tolerance: f64,
    pub execution_time_ms: f64,
    pub query: String,
    pub filters_applied: usize,
}

/// One point in a filter permutation sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermutationResult {
    pub permutation: usize,
    /// column reference -> tested value
    pub filters: std::collections::BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub is_null: bool,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub time_ms: f64,
}

/// Filter permutation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermutationReport {
    pub page: String,
    pub visual_id: String,
    pub permutations_tested: usize,
    pub null_results: usize,
    pub error_results: usize,
    pub results: Vec<PermutationResult>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub issues: Vec<String>,
}

/// Per-visual profile entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualProfile {
    pub visual_id: String,
    pub visual_name: String,
    pub visual_type: String,
    pub measures: Vec<String>,
    pub avg_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub row_count: usize,
    pub filter_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub issues: Vec<String>,
}

/// Execution mode of a page profile run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Page profile report, slowest visuals first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageProfile {
    pub page: String,
    pub visuals_profiled: usize,
    pub total_time_ms: f64,
    pub avg_time_per_visual_ms: f64,
    pub execution_mode: ExecutionMode,
    pub results: Vec<VisualProfile>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub recommendations: Vec<String>,
}

/// Options for page profiling
#[derive(Debug, Clone)]
pub struct ProfileOptions {
    pub iterations: usize,
    pub include_slicers: bool,
    pub parallel: bool,
    pub max_workers: usize,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self { iterations: 3, include_slicers: true, parallel: true, max_workers: 4 }
    }
}

/// One row of a filter performance matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub filters: String,
    pub time_ms: f64,
    /// Time relative to the baseline run
    pub relative: f64,
    pub status: MatrixStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixStatus {
    Baseline,
    Normal,
    Slow,
    Fast,
    Error,
}

/// Filter performance matrix report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterMatrixReport {
    pub page: String,
    pub visual_id: String,
    pub baseline_time_ms: f64,
    pub combinations_tested: usize,
    pub matrix: Vec<MatrixEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub slow_filters: Vec<String>,
    pub recommendation: String,
}

/// Options for documentation operations
#[derive(Debug, Clone)]
pub struct DocumentOptions {
    /// Parsed metadata only; no query building, no DMV
    pub lightweight: bool,
    pub include_ui_elements: bool,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self { lightweight: true, include_ui_elements: false }
    }
}

/// Per-level filter counts on one documented visual
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualFilterCounts {
    pub report: usize,
    pub page: usize,
    pub visual: usize,
    pub slicer: usize,
}

/// One documented visual
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualDoc {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub is_data_visual: bool,
    pub measures: Vec<String>,
    pub columns: Vec<String>,
    pub filters: VisualFilterCounts,
}

/// One documented slicer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlicerDoc {
    pub id: String,
    pub field: String,
    pub table: String,
    pub column: String,
    pub selection_mode: String,
    pub current_selection: Vec<String>,
    pub selection_count: usize,
}

/// Page-level rollup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageDocSummary {
    pub total_page_elements: usize,
    pub data_visuals: usize,
    pub slicers: usize,
    pub ui_elements: usize,
    pub total_measures: usize,
    pub total_columns: usize,
    pub data_visual_types: std::collections::BTreeMap<String, usize>,
    pub ui_element_types: std::collections::BTreeMap<String, usize>,
}

/// Documentation of one page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageDocumentation {
    pub page: String,
    pub data_visual_count: usize,
    pub slicer_count: usize,
    pub visuals: Vec<VisualDoc>,
    pub slicers: Vec<SlicerDoc>,
    pub summary: PageDocSummary,
}

/// Documentation of the whole report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDocumentation {
    pub pages: Vec<PageDocumentation>,
    pub page_count: usize,
    pub total_visuals: usize,
    pub total_slicers: usize,
    pub all_measures: Vec<String>,
    pub all_columns: Vec<String>,
}

/// A visual consuming a measure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageVisual {
    pub visual_id: String,
    pub visual_name: String,
    pub visual_type: String,
    pub page: String,
}

/// Measure -> visuals inverted index entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureLineageEntry {
    pub measure: String,
    pub usage_count: usize,
    pub pages: Vec<String>,
    pub visuals: Vec<LineageVisual>,
}

/// Measure lineage report, most used first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureLineage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measure_filter: Option<String>,
    pub measures_found: usize,
    pub lineage: Vec<MeasureLineageEntry>,
}

/// Filter -> visuals inverted index entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterLineageEntry {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    pub table: String,
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dax: Option<String>,
    pub affects_all: bool,
    pub visual_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub current_selection: Vec<String>,
}

/// Filter lineage report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterLineage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_filter: Option<String>,
    pub filters_found: usize,
    pub lineage: Vec<FilterLineageEntry>,
}

/// One contributor in a decomposition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionComponent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub percentage: f64,
    pub cumulative_pct: f64,
}

/// Value decomposition by one dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decomposition {
    pub page: String,
    pub visual_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_value: Option<Value>,
    pub dimension: String,
    pub top_n: usize,
    pub components: Vec<DecompositionComponent>,
    /// Cumulative share covered by the listed components
    pub coverage: f64,
}

/// Pareto view over a decomposition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionReport {
    pub decomposition: Decomposition,
    pub top_contributor_count: usize,
    pub top_contributor_coverage: f64,
    pub remaining_items: usize,
    pub insight: String,
}

/// One trend period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growth: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growth_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    StronglyUpward,
    Upward,
    Stable,
    Downward,
    StronglyDownward,
}

/// Trend analysis report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendReport {
    pub page: String,
    pub visual_id: String,
    pub date_column: String,
    pub granularity: String,
    pub periods: usize,
    pub trend_direction: TrendDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_growth: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_growth_pct: Option<f64>,
    pub data: Vec<TrendPoint>,
}

/// Per-dimension impact in a root-cause comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionImpact {
    pub dimension: String,
    pub top_changes: Vec<DimensionChange>,
}

/// One dimension member's contribution to the change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<f64>,
    pub change: f64,
    /// Share of the total change (0-100, sign preserved)
    pub share_pct: f64,
}

/// Root-cause comparison report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseReport {
    pub page: String,
    pub visual_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_change: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_pct: Option<f64>,
    pub dimension_impacts: Vec<DimensionImpact>,
}
