//! End-to-end tests for the visual debug pipeline
//!
//! A scripted executor stands in for the live model so the smart-retry and
//! classification paths run exactly as they would against a real endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::debug::operations::DebugOperations;
use crate::debug::query_builder::{VisualQueryBuilder, VisualQueryRequest};
use crate::executor::{
    DaxResult, DmvResult, InfoResult, ProfilingResult, QueryExecutor, Row,
};

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Executor scripted to fail N times with a given error, then succeed
struct ScriptedExecutor {
    failures_remaining: AtomicUsize,
    failure_message: String,
    success_rows: Vec<Row>,
    dax_calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(failures: usize, message: &str, success_rows: Vec<Row>) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(failures),
            failure_message: message.to_string(),
            success_rows,
            dax_calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.dax_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute_dmv_query(&self, _dmv_sql: &str) -> DmvResult {
        DmvResult { success: false, data: vec![], error: Some("DMV unavailable".into()) }
    }

    async fn execute_info_query(&self, _catalog: &str) -> InfoResult {
        InfoResult { success: false, rows: vec![], error: Some("catalog unavailable".into()) }
    }

    async fn validate_and_execute_dax(&self, dax_query: &str, _top_n: usize) -> DaxResult {
        // metadata probes (classifier partition scan) are not part of the
        // scripted failure sequence
        if dax_query.contains("INFO.PARTITIONS") {
            return DaxResult {
                success: false,
                error: Some("catalog unavailable".into()),
                ..Default::default()
            };
        }

        self.dax_calls.fetch_add(1, Ordering::SeqCst);

        let failures = self.failures_remaining.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures_remaining.store(failures - 1, Ordering::SeqCst);
            return DaxResult {
                success: false,
                error: Some(self.failure_message.clone()),
                ..Default::default()
            };
        }

        DaxResult {
            success: true,
            row_count: self.success_rows.len(),
            rows: self.success_rows.clone(),
            columns: self
                .success_rows
                .first()
                .map(|r| r.keys().cloned().collect())
                .unwrap_or_default(),
            execution_time_ms: 12.5,
            error: None,
        }
    }

    async fn execute_dax_with_profiling(&self, _dax: &str, _timeout: u64) -> ProfilingResult {
        ProfilingResult { success: false, error: Some("profiling unavailable".into()), ..Default::default() }
    }
}

fn write(path: &Path, value: &Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Bundle: one page, one chart (measure + date column), one product slicer,
/// one field-parameter slicer
fn scaffold_bundle(tag: &str) -> PathBuf {
    let root = std::env::temp_dir()
        .join("daxlens-debug-tests")
        .join(format!("{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);

    write(&root.join("definition/report.json"), &json!({}));
    write(
        &root.join("definition/pages/p1/page.json"),
        &json!({"displayName": "Overview", "ordinal": 0}),
    );
    write(
        &root.join("definition/pages/p1/visuals/v1/visual.json"),
        &json!({
            "name": "salesChart",
            "visual": {
                "visualType": "columnChart",
                "query": {"queryState": {
                    "Y": {"projections": [{"field": {"Measure": {
                        "Expression": {"SourceRef": {"Entity": "Sales"}},
                        "Property": "Total Sales"
                    }}}]},
                    "Category": {"projections": [{"field": {"Column": {
                        "Expression": {"SourceRef": {"Entity": "Date"}},
                        "Property": "Year"
                    }}}]}
                }}
            }
        }),
    );
    write(
        &root.join("definition/pages/p1/visuals/s1/visual.json"),
        &json!({
            "name": "categorySlicer",
            "visual": {
                "visualType": "slicer",
                "query": {"queryState": {"Values": {"projections": [{"field": {"Column": {
                    "Expression": {"SourceRef": {"Entity": "Product"}},
                    "Property": "Category"
                }}}]}}},
                "objects": {"general": [{"properties": {"filter": {"filter": {"Where": [{
                    "Condition": {"In": {"Values": [[{"Literal": {"Value": "'Bikes'L"}}]]}}
                }]}}}}]}
            }
        }),
    );
    write(
        &root.join("definition/pages/p1/visuals/s2/visual.json"),
        &json!({
            "name": "fieldParamSlicer",
            "visual": {
                "visualType": "slicer",
                "query": {"queryState": {"Values": {"projections": [{"field": {"Column": {
                    "Expression": {"SourceRef": {"Entity": "sf Slicer 1"}},
                    "Property": "Value"
                }}}]}}},
                "objects": {"general": [{"properties": {"filter": {"filter": {"Where": [{
                    "Condition": {"In": {"Values": [[{"Literal": {"Value": "'Revenue'L"}}]]}}
                }]}}}}]}
            }
        }),
    );

    root
}

fn builder(tag: &str) -> VisualQueryBuilder {
    VisualQueryBuilder::new(scaffold_bundle(tag)).unwrap()
}

#[tokio::test]
async fn test_visual_query_shape_with_slicer() {
    // single-table grouping with a single-value slicer collapses to `=`
    let builder = builder("shape");
    let req = VisualQueryRequest::for_visual("Overview", "v1");
    let result = builder.build_visual_query(&req).await.unwrap();

    let collapsed: String = result.dax_query.split_whitespace().collect::<Vec<_>>().join(" ");
    assert_eq!(
        collapsed,
        "EVALUATE CALCULATETABLE( ADDCOLUMNS( SUMMARIZE( 'Date', 'Date'[Year] ), \
         \"Total Sales\", [Total Sales] ), 'Product'[Category] = \"Bikes\" )"
    );

    // the field-parameter slicer never reaches the query text
    assert!(!result.dax_query.contains("sf Slicer 1"));
    // but stays in the remembered context
    assert_eq!(result.filter_context.field_parameter_filters().len(), 1);
}

#[tokio::test]
async fn test_null_slicer_value_splits_isblank() {
    // a null sentinel alongside a literal splits into an ISBLANK branch
    let root = scaffold_bundle("nulls");
    write(
        &root.join("definition/pages/p1/visuals/s1/visual.json"),
        &json!({
            "name": "regionSlicer",
            "visual": {
                "visualType": "slicer",
                "query": {"queryState": {"Values": {"projections": [{"field": {"Column": {
                    "Expression": {"SourceRef": {"Entity": "d Region"}},
                    "Property": "Code"
                }}}]}}},
                "objects": {"general": [{"properties": {"filter": {"filter": {"Where": [{
                    "Condition": {"In": {"Values": [
                        [{"Literal": {"Value": "'null'L"}}],
                        [{"Literal": {"Value": "'EU'L"}}]
                    ]}}
                }]}}}}]}
            }
        }),
    );

    let builder = VisualQueryBuilder::new(root).unwrap();
    let req = VisualQueryRequest::for_visual("Overview", "v1");
    let result = builder.build_visual_query(&req).await.unwrap();

    let slicer_filter = result
        .filter_context
        .slicer_filters
        .iter()
        .find(|f| f.table == "d Region")
        .expect("region slicer filter");
    assert_eq!(
        slicer_filter.dax,
        "(ISBLANK('d Region'[Code]) || 'd Region'[Code] IN {\"EU\"})"
    );
    assert!(slicer_filter.has_null_values);
    assert_eq!(
        slicer_filter.classification,
        crate::debug::filters::FilterClassification::Data
    );
}

#[tokio::test]
async fn test_smart_retry_excludes_field_parameters() {
    // first execution fails with an ambiguous-key error; the retry
    // runs once with field-parameter filters removed
    let executor = Arc::new(ScriptedExecutor::new(
        1,
        "The query references multiple columns: ambiguous relationship path",
        vec![row(&[("Value", json!(42000.5))])],
    ));
    let builder = Arc::new(builder("retry"));
    let ops = DebugOperations::new(builder, Some(executor.clone()));

    let req = VisualQueryRequest::for_visual("Overview", "v1");
    let response = ops.debug_visual(&req).await.unwrap();

    let retry = response.retry_info.expect("retry info");
    assert!(retry.retried);
    assert!(retry.success);
    assert_eq!(retry.excluded_filters, vec!["'sf Slicer 1'[Value]".to_string()]);
    assert!(retry.original_error.contains("ambiguous"));
    assert!(retry.retry_error.is_none());

    // rows come from the second execution; exactly two DAX calls happened
    assert_eq!(executor.calls(), 2);
    let result = response.result.expect("rows from retry");
    assert_eq!(result.row_count, 1);
}

#[tokio::test]
async fn test_non_matching_error_is_not_retried() {
    let executor = Arc::new(ScriptedExecutor::new(
        5,
        "syntax error near EVALUATE",
        vec![],
    ));
    let builder = Arc::new(builder("noretry"));
    let ops = DebugOperations::new(builder, Some(executor.clone()));

    let req = VisualQueryRequest::for_visual("Overview", "v1");
    let response = ops.debug_visual(&req).await.unwrap();

    assert!(response.retry_info.is_none());
    assert!(response.result.is_none());
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_retry_is_single_shot() {
    // both executions fail; still exactly two calls, retry_error carried
    let executor = Arc::new(ScriptedExecutor::new(
        5,
        "composite key violation: duplicate key path",
        vec![],
    ));
    let builder = Arc::new(builder("single-retry"));
    let ops = DebugOperations::new(builder, Some(executor.clone()));

    let req = VisualQueryRequest::for_visual("Overview", "v1");
    let response = ops.debug_visual(&req).await.unwrap();

    let retry = response.retry_info.expect("retry info");
    assert!(retry.retried);
    assert!(!retry.success);
    assert!(retry.retry_error.is_some());
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn test_operations_require_executor() {
    let builder = Arc::new(builder("offline"));
    let ops = DebugOperations::new(builder, None);

    let err = ops.cross_visual_validation("Total Sales", None, 0.001).await.unwrap_err();
    assert!(matches!(err, crate::error::EngineError::NotConnected(_)));
}

#[tokio::test]
async fn test_profile_page_orders_by_average_time() {
    let executor = Arc::new(ScriptedExecutor::new(
        0,
        "",
        vec![row(&[("Value", json!(1))])],
    ));
    let builder = Arc::new(builder("profile"));
    let ops = DebugOperations::new(builder, Some(executor));

    let profile = ops
        .profile_page("Overview", &crate::debug::models::ProfileOptions::default())
        .await
        .unwrap();

    assert_eq!(profile.visuals_profiled, 1);
    assert!(profile.total_time_ms > 0.0);
    for pair in profile.results.windows(2) {
        assert!(pair[0].avg_time_ms >= pair[1].avg_time_ms);
    }
}

#[tokio::test]
async fn test_document_page_counts() {
    let builder = Arc::new(builder("docs"));
    let ops = DebugOperations::new(builder, None);

    let doc = ops
        .document_page("Overview", &crate::debug::models::DocumentOptions::default())
        .unwrap();

    assert_eq!(doc.data_visual_count, 1);
    assert_eq!(doc.slicer_count, 2);
    assert_eq!(doc.summary.total_page_elements, 3);
    assert_eq!(doc.visuals[0].measures, vec!["[Total Sales]"]);
}

#[tokio::test]
async fn test_measure_lineage_counts_usage() {
    let builder = Arc::new(builder("lineage"));
    let ops = DebugOperations::new(builder, None);

    let lineage = ops.measure_lineage(None).unwrap();
    assert_eq!(lineage.measures_found, 1);
    assert_eq!(lineage.lineage[0].measure, "Total Sales");
    assert_eq!(lineage.lineage[0].usage_count, 1);

    let filtered = ops.measure_lineage(Some("[total sales]")).unwrap();
    assert_eq!(filtered.measures_found, 1);
}

#[tokio::test]
async fn test_detail_rows_query() {
    let builder = builder("details");
    let req = crate::debug::query_builder::DetailRowsRequest {
        page_name: "Overview".into(),
        visual_id: Some("v1".into()),
        limit: 50,
        include_slicers: true,
        ..Default::default()
    };
    let query = builder.build_detail_rows_query(&req).await.unwrap();

    assert!(query.starts_with("EVALUATE\nTOPN(\n    50,"));
    assert!(query.contains("CALCULATETABLE("));
    assert!(query.contains("'Date'")); // inferred from the first column
    assert!(query.contains("'Product'[Category] IN {\"Bikes\"}"));
}

#[tokio::test]
async fn test_debug_response_serializes() {
    let executor = Arc::new(ScriptedExecutor::new(
        0,
        "",
        vec![row(&[("Value", json!(10))])],
    ));
    let builder = Arc::new(builder("serialize"));
    let ops = DebugOperations::new(builder, Some(executor));

    let req = VisualQueryRequest::for_visual("Overview", "v1");
    let response = ops.debug_visual(&req).await.unwrap();
    let json = serde_json::to_value(&response).unwrap();

    assert_eq!(json["visual"]["visual_id"], json!("v1"));
    assert!(json["query"].as_str().unwrap().starts_with("EVALUATE"));
    assert_eq!(json["filter_counts"]["field_params_excluded"], json!(1));
}
