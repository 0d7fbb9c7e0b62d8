//! Debug orchestrator
//!
//! Drives the visual query compiler against a live model: visual debugging
//! with smart retry, cross-visual validation, expected-value assertions,
//! filter permutation sweeps, page profiling (the one parallel path),
//! filter performance matrices, documentation, lineage, and the
//! decomposition/trend/root-cause analyses.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::DebugConfig;
use crate::debug::anomaly::AnomalyDetector;
use crate::debug::filters::{FilterClassification, FilterExpression};
use crate::debug::models::*;
use crate::debug::query_builder::{
    self, VisualQueryBuilder, VisualQueryRequest,
};
use crate::error::{EngineError, EngineResult};
use crate::executor::{self, DaxResult, QueryExecutor};

// Executor error fragments that trigger the composite-key retry
const RETRY_PATTERNS: &[&str] = &[
    "composite",
    "multiple columns",
    "ambiguous",
    "cannot determine",
    "more than one",
    "duplicate key",
];

/// Debug operations over one report bundle and an optional live model
pub struct DebugOperations {
    builder: Arc<VisualQueryBuilder>,
    executor: Option<Arc<dyn QueryExecutor>>,
    config: DebugConfig,
}

impl DebugOperations {
    pub fn new(
        builder: Arc<VisualQueryBuilder>,
        executor: Option<Arc<dyn QueryExecutor>>,
    ) -> Self {
        Self { builder, executor, config: DebugConfig::default() }
    }

    pub fn with_config(mut self, config: DebugConfig) -> Self {
        self.config = config;
        self
    }

    fn require_executor(&self) -> EngineResult<&Arc<dyn QueryExecutor>> {
        self.executor.as_ref().ok_or_else(|| {
            EngineError::NotConnected(
                "no Query Executor attached; connect to the model before running live \
                 operations"
                    .to_string(),
            )
        })
    }

    /// Execute with a single retry on composite-key errors.
    ///
    /// On a matching failure, every field-parameter-classified filter is
    /// removed from the filter set, the query is rebuilt once through
    /// `rebuild`, and the retry result is returned with a [`RetryInfo`].
    async fn execute_with_smart_retry<F>(
        &self,
        query: &str,
        filters: &[&FilterExpression],
        rebuild: F,
        top_n: usize,
    ) -> EngineResult<(DaxResult, Option<RetryInfo>)>
    where
        F: FnOnce(&[&FilterExpression]) -> String,
    {
        let qe = self.require_executor()?;

        let result = qe.validate_and_execute_dax(query, top_n).await;
        if result.success {
            return Ok((result, None));
        }

        let error_text = result.error.clone().unwrap_or_default();
        let lowered = error_text.to_lowercase();
        if !RETRY_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return Ok((result, None));
        }

        let field_params: Vec<&&FilterExpression> = filters
            .iter()
            .filter(|f| {
                f.classification == FilterClassification::FieldParameter || f.is_field_parameter
            })
            .collect();
        if field_params.is_empty() {
            return Ok((result, None));
        }

        let excluded_filters: Vec<String> =
            field_params.iter().map(|f| f.field_reference()).collect();
        tracing::info!(
            excluded = excluded_filters.len(),
            "composite key error; retrying without field parameter filters"
        );

        let reduced: Vec<&FilterExpression> = filters
            .iter()
            .filter(|f| {
                !(f.classification == FilterClassification::FieldParameter
                    || f.is_field_parameter)
            })
            .copied()
            .collect();
        let reduced_query = rebuild(&reduced);

        let retry_result = qe.validate_and_execute_dax(&reduced_query, top_n).await;
        let retry_info = RetryInfo {
            retried: true,
            original_error: error_text,
            excluded_filters,
            success: retry_result.success,
            retry_error: if retry_result.success {
                None
            } else {
                retry_result.error.clone()
            },
            note: if retry_result.success {
                "Results may differ from the visual because field parameter filters were \
                 excluded"
                    .to_string()
            } else {
                "Retry without field parameter filters also failed".to_string()
            },
        };

        Ok((retry_result, Some(retry_info)))
    }

    // ========== VISUAL DEBUGGING ==========

    /// Build and (when connected) execute the query for one visual
    pub async fn debug_visual(
        &self,
        req: &VisualQueryRequest,
    ) -> EngineResult<VisualDebugResponse> {
        let pbip_warning =
            self.builder.freshness_warning(self.config.bundle_freshness_minutes);

        let query_result = self.builder.build_visual_query(req).await?;

        let context = &query_result.filter_context;
        let all = context.all_filters();
        let filter_counts = FilterCounts {
            report: context.report_filters.len(),
            page: context.page_filters.len(),
            visual: context.visual_filters.len(),
            slicer: context.slicer_filters.len(),
            total: all.len(),
            data_applied: context.data_filters().len(),
            field_params_excluded: context.field_parameter_filters().len(),
            ui_controls_excluded: context.ui_control_filters().len(),
            with_nulls: all.iter().filter(|f| f.has_null_values).count(),
        };

        let slicers_without_selection: Vec<EmptySlicer> = self
            .builder
            .list_slicers(Some(&req.page_name))?
            .into_iter()
            .filter(|s| s.selected_values.is_empty())
            .map(|s| EmptySlicer {
                field: s.field_reference.clone(),
                table: s.table,
                column: s.column,
            })
            .collect();

        let mut result = None;
        let mut retry_info = None;
        let mut anomalies = None;

        if self.executor.is_some() {
            let measures: Vec<String> = match &req.measure_name {
                Some(m) => vec![query_builder::bracket(m)],
                None => query_result.visual.measures.clone(),
            };
            let columns = query_result.visual.columns.clone();
            let (exec, retry) = self
                .execute_with_smart_retry(
                    &query_result.dax_query,
                    &all,
                    |reduced| query_builder::build_query(&measures, &columns, reduced),
                    100,
                )
                .await?;
            retry_info = retry;

            if exec.success {
                let report = AnomalyDetector::new().analyze(&exec.rows);
                if !report.is_empty() {
                    anomalies = Some(report);
                }
                result = Some(QueryRows {
                    row_count: exec.rows.len(),
                    rows: exec.rows,
                    execution_time_ms: exec.execution_time_ms,
                });
            }
        }

        Ok(VisualDebugResponse {
            filters: all.into_iter().cloned().collect(),
            visual: query_result.visual,
            filter_counts,
            query: query_result.dax_query,
            expanded_query: query_result.expanded_query,
            result,
            retry_info,
            anomalies,
            pbip_warning,
            slicers_without_selection,
            relationship_hints: query_result.relationship_hints,
        })
    }

    // ========== VALIDATION OPERATIONS ==========

    /// Execute one measure in every visual referencing it and compare values
    pub async fn cross_visual_validation(
        &self,
        measure_name: &str,
        page_names: Option<&[String]>,
        tolerance: f64,
    ) -> EngineResult<CrossVisualReport> {
        let qe = self.require_executor()?;
        let clean = measure_name.trim().trim_matches(['[', ']']).to_string();

        let pages: Vec<String> = match page_names {
            Some(names) => names.to_vec(),
            None => self.builder.list_pages()?.into_iter().map(|p| p.name).collect(),
        };

        let mut results: Vec<VisualValue> = Vec::new();
        for page in &pages {
            for visual in self.builder.list_visuals(page, false)? {
                if visual.is_slicer {
                    continue;
                }
                let uses_measure = visual
                    .measures
                    .iter()
                    .any(|m| m.trim_matches(['[', ']']).eq_ignore_ascii_case(&clean));
                if !uses_measure {
                    continue;
                }

                let req = VisualQueryRequest {
                    page_name: page.clone(),
                    visual_id: Some(visual.id.clone()),
                    measure_name: Some(clean.clone()),
                    include_slicers: true,
                    ..Default::default()
                };
                match self.builder.build_visual_query(&req).await {
                    Ok(query_result) => {
                        let exec = qe.validate_and_execute_dax(&query_result.dax_query, 1).await;
                        results.push(VisualValue {
                            page: page.clone(),
                            visual: visual.friendly_name.clone(),
                            value: exec
                                .rows
                                .first()
                                .and_then(executor::first_cell)
                                .cloned(),
                            time_ms: exec.execution_time_ms,
                            success: exec.success,
                            error: exec.error,
                        });
                    }
                    Err(err) => results.push(VisualValue {
                        page: page.clone(),
                        visual: visual.friendly_name.clone(),
                        value: None,
                        time_ms: 0.0,
                        success: false,
                        error: Some(err.to_string()),
                    }),
                }
            }
        }

        let discrepancies = find_discrepancies(&results, tolerance);
        Ok(CrossVisualReport {
            measure: clean,
            visuals_checked: results.len(),
            has_discrepancies: !discrepancies.is_empty(),
            results,
            discrepancies,
        })
    }

    /// Assert one visual's value equals an expectation within tolerance
    pub async fn expected_value_test(
        &self,
        req: &VisualQueryRequest,
        expected_value: Option<Value>,
        extra_filters: Option<&[String]>,
        tolerance: f64,
    ) -> EngineResult<ExpectedValueReport> {
        let qe = self.require_executor()?;
        let query_result = self.builder.build_visual_query(req).await?;

        let measures = if query_result.visual.measures.is_empty() {
            vec![query_result.measure_name.clone()]
        } else {
            query_result.visual.measures.clone()
        };
        let query = match extra_filters {
            Some(extras) if !extras.is_empty() => {
                let mut filters: Vec<FilterExpression> = query_result
                    .filter_context
                    .all_filters()
                    .into_iter()
                    .cloned()
                    .collect();
                filters.extend(extras.iter().map(|f| FilterExpression::manual(f.as_str())));
                let refs: Vec<&FilterExpression> = filters.iter().collect();
                query_builder::build_query(&measures, &query_result.visual.columns, &refs)
            }
            _ => query_result.dax_query.clone(),
        };

        let exec = qe.validate_and_execute_dax(&query, 10).await;
        if !exec.success {
            return Err(EngineError::InvalidDax(
                exec.error.unwrap_or_else(|| "query execution failed".to_string()),
            ));
        }

        let actual_value = exec.rows.first().and_then(executor::first_cell).cloned();

        let (test_passed, difference) = match (&expected_value, &actual_value) {
            (Some(expected), Some(actual)) => {
                match (expected.as_f64(), actual.as_f64()) {
                    (Some(e), Some(a)) => ((a - e).abs() <= tolerance, Some(a - e)),
                    _ => (expected.to_string() == actual.to_string(), None),
                }
            }
            (None, None) => (true, None),
            _ => (false, None),
        };

        Ok(ExpectedValueReport {
            test_passed,
            page: req.page_name.clone(),
            visual_id: query_result.visual.visual_id.clone(),
            expected_value,
            actual_value,
            difference,
            tolerance,
            execution_time_ms: exec.execution_time_ms,
            query,
            filters_applied: query_result.filter_context.total()
                + extra_filters.map(<[String]>::len).unwrap_or(0),
        })
    }

    /// Sweep slicer value combinations and report nulls/errors
    pub async fn filter_permutation_test(
        &self,
        req: &VisualQueryRequest,
        max_permutations: usize,
    ) -> EngineResult<PermutationReport> {
        let qe = self.require_executor()?;
        let query_result = self.builder.build_visual_query(req).await?;

        // up to three slicers, up to five distinct values each
        let slicers = self.builder.list_slicers(Some(&req.page_name))?;
        let mut slicer_values: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for slicer in slicers.iter().take(3) {
            let column_ref = format!("'{}'[{}]", slicer.table, slicer.column);
            let query = format!("EVALUATE TOPN(5, DISTINCT({column_ref}))");
            let result = qe.validate_and_execute_dax(&query, 5).await;
            if !result.success {
                continue;
            }
            let values: Vec<Value> = result
                .rows
                .iter()
                .filter_map(executor::first_cell)
                .filter(|v| !v.is_null())
                .take(5)
                .cloned()
                .collect();
            if !values.is_empty() {
                slicer_values.insert(column_ref, values);
            }
        }

        let permutations = cartesian_product(&slicer_values, max_permutations);
        let measures = query_result.visual.measures.clone();
        let columns = query_result.visual.columns.clone();

        let mut results = Vec::new();
        for (i, permutation) in permutations.into_iter().enumerate() {
            let filter_fragments: Vec<FilterExpression> = permutation
                .iter()
                .map(|(column_ref, value)| {
                    FilterExpression::manual(format!(
                        "{column_ref} = {}",
                        render_json_literal(value)
                    ))
                })
                .collect();
            let refs: Vec<&FilterExpression> = filter_fragments.iter().collect();
            let query = query_builder::build_query(&measures, &columns, &refs);

            let exec = qe.validate_and_execute_dax(&query, 1).await;
            let value = exec.rows.first().and_then(executor::first_cell).cloned();
            results.push(PermutationResult {
                permutation: i + 1,
                filters: permutation,
                is_null: value.is_none()
                    || value.as_ref().map(Value::is_null).unwrap_or(false),
                is_error: !exec.success,
                error: exec.error,
                time_ms: exec.execution_time_ms,
                value,
            });
        }

        let null_results = results.iter().filter(|r| r.is_null && !r.is_error).count();
        let error_results = results.iter().filter(|r| r.is_error).count();

        let mut issues = Vec::new();
        if null_results > 0 {
            issues.push(format!("{null_results} filter combination(s) returned NULL"));
        }
        if error_results > 0 {
            issues.push(format!("{error_results} filter combination(s) caused errors"));
        }

        Ok(PermutationReport {
            page: req.page_name.clone(),
            visual_id: query_result.visual.visual_id.clone(),
            permutations_tested: results.len(),
            null_results,
            error_results,
            results,
            issues,
        })
    }

    // ========== PROFILING OPERATIONS ==========

    /// Profile every data visual on a page.
    ///
    /// Queries are compiled sequentially, then executed through a bounded
    /// task pool of `min(max_workers, visual_count)` concurrent workers; the
    /// pool is joined before returning and results are ordered by average
    /// execution time descending.
    pub async fn profile_page(
        &self,
        page_name: &str,
        opts: &ProfileOptions,
    ) -> EngineResult<PageProfile> {
        let qe = self.require_executor()?;

        let visuals = self.builder.list_visuals(page_name, false)?;
        let data_visuals: Vec<_> = visuals.into_iter().filter(|v| !v.is_slicer).collect();
        if data_visuals.is_empty() {
            return Ok(PageProfile {
                page: page_name.to_string(),
                visuals_profiled: 0,
                total_time_ms: 0.0,
                avg_time_per_visual_ms: 0.0,
                execution_mode: ExecutionMode::Sequential,
                results: Vec::new(),
                recommendations: vec![
                    "No data visuals to profile (page contains only slicers/UI elements)"
                        .to_string(),
                ],
            });
        }

        // compile queries up front; execution is the parallel section
        let mut jobs = Vec::new();
        for visual in &data_visuals {
            let req = VisualQueryRequest {
                page_name: page_name.to_string(),
                visual_id: Some(visual.id.clone()),
                include_slicers: opts.include_slicers,
                ..Default::default()
            };
            match self.builder.build_visual_query(&req).await {
                Ok(query_result) => jobs.push((
                    visual.clone(),
                    query_result.dax_query,
                    query_result.filter_context.total(),
                )),
                Err(err) => {
                    tracing::warn!(visual = visual.id.as_str(), %err, "skipping visual in profile");
                }
            }
        }

        let iterations = opts.iterations.max(1);
        let parallel = opts.parallel && jobs.len() > 1;
        let execution_mode =
            if parallel { ExecutionMode::Parallel } else { ExecutionMode::Sequential };

        let mut results: Vec<VisualProfile> = Vec::new();

        if parallel {
            let permits = opts.max_workers.clamp(1, jobs.len());
            let semaphore = Arc::new(Semaphore::new(permits));
            let mut set = JoinSet::new();

            for (visual, query, filter_count) in jobs {
                let qe = Arc::clone(qe);
                let semaphore = Arc::clone(&semaphore);
                let thresholds =
                    (self.config.slow_visual_threshold_ms, self.config.large_result_threshold);
                set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok()?;
                    profile_one(qe.as_ref(), &visual, &query, filter_count, iterations, thresholds)
                        .await
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Some(profile)) => results.push(profile),
                    Ok(None) => {}
                    Err(err) => tracing::warn!(%err, "profile task failed"),
                }
            }
        } else {
            for (visual, query, filter_count) in jobs {
                if let Some(profile) = profile_one(
                    qe.as_ref(),
                    &visual,
                    &query,
                    filter_count,
                    iterations,
                    (self.config.slow_visual_threshold_ms, self.config.large_result_threshold),
                )
                .await
                {
                    results.push(profile);
                }
            }
        }

        results.sort_by(|a, b| b.avg_time_ms.total_cmp(&a.avg_time_ms));
        let total_time: f64 = results.iter().map(|r| r.avg_time_ms).sum();

        let mut recommendations = Vec::new();
        let slow: Vec<&VisualProfile> =
            results.iter().filter(|r| r.avg_time_ms > 1000.0).collect();
        if !slow.is_empty() {
            let names: Vec<&str> =
                slow.iter().take(3).map(|r| r.visual_name.as_str()).collect();
            recommendations
                .push(format!("Optimize {} slow visual(s): {}", slow.len(), names.join(", ")));
        }
        if total_time > 5000.0 {
            recommendations.push(format!(
                "Page total load time ({total_time:.0}ms) exceeds the 5s target"
            ));
        }
        let large = results.iter().filter(|r| r.row_count > 500).count();
        if large > 0 {
            recommendations.push(format!(
                "{large} visual(s) return large result sets; consider aggregation"
            ));
        }

        Ok(PageProfile {
            page: page_name.to_string(),
            visuals_profiled: results.len(),
            total_time_ms: (total_time * 10.0).round() / 10.0,
            avg_time_per_visual_ms: if results.is_empty() {
                0.0
            } else {
                (total_time / results.len() as f64 * 10.0).round() / 10.0
            },
            execution_mode,
            results,
            recommendations,
        })
    }

    /// Baseline plus per-filter timing variants for one visual
    pub async fn filter_performance_matrix(
        &self,
        req: &VisualQueryRequest,
        filter_columns: Option<&[String]>,
        max_combinations: usize,
    ) -> EngineResult<FilterMatrixReport> {
        let qe = self.require_executor()?;
        let query_result = self.builder.build_visual_query(req).await?;

        let columns: Vec<String> = match filter_columns {
            Some(cols) if !cols.is_empty() => cols.to_vec(),
            _ => self
                .builder
                .list_slicers(Some(&req.page_name))?
                .iter()
                .take(3)
                .map(|s| format!("'{}'[{}]", s.table, s.column))
                .collect(),
        };

        let baseline = qe.validate_and_execute_dax(&query_result.dax_query, 1).await;
        let baseline_time = baseline.execution_time_ms;

        let mut matrix = vec![MatrixEntry {
            filters: "baseline (current)".to_string(),
            time_ms: baseline_time,
            relative: 1.0,
            status: MatrixStatus::Baseline,
            error: None,
        }];

        let measures = query_result.visual.measures.clone();
        let grouping = query_result.visual.columns.clone();

        'outer: for column_ref in &columns {
            let values_query = format!("EVALUATE TOPN(5, DISTINCT({column_ref}))");
            let values_result = qe.validate_and_execute_dax(&values_query, 5).await;
            if !values_result.success {
                continue;
            }

            let values: Vec<Value> = values_result
                .rows
                .iter()
                .filter_map(executor::first_cell)
                .filter(|v| !v.is_null())
                .take(3)
                .cloned()
                .collect();

            for value in values {
                if matrix.len() >= max_combinations {
                    break 'outer;
                }

                let filter_dax = format!("{column_ref} = {}", render_json_literal(&value));
                let test_filter = FilterExpression::manual(filter_dax.clone());
                let refs: Vec<&FilterExpression> = vec![&test_filter];
                let query = query_builder::build_query(&measures, &grouping, &refs);

                let exec = qe.validate_and_execute_dax(&query, 1).await;
                if !exec.success {
                    matrix.push(MatrixEntry {
                        filters: filter_dax,
                        time_ms: 0.0,
                        relative: 0.0,
                        status: MatrixStatus::Error,
                        error: exec.error,
                    });
                    continue;
                }

                let relative = if baseline_time > 0.0 {
                    exec.execution_time_ms / baseline_time
                } else {
                    1.0
                };
                let status = if relative > 2.0 {
                    MatrixStatus::Slow
                } else if relative < 0.5 {
                    MatrixStatus::Fast
                } else {
                    MatrixStatus::Normal
                };
                matrix.push(MatrixEntry {
                    filters: filter_dax,
                    time_ms: exec.execution_time_ms,
                    relative: (relative * 100.0).round() / 100.0,
                    status,
                    error: None,
                });
            }
        }

        let slow_filters: Vec<String> = matrix
            .iter()
            .filter(|m| m.status == MatrixStatus::Slow)
            .map(|m| m.filters.clone())
            .collect();
        let recommendation = if slow_filters.is_empty() {
            "No problematic filters found".to_string()
        } else {
            format!("{} filter(s) cause a >2x slowdown", slow_filters.len())
        };

        Ok(FilterMatrixReport {
            page: req.page_name.clone(),
            visual_id: query_result.visual.visual_id.clone(),
            baseline_time_ms: baseline_time,
            combinations_tested: matrix.len(),
            matrix,
            slow_filters,
            recommendation,
        })
    }

    // ========== DOCUMENTATION OPERATIONS ==========

    /// Document one page from parsed metadata (lightweight) or full filter
    /// contexts (no measure expansion either way)
    pub fn document_page(
        &self,
        page_name: &str,
        opts: &DocumentOptions,
    ) -> EngineResult<PageDocumentation> {
        let all_visuals = self.builder.list_visuals(page_name, true)?;
        let slicers = self.builder.list_slicers(Some(page_name))?;

        let data_visuals: Vec<_> =
            all_visuals.iter().filter(|v| v.is_data_visual).collect();
        let ui_elements: Vec<_> =
            all_visuals.iter().filter(|v| !v.is_data_visual).collect();

        let page_path = self.builder.bundle().find_page(page_name)?;
        let report_filter_count = self.builder.bundle().report_filters().len();
        let page_filter_count = self.builder.bundle().page_filters(&page_path).len();

        let shown: Vec<_> = if opts.include_ui_elements {
            all_visuals.iter().collect()
        } else {
            data_visuals.clone()
        };

        let mut visual_docs = Vec::new();
        for visual in shown {
            if visual.is_slicer {
                continue;
            }
            visual_docs.push(VisualDoc {
                id: visual.id.clone(),
                name: visual.friendly_name.clone(),
                type_display: visual.type_display.clone(),
                title: visual.title.clone(),
                is_data_visual: visual.is_data_visual,
                measures: visual.measures.clone(),
                columns: visual.columns.clone(),
                filters: VisualFilterCounts {
                    report: report_filter_count,
                    page: page_filter_count,
                    visual: visual.filters.len(),
                    slicer: slicers.len(),
                },
            });
        }

        let slicer_docs: Vec<SlicerDoc> = slicers
            .iter()
            .map(|s| SlicerDoc {
                id: s.slicer_id.clone(),
                field: s.field_reference.clone(),
                table: s.table.clone(),
                column: s.column.clone(),
                selection_mode: format!("{:?}", s.selection_mode),
                current_selection: s
                    .selected_values
                    .iter()
                    .take(5)
                    .map(|v| v.display())
                    .collect(),
                selection_count: s.selected_values.len(),
            })
            .collect();

        let mut data_type_counts = BTreeMap::new();
        let mut ui_type_counts = BTreeMap::new();
        for v in &all_visuals {
            let bucket = if v.is_data_visual {
                &mut data_type_counts
            } else {
                &mut ui_type_counts
            };
            *bucket.entry(v.type_display.clone()).or_insert(0) += 1;
        }
        let slicer_count_in_ui = ui_elements.iter().filter(|v| v.is_slicer).count();

        let measures: std::collections::BTreeSet<&String> =
            visual_docs.iter().flat_map(|v| &v.measures).collect();
        let columns: std::collections::BTreeSet<&String> =
            visual_docs.iter().flat_map(|v| &v.columns).collect();

        Ok(PageDocumentation {
            page: page_name.to_string(),
            data_visual_count: visual_docs.len(),
            slicer_count: slicer_docs.len(),
            summary: PageDocSummary {
                total_page_elements: all_visuals.len(),
                data_visuals: data_visuals.len(),
                slicers: slicer_docs.len(),
                ui_elements: ui_elements.len() - slicer_count_in_ui,
                total_measures: measures.len(),
                total_columns: columns.len(),
                data_visual_types: data_type_counts,
                ui_element_types: ui_type_counts,
            },
            visuals: visual_docs,
            slicers: slicer_docs,
        })
    }

    /// Document every page with a report-level rollup
    pub fn document_report(&self, opts: &DocumentOptions) -> EngineResult<ReportDocumentation> {
        let pages = self.builder.list_pages()?;

        let mut page_docs = Vec::new();
        let mut all_measures = std::collections::BTreeSet::new();
        let mut all_columns = std::collections::BTreeSet::new();
        let mut total_visuals = 0;
        let mut total_slicers = 0;

        for page in &pages {
            let doc = self.document_page(&page.name, opts)?;
            total_visuals += doc.data_visual_count;
            total_slicers += doc.slicer_count;
            for v in &doc.visuals {
                all_measures.extend(v.measures.iter().cloned());
                all_columns.extend(v.columns.iter().cloned());
            }
            page_docs.push(doc);
        }

        Ok(ReportDocumentation {
            page_count: page_docs.len(),
            pages: page_docs,
            total_visuals,
            total_slicers,
            all_measures: all_measures.into_iter().collect(),
            all_columns: all_columns.into_iter().collect(),
        })
    }

    /// Inverted index: measure -> consuming visuals
    pub fn measure_lineage(&self, measure_name: Option<&str>) -> EngineResult<MeasureLineage> {
        let wanted = measure_name.map(|m| m.trim_matches(['[', ']']).to_lowercase());
        let mut map: BTreeMap<String, MeasureLineageEntry> = BTreeMap::new();

        for page in self.builder.list_pages()? {
            for visual in self.builder.list_visuals(&page.name, false)? {
                if visual.is_slicer {
                    continue;
                }
                for measure in &visual.measures {
                    let clean = measure.trim_matches(['[', ']']).to_string();
                    if let Some(wanted) = &wanted {
                        if clean.to_lowercase() != *wanted {
                            continue;
                        }
                    }

                    let entry =
                        map.entry(clean.clone()).or_insert_with(|| MeasureLineageEntry {
                            measure: clean.clone(),
                            usage_count: 0,
                            pages: Vec::new(),
                            visuals: Vec::new(),
                        });
                    entry.usage_count += 1;
                    if !entry.pages.contains(&page.name) {
                        entry.pages.push(page.name.clone());
                    }
                    entry.visuals.push(LineageVisual {
                        visual_id: visual.id.clone(),
                        visual_name: visual.friendly_name.clone(),
                        visual_type: visual.visual_type.clone(),
                        page: page.name.clone(),
                    });
                }
            }
        }

        let mut lineage: Vec<MeasureLineageEntry> = map.into_values().collect();
        lineage.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));

        Ok(MeasureLineage {
            measure_filter: measure_name.map(str::to_string),
            measures_found: lineage.len(),
            lineage,
        })
    }

    /// Inverted index: filter -> affected visuals
    pub fn filter_lineage(&self, page_name: Option<&str>) -> EngineResult<FilterLineage> {
        let converter = crate::debug::filters::FilterConverter::new();
        let pages: Vec<_> = self
            .builder
            .list_pages()?
            .into_iter()
            .filter(|p| {
                page_name
                    .map(|n| p.name.eq_ignore_ascii_case(n))
                    .unwrap_or(true)
            })
            .collect();

        let mut map: BTreeMap<String, FilterLineageEntry> = BTreeMap::new();

        for raw in self.builder.bundle().report_filters() {
            if let Some(expr) =
                converter.convert_filter(&raw, crate::debug::filters::FilterSource::Report)
            {
                map.entry(format!("report:{}.{}", expr.table, expr.column)).or_insert(
                    FilterLineageEntry {
                        level: "report".to_string(),
                        page: None,
                        table: expr.table,
                        column: expr.column,
                        dax: Some(expr.dax),
                        affects_all: true,
                        visual_count: 0,
                        current_selection: Vec::new(),
                    },
                );
            }
        }

        for page in &pages {
            let page_path = self.builder.bundle().find_page(&page.name)?;
            for raw in self.builder.bundle().page_filters(&page_path) {
                if let Some(expr) =
                    converter.convert_filter(&raw, crate::debug::filters::FilterSource::Page)
                {
                    map.entry(format!("page:{}:{}.{}", page.name, expr.table, expr.column))
                        .or_insert(FilterLineageEntry {
                            level: "page".to_string(),
                            page: Some(page.name.clone()),
                            table: expr.table,
                            column: expr.column,
                            dax: Some(expr.dax),
                            affects_all: false,
                            visual_count: 0,
                            current_selection: Vec::new(),
                        });
                }
            }

            for slicer in self.builder.list_slicers(Some(&page.name))? {
                map.entry(format!(
                    "slicer:{}:{}.{}",
                    page.name, slicer.table, slicer.column
                ))
                .or_insert(FilterLineageEntry {
                    level: "slicer".to_string(),
                    page: Some(page.name.clone()),
                    table: slicer.table.clone(),
                    column: slicer.column.clone(),
                    dax: None,
                    affects_all: false,
                    visual_count: 0,
                    current_selection: slicer
                        .selected_values
                        .iter()
                        .take(3)
                        .map(|v| v.display())
                        .collect(),
                });
            }

            let non_slicer = self
                .builder
                .list_visuals(&page.name, false)?
                .iter()
                .filter(|v| !v.is_slicer)
                .count();
            for entry in map.values_mut() {
                if entry.level == "report" {
                    entry.visual_count += non_slicer;
                } else if entry.page.as_deref() == Some(page.name.as_str()) {
                    entry.visual_count = non_slicer;
                }
            }
        }

        Ok(FilterLineage {
            page_filter: page_name.map(str::to_string),
            filters_found: map.len(),
            lineage: map.into_values().collect(),
        })
    }

    // ========== ADVANCED ANALYSIS OPERATIONS ==========

    /// Break an aggregated value down by one dimension
    pub async fn decompose_value(
        &self,
        req: &VisualQueryRequest,
        dimension: Option<&str>,
        top_n: usize,
    ) -> EngineResult<Decomposition> {
        let qe = self.require_executor()?;
        let query_result = self.builder.build_visual_query(req).await?;

        let dimension = match dimension {
            Some(d) => d.to_string(),
            None => query_result.visual.columns.first().cloned().ok_or_else(|| {
                EngineError::InvalidDax(
                    "no dimension given and the visual has no grouping columns; pass one like \
                     \"'Product'[Category]\""
                        .to_string(),
                )
            })?,
        };

        let measure = query_result.measure_name.clone();
        let filter_dax: Vec<String> = query_result
            .filter_context
            .data_filters()
            .iter()
            .map(|f| f.dax.clone())
            .collect();
        let filter_str = filter_dax.join(", ");

        // grand total under the same data filters
        let total_query = if filter_str.is_empty() {
            format!("EVALUATE\nROW(\"Value\", {measure})")
        } else {
            format!("EVALUATE\nROW(\"Value\", CALCULATE({measure}, {filter_str}))")
        };
        let total_result = qe.validate_and_execute_dax(&total_query, 1).await;
        let total_value =
            total_result.rows.first().and_then(executor::first_cell).cloned();

        let decomp_query = if filter_str.is_empty() {
            format!(
                "EVALUATE\nTOPN(\n    {top_n},\n    ADDCOLUMNS(\n        VALUES({dimension}),\n        \"Value\", {measure}\n    ),\n    [Value], DESC\n)"
            )
        } else {
            format!(
                "EVALUATE\nTOPN(\n    {top_n},\n    ADDCOLUMNS(\n        CALCULATETABLE(VALUES({dimension}), {filter_str}),\n        \"Value\", CALCULATE({measure}, {filter_str})\n    ),\n    [Value], DESC\n)"
            )
        };

        let decomp = qe.validate_and_execute_dax(&decomp_query, top_n).await;
        if !decomp.success {
            return Err(EngineError::InvalidDax(
                decomp.error.unwrap_or_else(|| "decomposition query failed".to_string()),
            ));
        }

        let total_num = total_value.as_ref().and_then(Value::as_f64);
        let mut components = Vec::new();
        let mut running = 0.0;
        for row in &decomp.rows {
            let cells: Vec<&Value> = row.values().collect();
            let dimension_value = cells.first().copied().cloned();
            let value = cells.get(1).copied().or(cells.first().copied()).cloned();

            let numeric = value.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
            running += numeric;
            let (percentage, cumulative) = match total_num {
                Some(total) if total != 0.0 => {
                    (numeric / total * 100.0, running / total * 100.0)
                }
                _ => (0.0, 0.0),
            };

            components.push(DecompositionComponent {
                dimension_value,
                value,
                percentage: (percentage * 10.0).round() / 10.0,
                cumulative_pct: (cumulative * 10.0).round() / 10.0,
            });
        }

        Ok(Decomposition {
            page: req.page_name.clone(),
            visual_id: query_result.visual.visual_id.clone(),
            total_value,
            dimension,
            top_n,
            coverage: components.last().map(|c| c.cumulative_pct).unwrap_or(0.0),
            components,
        })
    }

    /// Pareto split of a decomposition at the 80% cumulative mark
    pub async fn contribution_analysis(
        &self,
        req: &VisualQueryRequest,
        dimension: Option<&str>,
        top_n: usize,
    ) -> EngineResult<ContributionReport> {
        let decomposition = self.decompose_value(req, dimension, top_n).await?;

        let top: Vec<&DecompositionComponent> = decomposition
            .components
            .iter()
            .filter(|c| c.cumulative_pct <= 80.0)
            .collect();
        let top_count = top.len();
        let top_coverage = top.last().map(|c| c.cumulative_pct).unwrap_or(0.0);
        let remaining = decomposition.components.len() - top_count;

        let insight = format!(
            "{top_count} of {} {} member(s) contribute ~80% of the total",
            decomposition.components.len(),
            decomposition.dimension
        );

        Ok(ContributionReport {
            decomposition,
            top_contributor_count: top_count,
            top_contributor_coverage: top_coverage,
            remaining_items: remaining,
            insight,
        })
    }

    /// Value trend over a date column with FORMAT-based bucketing
    pub async fn trend_analysis(
        &self,
        req: &VisualQueryRequest,
        date_column: Option<&str>,
        granularity: &str,
    ) -> EngineResult<TrendReport> {
        let qe = self.require_executor()?;
        let query_result = self.builder.build_visual_query(req).await?;

        let date_column = match date_column {
            Some(d) => d.to_string(),
            None => query_result
                .visual
                .columns
                .iter()
                .find(|c| {
                    let lower = c.to_lowercase();
                    lower.contains("date") || lower.contains("time")
                })
                .cloned()
                .ok_or_else(|| {
                    EngineError::InvalidDax(
                        "no date column given and none detected; pass one like \"'Date'[Date]\""
                            .to_string(),
                    )
                })?,
        };

        let measure = query_result.measure_name.clone();
        let period_expr = match granularity {
            "day" => date_column.clone(),
            "week" => format!("WEEKNUM({date_column})"),
            "quarter" => format!(
                "FORMAT({date_column}, \"YYYY\") & \"-Q\" & FORMAT(QUARTER({date_column}), \"0\")"
            ),
            "year" => format!("YEAR({date_column})"),
            _ => format!("FORMAT({date_column}, \"YYYY-MM\")"),
        };

        let trend_query = format!(
            "EVALUATE\nADDCOLUMNS(\n    VALUES({date_column}),\n    \"Period\", {period_expr},\n    \"Value\", {measure}\n)\nORDER BY {date_column}"
        );

        let result = qe.validate_and_execute_dax(&trend_query, 100).await;
        if !result.success {
            return Err(EngineError::InvalidDax(
                result.error.unwrap_or_else(|| "trend query failed".to_string()),
            ));
        }

        let mut data: Vec<TrendPoint> = Vec::new();
        let mut prev: Option<f64> = None;
        for row in &result.rows {
            let cells: Vec<&Value> = row.values().collect();
            let period = cells.get(1).copied().or(cells.first().copied()).cloned();
            let value = cells.last().copied().cloned();
            let numeric = value.as_ref().and_then(Value::as_f64);

            let (growth, growth_pct) = match (prev, numeric) {
                (Some(p), Some(v)) => {
                    let g = v - p;
                    (Some(g), (p != 0.0).then(|| (g / p * 1000.0).round() / 10.0))
                }
                _ => (None, None),
            };
            prev = numeric.or(prev);

            data.push(TrendPoint { period, value, growth, growth_pct });
        }

        let (overall_growth, overall_growth_pct) = match (
            data.first().and_then(|p| p.value.as_ref()).and_then(Value::as_f64),
            data.last().and_then(|p| p.value.as_ref()).and_then(Value::as_f64),
        ) {
            (Some(first), Some(last)) if data.len() >= 2 => {
                let g = last - first;
                (Some(g), (first != 0.0).then(|| (g / first * 1000.0).round() / 10.0))
            }
            _ => (None, None),
        };

        let positive = data.iter().filter(|p| p.growth_pct.map(|g| g > 0.0) == Some(true)).count();
        let negative = data.iter().filter(|p| p.growth_pct.map(|g| g < 0.0) == Some(true)).count();
        let trend_direction = if positive > negative * 2 {
            TrendDirection::StronglyUpward
        } else if positive > negative {
            TrendDirection::Upward
        } else if negative > positive * 2 {
            TrendDirection::StronglyDownward
        } else if negative > positive {
            TrendDirection::Downward
        } else {
            TrendDirection::Stable
        };

        data.truncate(50);
        Ok(TrendReport {
            page: req.page_name.clone(),
            visual_id: query_result.visual.visual_id.clone(),
            date_column,
            granularity: granularity.to_string(),
            periods: result.rows.len(),
            trend_direction,
            overall_growth,
            overall_growth_pct,
            data,
        })
    }

    /// Explain a value change between two filter contexts by dimension
    pub async fn root_cause_analysis(
        &self,
        req: &VisualQueryRequest,
        baseline_filters: &[String],
        comparison_filters: &[String],
        dimensions: Option<&[String]>,
        top_n: usize,
    ) -> EngineResult<RootCauseReport> {
        let qe = self.require_executor()?;
        let query_result = self.builder.build_visual_query(req).await?;
        let measure = query_result.measure_name.clone();

        let scalar_query = |filters: &[String]| {
            if filters.is_empty() {
                format!("EVALUATE ROW(\"Value\", {measure})")
            } else {
                format!("EVALUATE ROW(\"Value\", CALCULATE({measure}, {}))", filters.join(", "))
            }
        };

        let base = qe.validate_and_execute_dax(&scalar_query(baseline_filters), 1).await;
        let comp = qe.validate_and_execute_dax(&scalar_query(comparison_filters), 1).await;

        let baseline_value = base
            .rows
            .first()
            .and_then(executor::first_cell)
            .and_then(Value::as_f64);
        let comparison_value = comp
            .rows
            .first()
            .and_then(executor::first_cell)
            .and_then(Value::as_f64);

        let (total_change, change_pct) = match (baseline_value, comparison_value) {
            (Some(b), Some(c)) => {
                let change = c - b;
                (Some(change), (b != 0.0).then(|| change / b * 100.0))
            }
            _ => (None, None),
        };

        let dims: Vec<String> = match dimensions {
            Some(d) if !d.is_empty() => d.to_vec(),
            _ => query_result.visual.columns.iter().take(3).cloned().collect(),
        };

        let breakdown_query = |dim: &str, filters: &[String]| {
            if filters.is_empty() {
                format!(
                    "EVALUATE\nADDCOLUMNS(\n    VALUES({dim}),\n    \"Value\", {measure}\n)"
                )
            } else {
                format!(
                    "EVALUATE\nADDCOLUMNS(\n    CALCULATETABLE(VALUES({dim}), {filters}),\n    \"Value\", CALCULATE({measure}, {filters})\n)",
                    filters = filters.join(", ")
                )
            }
        };

        let mut dimension_impacts = Vec::new();
        for dim in &dims {
            let base_rows =
                qe.validate_and_execute_dax(&breakdown_query(dim, baseline_filters), 50).await;
            let comp_rows = qe
                .validate_and_execute_dax(&breakdown_query(dim, comparison_filters), 50)
                .await;
            if !base_rows.success || !comp_rows.success {
                continue;
            }

            let to_map = |result: &DaxResult| -> BTreeMap<String, (Option<Value>, f64)> {
                result
                    .rows
                    .iter()
                    .filter_map(|row| {
                        let cells: Vec<&Value> = row.values().collect();
                        let member = cells.first().copied().cloned();
                        let value = cells.get(1).and_then(|v| v.as_f64()).unwrap_or(0.0);
                        member.map(|m| (m.to_string(), (Some(m), value)))
                    })
                    .collect()
            };

            let base_map = to_map(&base_rows);
            let comp_map = to_map(&comp_rows);

            let keys: std::collections::BTreeSet<&String> =
                base_map.keys().chain(comp_map.keys()).collect();
            let mut changes: Vec<DimensionChange> = keys
                .into_iter()
                .map(|key| {
                    let base_entry = base_map.get(key);
                    let comp_entry = comp_map.get(key);
                    let member = comp_entry
                        .or(base_entry)
                        .and_then(|(m, _)| m.clone());
                    let baseline = base_entry.map(|(_, v)| *v);
                    let comparison = comp_entry.map(|(_, v)| *v);
                    let change = comparison.unwrap_or(0.0) - baseline.unwrap_or(0.0);
                    let share_pct = match total_change {
                        Some(total) if total != 0.0 => {
                            (change / total * 1000.0).round() / 10.0
                        }
                        _ => 0.0,
                    };
                    DimensionChange { member, baseline, comparison, change, share_pct }
                })
                .collect();

            changes.sort_by(|a, b| b.change.abs().total_cmp(&a.change.abs()));
            changes.truncate(top_n);

            dimension_impacts.push(DimensionImpact { dimension: dim.clone(), top_changes: changes });
        }

        Ok(RootCauseReport {
            page: req.page_name.clone(),
            visual_id: query_result.visual.visual_id.clone(),
            baseline_value,
            comparison_value,
            total_change,
            change_pct,
            dimension_impacts,
        })
    }
}

/// Run the timed iterations for one visual and derive its issues
async fn profile_one(
    qe: &dyn QueryExecutor,
    visual: &crate::debug::bundle::VisualSummary,
    query: &str,
    filter_count: usize,
    iterations: usize,
    (slow_threshold_ms, large_threshold): (f64, usize),
) -> Option<VisualProfile> {
    let mut times = Vec::new();
    let mut row_count = 0;

    for _ in 0..iterations {
        let exec = qe.validate_and_execute_dax(query, 100).await;
        if exec.success {
            times.push(exec.execution_time_ms);
            row_count = row_count.max(exec.rows.len());
        }
    }
    if times.is_empty() {
        return None;
    }

    let avg = times.iter().sum::<f64>() / times.len() as f64;
    let min = times.iter().copied().fold(f64::INFINITY, f64::min);
    let max = times.iter().copied().fold(0.0_f64, f64::max);

    let mut issues = Vec::new();
    if avg > slow_threshold_ms {
        issues.push(format!("Slow query ({avg:.0}ms > {slow_threshold_ms:.0}ms)"));
    }
    if row_count > large_threshold {
        issues.push(format!("Large result set ({row_count} rows)"));
    }
    if times.len() > 1 && max > min * 2.0 {
        issues.push(format!("High variance ({min:.0}-{max:.0}ms)"));
    }

    Some(VisualProfile {
        visual_id: visual.id.clone(),
        visual_name: visual.friendly_name.clone(),
        visual_type: visual.visual_type.clone(),
        measures: visual.measures.clone(),
        avg_time_ms: (avg * 10.0).round() / 10.0,
        min_time_ms: (min * 10.0).round() / 10.0,
        max_time_ms: (max * 10.0).round() / 10.0,
        row_count,
        filter_count,
        issues,
    })
}

/// Absolute-difference comparison of every successful value to the first one
fn find_discrepancies(results: &[VisualValue], tolerance: f64) -> Vec<Discrepancy> {
    let successful: Vec<&VisualValue> =
        results.iter().filter(|r| r.success && r.value.is_some()).collect();
    if successful.len() < 2 {
        return Vec::new();
    }

    let baseline = successful[0];
    let mut discrepancies = Vec::new();

    for other in &successful[1..] {
        let differs = match (
            baseline.value.as_ref().and_then(Value::as_f64),
            other.value.as_ref().and_then(Value::as_f64),
        ) {
            (Some(b), Some(o)) => {
                let diff = (o - b).abs();
                if diff > tolerance {
                    Some(Some(diff))
                } else {
                    None
                }
            }
            _ => {
                let b = baseline.value.as_ref().map(Value::to_string);
                let o = other.value.as_ref().map(Value::to_string);
                (b != o).then_some(None)
            }
        };

        if let Some(difference) = differs {
            discrepancies.push(Discrepancy {
                baseline: ValuePoint {
                    page: baseline.page.clone(),
                    visual: baseline.visual.clone(),
                    value: baseline.value.clone(),
                },
                different: ValuePoint {
                    page: other.page.clone(),
                    visual: other.visual.clone(),
                    value: other.value.clone(),
                },
                difference,
            });
        }
    }

    discrepancies
}

/// Bounded cartesian product over slicer values, insertion order preserved
fn cartesian_product(
    slicer_values: &BTreeMap<String, Vec<Value>>,
    max_count: usize,
) -> Vec<BTreeMap<String, Value>> {
    let mut permutations: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];

    for (column_ref, values) in slicer_values {
        let mut next = Vec::new();
        'fill: for base in &permutations {
            for value in values {
                let mut extended = base.clone();
                extended.insert(column_ref.clone(), value.clone());
                next.push(extended);
                if next.len() >= max_count {
                    break 'fill;
                }
            }
        }
        permutations = next;
        if permutations.len() >= max_count {
            permutations.truncate(max_count);
        }
    }

    if slicer_values.is_empty() {
        Vec::new()
    } else {
        permutations
    }
}

/// Render a JSON result value as a DAX literal
fn render_json_literal(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::String(s) => format!("\"{}\"", s.replace('"', "\"\"")),
        other => format!("\"{other}\""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cartesian_product_bounded() {
        let mut values = BTreeMap::new();
        values.insert("'A'[x]".to_string(), vec![json!(1), json!(2), json!(3)]);
        values.insert("'B'[y]".to_string(), vec![json!("a"), json!("b")]);

        let all = cartesian_product(&values, 20);
        assert_eq!(all.len(), 6);

        let bounded = cartesian_product(&values, 4);
        assert_eq!(bounded.len(), 4);

        let empty = cartesian_product(&BTreeMap::new(), 20);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_render_json_literal() {
        assert_eq!(render_json_literal(&json!(42)), "42");
        assert_eq!(render_json_literal(&json!(true)), "TRUE");
        assert_eq!(render_json_literal(&json!("a\"b")), "\"a\"\"b\"");
    }

    #[test]
    fn test_find_discrepancies_respects_tolerance() {
        let make = |page: &str, value: f64| VisualValue {
            page: page.to_string(),
            visual: format!("v-{page}"),
            value: Some(json!(value)),
            time_ms: 1.0,
            success: true,
            error: None,
        };

        let within = vec![make("p1", 100.0), make("p2", 100.0005)];
        assert!(find_discrepancies(&within, 0.001).is_empty());

        let outside = vec![make("p1", 100.0), make("p2", 101.0)];
        let found = find_discrepancies(&outside, 0.001);
        assert_eq!(found.len(), 1);
        assert!((found[0].difference.unwrap() - 1.0).abs() < 1e-9);
    }
}
