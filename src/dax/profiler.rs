//! Query profiling comparison
//!
//! Benchmarks a DAX query through the executor's trace-capturing path
//! (warm-up plus N timed runs, fastest run selected) and compares a baseline
//! against a rewritten candidate, including a row-multiset equivalence check
//! so a "faster" rewrite that changes results is flagged.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::executor::{EnginePerformance, ProfilingResult, QueryExecutor, Row};

/// Outcome of profiling a single query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProfile {
    pub runs: usize,
    pub fastest: EnginePerformance,
    pub all_runs: Vec<EnginePerformance>,
    /// Share of total time spent in the storage engine (0-100)
    pub se_percentage: f64,
}

/// Row-multiset equivalence between two result sets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquivalenceCheck {
    pub is_equivalent: bool,
    pub reason: String,
}

/// Baseline vs optimized comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileComparison {
    pub improvement_percent: f64,
    pub baseline_ms: f64,
    pub optimized_ms: f64,
    pub baseline: QueryProfile,
    pub optimized: QueryProfile,
    pub semantic_equivalence: EquivalenceCheck,
}

/// Profiler over the consumer-provided executor
pub struct QueryProfiler {
    executor: Arc<dyn QueryExecutor>,
    timeout_secs: u64,
}

impl QueryProfiler {
    pub fn new(executor: Arc<dyn QueryExecutor>, timeout_secs: u64) -> Self {
        Self { executor, timeout_secs }
    }

    /// Warm-up, then `runs` timed executions; keeps the fastest run
    pub async fn profile_query(&self, query: &str, runs: usize) -> EngineResult<QueryProfile> {
        let warmup = self.executor.execute_dax_with_profiling(query, self.timeout_secs).await;
        if !warmup.success {
            return Err(profiling_error("warm-up", warmup));
        }

        let mut results = Vec::with_capacity(runs.max(1));
        for i in 0..runs.max(1) {
            tracing::debug!(run = i + 1, runs, "profiling benchmark run");
            let result = self.executor.execute_dax_with_profiling(query, self.timeout_secs).await;
            if !result.success {
                return Err(profiling_error("benchmark", result));
            }
            results.push(result);
        }

        let all_runs: Vec<EnginePerformance> =
            results.iter().map(|r| r.performance.clone()).collect();
        let fastest = all_runs
            .iter()
            .min_by(|a, b| a.total_ms.total_cmp(&b.total_ms))
            .cloned()
            .unwrap_or_default();
        let se_percentage = if fastest.total_ms > 0.0 {
            (fastest.se_ms / fastest.total_ms * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        Ok(QueryProfile { runs: all_runs.len(), fastest, all_runs, se_percentage })
    }

    /// Profile both queries and compare, verifying result equivalence
    pub async fn compare(
        &self,
        baseline_dax: &str,
        optimized_dax: &str,
        runs: usize,
    ) -> EngineResult<ProfileComparison> {
        let baseline = self.profile_query(baseline_dax, runs).await?;
        let optimized = self.profile_query(optimized_dax, runs).await?;

        let baseline_rows =
            self.executor.execute_dax_with_profiling(baseline_dax, self.timeout_secs).await;
        let optimized_rows =
            self.executor.execute_dax_with_profiling(optimized_dax, self.timeout_secs).await;
        let semantic_equivalence = check_equivalence(&baseline_rows.rows, &optimized_rows.rows);

        let baseline_ms = baseline.fastest.total_ms;
        let optimized_ms = optimized.fastest.total_ms;
        let improvement_percent = if baseline_ms > 0.0 {
            ((baseline_ms - optimized_ms) / baseline_ms * 100.0 * 100.0).round() / 100.0
        } else {
            0.0
        };

        Ok(ProfileComparison {
            improvement_percent,
            baseline_ms,
            optimized_ms,
            baseline,
            optimized,
            semantic_equivalence,
        })
    }
}

fn profiling_error(phase: &str, result: ProfilingResult) -> EngineError {
    let message = result.error.unwrap_or_else(|| "unknown error".to_string());
    if message.to_lowercase().contains("timeout") {
        EngineError::ExecutorTimeout(message)
    } else {
        EngineError::Internal(format!("{phase} execution failed: {message}"))
    }
}

/// Order-insensitive row comparison on serialized values
fn check_equivalence(baseline: &[Row], optimized: &[Row]) -> EquivalenceCheck {
    if baseline.len() != optimized.len() {
        return EquivalenceCheck {
            is_equivalent: false,
            reason: format!(
                "row count differs: baseline={}, optimized={}",
                baseline.len(),
                optimized.len()
            ),
        };
    }

    let signature = |rows: &[Row]| -> Vec<String> {
        let mut sigs: Vec<String> = rows
            .iter()
            .map(|row| {
                let mut cells: Vec<String> =
                    row.iter().map(|(k, v)| format!("{k}={v}")).collect();
                cells.sort();
                cells.join("|")
            })
            .collect();
        sigs.sort();
        sigs
    };

    if signature(baseline) == signature(optimized) {
        EquivalenceCheck {
            is_equivalent: true,
            reason: "results are semantically equivalent".to_string(),
        }
    } else {
        EquivalenceCheck { is_equivalent: false, reason: "data values differ".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_equivalence_ignores_row_order() {
        let a = vec![row(&[("v", json!(1))]), row(&[("v", json!(2))])];
        let b = vec![row(&[("v", json!(2))]), row(&[("v", json!(1))])];
        assert!(check_equivalence(&a, &b).is_equivalent);
    }

    #[test]
    fn test_equivalence_detects_value_change() {
        let a = vec![row(&[("v", json!(1))])];
        let b = vec![row(&[("v", json!(3))])];
        let check = check_equivalence(&a, &b);
        assert!(!check.is_equivalent);
        assert_eq!(check.reason, "data values differ");
    }

    #[test]
    fn test_equivalence_detects_count_change() {
        let a = vec![row(&[("v", json!(1))])];
        let check = check_equivalence(&a, &[]);
        assert!(!check.is_equivalent);
        assert!(check.reason.contains("row count differs"));
    }
}
