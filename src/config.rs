//! Engine configuration
//!
//! Tunables for the DAX analyzer and the visual debug orchestrator. Defaults
//! match the thresholds the analysis rules were calibrated against.

/// Configuration for the DAX analysis pipeline
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Expressions longer than this are still analyzed but logged as oversized
    pub max_expression_length: usize,
    /// CALCULATE nesting depth above which a warning is emitted
    pub nested_calculate_limit: usize,
    /// Iterator-with-measure transition count above which a warning is emitted
    pub iterator_warning_limit: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_expression_length: 50_000,
            nested_calculate_limit: 10,
            iterator_warning_limit: 5,
        }
    }
}

/// Configuration for debug orchestrator operations
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Query execution timeout passed through to the executor (seconds)
    pub query_timeout_secs: u64,
    /// Default profiling iterations per visual
    pub profile_iterations: usize,
    /// Default cap on concurrent queries in `profile_page`
    pub max_workers: usize,
    /// Visual average execution time above this is flagged (milliseconds)
    pub slow_visual_threshold_ms: f64,
    /// Result sets larger than this are flagged
    pub large_result_threshold: usize,
    /// Report-bundle files older than this trigger a staleness warning (minutes)
    pub bundle_freshness_minutes: f64,
    /// Numeric tolerance for value comparisons
    pub tolerance: f64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: 120,
            profile_iterations: 3,
            max_workers: 4,
            slow_visual_threshold_ms: 2000.0,
            large_result_threshold: 1000,
            bundle_freshness_minutes: 5.0,
            tolerance: 0.001,
        }
    }
}
