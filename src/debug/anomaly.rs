//! Result-set anomaly detection
//!
//! Scans query result rows for empty results, null concentration, IQR
//! outliers, high coefficient of variation, and semantically unexpected
//! values (negative revenue-like columns, percentage columns outside
//! plausible bounds).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::Row;

/// Severity of a detected anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Info,
    Warning,
    Critical,
}

/// Kind of anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    EmptyResult,
    NullConcentration,
    NullPresence,
    Outlier,
    Variance,
    UnexpectedValue,
    ExtremePercentage,
}

/// A detected anomaly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    /// `*` for row-level findings
    pub column: String,
    pub description: String,
    /// Up to five offending sample values
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub examples: Vec<f64>,
}

/// Basic statistics for one numeric column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub stdev: f64,
    pub q1: f64,
    pub q3: f64,
    pub count: usize,
}

/// Full anomaly report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub count: usize,
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub items: Vec<Anomaly>,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty", default)]
    pub stats: std::collections::BTreeMap<String, ColumnStats>,
}

impl AnomalyReport {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_issues(&self) -> bool {
        self.items
            .iter()
            .any(|a| a.severity != AnomalySeverity::Info)
    }
}

const NULL_THRESHOLD_PCT: f64 = 0.5;
const NULL_PRESENCE_PCT: f64 = 0.1;
const IQR_MULTIPLIER: f64 = 1.5;
const MIN_ROWS_FOR_STATS: usize = 5;
const HIGH_VARIANCE_CV: f64 = 2.0;
const PERCENTAGE_LOWER_BOUND: f64 = -2.0;
const PERCENTAGE_UPPER_BOUND: f64 = 5.0;

// Columns matching these keywords should not go negative
const NON_NEGATIVE_KEYWORDS: &[&str] = &[
    "sales", "revenue", "amount", "count", "quantity", "total", "price", "cost", "profit",
    "units", "volume", "nav", "asset", "balance", "aum", "market value", "net asset",
];

// Columns matching these represent rates/percentages in decimal form
const PERCENTAGE_KEYWORDS: &[&str] = &[
    "%", "pct", "percent", "return", "rate", "yield", "growth", "mwr", "twr", "irr", "margin",
    "ratio",
];

/// Anomaly detector over result rows
#[derive(Default)]
pub struct AnomalyDetector;

impl AnomalyDetector {
    pub fn new() -> Self {
        Self
    }

    /// Analyze a row set; an empty report means nothing notable
    pub fn analyze(&self, rows: &[Row]) -> AnomalyReport {
        let mut report = AnomalyReport::default();

        if rows.is_empty() {
            push(&mut report, Anomaly {
                anomaly_type: AnomalyType::EmptyResult,
                severity: AnomalySeverity::Warning,
                column: "*".to_string(),
                description: "Query returned no rows".to_string(),
                examples: Vec::new(),
            });
            return report;
        }

        let columns: Vec<String> = rows[0].keys().cloned().collect();
        for column in &columns {
            let values: Vec<Option<&Value>> =
                rows.iter().map(|row| row.get(column)).collect();

            if let Some(a) = check_null_concentration(column, &values) {
                push(&mut report, a);
            }

            let numeric: Vec<f64> = values
                .iter()
                .filter_map(|v| v.and_then(Value::as_f64))
                .collect();

            if numeric.len() >= MIN_ROWS_FOR_STATS {
                let stats = compute_stats(&numeric);

                for a in check_outliers(column, &numeric, &stats) {
                    push(&mut report, a);
                }
                if let Some(a) = check_high_variance(column, &stats) {
                    push(&mut report, a);
                }
                report.stats.insert(column.clone(), stats);
            }

            for a in check_semantic_bounds(column, &numeric) {
                push(&mut report, a);
            }
        }

        report
    }
}

fn push(report: &mut AnomalyReport, anomaly: Anomaly) {
    match anomaly.severity {
        AnomalySeverity::Critical => report.critical += 1,
        AnomalySeverity::Warning => report.warning += 1,
        AnomalySeverity::Info => report.info += 1,
    }
    report.items.push(anomaly);
    report.count = report.items.len();
}

fn check_null_concentration(column: &str, values: &[Option<&Value>]) -> Option<Anomaly> {
    let total = values.len();
    if total == 0 {
        return None;
    }
    let nulls = values
        .iter()
        .filter(|v| v.is_none() || matches!(v, Some(Value::Null)))
        .count();
    let fraction = nulls as f64 / total as f64;

    if nulls == total {
        Some(Anomaly {
            anomaly_type: AnomalyType::NullConcentration,
            severity: AnomalySeverity::Critical,
            column: column.to_string(),
            description: format!("All {total} values are NULL"),
            examples: Vec::new(),
        })
    } else if fraction > NULL_THRESHOLD_PCT {
        Some(Anomaly {
            anomaly_type: AnomalyType::NullConcentration,
            severity: AnomalySeverity::Warning,
            column: column.to_string(),
            description: format!("{nulls}/{total} ({:.0}%) values are NULL", fraction * 100.0),
            examples: Vec::new(),
        })
    } else if fraction > NULL_PRESENCE_PCT {
        Some(Anomaly {
            anomaly_type: AnomalyType::NullPresence,
            severity: AnomalySeverity::Info,
            column: column.to_string(),
            description: format!("{nulls}/{total} ({:.0}%) values are NULL", fraction * 100.0),
            examples: Vec::new(),
        })
    } else {
        None
    }
}

fn check_outliers(column: &str, values: &[f64], stats: &ColumnStats) -> Vec<Anomaly> {
    let iqr = stats.q3 - stats.q1;
    if iqr == 0.0 {
        return Vec::new();
    }

    let lower = stats.q1 - IQR_MULTIPLIER * iqr;
    let upper = stats.q3 + IQR_MULTIPLIER * iqr;
    let outliers: Vec<f64> =
        values.iter().copied().filter(|v| *v < lower || *v > upper).collect();
    if outliers.is_empty() {
        return Vec::new();
    }

    let fraction = outliers.len() as f64 / values.len() as f64;
    let severity = if fraction > 0.1 {
        AnomalySeverity::Warning
    } else {
        AnomalySeverity::Info
    };

    let mut examples = outliers.clone();
    examples.sort_by(f64::total_cmp);
    examples.truncate(5);

    vec![Anomaly {
        anomaly_type: AnomalyType::Outlier,
        severity,
        column: column.to_string(),
        description: format!(
            "{} outlier(s) ({:.0}%) outside IQR bounds [{lower:.2}, {upper:.2}]",
            outliers.len(),
            fraction * 100.0
        ),
        examples,
    }]
}

fn check_high_variance(column: &str, stats: &ColumnStats) -> Option<Anomaly> {
    if stats.mean == 0.0 || stats.stdev == 0.0 {
        return None;
    }
    let cv = (stats.stdev / stats.mean).abs();
    if cv <= HIGH_VARIANCE_CV {
        return None;
    }

    Some(Anomaly {
        anomaly_type: AnomalyType::Variance,
        severity: AnomalySeverity::Info,
        column: column.to_string(),
        description: format!("High variance (coefficient of variation {cv:.2})"),
        examples: Vec::new(),
    })
}

fn check_semantic_bounds(column: &str, numeric: &[f64]) -> Vec<Anomaly> {
    if numeric.is_empty() {
        return Vec::new();
    }
    let lower_name = column.to_lowercase();
    let mut anomalies = Vec::new();

    if NON_NEGATIVE_KEYWORDS.iter().any(|kw| lower_name.contains(kw)) {
        let mut negatives: Vec<f64> = numeric.iter().copied().filter(|v| *v < 0.0).collect();
        if !negatives.is_empty() {
            negatives.sort_by(f64::total_cmp);
            let count = negatives.len();
            negatives.truncate(5);
            anomalies.push(Anomaly {
                anomaly_type: AnomalyType::UnexpectedValue,
                severity: AnomalySeverity::Warning,
                column: column.to_string(),
                description: format!("{count} negative value(s) in {column}"),
                examples: negatives,
            });
        }
    }

    if PERCENTAGE_KEYWORDS.iter().any(|kw| lower_name.contains(kw)) {
        let extreme: Vec<f64> = numeric
            .iter()
            .copied()
            .filter(|v| *v < PERCENTAGE_LOWER_BOUND || *v > PERCENTAGE_UPPER_BOUND)
            .collect();
        if !extreme.is_empty() {
            let mut examples = extreme.clone();
            examples.sort_by(f64::total_cmp);
            examples.truncate(5);
            anomalies.push(Anomaly {
                anomaly_type: AnomalyType::ExtremePercentage,
                severity: AnomalySeverity::Warning,
                column: column.to_string(),
                description: format!(
                    "{} percentage value(s) outside [{PERCENTAGE_LOWER_BOUND}, \
                     {PERCENTAGE_UPPER_BOUND}]",
                    extreme.len()
                ),
                examples,
            });
        }
    }

    anomalies
}

fn compute_stats(values: &[f64]) -> ColumnStats {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();

    let mean = sorted.iter().sum::<f64>() / n as f64;
    let stdev = if n > 1 {
        (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    } else {
        0.0
    };

    ColumnStats {
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        median: sorted[n / 2],
        stdev,
        q1: sorted[n / 4],
        q3: sorted[(3 * n) / 4],
        count: n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(column: &str, values: &[Value]) -> Vec<Row> {
        values
            .iter()
            .map(|v| {
                let mut row = Row::new();
                row.insert(column.to_string(), v.clone());
                row
            })
            .collect()
    }

    #[test]
    fn test_empty_result_flagged() {
        let report = AnomalyDetector::new().analyze(&[]);
        assert_eq!(report.count, 1);
        assert_eq!(report.items[0].anomaly_type, AnomalyType::EmptyResult);
        assert!(report.has_issues());
    }

    #[test]
    fn test_all_null_is_critical() {
        let report = AnomalyDetector::new()
            .analyze(&rows("Value", &[json!(null), json!(null), json!(null)]));
        let a = report
            .items
            .iter()
            .find(|a| a.anomaly_type == AnomalyType::NullConcentration)
            .unwrap();
        assert_eq!(a.severity, AnomalySeverity::Critical);
        assert_eq!(report.critical, 1);
    }

    #[test]
    fn test_partial_null_severities() {
        // 2/3 null -> warning
        let report = AnomalyDetector::new()
            .analyze(&rows("Value", &[json!(null), json!(null), json!(1)]));
        assert_eq!(report.items[0].severity, AnomalySeverity::Warning);

        // 2/10 null -> info
        let mut values = vec![json!(null), json!(null)];
        values.extend((0..8).map(|i| json!(i)));
        let report = AnomalyDetector::new().analyze(&rows("Value", &values));
        let null_item = report
            .items
            .iter()
            .find(|a| a.anomaly_type == AnomalyType::NullPresence)
            .unwrap();
        assert_eq!(null_item.severity, AnomalySeverity::Info);
    }

    #[test]
    fn test_iqr_outlier_detection() {
        let values: Vec<Value> =
            [10.0, 11.0, 12.0, 11.5, 10.5, 11.2, 500.0].iter().map(|v| json!(v)).collect();
        let report = AnomalyDetector::new().analyze(&rows("Metric", &values));
        let outlier = report
            .items
            .iter()
            .find(|a| a.anomaly_type == AnomalyType::Outlier)
            .unwrap();
        assert!(outlier.examples.contains(&500.0));
        assert_eq!(outlier.severity, AnomalySeverity::Warning); // 1/7 > 10%
    }

    #[test]
    fn test_negative_revenue_flagged() {
        let values: Vec<Value> =
            [100.0, 200.0, -50.0, 300.0].iter().map(|v| json!(v)).collect();
        let report = AnomalyDetector::new().analyze(&rows("Total Revenue", &values));
        let unexpected = report
            .items
            .iter()
            .find(|a| a.anomaly_type == AnomalyType::UnexpectedValue)
            .unwrap();
        assert_eq!(unexpected.severity, AnomalySeverity::Warning);
        assert_eq!(unexpected.examples, vec![-50.0]);
    }

    #[test]
    fn test_extreme_percentage_flagged() {
        let values: Vec<Value> = [0.05, 0.12, 9.5, -3.0].iter().map(|v| json!(v)).collect();
        let report = AnomalyDetector::new().analyze(&rows("TWR Return", &values));
        let extreme = report
            .items
            .iter()
            .find(|a| a.anomaly_type == AnomalyType::ExtremePercentage)
            .unwrap();
        assert_eq!(extreme.examples, vec![-3.0, 9.5]);
    }

    #[test]
    fn test_clean_data_empty_report() {
        let values: Vec<Value> = [10.0, 11.0, 12.0, 11.5, 10.5].iter().map(|v| json!(v)).collect();
        let report = AnomalyDetector::new().analyze(&rows("Score", &values));
        assert!(report.is_empty());
        assert!(!report.has_issues());
    }

    #[test]
    fn test_stats_computed() {
        let values: Vec<Value> = (1..=10).map(|i| json!(i)).collect();
        let report = AnomalyDetector::new().analyze(&rows("N", &values));
        let stats = report.stats.get("N").unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 10.0);
        assert_eq!(stats.count, 10);
        assert!((stats.mean - 5.5).abs() < 1e-9);
    }
}
