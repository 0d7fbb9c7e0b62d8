//! Best-practices aggregation and scoring
//!
//! Runs the maintainability/correctness check battery on the raw expression,
//! folds in the anti-pattern registry matches and the context/VertiPaq
//! analyses, and produces a single scored issue report. Scoring starts at
//! 100 and deducts 20/10/5/2/1 per critical/high/medium/low/info issue.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dax::context::ContextFlowExplanation;
use crate::dax::patterns::{ArticleReference, PatternCategory, PatternReport, PatternSeverity};
use crate::dax::vertipaq::{ColumnImpact, VertiPaqAnalysis};

/// A single issue or recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaxIssue {
    pub title: String,
    pub description: String,
    pub severity: PatternSeverity,
    pub category: PatternCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_example_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_example_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_improvement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_reference: Option<ArticleReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Expression complexity banding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

/// Consolidated best-practices report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestPracticesReport {
    pub total_issues: usize,
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub issues: Vec<DaxIssue>,
    pub summary: String,
    /// 0-100, higher is better
    pub overall_score: u32,
    pub complexity_level: ComplexityLevel,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub articles_referenced: Vec<ArticleReference>,
}

static NON_DESCRIPTIVE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bVAR\s+([A-Z]|V\d+)\s*=").unwrap());

static ZERO_COMPARISON: Lazy<Regex> = Lazy::new(|| Regex::new(r"=\s*0\b").unwrap());

/// Best-practices analyzer
#[derive(Default)]
pub struct BestPracticesAnalyzer;

impl BestPracticesAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Run the full battery; `patterns` is the registry report for the same
    /// expression, `context`/`vertipaq` the optional upstream analyses.
    pub fn analyze(
        &self,
        dax: &str,
        patterns: &PatternReport,
        context: Option<&ContextFlowExplanation>,
        vertipaq: Option<&VertiPaqAnalysis>,
    ) -> BestPracticesReport {
        let mut issues: Vec<DaxIssue> = Vec::new();
        let mut articles: Vec<ArticleReference> = Vec::new();

        // registry matches become issues verbatim
        for m in &patterns.matches {
            issues.push(DaxIssue {
                title: m.title.clone(),
                description: m.description.clone(),
                severity: m.severity,
                category: m.category,
                code_example_before: Some(m.before.clone()),
                code_example_after: Some(m.after.clone()),
                estimated_improvement: Some(m.estimated_improvement.clone()),
                article_reference: Some(m.article.clone()),
                location: Some(format!("line {}, column {}", m.line, m.column)),
            });
        }
        articles.extend(patterns.articles.iter().cloned());

        issues.extend(check_repeated_measures_without_vars(dax));
        issues.extend(check_variable_usage(dax));
        issues.extend(check_error_handling(dax));
        issues.extend(check_naming_conventions(dax));
        issues.extend(check_blank_vs_zero(dax));

        if let Some(flow) = context {
            issues.extend(context_issues(flow));
        }
        if let Some(vp) = vertipaq {
            issues.extend(vertipaq_issues(vp));
        }

        issues.sort_by(|a, b| b.severity.cmp(&a.severity));

        for issue in &issues {
            if let Some(article) = &issue.article_reference {
                if !articles.iter().any(|a| a.url == article.url) {
                    articles.push(article.clone());
                }
            }
        }

        let critical_count =
            issues.iter().filter(|i| i.severity == PatternSeverity::Critical).count();
        let high_count = issues.iter().filter(|i| i.severity == PatternSeverity::High).count();
        let medium_count = issues.iter().filter(|i| i.severity == PatternSeverity::Medium).count();

        let overall_score = overall_score(&issues);
        let complexity_level = complexity_level(context);
        let summary = summarize(&issues, overall_score);

        BestPracticesReport {
            total_issues: issues.len(),
            critical_count,
            high_count,
            medium_count,
            issues,
            summary,
            overall_score,
            complexity_level,
            articles_referenced: articles,
        }
    }
}

/// Score deductions: 20 critical, 10 high, 5 medium, 2 low, 1 info
fn overall_score(issues: &[DaxIssue]) -> u32 {
    let mut score: i64 = 100;
    for issue in issues {
        score -= match issue.severity {
            PatternSeverity::Critical => 20,
            PatternSeverity::High => 10,
            PatternSeverity::Medium => 5,
            PatternSeverity::Low => 2,
            PatternSeverity::Info => 1,
        };
    }
    score.max(0) as u32
}

fn complexity_level(context: Option<&ContextFlowExplanation>) -> ComplexityLevel {
    let score = context.map(|c| c.complexity_score).unwrap_or(0);
    match score {
        0..=20 => ComplexityLevel::Simple,
        21..=50 => ComplexityLevel::Moderate,
        51..=75 => ComplexityLevel::Complex,
        _ => ComplexityLevel::VeryComplex,
    }
}

fn summarize(issues: &[DaxIssue], score: u32) -> String {
    if issues.is_empty() {
        return "No issues found. The expression follows current DAX best practices.".to_string();
    }

    let critical = issues.iter().filter(|i| i.severity == PatternSeverity::Critical).count();
    let high = issues.iter().filter(|i| i.severity == PatternSeverity::High).count();

    if critical > 0 {
        format!(
            "{critical} critical issue(s) found; fixing them first yields the largest gains. \
             Quality score: {score}/100."
        )
    } else if high > 0 {
        format!("{high} high-impact issue(s) found. Quality score: {score}/100.")
    } else {
        format!("{} minor issue(s) found. Quality score: {score}/100.", issues.len())
    }
}

/// A measure referenced more than twice without any VAR caching
fn check_repeated_measures_without_vars(dax: &str) -> Vec<DaxIssue> {
    if dax.to_ascii_uppercase().contains("VAR") {
        return Vec::new();
    }

    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for m in crate::dax::scanner::find_measure_references(dax) {
        *counts.entry(m.name).or_insert(0) += 1;
    }
    let mut repeated: Vec<String> = counts
        .into_iter()
        .filter_map(|(name, count)| (count > 2).then_some(name))
        .collect();
    repeated.sort();

    if repeated.is_empty() {
        return Vec::new();
    }

    vec![DaxIssue {
        title: "Repeated measure references without variables".to_string(),
        description: format!(
            "Measures referenced repeatedly without caching: {}. Use variables to avoid \
             recomputing them.",
            repeated.join(", ")
        ),
        severity: PatternSeverity::Medium,
        category: PatternCategory::Maintainability,
        code_example_before: Some(format!(
            "[{m}] + [{m}] + [{m}]",
            m = repeated.first().unwrap()
        )),
        code_example_after: Some(format!(
            "VAR Result = [{}]\nRETURN Result + Result + Result",
            repeated.first().unwrap()
        )),
        estimated_improvement: Some("Reduces calculation overhead".to_string()),
        article_reference: Some(ArticleReference {
            title: "Variables in DAX".to_string(),
            url: "https://www.sqlbi.com/articles/variables-in-dax/".to_string(),
            source: "SQLBI".to_string(),
        }),
        location: None,
    }]
}

fn check_variable_usage(dax: &str) -> Vec<DaxIssue> {
    let upper = dax.to_ascii_uppercase();
    let has_vars = upper.contains("VAR");
    let has_return = upper.contains("RETURN");
    let mut issues = Vec::new();

    if dax.len() > 200 && !has_vars {
        let operations =
            dax.matches('+').count() + dax.matches('-').count() + dax.matches('*').count()
                + dax.matches('/').count();
        if operations > 3 {
            issues.push(DaxIssue {
                title: "Complex expression without variables".to_string(),
                description: "Long multi-operation expression without VAR. Variables improve \
                              readability and can remove repeated work."
                    .to_string(),
                severity: PatternSeverity::Info,
                category: PatternCategory::Maintainability,
                code_example_before: None,
                code_example_after: Some(
                    "VAR Step1 = ...\nVAR Step2 = ...\nRETURN Step1 + Step2".to_string(),
                ),
                estimated_improvement: Some("Better maintainability".to_string()),
                article_reference: None,
                location: None,
            });
        }
    }

    if has_vars && !has_return {
        issues.push(DaxIssue {
            title: "VAR without RETURN".to_string(),
            description: "Variables are declared but RETURN is missing; the expression will not \
                          parse."
                .to_string(),
            severity: PatternSeverity::Critical,
            category: PatternCategory::Correctness,
            code_example_before: None,
            code_example_after: None,
            estimated_improvement: None,
            article_reference: None,
            location: None,
        });
    }

    issues
}

fn check_error_handling(dax: &str) -> Vec<DaxIssue> {
    let upper = dax.to_ascii_uppercase();
    let has_division = dax.contains('/') && !dax.contains("//");
    if !has_division || upper.contains("DIVIDE") || upper.contains("IFERROR") {
        return Vec::new();
    }

    vec![DaxIssue {
        title: "Division without error handling".to_string(),
        description: "The division operator without a guard errors on zero denominators; \
                      DIVIDE handles the case natively."
            .to_string(),
        severity: PatternSeverity::Medium,
        category: PatternCategory::BestPractice,
        code_example_before: Some("[Numerator] / [Denominator]".to_string()),
        code_example_after: Some("DIVIDE([Numerator], [Denominator], 0)".to_string()),
        estimated_improvement: None,
        article_reference: None,
        location: None,
    }]
}

fn check_naming_conventions(dax: &str) -> Vec<DaxIssue> {
    let matches: Vec<_> = NON_DESCRIPTIVE_VAR.find_iter(dax).collect();
    if matches.is_empty() {
        return Vec::new();
    }

    vec![DaxIssue {
        title: "Non-descriptive variable names".to_string(),
        description: format!(
            "{} variable(s) with single-letter or numbered names; descriptive names keep \
             measures readable.",
            matches.len()
        ),
        severity: PatternSeverity::Info,
        category: PatternCategory::Maintainability,
        code_example_before: Some("VAR V1 = SUM(Sales[Amount])".to_string()),
        code_example_after: Some("VAR TotalAmount = SUM(Sales[Amount])".to_string()),
        estimated_improvement: None,
        article_reference: None,
        location: None,
    }]
}

fn check_blank_vs_zero(dax: &str) -> Vec<DaxIssue> {
    if !ZERO_COMPARISON.is_match(dax) {
        return Vec::new();
    }

    vec![DaxIssue {
        title: "Zero comparison without blank check".to_string(),
        description: "BLANK and 0 compare equal under `= 0`; when the distinction matters use \
                      ISBLANK first."
            .to_string(),
        severity: PatternSeverity::Info,
        category: PatternCategory::BestPractice,
        code_example_before: None,
        code_example_after: Some(
            "IF(ISBLANK([Value]), ..., IF([Value] = 0, ..., ...))".to_string(),
        ),
        estimated_improvement: None,
        article_reference: None,
        location: None,
    }]
}

fn context_issues(flow: &ContextFlowExplanation) -> Vec<DaxIssue> {
    let mut issues = Vec::new();

    if flow.max_nesting_level > 3 {
        issues.push(DaxIssue {
            title: "Deep CALCULATE nesting".to_string(),
            description: format!(
                "Context transitions nest {} levels deep; each level adds evaluation overhead.",
                flow.max_nesting_level
            ),
            severity: PatternSeverity::High,
            category: PatternCategory::Performance,
            code_example_before: None,
            code_example_after: None,
            estimated_improvement: None,
            article_reference: None,
            location: None,
        });
    }

    if flow.complexity_score > 70 {
        issues.push(DaxIssue {
            title: "High context complexity".to_string(),
            description: format!(
                "Context complexity score is {}/100; consider splitting the measure.",
                flow.complexity_score
            ),
            severity: PatternSeverity::Medium,
            category: PatternCategory::Maintainability,
            code_example_before: None,
            code_example_after: None,
            estimated_improvement: None,
            article_reference: None,
            location: None,
        });
    }

    issues
}

fn vertipaq_issues(vp: &VertiPaqAnalysis) -> Vec<DaxIssue> {
    vp.columns
        .iter()
        .filter(|c| c.performance_impact >= ColumnImpact::High)
        .map(|c| DaxIssue {
            title: format!("High-cardinality column in {:?} context", c.usage_context),
            description: format!(
                "{} has {} distinct values. {}",
                c.column, c.cardinality, c.recommendation
            ),
            severity: if c.performance_impact == ColumnImpact::Critical {
                PatternSeverity::Critical
            } else {
                PatternSeverity::High
            },
            category: PatternCategory::Performance,
            code_example_before: None,
            code_example_after: None,
            estimated_improvement: None,
            article_reference: None,
            location: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;
    use crate::dax::context::ContextAnalyzer;
    use crate::dax::patterns;

    fn analyze(dax: &str) -> BestPracticesReport {
        let pattern_report = patterns::detect(dax);
        let flow = ContextAnalyzer::new(AnalyzerConfig::default()).analyze(dax);
        BestPracticesAnalyzer::new().analyze(dax, &pattern_report, Some(&flow), None)
    }

    #[test]
    fn test_clean_expression_scores_high() {
        let report = analyze("CALCULATE(SUM(Sales[Amount]), Sales[Year] = 2024)");
        assert!(report.overall_score >= 95);
        assert_eq!(report.critical_count, 0);
    }

    #[test]
    fn test_critical_pattern_deducts_twenty() {
        let clean = analyze("SUM(Sales[Amount])");
        let dirty = analyze("SUMX(FILTER(Sales, Sales[Qty] > 1), Sales[Amount])");
        assert!(dirty.overall_score <= clean.overall_score.saturating_sub(20));
        assert!(dirty.critical_count >= 1);
    }

    #[test]
    fn test_var_without_return_is_critical() {
        let report = analyze("VAR X = SUM(Sales[Amount])");
        assert!(
            report
                .issues
                .iter()
                .any(|i| i.title == "VAR without RETURN"
                    && i.severity == PatternSeverity::Critical)
        );
    }

    #[test]
    fn test_issues_sorted_by_severity() {
        let report =
            analyze("SUMX(FILTER(Sales, Sales[Qty] > 1), Sales[Amount]) + [M] / [N] = 0");
        for pair in report.issues.windows(2) {
            assert!(pair[0].severity >= pair[1].severity);
        }
    }

    #[test]
    fn test_score_floor_is_zero() {
        // six criticals would go negative without the floor
        let dax = (0..6)
            .map(|i| format!("SUMX(FILTER(T{i}, T{i}[a] > 1), T{i}[b])"))
            .collect::<Vec<_>>()
            .join(" + ");
        let report = analyze(&dax);
        assert_eq!(report.overall_score, 0);
    }

    #[test]
    fn test_score_monotone_in_issues() {
        let a = analyze("SUM(Sales[Amount])");
        let b = analyze("COUNTROWS(FILTER(Sales, Sales[Qty] > 1))");
        assert!(a.overall_score >= b.overall_score);
    }

    #[test]
    fn test_articles_carried_from_patterns() {
        let report = analyze("COUNTROWS(FILTER(Sales, Sales[Qty] > 1))");
        assert!(
            report
                .articles_referenced
                .iter()
                .any(|a| a.url.contains("optimizing-countrows-filter"))
        );
    }
}
