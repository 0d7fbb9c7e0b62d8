//! Anti-pattern registry
//!
//! A fixed table of pattern rules, each tied to a published optimization
//! article. Rules run against the comment-stripped expression with string
//! literals masked so quoted values cannot produce false positives. Every
//! match carries its location, the matched text, before/after templates, and
//! the article reference.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dax::scanner;

/// Severity of an anti-pattern rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// Category of an anti-pattern rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Performance,
    AntiPattern,
    Maintainability,
    BestPractice,
    Security,
    Correctness,
}

/// A published article backing a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleReference {
    pub title: String,
    pub url: String,
    pub source: String,
}

/// One registry rule
pub struct AntiPatternRule {
    pub id: &'static str,
    pub title: &'static str,
    pub severity: PatternSeverity,
    pub category: PatternCategory,
    pub patterns: Vec<Regex>,
    /// Extra structural check on the captures (the regex crate has no
    /// backreferences, so same-table constraints are verified here)
    pub verify: Option<fn(&regex::Captures) -> bool>,
    pub article_title: &'static str,
    pub article_url: &'static str,
    pub before: &'static str,
    pub after: &'static str,
    pub improvement: &'static str,
    pub description: &'static str,
}

/// A single rule match in an expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    pub rule_id: String,
    pub title: String,
    pub severity: PatternSeverity,
    pub category: PatternCategory,
    pub location: usize,
    pub line: usize,
    pub column: usize,
    pub matched_text: String,
    pub description: String,
    pub before: String,
    pub after: String,
    pub estimated_improvement: String,
    pub article: ArticleReference,
}

/// Result of running the registry against one expression
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternReport {
    pub patterns_detected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub matches: Vec<PatternMatch>,
    /// Referenced articles, deduplicated by URL
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub articles: Vec<ArticleReference>,
}

fn rx(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).unwrap()
}

/// The canonical rule registry
pub static RULES: Lazy<Vec<AntiPatternRule>> = Lazy::new(|| {
    vec![
        AntiPatternRule {
            id: "sumx_filter",
            title: "Iterator over FILTER",
            severity: PatternSeverity::Critical,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"(SUMX|AVERAGEX|MINX|MAXX)\s*\(\s*FILTER\s*\(")],
            verify: None,
            article_title: "Optimizing SUMX and Iterator Functions",
            article_url: "https://www.sqlbi.com/articles/optimizing-sumx/",
            before: "SUMX(FILTER(Table, condition), Table[Column])",
            after: "CALCULATE(SUM(Table[Column]), condition)",
            improvement: "5-10x faster",
            description: "An iterator over FILTER forces row-by-row evaluation in the Formula \
                          Engine and blocks query fusion; CALCULATE pushes the filter to the \
                          Storage Engine.",
        },
        AntiPatternRule {
            id: "countrows_filter",
            title: "COUNTROWS over FILTER",
            severity: PatternSeverity::Critical,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"COUNTROWS\s*\(\s*FILTER\s*\(")],
            verify: None,
            article_title: "Optimizing COUNTROWS and FILTER",
            article_url: "https://www.sqlbi.com/articles/optimizing-countrows-filter/",
            before: "COUNTROWS(FILTER(Table, Table[Column] > 100))",
            after: "CALCULATE(COUNTROWS(Table), Table[Column] > 100)",
            improvement: "5-10x faster",
            description: "COUNTROWS(FILTER(...)) materializes the filtered table; CALCULATE \
                          counts without materialization.",
        },
        AntiPatternRule {
            id: "filter_all",
            title: "FILTER over ALL",
            severity: PatternSeverity::High,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"FILTER\s*\(\s*(ALL|ALLSELECTED)\s*\(")],
            verify: None,
            article_title: "Avoiding FILTER in Nested Iterators",
            article_url: "https://www.sqlbi.com/articles/avoiding-filter-in-nested-iterators/",
            before: "FILTER(ALL(Table), condition)",
            after: "CALCULATE(VALUES(Table), condition)",
            improvement: "3-5x faster",
            description: "FILTER(ALL(...)) cannot be pushed to the Storage Engine and \
                          materializes the entire table in memory.",
        },
        AntiPatternRule {
            id: "nested_calculate",
            title: "Nested CALCULATE",
            severity: PatternSeverity::Medium,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"CALCULATE\s*\([^)]*CALCULATE\s*\(")],
            verify: None,
            article_title: "Understanding Context Transition",
            article_url: "https://www.sqlbi.com/articles/understanding-context-transition/",
            before: "CALCULATE(CALCULATE([Measure], Filter1), Filter2)",
            after: "CALCULATE([Measure], Filter1, Filter2)",
            improvement: "2-3x faster",
            description: "Each CALCULATE adds a context transition; consolidate filters into a \
                          single CALCULATE.",
        },
        AntiPatternRule {
            id: "related_in_iterator",
            title: "RELATED inside iterator",
            severity: PatternSeverity::Medium,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"(SUMX|AVERAGEX|COUNTX|FILTER)\s*\([^)]*RELATED\s*\(")],
            verify: None,
            article_title: "Avoiding RELATED in Iterators",
            article_url: "https://www.sqlbi.com/articles/avoiding-related-in-iterators/",
            before: "SUMX(Sales, Sales[Qty] * RELATED(Product[Price]))",
            after: "SUMX(Sales, Sales[Qty] * Sales[UnitPrice])  -- denormalized column",
            improvement: "2-4x faster for large tables",
            description: "RELATED inside an iterator performs a relationship traversal per row; \
                          denormalize or expand the table before iterating.",
        },
        AntiPatternRule {
            id: "divide_zero_check",
            title: "Manual zero-check division",
            severity: PatternSeverity::Medium,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"IF\s*\([^=]+\s*=\s*0\s*,\s*[^,]+\s*,\s*[^/]+\s*/\s*[^)]+\)")],
            verify: None,
            article_title: "Understanding DIVIDE Performance",
            article_url: "https://www.sqlbi.com/articles/understanding-divide-performance/",
            before: "IF([Denominator] = 0, 0, [Numerator] / [Denominator])",
            after: "DIVIDE([Numerator], [Denominator], 0)",
            improvement: "2-3x faster",
            description: "Manual IF checks for division by zero run in the Formula Engine; \
                          DIVIDE is optimized by the Storage Engine.",
        },
        AntiPatternRule {
            id: "measure_in_filter",
            title: "Measure in FILTER predicate",
            severity: PatternSeverity::Medium,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"FILTER\s*\([^)]*,\s*\[[^\]]+\]\s*[><!=]")],
            verify: None,
            article_title: "Avoiding Measures in FILTER",
            article_url: "https://www.sqlbi.com/articles/avoiding-measures-in-filter/",
            before: "FILTER(Products, [Total Sales] > 1000)",
            after: "VAR Threshold = 1000\nRETURN FILTER(Products, Products[Sales] > Threshold)",
            improvement: "3-5x faster",
            description: "A measure in a FILTER predicate causes a context transition per row; \
                          pre-calculate the measure or compare columns.",
        },
        AntiPatternRule {
            id: "iferror_iserror",
            title: "IFERROR / ISERROR usage",
            severity: PatternSeverity::High,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"\b(IFERROR|ISERROR)\s*\(")],
            verify: None,
            article_title: "Error Handling Cost in DAX",
            article_url: "https://www.sqlbi.com/articles/handling-errors-in-dax/",
            before: "IFERROR([Numerator] / [Denominator], 0)",
            after: "DIVIDE([Numerator], [Denominator], 0)",
            improvement: "Avoids per-row error handling overhead",
            description: "IFERROR/ISERROR force the engine into a slow error-tolerant evaluation \
                          mode; prefer DIVIDE and explicit blank checks.",
        },
        AntiPatternRule {
            id: "addcolumns_in_measure",
            title: "ADDCOLUMNS in a measure",
            severity: PatternSeverity::High,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"\bADDCOLUMNS\s*\(")],
            verify: None,
            article_title: "Best Practices Using SUMMARIZE and ADDCOLUMNS",
            article_url: "https://www.sqlbi.com/articles/best-practices-using-summarize-and-addcolumns/",
            before: "SUMX(ADDCOLUMNS(Table, \"x\", [M]), [x])",
            after: "SUMX(Table, [M])",
            improvement: "Avoids an intermediate materialization",
            description: "ADDCOLUMNS inside a measure materializes an extended table per \
                          evaluation; usually the computation can run directly in the iterator.",
        },
        AntiPatternRule {
            id: "if_in_iterator",
            title: "IF at iterator body head",
            severity: PatternSeverity::Medium,
            category: PatternCategory::Performance,
            patterns: vec![rx(
                r"(SUMX|AVERAGEX|MINX|MAXX|COUNTX)\s*\(\s*[^,]+,\s*IF\s*\(",
            )],
            verify: None,
            article_title: "Conditional Logic in Iterators",
            article_url: "https://www.sqlbi.com/articles/optimizing-if-conditions-in-dax/",
            before: "SUMX(Sales, IF(Sales[Qty] > 0, Sales[Amount], 0))",
            after: "CALCULATE(SUM(Sales[Amount]), Sales[Qty] > 0)",
            improvement: "2-5x faster",
            description: "A conditional evaluated per row frequently restates a filter; move the \
                          condition into CALCULATE.",
        },
        AntiPatternRule {
            id: "calculate_filter_boolean",
            title: "FILTER as a simple boolean filter argument",
            severity: PatternSeverity::Low,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"CALCULATE\s*\([^)]*,\s*FILTER\s*\([^,]+,\s*[^,()]+\s*[<>=!]+\s*[^)]+\)")],
            verify: None,
            article_title: "Avoid FILTER as a filter argument",
            article_url: "https://learn.microsoft.com/en-us/power-bi/guidance/dax-avoid-avoid-filter-as-filter-argument",
            before: "CALCULATE([Sales], FILTER(Product, Product[Category] = \"Bikes\"))",
            after: "CALCULATE([Sales], Product[Category] = \"Bikes\")",
            improvement: "Minor performance gain",
            description: "A FILTER carrying a simple column comparison can be a plain boolean \
                          filter argument.",
        },
        AntiPatternRule {
            id: "values_in_calculate",
            title: "VALUES as a filter argument",
            severity: PatternSeverity::Low,
            category: PatternCategory::Performance,
            patterns: vec![rx(r"CALCULATE\s*\([^)]*,\s*VALUES\s*\(")],
            verify: None,
            article_title: "Optimizing VALUES Performance",
            article_url: "https://www.sqlbi.com/articles/optimizing-values-performance/",
            before: "CALCULATE([Sales], VALUES(Product[Category]))",
            after: "CALCULATE([Sales], Product[Category])",
            improvement: "Minor performance gain",
            description: "VALUES in a CALCULATE filter argument can usually be a direct column \
                          reference.",
        },
        AntiPatternRule {
            id: "unnecessary_iterator",
            title: "Iterator over a plain column",
            severity: PatternSeverity::Low,
            category: PatternCategory::Performance,
            patterns: vec![rx(
                r"(SUMX|AVERAGEX)\s*\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*,\s*([A-Za-z_][A-Za-z0-9_]*)\[[^\]]+\]\s*\)",
            )],
            verify: Some(|caps| {
                caps.get(2)
                    .zip(caps.get(3))
                    .map(|(t, b)| t.as_str().eq_ignore_ascii_case(b.as_str()))
                    .unwrap_or(false)
            }),
            article_title: "When to Use Iterators",
            article_url: "https://www.sqlbi.com/articles/when-to-use-iterators/",
            before: "SUMX(Table, Table[Amount])",
            after: "SUM(Table[Amount])",
            improvement: "Minor performance gain",
            description: "An iterator whose body is a bare column of the iterated table is a \
                          plain aggregation.",
        },
    ]
});

/// Run the registry against a comment-stripped expression
pub fn detect(dax: &str) -> PatternReport {
    let masked = mask_strings_only(dax);
    let mut matches = Vec::new();
    let mut articles: Vec<ArticleReference> = Vec::new();

    for rule in RULES.iter() {
        for pattern in &rule.patterns {
            for caps in pattern.captures_iter(&masked) {
                if let Some(verify) = rule.verify {
                    if !verify(&caps) {
                        continue;
                    }
                }
                let m = caps.get(0).unwrap();
                let (line, column) = scanner::line_column(dax, m.start());
                matches.push(PatternMatch {
                    rule_id: rule.id.to_string(),
                    title: rule.title.to_string(),
                    severity: rule.severity,
                    category: rule.category,
                    location: m.start(),
                    line,
                    column,
                    matched_text: scanner::ellipsize(&dax[m.start()..m.end()], 80),
                    description: rule.description.to_string(),
                    before: rule.before.to_string(),
                    after: rule.after.to_string(),
                    estimated_improvement: rule.improvement.to_string(),
                    article: ArticleReference {
                        title: rule.article_title.to_string(),
                        url: rule.article_url.to_string(),
                        source: article_source(rule.article_url),
                    },
                });
            }
        }
    }

    matches.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.location.cmp(&b.location)));

    for m in &matches {
        if !articles.iter().any(|a| a.url == m.article.url) {
            articles.push(m.article.clone());
        }
    }

    PatternReport { patterns_detected: matches.len(), matches, articles }
}

fn article_source(url: &str) -> String {
    if url.contains("sqlbi.com") {
        "SQLBI".to_string()
    } else if url.contains("microsoft.com") {
        "Microsoft Learn".to_string()
    } else {
        "Community".to_string()
    }
}

/// Mask only string literals (not brackets): rule patterns need measure names
fn mask_strings_only(dax: &str) -> String {
    let bytes = dax.as_bytes();
    let mut out: Vec<u8> = bytes.to_vec();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            let mut j = i + 1;
            while j < bytes.len() {
                if bytes[j] == b'"' {
                    if j + 1 < bytes.len() && bytes[j + 1] == b'"' {
                        j += 2;
                        continue;
                    }
                    break;
                }
                j += 1;
            }
            for b in out.iter_mut().take(j.min(bytes.len())).skip(i + 1) {
                if *b != b'\n' {
                    *b = b' ';
                }
            }
            i = (j + 1).min(bytes.len());
        } else {
            i += 1;
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| dax.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sumx_filter_detected_as_critical() {
        let report = detect("SUMX(FILTER(Sales, Sales[Region] = \"EU\"), Sales[Amount])");
        let m = report.matches.iter().find(|m| m.rule_id == "sumx_filter").unwrap();
        assert_eq!(m.severity, PatternSeverity::Critical);
        assert_eq!(m.location, 0);
        assert_eq!(m.line, 1);
    }

    #[test]
    fn test_articles_deduped_by_url() {
        let report =
            detect("SUMX(FILTER(A, A[x] > 1), A[y]) + AVERAGEX(FILTER(B, B[x] > 1), B[y])");
        let sumx_articles: Vec<_> = report
            .articles
            .iter()
            .filter(|a| a.url.contains("optimizing-sumx"))
            .collect();
        assert_eq!(sumx_articles.len(), 1);
        assert!(report.patterns_detected >= 2);
    }

    #[test]
    fn test_pattern_inside_string_ignored() {
        let report = detect("IF([Label] = \"SUMX(FILTER(\", 1, 2)");
        assert!(report.matches.iter().all(|m| m.rule_id != "sumx_filter"));
    }

    #[test]
    fn test_unnecessary_iterator_requires_same_table() {
        let report = detect("SUMX(Sales, Sales[Amount])");
        assert!(report.matches.iter().any(|m| m.rule_id == "unnecessary_iterator"));

        // body over a different table is a real iteration
        let report = detect("SUMX(Sales, Other[Amount])");
        assert!(report.matches.iter().all(|m| m.rule_id != "unnecessary_iterator"));
    }

    #[test]
    fn test_matches_sorted_by_severity() {
        let report = detect(
            "CALCULATE([S], VALUES(P[C])) + COUNTROWS(FILTER(Sales, Sales[Qty] > 1))",
        );
        assert!(report.patterns_detected >= 2);
        for pair in report.matches.windows(2) {
            assert!(pair[0].severity >= pair[1].severity);
        }
    }

    #[test]
    fn test_clean_expression_empty_report() {
        let report = detect("CALCULATE(SUM(Sales[Amount]), Sales[Year] = 2024)");
        assert_eq!(report.patterns_detected, 0);
        assert!(report.articles.is_empty());
    }
}
