//! Rule-based DAX rewriter
//!
//! Applies an ordered list of transformation rules to a working copy of the
//! expression. Rules that can be rewritten safely are rewritten structurally
//! (scanner-based, not regex substitution); the rest record template-level
//! recommendations. Re-running the rewriter on its own output produces no
//! further changes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dax::scanner;

/// Transformation rule identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationType {
    ExtractRepeatedMeasures,
    FlattenNestedCalculate,
    SumxFilterToCalculate,
    CountrowsFilterToCalculate,
    FilterMeasureWarning,
    SummarizeToSummarizecolumns,
    DistinctToValues,
}

/// Confidence that the transformation preserves semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// A recorded transformation (applied or recommended)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformation {
    #[serde(rename = "type")]
    pub transformation_type: TransformationType,
    pub original_code: String,
    pub transformed_code: String,
    pub explanation: String,
    pub estimated_improvement: String,
    pub confidence: Confidence,
}

/// Result of one rewriter pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteOutcome {
    pub has_changes: bool,
    pub original_code: String,
    /// Present only when at least one rule changed the code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_code: Option<String>,
    pub transformations: Vec<Transformation>,
    pub transformation_count: usize,
}

static NESTED_CALCULATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)CALCULATE\s*\(\s*CALCULATE\s*\(").unwrap());

static FILTER_ALL_MEASURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)FILTER\s*\(\s*ALL\s*\([^)]*\)\s*,\s*\[[^\]]+\]\s*[><=]").unwrap()
});

static SUMMARIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSUMMARIZE\s*\(").unwrap());

static DISTINCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bDISTINCT\s*\(").unwrap());

/// DAX code rewriter
#[derive(Default)]
pub struct CodeRewriter;

impl CodeRewriter {
    pub fn new() -> Self {
        Self
    }

    /// Apply every rule in order, recording a transformation per rule that
    /// fired. The rule order is part of the contract.
    pub fn rewrite(&self, dax: &str) -> RewriteOutcome {
        let mut transformations = Vec::new();
        let mut code = dax.to_string();

        code = extract_repeated_measures(&code, &mut transformations);
        flatten_nested_calculate(&code, &mut transformations);
        code = rewrite_iterator_filter(&code, &mut transformations);
        code = rewrite_countrows_filter(&code, &mut transformations);
        warn_filter_all_measure(&code, &mut transformations);
        recommend_summarizecolumns(&code, &mut transformations);
        recommend_values_over_distinct(&code, &mut transformations);

        let has_changes = code.trim() != dax.trim();
        RewriteOutcome {
            has_changes,
            original_code: dax.to_string(),
            rewritten_code: has_changes.then_some(code),
            transformation_count: transformations.len(),
            transformations,
        }
    }
}

/// Rule 1: cache measures referenced twice or more in variables.
///
/// When the expression already carries a VAR/RETURN frame, only the RETURN
/// tail is counted and substituted and the new VAR lines are inserted
/// between the last existing VAR and the RETURN keyword; substituting inside
/// earlier VAR definitions would create forward references.
fn extract_repeated_measures(dax: &str, transformations: &mut Vec<Transformation>) -> String {
    let frame_return = scanner::find_top_level_return(dax);

    let (scope_start, scope_end) = match frame_return {
        Some(ret) => (ret + "RETURN".len(), dax.len()),
        None => (0, dax.len()),
    };
    let scope = &dax[scope_start..scope_end];

    // count bare measure references in first-seen order
    let refs = scanner::find_measure_references(scope);
    let mut order: Vec<String> = Vec::new();
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for r in &refs {
        if !counts.contains_key(&r.name) {
            order.push(r.name.clone());
        }
        *counts.entry(r.name.clone()).or_insert(0) += 1;
    }

    let mut repeated: Vec<(String, usize)> = order
        .into_iter()
        .filter_map(|name| {
            let count = counts[&name];
            (count >= 2).then_some((name, count))
        })
        .collect();
    if repeated.is_empty() {
        return dax.to_string();
    }
    // most-referenced first; first occurrence breaks ties
    repeated.sort_by(|a, b| b.1.cmp(&a.1));

    let mut var_names: std::collections::HashMap<String, String> =
        std::collections::HashMap::new();
    let mut var_lines = Vec::new();
    for (i, (name, _)) in repeated.iter().enumerate() {
        let var = format!("_M{}", i + 1);
        var_lines.push(format!("VAR {var} = [{name}]"));
        var_names.insert(name.clone(), var);
    }

    // substitute the counted references back-to-front so offsets stay valid
    let mut new_scope = scope.to_string();
    for r in refs.iter().rev() {
        if let Some(var) = var_names.get(&r.name) {
            new_scope.replace_range(r.start..r.end, var);
        }
    }

    let rewritten = match frame_return {
        Some(ret) => {
            let head = dax[..ret].trim_end();
            let tail = new_scope.trim_start();
            format!("{head}\n{}\nRETURN\n{tail}", var_lines.join("\n"))
        }
        None => format!("{}\nRETURN\n{}", var_lines.join("\n"), new_scope.trim()),
    };

    transformations.push(Transformation {
        transformation_type: TransformationType::ExtractRepeatedMeasures,
        original_code: scanner::ellipsize(dax, 100),
        transformed_code: scanner::ellipsize(&rewritten, 100),
        explanation: format!(
            "Extracted {} repeated measure(s) into variables. This caches measure results and \
             avoids redundant calculations.",
            repeated.len()
        ),
        estimated_improvement: "10-50% faster depending on measure complexity".to_string(),
        confidence: Confidence::High,
    });

    rewritten
}

/// Rule 2: directly nested CALCULATE is flagged for manual flattening
fn flatten_nested_calculate(dax: &str, transformations: &mut Vec<Transformation>) {
    if !NESTED_CALCULATE.is_match(dax) {
        return;
    }
    transformations.push(Transformation {
        transformation_type: TransformationType::FlattenNestedCalculate,
        original_code: "CALCULATE(CALCULATE(...), ...)".to_string(),
        transformed_code: "VAR Step1 = CALCULATE(..., Filter1)\nVAR Step2 = CALCULATE(Step1, Filter2)\nRETURN Step2"
            .to_string(),
        explanation: "Nested CALCULATE statements detected. Flatten them with variables for \
                      fewer context transitions and better readability."
            .to_string(),
        estimated_improvement: "5-15% plus readability".to_string(),
        confidence: Confidence::Medium,
    });
}

/// Rule 3a: `SUMX(FILTER(T, cond), expr)` becomes `CALCULATE(SUM(expr), cond)`
/// (and AVERAGEX analogously). Applied structurally, repeatedly, innermost
/// matches first by virtue of rescanning after each replacement.
fn rewrite_iterator_filter(dax: &str, transformations: &mut Vec<Transformation>) -> String {
    let mut code = dax.to_string();

    for _ in 0..16 {
        let Some((span, original, replacement, iterator, aggregate)) =
            find_iterator_filter(&code)
        else {
            break;
        };

        code.replace_range(span.0..span.1, &replacement);
        transformations.push(Transformation {
            transformation_type: TransformationType::SumxFilterToCalculate,
            original_code: original,
            transformed_code: replacement,
            explanation: format!(
                "Replaced {iterator}(FILTER(...)) with CALCULATE({aggregate}(...)). This \
                 eliminates row-by-row iteration and lets the Storage Engine apply the filter."
            ),
            estimated_improvement: "5-10x faster".to_string(),
            confidence: Confidence::High,
        });
    }

    code
}

fn find_iterator_filter(code: &str) -> Option<((usize, usize), String, String, String, String)> {
    let masked = scanner::mask_opaque(code);
    let calls = scanner::find_function_calls(code);

    for call in &calls {
        let aggregate = match call.name.as_str() {
            "SUMX" => "SUM",
            "AVERAGEX" => "AVERAGE",
            _ => continue,
        };

        let args = scanner::split_top_level_commas(&masked, call.open_paren + 1, call.close_paren);
        if args.len() != 2 {
            continue;
        }

        let (first_start, first_end) = args[0];
        let Some(inner) = calls.iter().find(|c| {
            c.name == "FILTER" && c.name_start == first_start && c.close_paren + 1 == first_end
        }) else {
            continue;
        };

        let filter_args =
            scanner::split_top_level_commas(&masked, inner.open_paren + 1, inner.close_paren);
        if filter_args.len() != 2 {
            continue;
        }

        let condition = code[filter_args[1].0..filter_args[1].1].trim();
        let expr = code[args[1].0..args[1].1].trim();

        let span = (call.name_start, call.close_paren + 1);
        let original = code[span.0..span.1].to_string();
        let replacement = format!("CALCULATE({aggregate}({expr}), {condition})");
        return Some((span, original, replacement, call.name.clone(), aggregate.to_string()));
    }

    None
}

/// Rule 3b: `COUNTROWS(FILTER(T, cond))` becomes `CALCULATE(COUNTROWS(T), cond)`
fn rewrite_countrows_filter(dax: &str, transformations: &mut Vec<Transformation>) -> String {
    let mut code = dax.to_string();

    for _ in 0..16 {
        let masked = scanner::mask_opaque(&code);
        let calls = scanner::find_function_calls(&code);

        let Some((span, original, replacement)) = calls.iter().find_map(|call| {
            if call.name != "COUNTROWS" {
                return None;
            }
            let args =
                scanner::split_top_level_commas(&masked, call.open_paren + 1, call.close_paren);
            if args.len() != 1 {
                return None;
            }
            let (first_start, first_end) = args[0];
            let inner = calls.iter().find(|c| {
                c.name == "FILTER" && c.name_start == first_start && c.close_paren + 1 == first_end
            })?;
            let filter_args =
                scanner::split_top_level_commas(&masked, inner.open_paren + 1, inner.close_paren);
            if filter_args.len() != 2 {
                return None;
            }

            let table = code[filter_args[0].0..filter_args[0].1].trim();
            let condition = code[filter_args[1].0..filter_args[1].1].trim();
            let span = (call.name_start, call.close_paren + 1);
            Some((
                span,
                code[span.0..span.1].to_string(),
                format!("CALCULATE(COUNTROWS({table}), {condition})"),
            ))
        }) else {
            break;
        };

        code.replace_range(span.0..span.1, &replacement);
        transformations.push(Transformation {
            transformation_type: TransformationType::CountrowsFilterToCalculate,
            original_code: original,
            transformed_code: replacement,
            explanation: "Replaced COUNTROWS(FILTER(...)) with CALCULATE(COUNTROWS(...)), \
                          avoiding materialization of the filtered table."
                .to_string(),
            estimated_improvement: "5-10x faster".to_string(),
            confidence: Confidence::High,
        });
    }

    code
}

/// Rule 3c: a measure comparison inside FILTER(ALL(...)) is flagged
fn warn_filter_all_measure(dax: &str, transformations: &mut Vec<Transformation>) {
    if !FILTER_ALL_MEASURE.is_match(dax) {
        return;
    }
    transformations.push(Transformation {
        transformation_type: TransformationType::FilterMeasureWarning,
        original_code: "FILTER(ALL(Table), [Measure] > value)".to_string(),
        transformed_code: "VAR Threshold = [Measure]\nRETURN CALCULATE(..., FILTER(Table, Table[Column] > Threshold))"
            .to_string(),
        explanation: "FILTER with a measure predicate causes a context transition per row. \
                      Pre-compute the measure into a variable outside the FILTER."
            .to_string(),
        estimated_improvement: "10-100x faster for large tables".to_string(),
        confidence: Confidence::Medium,
    });
}

/// Rule 4: SUMMARIZE usage is flagged for conversion to SUMMARIZECOLUMNS
fn recommend_summarizecolumns(dax: &str, transformations: &mut Vec<Transformation>) {
    if !SUMMARIZE.is_match(dax) {
        return;
    }
    transformations.push(Transformation {
        transformation_type: TransformationType::SummarizeToSummarizecolumns,
        original_code: "SUMMARIZE(Table, Table[Col1], \"Value\", [Measure])".to_string(),
        transformed_code: "SUMMARIZECOLUMNS(Table[Col1], \"Value\", [Measure])".to_string(),
        explanation: "SUMMARIZECOLUMNS generates better query plans than SUMMARIZE with \
                      extension columns."
            .to_string(),
        estimated_improvement: "2-10x faster query execution".to_string(),
        confidence: Confidence::High,
    });
}

/// Rule 5: DISTINCT usage is flagged in favor of VALUES
fn recommend_values_over_distinct(dax: &str, transformations: &mut Vec<Transformation>) {
    if !DISTINCT.is_match(dax) {
        return;
    }
    transformations.push(Transformation {
        transformation_type: TransformationType::DistinctToValues,
        original_code: "DISTINCT(Table[Column])".to_string(),
        transformed_code: "VALUES(Table[Column])".to_string(),
        explanation: "VALUES respects the current filter context and includes the blank row \
                      when appropriate; DISTINCT removes it and can be slower."
            .to_string(),
        estimated_improvement: "5-20% faster, better semantic correctness".to_string(),
        confidence: Confidence::Medium,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(dax: &str) -> RewriteOutcome {
        CodeRewriter::new().rewrite(dax)
    }

    #[test]
    fn test_sumx_filter_rewrite() {
        let outcome = rewrite("SUMX(FILTER(Sales, Sales[Region] = \"EU\"), Sales[Amount])");
        assert!(outcome.has_changes);
        assert_eq!(
            outcome.rewritten_code.as_deref(),
            Some("CALCULATE(SUM(Sales[Amount]), Sales[Region] = \"EU\")")
        );

        let kinds: Vec<_> = outcome
            .transformations
            .iter()
            .filter(|t| t.transformation_type == TransformationType::SumxFilterToCalculate)
            .collect();
        assert_eq!(kinds.len(), 1);
        assert_eq!(kinds[0].confidence, Confidence::High);
    }

    #[test]
    fn test_rewriter_idempotent() {
        let first = rewrite("SUMX(FILTER(Sales, Sales[Region] = \"EU\"), Sales[Amount])");
        let second = rewrite(first.rewritten_code.as_deref().unwrap());
        assert!(!second.has_changes);
        assert!(
            second
                .transformations
                .iter()
                .all(|t| t.transformation_type != TransformationType::SumxFilterToCalculate)
        );
    }

    #[test]
    fn test_repeated_measure_extraction() {
        let outcome = rewrite("[Sales] + [Sales] * 0.1");
        let code = outcome.rewritten_code.unwrap();
        assert!(code.starts_with("VAR _M1 = [Sales]"));
        assert!(code.contains("RETURN"));
        assert!(code.contains("_M1 + _M1 * 0.1"));

        let extracts: Vec<_> = outcome
            .transformations
            .iter()
            .filter(|t| t.transformation_type == TransformationType::ExtractRepeatedMeasures)
            .collect();
        assert_eq!(extracts.len(), 1);
    }

    #[test]
    fn test_repeated_measure_extraction_idempotent() {
        let first = rewrite("[Sales] + [Sales] * 0.1");
        let second = rewrite(first.rewritten_code.as_deref().unwrap());
        assert!(!second.has_changes);
    }

    #[test]
    fn test_existing_var_frame_keeps_definitions_intact() {
        let dax = "VAR Base = SUM(Sales[Amount])\nRETURN [Tax] + [Tax]";
        let outcome = rewrite(dax);
        let code = outcome.rewritten_code.unwrap();
        // original VAR stays first, new VAR lands before RETURN
        assert!(code.starts_with("VAR Base = SUM(Sales[Amount])"));
        assert!(code.contains("VAR _M1 = [Tax]"));
        assert!(code.contains("_M1 + _M1"));
        let var_pos = code.find("VAR _M1").unwrap();
        let return_pos = code.rfind("RETURN").unwrap();
        assert!(var_pos < return_pos);
    }

    #[test]
    fn test_column_references_not_extracted() {
        let outcome = rewrite("Sales[Amount] + Sales[Amount]");
        assert!(!outcome.has_changes);
    }

    #[test]
    fn test_countrows_filter_rewrite() {
        let outcome = rewrite("COUNTROWS(FILTER(Orders, Orders[Qty] > 5))");
        assert_eq!(
            outcome.rewritten_code.as_deref(),
            Some("CALCULATE(COUNTROWS(Orders), Orders[Qty] > 5)")
        );
    }

    #[test]
    fn test_nested_condition_parens_survive() {
        let outcome =
            rewrite("SUMX(FILTER(Sales, AND(Sales[Qty] > 1, Sales[Qty] < 9)), Sales[Amount])");
        assert_eq!(
            outcome.rewritten_code.as_deref(),
            Some("CALCULATE(SUM(Sales[Amount]), AND(Sales[Qty] > 1, Sales[Qty] < 9))")
        );
    }

    #[test]
    fn test_advisory_rules_do_not_change_code() {
        let outcome = rewrite("CALCULATE(CALCULATE([M], A[x] = 1), B[y] = 2)");
        assert!(!outcome.has_changes);
        assert!(outcome.rewritten_code.is_none());
        assert!(
            outcome
                .transformations
                .iter()
                .any(|t| t.transformation_type == TransformationType::FlattenNestedCalculate)
        );
    }

    #[test]
    fn test_summarize_and_distinct_advisories() {
        let outcome = rewrite("SUMMARIZE(Sales, Sales[Year]) ");
        assert!(
            outcome
                .transformations
                .iter()
                .any(|t| t.transformation_type == TransformationType::SummarizeToSummarizecolumns)
        );

        let outcome = rewrite("COUNTROWS(DISTINCT(Sales[Id]))");
        assert!(
            outcome
                .transformations
                .iter()
                .any(|t| t.transformation_type == TransformationType::DistinctToValues)
        );
    }
}
