//! Context-transition analysis
//!
//! Detects the three ways a DAX expression converts row context into filter
//! context: explicit CALCULATE/CALCULATETABLE, implicit measure references,
//! and iterators whose body evaluates a measure per row. Produces an ordered
//! transition list, nesting levels, performance warnings, a complexity score,
//! and an annotated rendering of the source.

use serde::{Deserialize, Serialize};

use crate::config::AnalyzerConfig;
use crate::dax::scanner::{self, FunctionCall};

/// Kind of context transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    ExplicitCalculate,
    Calculatetable,
    ImplicitMeasure,
    Iterator,
}

/// Performance impact level of a single transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionImpact {
    Low,
    Medium,
    High,
}

/// A detected context transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextTransition {
    /// Byte offset in the original source
    pub location: usize,
    pub line: usize,
    pub column: usize,
    #[serde(rename = "type")]
    pub transition_type: TransitionType,
    /// Function causing the transition (CALCULATE, SUMX, MEASURE_REFERENCE)
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measure_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub column_names: Vec<String>,
    /// Filter-argument slices for CALCULATE transitions, truncated for display
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub filter_arguments: Vec<String>,
    pub nested_level: usize,
    pub performance_impact: TransitionImpact,
    pub explanation: String,
    /// VAR names in scope at analysis time
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub variables_in_scope: Vec<String>,
}

/// Severity of a context-flow warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Info,
    Warning,
    Error,
}

/// A performance warning derived from the transition set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWarning {
    pub location: usize,
    pub severity: WarningSeverity,
    pub message: String,
    pub suggestion: String,
}

/// Complete explanation of context flow in one expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFlowExplanation {
    pub transitions: Vec<ContextTransition>,
    pub warnings: Vec<ContextWarning>,
    pub summary: String,
    /// 0-100
    pub complexity_score: u32,
    pub max_nesting_level: usize,
}

/// Context-transition analyzer
pub struct ContextAnalyzer {
    config: AnalyzerConfig,
}

impl ContextAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyze a comment-stripped DAX expression for context transitions.
    ///
    /// The input must already be normalized by [`scanner::strip_comments`] so
    /// reported offsets map back to the original source.
    pub fn analyze(&self, dax: &str) -> ContextFlowExplanation {
        if dax.len() > self.config.max_expression_length {
            tracing::warn!(
                length = dax.len(),
                limit = self.config.max_expression_length,
                "DAX expression exceeds configured maximum length"
            );
        }

        let variables: Vec<String> =
            scanner::extract_variables(dax).into_iter().map(|v| v.name).collect();

        let calls = scanner::find_function_calls(dax);
        let masked = scanner::mask_opaque(dax);

        let mut transitions = Vec::new();
        transitions.extend(self.detect_calculate_transitions(dax, &masked, &calls, &variables));
        transitions.extend(self.detect_implicit_measure_transitions(dax, &variables));
        transitions.extend(self.detect_iterator_transitions(dax, &calls, &variables));

        transitions.sort_by_key(|t| t.location);
        Self::assign_nesting_levels(&mut transitions);

        let warnings = self.detect_performance_issues(&transitions);
        let complexity_score = complexity_score(&transitions);
        let max_nesting_level =
            transitions.iter().map(|t| t.nested_level).max().unwrap_or(0);
        let summary = Self::summarize(&transitions, &warnings);

        tracing::debug!(
            transitions = transitions.len(),
            warnings = warnings.len(),
            complexity = complexity_score,
            "context analysis complete"
        );

        ContextFlowExplanation {
            transitions,
            warnings,
            summary,
            complexity_score,
            max_nesting_level,
        }
    }

    fn detect_calculate_transitions(
        &self,
        dax: &str,
        masked: &str,
        calls: &[FunctionCall],
        variables: &[String],
    ) -> Vec<ContextTransition> {
        let mut out = Vec::new();

        for call in calls.iter().filter(|c| scanner::is_calculate(&c.name)) {
            let (line, column) = scanner::line_column(dax, call.name_start);
            let args =
                scanner::split_top_level_commas(masked, call.open_paren + 1, call.close_paren);

            // everything after the first argument is a filter argument
            let filter_arguments: Vec<String> = args
                .iter()
                .skip(1)
                .map(|&(s, e)| scanner::ellipsize(&dax[s..e], 50))
                .collect();

            let transition_type = if call.name == "CALCULATE" {
                TransitionType::ExplicitCalculate
            } else {
                TransitionType::Calculatetable
            };

            out.push(ContextTransition {
                location: call.name_start,
                line,
                column,
                transition_type,
                function: call.name.clone(),
                measure_name: None,
                table_name: None,
                column_names: Vec::new(),
                filter_arguments,
                nested_level: 0,
                performance_impact: TransitionImpact::Low,
                explanation: format!(
                    "{} creates a new filter context by transitioning from row context (if any) \
                     to filter context. Any existing filter context is modified by the filter \
                     arguments.",
                    call.name
                ),
                variables_in_scope: variables.to_vec(),
            });
        }

        out
    }

    fn detect_implicit_measure_transitions(
        &self,
        dax: &str,
        variables: &[String],
    ) -> Vec<ContextTransition> {
        scanner::find_measure_references(dax)
            .into_iter()
            .map(|m| {
                let (line, column) = scanner::line_column(dax, m.start);
                ContextTransition {
                    location: m.start,
                    line,
                    column,
                    transition_type: TransitionType::ImplicitMeasure,
                    function: "MEASURE_REFERENCE".to_string(),
                    explanation: format!(
                        "Implicit CALCULATE wrapper around measure [{}]. If evaluated in row \
                         context, this causes a context transition to filter context.",
                        m.name
                    ),
                    measure_name: Some(m.name),
                    table_name: None,
                    column_names: Vec::new(),
                    filter_arguments: Vec::new(),
                    nested_level: 0,
                    performance_impact: TransitionImpact::Low,
                    variables_in_scope: variables.to_vec(),
                }
            })
            .collect()
    }

    fn detect_iterator_transitions(
        &self,
        dax: &str,
        calls: &[FunctionCall],
        variables: &[String],
    ) -> Vec<ContextTransition> {
        let mut out = Vec::new();

        for call in calls.iter().filter(|c| scanner::is_iterator(&c.name)) {
            let body = &dax[call.open_paren + 1..call.close_paren];
            let has_measure_refs = !scanner::find_measure_references(body).is_empty();
            if !has_measure_refs {
                continue;
            }

            let (line, column) = scanner::line_column(dax, call.name_start);
            let (table_name, column_names) = table_and_columns(body);

            let over = table_name
                .as_deref()
                .map(|t| format!(" over {t}"))
                .unwrap_or_default();

            out.push(ContextTransition {
                location: call.name_start,
                line,
                column,
                transition_type: TransitionType::Iterator,
                function: call.name.clone(),
                measure_name: None,
                table_name,
                column_names,
                filter_arguments: Vec::new(),
                nested_level: 0,
                performance_impact: TransitionImpact::Medium,
                explanation: format!(
                    "{} creates row context{}. Measure references inside the iterator cause a \
                     context transition in EACH iteration, which can be expensive on large \
                     tables.",
                    call.name, over
                ),
                variables_in_scope: variables.to_vec(),
            });
        }

        out
    }

    /// Approximate nesting: a transition's level is the number of earlier
    /// explicit CALCULATE/CALCULATETABLE transitions in source order.
    fn assign_nesting_levels(transitions: &mut [ContextTransition]) {
        let mut open_calculates = 0;
        for t in transitions.iter_mut() {
            t.nested_level = open_calculates;
            if matches!(
                t.transition_type,
                TransitionType::ExplicitCalculate | TransitionType::Calculatetable
            ) {
                open_calculates += 1;
            }
        }
    }

    fn detect_performance_issues(
        &self,
        transitions: &[ContextTransition],
    ) -> Vec<ContextWarning> {
        let mut warnings = Vec::new();

        let max_nesting = transitions.iter().map(|t| t.nested_level).max().unwrap_or(0);
        if max_nesting > self.config.nested_calculate_limit {
            warnings.push(ContextWarning {
                location: 0,
                severity: WarningSeverity::Warning,
                message: format!("Excessive CALCULATE nesting detected (depth: {max_nesting})"),
                suggestion: "Consider refactoring into intermediate variables or measures"
                    .to_string(),
            });
        }

        let iterator_with_measures = transitions
            .iter()
            .filter(|t| {
                t.transition_type == TransitionType::Iterator
                    && t.performance_impact == TransitionImpact::Medium
            })
            .count();
        if iterator_with_measures > self.config.iterator_warning_limit {
            warnings.push(ContextWarning {
                location: 0,
                severity: WarningSeverity::Warning,
                message: format!(
                    "Multiple iterators with measure references ({iterator_with_measures} detected)"
                ),
                suggestion: "Each measure reference in an iterator causes a context transition \
                             per row. Consider pre-calculating values into variables."
                    .to_string(),
            });
        }

        warnings
    }

    fn summarize(transitions: &[ContextTransition], warnings: &[ContextWarning]) -> String {
        if transitions.is_empty() {
            return "No context transitions detected. This measure uses simple aggregations \
                    without context modifications."
                .to_string();
        }

        let explicit = transitions
            .iter()
            .filter(|t| {
                matches!(
                    t.transition_type,
                    TransitionType::ExplicitCalculate | TransitionType::Calculatetable
                )
            })
            .count();
        let implicit = transitions
            .iter()
            .filter(|t| t.transition_type == TransitionType::ImplicitMeasure)
            .count();
        let iterators = transitions
            .iter()
            .filter(|t| t.transition_type == TransitionType::Iterator)
            .count();

        let mut parts = vec![format!("Detected {} context transition(s):", transitions.len())];
        if explicit > 0 {
            parts.push(format!("  - {explicit} explicit CALCULATE/CALCULATETABLE"));
        }
        if implicit > 0 {
            parts.push(format!("  - {implicit} implicit measure references"));
        }
        if iterators > 0 {
            parts.push(format!("  - {iterators} iterator functions with measure calls"));
        }
        if !warnings.is_empty() {
            parts.push(format!("\n{} performance warning(s) detected", warnings.len()));
        }
        parts.join("\n")
    }
}

/// Derive the iterated table and the involved columns from an iterator body.
///
/// The first `Table[Column]` reference names the table; a bare leading
/// identifier (not an upper-case function name) is accepted as a fallback.
fn table_and_columns(body: &str) -> (Option<String>, Vec<String>) {
    let mut table_name: Option<String> = None;
    let mut columns: Vec<String> = Vec::new();

    for col_ref in scanner::find_column_references(body) {
        if table_name.is_none() && col_ref.table != col_ref.table.to_ascii_uppercase() {
            table_name = Some(col_ref.table.clone());
        }
        if !columns.contains(&col_ref.column) {
            columns.push(col_ref.column);
        }
    }

    if table_name.is_none() {
        // first argument may be a bare table name: SUMX(Sales, ...)
        let head = body.trim_start();
        let ident: String = head
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        let rest = head[ident.len()..].trim_start();
        if !ident.is_empty()
            && ident != ident.to_ascii_uppercase()
            && (rest.starts_with(',') || rest.starts_with(')') || rest.is_empty())
        {
            table_name = Some(ident);
        }
    }

    (table_name, columns)
}

/// Complexity score: `min(100, 5·transitions + 10·max_nesting + 5·iterators)`
pub fn complexity_score(transitions: &[ContextTransition]) -> u32 {
    if transitions.is_empty() {
        return 0;
    }
    let max_nesting = transitions.iter().map(|t| t.nested_level).max().unwrap_or(0);
    let iterators = transitions
        .iter()
        .filter(|t| t.transition_type == TransitionType::Iterator)
        .count();
    let score = transitions.len() * 5 + max_nesting * 10 + iterators * 5;
    score.min(100) as u32
}

/// Render DAX with per-line transition annotations.
///
/// Every line carrying a transition is followed by indented annotation lines
/// with a type glyph, an impact marker, and the causing function.
pub fn annotate_source(dax: &str, transitions: &[ContextTransition]) -> String {
    if transitions.is_empty() {
        return dax.to_string();
    }

    let mut annotated = Vec::new();
    for (line_no, line_text) in dax.lines().enumerate() {
        annotated.push(line_text.to_string());
        for (idx, t) in transitions.iter().enumerate() {
            if t.line != line_no + 1 {
                continue;
            }
            let (glyph, label) = match t.transition_type {
                TransitionType::Iterator => ("~", "Iterator"),
                TransitionType::ImplicitMeasure => ("#", "Measure Ref"),
                _ => ("!", "CALCULATE"),
            };
            let impact = match t.performance_impact {
                TransitionImpact::High => "[HIGH]",
                TransitionImpact::Medium => "[MED]",
                TransitionImpact::Low => "[LOW]",
            };
            annotated.push(format!(
                "    {glyph} {impact} Transition #{} ({label}): {}",
                idx + 1,
                t.function
            ));
        }
    }
    annotated.join("\n")
}

/// Legend printed ahead of annotated source in reports
pub const ANNOTATION_LEGEND: &str = "Legend: ! CALCULATE transition  # implicit measure  ~ iterator  [LOW|MED|HIGH] impact";

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> ContextAnalyzer {
        ContextAnalyzer::new(AnalyzerConfig::default())
    }

    #[test]
    fn test_iterator_with_measure_scores_fifteen() {
        let dax = "SUMX(Sales, [Unit Price] * Sales[Quantity])";
        let flow = analyzer().analyze(dax);

        let iterators: Vec<_> = flow
            .transitions
            .iter()
            .filter(|t| t.transition_type == TransitionType::Iterator)
            .collect();
        assert_eq!(iterators.len(), 1);
        assert_eq!(iterators[0].function, "SUMX");
        assert_eq!(iterators[0].performance_impact, TransitionImpact::Medium);

        let implicit: Vec<_> = flow
            .transitions
            .iter()
            .filter(|t| t.transition_type == TransitionType::ImplicitMeasure)
            .collect();
        assert_eq!(implicit.len(), 1);
        assert_eq!(implicit[0].measure_name.as_deref(), Some("Unit Price"));

        // 2 transitions * 5 + 0 nesting + 1 iterator * 5
        assert_eq!(flow.complexity_score, 15);
    }

    #[test]
    fn test_calculate_filter_arguments_extracted() {
        let dax = "CALCULATE([Total Sales], Sales[Region] = \"EU\", Sales[Year] = 2024)";
        let flow = analyzer().analyze(dax);

        let calc = flow
            .transitions
            .iter()
            .find(|t| t.transition_type == TransitionType::ExplicitCalculate)
            .unwrap();
        assert_eq!(calc.filter_arguments.len(), 2);
        assert_eq!(calc.filter_arguments[0], "Sales[Region] = \"EU\"");
    }

    #[test]
    fn test_nesting_levels_count_open_calculates() {
        let dax = "CALCULATE(CALCULATE([M], Sales[A] = 1), Sales[B] = 2)";
        let flow = analyzer().analyze(dax);

        let levels: Vec<usize> = flow
            .transitions
            .iter()
            .filter(|t| t.transition_type == TransitionType::ExplicitCalculate)
            .map(|t| t.nested_level)
            .collect();
        assert_eq!(levels, vec![0, 1]);
        assert_eq!(flow.max_nesting_level, 2); // the [M] measure ref sits under both
    }

    #[test]
    fn test_iterator_without_measure_is_silent() {
        let dax = "SUMX(Sales, Sales[Qty] * Sales[Price])";
        let flow = analyzer().analyze(dax);
        assert!(
            flow.transitions
                .iter()
                .all(|t| t.transition_type != TransitionType::Iterator)
        );
    }

    #[test]
    fn test_empty_expression_scores_zero() {
        let flow = analyzer().analyze("SUM(Sales[Amount])");
        assert_eq!(flow.complexity_score, 0);
        assert!(flow.summary.contains("No context transitions"));
    }

    #[test]
    fn test_complexity_monotone_under_subsequence() {
        let small = analyzer().analyze("CALCULATE([M], Sales[A] = 1)");
        let large = analyzer().analyze("CALCULATE([M], Sales[A] = 1) + SUMX(T, [M2])");
        assert!(small.complexity_score <= large.complexity_score);
    }

    #[test]
    fn test_annotate_source_marks_lines() {
        let dax = "CALCULATE(\n    [Total Sales],\n    Sales[Year] = 2024\n)";
        let flow = analyzer().analyze(dax);
        let annotated = annotate_source(dax, &flow.transitions);
        assert!(annotated.contains("Transition #1"));
        assert!(annotated.lines().count() > dax.lines().count());
    }

    #[test]
    fn test_variables_in_scope() {
        let dax = "VAR Base = [Sales]\nRETURN CALCULATE(Base, Sales[Year] = 2024)";
        let flow = analyzer().analyze(dax);
        let calc = flow
            .transitions
            .iter()
            .find(|t| t.transition_type == TransitionType::ExplicitCalculate)
            .unwrap();
        assert_eq!(calc.variables_in_scope, vec!["Base".to_string()]);
    }
}
