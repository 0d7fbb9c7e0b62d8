//! DAX Analysis & Rewrite Engine
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       DaxAnalyzer                         │
//! │  ┌────────────────────────────────────────────────────┐   │
//! │  │                     analyze()                      │   │
//! │  └────────────────────────────────────────────────────┘   │
//! │        │              │               │                   │
//! │        ▼              ▼               ▼                   │
//! │  ┌───────────┐  ┌───────────┐  ┌──────────────┐           │
//! │  │  Scanner  │  │  Context  │  │  Call Tree   │           │
//! │  │ (C1/C2)   │  │  (C4)     │  │  (C5)        │           │
//! │  └───────────┘  └───────────┘  └──────────────┘           │
//! │  ┌───────────┐  ┌───────────┐  ┌──────────────┐           │
//! │  │ Patterns  │  │ Rewriter  │  │  VertiPaq    │           │
//! │  │ (C6)      │  │ (C7)      │  │  (C8)        │           │
//! │  └───────────┘  └───────────┘  └──────────────┘           │
//! │        └──────────────┴───────────────┘                   │
//! │                       ▼                                   │
//! │             Best Practices (C9) → report                  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The pipeline is pure except for VertiPaq lookups, which consult the
//! consumer-provided Query Executor lazily and cache per analyzer instance.

pub mod best_practices;
pub mod call_tree;
pub mod context;
pub mod models;
pub mod patterns;
pub mod profiler;
pub mod rewriter;
pub mod scanner;
pub mod vertipaq;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use chrono::Utc;

use crate::config::AnalyzerConfig;
use crate::executor::QueryExecutor;
use best_practices::BestPracticesAnalyzer;
use call_tree::CallTreeBuilder;
use context::ContextAnalyzer;
use models::{CallTreeReport, DaxIntelligenceReport, ImprovementSet, ValidationSummary};
use rewriter::CodeRewriter;
use vertipaq::VertiPaqProvider;

/// DAX intelligence analyzer
///
/// One instance owns the VertiPaq cache; share it behind `Arc` to reuse
/// loaded column statistics across expressions.
pub struct DaxAnalyzer {
    config: AnalyzerConfig,
    vertipaq: VertiPaqProvider,
}

impl DaxAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config, vertipaq: VertiPaqProvider::new(None) }
    }

    /// Attach a Query Executor for cardinality lookups and fallbacks
    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.vertipaq = VertiPaqProvider::new(Some(executor));
        self
    }

    /// Access the cardinality provider directly
    pub fn vertipaq(&self) -> &VertiPaqProvider {
        &self.vertipaq
    }

    /// Clear instance caches
    pub fn reset(&self) {
        self.vertipaq.reset();
    }

    /// Run the full analysis pipeline over one expression.
    ///
    /// Parse problems never abort the run: the report carries an invalid
    /// `validation` section and whatever structural information survived.
    pub async fn analyze(
        &self,
        dax: &str,
        measure_name: Option<&str>,
    ) -> DaxIntelligenceReport {
        let (normalized, validation) = match scanner::strip_comments(dax) {
            Ok(text) => {
                let validation = validate_structure(&text);
                (text, validation)
            }
            Err(err) => {
                tracing::warn!(error = %err, "comment stripping failed; analyzing raw source");
                (dax.to_string(), ValidationSummary::invalid("invalid_dax", err.to_string()))
            }
        };

        let context_analyzer = ContextAnalyzer::new(self.config.clone());
        let context_analysis = context_analyzer.analyze(&normalized);

        let mut tree_builder = CallTreeBuilder::new().with_vertipaq(&self.vertipaq);
        let tree_root = tree_builder.build(&normalized).await;
        let call_tree = CallTreeReport {
            rendered: call_tree::render_tree(&tree_root),
            node_count: tree_root.node_count(),
            root: tree_root,
        };

        let anti_patterns = patterns::detect(&normalized);
        let vertipaq_analysis = self.vertipaq.analyze_dax_columns(&normalized).await;

        let best_practices_analysis = BestPracticesAnalyzer::new().analyze(
            &normalized,
            &anti_patterns,
            Some(&context_analysis),
            Some(&vertipaq_analysis),
        );

        let rewrite = CodeRewriter::new().rewrite(dax);

        let annotated_dax_code = format!(
            "{}\n{}",
            context::ANNOTATION_LEGEND,
            context::annotate_source(dax, &context_analysis.transitions)
        );

        let debug_steps = build_debug_steps(&context_analysis);
        let analysis_summary = format!(
            "{}\n\n{}",
            context_analysis.summary, best_practices_analysis.summary
        );
        let articles_referenced = best_practices_analysis.articles_referenced.clone();

        DaxIntelligenceReport {
            success: true,
            measure_name: measure_name.map(str::to_string),
            validation,
            annotated_dax_code,
            analysis_summary,
            context_analysis,
            best_practices_analysis,
            anti_patterns,
            optimized_measure: rewrite.rewritten_code.clone(),
            improvements: ImprovementSet {
                details: rewrite.transformations,
                original_code: rewrite.original_code,
                suggested_code: rewrite.rewritten_code,
            },
            vertipaq_analysis,
            call_tree,
            debug_steps: (!debug_steps.is_empty()).then_some(debug_steps),
            articles_referenced,
            generated_at: Utc::now(),
        }
    }
}

/// Cheap structural validation: balanced parentheses and a RETURN for VARs
fn validate_structure(normalized: &str) -> ValidationSummary {
    let masked = scanner::mask_opaque(normalized);
    let mut depth: i64 = 0;
    for (i, b) in masked.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return ValidationSummary::invalid(
                        "invalid_dax",
                        format!("unmatched closing parenthesis at offset {i}"),
                    );
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return ValidationSummary::invalid("invalid_dax", "unbalanced parentheses");
    }

    let upper = normalized.to_ascii_uppercase();
    if upper.contains("VAR ") && !upper.contains("RETURN") {
        return ValidationSummary::invalid("invalid_dax", "VAR declared without RETURN");
    }

    ValidationSummary::valid()
}

/// Step-by-step narration of the context flow
fn build_debug_steps(flow: &context::ContextFlowExplanation) -> Vec<String> {
    let mut steps = Vec::new();
    for (i, t) in flow.transitions.iter().enumerate() {
        steps.push(format!(
            "{}. Line {}, col {}: {} ({:?}): {}",
            i + 1,
            t.line,
            t.column,
            t.function,
            t.transition_type,
            t.explanation
        ));
    }
    for w in &flow.warnings {
        steps.push(format!("Warning: {} Suggestion: {}", w.message, w.suggestion));
    }
    steps
}
