//! DAX intelligence report models
//!
//! The single structured response assembled by the analysis pipeline. All
//! records serialize for API consumers; optional sections are omitted when
//! empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dax::best_practices::BestPracticesReport;
use crate::dax::call_tree::CallTreeNode;
use crate::dax::context::ContextFlowExplanation;
use crate::dax::patterns::{ArticleReference, PatternReport};
use crate::dax::rewriter::Transformation;
use crate::dax::vertipaq::VertiPaqAnalysis;

/// Structural validation outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kind string from the error taxonomy when invalid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ValidationSummary {
    pub fn valid() -> Self {
        Self { is_valid: true, error: None, error_kind: None }
    }

    pub fn invalid(kind: &str, message: impl Into<String>) -> Self {
        Self { is_valid: false, error: Some(message.into()), error_kind: Some(kind.to_string()) }
    }
}

/// Rewriter output folded into the report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementSet {
    pub details: Vec<Transformation>,
    pub original_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_code: Option<String>,
}

/// Call-tree section: typed tree plus the rendered diagram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTreeReport {
    pub root: CallTreeNode,
    pub rendered: String,
    pub node_count: usize,
}

/// Top-level DAX-intelligence response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaxIntelligenceReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measure_name: Option<String>,
    pub validation: ValidationSummary,
    /// Legend plus the source annotated with per-line transition markers
    pub annotated_dax_code: String,
    pub analysis_summary: String,
    pub context_analysis: ContextFlowExplanation,
    pub best_practices_analysis: BestPracticesReport,
    pub anti_patterns: PatternReport,
    pub improvements: ImprovementSet,
    pub vertipaq_analysis: VertiPaqAnalysis,
    pub call_tree: CallTreeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_steps: Option<Vec<String>>,
    /// Rewritten expression when any transformation changed the code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_measure: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub articles_referenced: Vec<ArticleReference>,
    pub generated_at: DateTime<Utc>,
}
