//! daxlens
//!
//! A DAX intelligence engine for Power BI semantic models. Two subsystems:
//!
//! - [`dax`]: the analysis and rewrite engine. Parses a DAX expression
//!   structurally, detects context transitions and anti-patterns, builds a
//!   scored call tree with VertiPaq iteration estimates, applies ordered
//!   rewrite rules, and aggregates everything into one report.
//! - [`debug`]: the visual filter-to-query compiler. Reads a PBIP report
//!   bundle, extracts a visual's effective filter context, classifies each
//!   filter, and emits executable DAX queries with a smart-retry strategy
//!   for composite-key errors.
//!
//! The crate is a library: connection management and transport to the
//! Analysis Services endpoint belong to the consumer, which supplies a
//! [`executor::QueryExecutor`] implementation. Without one, both subsystems
//! degrade to their offline paths (pattern classification, TMDL measure
//! lookup, no cardinality estimates).
//!
//! ```ignore
//! use daxlens::{AnalyzerConfig, DaxAnalyzer};
//!
//! let analyzer = DaxAnalyzer::new(AnalyzerConfig::default());
//! let report = analyzer
//!     .analyze("SUMX(FILTER(Sales, Sales[Region] = \"EU\"), Sales[Amount])", None)
//!     .await;
//! assert!(report.optimized_measure.is_some());
//! ```

pub mod config;
pub mod dax;
pub mod debug;
pub mod error;
pub mod executor;

// Re-export the primary entry points
pub use config::{AnalyzerConfig, DebugConfig};
pub use dax::DaxAnalyzer;
pub use dax::models::DaxIntelligenceReport;
pub use debug::{
    DebugOperations, VisualDebugResponse, VisualQueryBuilder, VisualQueryRequest,
};
pub use error::{EngineError, EngineResult};
pub use executor::{DaxResult, DmvResult, InfoResult, ProfilingResult, QueryExecutor};
