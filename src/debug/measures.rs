//! Measure resolution
//!
//! Two sources, tried in order: one batched MEASURES+TABLES catalog load
//! from the live model, then an offline scan of the semantic model's TMDL
//! files with a measure-definition micro-parser. Lookups are
//! case-insensitive with a word-subset fuzzy pass; a miss returns the
//! closest candidate names.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::{EngineError, EngineResult};
use crate::executor::{self, QueryExecutor};

/// Where a measure definition came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureSource {
    Dmv,
    Tmdl,
    Fallback,
}

/// A resolved measure definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureDefinition {
    pub name: String,
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_string: Option<String>,
    pub source: MeasureSource,
}

// TMDL property lines that terminate a measure expression
static TMDL_MEASURE_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*measure\s+(?:'([^']+)'|([^\s=']+))\s*=\s*").unwrap());

static TMDL_END_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\n\s*measure\s+",
        r"(?i)\n\s*column\s+",
        r"(?i)\n\s*formatString\s*=",
        r"(?i)\n\s*displayFolder\s*=",
        r"(?i)\n\s*description\s*=",
        r"(?i)\n\s*isHidden\s*=",
        r"(?i)\ntable\s+",
        r"\n\s*\n\s*\n",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static TMDL_FORMAT_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)formatString\s*=\s*(?:"([^"]*)"|'([^']*)'|(\S+))"#).unwrap());

/// Measure resolver over live model and TMDL fallback
pub struct MeasureResolver {
    executor: Option<Arc<dyn QueryExecutor>>,
    tmdl_root: Option<PathBuf>,
    /// lowercase name -> definition
    cache: DashMap<String, MeasureDefinition>,
    bulk_load: OnceCell<bool>,
}

impl MeasureResolver {
    pub fn new(executor: Option<Arc<dyn QueryExecutor>>, tmdl_root: Option<PathBuf>) -> Self {
        Self { executor, tmdl_root, cache: DashMap::new(), bulk_load: OnceCell::new() }
    }

    /// Clear the measure cache
    pub fn reset(&self) {
        self.cache.clear();
    }

    /// Batched load: MEASURES once, TABLES once for id -> name mapping
    async fn ensure_bulk_loaded(&self) -> bool {
        *self
            .bulk_load
            .get_or_init(|| async {
                let Some(qe) = &self.executor else { return false };

                let measures = qe.execute_info_query("MEASURES").await;
                if !measures.success {
                    tracing::debug!(
                        error = measures.error.as_deref().unwrap_or("unknown"),
                        "MEASURES catalog unavailable; relying on TMDL fallback"
                    );
                    return false;
                }

                let mut table_names: std::collections::HashMap<String, String> =
                    std::collections::HashMap::new();
                let tables = qe.execute_info_query("TABLES").await;
                if tables.success {
                    for row in &tables.rows {
                        let id = executor::row_str(row, "ID").unwrap_or_default();
                        let name = executor::row_str(row, "Name").unwrap_or_default();
                        if !id.is_empty() && !name.is_empty() {
                            table_names.insert(id, name);
                        }
                    }
                }

                let mut count = 0;
                for row in &measures.rows {
                    let Some(name) = executor::row_str(row, "Name") else { continue };
                    let expression = executor::row_str(row, "Expression").unwrap_or_default();
                    let table_id = executor::row_str(row, "TableID").unwrap_or_default();

                    let definition = MeasureDefinition {
                        table: table_names.get(&table_id).cloned(),
                        format_string: executor::row_str(row, "FormatString"),
                        expression,
                        source: MeasureSource::Dmv,
                        name: name.clone(),
                    };
                    self.cache.insert(name.to_lowercase(), definition);
                    count += 1;
                }

                tracing::info!(count, "batch loaded measures from model");
                count > 0
            })
            .await
    }

    /// Resolve a measure by name (brackets optional, case-insensitive).
    ///
    /// A soft fuzzy pass accepts a query whose every word appears as a
    /// substring of some word of the measure name; exact match wins, then
    /// the shortest partial match. A miss carries suggestions.
    pub async fn get_measure_expression(&self, name: &str) -> EngineResult<MeasureDefinition> {
        let clean = name.trim().trim_matches(['[', ']']).to_string();
        let key = clean.to_lowercase();

        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }

        self.ensure_bulk_loaded().await;
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }

        if let Some(found) = self.scan_tmdl(&clean) {
            self.cache.insert(key, found.clone());
            return Ok(found);
        }

        // fuzzy pass over everything cached so far
        let candidates: Vec<String> = self.cache.iter().map(|e| e.value().name.clone()).collect();
        if let Some(best) = fuzzy_match(&clean, &candidates) {
            if let Some(hit) = self.cache.get(&best.to_lowercase()) {
                return Ok(hit.clone());
            }
        }

        Err(EngineError::MeasureNotFound {
            suggestions: suggest(&clean, &candidates),
            name: clean,
        })
    }

    /// Resolve several measures, skipping misses
    pub async fn get_measure_expressions(&self, names: &[String]) -> Vec<MeasureDefinition> {
        let mut found = Vec::new();
        for name in names {
            match self.get_measure_expression(name).await {
                Ok(def) => found.push(def),
                Err(err) => tracing::debug!(measure = name.as_str(), %err, "measure lookup miss"),
            }
        }
        found
    }

    /// Scan the semantic model's `*.tmdl` files for one measure
    fn scan_tmdl(&self, measure_name: &str) -> Option<MeasureDefinition> {
        let root = self.tmdl_root.as_ref()?;
        let mut files = Vec::new();
        collect_tmdl_files(root, &mut files, 0);
        tracing::debug!(files = files.len(), measure = measure_name, "scanning TMDL files");

        for file in files {
            let Ok(content) = std::fs::read_to_string(&file) else { continue };
            if let Some(mut def) = parse_measure_from_tmdl(&content, measure_name) {
                if def.table.is_none() && file.to_string_lossy().contains("tables") {
                    def.table =
                        file.file_stem().map(|s| s.to_string_lossy().to_string());
                }
                return Some(def);
            }
        }
        None
    }
}

fn collect_tmdl_files(dir: &Path, out: &mut Vec<PathBuf>, depth: usize) {
    if depth > 6 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tmdl_files(&path, out, depth + 1);
        } else if path.extension().and_then(|e| e.to_str()) == Some("tmdl") {
            out.push(path);
        }
    }
}

/// Parse one measure from TMDL content.
///
/// The expression runs from the `=` to the first sibling property
/// (`formatString =`, `displayFolder =`, ...), the next measure/column/table
/// header, or a blank-line break. A trailing `formatString` within the next
/// 500 bytes is picked up.
pub fn parse_measure_from_tmdl(content: &str, measure_name: &str) -> Option<MeasureDefinition> {
    let wanted = measure_name.to_lowercase();

    for cap in TMDL_MEASURE_HEAD.captures_iter(content) {
        let found = cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str().trim())
            .unwrap_or_default();
        if found.to_lowercase() != wanted {
            continue;
        }

        let expr_start = cap.get(0).unwrap().end();
        let rest = &content[expr_start..];

        let mut expr_end = rest.len();
        for marker in TMDL_END_MARKERS.iter() {
            if let Some(m) = marker.find(rest) {
                expr_end = expr_end.min(m.start());
            }
        }

        let expression = rest[..expr_end].trim().to_string();
        if expression.is_empty() {
            return None;
        }

        let tail = &rest[expr_end..rest.len().min(expr_end + 500)];
        let format_string = TMDL_FORMAT_STRING.captures(tail).and_then(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .or_else(|| c.get(3))
                .map(|m| m.as_str().to_string())
        });

        return Some(MeasureDefinition {
            name: found.to_string(),
            expression,
            table: None,
            format_string,
            source: MeasureSource::Tmdl,
        });
    }

    None
}

/// Every query word must appear as a substring of some candidate word.
/// Exact (case-insensitive) match wins; otherwise the shortest partial.
fn fuzzy_match(query: &str, candidates: &[String]) -> Option<String> {
    let query_lower = query.to_lowercase();

    if let Some(exact) =
        candidates.iter().find(|c| c.to_lowercase() == query_lower)
    {
        return Some(exact.clone());
    }

    let query_words: Vec<&str> = query_lower.split_whitespace().collect();
    if query_words.is_empty() {
        return None;
    }

    candidates
        .iter()
        .filter(|candidate| {
            let words: Vec<String> =
                candidate.to_lowercase().split_whitespace().map(str::to_string).collect();
            query_words
                .iter()
                .all(|qw| words.iter().any(|cw| cw.contains(qw)))
        })
        .min_by_key(|c| c.len())
        .cloned()
}

/// Top candidates for a miss: word-overlap score, best first, capped at 5
fn suggest(query: &str, candidates: &[String]) -> Vec<String> {
    let query_words: Vec<String> =
        query.to_lowercase().split_whitespace().map(str::to_string).collect();

    let mut scored: Vec<(usize, &String)> = candidates
        .iter()
        .map(|candidate| {
            let lower = candidate.to_lowercase();
            let score = query_words.iter().filter(|qw| lower.contains(qw.as_str())).count();
            (score, candidate)
        })
        .filter(|(score, _)| *score > 0)
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.len().cmp(&b.1.len())));
    scored.into_iter().take(5).map(|(_, c)| c.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TMDL: &str = "table Sales\n\
        \n\
        \tmeasure 'Total Sales' = SUM(Sales[Amount])\n\
        \t\tformatString = \"#,0.00\"\n\
        \t\tdisplayFolder = KPIs\n\
        \n\
        \tmeasure AvgPrice =\n\
        \t\tDIVIDE(\n\
        \t\t    SUM(Sales[Amount]),\n\
        \t\t    SUM(Sales[Quantity])\n\
        \t\t)\n\
        \t\tisHidden = false\n\
        \n\
        \tcolumn Amount\n\
        \t\tdataType: decimal\n";

    #[test]
    fn test_tmdl_quoted_measure() {
        let def = parse_measure_from_tmdl(TMDL, "Total Sales").unwrap();
        assert_eq!(def.expression, "SUM(Sales[Amount])");
        assert_eq!(def.format_string.as_deref(), Some("#,0.00"));
        assert_eq!(def.source, MeasureSource::Tmdl);
    }

    #[test]
    fn test_tmdl_unquoted_multiline_measure() {
        let def = parse_measure_from_tmdl(TMDL, "AvgPrice").unwrap();
        assert!(def.expression.starts_with("DIVIDE("));
        assert!(def.expression.ends_with(')'));
        assert!(!def.expression.to_lowercase().contains("ishidden"));
    }

    #[test]
    fn test_tmdl_case_insensitive() {
        assert!(parse_measure_from_tmdl(TMDL, "total sales").is_some());
        assert!(parse_measure_from_tmdl(TMDL, "No Such Measure").is_none());
    }

    #[test]
    fn test_fuzzy_matching() {
        let candidates = vec![
            "Total Sales".to_string(),
            "Total Sales YTD".to_string(),
            "Average Cost".to_string(),
        ];

        // exact beats the shorter-partial rule
        assert_eq!(
            fuzzy_match("total sales", &candidates).as_deref(),
            Some("Total Sales")
        );
        // every query word a substring of some name word
        assert_eq!(
            fuzzy_match("sales ytd", &candidates).as_deref(),
            Some("Total Sales YTD")
        );
        assert_eq!(fuzzy_match("margin", &candidates), None);
    }

    #[test]
    fn test_suggestions_ranked() {
        let candidates = vec![
            "Total Sales".to_string(),
            "Sales Growth".to_string(),
            "Cost Total".to_string(),
        ];
        let suggestions = suggest("total sales", &candidates);
        assert_eq!(suggestions.first().map(String::as_str), Some("Total Sales"));
        assert!(suggestions.len() >= 2);
    }

    #[tokio::test]
    async fn test_miss_without_sources_reports_not_found() {
        let resolver = MeasureResolver::new(None, None);
        let err = resolver.get_measure_expression("[Total Sales]").await.unwrap_err();
        match err {
            EngineError::MeasureNotFound { name, .. } => assert_eq!(name, "Total Sales"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tmdl_fallback_from_disk() {
        let dir = std::env::temp_dir()
            .join("daxlens-tmdl-tests")
            .join(std::process::id().to_string())
            .join("tables");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Sales.tmdl"), TMDL).unwrap();

        let resolver = MeasureResolver::new(None, Some(dir.parent().unwrap().to_path_buf()));
        let def = resolver.get_measure_expression("Total Sales").await.unwrap();
        assert_eq!(def.expression, "SUM(Sales[Amount])");
        assert_eq!(def.table.as_deref(), Some("Sales"));

        // case variants resolve to the same measure
        let lower = resolver.get_measure_expression("total sales").await.unwrap();
        assert_eq!(lower.name, def.name);
    }
}
