//! Relationship-aware query hints
//!
//! Loads the RELATIONSHIPS catalog once and suggests DAX modifiers for a
//! compiled query: `USERELATIONSHIP` when both ends of an inactive
//! relationship participate, `CROSSFILTER(..., BOTH)` when a single-direction
//! relationship filters against the grain, and ambiguous-path notices when
//! several relationships connect the same pair of tables. Hints are
//! advisory; only inactive-relationship activations are returned as
//! applicable modifiers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::executor::{self, QueryExecutor};

/// Cross-filter direction of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossFilterDirection {
    Single,
    Both,
    None,
}

/// Relationship cardinality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipCardinality {
    OneToMany,
    ManyToOne,
    OneToOne,
    ManyToMany,
}

/// One model relationship
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipInfo {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub is_active: bool,
    pub cross_filter_direction: CrossFilterDirection,
    pub cardinality: RelationshipCardinality,
}

/// Kind of hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintType {
    UseRelationship,
    CrossfilterBoth,
    AmbiguousPath,
}

/// A suggested relationship modifier for a query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipHint {
    #[serde(rename = "type")]
    pub hint_type: HintType,
    pub from_table: String,
    pub to_table: String,
    /// DAX to add inside CALCULATE/CALCULATETABLE (empty for notices)
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub dax_modifier: String,
    pub reason: String,
    pub severity: HintSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintSeverity {
    Info,
    Warning,
}

/// Relationship catalog with one-shot loading
pub struct RelationshipResolver {
    executor: Option<Arc<dyn QueryExecutor>>,
    loaded: OnceCell<Vec<RelationshipInfo>>,
}

impl RelationshipResolver {
    pub fn new(executor: Option<Arc<dyn QueryExecutor>>) -> Self {
        Self { executor, loaded: OnceCell::new() }
    }

    /// The full relationship list (loaded once)
    pub async fn relationships(&self) -> &[RelationshipInfo] {
        self.loaded
            .get_or_init(|| async {
                let Some(qe) = &self.executor else { return Vec::new() };

                let result = qe.execute_info_query("RELATIONSHIPS").await;
                if !result.success {
                    tracing::debug!(
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "RELATIONSHIPS catalog unavailable"
                    );
                    return Vec::new();
                }

                let relationships: Vec<RelationshipInfo> = result
                    .rows
                    .iter()
                    .filter_map(|row| {
                        let from_table = executor::row_str(row, "FromTable")?;
                        let to_table = executor::row_str(row, "ToTable")?;
                        Some(RelationshipInfo {
                            from_column: executor::row_str(row, "FromColumn")
                                .unwrap_or_default(),
                            to_column: executor::row_str(row, "ToColumn").unwrap_or_default(),
                            is_active: executor::row_bool(row, "IsActive").unwrap_or(true),
                            cross_filter_direction: parse_direction(
                                &executor::row_str(row, "CrossFilterDirection")
                                    .unwrap_or_default(),
                            ),
                            cardinality: parse_cardinality(
                                &executor::row_str(row, "Cardinality").unwrap_or_default(),
                            ),
                            from_table,
                            to_table,
                        })
                    })
                    .collect();

                let inactive = relationships.iter().filter(|r| !r.is_active).count();
                tracing::info!(total = relationships.len(), inactive, "loaded relationships");
                relationships
            })
            .await
    }

    /// Hints for the tables participating in one query
    pub async fn analyze_query_tables(
        &self,
        measure_tables: &[String],
        filter_tables: &[String],
        grouping_tables: &[String],
    ) -> Vec<RelationshipHint> {
        let relationships = self.relationships().await;
        let all: std::collections::HashSet<&str> = measure_tables
            .iter()
            .chain(filter_tables)
            .chain(grouping_tables)
            .map(String::as_str)
            .collect();

        let mut hints = Vec::new();

        // inactive relationships whose both ends are in the query
        for rel in relationships.iter().filter(|r| !r.is_active) {
            if all.contains(rel.from_table.as_str()) && all.contains(rel.to_table.as_str()) {
                hints.push(RelationshipHint {
                    hint_type: HintType::UseRelationship,
                    from_table: rel.from_table.clone(),
                    to_table: rel.to_table.clone(),
                    dax_modifier: format!(
                        "USERELATIONSHIP('{}'[{}], '{}'[{}])",
                        rel.from_table, rel.from_column, rel.to_table, rel.to_column
                    ),
                    reason: format!(
                        "Inactive relationship between {} and {} may need activation",
                        rel.from_table, rel.to_table
                    ),
                    severity: HintSeverity::Warning,
                });
            }
        }

        // single-direction relationships filtering against the grain
        for rel in relationships.iter().filter(|r| r.is_active) {
            if rel.cross_filter_direction != CrossFilterDirection::Single {
                continue;
            }
            let filters_many_side = filter_tables.iter().any(|t| t == &rel.from_table)
                && measure_tables.iter().any(|t| t == &rel.to_table);
            if filters_many_side {
                hints.push(RelationshipHint {
                    hint_type: HintType::CrossfilterBoth,
                    from_table: rel.from_table.clone(),
                    to_table: rel.to_table.clone(),
                    dax_modifier: format!(
                        "CROSSFILTER('{}'[{}], '{}'[{}], BOTH)",
                        rel.from_table, rel.from_column, rel.to_table, rel.to_column
                    ),
                    reason: format!(
                        "Filter on {} may need bidirectional propagation to {}",
                        rel.from_table, rel.to_table
                    ),
                    severity: HintSeverity::Info,
                });
            }
        }

        // pairs connected by several relationships
        let mut pairs: std::collections::HashMap<(String, String), Vec<&RelationshipInfo>> =
            std::collections::HashMap::new();
        for rel in relationships {
            let key = if rel.from_table <= rel.to_table {
                (rel.from_table.clone(), rel.to_table.clone())
            } else {
                (rel.to_table.clone(), rel.from_table.clone())
            };
            pairs.entry(key).or_default().push(rel);
        }

        for ((a, b), rels) in pairs {
            if rels.len() < 2 || !all.contains(a.as_str()) || !all.contains(b.as_str()) {
                continue;
            }
            let active = rels.iter().find(|r| r.is_active);
            let has_inactive = rels.iter().any(|r| !r.is_active);
            if let (Some(active), true) = (active, has_inactive) {
                hints.push(RelationshipHint {
                    hint_type: HintType::AmbiguousPath,
                    from_table: a.clone(),
                    to_table: b.clone(),
                    dax_modifier: String::new(),
                    reason: format!(
                        "Multiple relationships between {a} and {b}; the active one on \
                         [{}] is used. USERELATIONSHIP selects a different path.",
                        active.from_column
                    ),
                    severity: HintSeverity::Info,
                });
            }
        }

        hints
    }

    /// Applicable modifiers (inactive-relationship activations only) plus
    /// the full hint list
    pub async fn dax_modifiers(
        &self,
        measure_tables: &[String],
        filter_tables: &[String],
        grouping_tables: &[String],
    ) -> (Vec<String>, Vec<RelationshipHint>) {
        let hints =
            self.analyze_query_tables(measure_tables, filter_tables, grouping_tables).await;
        let modifiers = hints
            .iter()
            .filter(|h| h.hint_type == HintType::UseRelationship && !h.dax_modifier.is_empty())
            .map(|h| h.dax_modifier.clone())
            .collect();
        (modifiers, hints)
    }
}

fn parse_direction(raw: &str) -> CrossFilterDirection {
    match raw {
        "Both" | "2" => CrossFilterDirection::Both,
        "None" | "0" => CrossFilterDirection::None,
        _ => CrossFilterDirection::Single,
    }
}

fn parse_cardinality(raw: &str) -> RelationshipCardinality {
    match raw {
        "OneToMany" | "1" => RelationshipCardinality::OneToMany,
        "OneToOne" | "3" => RelationshipCardinality::OneToOne,
        "ManyToMany" | "4" => RelationshipCardinality::ManyToMany,
        _ => RelationshipCardinality::ManyToOne,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_executor_yields_no_hints() {
        let resolver = RelationshipResolver::new(None);
        let hints = resolver
            .analyze_query_tables(
                &["Sales".to_string()],
                &["Date".to_string()],
                &[],
            )
            .await;
        assert!(hints.is_empty());
    }

    #[test]
    fn test_direction_and_cardinality_parsing() {
        assert_eq!(parse_direction("Both"), CrossFilterDirection::Both);
        assert_eq!(parse_direction("Single"), CrossFilterDirection::Single);
        assert_eq!(parse_direction(""), CrossFilterDirection::Single);
        assert_eq!(parse_cardinality("ManyToMany"), RelationshipCardinality::ManyToMany);
        assert_eq!(parse_cardinality(""), RelationshipCardinality::ManyToOne);
    }
}
