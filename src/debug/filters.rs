//! Filter-definition and slicer-state conversion to DAX
//!
//! Translates PBIP filter JSON (`filter.Where[].Condition`) and saved slicer
//! selections into boolean DAX expressions. Null sentinels split into an
//! `ISBLANK(column)` branch; inverted selections negate both branches and
//! join them with AND. Every produced filter carries a classification used
//! later to drop field-parameter and UI-control filters from queries.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::debug::literal::{TypedValue, ValueTag};
use crate::executor::{self, QueryExecutor};

/// Where a filter came from; emission order follows this precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSource {
    Report,
    Page,
    Visual,
    Slicer,
    Manual,
}

/// Shape of the originating condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    In,
    Comparison,
    Between,
    Not,
    IsBlank,
    IsNotBlank,
    Manual,
    Unknown,
}

/// Purpose classification of a filter's table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterClassification {
    Data,
    FieldParameter,
    UiControl,
    Unknown,
}

/// A converted DAX filter expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterExpression {
    pub dax: String,
    pub source: FilterSource,
    pub table: String,
    pub column: String,
    pub condition_type: ConditionType,
    pub values: Vec<TypedValue>,
    pub classification: FilterClassification,
    pub is_field_parameter: bool,
    pub has_null_values: bool,
}

impl FilterExpression {
    /// `'Table'[Column]` display form
    pub fn field_reference(&self) -> String {
        format!("'{}'[{}]", self.table, self.column)
    }

    /// Build a manual filter from a raw DAX fragment
    pub fn manual(dax: impl Into<String>) -> Self {
        Self {
            dax: dax.into(),
            source: FilterSource::Manual,
            table: String::new(),
            column: String::new(),
            condition_type: ConditionType::Manual,
            values: Vec::new(),
            classification: FilterClassification::Data,
            is_field_parameter: false,
            has_null_values: false,
        }
    }
}

/// Saved slicer state parsed from a visual definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlicerState {
    pub slicer_id: String,
    pub page_name: String,
    pub table: String,
    pub column: String,
    pub field_reference: String,
    pub selected_values: Vec<TypedValue>,
    pub selection_mode: SelectionMode,
    pub is_inverted: bool,
}

/// Slicer selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    SingleSelect,
    MultiSelect,
    SingleSelectAll,
}

// Name patterns marking field-parameter tables. Only the `sf ` (slicer
// field) and `mf ` (measure field) prefixes count; a plain `s ` prefix marks
// disconnected slicer tables which are real data filters.
const FIELD_PARAMETER_PATTERNS: &[&str] = &[
    "sf filter",
    "sf row",
    "sf slicer",
    "sf column",
    "sf period",
    "sf time",
    "mf ",
    "field parameter",
    "fieldparameter",
    "_fp_",
    "slicer param",
    "slicerparam",
    "_field_param",
];

// UI control / formatting table patterns; filters on these shape the visual,
// not the data
const UI_CONTROL_PATTERNS: &[&str] =
    &["decimal", "scale", "format", "display", "_ui_", "_ctrl_"];

/// Name-pattern detection of field-parameter tables
pub fn is_field_parameter_table(table_name: &str) -> bool {
    if table_name.is_empty() {
        return false;
    }
    let lower = table_name.to_lowercase();
    let lower = lower.trim_matches('\'');

    if FIELD_PARAMETER_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    if lower.starts_with("sf ") || lower.starts_with("mf ") {
        return true;
    }
    lower.ends_with(" fields") || lower.ends_with("fields")
}

/// Name-pattern detection of UI-control tables
pub fn is_ui_control_table(table_name: &str) -> bool {
    if table_name.is_empty() {
        return false;
    }
    let lower = table_name.to_lowercase();
    let lower = lower.trim_matches('\'');
    UI_CONTROL_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Pattern-based classification fallback (used when no live model is
/// available; the semantic classifier upgrades these when connected)
pub fn classify_by_name(table_name: &str) -> FilterClassification {
    if is_field_parameter_table(table_name) {
        FilterClassification::FieldParameter
    } else if is_ui_control_table(table_name) {
        FilterClassification::UiControl
    } else {
        FilterClassification::Data
    }
}

/// Converter from PBIP filter JSON / slicer state to [`FilterExpression`]
#[derive(Default)]
pub struct FilterConverter {
    /// `Table.Column` -> model data type, loaded once from the COLUMNS DMV
    column_types: DashMap<String, ValueTag>,
}

impl FilterConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one column's model data type
    pub fn set_column_type(&self, table: &str, column: &str, data_type: &str) {
        self.column_types
            .insert(format!("{table}.{column}"), ValueTag::from_model_type(data_type));
    }

    pub fn column_type(&self, table: &str, column: &str) -> Option<ValueTag> {
        self.column_types.get(&format!("{table}.{column}")).map(|t| *t)
    }

    /// Load column data types from the model so unknown-tagged filter values
    /// pick up the column's type (string columns keep `"0"` a string)
    pub async fn load_column_types(&self, qe: &dyn QueryExecutor) -> usize {
        let result = qe.execute_info_query("COLUMNS").await;
        if !result.success {
            tracing::debug!(
                error = result.error.as_deref().unwrap_or("unknown"),
                "COLUMNS catalog unavailable; filter values keep literal tags"
            );
            return 0;
        }

        let mut count = 0;
        for row in &result.rows {
            let table = executor::row_str(row, "TableName")
                .or_else(|| executor::row_str(row, "Table"))
                .unwrap_or_default();
            let column = executor::row_str(row, "ColumnName")
                .or_else(|| executor::row_str(row, "Name"))
                .unwrap_or_default();
            let data_type = executor::row_str(row, "DataType").unwrap_or_default();
            if table.is_empty() || column.is_empty() || data_type.is_empty() {
                continue;
            }
            self.set_column_type(table.trim_matches('\''), &column, &data_type);
            count += 1;
        }
        tracing::info!(count, "loaded column types from model");
        count
    }

    /// Convert one PBIP filter definition
    pub fn convert_filter(
        &self,
        filter_def: &Value,
        source: FilterSource,
    ) -> Option<FilterExpression> {
        let (table, column) = extract_target(filter_def)?;
        let where_clauses = filter_def
            .pointer("/filter/Where")
            .and_then(Value::as_array)?;

        let mut dax_parts = Vec::new();
        let mut all_values = Vec::new();
        let mut condition_type = ConditionType::Unknown;
        let mut has_null_values = false;

        let column_ref = format!("'{table}'[{column}]");
        for clause in where_clauses {
            let Some(condition) = clause.get("Condition") else { continue };
            let Some(converted) =
                self.convert_condition(condition, &table, &column, &column_ref)
            else {
                continue;
            };
            dax_parts.push(converted.dax);
            all_values.extend(converted.values);
            condition_type = converted.condition_type;
            has_null_values |= converted.has_null;
        }

        if dax_parts.is_empty() {
            return None;
        }
        let dax = dax_parts.join(" && ");

        Some(FilterExpression {
            dax,
            source,
            condition_type,
            values: all_values,
            classification: classify_by_name(&table),
            is_field_parameter: is_field_parameter_table(&table),
            has_null_values,
            table,
            column,
        })
    }

    /// Convert a slicer's saved selection.
    ///
    /// `single_select_all` with no values means "select all": no filter.
    /// Inverted selections exclude: both branches negate and join with AND.
    pub fn convert_slicer(&self, slicer: &SlicerState) -> Option<FilterExpression> {
        if slicer.selection_mode == SelectionMode::SingleSelectAll
            && slicer.selected_values.is_empty()
        {
            return None;
        }
        if slicer.selected_values.is_empty() {
            return None;
        }

        let column_ref = format!("'{}'[{}]", slicer.table, slicer.column);
        let target_tag = self.column_type(&slicer.table, &slicer.column);

        let mut literals = Vec::new();
        let mut nulls = 0usize;
        for value in &slicer.selected_values {
            if value.is_null() {
                nulls += 1;
            } else {
                let v = match target_tag {
                    Some(tag) => value.clone().coerce(tag),
                    None => value.clone(),
                };
                literals.push(v);
            }
        }
        let has_null = nulls > 0;

        let mut parts = Vec::new();
        let condition_type;
        let dax = if slicer.is_inverted {
            condition_type = ConditionType::Not;
            if has_null {
                parts.push(format!("NOT(ISBLANK({column_ref}))"));
            }
            if !literals.is_empty() {
                parts.push(format!("NOT({column_ref} IN {{{}}})", format_values(&literals)));
            }
            join_parts(parts, " && ")?
        } else {
            condition_type = ConditionType::In;
            if has_null {
                parts.push(format!("ISBLANK({column_ref})"));
            }
            if !literals.is_empty() {
                parts.push(format!("{column_ref} IN {{{}}}", format_values(&literals)));
            }
            join_parts(parts, " || ")?
        };

        Some(FilterExpression {
            dax,
            source: FilterSource::Slicer,
            table: slicer.table.clone(),
            column: slicer.column.clone(),
            condition_type,
            values: literals,
            classification: classify_by_name(&slicer.table),
            is_field_parameter: is_field_parameter_table(&slicer.table),
            has_null_values: has_null,
        })
    }

    fn convert_condition(
        &self,
        condition: &Value,
        table: &str,
        column: &str,
        column_ref: &str,
    ) -> Option<ConvertedCondition> {
        if let Some(in_cond) = condition.get("In") {
            return self.convert_in(in_cond, table, column, column_ref);
        }

        if let Some(comp) = condition.get("Comparison") {
            return self.convert_comparison(comp, table, column, column_ref);
        }

        if let Some(between) = condition.get("Between") {
            return self.convert_between(between, table, column, column_ref);
        }

        if let Some(not_cond) = condition.get("Not") {
            let inner = not_cond.get("Expression")?.get("In")?;
            let converted = self.convert_in(inner, table, column, column_ref)?;
            // negate both branches, joined with AND
            let mut parts = Vec::new();
            if converted.has_null {
                parts.push(format!("NOT(ISBLANK({column_ref}))"));
            }
            if !converted.values.is_empty() {
                parts.push(format!(
                    "NOT({column_ref} IN {{{}}})",
                    format_values(&converted.values)
                ));
            }
            return Some(ConvertedCondition {
                dax: join_parts(parts, " && ")?,
                condition_type: ConditionType::Not,
                values: converted.values,
                has_null: converted.has_null,
            });
        }

        if condition.get("IsBlank").is_some() {
            return Some(ConvertedCondition {
                dax: format!("ISBLANK({column_ref})"),
                condition_type: ConditionType::IsBlank,
                values: Vec::new(),
                has_null: true,
            });
        }

        if condition.get("IsNotBlank").is_some() {
            return Some(ConvertedCondition {
                dax: format!("NOT(ISBLANK({column_ref}))"),
                condition_type: ConditionType::IsNotBlank,
                values: Vec::new(),
                has_null: false,
            });
        }

        None
    }

    fn convert_in(
        &self,
        in_cond: &Value,
        table: &str,
        column: &str,
        column_ref: &str,
    ) -> Option<ConvertedCondition> {
        let target_tag = self.column_type(table, column);
        let mut literals = Vec::new();
        let mut has_null = false;

        for group in in_cond.get("Values").and_then(Value::as_array)? {
            for item in group.as_array()? {
                let Some(raw) = item.pointer("/Literal/Value") else { continue };
                let value = TypedValue::from_json(raw);
                if value.is_null() {
                    has_null = true;
                } else {
                    let v = match target_tag {
                        Some(tag) => value.coerce(tag),
                        None => value,
                    };
                    literals.push(v);
                }
            }
        }

        let mut parts = Vec::new();
        if has_null {
            parts.push(format!("ISBLANK({column_ref})"));
        }
        if !literals.is_empty() {
            parts.push(format!("{column_ref} IN {{{}}}", format_values(&literals)));
        }

        Some(ConvertedCondition {
            dax: join_parts(parts, " || ")?,
            condition_type: ConditionType::In,
            values: literals,
            has_null,
        })
    }

    fn convert_comparison(
        &self,
        comp: &Value,
        table: &str,
        column: &str,
        column_ref: &str,
    ) -> Option<ConvertedCondition> {
        let kind = comp.get("ComparisonKind").and_then(Value::as_str).unwrap_or("Equal");
        let raw = comp.pointer("/Right/Literal/Value")?;

        let operator = match kind {
            "GreaterThan" => ">",
            "GreaterThanOrEqual" => ">=",
            "LessThan" => "<",
            "LessThanOrEqual" => "<=",
            "NotEqual" => "<>",
            _ => "=",
        };

        let mut value = TypedValue::from_json(raw);
        if let Some(tag) = self.column_type(table, column) {
            value = value.coerce(tag);
        }

        Some(ConvertedCondition {
            dax: format!("{column_ref} {operator} {}", value.to_dax()),
            condition_type: ConditionType::Comparison,
            values: vec![value],
            has_null: false,
        })
    }

    fn convert_between(
        &self,
        between: &Value,
        table: &str,
        column: &str,
        column_ref: &str,
    ) -> Option<ConvertedCondition> {
        let lower_raw = between.pointer("/Lower/Literal/Value")?;
        let upper_raw = between.pointer("/Upper/Literal/Value")?;

        let mut lower = TypedValue::from_json(lower_raw);
        let mut upper = TypedValue::from_json(upper_raw);
        if let Some(tag) = self.column_type(table, column) {
            lower = lower.coerce(tag);
            upper = upper.coerce(tag);
        }

        Some(ConvertedCondition {
            dax: format!(
                "{column_ref} >= {} && {column_ref} <= {}",
                lower.to_dax(),
                upper.to_dax()
            ),
            condition_type: ConditionType::Between,
            values: vec![lower, upper],
            has_null: false,
        })
    }
}

struct ConvertedCondition {
    dax: String,
    condition_type: ConditionType,
    values: Vec<TypedValue>,
    has_null: bool,
}

fn format_values(values: &[TypedValue]) -> String {
    values.iter().map(TypedValue::to_dax).collect::<Vec<_>>().join(", ")
}

/// Parenthesize when both branches are present; None when neither is
fn join_parts(parts: Vec<String>, separator: &str) -> Option<String> {
    match parts.len() {
        0 => None,
        1 => Some(parts.into_iter().next().unwrap()),
        _ => Some(format!("({})", parts.join(separator))),
    }
}

/// Resolve the filter target through the `target` /
/// `expression.Column.Expression.SourceRef` / `filter.From[0]` fallbacks
fn extract_target(filter_def: &Value) -> Option<(String, String)> {
    // explicit target object
    if let Some(target) = filter_def.get("target") {
        let table = target.get("table").and_then(Value::as_str).unwrap_or("");
        let column = target
            .get("column")
            .or_else(|| target.get("measure"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !table.is_empty() && !column.is_empty() {
            return Some((table.to_string(), column.to_string()));
        }
    }

    // expression.Column path
    if let Some(column_expr) = filter_def.pointer("/expression/Column") {
        let source_ref = column_expr.pointer("/Expression/SourceRef");
        let table = source_ref
            .and_then(|s| s.get("Entity").or_else(|| s.get("Source")))
            .and_then(Value::as_str)
            .unwrap_or("");
        let column = column_expr.get("Property").and_then(Value::as_str).unwrap_or("");
        if !table.is_empty() && !column.is_empty() {
            return Some((table.to_string(), column.to_string()));
        }
    }

    // filter.From[0] + first In condition column
    let from0 = filter_def.pointer("/filter/From/0")?;
    let table = from0
        .get("Entity")
        .or_else(|| from0.get("Name"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let column = filter_def
        .pointer("/filter/Where/0/Condition/In/Expressions/0/Column/Property")
        .and_then(Value::as_str)
        .unwrap_or("");
    (!table.is_empty() && !column.is_empty()).then(|| (table.to_string(), column.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn converter() -> FilterConverter {
        FilterConverter::new()
    }

    fn slicer(values: Vec<TypedValue>, mode: SelectionMode, inverted: bool) -> SlicerState {
        SlicerState {
            slicer_id: "s1".into(),
            page_name: "Overview".into(),
            table: "d Region".into(),
            column: "Code".into(),
            field_reference: "'d Region'[Code]".into(),
            selected_values: values,
            selection_mode: mode,
            is_inverted: inverted,
        }
    }

    #[test]
    fn test_slicer_null_plus_value() {
        let state = slicer(
            vec![
                TypedValue::parse_literal("'null'L"),
                TypedValue::parse_literal("'EU'L"),
            ],
            SelectionMode::MultiSelect,
            false,
        );
        let expr = converter().convert_slicer(&state).unwrap();
        assert_eq!(
            expr.dax,
            "(ISBLANK('d Region'[Code]) || 'd Region'[Code] IN {\"EU\"})"
        );
        assert!(expr.has_null_values);
        assert_eq!(expr.classification, FilterClassification::Data);
        assert_eq!(expr.condition_type, ConditionType::In);
    }

    #[test]
    fn test_slicer_inverted_joins_with_and() {
        let state = slicer(
            vec![
                TypedValue::parse_literal("'null'L"),
                TypedValue::parse_literal("'EU'L"),
            ],
            SelectionMode::MultiSelect,
            true,
        );
        let expr = converter().convert_slicer(&state).unwrap();
        assert_eq!(
            expr.dax,
            "(NOT(ISBLANK('d Region'[Code])) && NOT('d Region'[Code] IN {\"EU\"}))"
        );
        assert_eq!(expr.condition_type, ConditionType::Not);
    }

    #[test]
    fn test_select_all_emits_no_filter() {
        let state = slicer(vec![], SelectionMode::SingleSelectAll, true);
        assert!(converter().convert_slicer(&state).is_none());
    }

    #[test]
    fn test_in_filter_conversion() {
        let filter = json!({
            "target": {"table": "Product", "column": "Category"},
            "filter": {
                "Where": [{
                    "Condition": {
                        "In": {"Values": [[{"Literal": {"Value": "'Bikes'L"}}]]}
                    }
                }]
            }
        });
        let expr = converter().convert_filter(&filter, FilterSource::Report).unwrap();
        assert_eq!(expr.dax, "'Product'[Category] IN {\"Bikes\"}");
        assert_eq!(expr.source, FilterSource::Report);
        assert!(!expr.has_null_values);
    }

    #[test]
    fn test_comparison_operators() {
        let filter = json!({
            "target": {"table": "Sales", "column": "Amount"},
            "filter": {
                "Where": [{
                    "Condition": {
                        "Comparison": {
                            "ComparisonKind": "GreaterThanOrEqual",
                            "Right": {"Literal": {"Value": "100L"}}
                        }
                    }
                }]
            }
        });
        let expr = converter().convert_filter(&filter, FilterSource::Page).unwrap();
        assert_eq!(expr.dax, "'Sales'[Amount] >= 100");
        assert_eq!(expr.condition_type, ConditionType::Comparison);
    }

    #[test]
    fn test_between_condition() {
        let filter = json!({
            "target": {"table": "Sales", "column": "Year"},
            "filter": {
                "Where": [{
                    "Condition": {
                        "Between": {
                            "Lower": {"Literal": {"Value": "2020L"}},
                            "Upper": {"Literal": {"Value": "2024L"}}
                        }
                    }
                }]
            }
        });
        let expr = converter().convert_filter(&filter, FilterSource::Visual).unwrap();
        assert_eq!(expr.dax, "'Sales'[Year] >= 2020 && 'Sales'[Year] <= 2024");
    }

    #[test]
    fn test_not_in_preserves_null_branch() {
        let filter = json!({
            "target": {"table": "Sales", "column": "Status"},
            "filter": {
                "Where": [{
                    "Condition": {
                        "Not": {
                            "Expression": {
                                "In": {"Values": [
                                    [{"Literal": {"Value": "null"}}],
                                    [{"Literal": {"Value": "'X'L"}}]
                                ]}
                            }
                        }
                    }
                }]
            }
        });
        let expr = converter().convert_filter(&filter, FilterSource::Visual).unwrap();
        assert_eq!(
            expr.dax,
            "(NOT(ISBLANK('Sales'[Status])) && NOT('Sales'[Status] IN {\"X\"}))"
        );
        assert!(expr.has_null_values);
    }

    #[test]
    fn test_is_blank_conditions() {
        let filter = json!({
            "target": {"table": "Sales", "column": "Region"},
            "filter": {"Where": [{"Condition": {"IsBlank": {}}}]}
        });
        let expr = converter().convert_filter(&filter, FilterSource::Visual).unwrap();
        assert_eq!(expr.dax, "ISBLANK('Sales'[Region])");
        assert!(expr.has_null_values);
    }

    #[test]
    fn test_source_ref_target_extraction() {
        let filter = json!({
            "expression": {
                "Column": {
                    "Expression": {"SourceRef": {"Entity": "Date"}},
                    "Property": "Year"
                }
            },
            "filter": {
                "Where": [{
                    "Condition": {
                        "In": {"Values": [[{"Literal": {"Value": "2024L"}}]]}
                    }
                }]
            }
        });
        let expr = converter().convert_filter(&filter, FilterSource::Report).unwrap();
        assert_eq!(expr.table, "Date");
        assert_eq!(expr.column, "Year");
        assert_eq!(expr.dax, "'Date'[Year] IN {2024}");
    }

    #[test]
    fn test_field_parameter_classification() {
        let state = SlicerState {
            table: "sf Slicer 1".into(),
            column: "Value".into(),
            field_reference: "'sf Slicer 1'[Value]".into(),
            ..slicer(vec![TypedValue::parse_literal("'A'L")], SelectionMode::MultiSelect, false)
        };
        let expr = converter().convert_slicer(&state).unwrap();
        assert_eq!(expr.classification, FilterClassification::FieldParameter);
        assert!(expr.is_field_parameter);

        // plain `s ` prefix is a disconnected slicer table, not a field param
        assert_eq!(classify_by_name("s Period View"), FilterClassification::Data);
        assert_eq!(classify_by_name("Decimal Places"), FilterClassification::UiControl);
    }

    #[test]
    fn test_column_type_keeps_string_zero() {
        let conv = converter();
        conv.set_column_type("d Region", "Code", "String");
        let state = slicer(
            vec![TypedValue::Unknown("0".into())],
            SelectionMode::MultiSelect,
            false,
        );
        let expr = conv.convert_slicer(&state).unwrap();
        assert_eq!(expr.dax, "'d Region'[Code] IN {\"0\"}");
    }

    #[test]
    fn test_multiple_conditions_joined_with_and() {
        let filter = json!({
            "target": {"table": "Sales", "column": "Amount"},
            "filter": {
                "Where": [
                    {"Condition": {"Comparison": {
                        "ComparisonKind": "GreaterThan",
                        "Right": {"Literal": {"Value": "0L"}}
                    }}},
                    {"Condition": {"Comparison": {
                        "ComparisonKind": "LessThan",
                        "Right": {"Literal": {"Value": "100L"}}
                    }}}
                ]
            }
        });
        let expr = converter().convert_filter(&filter, FilterSource::Report).unwrap();
        assert_eq!(expr.dax, "'Sales'[Amount] > 0 && 'Sales'[Amount] < 100");
    }
}
