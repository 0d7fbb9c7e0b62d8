//! Visual query compilation
//!
//! Assembles the effective filter context for a visual (report, page,
//! visual, slicer, in that precedence order) and emits an executable DAX
//! query reproducing the visual's data. Field-parameter and UI-control
//! filters are dropped from the emitted query but remembered so the
//! orchestrator's smart retry can report them.
//!
//! Query shapes:
//! - grouping columns from one table: `CALCULATETABLE(ADDCOLUMNS(SUMMARIZE`
//! - grouping columns spanning tables: `CALCULATETABLE(SUMMARIZECOLUMNS`
//! - no grouping columns: `ROW("Value", CALCULATE(measure, filters))`

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::debug::bundle::{PageInfo, PbipWarning, ReportBundle, VisualInfo, VisualSummary};
use crate::debug::classifier::SemanticClassifier;
use crate::debug::filters::{
    ConditionType, FilterClassification, FilterConverter, FilterExpression, FilterSource,
    SlicerState,
};
use crate::debug::literal::TypedValue;
use crate::debug::measures::{MeasureDefinition, MeasureResolver};
use crate::debug::relationships::{RelationshipHint, RelationshipResolver};
use crate::error::EngineResult;
use crate::executor::QueryExecutor;
use tokio::sync::OnceCell;

/// Complete filter context for one visual
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterContext {
    pub report_filters: Vec<FilterExpression>,
    pub page_filters: Vec<FilterExpression>,
    pub visual_filters: Vec<FilterExpression>,
    pub slicer_filters: Vec<FilterExpression>,
}

impl FilterContext {
    /// All filters in precedence order: report, page, visual, slicer
    pub fn all_filters(&self) -> Vec<&FilterExpression> {
        self.report_filters
            .iter()
            .chain(&self.page_filters)
            .chain(&self.visual_filters)
            .chain(&self.slicer_filters)
            .collect()
    }

    pub fn data_filters(&self) -> Vec<&FilterExpression> {
        self.all_filters()
            .into_iter()
            .filter(|f| f.classification == FilterClassification::Data)
            .collect()
    }

    pub fn field_parameter_filters(&self) -> Vec<&FilterExpression> {
        self.all_filters()
            .into_iter()
            .filter(|f| f.classification == FilterClassification::FieldParameter)
            .collect()
    }

    pub fn ui_control_filters(&self) -> Vec<&FilterExpression> {
        self.all_filters()
            .into_iter()
            .filter(|f| f.classification == FilterClassification::UiControl)
            .collect()
    }

    pub fn total(&self) -> usize {
        self.report_filters.len()
            + self.page_filters.len()
            + self.visual_filters.len()
            + self.slicer_filters.len()
    }
}

/// Locator for a visual on a page
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualQueryRequest {
    pub page_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_name: Option<String>,
    /// Limit the query to one measure instead of all in the visual
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measure_name: Option<String>,
    pub include_slicers: bool,
    /// Also emit a query with measure DAX inlined
    pub expand_measures: bool,
}

impl VisualQueryRequest {
    pub fn for_visual(page_name: impl Into<String>, visual_id: impl Into<String>) -> Self {
        Self {
            page_name: page_name.into(),
            visual_id: Some(visual_id.into()),
            include_slicers: true,
            ..Default::default()
        }
    }
}

/// Compiled query with its context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualQueryResult {
    pub visual: VisualInfo,
    pub filter_context: FilterContext,
    pub dax_query: String,
    /// First target measure, bracketed
    pub measure_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub measure_definitions: Vec<MeasureDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_query: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub relationship_hints: Vec<RelationshipHint>,
}

/// Detail-rows request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailRowsRequest {
    pub page_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_name: Option<String>,
    /// Explicit fact table; inferred from the visual's first column otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fact_table: Option<String>,
    pub limit: usize,
    pub include_slicers: bool,
}

/// Visual query compiler over one report bundle
pub struct VisualQueryBuilder {
    bundle: ReportBundle,
    converter: FilterConverter,
    executor: Option<Arc<dyn QueryExecutor>>,
    measures: MeasureResolver,
    classifier: SemanticClassifier,
    relationships: RelationshipResolver,
    column_types: OnceCell<usize>,
}

impl VisualQueryBuilder {
    /// Open a bundle without a live model; classification and measure
    /// resolution fall back to patterns and TMDL
    pub fn new(bundle_root: impl Into<PathBuf>) -> EngineResult<Self> {
        let bundle = ReportBundle::open(bundle_root)?;
        let tmdl_root = bundle.semantic_model_dir();
        Ok(Self {
            bundle,
            converter: FilterConverter::new(),
            executor: None,
            measures: MeasureResolver::new(None, tmdl_root),
            classifier: SemanticClassifier::new(None),
            relationships: RelationshipResolver::new(None),
            column_types: OnceCell::new(),
        })
    }

    /// Attach a live-model executor
    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        let tmdl_root = self.bundle.semantic_model_dir();
        self.measures = MeasureResolver::new(Some(executor.clone()), tmdl_root);
        self.classifier = SemanticClassifier::new(Some(executor.clone()));
        self.relationships = RelationshipResolver::new(Some(executor.clone()));
        self.executor = Some(executor);
        self
    }

    pub fn bundle(&self) -> &ReportBundle {
        &self.bundle
    }

    pub fn measures(&self) -> &MeasureResolver {
        &self.measures
    }

    pub fn classifier(&self) -> &SemanticClassifier {
        &self.classifier
    }

    pub fn executor(&self) -> Option<&Arc<dyn QueryExecutor>> {
        self.executor.as_ref()
    }

    /// Staleness warning per the configured threshold
    pub fn freshness_warning(&self, threshold_minutes: f64) -> Option<PbipWarning> {
        self.bundle.freshness_warning(threshold_minutes)
    }

    /// Drop all caches (bundle, measures, classification)
    pub fn reset(&self) {
        self.bundle.reset();
        self.measures.reset();
        self.classifier.reset();
    }

    pub fn list_pages(&self) -> EngineResult<Vec<PageInfo>> {
        self.bundle.list_pages()
    }

    pub fn list_visuals(&self, page: &str, include_ui: bool) -> EngineResult<Vec<VisualSummary>> {
        self.bundle.list_visuals(page, include_ui)
    }

    pub fn list_slicers(&self, page: Option<&str>) -> EngineResult<Vec<SlicerState>> {
        self.bundle.list_slicers(page)
    }

    /// One-shot column-type load so filter values pick up model types
    async fn ensure_column_types(&self) {
        let Some(qe) = &self.executor else { return };
        self.column_types
            .get_or_init(|| async { self.converter.load_column_types(qe.as_ref()).await })
            .await;
    }

    /// Assemble the complete filter context for a visual
    pub async fn get_visual_filter_context(
        &self,
        page_name: &str,
        visual_id: Option<&str>,
        visual_name: Option<&str>,
        include_slicers: bool,
    ) -> EngineResult<(VisualInfo, FilterContext)> {
        self.ensure_column_types().await;

        let page_path = self.bundle.find_page(page_name)?;
        let visual = self.bundle.find_visual(page_name, visual_id, visual_name)?;

        let mut context = FilterContext::default();

        for raw in self.bundle.report_filters() {
            if let Some(expr) = self.converter.convert_filter(&raw, FilterSource::Report) {
                context.report_filters.push(expr);
            }
        }
        for raw in self.bundle.page_filters(&page_path) {
            if let Some(expr) = self.converter.convert_filter(&raw, FilterSource::Page) {
                context.page_filters.push(expr);
            }
        }
        for raw in &visual.filters {
            if let Some(expr) = self.converter.convert_filter(raw, FilterSource::Visual) {
                context.visual_filters.push(expr);
            }
        }
        if include_slicers {
            for slicer in self.bundle.page_slicers(page_name)? {
                if let Some(expr) = self.converter.convert_slicer(&slicer) {
                    context.slicer_filters.push(expr);
                }
            }
        }

        // upgrade name-pattern classifications with model evidence
        if self.executor.is_some() {
            for filter in context
                .report_filters
                .iter_mut()
                .chain(&mut context.page_filters)
                .chain(&mut context.visual_filters)
                .chain(&mut context.slicer_filters)
            {
                if filter.table.is_empty() {
                    continue;
                }
                let semantic = self.classifier.classify(&filter.table, &filter.column).await;
                if semantic.confidence > 0.80 {
                    filter.classification = semantic.classification;
                    filter.is_field_parameter =
                        semantic.classification == FilterClassification::FieldParameter;
                }
            }
        }

        Ok((visual, context))
    }

    /// Build the DAX query reproducing a visual
    pub async fn build_visual_query(
        &self,
        req: &VisualQueryRequest,
    ) -> EngineResult<VisualQueryResult> {
        let (visual, filter_context) = self
            .get_visual_filter_context(
                &req.page_name,
                req.visual_id.as_deref(),
                req.visual_name.as_deref(),
                req.include_slicers,
            )
            .await?;

        let target_measures: Vec<String> = match &req.measure_name {
            Some(name) => vec![bracket(name)],
            None => visual.measures.clone(),
        };
        if target_measures.is_empty() {
            return Err(crate::error::EngineError::InvalidDax(format!(
                "visual '{}' has no measures; pass measure_name explicitly",
                visual.visual_id
            )));
        }

        let all: Vec<&FilterExpression> = filter_context.all_filters();
        let dax_query = build_query(&target_measures, &visual.columns, &all);

        // optional measure expansion through the resolver
        let mut measure_definitions = Vec::new();
        let mut expanded_query = None;
        if req.expand_measures {
            measure_definitions = self.measures.get_measure_expressions(&target_measures).await;
            if !measure_definitions.is_empty() {
                expanded_query =
                    Some(build_expanded_query(&measure_definitions, &visual.columns, &all));
            }
        }

        // advisory relationship hints for the participating tables
        let relationship_hints = if self.executor.is_some() {
            let measure_tables: Vec<String> =
                measure_definitions.iter().filter_map(|m| m.table.clone()).collect();
            let filter_tables: Vec<String> = filter_context
                .data_filters()
                .iter()
                .map(|f| f.table.clone())
                .filter(|t| !t.is_empty())
                .collect();
            let grouping_tables: Vec<String> =
                visual.columns.iter().filter_map(|c| table_of_column_ref(c)).collect();
            self.relationships
                .analyze_query_tables(&measure_tables, &filter_tables, &grouping_tables)
                .await
        } else {
            Vec::new()
        };

        Ok(VisualQueryResult {
            measure_name: target_measures[0].clone(),
            visual,
            filter_context,
            dax_query,
            measure_definitions,
            expanded_query,
            relationship_hints,
        })
    }

    /// Detail rows: `TOPN(limit, CALCULATETABLE('Table', data filters))`
    pub async fn build_detail_rows_query(&self, req: &DetailRowsRequest) -> EngineResult<String> {
        let (visual, filter_context) = self
            .get_visual_filter_context(
                &req.page_name,
                req.visual_id.as_deref(),
                req.visual_name.as_deref(),
                req.include_slicers,
            )
            .await?;

        let table = match &req.fact_table {
            Some(t) => t.trim_matches('\'').to_string(),
            None => visual
                .columns
                .first()
                .and_then(|c| table_of_column_ref(c))
                .ok_or_else(|| {
                    crate::error::EngineError::InvalidDax(
                        "no fact table given and the visual has no columns to infer one from"
                            .to_string(),
                    )
                })?,
        };

        let limit = if req.limit == 0 { 100 } else { req.limit };
        let filter_dax: Vec<String> =
            filter_context.data_filters().iter().map(|f| f.dax.clone()).collect();

        Ok(if filter_dax.is_empty() {
            format!("EVALUATE\nTOPN(\n    {limit},\n    '{table}'\n)")
        } else {
            format!(
                "EVALUATE\nTOPN(\n    {limit},\n    CALCULATETABLE(\n        '{table}',\n        {}\n    )\n)",
                filter_dax.join(",\n        ")
            )
        })
    }
}

/// `[Name]` form of a measure reference
pub fn bracket(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        format!("[{trimmed}]")
    }
}

fn table_of_column_ref(column_ref: &str) -> Option<String> {
    let open = column_ref.find('[')?;
    let table = column_ref[..open].trim().trim_matches('\'');
    (!table.is_empty()).then(|| table.to_string())
}

/// Render the data filters, collapsing single-value In filters to `=`
pub fn render_filter_list(filters: &[&FilterExpression]) -> Vec<String> {
    filters
        .iter()
        .filter(|f| f.classification == FilterClassification::Data && !f.dax.is_empty())
        .map(|f| {
            if f.condition_type == ConditionType::In
                && f.values.len() == 1
                && !f.has_null_values
            {
                let column_ref = f.field_reference();
                match &f.values[0] {
                    TypedValue::Boolean(b) => {
                        format!("{column_ref} = {}", if *b { "TRUE" } else { "FALSE" })
                    }
                    value => format!("{column_ref} = {}", value.to_dax()),
                }
            } else {
                f.dax.clone()
            }
        })
        .collect()
}

/// Core query shape selection shared by plain and expanded emission
pub fn build_query(
    measures: &[String],
    grouping_columns: &[String],
    filters: &[&FilterExpression],
) -> String {
    let filter_list = render_filter_list(filters);

    let measure_parts: Vec<String> = measures
        .iter()
        .map(|m| format!("\"{}\", {m}", m.trim_matches(['[', ']'])))
        .collect();

    emit_query_shape(&measure_parts, measures, grouping_columns, &filter_list)
}

/// Expanded emission: measure DAX inlined inside CALCULATE(filters)
pub fn build_expanded_query(
    definitions: &[MeasureDefinition],
    grouping_columns: &[String],
    filters: &[&FilterExpression],
) -> String {
    let filter_list = render_filter_list(filters);

    let measure_parts: Vec<String> = definitions
        .iter()
        .map(|def| {
            let expr = def.expression.trim();
            if filter_list.is_empty() {
                format!("\"{}\",\n    {expr}", def.name)
            } else {
                format!(
                    "\"{}\",\n    CALCULATE(\n        {expr},\n        {}\n    )",
                    def.name,
                    filter_list.join(",\n        ")
                )
            }
        })
        .collect();

    let plain: Vec<String> =
        definitions.iter().map(|d| format!("[{}]", d.name)).collect();
    emit_query_shape(&measure_parts, &plain, grouping_columns, &filter_list)
}

fn emit_query_shape(
    measure_parts: &[String],
    measures: &[String],
    grouping_columns: &[String],
    filter_list: &[String],
) -> String {
    if !grouping_columns.is_empty() {
        let mut tables: Vec<String> =
            grouping_columns.iter().filter_map(|c| table_of_column_ref(c)).collect();
        tables.sort();
        tables.dedup();

        let columns_str = grouping_columns.join(",\n            ");
        let measures_str = measure_parts.join(",\n        ");

        let single_table = (tables.len() == 1).then(|| format!("'{}'", tables[0]));

        return match (single_table, filter_list.is_empty()) {
            (Some(table), false) => format!(
                "EVALUATE\nCALCULATETABLE(\n    ADDCOLUMNS(\n        SUMMARIZE(\n            {table},\n            {columns_str}\n        ),\n        {measures_str}\n    ),\n    {}\n)",
                filter_list.join(",\n    ")
            ),
            (Some(table), true) => format!(
                "EVALUATE\nADDCOLUMNS(\n    SUMMARIZE(\n        {table},\n        {columns}\n    ),\n    {measures}\n)",
                columns = grouping_columns.join(",\n        "),
                measures = measure_parts.join(",\n    ")
            ),
            (None, false) => format!(
                "EVALUATE\nCALCULATETABLE(\n    SUMMARIZECOLUMNS(\n        {columns_str},\n        {measures_str}\n    ),\n    {}\n)",
                filter_list.join(",\n    ")
            ),
            (None, true) => format!(
                "EVALUATE\nSUMMARIZECOLUMNS(\n    {columns},\n    {measures}\n)",
                columns = grouping_columns.join(",\n    "),
                measures = measure_parts.join(",\n    ")
            ),
        };
    }

    // no grouping: ROW query
    if measures.len() == 1 {
        let measure = &measures[0];
        if filter_list.is_empty() {
            format!("EVALUATE\nROW(\"Value\", {measure})")
        } else {
            format!(
                "EVALUATE\nROW(\n    \"Value\", CALCULATE({measure}, {})\n)",
                filter_list.join(", ")
            )
        }
    } else {
        let parts: Vec<String> = measures
            .iter()
            .map(|m| {
                let alias = m.trim_matches(['[', ']']);
                if filter_list.is_empty() {
                    format!("\"{alias}\", {m}")
                } else {
                    format!("\"{alias}\", CALCULATE({m}, {})", filter_list.join(", "))
                }
            })
            .collect();
        format!("EVALUATE\nROW(\n    {}\n)", parts.join(",\n    "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::filters::{FilterSource, SelectionMode};

    fn slicer_filter(table: &str, column: &str, value: &str) -> FilterExpression {
        let converter = FilterConverter::new();
        converter
            .convert_slicer(&SlicerState {
                slicer_id: "s".into(),
                page_name: "p".into(),
                table: table.into(),
                column: column.into(),
                field_reference: format!("'{table}'[{column}]"),
                selected_values: vec![TypedValue::parse_literal(value)],
                selection_mode: SelectionMode::MultiSelect,
                is_inverted: false,
            })
            .unwrap()
    }

    fn collapse_ws(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_single_table_grouping_uses_summarize() {
        let filter = slicer_filter("Product", "Category", "'Bikes'L");
        let filters: Vec<&FilterExpression> = vec![&filter];
        let query = build_query(
            &["[Total Sales]".to_string()],
            &["'Date'[Year]".to_string()],
            &filters,
        );

        assert_eq!(
            collapse_ws(&query),
            "EVALUATE CALCULATETABLE( ADDCOLUMNS( SUMMARIZE( 'Date', 'Date'[Year] ), \
             \"Total Sales\", [Total Sales] ), 'Product'[Category] = \"Bikes\" )"
        );
    }

    #[test]
    fn test_multi_table_grouping_uses_summarizecolumns() {
        let filter = slicer_filter("Product", "Category", "'Bikes'L");
        let filters: Vec<&FilterExpression> = vec![&filter];
        let query = build_query(
            &["[Total Sales]".to_string()],
            &["'Date'[Year]".to_string(), "'Region'[Name]".to_string()],
            &filters,
        );
        assert!(query.contains("SUMMARIZECOLUMNS"));
        assert!(query.starts_with("EVALUATE\nCALCULATETABLE("));
    }

    #[test]
    fn test_no_grouping_uses_row() {
        let filter = slicer_filter("Product", "Category", "'Bikes'L");
        let filters: Vec<&FilterExpression> = vec![&filter];
        let query = build_query(&["[Total Sales]".to_string()], &[], &filters);
        assert_eq!(
            collapse_ws(&query),
            "EVALUATE ROW( \"Value\", CALCULATE([Total Sales], 'Product'[Category] = \"Bikes\") )"
        );
    }

    #[test]
    fn test_field_parameter_filters_excluded() {
        let data = slicer_filter("Product", "Category", "'Bikes'L");
        let field_param = slicer_filter("sf Slicer 1", "Value", "'Revenue'L");
        let filters: Vec<&FilterExpression> = vec![&data, &field_param];

        let query = build_query(&["[Total Sales]".to_string()], &[], &filters);
        assert!(query.contains("'Product'[Category]"));
        assert!(!query.contains("sf Slicer 1"));
    }

    #[test]
    fn test_single_value_collapse_variants() {
        let boolean = slicer_filter("Flags", "Active", "trueL");
        let number = slicer_filter("Date", "Year", "2024L");
        let text = slicer_filter("Region", "Code", "'0'L");
        let filters: Vec<&FilterExpression> = vec![&boolean, &number, &text];

        let rendered = render_filter_list(&filters);
        assert_eq!(rendered[0], "'Flags'[Active] = TRUE");
        assert_eq!(rendered[1], "'Date'[Year] = 2024");
        assert_eq!(rendered[2], "'Region'[Code] = \"0\"");
    }

    #[test]
    fn test_multi_value_filter_keeps_in_clause() {
        let converter = FilterConverter::new();
        let filter = converter
            .convert_slicer(&SlicerState {
                slicer_id: "s".into(),
                page_name: "p".into(),
                table: "Region".into(),
                column: "Code".into(),
                field_reference: "'Region'[Code]".into(),
                selected_values: vec![
                    TypedValue::parse_literal("'EU'L"),
                    TypedValue::parse_literal("'US'L"),
                ],
                selection_mode: SelectionMode::MultiSelect,
                is_inverted: false,
            })
            .unwrap();
        let filters: Vec<&FilterExpression> = vec![&filter];
        let rendered = render_filter_list(&filters);
        assert_eq!(rendered[0], "'Region'[Code] IN {\"EU\", \"US\"}");
    }

    #[test]
    fn test_multiple_measures_row_query() {
        let query = build_query(
            &["[Total Sales]".to_string(), "[Profit]".to_string()],
            &[],
            &[],
        );
        assert_eq!(
            collapse_ws(&query),
            "EVALUATE ROW( \"Total Sales\", [Total Sales], \"Profit\", [Profit] )"
        );
    }
}
