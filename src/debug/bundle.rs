//! Report bundle reader
//!
//! Walks a PBIP report directory: `definition/report.json` for report
//! filters, `definition/pages/<pid>/page.json` for page metadata and
//! filters, and `definition/pages/<pid>/visuals/<vid>/visual.json` for
//! visual definitions including saved slicer state. A root that directly
//! contains `report.json` is accepted as its own definition directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::debug::filters::{SelectionMode, SlicerState};
use crate::debug::literal::TypedValue;
use crate::error::{EngineError, EngineResult};

/// Visual types acting as slicers
pub const SLICER_VISUAL_TYPES: &[&str] = &["slicer", "advancedSlicerVisual"];

/// Visual types that are layout/UI elements rather than data visuals
pub const UI_VISUAL_TYPES: &[&str] = &[
    "shape",
    "basicShape",
    "image",
    "textbox",
    "button",
    "actionButton",
    "bookmarkNavigator",
    "pageNavigator",
    "navigatorButton",
    "visualGroup",
    "group",
    "slicer",
    "advancedSlicerVisual",
    "multiRowCard",
];

/// Projection buckets scanned for measures and columns
const PROJECTION_TYPES: &[&str] =
    &["Values", "Y", "Rows", "Columns", "Category", "X", "Size", "Legend", "Tooltips"];

/// Page identity and ordering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInfo {
    pub id: String,
    pub name: String,
    pub ordinal: i64,
}

/// Summary of one visual on a page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualSummary {
    pub id: String,
    pub name: String,
    pub friendly_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub visual_type: String,
    pub type_display: String,
    pub is_slicer: bool,
    pub is_visual_group: bool,
    pub is_data_visual: bool,
    pub measures: Vec<String>,
    pub columns: Vec<String>,
    /// Raw visual-level filter definitions
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub filters: Vec<Value>,
}

/// Full parse of one target visual
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualInfo {
    pub visual_id: String,
    pub visual_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_name: Option<String>,
    pub page_name: String,
    pub page_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// `[Measure]` references in projection order
    pub measures: Vec<String>,
    /// `'Table'[Column]` references in projection order
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub filters: Vec<Value>,
}

/// Staleness warning for the on-disk bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbipWarning {
    pub stale: bool,
    pub age_minutes: f64,
    pub message: String,
    pub hint: String,
}

/// On-disk report bundle
pub struct ReportBundle {
    root: PathBuf,
    definition: PathBuf,
    page_paths: DashMap<String, Option<PathBuf>>,
    report_filters: DashMap<(), Vec<Value>>,
    page_filters: DashMap<String, Vec<Value>>,
    slicers: DashMap<String, Vec<SlicerState>>,
}

impl ReportBundle {
    /// Open a bundle rooted at a directory containing `definition/` or
    /// `report.json` directly
    pub fn open(root: impl Into<PathBuf>) -> EngineResult<Self> {
        let root = root.into();
        let nested = root.join("definition");
        let definition = if nested.is_dir() {
            nested
        } else if root.join("report.json").is_file() {
            root.clone()
        } else {
            return Err(EngineError::BundleMalformed(format!(
                "{} contains neither a definition/ directory nor report.json",
                root.display()
            )));
        };

        Ok(Self {
            root,
            definition,
            page_paths: DashMap::new(),
            report_filters: DashMap::new(),
            page_filters: DashMap::new(),
            slicers: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sibling `<name>.SemanticModel/definition` directory, if present
    pub fn semantic_model_dir(&self) -> Option<PathBuf> {
        let root_str = self.root.to_string_lossy();
        if root_str.contains(".Report") {
            let candidate =
                PathBuf::from(root_str.replace(".Report", ".SemanticModel")).join("definition");
            if candidate.is_dir() {
                return Some(candidate);
            }
        }

        for relative in ["definition/tables", "definition/model", "model/definition/tables"] {
            let candidate = self.root.join(relative);
            if candidate.is_dir() {
                return candidate.parent().map(Path::to_path_buf);
            }
        }

        None
    }

    /// Pages sorted by ordinal
    pub fn list_pages(&self) -> EngineResult<Vec<PageInfo>> {
        let pages_dir = self.definition.join("pages");
        let mut pages = Vec::new();

        if !pages_dir.is_dir() {
            return Ok(pages);
        }

        for entry in std::fs::read_dir(&pages_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let page_json = entry.path().join("page.json");
            let Ok(data) = read_json(&page_json) else { continue };

            let folder_name = entry.file_name().to_string_lossy().to_string();
            pages.push(PageInfo {
                name: data
                    .get("displayName")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| folder_name.clone()),
                id: folder_name,
                ordinal: data.get("ordinal").and_then(Value::as_i64).unwrap_or(0),
            });
        }

        pages.sort_by_key(|p| p.ordinal);
        Ok(pages)
    }

    /// Resolve a page folder by display name (case-insensitive, cached)
    pub fn find_page(&self, page_name: &str) -> EngineResult<PathBuf> {
        let cache_key = page_name.to_lowercase();
        if let Some(hit) = self.page_paths.get(&cache_key) {
            return hit.clone().ok_or_else(|| page_not_found(page_name, self));
        }

        let pages_dir = self.definition.join("pages");
        let mut found = None;
        if pages_dir.is_dir() {
            for entry in std::fs::read_dir(&pages_dir)? {
                let entry = entry?;
                if !entry.path().is_dir() {
                    continue;
                }
                if self.page_display_name(&entry.path()).to_lowercase() == cache_key {
                    found = Some(entry.path());
                    break;
                }
            }
        }

        self.page_paths.insert(cache_key, found.clone());
        found.ok_or_else(|| page_not_found(page_name, self))
    }

    fn page_display_name(&self, page_path: &Path) -> String {
        read_json(&page_path.join("page.json"))
            .ok()
            .and_then(|d| d.get("displayName").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| {
                page_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            })
    }

    /// Report-level filter definitions (cached)
    pub fn report_filters(&self) -> Vec<Value> {
        if let Some(hit) = self.report_filters.get(&()) {
            return hit.clone();
        }

        let filters = read_json(&self.definition.join("report.json"))
            .ok()
            .and_then(|d| {
                d.pointer("/filterConfig/filters").and_then(Value::as_array).cloned()
            })
            .unwrap_or_default();

        self.report_filters.insert((), filters.clone());
        filters
    }

    /// Page-level filter definitions (cached per page)
    pub fn page_filters(&self, page_path: &Path) -> Vec<Value> {
        let cache_key = page_path.to_string_lossy().to_string();
        if let Some(hit) = self.page_filters.get(&cache_key) {
            return hit.clone();
        }

        let filters = read_json(&page_path.join("page.json"))
            .ok()
            .and_then(|d| {
                d.pointer("/filterConfig/filters").and_then(Value::as_array).cloned()
            })
            .unwrap_or_default();

        self.page_filters.insert(cache_key, filters.clone());
        filters
    }

    /// Every visual on a page, optionally dropping UI elements
    pub fn list_visuals(
        &self,
        page_name: &str,
        include_ui: bool,
    ) -> EngineResult<Vec<VisualSummary>> {
        let page_path = self.find_page(page_name)?;
        let visuals_dir = page_path.join("visuals");
        let mut visuals = Vec::new();

        if !visuals_dir.is_dir() {
            return Ok(visuals);
        }

        for entry in std::fs::read_dir(&visuals_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(data) = read_json(&entry.path().join("visual.json")) else { continue };

            let summary =
                summarize_visual(&data, &entry.file_name().to_string_lossy());
            if !include_ui && !summary.is_data_visual {
                continue;
            }
            visuals.push(summary);
        }

        Ok(visuals)
    }

    /// Find and fully parse a visual by id, stored name, title, friendly
    /// name, substring, or type name (in that order)
    pub fn find_visual(
        &self,
        page_name: &str,
        visual_id: Option<&str>,
        visual_name: Option<&str>,
    ) -> EngineResult<VisualInfo> {
        let page_path = self.find_page(page_name)?;
        let page_display = self.page_display_name(&page_path);
        let page_id = page_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let visuals_dir = page_path.join("visuals");

        let not_found = || {
            EngineError::VisualNotFound(format!(
                "id={:?}, name={:?} on page '{page_name}'",
                visual_id, visual_name
            ))
        };

        if !visuals_dir.is_dir() {
            return Err(not_found());
        }

        let mut candidates: Vec<(String, Value)> = Vec::new();
        for entry in std::fs::read_dir(&visuals_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Ok(data) = read_json(&entry.path().join("visual.json")) {
                candidates.push((entry.file_name().to_string_lossy().to_string(), data));
            }
        }

        // pass 1: exact id
        if let Some(id) = visual_id {
            if let Some((vid, data)) = candidates.iter().find(|(vid, _)| vid == id) {
                return Ok(parse_visual_info(data, vid, &page_display, &page_id));
            }
        }

        let Some(wanted) = visual_name.map(|n| n.trim().to_lowercase()) else {
            return Err(not_found());
        };

        // pass 2: exact stored name / title / friendly name
        for (vid, data) in &candidates {
            let summary = summarize_visual(data, vid);
            let exact = summary.name.to_lowercase() == wanted
                || summary.title.as_deref().map(|t| t.to_lowercase()) == Some(wanted.clone())
                || summary.friendly_name.to_lowercase() == wanted;
            if exact {
                return Ok(parse_visual_info(data, vid, &page_display, &page_id));
            }
        }

        // pass 3: substring on title/friendly name, then type-name match
        for (vid, data) in &candidates {
            let summary = summarize_visual(data, vid);
            let partial = summary
                .title
                .as_deref()
                .map(|t| t.to_lowercase().contains(&wanted))
                .unwrap_or(false)
                || summary.friendly_name.to_lowercase().contains(&wanted)
                || summary.type_display.to_lowercase() == wanted
                || summary.visual_type.to_lowercase() == wanted;
            if partial {
                return Ok(parse_visual_info(data, vid, &page_display, &page_id));
            }
        }

        Err(not_found())
    }

    /// Slicers with their saved selections, cached per page
    pub fn page_slicers(&self, page_name: &str) -> EngineResult<Vec<SlicerState>> {
        let cache_key = page_name.to_lowercase();
        if let Some(hit) = self.slicers.get(&cache_key) {
            return Ok(hit.clone());
        }

        let page_path = self.find_page(page_name)?;
        let page_display = self.page_display_name(&page_path);
        let visuals_dir = page_path.join("visuals");
        let mut slicers = Vec::new();

        if visuals_dir.is_dir() {
            for entry in std::fs::read_dir(&visuals_dir)? {
                let entry = entry?;
                if !entry.path().is_dir() {
                    continue;
                }
                let Ok(data) = read_json(&entry.path().join("visual.json")) else { continue };

                let visual_type = data
                    .pointer("/visual/visualType")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                if !SLICER_VISUAL_TYPES.contains(&visual_type) {
                    continue;
                }

                if let Some(state) = parse_slicer_state(
                    &data,
                    &entry.file_name().to_string_lossy(),
                    &page_display,
                ) {
                    slicers.push(state);
                }
            }
        }

        self.slicers.insert(cache_key, slicers.clone());
        Ok(slicers)
    }

    /// Slicers across every page, or one page when `page_name` is given
    pub fn list_slicers(&self, page_name: Option<&str>) -> EngineResult<Vec<SlicerState>> {
        match page_name {
            Some(name) => self.page_slicers(name),
            None => {
                let mut all = Vec::new();
                for page in self.list_pages()? {
                    all.extend(self.page_slicers(&page.name)?);
                }
                Ok(all)
            }
        }
    }

    /// Warn when no bundle file changed within the threshold: Power BI
    /// Desktop only flushes slicer state on save
    pub fn freshness_warning(&self, threshold_minutes: f64) -> Option<PbipWarning> {
        let mut latest: Option<SystemTime> = None;
        collect_latest_mtime(&self.root, &mut latest, 0);

        let latest = latest?;
        let age_secs = latest.elapsed().ok()?.as_secs_f64();
        let age_minutes = age_secs / 60.0;

        if age_minutes <= threshold_minutes {
            return None;
        }

        let rounded = (age_minutes * 10.0).round() / 10.0;
        Some(PbipWarning {
            stale: true,
            age_minutes: rounded,
            message: format!(
                "Report bundle files are {rounded} minutes old. Save the report so slicer state \
                 on disk matches what you see."
            ),
            hint: "Pass manual filters to override saved slicer values if needed.".to_string(),
        })
    }

    /// Drop all cached page/filter/slicer state
    pub fn reset(&self) {
        self.page_paths.clear();
        self.report_filters.clear();
        self.page_filters.clear();
        self.slicers.clear();
    }
}

fn page_not_found(page_name: &str, bundle: &ReportBundle) -> EngineError {
    let known = bundle
        .list_pages()
        .map(|pages| pages.into_iter().map(|p| p.name).collect::<Vec<_>>().join(", "))
        .unwrap_or_default();
    EngineError::PageNotFound(format!("'{page_name}' (available: {known})"))
}

fn read_json(path: &Path) -> EngineResult<Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EngineError::BundleMalformed(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| EngineError::BundleMalformed(format!("{}: {e}", path.display())))
}

fn collect_latest_mtime(dir: &Path, latest: &mut Option<SystemTime>, depth: usize) {
    if depth > 8 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_latest_mtime(&path, latest, depth + 1);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json") | Some("tmdl")
        ) {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if latest.map(|l| modified > l).unwrap_or(true) {
                    *latest = Some(modified);
                }
            }
        }
    }
}

/// Extract measures/columns from the visual's query projections
fn extract_visual_fields(visual: &Value) -> (Vec<String>, Vec<String>) {
    let mut measures = Vec::new();
    let mut columns = Vec::new();

    for proj_type in PROJECTION_TYPES {
        let Some(projections) = visual
            .pointer(&format!("/query/queryState/{proj_type}/projections"))
            .and_then(Value::as_array)
        else {
            continue;
        };

        for proj in projections {
            let Some(field) = proj.get("field") else { continue };

            if let Some(measure) = field.get("Measure") {
                if let Some(prop) = measure.get("Property").and_then(Value::as_str) {
                    let reference = format!("[{prop}]");
                    if !measures.contains(&reference) {
                        measures.push(reference);
                    }
                }
            }

            if let Some(column) = field.get("Column") {
                let table = column
                    .pointer("/Expression/SourceRef/Entity")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let prop = column.get("Property").and_then(Value::as_str).unwrap_or("");
                if !table.is_empty() && !prop.is_empty() {
                    let reference = format!("'{table}'[{prop}]");
                    if !columns.contains(&reference) {
                        columns.push(reference);
                    }
                }
            }
        }
    }

    (measures, columns)
}

/// Title from `visualContainerObjects.title` or legacy `vcObjects.title`
fn extract_visual_title(visual: &Value) -> Option<String> {
    let from_expr = |v: &Value| -> Option<String> {
        let title = v
            .pointer("/0/properties/text/expr/Literal/Value")
            .and_then(Value::as_str)?
            .trim_matches(['\'', '"'])
            .to_string();
        (!title.is_empty()).then_some(title)
    };

    if let Some(config) = visual.pointer("/visualContainerObjects/title") {
        if let Some(title) = from_expr(config) {
            return Some(title);
        }
    }
    if let Some(config) = visual.pointer("/vcObjects/title") {
        if let Some(text) = config.pointer("/0/properties/text").and_then(Value::as_str) {
            return Some(text.trim_matches(['\'', '"']).to_string());
        }
        if let Some(title) = from_expr(config) {
            return Some(title);
        }
    }
    None
}

fn visual_type_display(visual_type: &str) -> String {
    match visual_type {
        "pivotTable" => "Matrix".to_string(),
        "tableEx" => "Table".to_string(),
        "columnChart" => "Column Chart".to_string(),
        "barChart" => "Bar Chart".to_string(),
        "lineChart" => "Line Chart".to_string(),
        "areaChart" => "Area Chart".to_string(),
        "lineStackedColumnComboChart" => "Combo Chart".to_string(),
        "clusteredBarChart" => "Clustered Bar".to_string(),
        "clusteredColumnChart" => "Clustered Column".to_string(),
        "stackedBarChart" => "Stacked Bar".to_string(),
        "stackedColumnChart" => "Stacked Column".to_string(),
        "pieChart" => "Pie Chart".to_string(),
        "donutChart" => "Donut Chart".to_string(),
        "treemap" => "Treemap".to_string(),
        "card" => "Card".to_string(),
        "multiRowCard" => "Multi-row Card".to_string(),
        "kpi" => "KPI".to_string(),
        "gauge" => "Gauge".to_string(),
        "scatterChart" => "Scatter Chart".to_string(),
        "funnel" => "Funnel".to_string(),
        "waterfallChart" => "Waterfall".to_string(),
        "slicer" => "Slicer".to_string(),
        "advancedSlicerVisual" => "Advanced Slicer".to_string(),
        "textbox" => "Text Box".to_string(),
        "image" => "Image".to_string(),
        "shape" => "Shape".to_string(),
        "actionButton" => "Button".to_string(),
        "bookmarkNavigator" => "Bookmark Navigator".to_string(),
        "pageNavigator" => "Page Navigator".to_string(),
        "visualGroup" => "Visual Group".to_string(),
        "unknown" => "Unknown".to_string(),
        other => other.replace("Chart", " Chart"),
    }
}

fn build_friendly_name(
    title: Option<&str>,
    visual_type: &str,
    measures: &[String],
    columns: &[String],
    visual_id: &str,
) -> String {
    if let Some(title) = title {
        return title.to_string();
    }

    let type_display = visual_type_display(visual_type);
    let label = |items: &[String]| {
        let first = items[0].trim_matches(['[', ']']).to_string();
        if items.len() > 1 {
            format!("{type_display}: {first} (+{})", items.len() - 1)
        } else {
            format!("{type_display}: {first}")
        }
    };

    if !measures.is_empty() {
        return label(measures);
    }
    if !columns.is_empty() {
        return label(columns);
    }

    let short_id: String = visual_id.chars().take(8).collect();
    format!("{type_display} ({short_id})")
}

/// Is this a data-bearing visual (vs a layout/UI element)?
fn is_data_visual(visual_type: &str, data: &Value, visual: &Value) -> bool {
    if data.get("visualGroup").is_some() {
        return false;
    }
    if visual_type.is_empty() || visual_type == "unknown" {
        return false;
    }
    if UI_VISUAL_TYPES.iter().any(|t| t.eq_ignore_ascii_case(visual_type)) {
        return false;
    }

    // single-field cards showing context (a date, a user) are UI; cards with
    // measures carry data
    if visual_type.eq_ignore_ascii_case("card") {
        let (measures, _) = extract_visual_fields(visual);
        return !measures.is_empty();
    }

    // unknown types count as data only when they carry query projections
    visual
        .pointer("/query/queryState")
        .map(|qs| PROJECTION_TYPES.iter().any(|p| qs.get(*p).is_some()))
        .unwrap_or(false)
}

fn summarize_visual(data: &Value, visual_id: &str) -> VisualSummary {
    let is_visual_group = data.get("visualGroup").is_some();
    let empty = Value::Object(Default::default());
    let visual = data.get("visual").unwrap_or(&empty);

    let (visual_type, title) = if is_visual_group {
        let title = data
            .pointer("/visualGroup/displayName")
            .and_then(Value::as_str)
            .map(str::to_string);
        ("visualGroup".to_string(), title)
    } else {
        let vt = visual
            .get("visualType")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let title = extract_visual_title(visual);
        (vt, title)
    };

    let (measures, columns) = extract_visual_fields(visual);
    let filters = visual
        .get("filters")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    VisualSummary {
        friendly_name: build_friendly_name(
            title.as_deref(),
            &visual_type,
            &measures,
            &columns,
            visual_id,
        ),
        id: visual_id.to_string(),
        name: data.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
        type_display: visual_type_display(&visual_type),
        is_slicer: SLICER_VISUAL_TYPES.contains(&visual_type.as_str()),
        is_visual_group,
        is_data_visual: is_data_visual(&visual_type, data, visual),
        measures,
        columns,
        filters,
        title,
        visual_type,
    }
}

fn parse_visual_info(data: &Value, visual_id: &str, page_name: &str, page_id: &str) -> VisualInfo {
    let empty = Value::Object(Default::default());
    let visual = data.get("visual").unwrap_or(&empty);
    let (measures, columns) = extract_visual_fields(visual);

    VisualInfo {
        visual_id: visual_id.to_string(),
        visual_type: visual
            .get("visualType")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        visual_name: data.get("name").and_then(Value::as_str).map(str::to_string),
        page_name: page_name.to_string(),
        page_id: page_id.to_string(),
        title: extract_visual_title(visual),
        measures,
        columns,
        filters: visual
            .get("filters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    }
}

/// Parse a slicer visual's field binding and saved selection
fn parse_slicer_state(data: &Value, visual_id: &str, page_name: &str) -> Option<SlicerState> {
    let visual = data.get("visual")?;

    let projection = visual
        .pointer("/query/queryState/Values/projections/0/field/Column")?;
    let table = projection
        .pointer("/Expression/SourceRef/Entity")
        .and_then(Value::as_str)?
        .to_string();
    let column = projection.get("Property").and_then(Value::as_str)?.to_string();

    let literal_bool = |path: &str| -> bool {
        visual
            .pointer(path)
            .and_then(Value::as_str)
            .map(|v| v == "true")
            .unwrap_or(false)
    };

    // version differences: singleSelect vs strictSingleSelect
    let single_select = literal_bool(
        "/objects/selection/0/properties/singleSelect/expr/Literal/Value",
    ) || literal_bool(
        "/objects/selection/0/properties/strictSingleSelect/expr/Literal/Value",
    );
    let is_inverted = literal_bool(
        "/objects/data/0/properties/isInvertedSelectionMode/expr/Literal/Value",
    );

    let mut selected_values = Vec::new();
    if let Some(where_clauses) = visual
        .pointer("/objects/general/0/properties/filter/filter/Where")
        .and_then(Value::as_array)
    {
        for clause in where_clauses {
            let Some(groups) =
                clause.pointer("/Condition/In/Values").and_then(Value::as_array)
            else {
                continue;
            };
            for group in groups {
                let Some(items) = group.as_array() else { continue };
                for item in items {
                    if let Some(raw) = item.pointer("/Literal/Value") {
                        selected_values.push(TypedValue::from_json(raw));
                    }
                }
            }
        }
    }

    let selection_mode = if is_inverted && single_select {
        SelectionMode::SingleSelectAll
    } else if single_select {
        SelectionMode::SingleSelect
    } else {
        SelectionMode::MultiSelect
    };

    tracing::debug!(
        slicer = visual_id,
        table,
        column,
        values = selected_values.len(),
        ?selection_mode,
        "parsed slicer state"
    );

    Some(SlicerState {
        slicer_id: visual_id.to_string(),
        page_name: page_name.to_string(),
        field_reference: format!("'{table}'[{column}]"),
        table,
        column,
        selected_values,
        selection_mode,
        is_inverted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(path: &Path, value: &Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    }

    /// Build a minimal bundle on disk and return its root
    fn scaffold_bundle(tag: &str) -> PathBuf {
        let root = std::env::temp_dir()
            .join("daxlens-bundle-tests")
            .join(format!("{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);

        write(
            &root.join("definition/report.json"),
            &json!({"filterConfig": {"filters": [{
                "target": {"table": "Scope", "column": "Region"},
                "filter": {"Where": [{"Condition": {"In": {"Values": [[{"Literal": {"Value": "'EMEA'L"}}]]}}}]}
            }]}}),
        );
        write(
            &root.join("definition/pages/p1/page.json"),
            &json!({"displayName": "Overview", "ordinal": 1, "filterConfig": {"filters": []}}),
        );
        write(
            &root.join("definition/pages/p0/page.json"),
            &json!({"displayName": "Detail", "ordinal": 0}),
        );
        write(
            &root.join("definition/pages/p1/visuals/v1/visual.json"),
            &json!({
                "name": "salesByYear",
                "visual": {
                    "visualType": "columnChart",
                    "query": {"queryState": {
                        "Y": {"projections": [{"field": {"Measure": {
                            "Expression": {"SourceRef": {"Entity": "Sales"}},
                            "Property": "Total Sales"
                        }}}]},
                        "Category": {"projections": [{"field": {"Column": {
                            "Expression": {"SourceRef": {"Entity": "Date"}},
                            "Property": "Year"
                        }}}]}
                    }},
                    "visualContainerObjects": {"title": [{"properties": {"text": {"expr": {"Literal": {"Value": "'Sales by Year'"}}}}}]},
                    "filters": []
                }
            }),
        );
        write(
            &root.join("definition/pages/p1/visuals/s1/visual.json"),
            &json!({
                "name": "categorySlicer",
                "visual": {
                    "visualType": "slicer",
                    "query": {"queryState": {"Values": {"projections": [{"field": {"Column": {
                        "Expression": {"SourceRef": {"Entity": "Product"}},
                        "Property": "Category"
                    }}}]}}},
                    "objects": {
                        "general": [{"properties": {"filter": {"filter": {"Where": [{
                            "Condition": {"In": {"Values": [[{"Literal": {"Value": "'Bikes'L"}}]]}}
                        }]}}}}],
                        "selection": [{"properties": {"singleSelect": {"expr": {"Literal": {"Value": "false"}}}}}]
                    }
                }
            }),
        );
        write(
            &root.join("definition/pages/p1/visuals/u1/visual.json"),
            &json!({"name": "logo", "visual": {"visualType": "image"}}),
        );

        root
    }

    #[test]
    fn test_pages_sorted_by_ordinal() {
        let bundle = ReportBundle::open(scaffold_bundle("pages")).unwrap();
        let pages = bundle.list_pages().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].name, "Detail");
        assert_eq!(pages[1].name, "Overview");
    }

    #[test]
    fn test_visual_lookup_and_fields() {
        let bundle = ReportBundle::open(scaffold_bundle("lookup")).unwrap();

        let by_id = bundle.find_visual("Overview", Some("v1"), None).unwrap();
        assert_eq!(by_id.measures, vec!["[Total Sales]"]);
        assert_eq!(by_id.columns, vec!["'Date'[Year]"]);
        assert_eq!(by_id.title.as_deref(), Some("Sales by Year"));

        let by_title = bundle.find_visual("Overview", None, Some("Sales by Year")).unwrap();
        assert_eq!(by_title.visual_id, "v1");

        let by_substring = bundle.find_visual("Overview", None, Some("sales by")).unwrap();
        assert_eq!(by_substring.visual_id, "v1");

        let err = bundle.find_visual("Overview", Some("missing"), None).unwrap_err();
        assert!(matches!(err, EngineError::VisualNotFound(_)));
    }

    #[test]
    fn test_page_not_found_lists_pages() {
        let bundle = ReportBundle::open(scaffold_bundle("notfound")).unwrap();
        let err = bundle.find_page("Nope").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Overview"));
        assert!(text.contains("Detail"));
    }

    #[test]
    fn test_slicer_state_parsed() {
        let bundle = ReportBundle::open(scaffold_bundle("slicers")).unwrap();
        let slicers = bundle.page_slicers("Overview").unwrap();
        assert_eq!(slicers.len(), 1);

        let s = &slicers[0];
        assert_eq!(s.table, "Product");
        assert_eq!(s.column, "Category");
        assert_eq!(s.selection_mode, SelectionMode::MultiSelect);
        assert!(!s.is_inverted);
        assert_eq!(s.selected_values.len(), 1);
    }

    #[test]
    fn test_ui_elements_filtered() {
        let bundle = ReportBundle::open(scaffold_bundle("ui")).unwrap();
        let all = bundle.list_visuals("Overview", true).unwrap();
        let data_only = bundle.list_visuals("Overview", false).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(data_only.len(), 1);
        assert_eq!(data_only[0].id, "v1");
    }

    #[test]
    fn test_report_filters_loaded() {
        let bundle = ReportBundle::open(scaffold_bundle("filters")).unwrap();
        assert_eq!(bundle.report_filters().len(), 1);
    }

    #[test]
    fn test_freshness_of_new_files_is_clean() {
        let bundle = ReportBundle::open(scaffold_bundle("fresh")).unwrap();
        // just-written files are younger than the 5 minute threshold
        assert!(bundle.freshness_warning(5.0).is_none());
        // a zero threshold flags them
        assert!(bundle.freshness_warning(0.0).is_some());
    }

    #[test]
    fn test_open_rejects_non_bundle() {
        let dir = std::env::temp_dir().join("daxlens-not-a-bundle");
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            ReportBundle::open(&dir),
            Err(EngineError::BundleMalformed(_))
        ));
    }
}
