//! Lexical normalizer and structural scanner for DAX expressions
//!
//! This is deliberately not a full DAX grammar. It provides the structural
//! primitives the analysis passes share: comment stripping that preserves
//! byte offsets, function-call location with balanced-paren matching,
//! top-level comma splitting, measure/column reference extraction, and
//! VAR/RETURN block bounding. String literals, quoted table names, and
//! bracketed identifiers are treated as opaque throughout.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors from lexical scanning
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("unterminated block comment at offset {offset}")]
    MalformedComment { offset: usize },

    #[error("unbalanced parenthesis at offset {offset}")]
    Unbalanced { offset: usize },
}

pub type ScanResult<T> = Result<T, ScanError>;

/// A located function call: `name_start..close_paren+1` spans the whole call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    /// Upper-cased function name
    pub name: String,
    pub name_start: usize,
    pub open_paren: usize,
    pub close_paren: usize,
}

/// A bare `[Name]` measure reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureRef {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

/// A `'Table'[Column]` or `Table[Column]` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
    pub start: usize,
    pub end: usize,
}

/// A `VAR <name> = <definition>` header with its bounded definition slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDef {
    pub name: String,
    /// Offset of the `VAR` keyword
    pub var_start: usize,
    pub def_start: usize,
    pub def_end: usize,
}

static FUNCTION_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_.]*)\s*\(").unwrap());

static VAR_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bVAR\s+([A-Za-z_][A-Za-z0-9_]*)\s*=").unwrap());

static RETURN_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bRETURN\b").unwrap());

static COLUMN_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:'([^']+)'|\b([A-Za-z_][A-Za-z0-9_]*))\s*\[([^\]\[]+)\]").unwrap());

/// Iterator functions that introduce row context
pub const ITERATOR_FUNCTIONS: &[&str] = &[
    "SUMX",
    "AVERAGEX",
    "MINX",
    "MAXX",
    "COUNTX",
    "FILTER",
    "ADDCOLUMNS",
    "SELECTCOLUMNS",
    "RANKX",
    "CONCATENATEX",
    "PRODUCTX",
    "STDEVX.S",
    "STDEVX.P",
    "VARX.S",
    "VARX.P",
    "TOPN",
    "SAMPLE",
];

/// Functions that perform an explicit context transition
pub const CALCULATE_FUNCTIONS: &[&str] = &["CALCULATE", "CALCULATETABLE"];

/// Plain aggregation functions
pub const AGGREGATION_FUNCTIONS: &[&str] =
    &["SUM", "AVERAGE", "MIN", "MAX", "COUNT", "DISTINCTCOUNT", "COUNTROWS"];

pub fn is_iterator(name: &str) -> bool {
    ITERATOR_FUNCTIONS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

pub fn is_calculate(name: &str) -> bool {
    CALCULATE_FUNCTIONS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

pub fn is_aggregation(name: &str) -> bool {
    AGGREGATION_FUNCTIONS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

/// Strip `// …` and `/* … */` comments, preserving byte offsets.
///
/// Stripped ranges are overwritten with spaces; newlines inside block
/// comments survive so line/column positions computed on the normalized text
/// match the original source. Comment markers inside string literals and
/// quoted identifiers are left alone.
pub fn strip_comments(dax: &str) -> ScanResult<String> {
    let bytes = dax.as_bytes();
    let mut out: Vec<u8> = bytes.to_vec();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => i = skip_string(bytes, i, b'"'),
            b'\'' => i = skip_string(bytes, i, b'\''),
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out[i] = b' ';
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                let start = i;
                out[i] = b' ';
                out[i + 1] = b' ';
                i += 2;
                loop {
                    if i + 1 >= bytes.len() {
                        // blank the tail so the error carries a clean offset
                        if i < bytes.len() && bytes[i] != b'\n' {
                            out[i] = b' ';
                        }
                        return Err(ScanError::MalformedComment { offset: start });
                    }
                    if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                        out[i] = b' ';
                        out[i + 1] = b' ';
                        i += 2;
                        break;
                    }
                    if bytes[i] != b'\n' {
                        out[i] = b' ';
                    }
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    // Byte-level blanking of ASCII only; original UTF-8 outside comments is intact
    Ok(String::from_utf8(out).unwrap_or_else(|_| dax.to_string()))
}

/// Blank the contents of string literals, quoted table names, and bracketed
/// identifiers, keeping the delimiters and total length.
///
/// Structural passes (paren matching, comma splitting, keyword search) run on
/// the masked text so quoted values can never produce false matches; name
/// extraction reads the original text by offset.
pub fn mask_opaque(dax: &str) -> String {
    let bytes = dax.as_bytes();
    let mut out: Vec<u8> = bytes.to_vec();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                let end = skip_string(bytes, i, quote);
                for b in out.iter_mut().take(end.saturating_sub(1)).skip(i + 1) {
                    if *b != b'\n' {
                        *b = b' ';
                    }
                }
                i = end;
            }
            b'[' => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != b']' {
                    j += 1;
                }
                for b in out.iter_mut().take(j).skip(i + 1) {
                    if *b != b'\n' {
                        *b = b' ';
                    }
                }
                i = (j + 1).min(bytes.len());
            }
            _ => i += 1,
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| dax.to_string())
}

/// Advance past a quoted region starting at `start`; doubled quotes escape
fn skip_string(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if i + 1 < bytes.len() && bytes[i + 1] == quote {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Find the matching `)` for the `(` at `open_pos`
pub fn matching_paren(masked: &str, open_pos: usize) -> ScanResult<usize> {
    let bytes = masked.as_bytes();
    debug_assert_eq!(bytes.get(open_pos), Some(&b'('));

    let mut depth: i32 = 0;
    for (i, &b) in bytes.iter().enumerate().skip(open_pos) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(ScanError::Unbalanced { offset: open_pos })
}

/// Locate every function call in the (comment-stripped) expression.
///
/// The production is `[A-Z_][A-Z0-9_.]*` followed by optional whitespace and
/// `(`, matched case-insensitively left to right; overlapping candidates
/// resolve to the longer name because the identifier match is greedy. Calls
/// whose parenthesis never closes are skipped.
pub fn find_function_calls(dax: &str) -> Vec<FunctionCall> {
    let masked = mask_opaque(dax);
    let mut calls = Vec::new();

    for cap in FUNCTION_HEAD.captures_iter(&masked) {
        let name_match = cap.get(1).unwrap();
        let whole = cap.get(0).unwrap();
        let open_paren = whole.end() - 1;

        let Ok(close_paren) = matching_paren(&masked, open_paren) else {
            continue;
        };

        calls.push(FunctionCall {
            name: name_match.as_str().to_ascii_uppercase(),
            name_start: name_match.start(),
            open_paren,
            close_paren,
        });
    }

    calls
}

/// Split `masked[start..end]` on depth-0 commas, returning trimmed sub-ranges
/// into the original text. Empty segments are dropped.
pub fn split_top_level_commas(masked: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let bytes = masked.as_bytes();
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut seg_start = start;

    for i in start..end.min(bytes.len()) {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b',' if depth == 0 => {
                if let Some(r) = trim_range(masked, seg_start, i) {
                    parts.push(r);
                }
                seg_start = i + 1;
            }
            _ => {}
        }
    }
    if let Some(r) = trim_range(masked, seg_start, end.min(bytes.len())) {
        parts.push(r);
    }

    parts
}

fn trim_range(text: &str, mut start: usize, mut end: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    while start < end && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    (end > start).then_some((start, end))
}

/// Find bare `[Name]` measure references.
///
/// A bracket occurrence is a measure reference iff it is not immediately
/// preceded (ignoring whitespace) by `)`, `]`, a `'…'` quoted table name, or
/// a bare identifier character; those mark column references.
pub fn find_measure_references(dax: &str) -> Vec<MeasureRef> {
    let bytes = dax.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => i = skip_string(bytes, i, b'"'),
            b'\'' => i = skip_string(bytes, i, b'\''),
            b'[' => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != b']' {
                    j += 1;
                }
                if j >= bytes.len() {
                    break;
                }
                if !preceded_by_table(bytes, i) {
                    let name = dax[i + 1..j].trim();
                    if !name.is_empty() {
                        refs.push(MeasureRef { name: name.to_string(), start: i, end: j + 1 });
                    }
                }
                i = j + 1;
            }
            _ => i += 1,
        }
    }

    refs
}

fn preceded_by_table(bytes: &[u8], bracket_pos: usize) -> bool {
    let mut k = bracket_pos;
    while k > 0 {
        k -= 1;
        let b = bytes[k];
        if b.is_ascii_whitespace() {
            continue;
        }
        return b == b'\'' || b == b')' || b == b']' || b == b'_' || b.is_ascii_alphanumeric();
    }
    false
}

/// Extract `Table[Column]` / `'Table'[Column]` references in order, deduped
pub fn find_column_references(dax: &str) -> Vec<ColumnRef> {
    let mut refs: Vec<ColumnRef> = Vec::new();

    for cap in COLUMN_REF.captures_iter(dax) {
        let whole = cap.get(0).unwrap();
        let table = cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let column = cap.get(3).unwrap().as_str().trim().to_string();

        if table.is_empty() || column.is_empty() {
            continue;
        }
        if refs.iter().any(|r| r.table == table && r.column == column) {
            continue;
        }
        refs.push(ColumnRef { table, column, start: whole.start(), end: whole.end() });
    }

    refs
}

/// Extract VAR definitions, each bounded by the next `VAR` header or the next
/// depth-0 `RETURN`
pub fn extract_variables(dax: &str) -> Vec<VarDef> {
    let masked = mask_opaque(dax);
    let heads: Vec<(usize, usize, String)> = VAR_HEAD
        .captures_iter(&masked)
        .map(|cap| {
            let whole = cap.get(0).unwrap();
            let name = cap.get(1).unwrap();
            (whole.start(), whole.end(), dax[name.start()..name.end()].to_string())
        })
        .collect();

    let depths = depth_map(&masked);
    let top_level_return = RETURN_KEYWORD
        .find_iter(&masked)
        .map(|m| m.start())
        .find(|&pos| depths[pos] == 0);

    let mut vars = Vec::new();
    for (idx, (var_start, def_start, name)) in heads.iter().enumerate() {
        let next_var = heads.get(idx + 1).map(|h| h.0);
        let ret_after = top_level_return.filter(|&r| r > *def_start);

        let def_end = match (next_var, ret_after) {
            (Some(v), Some(r)) => v.min(r),
            (Some(v), None) => v,
            (None, Some(r)) => r,
            (None, None) => dax.len(),
        };

        if let Some((s, e)) = trim_range(dax, *def_start, def_end) {
            vars.push(VarDef { name: name.clone(), var_start: *var_start, def_start: s, def_end: e });
        }
    }

    vars
}

/// Offset of the first depth-0 `RETURN` keyword, if any
pub fn find_top_level_return(dax: &str) -> Option<usize> {
    let masked = mask_opaque(dax);
    let depths = depth_map(&masked);
    RETURN_KEYWORD.find_iter(&masked).map(|m| m.start()).find(|&pos| depths[pos] == 0)
}

fn depth_map(masked: &str) -> Vec<i32> {
    let bytes = masked.as_bytes();
    let mut depths = vec![0i32; bytes.len() + 1];
    let mut depth = 0;
    for (i, &b) in bytes.iter().enumerate() {
        depths[i] = depth;
        match b {
            b'(' => depth += 1,
            b')' => depth = (depth - 1).max(0),
            _ => {}
        }
    }
    depths[bytes.len()] = depth;
    depths
}

/// 1-based line and column for a byte offset
pub fn line_column(text: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(text.len());
    let before = &text[..clamped];
    let line = before.bytes().filter(|&b| b == b'\n').count() + 1;
    let column = before.rfind('\n').map(|p| clamped - p).unwrap_or(clamped + 1);
    (line, column)
}

/// Truncate a display slice to `max` characters with an ellipsis
pub fn ellipsize(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments_preserves_offsets() {
        let dax = "SUM(Sales[Amount]) // total\n+ 1";
        let stripped = strip_comments(dax).unwrap();
        assert_eq!(stripped.len(), dax.len());
        assert!(stripped.contains("SUM(Sales[Amount])"));
        assert!(!stripped.contains("total"));
        // the newline survives so line math is unchanged
        assert_eq!(stripped.bytes().filter(|&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_strip_block_comment_keeps_newlines() {
        let dax = "CALCULATE(\n/* multi\nline */ [Sales]\n)";
        let stripped = strip_comments(dax).unwrap();
        assert_eq!(
            stripped.bytes().filter(|&b| b == b'\n').count(),
            dax.bytes().filter(|&b| b == b'\n').count()
        );
        assert!(!stripped.contains("multi"));
        assert!(stripped.contains("[Sales]"));
    }

    #[test]
    fn test_unterminated_block_comment_is_an_error() {
        let err = strip_comments("1 + /* oops").unwrap_err();
        assert_eq!(err, ScanError::MalformedComment { offset: 4 });
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let dax = r#"IF([X] > 0, "a // b", "c /* d */")"#;
        let stripped = strip_comments(dax).unwrap();
        assert_eq!(stripped, dax);
    }

    #[test]
    fn test_find_function_calls() {
        let dax = "CALCULATE(SUM(Sales[Amount]), Sales[Year] = 2024)";
        let calls = find_function_calls(dax);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "CALCULATE");
        assert_eq!(calls[0].name_start, 0);
        assert_eq!(calls[0].close_paren, dax.len() - 1);
        assert_eq!(calls[1].name, "SUM");
    }

    #[test]
    fn test_function_call_ignores_parens_in_strings() {
        let dax = r#"IF([X] = "a(b", 1, 2)"#;
        let calls = find_function_calls(dax);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].close_paren, dax.len() - 1);
    }

    #[test]
    fn test_split_top_level_commas() {
        let dax = "FILTER(Sales, Sales[Qty] > 1), [Total], \"a,b\"";
        let masked = mask_opaque(dax);
        let parts: Vec<&str> = split_top_level_commas(&masked, 0, dax.len())
            .into_iter()
            .map(|(s, e)| &dax[s..e])
            .collect();
        assert_eq!(parts, vec!["FILTER(Sales, Sales[Qty] > 1)", "[Total]", "\"a,b\""]);
    }

    #[test]
    fn test_measure_vs_column_references() {
        let dax = "SUMX(Sales, [Unit Price] * Sales[Quantity]) + 'd Region'[Code]";
        let refs = find_measure_references(dax);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "Unit Price");

        let cols = find_column_references(dax);
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].table, "Sales");
        assert_eq!(cols[0].column, "Quantity");
        assert_eq!(cols[1].table, "d Region");
        assert_eq!(cols[1].column, "Code");
    }

    #[test]
    fn test_extract_variables() {
        let dax = "VAR Total = SUM(Sales[Amount])\nVAR Avg = [Mean Sales]\nRETURN Total + Avg";
        let vars = extract_variables(dax);
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].name, "Total");
        assert_eq!(&dax[vars[0].def_start..vars[0].def_end], "SUM(Sales[Amount])");
        assert_eq!(vars[1].name, "Avg");
        assert_eq!(&dax[vars[1].def_start..vars[1].def_end], "[Mean Sales]");
    }

    #[test]
    fn test_nested_return_is_not_top_level() {
        // RETURN inside parentheses does not bound a top-level VAR
        let dax = "VAR X = CALCULATE(\n    VAR Y = 1 RETURN Y\n)\nRETURN X";
        let top = find_top_level_return(dax).unwrap();
        assert_eq!(&dax[top..top + 6], "RETURN");
        assert!(top > dax.find(')').unwrap());
    }

    #[test]
    fn test_line_column() {
        let dax = "A\nBB\nCCC";
        assert_eq!(line_column(dax, 0), (1, 1));
        assert_eq!(line_column(dax, 2), (2, 1));
        assert_eq!(line_column(dax, 3), (2, 2));
        assert_eq!(line_column(dax, 5), (3, 1));
    }

    #[test]
    fn test_matching_paren_unbalanced() {
        let masked = mask_opaque("SUM(Sales[Amount]");
        assert!(matching_paren(&masked, 3).is_err());
    }
}
