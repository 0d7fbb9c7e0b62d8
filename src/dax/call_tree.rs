//! Hierarchical call-tree construction
//!
//! Breaks a DAX expression into a typed tree (variables, functions,
//! iterators, CALCULATEs, measure references), estimates per-iterator row
//! counts from VertiPaq cardinality, scores per-node performance impact, and
//! renders an indented textual tree.

use serde::{Deserialize, Serialize};

use crate::dax::scanner;
use crate::dax::vertipaq::VertiPaqProvider;

/// Node taxonomy for the call tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Calculate,
    Iterator,
    MeasureRef,
    Function,
    ColumnRef,
    Filter,
    Variable,
    Literal,
}

/// Performance impact of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeImpact {
    Low,
    Medium,
    High,
    Critical,
}

/// A node in the call tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTreeNode {
    pub node_id: u32,
    pub node_type: NodeType,
    /// Source substring (truncated for display)
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub start_pos: usize,
    pub end_pos: usize,
    pub has_context_transition: bool,
    pub is_iterator: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_iterations: Option<u64>,
    pub performance_impact: NodeImpact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
    /// Children in textual order
    pub children: Vec<CallTreeNode>,
}

impl CallTreeNode {
    fn new(node_id: u32, node_type: NodeType, expression: &str, start: usize, end: usize) -> Self {
        Self {
            node_id,
            node_type,
            expression: scanner::ellipsize(expression, 100),
            function_name: None,
            start_pos: start,
            end_pos: end,
            has_context_transition: false,
            is_iterator: false,
            estimated_iterations: None,
            performance_impact: NodeImpact::Low,
            warning_message: None,
            children: Vec::new(),
        }
    }

    /// True if any node in this subtree is a measure reference
    pub fn contains_measure_reference(&self) -> bool {
        self.node_type == NodeType::MeasureRef
            || self.children.iter().any(CallTreeNode::contains_measure_reference)
    }

    /// Total node count in this subtree
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(CallTreeNode::node_count).sum::<usize>()
    }

    fn calculate_depth(&self) -> usize {
        let child_max = self
            .children
            .iter()
            .map(|c| {
                let d = c.calculate_depth();
                if c.node_type == NodeType::Calculate { d + 1 } else { d }
            })
            .max()
            .unwrap_or(0);
        child_max
    }
}

/// Call-tree builder over normalized DAX
pub struct CallTreeBuilder<'a> {
    vertipaq: Option<&'a VertiPaqProvider>,
    next_id: u32,
}

impl<'a> CallTreeBuilder<'a> {
    pub fn new() -> Self {
        Self { vertipaq: None, next_id: 0 }
    }

    /// Attach a cardinality provider for iteration estimates
    pub fn with_vertipaq(mut self, provider: &'a VertiPaqProvider) -> Self {
        self.vertipaq = Some(provider);
        self
    }

    /// Build the tree for a comment-stripped expression
    pub async fn build(&mut self, dax: &str) -> CallTreeNode {
        self.next_id = 0;
        let trimmed_len = dax.len();

        let mut root = CallTreeNode::new(self.next_id(), NodeType::Root, dax, 0, trimmed_len);
        self.parse_range(dax, &mut root, 0, trimmed_len);

        if self.vertipaq.is_some() {
            self.estimate_iterations(&mut root, dax).await;
        }
        Self::assess_impact(&mut root);

        tracing::debug!(nodes = root.node_count(), "call tree built");
        root
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn parse_range(&mut self, dax: &str, parent: &mut CallTreeNode, start: usize, end: usize) {
        let expr = &dax[start..end];
        if expr.trim().is_empty() {
            return;
        }

        // VAR blocks first: one node per depth-0 variable, then recurse into
        // the RETURN tail. VARs nested inside function arguments belong to
        // the recursive parse of that argument.
        let masked_expr = scanner::mask_opaque(expr);
        let vars: Vec<_> = scanner::extract_variables(expr)
            .into_iter()
            .filter(|v| paren_depth_at(&masked_expr, v.var_start) == 0)
            .collect();
        if !vars.is_empty() {
            for var in &vars {
                let value = &expr[var.def_start..var.def_end];
                let label = format!("VAR {} = {}", var.name, scanner::ellipsize(value, 50));
                let mut node = CallTreeNode::new(
                    self.next_id(),
                    NodeType::Variable,
                    &label,
                    start + var.var_start,
                    start + var.def_end,
                );
                node.expression = label.clone();
                node.function_name = Some(format!("VAR {}", var.name));
                self.parse_range(dax, &mut node, start + var.def_start, start + var.def_end);
                parent.children.push(node);
            }

            if let Some(ret) = scanner::find_top_level_return(expr) {
                let tail_start = ret + "RETURN".len();
                self.parse_range(dax, parent, start + tail_start, end);
            }
            return;
        }

        // Top-level function calls
        let masked = masked_expr;
        let calls = scanner::find_function_calls(expr);
        let mut consumed: Vec<(usize, usize)> = Vec::new();

        for call in &calls {
            // skip calls nested inside an earlier top-level call
            if consumed.iter().any(|&(s, e)| call.name_start >= s && call.name_start < e) {
                continue;
            }
            consumed.push((call.name_start, call.close_paren + 1));

            let node_type = if scanner::is_calculate(&call.name) {
                NodeType::Calculate
            } else if scanner::is_iterator(&call.name) {
                NodeType::Iterator
            } else {
                NodeType::Function
            };

            let mut node = CallTreeNode::new(
                self.next_id(),
                node_type,
                &expr[call.name_start..=call.close_paren],
                start + call.name_start,
                start + call.close_paren + 1,
            );
            node.function_name = Some(call.name.clone());
            node.has_context_transition = node_type == NodeType::Calculate;
            node.is_iterator = node_type == NodeType::Iterator;

            for (arg_start, arg_end) in
                scanner::split_top_level_commas(&masked, call.open_paren + 1, call.close_paren)
            {
                self.parse_range(dax, &mut node, start + arg_start, start + arg_end);
            }

            parent.children.push(node);
        }

        // Bare measure references outside any consumed call
        for m in scanner::find_measure_references(expr) {
            if consumed.iter().any(|&(s, e)| m.start >= s && m.start < e) {
                continue;
            }
            let mut node = CallTreeNode::new(
                self.next_id(),
                NodeType::MeasureRef,
                &format!("[{}]", m.name),
                start + m.start,
                start + m.end,
            );
            node.function_name = Some(format!("[{}]", m.name));
            node.has_context_transition = true; // implicit CALCULATE
            parent.children.push(node);
        }

        // keep textual order after the two passes
        parent.children.sort_by_key(|c| c.start_pos);
    }

    async fn estimate_iterations(&self, node: &mut CallTreeNode, original: &str) {
        // children first so parent propagation sees final values
        for child in &mut node.children {
            Box::pin(self.estimate_iterations(child, original)).await;
        }

        if node.node_type != NodeType::Iterator {
            return;
        }
        let Some(provider) = self.vertipaq else { return };

        // first top-level argument names or contains the iterated table
        let span = &original[node.start_pos..node.end_pos.min(original.len())];
        let Some(open) = span.find('(') else { return };
        let masked = scanner::mask_opaque(span);
        let close = scanner::matching_paren(&masked, open).unwrap_or(span.len() - 1);
        let first_arg = scanner::split_top_level_commas(&masked, open + 1, close)
            .first()
            .map(|&(s, e)| span[s..e].trim())
            .unwrap_or("");

        if first_arg.contains('[') {
            if let Some(metrics) = provider.metrics_for_expression(first_arg).await {
                if metrics.cardinality > 0 {
                    node.estimated_iterations = Some(metrics.cardinality);
                }
            }
        } else if !first_arg.is_empty() {
            if let Some(rows) = provider.table_row_count(first_arg).await {
                node.estimated_iterations = Some(rows);
            }
        }
    }

    fn assess_impact(node: &mut CallTreeNode) {
        for child in &mut node.children {
            Self::assess_impact(child);
        }

        if node.node_type == NodeType::Iterator {
            if let Some(iters) = node.estimated_iterations {
                if iters >= 1_000_000 {
                    node.performance_impact = NodeImpact::Critical;
                    append_warning(
                        node,
                        &format!("CRITICAL: estimated {iters} iterations"),
                    );
                } else if iters >= 100_000 {
                    node.performance_impact = NodeImpact::High;
                    append_warning(node, &format!("HIGH: estimated {iters} iterations"));
                } else if iters >= 10_000 {
                    node.performance_impact = NodeImpact::Medium;
                }
            }

            if node.contains_measure_reference() {
                node.performance_impact = match node.performance_impact {
                    NodeImpact::Low => NodeImpact::Medium,
                    NodeImpact::Medium => NodeImpact::High,
                    other => other,
                };
                if node.warning_message.is_none() {
                    let name = node.function_name.as_deref().unwrap_or("iterator");
                    node.warning_message = Some(format!(
                        "{name} iterator contains measure references; the transition fires in \
                         each iteration"
                    ));
                }
            }
        } else if node.node_type == NodeType::Calculate {
            let depth = node.calculate_depth() + 1;
            if depth > 3 {
                node.performance_impact = node.performance_impact.max(NodeImpact::Medium);
                node.warning_message = Some(format!("CALCULATE nesting depth: {depth}"));
            }
        }

        // propagate the worst child impact upward
        let child_max = node
            .children
            .iter()
            .map(|c| c.performance_impact)
            .max()
            .unwrap_or(NodeImpact::Low);
        node.performance_impact = node.performance_impact.max(child_max);
    }
}

impl Default for CallTreeBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn paren_depth_at(masked: &str, offset: usize) -> i32 {
    let mut depth = 0;
    for &b in masked.as_bytes().iter().take(offset) {
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
    }
    depth
}

fn append_warning(node: &mut CallTreeNode, text: &str) {
    match &mut node.warning_message {
        Some(msg) => {
            msg.push_str("; ");
            msg.push_str(text);
        }
        None => node.warning_message = Some(text.to_string()),
    }
}

/// Render the tree as an indented text diagram with node-type glyphs
pub fn render_tree(node: &CallTreeNode) -> String {
    let mut lines = Vec::new();
    render_into(node, 0, &mut lines);
    lines.join("\n")
}

fn render_into(node: &CallTreeNode, indent: usize, lines: &mut Vec<String>) {
    let glyph = match node.node_type {
        NodeType::Variable => "var",
        NodeType::MeasureRef => "ref",
        NodeType::Calculate => "ctx",
        NodeType::Iterator => "itr",
        NodeType::Filter => "flt",
        NodeType::Function => "fn ",
        NodeType::ColumnRef => "col",
        NodeType::Literal => "lit",
        NodeType::Root => "dax",
    };

    let mut parts = vec![format!(
        "[{glyph}] {}",
        node.function_name.as_deref().unwrap_or(&node.expression)
    )];
    if node.has_context_transition {
        parts.push("(context transition)".to_string());
    }
    if node.is_iterator {
        if let Some(iters) = node.estimated_iterations {
            parts.push(format!("({iters} rows)"));
        }
    }
    if node.performance_impact >= NodeImpact::High {
        parts.push(format!("<{:?}>", node.performance_impact).to_lowercase());
    }

    let prefix = if indent == 0 {
        String::new()
    } else {
        format!("{}`- ", "  ".repeat(indent - 1))
    };
    lines.push(format!("{prefix}{}", parts.join(" ")));

    for child in &node.children {
        render_into(child, indent + 1, lines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn build(dax: &str) -> CallTreeNode {
        CallTreeBuilder::new().build(dax).await
    }

    #[tokio::test]
    async fn test_basic_tree_shape() {
        let root = build("CALCULATE(SUM(Sales[Amount]), Sales[Year] = 2024)").await;
        assert_eq!(root.node_type, NodeType::Root);
        assert_eq!(root.children.len(), 1);

        let calc = &root.children[0];
        assert_eq!(calc.node_type, NodeType::Calculate);
        assert!(calc.has_context_transition);
        assert_eq!(calc.children[0].function_name.as_deref(), Some("SUM"));
    }

    #[tokio::test]
    async fn test_child_ranges_nested_and_ordered() {
        let root = build("SUMX(FILTER(Sales, Sales[Qty] > 1), [Total] * 2)").await;
        let sumx = &root.children[0];
        assert!(sumx.is_iterator);
        assert!(sumx.start_pos < sumx.end_pos);

        let mut prev_end = sumx.start_pos;
        for child in &sumx.children {
            assert!(child.start_pos >= prev_end);
            assert!(child.end_pos <= sumx.end_pos);
            assert!(child.start_pos < child.end_pos);
            prev_end = child.end_pos;
        }
    }

    #[tokio::test]
    async fn test_var_nodes() {
        let root = build("VAR Base = SUM(Sales[Amount])\nRETURN Base + [Adj]").await;
        let var = &root.children[0];
        assert_eq!(var.node_type, NodeType::Variable);
        assert_eq!(var.function_name.as_deref(), Some("VAR Base"));
        assert!(var.expression.starts_with("VAR Base = "));
        // RETURN tail attaches [Adj] under the root
        assert!(root.children.iter().any(|c| c.node_type == NodeType::MeasureRef));
    }

    #[tokio::test]
    async fn test_iterator_with_measure_upgrades_impact() {
        let root = build("SUMX(Sales, [Unit Price])").await;
        let sumx = &root.children[0];
        assert_eq!(sumx.node_type, NodeType::Iterator);
        assert!(sumx.contains_measure_reference());
        // low + measure refs -> medium, propagated to root
        assert_eq!(sumx.performance_impact, NodeImpact::Medium);
        assert_eq!(root.performance_impact, NodeImpact::Medium);
        assert!(sumx.warning_message.is_some());
    }

    #[tokio::test]
    async fn test_measure_ref_has_transition() {
        let root = build("[Total Sales] * 1.1").await;
        let m = &root.children[0];
        assert_eq!(m.node_type, NodeType::MeasureRef);
        assert!(m.has_context_transition);
    }

    #[tokio::test]
    async fn test_render_tree() {
        let root = build("CALCULATE(SUM(Sales[Amount]), FILTER(Sales, [M] > 0))").await;
        let rendered = render_tree(&root);
        assert!(rendered.contains("[ctx] CALCULATE"));
        assert!(rendered.contains("[itr] FILTER"));
        assert!(rendered.contains("(context transition)"));
    }

    #[tokio::test]
    async fn test_node_ids_unique() {
        let root = build("CALCULATE([A] + [B], FILTER(T, T[X] > 1))").await;
        let mut ids = Vec::new();
        fn collect(node: &CallTreeNode, ids: &mut Vec<u32>) {
            ids.push(node.node_id);
            for c in &node.children {
                collect(c, ids);
            }
        }
        collect(&root, &mut ids);
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());
    }
}
