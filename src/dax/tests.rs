//! End-to-end tests for the DAX analysis pipeline

use crate::config::AnalyzerConfig;
use crate::dax::DaxAnalyzer;
use crate::dax::call_tree::CallTreeNode;
use crate::dax::context::{TransitionImpact, TransitionType};
use crate::dax::rewriter::{CodeRewriter, TransformationType};
use crate::dax::scanner;

fn analyzer() -> DaxAnalyzer {
    DaxAnalyzer::new(AnalyzerConfig::default())
}

#[tokio::test]
async fn test_sumx_filter_end_to_end() {
    let dax = "SUMX(FILTER(Sales, Sales[Region] = \"EU\"), Sales[Amount])";
    let report = analyzer().analyze(dax, Some("EU Sales")).await;

    assert!(report.success);
    assert!(report.validation.is_valid);
    assert_eq!(report.measure_name.as_deref(), Some("EU Sales"));

    // the rewriter produced the CALCULATE form
    assert_eq!(
        report.optimized_measure.as_deref(),
        Some("CALCULATE(SUM(Sales[Amount]), Sales[Region] = \"EU\")")
    );
    let rewrites: Vec<_> = report
        .improvements
        .details
        .iter()
        .filter(|t| t.transformation_type == TransformationType::SumxFilterToCalculate)
        .collect();
    assert_eq!(rewrites.len(), 1);

    // the anti-pattern registry flagged it as critical
    assert!(report.anti_patterns.matches.iter().any(|m| m.rule_id == "sumx_filter"));

    // articles carried through to the top level
    assert!(report.articles_referenced.iter().any(|a| a.url.contains("optimizing-sumx")));
}

#[tokio::test]
async fn test_repeated_measure_extraction_end_to_end() {
    let dax = "[Sales] + [Sales] * 0.1";
    let report = analyzer().analyze(dax, None).await;

    let code = report.optimized_measure.unwrap();
    assert!(code.starts_with("VAR _M1 = [Sales]"));
    assert!(code.contains("RETURN"));
    assert!(code.contains("_M1 + _M1 * 0.1"));

    let extracts: Vec<_> = report
        .improvements
        .details
        .iter()
        .filter(|t| t.transformation_type == TransformationType::ExtractRepeatedMeasures)
        .collect();
    assert_eq!(extracts.len(), 1);
}

#[tokio::test]
async fn test_iterator_with_measure_context_analysis() {
    let dax = "SUMX(Sales, [Unit Price] * Sales[Quantity])";
    let report = analyzer().analyze(dax, None).await;

    let flow = &report.context_analysis;
    let iterator = flow
        .transitions
        .iter()
        .find(|t| t.transition_type == TransitionType::Iterator)
        .expect("iterator transition");
    assert_eq!(iterator.function, "SUMX");
    assert_eq!(iterator.performance_impact, TransitionImpact::Medium);

    let implicit = flow
        .transitions
        .iter()
        .find(|t| t.transition_type == TransitionType::ImplicitMeasure)
        .expect("implicit measure transition");
    assert_eq!(implicit.measure_name.as_deref(), Some("Unit Price"));

    assert_eq!(flow.complexity_score, 15);
}

#[tokio::test]
async fn test_offset_preservation_through_comments() {
    // locations refer to original-source offsets even with comments
    let dax = "// leading comment\nCALCULATE(\n    [Total], /* inline */ Sales[Y] = 1\n)";
    let report = analyzer().analyze(dax, None).await;

    for t in &report.context_analysis.transitions {
        let (line, column) = scanner::line_column(dax, t.location);
        assert_eq!((line, column), (t.line, t.column));
    }

    let calc = report
        .context_analysis
        .transitions
        .iter()
        .find(|t| t.transition_type == TransitionType::ExplicitCalculate)
        .unwrap();
    assert_eq!(&dax[calc.location..calc.location + 9], "CALCULATE");
}

#[tokio::test]
async fn test_call_tree_ranges_balanced() {
    // ranges nest, do not overlap, and hold balanced parentheses
    let dax = "VAR X = CALCULATE(SUM(Sales[A]), FILTER(Sales, Sales[B] > 0))\nRETURN X + [M]";
    let report = analyzer().analyze(dax, None).await;

    fn check(node: &CallTreeNode, source: &str) {
        assert!(node.start_pos < node.end_pos, "empty range on node {}", node.node_id);
        let slice = &source[node.start_pos..node.end_pos.min(source.len())];
        let masked = scanner::mask_opaque(slice);
        let mut depth: i64 = 0;
        for b in masked.bytes() {
            match b {
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            assert!(depth >= 0, "unbalanced slice: {slice}");
        }
        assert_eq!(depth, 0, "unbalanced slice: {slice}");

        let mut prev_end = node.start_pos;
        for child in &node.children {
            assert!(child.start_pos >= prev_end, "overlapping children");
            assert!(child.end_pos <= node.end_pos, "child escapes parent");
            prev_end = child.end_pos;
            check(child, source);
        }
    }
    check(&report.call_tree.root, dax);
}

#[tokio::test]
async fn test_rewriter_idempotence_property() {
    // a second pass over rewritten output is a no-op for every rule shape
    let inputs = [
        "SUMX(FILTER(Sales, Sales[Region] = \"EU\"), Sales[Amount])",
        "[Sales] + [Sales] * 0.1",
        "COUNTROWS(FILTER(Orders, Orders[Qty] > 5))",
        "AVERAGEX(FILTER(T, T[v] > 0), T[v]) + [M] + [M]",
        "CALCULATE(SUM(Sales[Amount]), Sales[Year] = 2024)",
    ];

    let rewriter = CodeRewriter::new();
    for input in inputs {
        let once = rewriter.rewrite(input);
        let basis = once.rewritten_code.as_deref().unwrap_or(input);
        let twice = rewriter.rewrite(basis);
        assert!(
            !twice.has_changes,
            "second pass changed {input:?}: {:?}",
            twice.rewritten_code
        );
    }
}

#[tokio::test]
async fn test_complexity_monotone_under_extension() {
    // adding transitions never lowers the score
    let a = analyzer().analyze("CALCULATE([M], S[x] = 1)", None).await;
    let b = analyzer()
        .analyze("CALCULATE([M], S[x] = 1) + SUMX(T, [M2]) + [M3]", None)
        .await;
    assert!(
        a.context_analysis.complexity_score <= b.context_analysis.complexity_score
    );
}

#[tokio::test]
async fn test_malformed_comment_degrades_gracefully() {
    let dax = "SUM(Sales[Amount]) /* unterminated";
    let report = analyzer().analyze(dax, None).await;

    assert!(report.success);
    assert!(!report.validation.is_valid);
    assert_eq!(report.validation.error_kind.as_deref(), Some("invalid_dax"));
    // partial structural output still present
    assert!(report.call_tree.node_count >= 1);
}

#[tokio::test]
async fn test_report_serializes() {
    let report = analyzer()
        .analyze("CALCULATE([Total Sales], Sales[Year] = 2024)", None)
        .await;
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["success"], serde_json::Value::Bool(true));
    assert!(json["annotated_dax_code"].as_str().unwrap().contains("Legend"));
    assert!(json["context_analysis"]["transitions"].is_array());
}

#[tokio::test]
async fn test_quality_score_reflects_issue_load() {
    let clean = analyzer().analyze("SUM(Sales[Amount])", None).await;
    let messy = analyzer()
        .analyze("SUMX(FILTER(Sales, Sales[Qty] > 1), Sales[Amount]) + COUNTROWS(FILTER(S, S[a] > 2))", None)
        .await;
    assert!(
        clean.best_practices_analysis.overall_score
            > messy.best_practices_analysis.overall_score
    );
    assert!(messy.best_practices_analysis.critical_count >= 2);
}
