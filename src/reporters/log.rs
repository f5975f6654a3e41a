//! The fallback reporter: writes traces to the log.

use std::fmt::Write as _;

use log::info;

use crate::profiler::CallStackElement;
use crate::reporter::{ReportError, RequestTraceReporter};
use crate::trace::RequestTrace;

/// Writes every finished trace to the logger at info level.
///
/// Always active, so there is a sink for traces even before any external
/// reporter is configured.
#[derive(Debug, Default)]
pub struct LogReporter;

impl LogReporter {
    /// Creates the reporter.
    pub fn new() -> LogReporter {
        LogReporter
    }
}

impl RequestTraceReporter for LogReporter {
    fn is_active(&self, _trace: &RequestTrace) -> bool {
        true
    }

    fn report_request_trace(&self, trace: &RequestTrace) -> Result<(), ReportError> {
        let document = serde_json::to_string(trace)?;
        match trace.call_stack() {
            Some(root) => info!("{document}\n{}", render_call_tree(root)),
            None => info!("{document}"),
        }
        Ok(())
    }
}

fn render_call_tree(root: &CallStackElement) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  total ms │    own ms │ call tree");
    let _ = writeln!(out, "───────────┼───────────┼───────────────────────");
    render_node(&mut out, root, 0);
    out
}

fn render_node(out: &mut String, node: &CallStackElement, depth: usize) {
    let _ = writeln!(
        out,
        "{:>10.3} ┊{:>10.3} ┊ {:indent$}{}",
        node.execution_time() as f64 / 1_000_000.0,
        node.net_execution_time() as f64 / 1_000_000.0,
        "",
        node.signature(),
        indent = depth * 2,
    );
    for child in node.children() {
        render_node(out, child, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_tree_depth_first() {
        let mut root = CallStackElement::new("GET /owners", 3_000_000);
        let mut controller = CallStackElement::new("OwnerController#find", 2_500_000);
        controller.push_child(CallStackElement::new("OwnerRepository#query", 2_000_000));
        root.push_child(controller);

        let rendered = render_call_tree(&root);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[2].ends_with("GET /owners"));
        assert!(lines[3].ends_with("  OwnerController#find"));
        assert!(lines[4].ends_with("    OwnerRepository#query"));
        assert!(lines[2].contains("3.000"));
    }

    #[test]
    fn test_reporting_never_fails() {
        let reporter = LogReporter::new();
        let trace = RequestTrace::new(None, "GET /owners");
        assert!(reporter.is_active(&trace));
        assert!(reporter.report_request_trace(&trace).is_ok());
    }
}
