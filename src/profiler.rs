//! Per-request call-stack profiling.
//!
//! While a profiling session is active on a thread, instrumented code brackets
//! its interesting calls with [`start`] and [`stop`]; the profiler folds them
//! into a tree of [`CallStackElement`]s that the monitor attaches to the
//! finished request trace. The tree is a tree of *call timings*, not an OS
//! stack sample.
//!
//! All entry points fail softly: when no session is active they do nothing,
//! so instrumentation can stay in place for unmonitored executions and
//! exceptional unwinds.

use std::cell::RefCell;
use std::time::Instant;

use serde::Serialize;

thread_local! {
    static ACTIVE: RefCell<Option<ProfilingSession>> = const { RefCell::new(None) };
}

/// One node in a request's call tree.
///
/// The node owns its children; the finished tree is owned exclusively by the
/// request trace it is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallStackElement {
    signature: String,
    execution_time_ns: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<CallStackElement>,
}

impl CallStackElement {
    /// Creates a leaf node.
    pub fn new(signature: impl Into<String>, execution_time_ns: u64) -> CallStackElement {
        CallStackElement {
            signature: signature.into(),
            execution_time_ns,
            children: Vec::new(),
        }
    }

    /// The signature of the profiled call, e.g. a method name.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub(crate) fn set_signature(&mut self, signature: impl Into<String>) {
        self.signature = signature.into();
    }

    /// Total execution time of this call in nanoseconds, children included.
    pub fn execution_time(&self) -> u64 {
        self.execution_time_ns
    }

    /// Execution time spent in this call itself, children excluded.
    pub fn net_execution_time(&self) -> u64 {
        let children: u64 = self.children.iter().map(CallStackElement::execution_time).sum();
        self.execution_time_ns.saturating_sub(children)
    }

    /// The direct children of this call, in call order.
    pub fn children(&self) -> &[CallStackElement] {
        &self.children
    }

    pub(crate) fn push_child(&mut self, child: CallStackElement) {
        self.children.push(child);
    }

    /// Removes all descendants whose total execution time is below
    /// `threshold_ns`.
    ///
    /// Surviving descendants of a removed call are promoted into its place,
    /// keeping sibling order stable. The node this is called on is never
    /// removed itself.
    pub fn remove_calls_faster_than(&mut self, threshold_ns: u64) {
        prune_children(&mut self.children, threshold_ns);
    }

    /// Total number of nodes in this tree, the node itself included.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(CallStackElement::len).sum::<usize>()
    }

    /// Whether the tree consists of the bare root.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

fn prune_children(children: &mut Vec<CallStackElement>, threshold_ns: u64) {
    let mut idx = 0;
    while idx < children.len() {
        prune_children(&mut children[idx].children, threshold_ns);
        if children[idx].execution_time_ns < threshold_ns {
            let removed = children.remove(idx);
            // Promoted children already passed the threshold above.
            let surviving = removed.children.len();
            children.splice(idx..idx, removed.children);
            idx += surviving;
        } else {
            idx += 1;
        }
    }
}

struct PendingCall {
    signature: String,
    start: Instant,
    children: Vec<CallStackElement>,
}

impl PendingCall {
    fn new(signature: &str) -> PendingCall {
        PendingCall {
            signature: signature.to_owned(),
            start: Instant::now(),
            children: Vec::new(),
        }
    }

    fn finish(self) -> CallStackElement {
        CallStackElement {
            signature: self.signature,
            execution_time_ns: u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX),
            children: self.children,
        }
    }
}

/// The per-thread stack of open calls; `stack[0]` is the root.
struct ProfilingSession {
    stack: Vec<PendingCall>,
}

/// Starts a profiling session on the current thread with a root call of the
/// given signature. Any previous session on this thread is discarded.
pub(crate) fn activate(root_signature: &str) {
    ACTIVE.with(|active| {
        *active.borrow_mut() = Some(ProfilingSession {
            stack: vec![PendingCall::new(root_signature)],
        });
    });
}

/// Enters an instrumented call. No-op unless a session is active.
pub fn start(signature: &str) {
    ACTIVE.with(|active| {
        if let Some(session) = active.borrow_mut().as_mut() {
            session.stack.push(PendingCall::new(signature));
        }
    });
}

/// Leaves the innermost instrumented call, recording its elapsed time.
///
/// No-op unless a session is active and a call other than the root is open,
/// so unbalanced instrumentation cannot close the root by accident.
pub fn stop() {
    ACTIVE.with(|active| {
        if let Some(session) = active.borrow_mut().as_mut() {
            if session.stack.len() > 1 {
                let finished = match session.stack.pop() {
                    Some(call) => call.finish(),
                    None => return,
                };
                if let Some(parent) = session.stack.last_mut() {
                    parent.children.push(finished);
                }
            }
        }
    });
}

/// Ends the session on the current thread and returns the finished root.
///
/// Calls still open at this point (left open by an exceptional unwind) are
/// closed with their elapsed time so far.
pub(crate) fn deactivate() -> Option<CallStackElement> {
    ACTIVE.with(|active| {
        let session = active.borrow_mut().take()?;
        let mut stack = session.stack;
        let mut finished: Option<CallStackElement> = None;
        while let Some(mut call) = stack.pop() {
            if let Some(child) = finished.take() {
                call.children.push(child);
            }
            finished = Some(call.finish());
        }
        finished
    })
}

/// Discards any active session on the current thread. Idempotent.
pub(crate) fn clear() {
    ACTIVE.with(|active| {
        *active.borrow_mut() = None;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(signature: &str, time_ns: u64, children: Vec<CallStackElement>) -> CallStackElement {
        let mut element = CallStackElement::new(signature, time_ns);
        for child in children {
            element.push_child(child);
        }
        element
    }

    #[test]
    fn test_builds_nested_tree() {
        activate("total");
        start("a");
        start("a1");
        stop();
        stop();
        start("b");
        stop();
        let root = deactivate().unwrap();

        assert_eq!(root.signature(), "total");
        let children: Vec<_> = root.children().iter().map(|c| c.signature()).collect();
        assert_eq!(children, vec!["a", "b"]);
        assert_eq!(root.children()[0].children()[0].signature(), "a1");
        assert!(root.execution_time() >= root.children()[0].execution_time());
    }

    #[test]
    fn test_start_stop_without_session_is_a_no_op() {
        clear();
        start("ignored");
        stop();
        assert!(deactivate().is_none());
    }

    #[test]
    fn test_unbalanced_stop_does_not_close_the_root() {
        activate("total");
        stop();
        stop();
        let root = deactivate().unwrap();
        assert_eq!(root.signature(), "total");
        assert!(root.children().is_empty());
    }

    #[test]
    fn test_deactivate_closes_open_calls() {
        activate("total");
        start("open");
        let root = deactivate().unwrap();
        assert_eq!(root.children().len(), 1);
        assert_eq!(root.children()[0].signature(), "open");
    }

    #[test]
    fn test_remove_calls_faster_than_zero_is_a_no_op() {
        let mut root = element(
            "total",
            100,
            vec![element("a", 0, vec![]), element("b", 50, vec![element("b1", 1, vec![])])],
        );
        let before = root.clone();
        root.remove_calls_faster_than(0);
        assert_eq!(root, before);
    }

    #[test]
    fn test_remove_calls_faster_than_promotes_survivors_in_order() {
        // "slow" is below the threshold but holds two children above it; the
        // children must take its place between "first" and "last".
        let mut root = element(
            "total",
            1_000,
            vec![
                element("first", 40, vec![]),
                element("slow", 20, vec![element("s1", 30, vec![]), element("s2", 25, vec![])]),
                element("last", 35, vec![]),
            ],
        );
        root.remove_calls_faster_than(25);
        let children: Vec<_> = root.children().iter().map(|c| c.signature()).collect();
        assert_eq!(children, vec!["first", "s1", "s2", "last"]);
    }

    #[test]
    fn test_remove_calls_faster_than_preserves_surviving_multiset() {
        let mut shallow = element(
            "total",
            1_000,
            vec![element("keep1", 100, vec![]), element("fast", 1, vec![]), element("keep2", 200, vec![])],
        );
        let mut deep = element(
            "total",
            1_000,
            vec![element(
                "fast",
                2,
                vec![element("keep1", 100, vec![]), element("keep2", 200, vec![])],
            )],
        );
        shallow.remove_calls_faster_than(50);
        deep.remove_calls_faster_than(50);

        let survivors_of = |root: &CallStackElement| {
            fn walk(node: &CallStackElement, out: &mut Vec<String>) {
                out.push(node.signature().to_owned());
                for child in node.children() {
                    walk(child, out);
                }
            }
            let mut out = Vec::new();
            walk(root, &mut out);
            out.sort();
            out
        };
        assert_eq!(survivors_of(&shallow), survivors_of(&deep));
    }

    #[test]
    fn test_net_execution_time() {
        let root = element("total", 100, vec![element("a", 30, vec![]), element("b", 20, vec![])]);
        assert_eq!(root.net_execution_time(), 50);
        assert_eq!(root.len(), 3);
    }
}
