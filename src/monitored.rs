//! The contract between the monitor and a concrete workload.

use std::collections::BTreeMap;

use crate::trace::RequestTrace;

/// The error type workloads surface through the monitor.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Adapts one unit of work (an HTTP invocation, a monitored method call, a
/// background task) for the request monitor.
pub trait MonitoredRequest {
    /// What the workload produces.
    type Output;

    /// The name of the process instance as derivable from this execution.
    ///
    /// Consulted once, for the first monitored request, when configuration
    /// does not name the instance.
    fn instance_name(&self) -> Option<String> {
        None
    }

    /// Creates the trace for this execution.
    ///
    /// Called after admission checks pass and before [`execute`].
    /// A trace whose name resolves to the empty string opts out of
    /// monitoring entirely.
    ///
    /// [`execute`]: MonitoredRequest::execute
    fn create_request_trace(&mut self) -> RequestTrace;

    /// Runs the actual workload.
    fn execute(&mut self) -> Result<Self::Output, BoxError>;

    /// Called after timing has stopped and before the trace is reported.
    ///
    /// This is the place to record data that only exists after the
    /// execution, like an HTTP status code.
    fn on_post_execute(&mut self, trace: &mut RequestTrace) {
        let _ = trace;
    }

    /// The forwarding policy for nested monitored executions.
    ///
    /// When one monitored execution dispatches to another on the same
    /// thread, only one of the two is measured: the inner (forwarded) one if
    /// this returns `true`, the outer (forwarding) one if it returns
    /// `false`.
    fn monitors_forwarded_executions(&self) -> bool {
        false
    }
}

/// Monitors a plain method or function call.
///
/// Only the outermost monitored call of a thread is measured. If
/// `monitored1()` calls `monitored2()`, invoking `monitored1()` records one
/// trace for `monitored1` and none for `monitored2`; invoking `monitored2()`
/// directly records `monitored2`.
pub struct MonitoredMethodRequest<F> {
    method_signature: String,
    execution: F,
    parameters: Vec<String>,
}

impl<F, T> MonitoredMethodRequest<F>
where
    F: FnMut() -> Result<T, BoxError>,
{
    /// Creates the adapter for a call with the given signature.
    pub fn new(method_signature: impl Into<String>, execution: F) -> MonitoredMethodRequest<F> {
        MonitoredMethodRequest {
            method_signature: method_signature.into(),
            execution,
            parameters: Vec::new(),
        }
    }

    /// Additionally captures the call's parameters onto the trace, keyed by
    /// position.
    pub fn with_parameters(
        method_signature: impl Into<String>,
        execution: F,
        parameters: Vec<String>,
    ) -> MonitoredMethodRequest<F> {
        MonitoredMethodRequest {
            method_signature: method_signature.into(),
            execution,
            parameters,
        }
    }
}

impl<F, T> MonitoredRequest for MonitoredMethodRequest<F>
where
    F: FnMut() -> Result<T, BoxError>,
{
    type Output = T;

    fn create_request_trace(&mut self) -> RequestTrace {
        let mut trace = RequestTrace::new(None, self.method_signature.as_str());
        if !self.parameters.is_empty() {
            let parameters: BTreeMap<String, String> = self
                .parameters
                .iter()
                .enumerate()
                .map(|(position, value)| (position.to_string(), value.clone()))
                .collect();
            trace.set_parameters(parameters);
        }
        trace
    }

    fn execute(&mut self) -> Result<Self::Output, BoxError> {
        (self.execution)()
    }

    fn monitors_forwarded_executions(&self) -> bool {
        false
    }
}
