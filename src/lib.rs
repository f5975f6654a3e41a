//! In-process request monitoring.
//!
//! `reqwatch` measures discrete units of work — an HTTP invocation, a
//! monitored method call, a background task. It records their wall-clock and
//! CPU cost, optionally captures a hierarchical call-stack profile, feeds
//! per-request metrics into a registry and hands finished traces to a set of
//! pluggable reporters without ever blocking or failing the monitored work.
//!
//! # Quickstart
//!
//! ```
//! use reqwatch::{MonitorConfig, MonitoredMethodRequest, RequestMonitor};
//!
//! let monitor = RequestMonitor::new(MonitorConfig::default());
//! let mut request = MonitoredMethodRequest::new("OwnerService#find", || {
//!     // the workload
//!     Ok(2 + 2)
//! });
//! let info = monitor.monitor(&mut request)?;
//! assert_eq!(*info.result(), 4);
//! # monitor.close();
//! # Ok::<(), reqwatch::BoxError>(())
//! ```
//!
//! Nested monitored executions on the same thread are detected and only one
//! side is measured, depending on the adapter's forwarding policy: method
//! calls record the outermost invocation, HTTP dispatch records the
//! innermost. From anywhere inside a monitored execution the current trace
//! is reachable without passing it around explicitly:
//!
//! ```
//! use reqwatch::RequestMonitor;
//!
//! RequestMonitor::with_current_request(|trace| {
//!     trace.record_db_call(12);
//! });
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod http;
pub mod metrics;
mod monitor;
mod monitored;
pub mod profiler;
mod reporter;
pub mod reporters;
mod session;
mod trace;

pub use config::MonitorConfig;
pub use monitor::{RequestInformation, RequestMonitor};
pub use monitored::{BoxError, MonitoredMethodRequest, MonitoredRequest};
pub use reporter::{ReportError, RequestTraceReporter};
pub use session::MeasurementSession;
pub use trace::{RequestName, RequestTrace};
