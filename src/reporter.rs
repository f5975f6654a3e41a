//! Reporter capability and the asynchronous reporting pipeline.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::trace::RequestTrace;

/// A sink that drains finished request traces to some destination.
pub trait RequestTraceReporter: Send + Sync {
    /// Whether this reporter currently wants traces at all.
    ///
    /// An inactive reporter is skipped entirely; a reporter may also stay
    /// active and decide per trace inside
    /// [`report_request_trace`](RequestTraceReporter::report_request_trace).
    fn is_active(&self, trace: &RequestTrace) -> bool;

    /// Delivers one finished trace.
    fn report_request_trace(&self, trace: &RequestTrace) -> Result<(), ReportError>;
}

/// Why a reporter failed to deliver a trace.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The trace could not be turned into a document.
    #[error("failed to serialize request trace: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The sink rejected the request or was unreachable.
    #[error("http request failed: {0}")]
    Http(#[from] Box<ureq::Error>),
    /// Any other sink-specific failure.
    #[error("{0}")]
    Sink(String),
}

/// The ordered set of reporters of one monitor.
///
/// Readers take an immutable snapshot per iteration; registration swaps in a
/// new list, so it never blocks or disturbs an iteration in progress.
/// Registration prepends: the most recently added reporter is consulted
/// first.
pub(crate) struct ReporterRegistry {
    reporters: RwLock<Arc<Vec<Arc<dyn RequestTraceReporter>>>>,
}

impl ReporterRegistry {
    pub(crate) fn new(initial: Vec<Arc<dyn RequestTraceReporter>>) -> ReporterRegistry {
        ReporterRegistry {
            reporters: RwLock::new(Arc::new(initial)),
        }
    }

    pub(crate) fn add(&self, reporter: Arc<dyn RequestTraceReporter>) {
        let mut reporters = self.reporters.write().unwrap_or_else(PoisonError::into_inner);
        let mut list = Vec::with_capacity(reporters.len() + 1);
        list.push(reporter);
        list.extend(reporters.iter().cloned());
        *reporters = Arc::new(list);
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<dyn RequestTraceReporter>>> {
        self.reporters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn is_any_active(&self, trace: &RequestTrace) -> bool {
        self.snapshot().iter().any(|reporter| reporter.is_active(trace))
    }
}

enum Task {
    Report(Box<RequestTrace>),
    Flush(SyncSender<()>),
    Shutdown,
}

/// Drains finished traces to the reporters on a single worker thread.
///
/// Submission never blocks the monitored thread: the queue is bounded and a
/// submit against a full queue drops the trace with a warning.
pub(crate) struct ReportPipeline {
    sender: SyncSender<Task>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReportPipeline {
    pub(crate) fn new(registry: Arc<ReporterRegistry>, queue_capacity: usize) -> ReportPipeline {
        let (sender, receiver) = sync_channel(queue_capacity.max(1));
        let handle = thread::Builder::new()
            .name("async-request-reporter".into())
            .spawn(move || ReportPipeline::worker(receiver, registry))
            .ok();
        ReportPipeline {
            sender,
            handle: Mutex::new(handle),
        }
    }

    fn worker(receiver: Receiver<Task>, registry: Arc<ReporterRegistry>) {
        for task in receiver.iter() {
            match task {
                Task::Report(trace) => {
                    let reporters = registry.snapshot();
                    for reporter in reporters.iter() {
                        if reporter.is_active(&trace) {
                            if let Err(error) = reporter.report_request_trace(&trace) {
                                warn!("request trace reporter failed: {error} (this error is ignored)");
                            }
                        }
                    }
                }
                Task::Flush(done) => {
                    done.send(()).ok();
                }
                Task::Shutdown => return,
            }
        }
    }

    pub(crate) fn submit(&self, trace: RequestTrace) {
        match self.sender.try_send(Task::Report(Box::new(trace))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("the reporting queue is full, dropping a request trace; consider raising the queue capacity limit");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("the reporting pipeline is shut down, dropping a request trace");
            }
        }
    }

    /// Waits until every trace submitted so far has been handed to the
    /// reporters. Returns `false` when the timeout elapsed first.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let (done, wait) = sync_channel(1);
        if self.sender.send(Task::Flush(done)).is_err() {
            return false;
        }
        wait.recv_timeout(timeout).is_ok()
    }

    /// Drains outstanding tasks, then stops the worker. Idempotent.
    pub(crate) fn close(&self) {
        let handle = {
            let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
            handle.take()
        };
        if let Some(handle) = handle {
            let _ = self.sender.send(Task::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for ReportPipeline {
    fn drop(&mut self) {
        self.close();
    }
}
