//! The request monitor: owns the lifecycle of monitored executions.

use std::cell::RefCell;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::MonitorConfig;
use crate::metrics::{name, MetricName, MetricRegistry};
use crate::monitored::{BoxError, MonitoredRequest};
use crate::profiler;
use crate::reporter::{ReportPipeline, ReporterRegistry, RequestTraceReporter};
use crate::reporters::{ElasticsearchReporter, LogReporter};
use crate::session::{self, MeasurementSession};
use crate::trace::RequestTrace;

thread_local! {
    // The per-thread stack of executions currently inside the monitor. The
    // top frame is the current request; a frame below it is the execution
    // that forwarded to it.
    static CURRENT: RefCell<Vec<RequestFrame>> = const { RefCell::new(Vec::new()) };
}

type RequestCallback = Arc<dyn Fn() + Send + Sync>;

/// The engine-internal state of one execution.
struct RequestFrame {
    trace: Option<RequestTrace>,
    start: Instant,
    start_cpu_ns: u64,
    overhead1: Duration,
    startup: Option<JoinHandle<()>>,
    first_request: bool,
    stats_admitted: bool,
    forwarded: bool,
    forwarding: bool,
    profiling: bool,
    timer_name: Option<MetricName>,
}

#[derive(Default)]
struct StopOutcome {
    trace_id: Option<String>,
    request_name: Option<String>,
    monitored: bool,
}

/// What [`RequestMonitor::monitor`] hands back for a successful execution.
#[derive(Debug)]
pub struct RequestInformation<T> {
    result: T,
    trace_id: Option<String>,
    request_name: Option<String>,
    monitored: bool,
}

impl<T> RequestInformation<T> {
    /// The value the workload produced.
    pub fn result(&self) -> &T {
        &self.result
    }

    /// Consumes the info, returning the workload's value.
    pub fn into_result(self) -> T {
        self.result
    }

    /// The id of the reported trace, if the execution was monitored.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// The resolved request name, if the execution was monitored.
    pub fn request_name(&self) -> Option<&str> {
        self.request_name.as_deref()
    }

    /// Whether this execution passed admission and produced a trace.
    pub fn was_monitored(&self) -> bool {
        self.monitored
    }
}

struct MonitorInner {
    config: MonitorConfig,
    registry: Arc<MetricRegistry>,
    reporters: Arc<ReporterRegistry>,
    pipeline: ReportPipeline,
    session: Mutex<Option<MeasurementSession>>,
    session_established: AtomicBool,
    end_of_warmup: Instant,
    warmed_up: AtomicBool,
    no_of_requests: AtomicU64,
    started: AtomicBool,
    cpu_time_supported: bool,
    on_before: RwLock<Arc<Vec<RequestCallback>>>,
    on_after: RwLock<Arc<Vec<RequestCallback>>>,
}

/// Measures monitored executions: timing, optional call-stack profiling,
/// metric emission and asynchronous reporting.
///
/// The monitor is cheap to clone; clones share all state. Every monitor
/// instance is fully isolated from other instances, with its own metric
/// registry, reporters and reporting queue.
#[derive(Clone)]
pub struct RequestMonitor {
    inner: Arc<MonitorInner>,
}

impl fmt::Debug for RequestMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMonitor")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl RequestMonitor {
    /// Creates a monitor with a fresh metric registry.
    pub fn new(config: MonitorConfig) -> RequestMonitor {
        RequestMonitor::with_registry(config, Arc::new(MetricRegistry::new()))
    }

    /// Creates a monitor emitting into an existing metric registry.
    ///
    /// The log reporter and, when configured, the Elasticsearch reporter are
    /// installed by default; more reporters can be added with
    /// [`add_reporter`](RequestMonitor::add_reporter).
    pub fn with_registry(config: MonitorConfig, registry: Arc<MetricRegistry>) -> RequestMonitor {
        let reporters: Vec<Arc<dyn RequestTraceReporter>> = vec![
            Arc::new(LogReporter::new()),
            Arc::new(ElasticsearchReporter::new(&config)),
        ];
        let reporters = Arc::new(ReporterRegistry::new(reporters));
        let pipeline = ReportPipeline::new(reporters.clone(), config.thread_pool_queue_capacity_limit);
        let end_of_warmup = Instant::now() + Duration::from_secs(config.warmup_seconds);
        RequestMonitor {
            inner: Arc::new(MonitorInner {
                registry,
                reporters,
                pipeline,
                session: Mutex::new(None),
                session_established: AtomicBool::new(false),
                end_of_warmup,
                warmed_up: AtomicBool::new(false),
                no_of_requests: AtomicU64::new(0),
                started: AtomicBool::new(false),
                cpu_time_supported: thread_cpu_time_ns().is_some(),
                on_before: RwLock::new(Arc::new(Vec::new())),
                on_after: RwLock::new(Arc::new(Vec::new())),
                config,
            }),
        }
    }

    /// The configuration this monitor runs with.
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// The metric registry this monitor emits into.
    pub fn registry(&self) -> Arc<MetricRegistry> {
        self.inner.registry.clone()
    }

    /// The current measurement session, once one exists.
    pub fn measurement_session(&self) -> Option<MeasurementSession> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers a reporter. The most recently added reporter is consulted
    /// first. Registering the same reporter twice delivers every trace to it
    /// twice.
    pub fn add_reporter(&self, reporter: Arc<dyn RequestTraceReporter>) {
        self.inner.reporters.add(reporter);
    }

    /// Registers a callback invoked before every admitted execution.
    pub fn add_on_before_request_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        add_callback(&self.inner.on_before, Arc::new(callback));
    }

    /// Registers a callback invoked after every execution.
    pub fn add_on_after_request_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        add_callback(&self.inner.on_after, Arc::new(callback));
    }

    /// Runs and measures one monitored execution.
    ///
    /// The only errors surfacing from this call are the workload's own; a
    /// workload failure is still recorded on the trace, reported and
    /// counted into the error rate before it is returned. Failures of the
    /// monitoring machinery itself are logged and swallowed.
    pub fn monitor<M: MonitoredRequest>(
        &self,
        request: &mut M,
    ) -> Result<RequestInformation<M::Output>, BoxError> {
        // The start path calls into the adapter; a panic there must neither
        // escape nor keep the workload from running. The frame is pushed
        // before the first adapter call, so monitor_stop below still finds
        // and pops it.
        if panic::catch_unwind(panic::AssertUnwindSafe(|| self.monitor_start(request))).is_err() {
            warn!("monitor start panicked, the request runs unmonitored (this panic is ignored)");
        }
        let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| request.execute()));
        if let Ok(Err(error)) = &outcome {
            record_failure_on_current(error.as_ref());
        }
        let stop = panic::catch_unwind(panic::AssertUnwindSafe(|| self.monitor_stop(request)))
            .unwrap_or_else(|_| {
                warn!("monitor stop panicked (this panic is ignored)");
                StopOutcome::default()
            });
        match outcome {
            Ok(Ok(result)) => Ok(RequestInformation {
                result,
                trace_id: stop.trace_id,
                request_name: stop.request_name,
                monitored: stop.monitored,
            }),
            Ok(Err(error)) => Err(error),
            Err(panic) => panic::resume_unwind(panic),
        }
    }

    /// Grants access to the trace of the current thread's innermost
    /// monitored execution.
    ///
    /// Returns `None` outside of a monitored execution, and for executions
    /// that did not pass admission. The callback must not start or stop
    /// monitored executions itself.
    pub fn with_current_request<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&mut RequestTrace) -> R,
    {
        CURRENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            let trace = stack.last_mut()?.trace.as_mut()?;
            Some(f(trace))
        })
    }

    /// Blocks until every trace submitted so far has been handed to the
    /// reporters, or the timeout elapses. Returns `true` when drained.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.inner.pipeline.flush(timeout)
    }

    /// Shuts the reporting pipeline down after draining the outstanding
    /// traces, and clears the calling thread's request stack. Idempotent.
    pub fn close(&self) {
        self.inner.pipeline.close();
        CURRENT.with(|stack| stack.borrow_mut().clear());
    }

    fn monitor_start<M: MonitoredRequest>(&self, request: &mut M) {
        let start = Instant::now();
        let mut frame = RequestFrame {
            trace: None,
            start,
            start_cpu_ns: self.thread_cpu_time(),
            overhead1: Duration::ZERO,
            startup: None,
            first_request: false,
            stats_admitted: false,
            forwarded: false,
            forwarding: false,
            profiling: false,
            timer_name: None,
        };
        // The push happens before any early return so that monitor_stop
        // always finds its frame.
        CURRENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(parent) = stack.last_mut() {
                frame.forwarded = true;
                parent.forwarding = true;
            }
            stack.push(frame);
        });

        if self.inner.config.active {
            self.ensure_measurement_session(request);
            let first_request = self.inner.no_of_requests.load(Ordering::SeqCst) == 0;
            let stats_admitted = self.inner.config.collect_request_stats && self.is_warmed_up();
            let forwarded = with_top(|frame| {
                frame.first_request = first_request;
                frame.stats_admitted = stats_admitted;
                frame.forwarded
            })
            .unwrap_or(false);
            // No nested execution can have attached yet, so only the
            // forwarded side of the matrix matters here.
            let monitored = stats_admitted
                && forwarding_admits(forwarded, false, request.monitors_forwarded_executions());
            if monitored {
                if !self.inner.started.load(Ordering::SeqCst) {
                    let startup = self.start_monitoring();
                    with_top(|frame| frame.startup = startup);
                }
                self.before_execution(request);
            }
        }
        with_top(|frame| frame.overhead1 = start.elapsed());
    }

    fn monitor_stop<M: MonitoredRequest>(&self, request: &mut M) -> StopOutcome {
        let overhead2_start = Instant::now();
        let popped = CURRENT.with(|stack| stack.borrow_mut().pop());
        let Some(mut frame) = popped else {
            warn!("monitor_stop without a matching monitor_start (ignored)");
            return StopOutcome::default();
        };
        let trace_created = frame.trace.is_some();
        let monitored = frame.stats_admitted
            && forwarding_admits(
                frame.forwarded,
                frame.forwarding,
                request.monitors_forwarded_executions(),
            );

        let mut outcome = StopOutcome::default();
        if monitored {
            if let Some(mut trace) = frame.trace.take() {
                if !trace.resolve_name().is_empty() {
                    outcome.monitored = true;
                    if let Some(startup) = frame.startup.take() {
                        if startup.join().is_err() {
                            warn!("waiting for monitor startup failed (this error is ignored)");
                        }
                    }
                    let reported = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                        self.after_execution(request, &mut frame, trace)
                    }));
                    match reported {
                        Ok((trace_id, request_name)) => {
                            outcome.trace_id = Some(trace_id);
                            outcome.request_name = Some(request_name);
                        }
                        Err(_) => warn!("request post-processing panicked (this panic is ignored)"),
                    }
                }
            }
        }
        if !outcome.monitored {
            // An execution that got a timer but was never measured must not
            // leave the empty timer behind.
            self.remove_timer_if_count_is_zero(&frame);
        }
        if trace_created {
            profiler::clear();
        }
        if !frame.first_request {
            self.track_overhead(frame.overhead1, overhead2_start);
        }
        self.run_callbacks(&self.inner.on_after);
        outcome
    }

    fn before_execution<M: MonitoredRequest>(&self, request: &mut M) {
        let mut trace = request.create_request_trace();
        if let Some(session) = self.measurement_session() {
            trace.set_measurement_session(&session);
        }
        let mut timer_name = None;
        let profiling = self.profile_this_request(&mut trace, &mut timer_name);
        if profiling {
            profiler::activate("total");
        }
        with_top(|frame| {
            frame.trace = Some(trace);
            frame.profiling = profiling;
            frame.timer_name = timer_name;
        });
        self.run_callbacks(&self.inner.on_before);
    }

    fn after_execution<M: MonitoredRequest>(
        &self,
        request: &mut M,
        frame: &mut RequestFrame,
        mut trace: RequestTrace,
    ) -> (String, String) {
        let execution_time = frame.start.elapsed();
        let cpu_time =
            Duration::from_nanos(self.thread_cpu_time().saturating_sub(frame.start_cpu_ns));
        trace.set_execution_time_ms(execution_time.as_millis() as u64);
        trace.set_execution_time_cpu_ms(cpu_time.as_millis() as u64);
        request.on_post_execute(&mut trace);

        let request_name = trace.resolve_name().to_owned();
        if frame.profiling {
            if let Some(mut root) = profiler::deactivate() {
                root.set_signature(request_name.as_str());
                let percent = self.inner.config.min_execution_time_percent;
                if percent > 0.0 {
                    let threshold = (root.execution_time() as f64 * percent / 100.0) as u64;
                    root.remove_calls_faster_than(threshold);
                }
                trace.set_call_stack(root);
            }
        }

        let trace_id = trace.id().to_owned();
        let is_error = trace.is_error();
        let db_time_ms = trace.execution_time_db_ms();
        let db_count = trace.execution_count_db();
        self.inner.pipeline.submit(trace);
        self.track_metrics(
            frame,
            &request_name,
            execution_time,
            cpu_time,
            is_error,
            db_time_ms,
            db_count,
        );
        (trace_id, request_name)
    }

    /// Whether to collect a call stack for this request.
    ///
    /// Grouped profiling (`call_stack_every_x_requests_to_group > 1`) only
    /// profiles when the request name has been seen before and some
    /// reporter would actually consume the stack.
    fn profile_this_request(
        &self,
        trace: &mut RequestTrace,
        timer_name: &mut Option<MetricName>,
    ) -> bool {
        let config = &self.inner.config;
        if !config.profiler_active {
            return false;
        }
        let every_x = config.call_stack_every_x_requests_to_group;
        if every_x == 1 {
            return true;
        }
        if every_x < 1 {
            return false;
        }
        let metric_name = response_time_metric_name(trace.resolve_name());
        *timer_name = Some(metric_name.clone());
        let timer = self.inner.registry.timer(metric_name);
        if timer.count() == 0 {
            return false;
        }
        timer.count() % u64::from(every_x) == 0 && self.inner.reporters.is_any_active(trace)
    }

    fn track_metrics(
        &self,
        frame: &mut RequestFrame,
        request_name: &str,
        execution_time: Duration,
        cpu_time: Duration,
        is_error: bool,
        db_time_ms: u64,
        db_count: u64,
    ) {
        let config = &self.inner.config;
        let registry = &self.inner.registry;

        let timer_name = response_time_metric_name(request_name);
        if frame.timer_name.is_none() {
            frame.timer_name = Some(timer_name.clone());
        }
        registry.timer(timer_name).update(execution_time);
        registry
            .timer(response_time_metric_name("All"))
            .update(execution_time);

        if config.collect_cpu_time {
            registry
                .timer(name("response_time_cpu").tag("request_name", request_name).layer("All"))
                .update(cpu_time);
            registry
                .timer(name("response_time_cpu").tag("request_name", "All").layer("All"))
                .update(cpu_time);
        }

        if is_error {
            registry
                .meter(name("error_rate_server").tag("request_name", request_name).layer("All"))
                .mark();
            registry
                .meter(name("error_rate_server").tag("request_name", "All").layer("All"))
                .mark();
        }

        if db_count > 0 {
            if config.collect_db_time_per_request {
                registry
                    .timer(
                        name("response_time_server")
                            .tag("request_name", request_name)
                            .layer("jdbc"),
                    )
                    .update(Duration::from_millis(db_time_ms));
            }
            registry
                .timer(name("response_time_server").tag("request_name", "All").layer("jdbc"))
                .update(Duration::from_millis(db_time_ms));
            registry
                .meter(name("jdbc_query_rate").tag("request_name", request_name))
                .mark_n(db_count);
        }
    }

    fn remove_timer_if_count_is_zero(&self, frame: &RequestFrame) {
        if let Some(timer_name) = &frame.timer_name {
            let unused = self
                .inner
                .registry
                .get_timer(timer_name)
                .is_some_and(|timer| timer.count() == 0);
            if unused {
                self.inner.registry.remove_timer(timer_name);
            }
        }
    }

    fn track_overhead(&self, overhead1: Duration, overhead2_start: Instant) {
        if self.inner.config.internal_monitoring {
            let overhead2 = overhead2_start.elapsed();
            self.inner
                .registry
                .timer(name("internal_overhead_request_monitor"))
                .update(overhead1 + overhead2);
        }
    }

    /// The warm-up predicate. Requests are only measured once both the
    /// request count threshold and the warm-up deadline have passed.
    fn is_warmed_up(&self) -> bool {
        let inner = &self.inner;
        if inner.warmed_up.load(Ordering::SeqCst) {
            return true;
        }
        let requests = inner.no_of_requests.fetch_add(1, Ordering::SeqCst) + 1;
        let warmed = requests > u64::from(inner.config.warmup_requests)
            && Instant::now() > inner.end_of_warmup;
        if warmed {
            inner.warmed_up.store(true, Ordering::SeqCst);
        }
        warmed
    }

    /// Lazily creates the measurement session, and upgrades its instance
    /// name from the execution when configuration left it unset.
    ///
    /// Only first callers are serialised here; once the session carries an
    /// instance name nothing can change any more and the check degrades to
    /// a single atomic load.
    fn ensure_measurement_session<M: MonitoredRequest>(&self, request: &M) {
        if self.inner.session_established.load(Ordering::Acquire) {
            return;
        }
        let mut session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if session.is_none() {
            *session = Some(MeasurementSession::new(
                self.inner.config.application_name.clone(),
                session::local_host_name(),
                self.inner.config.instance_name.clone(),
            ));
        }
        let needs_instance = session
            .as_ref()
            .is_some_and(|current| current.instance_name().is_none());
        if needs_instance {
            if let Some(instance_name) = request.instance_name() {
                if let Some(current) = session.take() {
                    *session = Some(current.with_instance_name(Some(instance_name)));
                }
            }
        }
        if session
            .as_ref()
            .is_some_and(|current| current.instance_name().is_some())
        {
            self.inner.session_established.store(true, Ordering::Release);
        }
    }

    /// One-time asynchronous start-up; only the first caller spawns it.
    fn start_monitoring(&self) -> Option<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let session = self.measurement_session();
        thread::Builder::new()
            .name("monitor-startup".into())
            .spawn(move || match session {
                Some(session) => info!("started monitoring measurement session {session:?}"),
                None => info!("started monitoring"),
            })
            .ok()
    }

    fn run_callbacks(&self, callbacks: &RwLock<Arc<Vec<RequestCallback>>>) {
        let snapshot = callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in snapshot.iter() {
            let callback = callback.as_ref();
            if panic::catch_unwind(panic::AssertUnwindSafe(callback)).is_err() {
                warn!("a request callback panicked (this panic is ignored)");
            }
        }
    }

    fn thread_cpu_time(&self) -> u64 {
        if self.inner.cpu_time_supported {
            thread_cpu_time_ns().unwrap_or(0)
        } else {
            0
        }
    }
}

fn add_callback(list: &RwLock<Arc<Vec<RequestCallback>>>, callback: RequestCallback) {
    let mut list = list.write().unwrap_or_else(PoisonError::into_inner);
    let mut next = Vec::with_capacity(list.len() + 1);
    next.extend(list.iter().cloned());
    next.push(callback);
    *list = Arc::new(next);
}

fn with_top<R>(f: impl FnOnce(&mut RequestFrame) -> R) -> Option<R> {
    CURRENT.with(|stack| stack.borrow_mut().last_mut().map(f))
}

fn record_failure_on_current(error: &(dyn std::error::Error + Send + Sync + 'static)) {
    CURRENT.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            if let Some(trace) = frame.trace.as_mut() {
                trace.record_failure(error);
            }
        }
    });
}

fn response_time_metric_name(request_name: &str) -> MetricName {
    name("response_time_server")
        .tag("request_name", request_name)
        .layer("All")
}

/// Decides admission for nested executions.
///
/// An intermediate hop (both forwarded-to and forwarding onwards) is never
/// measured; for the outermost and innermost execution the adapter's policy
/// picks the side.
fn forwarding_admits(forwarded: bool, forwarding: bool, monitors_forwarded: bool) -> bool {
    match (forwarded, forwarding) {
        (false, false) => true,
        (true, true) => false,
        (true, false) => monitors_forwarded,
        (false, true) => !monitors_forwarded,
    }
}

#[cfg(unix)]
fn thread_cpu_time_ns() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc == 0 {
        Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn thread_cpu_time_ns() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_admission_matrix() {
        // A plain execution is always admitted.
        assert!(forwarding_admits(false, false, true));
        assert!(forwarding_admits(false, false, false));
        // An intermediate hop never is.
        assert!(!forwarding_admits(true, true, true));
        assert!(!forwarding_admits(true, true, false));
        // The innermost execution wins iff forwarded executions are
        // monitored; the outermost wins otherwise.
        assert!(forwarding_admits(true, false, true));
        assert!(!forwarding_admits(true, false, false));
        assert!(!forwarding_admits(false, true, true));
        assert!(forwarding_admits(false, true, false));
    }

    #[test]
    fn test_warmup_requires_count_and_deadline() {
        let monitor = RequestMonitor::new(MonitorConfig {
            warmup_requests: 2,
            warmup_seconds: 0,
            ..MonitorConfig::default()
        });
        assert!(!monitor.is_warmed_up());
        assert!(!monitor.is_warmed_up());
        assert!(monitor.is_warmed_up());
        // Once warmed up, the counter is left alone.
        assert_eq!(monitor.inner.no_of_requests.load(Ordering::SeqCst), 3);
        assert!(monitor.is_warmed_up());
        assert_eq!(monitor.inner.no_of_requests.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_warmup_deadline_alone_blocks() {
        let monitor = RequestMonitor::new(MonitorConfig {
            warmup_requests: 0,
            warmup_seconds: 3_600,
            ..MonitorConfig::default()
        });
        assert!(!monitor.is_warmed_up());
    }
}
