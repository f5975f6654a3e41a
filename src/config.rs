//! Monitor configuration.

use std::collections::HashSet;

/// Configuration of a [`RequestMonitor`](crate::RequestMonitor).
///
/// All values are plain typed fields; how they are loaded (files,
/// environment, a remote config service) is up to the embedding application.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Master switch. When `false` the monitor passes executions through
    /// untouched.
    pub active: bool,
    /// Whether the monitor measures its own overhead into the
    /// `internal_overhead_request_monitor` timer.
    pub internal_monitoring: bool,
    /// The application name of the measurement session.
    pub application_name: Option<String>,
    /// The instance name of the measurement session. When unset, the first
    /// monitored request may supply one.
    pub instance_name: Option<String>,
    /// Number of requests that must have passed before measuring starts.
    pub warmup_requests: u32,
    /// Seconds that must have passed since startup before measuring starts.
    pub warmup_seconds: u64,
    /// Whether per-request statistics are collected at all.
    pub collect_request_stats: bool,
    /// Whether CPU time is measured per request.
    pub collect_cpu_time: bool,
    /// Whether database time is tracked per request name in addition to the
    /// aggregate.
    pub collect_db_time_per_request: bool,
    /// Whether call-stack profiling is enabled.
    pub profiler_active: bool,
    /// Collect a call stack every `n` requests per request name. `1`
    /// profiles every request, `0` disables profiling.
    pub call_stack_every_x_requests_to_group: u32,
    /// Prunes profiled calls faster than this percentage of the total
    /// request duration (0..100). `0` keeps everything.
    pub min_execution_time_percent: f64,
    /// Whether client ips are anonymised before they are recorded.
    pub anonymize_ips: bool,
    /// Base URL of the Elasticsearch node traces are reported to. Unset
    /// disables the Elasticsearch reporter.
    pub elasticsearch_url: Option<String>,
    /// Prefix of the date-suffixed Elasticsearch index.
    pub elasticsearch_index_prefix: String,
    /// Upper bound of traces reported to Elasticsearch per minute. `0`
    /// disables the reporter, `u32::MAX` means unlimited.
    pub only_report_n_requests_per_minute_to_elasticsearch: u32,
    /// When non-empty, only traces with one of these names are reported to
    /// Elasticsearch.
    pub only_report_requests_with_name_to_elasticsearch: HashSet<String>,
    /// Capacity of the asynchronous reporting queue. Traces submitted while
    /// the queue is full are dropped.
    pub thread_pool_queue_capacity_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> MonitorConfig {
        MonitorConfig {
            active: true,
            internal_monitoring: false,
            application_name: None,
            instance_name: None,
            warmup_requests: 0,
            warmup_seconds: 0,
            collect_request_stats: true,
            collect_cpu_time: true,
            collect_db_time_per_request: false,
            profiler_active: false,
            call_stack_every_x_requests_to_group: 1,
            min_execution_time_percent: 0.0,
            anonymize_ips: true,
            elasticsearch_url: None,
            elasticsearch_index_prefix: "reqwatch-requests".to_owned(),
            only_report_n_requests_per_minute_to_elasticsearch: u32::MAX,
            only_report_requests_with_name_to_elasticsearch: HashSet::new(),
            thread_pool_queue_capacity_limit: 1_000,
        }
    }
}
