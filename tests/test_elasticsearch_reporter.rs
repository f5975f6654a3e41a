use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use reqwatch::reporters::{ElasticsearchReporter, IndexSink};
use reqwatch::{MonitorConfig, ReportError, RequestTrace, RequestTraceReporter};

/// Records index calls instead of talking to Elasticsearch.
#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingSink {
    fn new() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::default())
    }

    fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl IndexSink for RecordingSink {
    fn index(&self, index: &str, doc_type: &str, document: &Value) -> Result<(), ReportError> {
        self.calls
            .lock()
            .unwrap()
            .push((index.to_owned(), doc_type.to_owned(), document.clone()));
        Ok(())
    }
}

fn config_reporting_only(names: &[&str], per_minute: u32) -> MonitorConfig {
    MonitorConfig {
        elasticsearch_url: Some("http://localhost:9200".to_owned()),
        only_report_requests_with_name_to_elasticsearch: names
            .iter()
            .map(|name| (*name).to_owned())
            .collect::<HashSet<String>>(),
        only_report_n_requests_per_minute_to_elasticsearch: per_minute,
        ..MonitorConfig::default()
    }
}

#[test]
fn test_matching_trace_is_indexed_once() {
    let sink = RecordingSink::new();
    let reporter =
        ElasticsearchReporter::with_sink(&config_reporting_only(&["Report Me"], u32::MAX), sink.clone());
    let trace = RequestTrace::new(None, "Report Me");

    reporter.report_request_trace(&trace).unwrap();

    let calls = sink.calls();
    assert_eq!(calls.len(), 1);
    let (index, doc_type, document) = &calls[0];
    assert_eq!(*index, format!("reqwatch-requests-{}", Utc::now().format("%Y.%m.%d")));
    assert_eq!(doc_type, "requests");
    assert_eq!(document["name"], "Report Me");
    assert!(reporter.is_active(&trace));
}

#[test]
fn test_name_filter_rejects_without_deactivating() {
    let sink = RecordingSink::new();
    let reporter =
        ElasticsearchReporter::with_sink(&config_reporting_only(&["Report Me"], u32::MAX), sink.clone());
    let trace = RequestTrace::new(None, "Regular Foo");

    reporter.report_request_trace(&trace).unwrap();

    assert!(sink.calls().is_empty());
    // The reporter stays healthy for other traces.
    assert!(reporter.is_active(&trace));
}

#[test]
fn test_rate_limit_of_zero_deactivates_reporting() {
    let sink = RecordingSink::new();
    let reporter = ElasticsearchReporter::with_sink(&config_reporting_only(&["Report Me"], 0), sink.clone());
    let trace = RequestTrace::new(None, "Report Me");

    reporter.report_request_trace(&trace).unwrap();

    assert!(sink.calls().is_empty());
    assert!(!reporter.is_active(&trace));
}

#[test]
fn test_rate_limit_suppresses_the_second_report() {
    let sink = RecordingSink::new();
    let reporter = ElasticsearchReporter::with_sink(&config_reporting_only(&["Report Me"], 1), sink.clone());
    let trace = RequestTrace::new(None, "Report Me");

    reporter.report_request_trace(&trace).unwrap();
    // The rate meter folds events into its moving average roughly every
    // five seconds; only after that does the first report count.
    thread::sleep(Duration::from_millis(5_010));
    reporter.report_request_trace(&trace).unwrap();

    assert_eq!(sink.calls().len(), 1);
}

#[test]
fn test_without_a_configured_url_the_reporter_is_inactive() {
    let config = MonitorConfig::default();
    assert!(config.elasticsearch_url.is_none());
    let reporter = ElasticsearchReporter::new(&config);
    let trace = RequestTrace::new(None, "Report Me");

    assert!(!reporter.is_active(&trace));
    // Reporting against the inactive reporter is a harmless no-op.
    reporter.report_request_trace(&trace).unwrap();
}
