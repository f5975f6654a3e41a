//! Reports request traces to an Elasticsearch index.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use log::debug;
use serde_json::Value;

use crate::config::MonitorConfig;
use crate::metrics::Meter;
use crate::reporter::{ReportError, RequestTraceReporter};
use crate::trace::RequestTrace;

/// The document type traces are indexed under.
const DOCUMENT_TYPE: &str = "requests";

/// Indexes one document into a named index.
///
/// Production code uses [`ElasticsearchClient`]; tests inject a recording
/// implementation.
pub trait IndexSink: Send + Sync {
    /// Stores `document` in `index` under the given document type.
    fn index(&self, index: &str, doc_type: &str, document: &Value) -> Result<(), ReportError>;
}

/// A minimal Elasticsearch client: `POST <base>/<index>/<doc_type>`.
pub struct ElasticsearchClient {
    base_url: String,
    agent: ureq::Agent,
}

impl ElasticsearchClient {
    /// Creates a client for the node at `base_url`.
    pub fn new(base_url: impl Into<String>) -> ElasticsearchClient {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        ElasticsearchClient {
            base_url,
            agent: ureq::AgentBuilder::new().build(),
        }
    }
}

impl IndexSink for ElasticsearchClient {
    fn index(&self, index: &str, doc_type: &str, document: &Value) -> Result<(), ReportError> {
        let url = format!("{}/{}/{}", self.base_url, index, doc_type);
        self.agent
            .post(&url)
            .send_json(document)
            .map_err(Box::new)?;
        Ok(())
    }
}

/// Reports traces into a date-suffixed Elasticsearch index, with admission
/// control.
///
/// A trace is only indexed when, in order:
/// 1. an Elasticsearch URL is configured (otherwise the reporter is
///    inactive),
/// 2. the trace name passes the configured name filter,
/// 3. the one-minute report rate has not exceeded the configured per-minute
///    limit. A limit of `0` deactivates the reporter entirely.
///
/// The rate meter folds events into its moving average roughly every five
/// seconds, so the limit is enforced with that granularity.
pub struct ElasticsearchReporter {
    index_prefix: String,
    only_report_requests_with_name: HashSet<String>,
    max_reports_per_minute: u32,
    rate_meter: Meter,
    sink: Option<Arc<dyn IndexSink>>,
}

impl ElasticsearchReporter {
    /// Creates the reporter against the configured Elasticsearch URL.
    pub fn new(config: &MonitorConfig) -> ElasticsearchReporter {
        let sink = config
            .elasticsearch_url
            .as_ref()
            .map(|url| Arc::new(ElasticsearchClient::new(url.clone())) as Arc<dyn IndexSink>);
        ElasticsearchReporter::with_optional_sink(config, sink)
    }

    /// Creates the reporter against a caller-supplied sink.
    pub fn with_sink(config: &MonitorConfig, sink: Arc<dyn IndexSink>) -> ElasticsearchReporter {
        ElasticsearchReporter::with_optional_sink(config, Some(sink))
    }

    fn with_optional_sink(
        config: &MonitorConfig,
        sink: Option<Arc<dyn IndexSink>>,
    ) -> ElasticsearchReporter {
        ElasticsearchReporter {
            index_prefix: config.elasticsearch_index_prefix.clone(),
            only_report_requests_with_name: config
                .only_report_requests_with_name_to_elasticsearch
                .clone(),
            max_reports_per_minute: config.only_report_n_requests_per_minute_to_elasticsearch,
            rate_meter: Meter::new(),
            sink,
        }
    }

    fn index_name(&self) -> String {
        format!("{}-{}", self.index_prefix, Utc::now().format("%Y.%m.%d"))
    }

    fn rate_limit_exceeded(&self) -> bool {
        self.rate_meter.one_minute_rate() * 60.0 > f64::from(self.max_reports_per_minute)
    }
}

impl RequestTraceReporter for ElasticsearchReporter {
    fn is_active(&self, _trace: &RequestTrace) -> bool {
        self.sink.is_some() && self.max_reports_per_minute != 0
    }

    fn report_request_trace(&self, trace: &RequestTrace) -> Result<(), ReportError> {
        let Some(sink) = self.sink.as_ref() else {
            return Ok(());
        };
        if self.max_reports_per_minute == 0 {
            return Ok(());
        }
        let name = trace.name().unwrap_or("");
        if !self.only_report_requests_with_name.is_empty()
            && !self.only_report_requests_with_name.contains(name)
        {
            return Ok(());
        }
        if self.rate_limit_exceeded() {
            debug!("request trace {name:?} not reported to elasticsearch, the per-minute limit is reached");
            return Ok(());
        }
        self.rate_meter.mark();
        let document = serde_json::to_value(trace)?;
        sink.index(&self.index_name(), DOCUMENT_TYPE, &document)
    }
}
