//! The request trace: the record of one monitored execution.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::Serializer;
use serde::Serialize;
use uuid::Uuid;

use crate::http::HttpRequestData;
use crate::profiler::CallStackElement;
use crate::session::MeasurementSession;

/// How a trace obtains its name.
///
/// Most workloads know their name up front; HTTP dispatch only knows it
/// reliably once the request has been handled, so the name can be deferred
/// behind a callback that the monitor resolves once, after execution.
pub enum RequestName {
    /// A name that is resolved lazily, at most once.
    Deferred(Box<dyn FnOnce() -> String + Send>),
    /// A name that is already known.
    Resolved(String),
}

impl RequestName {
    /// A name resolved later via the given callback.
    pub fn deferred(resolve: impl FnOnce() -> String + Send + 'static) -> RequestName {
        RequestName::Deferred(Box::new(resolve))
    }

    /// An eagerly known name.
    pub fn eager(name: impl Into<String>) -> RequestName {
        RequestName::Resolved(name.into())
    }
}

impl From<&str> for RequestName {
    fn from(name: &str) -> RequestName {
        RequestName::eager(name)
    }
}

impl From<String> for RequestName {
    fn from(name: String) -> RequestName {
        RequestName::Resolved(name)
    }
}

impl fmt::Debug for RequestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestName::Deferred(_) => f.write_str("RequestName::Deferred(..)"),
            RequestName::Resolved(name) => f.debug_tuple("RequestName::Resolved").field(name).finish(),
        }
    }
}

impl Serialize for RequestName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestName::Resolved(name) => serializer.serialize_str(name),
            RequestName::Deferred(_) => serializer.serialize_none(),
        }
    }
}

/// The measurements and metadata of a single monitored execution.
///
/// A trace is built up by the monitor and the workload adapter while the
/// request runs and is handed to the reporters once finished. Reporters see
/// it immutably; the handing over transfers ownership, so no further
/// mutation is possible after publishing.
#[derive(Debug, Serialize)]
pub struct RequestTrace {
    id: String,
    name: RequestName,
    #[serde(rename = "@timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    application: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance: Option<String>,
    execution_time_ms: u64,
    execution_time_cpu_ms: u64,
    execution_time_db_ms: u64,
    execution_count_db: u64,
    error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_stack: Option<CallStackElement>,
    #[serde(flatten)]
    http: Option<HttpRequestData>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    parameters: BTreeMap<String, String>,
}

impl RequestTrace {
    /// Creates a trace with the given id, or a fresh UUID when `id` is
    /// `None`.
    pub fn new(id: Option<String>, name: impl Into<RequestName>) -> RequestTrace {
        RequestTrace {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: name.into(),
            timestamp: Utc::now(),
            application: None,
            host: None,
            instance: None,
            execution_time_ms: 0,
            execution_time_cpu_ms: 0,
            execution_time_db_ms: 0,
            execution_count_db: 0,
            error: false,
            failure_message: None,
            call_stack: None,
            http: None,
            parameters: BTreeMap::new(),
        }
    }

    /// The unique id of this trace.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The resolved name, or `None` while a deferred name is still pending.
    pub fn name(&self) -> Option<&str> {
        match &self.name {
            RequestName::Resolved(name) => Some(name),
            RequestName::Deferred(_) => None,
        }
    }

    /// Resolves and memoises the name. The callback of a deferred name runs
    /// at most once; later calls return the stored result.
    pub fn resolve_name(&mut self) -> &str {
        if let RequestName::Deferred(_) = self.name {
            match std::mem::replace(&mut self.name, RequestName::Resolved(String::new())) {
                RequestName::Deferred(resolve) => self.name = RequestName::Resolved(resolve()),
                RequestName::Resolved(name) => self.name = RequestName::Resolved(name),
            }
        }
        match &self.name {
            RequestName::Resolved(name) => name,
            RequestName::Deferred(_) => "",
        }
    }

    pub(crate) fn set_measurement_session(&mut self, session: &MeasurementSession) {
        self.application = session.application_name().map(str::to_owned);
        self.host = session.host_name().map(str::to_owned);
        self.instance = session.instance_name().map(str::to_owned);
    }

    /// Wall-clock execution time in milliseconds.
    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    pub(crate) fn set_execution_time_ms(&mut self, millis: u64) {
        self.execution_time_ms = millis;
    }

    /// CPU execution time in milliseconds.
    pub fn execution_time_cpu_ms(&self) -> u64 {
        self.execution_time_cpu_ms
    }

    pub(crate) fn set_execution_time_cpu_ms(&mut self, millis: u64) {
        self.execution_time_cpu_ms = millis;
    }

    /// Total time spent in database calls, in milliseconds.
    pub fn execution_time_db_ms(&self) -> u64 {
        self.execution_time_db_ms
    }

    /// Sets the accumulated database time.
    pub fn set_execution_time_db_ms(&mut self, millis: u64) {
        self.execution_time_db_ms = millis;
    }

    /// Number of database calls issued by this execution.
    pub fn execution_count_db(&self) -> u64 {
        self.execution_count_db
    }

    /// Sets the database call count.
    pub fn set_execution_count_db(&mut self, count: u64) {
        self.execution_count_db = count;
    }

    /// Records one completed database call.
    pub fn record_db_call(&mut self, duration_ms: u64) {
        self.execution_count_db += 1;
        self.execution_time_db_ms += duration_ms;
    }

    /// Whether the execution failed.
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Flags this execution as failed.
    pub fn set_error(&mut self, error: bool) {
        self.error = error;
    }

    /// Records a failure: sets the error flag and captures the message.
    pub fn record_failure(&mut self, error: &dyn std::error::Error) {
        self.error = true;
        self.failure_message = Some(error.to_string());
    }

    /// The captured failure message, if any.
    pub fn failure_message(&self) -> Option<&str> {
        self.failure_message.as_deref()
    }

    /// The profiled call tree, if this request was profiled.
    pub fn call_stack(&self) -> Option<&CallStackElement> {
        self.call_stack.as_ref()
    }

    pub(crate) fn set_call_stack(&mut self, call_stack: CallStackElement) {
        self.call_stack = Some(call_stack);
    }

    /// The HTTP extension of this trace, if it describes an HTTP request.
    pub fn http(&self) -> Option<&HttpRequestData> {
        self.http.as_ref()
    }

    /// Mutable access to the HTTP extension.
    pub fn http_mut(&mut self) -> Option<&mut HttpRequestData> {
        self.http.as_mut()
    }

    /// Attaches the HTTP extension.
    pub fn set_http(&mut self, http: HttpRequestData) {
        self.http = Some(http);
    }

    /// The captured request parameters.
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Replaces the captured request parameters.
    pub fn set_parameters(&mut self, parameters: BTreeMap<String, String>) {
        self.parameters = parameters;
    }
}
