//! HTTP flavoured request monitoring.
//!
//! Web frameworks adapt their request/response types into the
//! framework-agnostic [`HttpRequest`] description and hand it, together with
//! the handler invocation, to a [`MonitoredHttpRequest`]. The adapter fills
//! the [`HttpRequestData`] extension of the trace and emits the HTTP
//! throughput metrics.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use crate::metrics::{name, MetricRegistry};
use crate::monitor::RequestMonitor;
use crate::monitored::{BoxError, MonitoredRequest};
use crate::trace::{RequestName, RequestTrace};

/// Header carrying the in-browser widget's connection id.
pub const CONNECTION_ID_HEADER: &str = "x-reqwatch-connection-id";

/// Proxy headers inspected for the originating client ip, in order.
const FORWARDED_IP_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "proxy-client-ip",
    "wl-proxy-client-ip",
    "http_client_ip",
    "http_x_forwarded_for",
];

/// Headers never captured onto a trace.
const EXCLUDED_HEADERS: &[&str] = &["cookie", "authorization"];

/// The HTTP extension of a request trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HttpRequestData {
    /// The request path as received.
    pub url: String,
    /// The HTTP method.
    pub method: String,
    /// The response status code, set after execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Number of response body bytes written.
    pub bytes_written: u64,
    /// The originating client ip, possibly anonymised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// The authenticated user, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Captured request headers (lower-cased names, confidential ones
    /// excluded).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// The client session id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The widget connection id, if the in-browser widget is in use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Whether the in-browser widget may be shown for this request.
    pub show_widget: bool,
}

impl HttpRequestData {
    /// Creates the extension for the given path and method.
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> HttpRequestData {
        HttpRequestData {
            url: url.into(),
            method: method.into(),
            status_code: None,
            bytes_written: 0,
            client_ip: None,
            username: None,
            headers: BTreeMap::new(),
            session_id: None,
            connection_id: None,
            show_widget: false,
        }
    }
}

/// A framework-agnostic description of an incoming HTTP request.
///
/// Header names are expected lower-cased; adapters for specific frameworks
/// are responsible for that normalisation.
#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
    /// The HTTP method.
    pub method: String,
    /// The request path, including any path parameters.
    pub uri: String,
    /// Request headers with lower-cased names.
    pub headers: BTreeMap<String, String>,
    /// Decoded request parameters.
    pub parameters: BTreeMap<String, String>,
    /// The peer address of the connection.
    pub remote_addr: Option<String>,
    /// The client session id.
    pub session_id: Option<String>,
    /// The authenticated user name.
    pub username: Option<String>,
    /// The server (virtual host) name the request was addressed to.
    pub server_name: Option<String>,
}

/// The outcome of handling an HTTP request, as far as monitoring cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// The response status code.
    pub status_code: u16,
    /// Number of body bytes written.
    pub bytes_written: u64,
}

/// Derives the request name as `"<METHOD> <path>"`.
///
/// Path parameters in servlet style (`/owners;jsessionid=4711/find`) are
/// stripped so that they do not explode the name cardinality.
pub fn request_name(method: &str, uri: &str) -> String {
    format!("{} {}", method, remove_semicolon_content(uri))
}

fn remove_semicolon_content(uri: &str) -> String {
    let mut uri = uri.to_owned();
    while let Some(semicolon) = uri.find(';') {
        match uri[semicolon..].find('/') {
            Some(offset) => uri.replace_range(semicolon..semicolon + offset, ""),
            None => uri.truncate(semicolon),
        }
    }
    uri
}

/// Determines the originating client ip of a request.
///
/// Walks the well-known proxy headers in order and falls back to the peer
/// address of the connection.
pub fn client_ip(request: &HttpRequest) -> Option<String> {
    FORWARDED_IP_HEADERS
        .iter()
        .filter_map(|header| request.headers.get(*header))
        .map(|value| value.split(',').next().unwrap_or(value).trim())
        .find(|value| !value.is_empty() && !value.eq_ignore_ascii_case("unknown"))
        .map(str::to_owned)
        .or_else(|| request.remote_addr.clone())
}

/// Anonymises an ip address: the last octet of an IPv4 address and the last
/// 10 bytes of an IPv6 address are zeroed.
///
/// Values that do not parse as an ip address are returned unchanged.
pub fn anonymize_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let mut octets = v4.octets();
            octets[3] = 0;
            IpAddr::from(octets).to_string()
        }
        Ok(IpAddr::V6(v6)) => {
            let mut octets = v6.octets();
            for octet in &mut octets[6..] {
                *octet = 0;
            }
            IpAddr::from(octets).to_string()
        }
        Err(_) => ip.to_owned(),
    }
}

fn is_param_confidential(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["pass", "pwd", "credit"].iter().any(|marker| key.contains(marker))
}

/// Masks confidential request parameters (`pass`, `pwd`, `credit`).
pub fn safe_parameter_map(parameters: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    parameters
        .iter()
        .map(|(key, value)| {
            let value = if is_param_confidential(key) {
                "XXXX".to_owned()
            } else {
                value.clone()
            };
            (key.clone(), value)
        })
        .collect()
}

fn captured_headers(request: &HttpRequest) -> BTreeMap<String, String> {
    request
        .headers
        .iter()
        .filter(|(key, _)| !EXCLUDED_HEADERS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Monitors the handling of one HTTP request.
///
/// In a web environment the innermost dispatched handler does the actual
/// work, so forwarded executions are the ones worth measuring:
/// [`MonitoredRequest::monitors_forwarded_executions`] returns `true`.
pub struct MonitoredHttpRequest<F> {
    request: HttpRequest,
    handler: F,
    response: Option<HttpResponse>,
    registry: Arc<MetricRegistry>,
    anonymize_ips: bool,
}

impl<F> MonitoredHttpRequest<F>
where
    F: FnMut(&HttpRequest) -> Result<HttpResponse, BoxError>,
{
    /// Creates the adapter for one request/handler pair.
    pub fn new(monitor: &RequestMonitor, request: HttpRequest, handler: F) -> MonitoredHttpRequest<F> {
        MonitoredHttpRequest {
            request,
            handler,
            response: None,
            registry: monitor.registry(),
            anonymize_ips: monitor.config().anonymize_ips,
        }
    }
}

impl<F> MonitoredRequest for MonitoredHttpRequest<F>
where
    F: FnMut(&HttpRequest) -> Result<HttpResponse, BoxError>,
{
    type Output = HttpResponse;

    fn instance_name(&self) -> Option<String> {
        self.request.server_name.clone()
    }

    fn create_request_trace(&mut self) -> RequestTrace {
        let method = self.request.method.clone();
        let uri = self.request.uri.clone();
        let mut trace = RequestTrace::new(
            None,
            RequestName::deferred(move || request_name(&method, &uri)),
        );

        let mut http = HttpRequestData::new(self.request.uri.clone(), self.request.method.clone());
        http.headers = captured_headers(&self.request);
        http.session_id = self.request.session_id.clone();
        http.connection_id = self.request.headers.get(CONNECTION_ID_HEADER).cloned();
        http.username = self.request.username.clone();
        http.client_ip = client_ip(&self.request).map(|ip| {
            if self.anonymize_ips {
                anonymize_ip(&ip)
            } else {
                ip
            }
        });
        trace.set_http(http);
        trace
    }

    fn execute(&mut self) -> Result<Self::Output, BoxError> {
        let response = (self.handler)(&self.request)?;
        self.response = Some(response);
        Ok(response)
    }

    fn on_post_execute(&mut self, trace: &mut RequestTrace) {
        let request_name = trace.resolve_name().to_owned();
        if let Some(response) = self.response {
            if let Some(http) = trace.http_mut() {
                http.status_code = Some(response.status_code);
                http.bytes_written = response.bytes_written;
            }
            self.registry
                .meter(
                    name("request_throughput")
                        .tag("request_name", request_name.clone())
                        .http_code(response.status_code),
                )
                .mark();
            self.registry
                .meter(
                    name("request_throughput")
                        .tag("request_name", "All")
                        .http_code(response.status_code),
                )
                .mark();
            if response.status_code >= 400 {
                trace.set_error(true);
            }
        }
        // Parameters are captured after the execution; capturing them up
        // front can interfere with how the application decodes them.
        trace.set_parameters(safe_parameter_map(&self.request.parameters));
    }

    fn monitors_forwarded_executions(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_name_strips_semicolon_content() {
        assert_eq!(request_name("GET", "/owners"), "GET /owners");
        assert_eq!(request_name("GET", "/owners;jsessionid=4711"), "GET /owners");
        assert_eq!(
            request_name("POST", "/owners;jsessionid=4711/1;a=b/edit"),
            "POST /owners/1/edit"
        );
    }

    #[test]
    fn test_client_ip_prefers_forwarding_headers() {
        let mut request = HttpRequest {
            remote_addr: Some("10.0.0.1".to_owned()),
            ..HttpRequest::default()
        };
        assert_eq!(client_ip(&request).as_deref(), Some("10.0.0.1"));

        request
            .headers
            .insert("x-forwarded-for".to_owned(), "203.0.113.7, 10.0.0.1".to_owned());
        assert_eq!(client_ip(&request).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_client_ip_skips_unknown_header_values() {
        let mut request = HttpRequest {
            remote_addr: Some("10.0.0.1".to_owned()),
            ..HttpRequest::default()
        };
        request.headers.insert("x-forwarded-for".to_owned(), "unknown".to_owned());
        request.headers.insert("x-real-ip".to_owned(), "198.51.100.2".to_owned());
        assert_eq!(client_ip(&request).as_deref(), Some("198.51.100.2"));
    }

    #[test]
    fn test_anonymize_ip() {
        assert_eq!(anonymize_ip("203.0.113.7"), "203.0.113.0");
        assert_eq!(anonymize_ip("2001:db8:85a3::8a2e:370:7334"), "2001:db8:85a3::");
        assert_eq!(anonymize_ip("not-an-ip"), "not-an-ip");
    }

    #[test]
    fn test_safe_parameter_map_masks_confidential_keys() {
        let mut parameters = BTreeMap::new();
        parameters.insert("query".to_owned(), "cats".to_owned());
        parameters.insert("password".to_owned(), "hunter2".to_owned());
        parameters.insert("creditCardNumber".to_owned(), "4111".to_owned());

        let safe = safe_parameter_map(&parameters);
        assert_eq!(safe["query"], "cats");
        assert_eq!(safe["password"], "XXXX");
        assert_eq!(safe["creditCardNumber"], "XXXX");
    }
}
