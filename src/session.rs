//! The measurement session: the identity under which traces and metrics are
//! recorded.

use serde::Serialize;

/// Identifies the measured process: application, host and instance.
///
/// Created lazily by the monitor on the first request; the instance name may
/// be upgraded later from a monitored execution when configuration leaves it
/// unset (e.g. the virtual host name of the first HTTP request).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MeasurementSession {
    application_name: Option<String>,
    host_name: Option<String>,
    instance_name: Option<String>,
}

impl MeasurementSession {
    /// Creates a session from the given identity parts.
    pub fn new(
        application_name: Option<String>,
        host_name: Option<String>,
        instance_name: Option<String>,
    ) -> MeasurementSession {
        MeasurementSession {
            application_name,
            host_name,
            instance_name,
        }
    }

    /// The name of the monitored application.
    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    /// The host the application runs on.
    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    /// The instance of the application, e.g. a virtual host.
    pub fn instance_name(&self) -> Option<&str> {
        self.instance_name.as_deref()
    }

    /// The same session with the instance name filled in.
    pub(crate) fn with_instance_name(&self, instance_name: Option<String>) -> MeasurementSession {
        MeasurementSession {
            application_name: self.application_name.clone(),
            host_name: self.host_name.clone(),
            instance_name,
        }
    }
}

/// Returns the name of the local host, if available.
pub(crate) fn local_host_name() -> Option<String> {
    hostname::get().ok().and_then(|s| s.into_string().ok())
}
