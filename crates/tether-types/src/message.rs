//! Request/response data model carried inside wire frames.
//!
//! Parameter values and response payloads are `serde_json::Value` so that
//! every registered serializer (binary or text) can carry them unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Status code of a successful call.
pub const STATUS_OK: u16 = 200;

/// Status code of a failed call (dispatch miss, handler error, codec error).
pub const STATUS_ERROR: u16 = 500;

/// Default service group when the caller does not pick one.
pub const DEFAULT_GROUP: &str = "tether";

/// A remote process, identified by its (host, port) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing host in '{s}'"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{s}': {e}"))?;
        Ok(Self::new(host.trim_start_matches('[').trim_end_matches(']'), port))
    }
}

/// A remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-generated, globally unique correlation id.
    pub request_id: String,
    /// Discovery group the service lives in.
    pub group: String,
    /// Interface (service) name.
    pub interface_name: String,
    /// Service version.
    pub version: String,
    /// Method to invoke.
    pub method_name: String,
    /// Declared parameter type names, in order.
    #[serde(default)]
    pub parameter_types: Vec<String>,
    /// Parameter values, in the same order as `parameter_types`.
    #[serde(default)]
    pub parameter_values: Vec<Value>,
}

impl Request {
    /// Build a request with a fresh v4 UUID as its id and no parameters.
    pub fn new(
        interface_name: impl Into<String>,
        version: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            group: DEFAULT_GROUP.to_string(),
            interface_name: interface_name.into(),
            version: version.into(),
            method_name: method_name.into(),
            parameter_types: Vec::new(),
            parameter_values: Vec::new(),
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Set the discovery group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Append one typed parameter.
    pub fn with_param(mut self, type_name: impl Into<String>, value: Value) -> Self {
        self.parameter_types.push(type_name.into());
        self.parameter_values.push(value);
        self
    }

    /// Key under which the target service is published: interface + version.
    pub fn service_key(&self) -> String {
        service_key(&self.interface_name, &self.version)
    }
}

/// Outcome of a remote call. Echoes the request id it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this response answers.
    pub request_id: String,
    /// [`STATUS_OK`] or [`STATUS_ERROR`].
    pub status_code: u16,
    /// `"success"` or the error code of the failure.
    pub status_message: String,
    /// Return value on success, failure detail otherwise.
    #[serde(default)]
    pub payload: Option<Value>,
}

impl Response {
    /// Successful response carrying the method's return value.
    pub fn success(request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            status_code: STATUS_OK,
            status_message: "success".to_string(),
            payload: Some(payload),
        }
    }

    /// Failed response; `message` is a short error code, `detail` free text.
    pub fn failure(
        request_id: impl Into<String>,
        message: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status_code: STATUS_ERROR,
            status_message: message.into(),
            payload: detail.map(Value::String),
        }
    }

    /// Whether the call succeeded.
    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK
    }
}

/// Compose a service key from interface name and version.
pub fn service_key(interface_name: &str, version: &str) -> String {
    format!("{interface_name}{version}")
}
