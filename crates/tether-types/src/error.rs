//! Shared error types for the tether transport.

use thiserror::Error;

/// Top-level error type for every transport operation.
///
/// The type is `Clone` because a single channel failure is fanned out to all
/// calls still waiting on that channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Bad magic, version mismatch, undersized or oversized frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No compressor or serializer is registered under the requested id/name.
    #[error("No {kind} registered for '{name}'")]
    CodecNotFound {
        /// `"compressor"` or `"serializer"`.
        kind: &'static str,
        /// The name (or numeric id) that failed to resolve.
        name: String,
    },

    /// A registered codec failed on its input.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Connect failure or I/O failure on a live connection.
    #[error("Network error: {0}")]
    Network(String),

    /// The channel carrying a pending call went inactive before the reply.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// No service is published under the requested key.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// The service exists but has no method with that name and signature.
    #[error("Method not found: {service}.{method}")]
    MethodNotFound {
        /// Service key (interface name + version).
        service: String,
        /// Method name with its parameter signature.
        method: String,
    },

    /// The service method itself returned an error.
    #[error("Invocation failed: {0}")]
    Invocation(String),

    /// A response arrived for a request id nobody is waiting on.
    #[error("Unknown correlation id: {0}")]
    UnknownCorrelation(String),

    /// The client or server was used before configuration was supplied.
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Discovery could not produce a live endpoint for a service.
    #[error("No healthy instance for {0}")]
    NoHealthyInstance(String),

    /// The configuration is present but invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Stable short name of the error kind.
    ///
    /// Used as the status message of failed responses, so peers can match on
    /// it without parsing the human-readable text.
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Protocol(_) => "ProtocolError",
            RpcError::CodecNotFound { .. } => "CodecNotFound",
            RpcError::Codec(_) => "CodecError",
            RpcError::Network(_) => "NetworkError",
            RpcError::ChannelClosed(_) => "ChannelClosed",
            RpcError::ServiceNotFound(_) => "ServiceNotFound",
            RpcError::MethodNotFound { .. } => "MethodNotFound",
            RpcError::Invocation(_) => "InvocationError",
            RpcError::UnknownCorrelation(_) => "UnknownCorrelation",
            RpcError::NotConfigured(_) => "NotConfigured",
            RpcError::NoHealthyInstance(_) => "NoHealthyInstance",
            RpcError::Config(_) => "ConfigError",
        }
    }

    /// Whether the error leaves the connection unusable.
    ///
    /// Body-local codec failures keep the framing intact, so only protocol
    /// and network level failures close a connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Protocol(_) | RpcError::Network(_) | RpcError::ChannelClosed(_)
        )
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Network(e.to_string())
    }
}

/// Alias for Result with RpcError.
pub type RpcResult<T> = Result<T, RpcError>;
