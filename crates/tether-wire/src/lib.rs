//! tether transport core.
//!
//! Request/response RPC over persistent TCP connections using a 16-byte
//! framed binary protocol with pluggable serialization and compression.
//! A [`TransportClient`] resolves services through a [`discovery::Discovery`]
//! backend, keeps one channel per endpoint alive with heartbeats and a
//! reconnect watchdog, and correlates responses to callers by request id.
//! A [`TransportServer`] accepts connections and dispatches requests to
//! published services.

pub mod channel;
pub mod client;
pub mod connection;
pub mod correlation;
pub mod discovery;
pub mod frame;
pub mod plugin;
pub mod registry;
pub mod server;
pub mod watchdog;

pub use client::{CallOptions, TransportClient};
pub use discovery::{Discovery, StaticDiscovery};
pub use plugin::PluginRegistry;
pub use registry::ServiceDefinition;
pub use server::TransportServer;
