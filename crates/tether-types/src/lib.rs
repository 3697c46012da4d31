//! Core types for the tether RPC transport.
//!
//! This crate defines the data model shared by the wire protocol, the client
//! and the server: requests, responses, endpoints, the error taxonomy and the
//! runtime configuration. It contains no networking logic.

pub mod config;
pub mod error;
pub mod message;

pub use config::RpcConfig;
pub use error::{RpcError, RpcResult};
pub use message::{Endpoint, Request, Response};
