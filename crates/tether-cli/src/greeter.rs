//! The demo Greeter service and its hand-written client stub.

use serde_json::{json, Value};
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::Request;
use tether_wire::{CallOptions, ServiceDefinition, TransportClient};

pub const INTERFACE: &str = "Greeter";
pub const VERSION: &str = "1.0";

/// Server side: `hello(String) -> String`.
pub fn service() -> ServiceDefinition {
    ServiceDefinition::new(INTERFACE, VERSION).method("hello", &["String"], |params| async move {
        match params.first().and_then(Value::as_str) {
            Some(name) => Ok(json!(format!("hello {name}"))),
            None => Err("hello expects one string argument".to_string()),
        }
    })
}

/// Typed stub: each method builds a request and goes through the transport.
pub struct GreeterClient {
    client: TransportClient,
    group: String,
    options: CallOptions,
}

impl GreeterClient {
    pub fn new(client: TransportClient, group: impl Into<String>, options: CallOptions) -> Self {
        Self {
            client,
            group: group.into(),
            options,
        }
    }

    pub async fn hello(&self, name: &str) -> RpcResult<String> {
        let request = Request::new(INTERFACE, VERSION, "hello")
            .with_group(self.group.clone())
            .with_param("String", json!(name));
        let response = self.client.call_with(request, self.options.clone()).await?;

        if !response.is_success() {
            let detail = response
                .payload
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Err(RpcError::Invocation(format!(
                "{}: {detail}",
                response.status_message
            )));
        }
        response
            .payload
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::Codec("hello returned a non-string payload".into()))
    }
}
