//! Dispatch registry: service key → published service → method handlers.
//!
//! A [`ServiceDefinition`] is built up front with one async closure per
//! method and published once. After publication a service's method table is
//! immutable; lookups only take the read lock.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::{service_key, Request, Response};
use tracing::warn;

/// Boxed future returned by a method handler. `Err` carries a message for
/// the caller.
pub type HandlerFuture = BoxFuture<'static, Result<Value, String>>;

type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Method name plus declared parameter types; overloads differ by signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub name: String,
    pub signature: Vec<String>,
}

impl MethodKey {
    pub fn new(name: impl Into<String>, signature: &[&str]) -> Self {
        Self {
            name: name.into(),
            signature: signature.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn of(request: &Request) -> Self {
        Self {
            name: request.method_name.clone(),
            signature: request.parameter_types.clone(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.signature.join(", "))
    }
}

/// A service being assembled for publication.
pub struct ServiceDefinition {
    interface_name: String,
    version: String,
    methods: HashMap<MethodKey, Handler>,
}

impl ServiceDefinition {
    pub fn new(interface_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            interface_name: interface_name.into(),
            version: version.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method. `handler` receives the request's parameter values in order.
    pub fn method<F, Fut>(mut self, name: &str, param_types: &[&str], handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| handler(params).boxed());
        self.methods.insert(MethodKey::new(name, param_types), handler);
        self
    }

    pub fn service_key(&self) -> String {
        service_key(&self.interface_name, &self.version)
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("service", &self.service_key())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct PublishedService {
    methods: HashMap<MethodKey, Handler>,
}

/// Thread-safe table of published services.
#[derive(Clone, Default)]
pub struct DispatchRegistry {
    services: Arc<RwLock<HashMap<String, Arc<PublishedService>>>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a service under its key. A key can only be published once.
    pub fn publish(&self, definition: ServiceDefinition) -> RpcResult<String> {
        let key = definition.service_key();
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if services.contains_key(&key) {
            return Err(RpcError::Config(format!("service {key} is already published")));
        }
        services.insert(
            key.clone(),
            Arc::new(PublishedService {
                methods: definition.methods,
            }),
        );
        Ok(key)
    }

    pub fn contains(&self, service_key: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(service_key)
    }

    /// Keys of every published service, sorted.
    pub fn service_keys(&self) -> Vec<String> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = services.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Route a request to its handler and run it.
    pub async fn invoke(&self, request: &Request) -> RpcResult<Value> {
        let key = request.service_key();
        let service = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(key.clone()))?;

        let method = MethodKey::of(request);
        let handler = service
            .methods
            .get(&method)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound {
                service: key.clone(),
                method: method.to_string(),
            })?;

        // A panicking handler fails its own call, nothing else.
        match AssertUnwindSafe(handler(request.parameter_values.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(RpcError::Invocation(message)),
            Err(_) => Err(RpcError::Invocation(format!("{key}.{method} panicked"))),
        }
    }

    /// Like [`invoke`](Self::invoke), but always produces a response.
    pub async fn handle(&self, request: &Request) -> Response {
        match self.invoke(request).await {
            Ok(value) => Response::success(request.request_id.clone(), value),
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    service = %request.service_key(),
                    method = %request.method_name,
                    error = %e,
                    "Call failed"
                );
                Response::failure(request.request_id.clone(), e.code(), Some(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_types::message::STATUS_ERROR;

    fn greeter() -> ServiceDefinition {
        ServiceDefinition::new("Greeter", "1.0")
            .method("hello", &["String"], |params| async move {
                match params.first().and_then(Value::as_str) {
                    Some(name) => Ok(json!(format!("hello {name}"))),
                    None => Err("expected a string".to_string()),
                }
            })
            .method("hello", &["String", "String"], |params| async move {
                let words: Vec<&str> = params.iter().filter_map(Value::as_str).collect();
                Ok::<Value, String>(json!(words.join(" ")))
            })
            .method("fail", &[], |_| async { Err::<Value, String>("boom".to_string()) })
            .method("panic", &[], |_| async {
                if true {
                    panic!("handler bug");
                }
                Ok::<Value, String>(Value::Null)
            })
    }

    fn request(method: &str) -> Request {
        Request::new("Greeter", "1.0", method).with_id("r1")
    }

    #[tokio::test]
    async fn test_invoke_routes_by_signature() {
        let registry = DispatchRegistry::new();
        registry.publish(greeter()).unwrap();

        let one = request("hello").with_param("String", json!("world"));
        assert_eq!(registry.invoke(&one).await.unwrap(), json!("hello world"));

        let two = request("hello")
            .with_param("String", json!("good"))
            .with_param("String", json!("morning"));
        assert_eq!(registry.invoke(&two).await.unwrap(), json!("good morning"));
    }

    #[tokio::test]
    async fn test_missing_service() {
        let registry = DispatchRegistry::new();
        registry.publish(greeter()).unwrap();
        let req = Request::new("Missing", "1.0", "hello").with_id("r2");
        let resp = registry.handle(&req).await;
        assert_eq!(resp.status_code, STATUS_ERROR);
        assert_eq!(resp.status_message, "ServiceNotFound");
        assert_eq!(resp.request_id, "r2");
    }

    #[tokio::test]
    async fn test_missing_method_or_signature() {
        let registry = DispatchRegistry::new();
        registry.publish(greeter()).unwrap();

        let err = registry.invoke(&request("goodbye")).await.unwrap_err();
        assert!(matches!(err, RpcError::MethodNotFound { .. }));

        let wrong_types = request("hello").with_param("i64", json!(1));
        match registry.invoke(&wrong_types).await {
            Err(RpcError::MethodNotFound { service, method }) => {
                assert_eq!(service, "Greeter1.0");
                assert_eq!(method, "hello(i64)");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_errors_become_failed_responses() {
        let registry = DispatchRegistry::new();
        registry.publish(greeter()).unwrap();

        let resp = registry.handle(&request("fail")).await;
        assert_eq!(resp.status_message, "InvocationError");
        assert!(resp.payload.unwrap().as_str().unwrap().contains("boom"));

        let resp = registry.handle(&request("panic")).await;
        assert_eq!(resp.status_code, STATUS_ERROR);
        assert_eq!(resp.status_message, "InvocationError");

        // The registry is still usable afterwards.
        let ok = request("hello").with_param("String", json!("again"));
        assert!(registry.handle(&ok).await.is_success());
    }

    #[test]
    fn test_publish_is_once_per_key() {
        let registry = DispatchRegistry::new();
        assert_eq!(registry.publish(greeter()).unwrap(), "Greeter1.0");
        assert!(registry.contains("Greeter1.0"));
        assert!(!registry.contains("Greeter2.0"));
        assert!(matches!(registry.publish(greeter()), Err(RpcError::Config(_))));
        registry
            .publish(ServiceDefinition::new("Greeter", "2.0"))
            .unwrap();
        assert_eq!(registry.service_keys(), vec!["Greeter1.0", "Greeter2.0"]);
    }
}
