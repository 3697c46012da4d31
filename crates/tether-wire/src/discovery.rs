//! Service discovery seam and the client's resolved-endpoint cache.
//!
//! [`Discovery`] is the boundary to an external registry. [`StaticDiscovery`]
//! is the in-memory backend used by the CLI and tests. [`EndpointCache`]
//! remembers every endpoint discovery has returned so calls can keep working
//! while discovery is unreachable.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_types::config::RpcConfig;
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::Endpoint;
use tracing::debug;

/// External service registry.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Advertise `endpoint` as an instance of `service_key` in `group`.
    async fn register(&self, group: &str, service_key: &str, endpoint: &Endpoint)
        -> RpcResult<()>;

    /// Pick one live instance of `service_key` in `group`.
    async fn resolve(&self, group: &str, service_key: &str) -> RpcResult<Endpoint>;

    /// Withdraw `endpoint` from every group that lists it for `service_key`.
    async fn deregister(&self, service_key: &str, endpoint: &Endpoint) -> RpcResult<()>;
}

/// Chooses one endpoint out of several candidates.
pub trait LoadBalancer: Send + Sync {
    fn pick(&self, candidates: &[Endpoint]) -> Option<Endpoint>;
}

/// Uniform random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPick;

impl LoadBalancer for RandomPick {
    fn pick(&self, candidates: &[Endpoint]) -> Option<Endpoint> {
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

type InstanceKey = (String, String);

/// In-memory [`Discovery`] backend.
pub struct StaticDiscovery {
    instances: DashMap<InstanceKey, Vec<Endpoint>>,
    balancer: Arc<dyn LoadBalancer>,
    available: AtomicBool,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::with_balancer(Arc::new(RandomPick))
    }

    pub fn with_balancer(balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            instances: DashMap::new(),
            balancer,
            available: AtomicBool::new(true),
        }
    }

    /// Seed from `static_endpoints`, all under the configured group.
    pub fn from_config(config: &RpcConfig) -> RpcResult<Self> {
        let discovery = Self::new();
        for (service_key, addrs) in &config.static_endpoints {
            for addr in addrs {
                let endpoint = addr
                    .parse::<Endpoint>()
                    .map_err(|e| RpcError::Config(format!("static_endpoints.{service_key}: {e}")))?;
                discovery.insert(&config.discovery_group, service_key, endpoint);
            }
        }
        Ok(discovery)
    }

    /// Simulate the registry going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn insert(&self, group: &str, service_key: &str, endpoint: Endpoint) {
        let mut entry = self
            .instances
            .entry((group.to_string(), service_key.to_string()))
            .or_default();
        if !entry.contains(&endpoint) {
            entry.push(endpoint);
        }
    }

    fn check_available(&self) -> RpcResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RpcError::Network("discovery service unavailable".into()))
        }
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn register(
        &self,
        group: &str,
        service_key: &str,
        endpoint: &Endpoint,
    ) -> RpcResult<()> {
        self.check_available()?;
        self.insert(group, service_key, endpoint.clone());
        debug!(group, service_key, endpoint = %endpoint, "Registered instance");
        Ok(())
    }

    async fn resolve(&self, group: &str, service_key: &str) -> RpcResult<Endpoint> {
        self.check_available()?;
        let candidates = self
            .instances
            .get(&(group.to_string(), service_key.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        self.balancer
            .pick(&candidates)
            .ok_or_else(|| RpcError::NoHealthyInstance(format!("{group}/{service_key}")))
    }

    async fn deregister(&self, service_key: &str, endpoint: &Endpoint) -> RpcResult<()> {
        self.check_available()?;
        self.instances.retain(|(_, key), endpoints| {
            if key == service_key {
                endpoints.retain(|e| e != endpoint);
            }
            !endpoints.is_empty()
        });
        Ok(())
    }
}

/// Endpoints previously returned by discovery, per (group, service key).
pub struct EndpointCache {
    entries: DashMap<InstanceKey, Vec<Endpoint>>,
    balancer: Arc<dyn LoadBalancer>,
}

impl EndpointCache {
    pub fn new(balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            entries: DashMap::new(),
            balancer,
        }
    }

    pub fn remember(&self, group: &str, service_key: &str, endpoint: &Endpoint) {
        let mut entry = self
            .entries
            .entry((group.to_string(), service_key.to_string()))
            .or_default();
        if !entry.contains(endpoint) {
            entry.push(endpoint.clone());
        }
    }

    /// Choose a cached endpoint for the service, if any.
    pub fn pick(&self, group: &str, service_key: &str) -> Option<Endpoint> {
        let candidates = self
            .entries
            .get(&(group.to_string(), service_key.to_string()))?
            .value()
            .clone();
        self.balancer.pick(&candidates)
    }

    /// Drop `endpoint` from every service; returns how many entries held it.
    pub fn evict(&self, endpoint: &Endpoint) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, endpoints| {
            let before = endpoints.len();
            endpoints.retain(|e| e != endpoint);
            removed += before - endpoints.len();
            !endpoints.is_empty()
        });
        removed
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.value().contains(endpoint))
    }
}

impl Default for EndpointCache {
    fn default() -> Self {
        Self::new(Arc::new(RandomPick))
    }
}
