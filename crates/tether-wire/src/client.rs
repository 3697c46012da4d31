//! Transport client: resolve, connect, correlate.
//!
//! A call registers its correlation slot, acquires a channel to a resolved
//! endpoint, binds the slot to that channel, writes the request frame and
//! waits. Discovery results are cached so that calls still resolve while
//! discovery is down; endpoints the watchdog evicts leave the cache.

use crate::channel::IdlePing;
use crate::connection::{ConnectionManager, ConnectionOptions};
use crate::correlation::CorrelationTable;
use crate::discovery::{Discovery, EndpointCache, RandomPick};
use crate::frame::{FrameCodec, Message};
use crate::plugin::PluginRegistry;
use crate::watchdog::ReconnectPolicy;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tether_types::config::RpcConfig;
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::{Endpoint, Request, Response};
use tracing::{debug, info, warn};

/// Per-call encoding overrides; `None` keeps the configured default.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub serializer: Option<String>,
    pub compressor: Option<String>,
}

impl CallOptions {
    pub fn serializer(mut self, name: impl Into<String>) -> Self {
        self.serializer = Some(name.into());
        self
    }

    pub fn compressor(mut self, name: impl Into<String>) -> Self {
        self.compressor = Some(name.into());
        self
    }
}

struct Configured {
    config: RpcConfig,
    connections: ConnectionManager,
    serialization: u8,
    compression: u8,
}

struct ClientInner {
    plugins: Arc<PluginRegistry>,
    discovery: Arc<dyn Discovery>,
    endpoints: Arc<EndpointCache>,
    correlation: CorrelationTable,
    configured: OnceLock<Configured>,
}

/// Calls remote services over tether frames.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

impl TransportClient {
    pub fn new(plugins: Arc<PluginRegistry>, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                plugins,
                discovery,
                endpoints: Arc::new(EndpointCache::new(Arc::new(RandomPick))),
                correlation: CorrelationTable::new(),
                configured: OnceLock::new(),
            }),
        }
    }

    /// Supply the configuration. Can only be done once.
    ///
    /// Fails with `CodecNotFound` if the default serializer or compressor
    /// is not registered.
    pub fn configure(&self, config: RpcConfig) -> RpcResult<()> {
        config.validate()?;
        let serialization = self.inner.plugins.serializer_id(&config.serializer)?;
        let compression = self.inner.plugins.compressor_id(&config.compressor)?;

        let codec = Arc::new(FrameCodec::new(
            Arc::clone(&self.inner.plugins),
            config.max_frame_size,
        ));
        let ping = (config.heartbeat.write_idle_secs > 0).then(|| IdlePing {
            after: Duration::from_secs(config.heartbeat.write_idle_secs),
            serialization,
            compression,
        });
        let connections = ConnectionManager::new(
            codec,
            self.inner.correlation.clone(),
            ConnectionOptions {
                connect_timeout: config.connect_timeout(),
                policy: ReconnectPolicy::from(&config.reconnect),
                ping,
            },
        );
        let endpoints = Arc::clone(&self.inner.endpoints);
        connections.on_evict(move |endpoint| {
            let removed = endpoints.evict(endpoint);
            info!(endpoint = %endpoint, removed, "Dropped evicted endpoint from resolve cache");
        });

        self.inner
            .configured
            .set(Configured {
                config,
                connections,
                serialization,
                compression,
            })
            .map_err(|_| RpcError::Config("transport client is already configured".into()))
    }

    /// Call with the configured serializer and compressor.
    pub async fn call(&self, request: Request) -> RpcResult<Response> {
        self.call_with(request, CallOptions::default()).await
    }

    /// Call with per-request encoding overrides.
    ///
    /// Waits until the response arrives or the carrying channel dies.
    pub async fn call_with(&self, request: Request, options: CallOptions) -> RpcResult<Response> {
        let configured = self.configured()?;
        let serialization = match &options.serializer {
            Some(name) => self.inner.plugins.serializer_id(name)?,
            None => configured.serialization,
        };
        let compression = match &options.compressor {
            Some(name) => self.inner.plugins.compressor_id(name)?,
            None => configured.compression,
        };

        let endpoint = self.resolve(&request).await?;
        let request_id = request.request_id.clone();

        // Registered before the write so a fast response always finds its slot.
        let pending = self.inner.correlation.register(&request_id)?;
        let channel = configured.connections.acquire(&endpoint).await?;
        self.inner.correlation.bind(&request_id, channel.id());
        if !channel.is_active() {
            // The channel died between acquire and bind; its reader may have
            // already swept the table.
            self.inner.correlation.fail(
                &request_id,
                RpcError::ChannelClosed(format!("channel to {endpoint} closed before send")),
            );
        }

        let frame = configured
            .connections
            .codec()
            .encode(&Message::request(request, serialization, compression))?;
        channel.send(frame).await?;
        debug!(request_id = %request_id, endpoint = %endpoint, "Request sent");

        let response = pending.await?;
        if response.request_id != request_id {
            return Err(RpcError::Protocol(format!(
                "response for {} delivered to call {request_id}",
                response.request_id
            )));
        }
        Ok(response)
    }

    /// Send a heartbeat ping and wait for the pong, bounded by the connect
    /// timeout. Returns the round-trip time.
    pub async fn ping(&self, endpoint: &Endpoint) -> RpcResult<Duration> {
        let configured = self.configured()?;
        let channel = configured.connections.acquire(endpoint).await?;
        let frame = configured
            .connections
            .codec()
            .encode(&Message::ping(configured.serialization, configured.compression))?;

        let pong = channel.pong_signal().notified();
        tokio::pin!(pong);
        pong.as_mut().enable();

        let started = Instant::now();
        channel.send(frame).await?;
        let timeout = configured.config.connect_timeout();
        tokio::time::timeout(timeout, pong)
            .await
            .map_err(|_| RpcError::Network(format!("no pong from {endpoint} within {}ms", timeout.as_millis())))?;
        Ok(started.elapsed())
    }

    /// Connection manager, for state introspection.
    pub fn connections(&self) -> RpcResult<&ConnectionManager> {
        Ok(&self.configured()?.connections)
    }

    pub fn endpoint_cache(&self) -> &EndpointCache {
        &self.inner.endpoints
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.correlation.pending_count()
    }

    /// Close every connection and stop reconnecting.
    pub fn shutdown(&self) {
        if let Some(configured) = self.inner.configured.get() {
            configured.connections.shutdown();
        }
    }

    fn configured(&self) -> RpcResult<&Configured> {
        self.inner
            .configured
            .get()
            .ok_or_else(|| RpcError::NotConfigured("transport client has no configuration".into()))
    }

    /// Ask discovery; fall back to a previously resolved endpoint.
    async fn resolve(&self, request: &Request) -> RpcResult<Endpoint> {
        let service_key = request.service_key();
        match self.inner.discovery.resolve(&request.group, &service_key).await {
            Ok(endpoint) => {
                self.inner
                    .endpoints
                    .remember(&request.group, &service_key, &endpoint);
                Ok(endpoint)
            }
            Err(e) => {
                warn!(service = %service_key, error = %e, "Discovery failed, trying cached endpoints");
                self.inner
                    .endpoints
                    .pick(&request.group, &service_key)
                    .ok_or(e)
            }
        }
    }
}
