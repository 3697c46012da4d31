//! Transport server: accept loop, per-connection frame loop, dispatch.
//!
//! The listener starts once, on the first `publish`. Each accepted socket
//! becomes a [`Channel`]; its frames are decoded in arrival order and every
//! request is dispatched on its own task, gated by a semaphore sized from
//! `worker_threads`, so slow handlers never hold up reading. Heartbeat pings
//! are answered inline.

use crate::channel::Channel;
use crate::discovery::Discovery;
use crate::frame::{Body, FrameCodec, FrameHeader, Message, MessageKind};
use crate::plugin::PluginRegistry;
use crate::registry::{DispatchRegistry, ServiceDefinition};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tether_types::config::RpcConfig;
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::{Endpoint, Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OnceCell, Semaphore};
use tracing::{debug, error, info, warn};

struct Configured {
    config: RpcConfig,
    codec: Arc<FrameCodec>,
    workers: Arc<Semaphore>,
}

struct ServerInner {
    plugins: Arc<PluginRegistry>,
    discovery: Arc<dyn Discovery>,
    registry: DispatchRegistry,
    configured: OnceLock<Configured>,
    listener: OnceCell<SocketAddr>,
    connections: DashMap<u64, Arc<Channel>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Serves published services over tether frames.
#[derive(Clone)]
pub struct TransportServer {
    inner: Arc<ServerInner>,
}

impl TransportServer {
    pub fn new(plugins: Arc<PluginRegistry>, discovery: Arc<dyn Discovery>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                plugins,
                discovery,
                registry: DispatchRegistry::new(),
                configured: OnceLock::new(),
                listener: OnceCell::new(),
                connections: DashMap::new(),
                shutdown_tx,
            }),
        }
    }

    /// Supply the configuration. Can only be done once.
    pub fn configure(&self, config: RpcConfig) -> RpcResult<()> {
        config.validate()?;
        let configured = Configured {
            codec: Arc::new(FrameCodec::new(
                Arc::clone(&self.inner.plugins),
                config.max_frame_size,
            )),
            workers: Arc::new(Semaphore::new(config.effective_workers())),
            config,
        };
        self.inner
            .configured
            .set(configured)
            .map_err(|_| RpcError::Config("transport server is already configured".into()))
    }

    /// Publish a service, start the listener if needed, and register the
    /// service with discovery. Returns the listener's address.
    ///
    /// A discovery failure is logged; the service stays reachable directly.
    pub async fn publish(&self, definition: ServiceDefinition) -> RpcResult<SocketAddr> {
        let configured = self.configured()?;
        let config = &configured.config;
        let addr = self.start(configured).await?;
        let service_key = self.inner.registry.publish(definition)?;

        let advertised = Endpoint::new(config.provider_host.clone(), addr.port());
        match self
            .inner
            .discovery
            .register(&config.discovery_group, &service_key, &advertised)
            .await
        {
            Ok(()) => info!(service = %service_key, endpoint = %advertised, "Service published"),
            Err(e) => warn!(
                service = %service_key,
                error = %e,
                "Service published locally but discovery registration failed"
            ),
        }
        Ok(addr)
    }

    pub fn registry(&self) -> &DispatchRegistry {
        &self.inner.registry
    }

    /// Bound address, once the listener is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.get().copied()
    }

    /// Number of open inbound connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        for entry in self.inner.connections.iter() {
            entry.value().close();
        }
        self.inner.connections.clear();
        info!("Transport server shut down");
    }

    fn configured(&self) -> RpcResult<&Configured> {
        self.inner
            .configured
            .get()
            .ok_or_else(|| RpcError::NotConfigured("transport server has no configuration".into()))
    }

    async fn start(&self, configured: &Configured) -> RpcResult<SocketAddr> {
        let addr = self
            .inner
            .listener
            .get_or_try_init(move || async move {
                let bind = format!(
                    "{}:{}",
                    configured.config.provider_host, configured.config.provider_port
                );
                let listener = TcpListener::bind(&bind)
                    .await
                    .map_err(|e| RpcError::Network(format!("bind {bind}: {e}")))?;
                let addr = listener.local_addr()?;
                info!(%addr, "Transport server listening");

                let server = self.clone();
                tokio::spawn(async move {
                    server.accept_loop(listener).await;
                });
                Ok::<_, RpcError>(addr)
            })
            .await?;
        Ok(*addr)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.serve_connection(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!("Accept loop stopped");
    }

    async fn serve_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let Some(configured) = self.inner.configured.get() else {
            return;
        };
        let codec = Arc::clone(&configured.codec);
        let (channel, mut inbound) = Channel::open(stream, Endpoint::from(addr), Arc::clone(&codec), None);
        self.inner
            .connections
            .insert(channel.id(), Arc::clone(&channel));
        info!(peer = %addr, channel = channel.id(), "Connection accepted");

        let idle_secs = configured.config.heartbeat.read_idle_secs;
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            let read_idle = async {
                if idle_secs == 0 {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(Duration::from_secs(idle_secs)).await;
            };
            let next = tokio::select! {
                next = inbound.recv() => next,
                _ = read_idle => {
                    warn!(peer = %addr, idle_secs, "No inbound traffic, peer may be dead");
                    continue;
                }
                _ = shutdown.changed() => break,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(RpcError::ChannelClosed(reason))) => {
                    debug!(peer = %addr, %reason, "Peer disconnected");
                    break;
                }
                Some(Err(e)) => {
                    warn!(peer = %addr, error = %e, "Read failed");
                    break;
                }
                None => break,
            };

            match codec.decode_frame(&frame) {
                Ok(msg) => self.on_message(&channel, configured, msg).await,
                Err(e) if e.is_connection_fatal() => {
                    warn!(peer = %addr, error = %e, "Protocol violation, closing connection");
                    break;
                }
                Err(e) => {
                    if !self.reject_undecodable(&channel, &codec, &frame, e).await {
                        break;
                    }
                }
            }
        }

        channel.close();
        self.inner.connections.remove(&channel.id());
        info!(peer = %addr, channel = channel.id(), "Connection closed");
    }

    /// Answer a request whose body failed to decode with a failed response.
    ///
    /// Returns `false` when the failure cannot be tied to a request id; the
    /// caller then closes the connection so the peer's pending calls fail.
    async fn reject_undecodable(
        &self,
        channel: &Channel,
        codec: &FrameCodec,
        frame: &[u8],
        error: RpcError,
    ) -> bool {
        let peer = channel.endpoint();
        let header = match FrameHeader::parse(frame) {
            Ok(header) => header,
            Err(_) => return false,
        };
        if header.kind != MessageKind::Request {
            warn!(peer = %peer, error = %error, "Dropping undecodable frame");
            return true;
        }
        let Some(request_id) = codec.recover_request_id(frame) else {
            warn!(peer = %peer, error = %error, "Undecodable request without a usable id, closing connection");
            return false;
        };

        warn!(peer = %peer, request_id = %request_id, error = %error, "Undecodable request body");
        let reply = Response::failure(request_id, error.code(), Some(error.to_string()));
        match codec.encode(&Message::response(reply, header.serialization, header.compression)) {
            Ok(bytes) => channel.send(bytes).await.is_ok(),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to encode codec failure response");
                false
            }
        }
    }

    async fn on_message(&self, channel: &Arc<Channel>, configured: &Configured, msg: Message) {
        match (msg.kind, msg.body) {
            (MessageKind::HeartbeatPing, _) => {
                let pong = Message::pong(msg.serialization, msg.compression);
                match configured.codec.encode(&pong) {
                    Ok(frame) => {
                        if channel.send(frame).await.is_ok() {
                            debug!(peer = %channel.endpoint(), "Heartbeat pong sent");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode pong"),
                }
            }
            (MessageKind::Request, Some(Body::Request(request))) => {
                self.dispatch(
                    Arc::clone(channel),
                    configured,
                    request,
                    msg.serialization,
                    msg.compression,
                );
            }
            (kind, _) => {
                warn!(peer = %channel.endpoint(), ?kind, "Unexpected frame on server connection");
            }
        }
    }

    /// Run one request on a worker and write its response with the
    /// request's own serialization and compression ids.
    fn dispatch(
        &self,
        channel: Arc<Channel>,
        configured: &Configured,
        request: Request,
        serialization: u8,
        compression: u8,
    ) {
        let registry = self.inner.registry.clone();
        let codec = Arc::clone(&configured.codec);
        let workers = Arc::clone(&configured.workers);
        let close_after_response = configured.config.close_after_response;

        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let response = registry.handle(&request).await;
            let frame = match codec.encode(&Message::response(response, serialization, compression)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(request_id = %request.request_id, error = %e, "Failed to encode response");
                    let fallback =
                        Response::failure(request.request_id.clone(), e.code(), Some(e.to_string()));
                    match codec.encode(&Message::response(fallback, serialization, compression)) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(request_id = %request.request_id, error = %e, "Dropping response");
                            return;
                        }
                    }
                }
            };
            if let Err(e) = channel.send(frame).await {
                debug!(request_id = %request.request_id, error = %e, "Response not delivered");
                return;
            }
            if close_after_response {
                channel.close();
            }
        });
    }
}
