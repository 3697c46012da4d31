//! Client-side connection manager.
//!
//! Keeps at most one live [`Channel`] per endpoint. Connects are serialized
//! per endpoint by an async mutex; the channel cache is a `DashMap` whose
//! stale (inactive) entries are evicted lazily on lookup. When an active
//! channel dies, or a connect fails, a watchdog task retries with
//! exponential backoff until it succeeds or the endpoint is evicted.

use crate::channel::{Channel, IdlePing};
use crate::correlation::CorrelationTable;
use crate::frame::{Body, FrameCodec, Message, MessageKind};
use crate::watchdog::{ConnectionState, LinkState, ReconnectPolicy, Transition};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::Endpoint;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Called with the endpoint once the watchdog gives up on it.
pub type EvictHook = Arc<dyn Fn(&Endpoint) + Send + Sync>;

/// Connection settings for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub policy: ReconnectPolicy,
    /// Write-idle heartbeat for every channel, if any.
    pub ping: Option<IdlePing>,
}

struct Link {
    connect: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<ConnectionState>,
}

impl Link {
    fn new() -> Self {
        Self {
            connect: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(ConnectionState::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Inner {
    codec: Arc<FrameCodec>,
    correlation: CorrelationTable,
    options: ConnectionOptions,
    channels: DashMap<Endpoint, Arc<Channel>>,
    links: DashMap<Endpoint, Arc<Link>>,
    evict_hooks: RwLock<Vec<EvictHook>>,
    shutdown: AtomicBool,
}

/// Shared handle; clones refer to the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        codec: Arc<FrameCodec>,
        correlation: CorrelationTable,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                codec,
                correlation,
                options,
                channels: DashMap::new(),
                links: DashMap::new(),
                evict_hooks: RwLock::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Return the live channel to `endpoint`, connecting if there is none.
    ///
    /// Concurrent callers for the same endpoint share one connect. A failed
    /// connect is returned to the caller and also handed to the watchdog.
    pub async fn acquire(&self, endpoint: &Endpoint) -> RpcResult<Arc<Channel>> {
        if let Some(channel) = self.cached(endpoint) {
            return Ok(channel);
        }
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(RpcError::ChannelClosed("connection manager is shut down".into()));
        }

        let (link, _guard) = loop {
            let link = self.link(endpoint);
            let guard = Arc::clone(&link.connect).lock_owned().await;
            if self.is_current(endpoint, &link) {
                break (link, guard);
            }
            // Evicted or replaced while we waited; retry on the current link.
        };
        if let Some(channel) = self.cached(endpoint) {
            return Ok(channel);
        }

        link.state().on_connecting();
        match self.connect(endpoint).await {
            Ok(channel) => {
                link.state().on_connected(channel.id());
                Ok(channel)
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Connect failed");
                let transition = link.state().on_failure(&self.inner.options.policy);
                self.schedule(endpoint, &link, transition);
                Err(e)
            }
        }
    }

    /// Current state of the link to `endpoint`, if it has ever been used.
    pub fn state(&self, endpoint: &Endpoint) -> Option<ConnectionState> {
        self.inner
            .links
            .get(endpoint)
            .map(|link| link.state().clone())
    }

    /// Number of cached channels that are still active.
    pub fn live_channels(&self) -> usize {
        self.inner
            .channels
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Register a callback run when an endpoint is evicted.
    pub fn on_evict(&self, hook: impl Fn(&Endpoint) + Send + Sync + 'static) {
        self.inner
            .evict_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    pub fn correlation(&self) -> &CorrelationTable {
        &self.inner.correlation
    }

    pub fn codec(&self) -> &Arc<FrameCodec> {
        &self.inner.codec
    }

    /// Close every channel and stop all watchdogs.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for entry in self.inner.channels.iter() {
            entry.value().close();
        }
        self.inner.channels.clear();
    }

    // -- internals ---------------------------------------------------------

    fn cached(&self, endpoint: &Endpoint) -> Option<Arc<Channel>> {
        let channel = self.inner.channels.get(endpoint)?.value().clone();
        if channel.is_active() {
            return Some(channel);
        }
        self.inner
            .channels
            .remove_if(endpoint, |_, c| c.id() == channel.id());
        None
    }

    /// Link for `endpoint`; an evicted link is replaced by a fresh one.
    fn link(&self, endpoint: &Endpoint) -> Arc<Link> {
        let mut entry = self
            .inner
            .links
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(Link::new()));
        if entry.state().is_evicted() {
            *entry = Arc::new(Link::new());
        }
        Arc::clone(entry.value())
    }

    /// Whether `link` is still the live, non-evicted link for `endpoint`.
    fn is_current(&self, endpoint: &Endpoint, link: &Arc<Link>) -> bool {
        let registered = self
            .inner
            .links
            .get(endpoint)
            .map(|current| Arc::ptr_eq(current.value(), link))
            .unwrap_or(false);
        registered && !link.state().is_evicted()
    }

    async fn connect(&self, endpoint: &Endpoint) -> RpcResult<Arc<Channel>> {
        let timeout = self.inner.options.connect_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(endpoint.authority()))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(RpcError::Network(format!("connect to {endpoint}: {e}"))),
            Err(_) => {
                return Err(RpcError::Network(format!(
                    "connect to {endpoint} timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        };

        let (channel, inbound) = Channel::open(
            stream,
            endpoint.clone(),
            Arc::clone(&self.inner.codec),
            self.inner.options.ping,
        );
        self.inner
            .channels
            .insert(endpoint.clone(), Arc::clone(&channel));
        info!(endpoint = %endpoint, channel = channel.id(), "Connected");

        let manager = self.clone();
        let reader_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            manager.drive(reader_channel, inbound).await;
        });
        Ok(channel)
    }

    /// Consume inbound frames of a client channel until it ends.
    async fn drive(&self, channel: Arc<Channel>, mut inbound: mpsc::Receiver<RpcResult<Bytes>>) {
        let reason = loop {
            let frame = match inbound.recv().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break e,
                None => break RpcError::ChannelClosed("channel closed".into()),
            };
            match self.inner.codec.decode_frame(&frame) {
                Ok(msg) => self.route(&channel, msg).await,
                Err(e) if e.is_connection_fatal() => {
                    warn!(endpoint = %channel.endpoint(), error = %e, "Protocol violation, dropping channel");
                    break e;
                }
                Err(e) => match self.inner.codec.recover_request_id(&frame) {
                    Some(request_id) => {
                        warn!(endpoint = %channel.endpoint(), request_id = %request_id, error = %e, "Undecodable response body");
                        self.inner.correlation.fail(&request_id, e);
                    }
                    None => {
                        // Nobody can be told which call this was; fail them all.
                        warn!(endpoint = %channel.endpoint(), error = %e, "Undecodable response without a usable id, dropping channel");
                        break e;
                    }
                },
            }
        };

        let lost = !channel.closed_locally();
        channel.mark_lost();
        let failed = self.inner.correlation.fail_channel(
            channel.id(),
            RpcError::ChannelClosed(format!("{}: {reason}", channel.endpoint())),
        );
        info!(
            endpoint = %channel.endpoint(),
            channel = channel.id(),
            failed_calls = failed,
            "Channel inactive"
        );
        self.on_inactive(channel.endpoint(), channel.id(), lost);
    }

    async fn route(&self, channel: &Channel, msg: Message) {
        match (msg.kind, msg.body) {
            (MessageKind::Response, Some(Body::Response(response))) => {
                if let Err(e) = self.inner.correlation.complete(response) {
                    warn!(endpoint = %channel.endpoint(), error = %e, "Discarding response");
                }
            }
            (MessageKind::HeartbeatPong, _) => {
                debug!(endpoint = %channel.endpoint(), "Heartbeat pong");
                channel.pong_received();
            }
            (MessageKind::HeartbeatPing, _) => {
                let pong = Message::pong(msg.serialization, msg.compression);
                match self.inner.codec.encode(&pong) {
                    Ok(frame) => {
                        let _ = channel.send(frame).await;
                    }
                    Err(e) => warn!(error = %e, "Failed to encode pong"),
                }
            }
            (kind, _) => {
                warn!(endpoint = %channel.endpoint(), ?kind, "Unexpected frame on client channel");
            }
        }
    }

    fn on_inactive(&self, endpoint: &Endpoint, channel_id: u64, lost: bool) {
        self.inner
            .channels
            .remove_if(endpoint, |_, c| c.id() == channel_id);
        if !lost || self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let Some(link) = self.inner.links.get(endpoint).map(|l| Arc::clone(l.value())) else {
            return;
        };
        let transition = {
            let mut state = link.state();
            if state.state != LinkState::Active || state.channel_id != Some(channel_id) {
                return;
            }
            state.on_lost(&self.inner.options.policy)
        };
        self.schedule(endpoint, &link, transition);
    }

    fn schedule(&self, endpoint: &Endpoint, link: &Arc<Link>, transition: Transition) {
        match transition {
            Transition::Evict => self.evict(endpoint),
            Transition::Backoff(delay) => {
                {
                    let mut state = link.state();
                    if state.reconnecting {
                        return;
                    }
                    state.reconnecting = true;
                }
                let manager = self.clone();
                let endpoint = endpoint.clone();
                let link = Arc::clone(link);
                tokio::spawn(async move {
                    manager.watchdog(endpoint, link, delay).await;
                });
            }
        }
    }

    /// Reconnect loop for one endpoint.
    async fn watchdog(&self, endpoint: Endpoint, link: Arc<Link>, first_delay: Duration) {
        let mut delay = first_delay;
        loop {
            let attempt = link.state().attempts + 1;
            info!(
                endpoint = %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::time::sleep(delay).await;
            if self.inner.shutdown.load(Ordering::SeqCst) || !self.is_current(&endpoint, &link) {
                link.state().reconnecting = false;
                return;
            }

            let _guard = link.connect.lock().await;
            // A caller may have evicted the endpoint, or replaced the link,
            // while this task slept or waited for the lock.
            if !self.is_current(&endpoint, &link) {
                link.state().reconnecting = false;
                debug!(endpoint = %endpoint, "Watchdog stopped, link no longer current");
                return;
            }
            if self.cached(&endpoint).is_some() {
                link.state().reconnecting = false;
                return;
            }
            link.state().on_connecting();
            match self.connect(&endpoint).await {
                Ok(channel) => {
                    let mut state = link.state();
                    state.on_connected(channel.id());
                    state.reconnecting = false;
                    info!(endpoint = %endpoint, "Reconnected");
                    return;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Reconnect failed");
                    let transition = link.state().on_failure(&self.inner.options.policy);
                    match transition {
                        Transition::Backoff(next) => delay = next,
                        Transition::Evict => {
                            drop(_guard);
                            self.evict(&endpoint);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn evict(&self, endpoint: &Endpoint) {
        if let Some((_, channel)) = self.inner.channels.remove(endpoint) {
            channel.close();
        }
        warn!(endpoint = %endpoint, "Endpoint evicted after repeated connect failures");
        let hooks: Vec<EvictHook> = self
            .inner
            .evict_hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            hook(endpoint);
        }
    }
}
