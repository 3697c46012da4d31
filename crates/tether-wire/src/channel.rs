//! A live TCP connection: writer queue, frame reader and liveness flag.
//!
//! [`Channel::open`] splits the stream into two tasks. The writer drains an
//! mpsc queue of encoded frames and, when configured, emits a heartbeat ping
//! after a write-idle period. The reader pulls whole frames off the socket
//! and hands them, in arrival order, to whoever owns the returned receiver.
//! Keeping the socket read in its own task means consumers can select on
//! timers without cancelling a half-read frame.

use crate::frame::{FrameCodec, Message};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::Endpoint;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

/// Frames queued for writing before `send` waits.
const OUTBOUND_QUEUE: usize = 1024;

/// Frames read ahead of the consumer.
const INBOUND_QUEUE: usize = 256;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Write-idle heartbeat settings for a channel's writer.
#[derive(Debug, Clone, Copy)]
pub struct IdlePing {
    pub after: Duration,
    pub serialization: u8,
    pub compression: u8,
}

struct Shared {
    active: AtomicBool,
    closed_locally: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Shared {
    fn shut(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.close_tx.send_replace(true);
    }
}

/// Handle to one live connection.
pub struct Channel {
    id: u64,
    endpoint: Endpoint,
    outbound: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
    pong: Notify,
}

impl Channel {
    /// Start the reader and writer tasks for `stream`.
    ///
    /// Returns the handle plus the inbound frame receiver. The receiver
    /// yields `Err` once, when the socket fails or the peer disconnects,
    /// and then closes.
    pub fn open(
        stream: TcpStream,
        endpoint: Endpoint,
        codec: Arc<FrameCodec>,
        ping: Option<IdlePing>,
    ) -> (Arc<Channel>, mpsc::Receiver<RpcResult<Bytes>>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(endpoint = %endpoint, error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();

        let (close_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            closed_locally: AtomicBool::new(false),
            close_tx,
        });
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);

        let channel = Arc::new(Channel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            outbound: out_tx,
            shared: Arc::clone(&shared),
            pong: Notify::new(),
        });

        tokio::spawn(write_loop(
            writer,
            out_rx,
            Arc::clone(&codec),
            ping,
            Arc::clone(&shared),
            shared.close_tx.subscribe(),
        ));
        tokio::spawn(read_loop(reader, codec, in_tx, shared.close_tx.subscribe()));

        (channel, in_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Whether [`close`](Self::close) was called, as opposed to the
    /// connection dying on its own.
    pub fn closed_locally(&self) -> bool {
        self.shared.closed_locally.load(Ordering::SeqCst)
    }

    /// Queue an encoded frame for writing.
    pub async fn send(&self, frame: Bytes) -> RpcResult<()> {
        if !self.is_active() {
            return Err(self.closed_error());
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Stop both tasks. Frames already queued are still written.
    pub fn close(&self) {
        self.shared.closed_locally.store(true, Ordering::SeqCst);
        self.shared.shut();
    }

    /// Marks the channel dead without flagging it as a local close.
    pub(crate) fn mark_lost(&self) {
        self.shared.shut();
    }

    /// Watch that flips to `true` once the channel starts closing.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.shared.close_tx.subscribe()
    }

    pub(crate) fn pong_received(&self) {
        self.pong.notify_waiters();
    }

    pub(crate) fn pong_signal(&self) -> &Notify {
        &self.pong
    }

    fn closed_error(&self) -> RpcError {
        RpcError::ChannelClosed(format!("channel {} to {} is closed", self.id, self.endpoint))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    codec: Arc<FrameCodec>,
    ping: Option<IdlePing>,
    shared: Arc<Shared>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let idle = async {
            match ping {
                Some(p) => tokio::time::sleep(p.after).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = closed.changed() => {
                while let Ok(frame) = outbound.try_recv() {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        warn!(error = %e, "Write failed, closing channel");
                        break;
                    }
                }
                None => break,
            },
            _ = idle => {
                let Some(p) = ping else { continue };
                match codec.encode(&Message::ping(p.serialization, p.compression)) {
                    Ok(frame) => {
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            warn!(error = %e, "Heartbeat write failed, closing channel");
                            break;
                        }
                        debug!("Heartbeat ping sent");
                    }
                    Err(e) => warn!(error = %e, "Failed to encode heartbeat ping"),
                }
            }
        }
    }
    shared.shut();
    let _ = writer.shutdown().await;
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    codec: Arc<FrameCodec>,
    inbound: mpsc::Sender<RpcResult<Bytes>>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = codec.read_frame(&mut reader) => frame,
            _ = closed.changed() => break,
        };
        let failed = frame.is_err();
        if inbound.send(frame).await.is_err() || failed {
            break;
        }
    }
}
