//! Pending-call table: request id → single-assignment result slot.
//!
//! Every way out of the table (`complete`, `fail`, `fail_channel`,
//! `abandon`, dropping the [`PendingCall`]) goes through `DashMap::remove`,
//! so each slot is resolved at most once no matter which path wins.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tether_types::error::{RpcError, RpcResult};
use tether_types::message::Response;
use tokio::sync::oneshot;
use tracing::debug;

struct Pending {
    tx: oneshot::Sender<RpcResult<Response>>,
    /// Channel the request was written to, once known.
    channel: Option<u64>,
}

type Slots = Arc<DashMap<String, Pending>>;

/// Shared table of calls waiting for a response.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    slots: Slots,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `request_id`. Must happen before the request is written.
    pub fn register(&self, request_id: &str) -> RpcResult<PendingCall> {
        let (tx, rx) = oneshot::channel();
        match self.slots.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(RpcError::Protocol(format!(
                "request id {request_id} is already pending"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Pending { tx, channel: None });
                Ok(PendingCall {
                    request_id: request_id.to_string(),
                    rx,
                    slots: Arc::clone(&self.slots),
                    settled: false,
                })
            }
        }
    }

    /// Record which channel carries the request. Returns `false` if the
    /// slot is already gone.
    pub fn bind(&self, request_id: &str, channel_id: u64) -> bool {
        match self.slots.get_mut(request_id) {
            Some(mut pending) => {
                pending.channel = Some(channel_id);
                true
            }
            None => false,
        }
    }

    /// Deliver a response to its waiting caller.
    ///
    /// A response nobody is waiting for is [`RpcError::UnknownCorrelation`].
    pub fn complete(&self, response: Response) -> RpcResult<()> {
        let Some((id, pending)) = self.slots.remove(&response.request_id) else {
            return Err(RpcError::UnknownCorrelation(response.request_id));
        };
        if pending.tx.send(Ok(response)).is_err() {
            debug!(request_id = %id, "Caller went away before its response arrived");
        }
        Ok(())
    }

    /// Fail one pending call. Returns `false` if it was already resolved.
    pub fn fail(&self, request_id: &str, error: RpcError) -> bool {
        match self.slots.remove(request_id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every call bound to `channel_id`; returns how many were failed.
    pub fn fail_channel(&self, channel_id: u64, error: RpcError) -> usize {
        let ids: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.channel == Some(channel_id))
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self
                .slots
                .remove_if(&id, |_, pending| pending.channel == Some(channel_id))
            {
                let _ = pending.tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Drop a slot without notifying anyone.
    pub fn abandon(&self, request_id: &str) -> bool {
        self.slots.remove(request_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.slots.len()
    }
}

/// Caller's half of a registered slot; resolves to the response or the
/// error the slot was failed with. Dropping it abandons the slot.
pub struct PendingCall {
    request_id: String,
    rx: oneshot::Receiver<RpcResult<Response>>,
    slots: Slots,
    settled: bool,
}

impl PendingCall {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingCall {
    type Output = RpcResult<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(RpcError::ChannelClosed(format!(
                "slot for {} dropped without a result",
                self.request_id
            ))),
        };
        self.settled = true;
        Poll::Ready(result)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled {
            self.slots.remove(&self.request_id);
        }
    }
}
