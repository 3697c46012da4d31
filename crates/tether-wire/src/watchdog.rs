//! Reconnect policy and the per-endpoint link state machine.
//!
//! ```text
//! Disconnected → Connecting → Active
//!                    │          │ channel lost
//!                    ▼          ▼
//!                 Backoff ◄── Backoff ──(max failures)──► Evicted
//! ```
//!
//! This module is pure bookkeeping; the connection manager owns the timers.

use std::time::Duration;
use tether_types::config::ReconnectConfig;

/// Exponential backoff without jitter: `min(base * 2^n, max)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures that evict the endpoint.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before the attempt that follows `attempt` consecutive failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let scaled = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        Duration::from_millis(scaled).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

/// Observable state of one endpoint's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Active,
    Backoff,
    Evicted,
}

/// What the watchdog should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Try again after the delay.
    Backoff(Duration),
    /// Give up and drop the endpoint.
    Evict,
}

/// Link state plus consecutive-failure count for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub state: LinkState,
    pub attempts: u32,
    /// Channel currently serving the endpoint, when `Active`.
    pub channel_id: Option<u64>,
    /// A watchdog task owns the retry loop.
    pub reconnecting: bool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            attempts: 0,
            channel_id: None,
            reconnecting: false,
        }
    }

    pub fn on_connecting(&mut self) {
        self.state = LinkState::Connecting;
    }

    /// A connect succeeded: the failure count starts over.
    pub fn on_connected(&mut self, channel_id: u64) {
        self.state = LinkState::Active;
        self.attempts = 0;
        self.channel_id = Some(channel_id);
    }

    /// A connect attempt failed.
    pub fn on_failure(&mut self, policy: &ReconnectPolicy) -> Transition {
        self.attempts = self.attempts.saturating_add(1);
        self.channel_id = None;
        if self.attempts >= policy.max_attempts {
            self.state = LinkState::Evicted;
            self.reconnecting = false;
            return Transition::Evict;
        }
        self.state = LinkState::Backoff;
        Transition::Backoff(policy.delay_for(self.attempts))
    }

    /// An active channel went away. Not a failure by itself.
    pub fn on_lost(&mut self, policy: &ReconnectPolicy) -> Transition {
        self.state = LinkState::Backoff;
        self.channel_id = None;
        Transition::Backoff(policy.delay_for(self.attempts))
    }

    pub fn is_evicted(&self) -> bool {
        self.state == LinkState::Evicted
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
