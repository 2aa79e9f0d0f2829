//! Connection lifecycle: status state machine and bounded reconnection.
//!
//! ```text
//! Connecting ──SUBSCRIBED──► Connected
//!     ▲                          │
//!     │ timer / online      CLOSED / ERROR / offline
//!     │                          ▼
//!     └───────────────────  Disconnected
//! ```
//!
//! [`ConnectionManager`] is a pure state machine: it consumes transport
//! status, timer expiry, and host online/offline signals, and emits
//! [`ConnectionAction`]s for the provider driver to execute. Keeping the
//! side effects out makes the backoff sequence exactly testable.

use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::channel::ChannelStatus;

/// Current connection status. Exactly one value per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// What status listeners observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionStatus),
    /// All reconnect attempts are exhausted; a manual reconnect (or page
    /// reload) is required. Surfaced as a signal, never an error return.
    ReconnectFailed,
}

/// Reconnection tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Retries allowed before giving up.
    pub max_attempts: u32,
    /// Add up to 25% random jitter on top of each delay, so many rooms
    /// dropped by the same outage do not reconnect in lockstep.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_attempts: 5,
            jitter: true,
        }
    }
}

/// Exponential backoff schedule: `initial * 2^attempt`, bounded by
/// `max_attempts`.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectSchedule {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Next delay to wait before retrying, or `None` once attempts are
    /// exhausted. Increments the attempt counter.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        // Saturate so large attempt counts cannot overflow the delay
        let factor = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        let base = self.config.initial_delay.saturating_mul(factor);
        self.attempt += 1;

        if self.config.jitter {
            let max_jitter = (base / 4).as_millis() as u64;
            let jitter = if max_jitter > 0 {
                rand::thread_rng().gen_range(0..=max_jitter)
            } else {
                0
            };
            Some(base.saturating_add(Duration::from_millis(jitter)))
        } else {
            Some(base)
        }
    }

    /// Reset after a successful subscribe or a host online signal.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }
}

/// One-shot cancellable timer driving delayed reconnects.
///
/// `destroy()` has exactly one place to reach to guarantee no timer
/// outlives the provider.
pub struct ReconnectTimer {
    handle: Option<JoinHandle<()>>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Arm the timer; any previously armed timer is cancelled first.
    pub fn arm(&mut self, delay: Duration, on_elapsed: impl FnOnce() + Send + 'static) {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_elapsed();
        }));
    }

    /// Cancel any armed timer. Safe to call when none is armed.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Default for ReconnectTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReconnectTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Side effects requested by the state machine, executed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Initiate a channel subscription.
    OpenChannel,
    /// Arm the reconnect timer.
    ArmReconnect(Duration),
    /// Cancel any armed reconnect timer.
    CancelReconnect,
    /// Notify status listeners.
    NotifyStatus(ConnectionStatus),
    /// Notify listeners that reconnection has been given up.
    NotifyReconnectFailed,
    /// Run post-connect recovery: full-state sync + presence replay.
    RunResync,
}

/// Owns the status value and the backoff schedule.
pub struct ConnectionManager {
    status: ConnectionStatus,
    schedule: ReconnectSchedule,
    /// Host connectivity as last reported. Reconnects are suppressed
    /// while offline.
    online: bool,
}

impl ConnectionManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            schedule: ReconnectSchedule::new(config),
            online: true,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Actions for the initial connection attempt.
    pub fn start(&mut self) -> Vec<ConnectionAction> {
        self.status = ConnectionStatus::Connecting;
        vec![
            ConnectionAction::NotifyStatus(ConnectionStatus::Connecting),
            ConnectionAction::OpenChannel,
        ]
    }

    /// Transport status arrived.
    pub fn on_channel_status(&mut self, status: ChannelStatus) -> Vec<ConnectionAction> {
        match status {
            ChannelStatus::Subscribed => {
                self.schedule.reset();
                self.status = ConnectionStatus::Connected;
                vec![
                    ConnectionAction::NotifyStatus(ConnectionStatus::Connected),
                    ConnectionAction::RunResync,
                ]
            }
            ChannelStatus::Closed | ChannelStatus::Errored => {
                let mut actions = Vec::new();
                if self.status != ConnectionStatus::Disconnected {
                    self.status = ConnectionStatus::Disconnected;
                    actions.push(ConnectionAction::NotifyStatus(ConnectionStatus::Disconnected));
                }
                if !self.online {
                    // Wait for the online signal; no timer.
                    return actions;
                }
                match self.schedule.next_delay() {
                    Some(delay) => actions.push(ConnectionAction::ArmReconnect(delay)),
                    None => actions.push(ConnectionAction::NotifyReconnectFailed),
                }
                actions
            }
        }
    }

    /// The armed reconnect timer elapsed.
    pub fn on_reconnect_timer(&mut self) -> Vec<ConnectionAction> {
        if self.status != ConnectionStatus::Disconnected {
            return Vec::new();
        }
        self.status = ConnectionStatus::Connecting;
        vec![
            ConnectionAction::NotifyStatus(ConnectionStatus::Connecting),
            ConnectionAction::OpenChannel,
        ]
    }

    /// Host came online: reset attempts and reconnect immediately,
    /// bypassing any armed backoff timer.
    pub fn on_online(&mut self) -> Vec<ConnectionAction> {
        self.online = true;
        self.schedule.reset();
        if self.status != ConnectionStatus::Disconnected {
            return Vec::new();
        }
        self.status = ConnectionStatus::Connecting;
        vec![
            ConnectionAction::CancelReconnect,
            ConnectionAction::NotifyStatus(ConnectionStatus::Connecting),
            ConnectionAction::OpenChannel,
        ]
    }

    /// Host went offline: pin Disconnected and stop retrying until the
    /// online signal fires.
    pub fn on_offline(&mut self) -> Vec<ConnectionAction> {
        self.online = false;
        let mut actions = vec![ConnectionAction::CancelReconnect];
        if self.status != ConnectionStatus::Disconnected {
            self.status = ConnectionStatus::Disconnected;
            actions.push(ConnectionAction::NotifyStatus(ConnectionStatus::Disconnected));
        }
        actions
    }
}
