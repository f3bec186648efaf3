//! Connection liveness monitoring.
//!
//! A repeating timer pings the peer at the configured interval; each ping
//! arms a response-deadline timer that the reader loop disarms when a pong
//! (or a peer ping) arrives. A missed deadline fires the dead notification;
//! the connection is only terminated when `disconnect_dead` was explicitly
//! opted in — the default policy is detect-and-report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};
use tungstenite::Message;

use super::connection::Connection;
use crate::config::ConfigError;
use crate::timer::{self, TimerHandle};

/// Callback invoked when a connection misses its pong deadline.
pub type DeadCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Heartbeat timing and policy.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Terminate dead connections instead of only reporting them.
    pub disconnect_dead: bool,
}

impl HeartbeatConfig {
    #[must_use]
    pub fn builder() -> HeartbeatConfigBuilder {
        HeartbeatConfigBuilder::new()
    }
}

/// Builder for [`HeartbeatConfig`].
pub struct HeartbeatConfigBuilder {
    interval: Duration,
    timeout: Duration,
    disconnect_dead: bool,
}

impl Default for HeartbeatConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            disconnect_dead: false,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn disconnect_dead(mut self, disconnect: bool) -> Self {
        self.disconnect_dead = disconnect;
        self
    }

    pub fn build(self) -> Result<HeartbeatConfig, ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "interval",
                reason: "ping interval must be non-zero".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timeout",
                reason: "response timeout must be non-zero".to_string(),
            });
        }
        Ok(HeartbeatConfig {
            interval: self.interval,
            timeout: self.timeout,
            disconnect_dead: self.disconnect_dead,
        })
    }
}

/// Running heartbeat for one connection: one ping timer, at most one armed
/// response deadline.
pub struct Heartbeat {
    ping: TimerHandle,
    pending: Arc<Mutex<Option<TimerHandle>>>,
}

impl Heartbeat {
    /// Start monitoring `conn`. Both timers are disposed via
    /// [`Heartbeat::stop`] when the connection goes away.
    pub fn start(conn: Arc<Connection>, config: HeartbeatConfig, on_dead: DeadCallback) -> Self {
        let pending: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
        let pending_for_ping = pending.clone();

        let ping = timer::every(config.interval, move || {
            if !conn.is_open() {
                return false;
            }
            if !conn.send(Message::Ping(Vec::new())) {
                return false;
            }
            debug!(connection = %conn.id(), "ping sent");

            let Ok(mut slot) = pending_for_ping.lock() else {
                return false;
            };
            // A still-armed deadline means the previous ping is unanswered;
            // keep that single live timer rather than arming a second one.
            if slot.is_none() {
                let conn_for_deadline = conn.clone();
                let on_dead = on_dead.clone();
                let slot_ref = pending_for_ping.clone();
                *slot = Some(timer::after(config.timeout, move || {
                    if let Ok(mut slot) = slot_ref.lock() {
                        *slot = None;
                    }
                    warn!(connection = %conn_for_deadline.id(), "heartbeat deadline missed");
                    on_dead(&conn_for_deadline);
                    if config.disconnect_dead {
                        conn_for_deadline.close();
                    }
                }));
            }
            true
        });

        Heartbeat { ping, pending }
    }

    /// Record liveness (pong or peer ping) and disarm the pending deadline.
    pub fn pong_received(&self) {
        if let Ok(mut slot) = self.pending.lock() {
            if let Some(deadline) = slot.take() {
                deadline.cancel();
            }
        }
    }

    /// Dispose both timers.
    pub fn stop(&self) {
        self.ping.cancel();
        if let Ok(mut slot) = self.pending.lock() {
            if let Some(deadline) = slot.take() {
                deadline.cancel();
            }
        }
    }
}
