//! Reconnect policy and the connection lifecycle state machine.
//!
//! ```text
//!              start                 opened
//!   Idle ───────────────► Connecting ────────► Open
//!    ▲                      ▲    │               │
//!    │                      │    │ closed        │ closed
//!    │         reconnect due│    ▼               ▼
//!    │                      └── Closed ◄─────────┘
//!    │                            │
//!    │ stop                       └─► (attempt > max_attempts: give up, no timer)
//!    └── Closing ◄── stop (Open / Connecting)
//! ```
//!
//! [`Lifecycle`] is synchronous and owns no I/O. Every input returns the
//! [`Directive`]s the connection driver has to carry out, which keeps the
//! bounded-retry and cancellation rules testable without sockets or clocks.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Consecutive reconnect attempts before giving up
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * base_delay_ms`
    pub base_delay_ms: u64,
    /// Upper bound on a single delay
    pub max_delay_ms: u64,
    /// Deadline for one connect attempt, handshake included
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Linear backoff with a ceiling: `delay(n) = min(base * n, max)`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Reconnect attempts made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = self
            .config
            .base_delay_ms
            .saturating_mul(u64::from(attempt))
            .min(self.config.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Count one more attempt and return its delay, or `None` once the
    /// budget is spent. The counter never moves past `max_attempts`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection-level failures surfaced through the status signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Transient; the reconnect loop keeps going.
    #[error("connection error: {0}")]
    Transport(String),
    /// Terminal; no further reconnect is scheduled.
    #[error("failed to maintain connection after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}

impl ConnectionError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionError::RetriesExhausted { .. })
    }
}

/// Side effects requested by the [`Lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Close any existing socket, then open a new one.
    Open,
    /// Close the live or pending socket.
    Close,
    /// Arm the reconnect timer.
    Schedule(Duration),
    /// Disarm the reconnect timer.
    CancelTimer,
}

/// Connection lifecycle state machine.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    enabled: bool,
    policy: ReconnectPolicy,
    timer_pending: bool,
    error: Option<ConnectionError>,
}

impl Lifecycle {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            enabled: false,
            policy: ReconnectPolicy::new(config),
            timer_pending: false,
            error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.policy.attempt()
    }

    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn timer_pending(&self) -> bool {
        self.timer_pending
    }

    pub fn has_given_up(&self) -> bool {
        self.error.as_ref().is_some_and(ConnectionError::is_terminal)
    }

    /// Caller asked for a connection (`enabled`) or for none.
    pub fn start(&mut self, enabled: bool) -> Vec<Directive> {
        self.enabled = enabled;
        if !enabled {
            return self.teardown();
        }

        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                log::debug!("start ignored, connection already {}", self.state);
                Vec::new()
            }
            _ => {
                if self.has_given_up() {
                    self.policy.reset();
                    self.error = None;
                }
                let mut directives = Vec::with_capacity(2);
                if self.timer_pending {
                    self.timer_pending = false;
                    directives.push(Directive::CancelTimer);
                }
                self.state = ConnectionState::Connecting;
                directives.push(Directive::Open);
                directives
            }
        }
    }

    /// The transport finished its opening handshake.
    pub fn opened(&mut self) -> Vec<Directive> {
        if self.state != ConnectionState::Connecting {
            log::warn!("stale open while {}, closing it", self.state);
            return vec![Directive::Close];
        }
        self.state = ConnectionState::Open;
        self.policy.reset();
        self.error = None;
        log::info!("connection open");
        Vec::new()
    }

    /// The transport reported an error. Closure follows separately.
    pub fn transport_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("transport error: {reason}");
        if !self.has_given_up() {
            self.error = Some(ConnectionError::Transport(reason));
        }
    }

    /// The transport closed, planned or not.
    pub fn closed(&mut self) -> Vec<Directive> {
        if !self.enabled {
            if self.state != ConnectionState::Idle {
                log::info!("connection closed");
            }
            self.state = ConnectionState::Idle;
            return Vec::new();
        }

        self.state = ConnectionState::Closed;
        match self.policy.next_delay() {
            Some(delay) => {
                self.timer_pending = true;
                log::info!(
                    "connection lost, reconnecting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    self.policy.attempt(),
                    self.policy.max_attempts()
                );
                vec![Directive::Schedule(delay)]
            }
            None => {
                if !self.has_given_up() {
                    let attempts = self.policy.max_attempts();
                    log::error!("giving up after {attempts} reconnect attempts");
                    self.error = Some(ConnectionError::RetriesExhausted { attempts });
                }
                Vec::new()
            }
        }
    }

    /// The reconnect timer fired.
    pub fn reconnect_due(&mut self) -> Vec<Directive> {
        if !self.timer_pending {
            return Vec::new();
        }
        self.timer_pending = false;
        if !self.enabled || self.state != ConnectionState::Closed {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Directive::Open]
    }

    /// Deliberate teardown. Idempotent.
    pub fn stop(&mut self) -> Vec<Directive> {
        self.enabled = false;
        self.teardown()
    }

    fn teardown(&mut self) -> Vec<Directive> {
        let mut directives = Vec::with_capacity(2);
        if self.timer_pending {
            self.timer_pending = false;
            directives.push(Directive::CancelTimer);
        }
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                self.state = ConnectionState::Closing;
                directives.push(Directive::Close);
            }
            ConnectionState::Closing => {}
            ConnectionState::Idle | ConnectionState::Closed => {
                self.state = ConnectionState::Idle;
            }
        }
        self.policy.reset();
        self.error = None;
        directives
    }
}
