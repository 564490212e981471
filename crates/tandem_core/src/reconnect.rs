//! Reconnection policy as an explicit state machine.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──open──▶ Connected
//!   ▲                  ▲   │                 │
//!   │ stop             │   │ close           │ close
//!   │                  │   ▼                 ▼
//!   └──────────────── Backoff { attempt, delay } ──(attempts exhausted)──▶ GaveUp
//! ```
//!
//! The policy holds no clock and no timer. Callers own the timer: when
//! [`ReconnectPolicy::on_disconnected`] returns [`ReconnectDecision::Retry`]
//! they wait `delay` and then call [`ReconnectPolicy::retry_started`].

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry. Retry `n` (0-indexed) waits
    /// `base_delay * 2^n`.
    pub base_delay: Duration,
    /// Retries allowed since the last successful connection.
    pub max_attempts: u32,
    /// Optional ceiling on a single delay.
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 10,
            max_delay: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay for retry `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// Not connected and not trying to be.
    Idle,
    Connecting,
    Connected,
    /// Waiting `delay` before retry number `attempt`.
    Backoff { attempt: u32, delay: Duration },
    /// Terminal until the caller asks to connect again.
    GaveUp { attempts: u32 },
}

/// What the caller should do after a transport close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
    /// The close was requested; do nothing.
    Stop,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    state: ReconnectState,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ReconnectState::Idle,
            attempts: 0,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Retries scheduled since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The caller asked to connect. Returns `false` when a connection is
    /// already open or opening.
    ///
    /// Connecting from `Idle` or `GaveUp` starts a fresh retry budget.
    /// Connecting during a backoff skips the remaining wait.
    pub fn connect_requested(&mut self) -> bool {
        match self.state {
            ReconnectState::Connecting | ReconnectState::Connected => false,
            ReconnectState::Idle | ReconnectState::GaveUp { .. } => {
                self.attempts = 0;
                self.state = ReconnectState::Connecting;
                true
            }
            ReconnectState::Backoff { .. } => {
                self.state = ReconnectState::Connecting;
                true
            }
        }
    }

    /// The transport opened.
    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.state = ReconnectState::Connected;
    }

    /// The transport closed or failed to open.
    pub fn on_disconnected(&mut self) -> ReconnectDecision {
        match self.state {
            ReconnectState::Idle => return ReconnectDecision::Stop,
            ReconnectState::GaveUp { attempts } => return ReconnectDecision::GaveUp { attempts },
            _ => {}
        }

        if self.attempts >= self.config.max_attempts {
            let attempts = self.attempts;
            self.state = ReconnectState::GaveUp { attempts };
            return ReconnectDecision::GaveUp { attempts };
        }

        let attempt = self.attempts;
        let delay = self.config.delay_for(attempt);
        self.attempts += 1;
        self.state = ReconnectState::Backoff { attempt, delay };
        ReconnectDecision::Retry { attempt, delay }
    }

    /// The backoff timer fired. Returns `false` if the retry was
    /// cancelled in the meantime.
    pub fn retry_started(&mut self) -> bool {
        match self.state {
            ReconnectState::Backoff { .. } => {
                self.state = ReconnectState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Intentional teardown. Cancels any pending retry and returns whether
    /// one was pending.
    pub fn stop(&mut self) -> bool {
        let had_pending = matches!(self.state, ReconnectState::Backoff { .. });
        self.state = ReconnectState::Idle;
        had_pending
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
