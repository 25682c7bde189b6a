//! Lease Data Model

use std::time::Duration;

use leasekv_common::{LeaseSettings, Token};
use leasekv_persistence::LockRow;

/// Observed state of one key's lease
#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    /// No row, or the unlocked sentinel
    Unlocked,
    /// Held by `token` for `remaining` more time
    Held { token: Token, remaining: Duration },
    /// Lease ran out; `token` is a stale holder and the key is free to claim
    Expired { token: Token },
}

impl LockState {
    pub fn from_row(row: Option<&LockRow>, now: f64) -> Self {
        match row {
            None => Self::Unlocked,
            Some(row) if row.lock_token.is_unlocked() => Self::Unlocked,
            Some(row) if row.is_expired(now) => Self::Expired {
                token: row.lock_token,
            },
            Some(row) => Self::Held {
                token: row.lock_token,
                remaining: Duration::try_from_secs_f64((row.locked_until - now).max(0.0))
                    .unwrap_or(Duration::MAX),
            },
        }
    }

    /// Whether someone other than an expired holder owns the key
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Held { .. })
    }

    pub fn holder(&self) -> Option<Token> {
        match self {
            Self::Held { token, .. } => Some(*token),
            _ => None,
        }
    }
}

/// Result of releasing one key
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    /// The token held the key and it is now unlocked. `overrun` is how far
    /// past its lease the holder ran, if it did.
    Released { overrun: Option<Duration> },
    /// Nobody held the key any more
    AlreadyUnlocked,
    /// Another token holds the key; left untouched
    TakenOver { holder: Token },
    /// The row was deleted while the lease was held
    Vanished,
}

/// Lease length and polling behaviour for blocking acquisition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitOptions {
    /// Lease written on each successful acquisition
    pub max_duration: Duration,
    /// Sleep between attempts
    pub poll_interval: Duration,
    /// Per-key deadline, measured from when that key's wait starts;
    /// `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from(&LeaseSettings::default())
    }
}

impl From<&LeaseSettings> for WaitOptions {
    fn from(settings: &LeaseSettings) -> Self {
        Self {
            max_duration: settings.max_duration(),
            poll_interval: settings.poll_interval(),
            timeout: settings.timeout(),
        }
    }
}

impl WaitOptions {
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}
