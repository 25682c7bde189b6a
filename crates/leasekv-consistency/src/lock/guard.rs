//! Scoped lease holder
//!
//! A `LeaseGuard` owns the token for a set of keys. Call
//! [`LeaseGuard::release`] when the critical section ends. A guard dropped
//! without being released (early return, panic, cancelled future) spawns
//! the release on the current tokio runtime instead; outside a runtime the
//! keys stay locked until their lease expires.

use std::time::Duration;

use leasekv_common::{Result, Token};
use tokio::time::Instant;

use super::model::ReleaseOutcome;
use super::service::{LeaseLock, METRIC_OVERRUN};

pub struct LeaseGuard {
    lock: LeaseLock,
    keys: Vec<String>,
    token: Token,
    max_duration: Duration,
    granted: bool,
    granted_at: Option<Instant>,
    armed: bool,
}

impl LeaseGuard {
    pub(crate) fn new(lock: LeaseLock, keys: Vec<String>, token: Token, max_duration: Duration) -> Self {
        Self {
            lock,
            keys,
            token,
            max_duration,
            granted: false,
            granted_at: None,
            armed: true,
        }
    }

    pub(crate) fn set_granted(&mut self, granted: bool) {
        self.granted = granted;
        self.granted_at = granted.then(Instant::now);
    }

    /// The guard's token whether or not it was granted. Guards returned by
    /// `wait` are always granted, so this is the token to hand to guarded
    /// writes without unwrapping [`token`](Self::token).
    pub fn raw_token(&self) -> Token {
        self.token
    }

    /// The token if every key was granted, `None` if access was denied
    pub fn token(&self) -> Option<Token> {
        self.granted.then_some(self.token)
    }

    pub fn is_granted(&self) -> bool {
        self.granted
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Whether more than `max_duration` has passed since the keys were
    /// last granted or renewed
    pub fn lease_expired(&self) -> bool {
        self.granted_at
            .is_some_and(|at| at.elapsed() > self.max_duration)
    }

    /// Extend the lease on all keys by another `max_duration`.
    pub async fn renew(&mut self) -> Result<bool> {
        let granted = self
            .lock
            .renew(&self.keys, self.token, self.max_duration)
            .await?;
        self.set_granted(granted);
        Ok(granted)
    }

    /// Drop the guard without releasing, e.g. after the rows were deleted.
    pub fn disarm(mut self) {
        self.armed = false;
    }

    /// Release every key still held by this guard's token.
    pub async fn release(mut self) -> Result<()> {
        self.armed = false;
        let outcomes = self
            .lock
            .release_many(&self.keys, self.token, self.max_duration)
            .await?;

        if !self.granted {
            return Ok(());
        }

        let expired = self.lease_expired();
        for (key, outcome) in self.keys.iter().zip(&outcomes) {
            let ReleaseOutcome::TakenOver { holder } = outcome else {
                continue;
            };
            // Guarded writes release early, so a new holder alone is not an overrun
            if expired {
                metrics::counter!(METRIC_OVERRUN).increment(1);
                tracing::warn!(
                    key = key.as_str(),
                    token = %self.token,
                    holder = %holder,
                    max_duration_ms = self.max_duration.as_millis() as u64,
                    "Lease expired and was taken over before release"
                );
            } else {
                tracing::debug!(
                    key = key.as_str(),
                    token = %self.token,
                    holder = %holder,
                    "Key was released early and re-acquired by another holder"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("table", &self.lock.store().table_name())
            .field("keys", &self.keys)
            .field("token", &self.token)
            .field("granted", &self.granted)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let lock = self.lock.clone();
        let keys = std::mem::take(&mut self.keys);
        let token = self.token;
        let max_duration = self.max_duration;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release_many(&keys, token, max_duration).await {
                        tracing::error!(error = %e, "Failed to release dropped lease guard");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    keys = ?keys,
                    "Lease guard dropped outside a tokio runtime; keys stay locked until the lease expires"
                );
            }
        }
    }
}
