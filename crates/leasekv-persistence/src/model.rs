//! Row model for key-value tables
//!
//! Each key owns one row with four columns: `key`, `value` (JSON text,
//! `NULL` when no value was ever written), `lock_token` (`0` when unlocked)
//! and `locked_until` (absolute epoch seconds).

use leasekv_common::Token;

/// Column names every key-value table must carry
pub const COLUMNS: [&str; 4] = ["key", "value", "lock_token", "locked_until"];

/// One persisted key-value row
#[derive(Debug, Clone, PartialEq)]
pub struct LockRow {
    pub key: String,
    /// Serialized value, `None` if never written
    pub value: Option<String>,
    pub lock_token: Token,
    /// Lease expiry, seconds since the Unix epoch
    pub locked_until: f64,
}

impl LockRow {
    /// An unlocked row without a value
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            lock_token: Token::UNLOCKED,
            locked_until: 0.0,
        }
    }

    /// Whether the recorded lease has run out at `now`
    pub fn is_expired(&self, now: f64) -> bool {
        now > self.locked_until
    }

    /// Whether `token` may write a lease onto this row at `now`: the row is
    /// unlocked, its lease expired, or `token` already holds it (renewal).
    pub fn is_claimable_by(&self, token: Token, now: f64) -> bool {
        self.lock_token.is_unlocked() || self.is_expired(now) || self.lock_token == token
    }

    /// Apply a patch in place, leaving unpatched columns untouched
    pub fn apply(&mut self, patch: &RowPatch) {
        if let Some(value) = &patch.value {
            self.value = value.clone();
        }
        if let Some(token) = patch.lock_token {
            self.lock_token = token;
        }
        if let Some(until) = patch.locked_until {
            self.locked_until = until;
        }
    }
}

/// Eligibility of a possibly-missing row; a missing row is unlocked.
pub fn is_claimable(row: Option<&LockRow>, token: Token, now: f64) -> bool {
    row.is_none_or(|row| row.is_claimable_by(token, now))
}

/// Partial row update for upserts. `None` fields are left as they are on
/// update and take the `LockRow::new` defaults on insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPatch {
    pub value: Option<Option<String>>,
    pub lock_token: Option<Token>,
    pub locked_until: Option<f64>,
}

impl RowPatch {
    /// Record `token` as holder until `locked_until`
    pub fn lease(token: Token, locked_until: f64) -> Self {
        Self {
            lock_token: Some(token),
            locked_until: Some(locked_until),
            ..Default::default()
        }
    }

    /// Reset the holder to the unlocked sentinel
    pub fn unlock() -> Self {
        Self {
            lock_token: Some(Token::UNLOCKED),
            ..Default::default()
        }
    }

    /// Replace the stored value
    pub fn value(value: Option<String>) -> Self {
        Self {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.lock_token.is_none() && self.locked_until.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_claimable_states() {
        let me = Token::from_raw(1.25);
        let other = Token::from_raw(1.75);
        let now = 1_000.0;

        assert!(is_claimable(None, me, now));

        let mut row = LockRow::new("carlos");
        assert!(row.is_claimable_by(me, now));

        row.apply(&RowPatch::lease(other, now + 5.0));
        assert!(!row.is_claimable_by(me, now));
        assert!(row.is_claimable_by(other, now));
        // Lease ran out: stale holder
        assert!(row.is_claimable_by(me, now + 6.0));
        // Boundary: expiry requires now strictly past locked_until
        assert!(!row.is_claimable_by(me, now + 5.0));

        row.apply(&RowPatch::unlock());
        assert!(row.is_claimable_by(me, now));
    }

    #[test]
    fn test_apply_leaves_unpatched_columns() {
        let mut row = LockRow::new("k");
        row.apply(&RowPatch::value(Some("\"v\"".to_string())));
        row.apply(&RowPatch::lease(Token::from_raw(1.5), 42.0));
        row.apply(&RowPatch::unlock());

        assert_eq!(row.value.as_deref(), Some("\"v\""));
        assert!(row.lock_token.is_unlocked());
        assert_eq!(row.locked_until, 42.0);
        assert!(RowPatch::default().is_empty());
        assert!(!RowPatch::unlock().is_empty());
    }

    proptest! {
        #[test]
        fn prop_live_foreign_lease_is_never_claimable(
            holder in 1.0f64..2.0,
            claimant in 1.0f64..2.0,
            now in 0.0f64..1e9,
            remaining in 0.0f64..1e3,
        ) {
            prop_assume!(holder != claimant);
            let mut row = LockRow::new("k");
            row.apply(&RowPatch::lease(Token::from_raw(holder), now + remaining));
            prop_assert!(!row.is_claimable_by(Token::from_raw(claimant), now));
            prop_assert!(row.is_claimable_by(Token::from_raw(holder), now));
        }
    }
}
