//! Lease tokens

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifier of a lease holder.
///
/// Stored as the `lock_token` column. `0` is reserved for "unlocked";
/// fresh tokens are drawn from `[1, 2)`, so a random token never
/// collides with the sentinel. Uniqueness between holders is
/// probabilistic.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(f64);

impl Token {
    /// The unlocked sentinel
    pub const UNLOCKED: Token = Token(0.0);

    /// Draw a fresh single-use token in `[1, 2)`.
    pub fn random() -> Self {
        Token(1.0 + rand::random::<f64>())
    }

    pub fn from_raw(raw: f64) -> Self {
        Token(raw)
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    pub fn is_unlocked(self) -> bool {
        self == Self::UNLOCKED
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<f64> for Token {
    fn from(value: f64) -> Self {
        Token(value)
    }
}
