//! Error types for LeaseKV
//!
//! Lock contention (`Timeout`, `TokenInvalid`) is kept apart from broken
//! storage (`Storage`, `Serialization`, `SchemaMismatch`) so callers can
//! branch on "resource busy" versus "I/O broken".

use std::time::Duration;

use crate::token::Token;

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum LeaseKvError {
    /// A blocking wait ran past its deadline for `key`
    #[error("waiting for access token timed out after {timeout:?} on key '{key}'")]
    Timeout { key: String, timeout: Duration },

    /// The presented token does not currently own `key`
    #[error("invalid or expired token {token} for key '{key}'")]
    TokenInvalid { key: String, token: Token },

    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("table '{table}' has unexpected columns {columns:?}")]
    SchemaMismatch { table: String, columns: Vec<String> },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl LeaseKvError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_token_invalid(&self) -> bool {
        matches!(self, Self::TokenInvalid { .. })
    }

    /// True when the failure is lock contention rather than a broken store.
    pub fn is_busy(&self) -> bool {
        self.is_timeout() || self.is_token_invalid()
    }
}

pub type Result<T> = std::result::Result<T, LeaseKvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_errors_are_distinguishable() {
        let timeout = LeaseKvError::Timeout {
            key: "carlos".to_string(),
            timeout: Duration::from_secs(3),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.is_busy());
        assert!(!timeout.is_token_invalid());

        let invalid = LeaseKvError::TokenInvalid {
            key: "carlos".to_string(),
            token: Token::from_raw(1.5),
        };
        assert!(invalid.is_token_invalid());
        assert!(invalid.is_busy());

        let storage = LeaseKvError::Storage(anyhow::anyhow!("disk I/O error"));
        assert!(!storage.is_busy());
    }

    #[test]
    fn test_error_messages() {
        let err = LeaseKvError::Timeout {
            key: "adri".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "waiting for access token timed out after 250ms on key 'adri'"
        );

        let err = LeaseKvError::IllegalArgument("no keys to lock".to_string());
        assert_eq!(err.to_string(), "caused: no keys to lock");
    }
}
