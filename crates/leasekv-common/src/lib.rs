//! LeaseKV Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all LeaseKV components:
//! - Error taxonomy (`LeaseKvError`)
//! - Lease tokens and the wall clock used for lease deadlines
//! - Settings loaded from config files and the environment
//! - Logging initialization

pub mod error;
pub mod logging;
pub mod settings;
pub mod time;
pub mod token;
pub mod utils;

// Re-exports for convenience
pub use error::{LeaseKvError, Result};
pub use settings::{LeaseKvSettings, LeaseSettings, StoreSettings};
pub use time::{epoch_seconds, secs_to_duration};
pub use token::Token;
pub use utils::is_valid_identifier;

/// Environment variable prefix for all LeaseKV settings
pub const ENV_PREFIX: &str = "LEASEKV";

/// Default key-value table name
pub const DEFAULT_TABLE: &str = "kv";
