//! Settings for LeaseKV
//!
//! Loaded from an optional config file plus `LEASEKV_`-prefixed environment
//! variables (`LEASEKV_LEASE__TIMEOUT_SECS=10`, `LEASEKV_STORE__URL=...`).
//! Environment values override the file.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{LeaseKvError, Result};
use crate::time::secs_to_duration;
use crate::utils::is_valid_identifier;
use crate::{DEFAULT_TABLE, ENV_PREFIX};

/// Config file looked up in the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "leasekv";

/// Top-level settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LeaseKvSettings {
    pub lease: LeaseSettings,
    pub store: StoreSettings,
}

/// Lease timing used by the scoped and blocking helpers
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// How long a scoped token stays exclusive (default: 0.5s)
    pub max_duration_secs: f64,
    /// Sleep between acquisition attempts while waiting (default: 0.02s)
    pub poll_interval_secs: f64,
    /// Per-key wait deadline (default: 3s). Unset, negative or
    /// too large to represent waits forever.
    pub timeout_secs: Option<f64>,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            max_duration_secs: 0.5,
            poll_interval_secs: 0.02,
            timeout_secs: Some(3.0),
        }
    }
}

impl LeaseSettings {
    pub fn max_duration(&self) -> Duration {
        secs_to_duration(self.max_duration_secs).unwrap_or_default()
    }

    pub fn poll_interval(&self) -> Duration {
        secs_to_duration(self.poll_interval_secs).unwrap_or_default()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.and_then(secs_to_duration)
    }
}

/// Backing store connection settings
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite connection URL (default: `sqlite://leasekv.db?mode=rwc`)
    pub url: String,
    /// Key-value table name (default: `kv`)
    pub table: String,
    /// Connection pool size (default: 4)
    pub max_connections: u32,
    /// Log every SQL statement through sqlx (default: false)
    pub sqlx_logging: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://leasekv.db?mode=rwc".to_string(),
            table: DEFAULT_TABLE.to_string(),
            max_connections: 4,
            sqlx_logging: false,
        }
    }
}

impl StoreSettings {
    /// Settings for a SQLite file at `path`, created if missing
    pub fn sqlite_file(path: impl AsRef<Path>) -> Self {
        Self {
            url: format!("sqlite://{}?mode=rwc", path.as_ref().display()),
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

impl LeaseKvSettings {
    /// Load from `leasekv.{toml,yaml,json,...}` in the working directory
    /// (if present) and the environment.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from an explicit config file (required when given) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings: LeaseKvSettings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_identifier(&self.store.table) {
            return Err(LeaseKvError::IllegalArgument(format!(
                "invalid table name '{}'",
                self.store.table
            )));
        }
        if secs_to_duration(self.lease.max_duration_secs).is_none() {
            return Err(LeaseKvError::IllegalArgument(format!(
                "lease.max_duration_secs must be a non-negative, finite number of seconds, got {}",
                self.lease.max_duration_secs
            )));
        }
        if secs_to_duration(self.lease.poll_interval_secs).is_none() {
            return Err(LeaseKvError::IllegalArgument(format!(
                "lease.poll_interval_secs must be a non-negative number, got {}",
                self.lease.poll_interval_secs
            )));
        }
        if self.store.max_connections == 0 {
            return Err(LeaseKvError::IllegalArgument(
                "store.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
