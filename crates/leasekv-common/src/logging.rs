//! Console logging for processes embedding LeaseKV.
//!
//! The lock protocol reports lease overruns and rows deleted mid-lease as
//! `tracing` warnings. Libraries never install a subscriber themselves; the
//! embedding process calls [`init_logging`] once.
//!
//! `RUST_LOG` takes precedence. Without it, `LEASEKV_LOG_LEVEL` (default
//! `info`) sets the level.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Console log level
    pub level: Level,
    /// Include the event target (module path)
    pub with_target: bool,
    /// Emit ANSI colors
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            with_target: true,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        let level = std::env::var("LEASEKV_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);

        let ansi = std::env::var("LEASEKV_LOG_ANSI")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);

        Self {
            level,
            ansi,
            ..Default::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Install the global console subscriber.
///
/// Fails if a global subscriber is already set, so test harnesses that
/// call it repeatedly should ignore the error.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let console_layer = fmt::layer()
        .with_target(config.with_target)
        .with_thread_names(true)
        .with_ansi(config.ansi)
        .with_filter(config.filter());

    Registry::default()
        .with(console_layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    tracing::debug!(level = %config.level, "Console logging initialized");
    Ok(())
}

/// Test-friendly variant writing through the libtest capture.
pub fn init_test_logging() {
    let _ = fmt()
        .with_env_filter(LoggingConfig::default().filter())
        .with_test_writer()
        .try_init();
}
