//! Tracing subscriber setup.
//!
//! The harness itself only emits `tracing` events; embedding applications
//! decide where they go. `init_tracing` is a convenience for binaries and
//! integration tests that want the usual fmt output filtered by `RUST_LOG`.

use crate::result::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for the fmt subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    Pretty,
    /// Single-line output
    #[default]
    Compact,
    /// Newline-delimited JSON, one object per event
    Json,
}

impl LogFormat {
    /// Parse a format name (`pretty`, `compact`, `json`)
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Build the filter: `RUST_LOG` wins, otherwise `default_directive`.
pub fn env_filter(default_directive: &str) -> BenchResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| BenchError::configuration(format!("invalid log filter: {e}")))
}

/// Install a global fmt subscriber.
///
/// Returns a configuration error if a global subscriber is already set.
pub fn init_tracing(format: LogFormat, default_directive: &str) -> BenchResult<()> {
    let filter = env_filter(default_directive)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| BenchError::configuration(format!("tracing already initialised: {e}")))
}
