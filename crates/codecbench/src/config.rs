//! Harness Configuration
//!
//! Settings shared by every test a suite runs: where reports land, how
//! parallel sub-tests and pursuit instances are staggered, and how long
//! draining may take.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default delay before each parallel sub-test is started
pub const DEFAULT_PARALLEL_START_DELAY: Duration = Duration::from_millis(200);

/// Default delay between instances of a pursuit test
pub const DEFAULT_PURSUIT_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on the completion drain after a session is closed
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of input frames between progress log lines
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100;

/// Configuration for a harness run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Directory for JSON reports and encoded output
    pub work_dir: PathBuf,
    /// Persist a JSON report per completed task
    pub write_reports: bool,
    /// Persist the encoded bitstream per test
    pub write_output: bool,
    /// Presentation time of frame 0, in microseconds
    pub pts_offset_usec: i64,
    /// Delay before starting each parallel sub-test
    pub parallel_start_delay: Duration,
    /// Delay between instances of a pursuit test
    pub pursuit_interval: Duration,
    /// Upper bound on waiting for outstanding completions
    pub drain_timeout: Duration,
    /// Input frames between progress log lines (0 disables)
    pub progress_interval: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("target/codecbench"),
            write_reports: true,
            write_output: false,
            pts_offset_usec: 0,
            parallel_start_delay: DEFAULT_PARALLEL_START_DELAY,
            pursuit_interval: DEFAULT_PURSUIT_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl HarnessConfig {
    /// Create a new builder
    #[must_use]
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Resolve a source locator against the work directory
    #[must_use]
    pub fn resolve(&self, locator: &str) -> PathBuf {
        let path = Path::new(locator);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }
}

/// Builder for `HarnessConfig`
#[derive(Debug, Clone, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    /// Set the work directory
    #[must_use]
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    /// Enable/disable JSON report persistence
    #[must_use]
    pub fn write_reports(mut self, enabled: bool) -> Self {
        self.config.write_reports = enabled;
        self
    }

    /// Enable/disable bitstream persistence
    #[must_use]
    pub fn write_output(mut self, enabled: bool) -> Self {
        self.config.write_output = enabled;
        self
    }

    /// Set the pts of frame 0
    #[must_use]
    pub fn pts_offset_usec(mut self, offset: i64) -> Self {
        self.config.pts_offset_usec = offset;
        self
    }

    /// Set the parallel start stagger
    #[must_use]
    pub fn parallel_start_delay(mut self, delay: Duration) -> Self {
        self.config.parallel_start_delay = delay;
        self
    }

    /// Set the delay between pursuit instances
    #[must_use]
    pub fn pursuit_interval(mut self, interval: Duration) -> Self {
        self.config.pursuit_interval = interval;
        self
    }

    /// Set the drain bound
    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Set the progress log interval
    #[must_use]
    pub fn progress_interval(mut self, frames: u64) -> Self {
        self.config.progress_interval = frames;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> HarnessConfig {
        self.config
    }
}
