//! Frame pacing.
//!
//! Derives presentation timestamps from the input frame rate and, for
//! real-time tests, spaces submissions by the output frame duration.
//! Timestamps depend only on the input frame index, so dropped frames still
//! consume their slot and timing stays anchored to the source.

use crate::definition::TestDefinition;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Frame rate used when none (or a non-positive one) is configured
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

const USEC_PER_SEC: f64 = 1_000_000.0;

/// Resolve a configured frame rate, falling back to [`DEFAULT_FRAME_RATE`].
#[must_use]
pub fn resolve_rate(rate: Option<f64>) -> f64 {
    match rate {
        Some(r) if r.is_finite() && r > 0.0 => r,
        _ => DEFAULT_FRAME_RATE,
    }
}

/// Timestamp generator and best-effort real-time cadence
#[derive(Debug, Clone)]
pub struct FramePacer {
    input_rate: f64,
    output_rate: f64,
    keep_interval: f64,
    input_frame_duration_usec: f64,
    output_frame_duration_usec: f64,
    base_offset_usec: i64,
    last_submission: Option<Instant>,
}

impl FramePacer {
    /// Create a pacer.
    ///
    /// An absent output rate inherits the input rate (no conversion).
    #[must_use]
    pub fn new(input_rate: Option<f64>, output_rate: Option<f64>, base_offset_usec: i64) -> Self {
        let input_rate = resolve_rate(input_rate);
        let output_rate = output_rate.map_or(input_rate, |r| resolve_rate(Some(r)));
        Self {
            input_rate,
            output_rate,
            keep_interval: input_rate / output_rate,
            input_frame_duration_usec: USEC_PER_SEC / input_rate,
            output_frame_duration_usec: USEC_PER_SEC / output_rate,
            base_offset_usec,
            last_submission: None,
        }
    }

    /// Pacer for a test's input and output frame rates
    #[must_use]
    pub fn for_test(test: &TestDefinition, base_offset_usec: i64) -> Self {
        Self::new(
            test.input.frame_rate,
            test.configure.frame_rate,
            base_offset_usec,
        )
    }

    /// Input frames per second
    #[must_use]
    pub const fn input_rate(&self) -> f64 {
        self.input_rate
    }

    /// Current output frames per second
    #[must_use]
    pub const fn output_rate(&self) -> f64 {
        self.output_rate
    }

    /// Input frames per output frame
    #[must_use]
    pub const fn keep_interval(&self) -> f64 {
        self.keep_interval
    }

    /// Duration of one input frame in microseconds
    #[must_use]
    pub const fn input_frame_duration_usec(&self) -> f64 {
        self.input_frame_duration_usec
    }

    /// Duration of one output frame in microseconds
    #[must_use]
    pub const fn output_frame_duration_usec(&self) -> f64 {
        self.output_frame_duration_usec
    }

    /// Presentation time of input frame `index`
    #[must_use]
    pub fn presentation_time_usec(&self, index: u64) -> i64 {
        self.base_offset_usec + (index as f64 * self.input_frame_duration_usec) as i64
    }

    /// Presentation time of input frame `index` relative to frame 0, in seconds
    #[must_use]
    pub fn elapsed_sec(&self, index: u64) -> f64 {
        index as f64 / self.input_rate
    }

    /// Change the output rate from the next paced submission on.
    ///
    /// Returns false (and changes nothing) for a non-positive rate.
    pub fn set_output_rate(&mut self, rate: f64) -> bool {
        if !(rate.is_finite() && rate > 0.0) {
            warn!(rate, "ignoring non-positive output frame rate");
            return false;
        }
        self.output_rate = rate;
        self.keep_interval = self.input_rate / rate;
        self.output_frame_duration_usec = USEC_PER_SEC / rate;
        debug!(
            rate,
            keep_interval = self.keep_interval,
            "output frame rate changed"
        );
        true
    }

    /// How long to wait at `now` before the next submission
    #[must_use]
    pub fn sleep_duration_at(&self, now: Instant) -> Duration {
        let Some(last) = self.last_submission else {
            return Duration::ZERO;
        };
        let interval = Duration::from_secs_f64(self.output_frame_duration_usec / USEC_PER_SEC);
        interval.saturating_sub(now.saturating_duration_since(last))
    }

    /// Sleep until the next submission slot and mark it taken.
    ///
    /// The first call only anchors the cadence. Overruns are not carried over.
    pub async fn pace(&mut self) -> Duration {
        let wait = self.sleep_duration_at(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.last_submission = Some(Instant::now());
        wait
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_default_to_thirty() {
        let pacer = FramePacer::new(None, None, 0);
        assert_eq!(pacer.input_rate(), 30.0);
        assert_eq!(pacer.output_rate(), 30.0);
        assert_eq!(pacer.keep_interval(), 1.0);

        let pacer = FramePacer::new(Some(-5.0), Some(0.0), 0);
        assert_eq!(pacer.input_rate(), 30.0);
        assert_eq!(pacer.output_rate(), 30.0);
    }

    #[test]
    fn test_absent_output_rate_inherits_input() {
        let pacer = FramePacer::new(Some(60.0), None, 0);
        assert_eq!(pacer.output_rate(), 60.0);
        assert_eq!(pacer.keep_interval(), 1.0);
    }

    #[test]
    fn test_keep_interval_and_durations() {
        let pacer = FramePacer::new(Some(60.0), Some(30.0), 0);
        assert_eq!(pacer.keep_interval(), 2.0);
        assert!((pacer.input_frame_duration_usec() - 16_666.666).abs() < 0.01);
        assert!((pacer.output_frame_duration_usec() - 33_333.333).abs() < 0.01);
    }

    #[test]
    fn test_presentation_time_uses_offset() {
        let pacer = FramePacer::new(Some(30.0), None, 132);
        assert_eq!(pacer.presentation_time_usec(0), 132);
        assert_eq!(pacer.presentation_time_usec(30), 1_000_132);
        assert!((pacer.elapsed_sec(45) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_dynamic_rate_leaves_timestamps_alone() {
        let mut pacer = FramePacer::new(Some(30.0), None, 0);
        let before = pacer.presentation_time_usec(10);
        assert!(pacer.set_output_rate(15.0));
        assert_eq!(pacer.keep_interval(), 2.0);
        assert!((pacer.output_frame_duration_usec() - 66_666.666).abs() < 0.01);
        assert_eq!(pacer.presentation_time_usec(10), before);
    }

    #[test]
    fn test_non_positive_dynamic_rate_ignored() {
        let mut pacer = FramePacer::new(Some(30.0), Some(15.0), 0);
        assert!(!pacer.set_output_rate(0.0));
        assert!(!pacer.set_output_rate(f64::NAN));
        assert_eq!(pacer.output_rate(), 15.0);
    }

    #[test]
    fn test_first_submission_never_waits() {
        let pacer = FramePacer::new(Some(30.0), None, 0);
        assert_eq!(pacer.sleep_duration_at(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_sleep_duration_is_remaining_interval() {
        let mut pacer = FramePacer::new(Some(10.0), None, 0);
        let anchor = Instant::now();
        pacer.last_submission = Some(anchor);

        let wait = pacer.sleep_duration_at(anchor + Duration::from_millis(40));
        assert_eq!(wait, Duration::from_millis(60));

        // Overruns collapse to zero rather than accumulating debt
        let wait = pacer.sleep_duration_at(anchor + Duration::from_millis(250));
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_pace_spaces_submissions() {
        let mut pacer = FramePacer::new(Some(100.0), None, 0);
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        pacer.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(18));
    }
}
