//! Frame-rate conversion by dropping input frames.
//!
//! Frame `i` is dropped when `floor(i / r) == floor((i + 1) / r)` for the
//! keep interval `r`. The rule is stateless, so it can be recomputed after a
//! source restart, and over any window of N frames it keeps within one frame
//! of `N / r`. Explicit drops override the ratio rule.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Why a frame was not submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Listed as an explicit drop
    Explicit,
    /// Skipped to reach the output frame rate
    RateConversion,
}

/// Ratio rule: whether frame `index` is dropped at keep interval `keep_interval`.
///
/// A ratio that is not a positive finite number keeps every frame.
#[must_use]
pub fn dropped_by_ratio(index: u64, keep_interval: f64) -> bool {
    if !(keep_interval.is_finite() && keep_interval > 0.0) {
        return false;
    }
    let bucket = (index as f64 / keep_interval).floor();
    let next = ((index + 1) as f64 / keep_interval).floor();
    bucket == next
}

/// Drop decision with an explicit override list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropDecision {
    explicit: BTreeSet<u64>,
}

impl DropDecision {
    /// Create with an explicit drop list
    #[must_use]
    pub fn new(explicit: impl IntoIterator<Item = u64>) -> Self {
        Self {
            explicit: explicit.into_iter().collect(),
        }
    }

    /// Explicit drop indices
    #[must_use]
    pub const fn explicit(&self) -> &BTreeSet<u64> {
        &self.explicit
    }

    /// Decide for frame `index`; `None` means submit it.
    #[must_use]
    pub fn evaluate(&self, index: u64, keep_interval: f64) -> Option<DropReason> {
        if self.explicit.contains(&index) {
            Some(DropReason::Explicit)
        } else if dropped_by_ratio(index, keep_interval) {
            Some(DropReason::RateConversion)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn kept(decision: &DropDecision, frames: std::ops::Range<u64>, r: f64) -> Vec<u64> {
        frames
            .filter(|&i| decision.evaluate(i, r).is_none())
            .collect()
    }

    #[test]
    fn test_sixty_to_thirty_keeps_half() {
        let decision = DropDecision::default();
        let kept = kept(&decision, 0..10, 60.0 / 30.0);
        assert_eq!(kept, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_unit_ratio_keeps_everything() {
        assert!((0..1000).all(|i| !dropped_by_ratio(i, 1.0)));
    }

    #[test]
    fn test_upsampling_ratio_keeps_everything() {
        assert!((0..1000).all(|i| !dropped_by_ratio(i, 0.5)));
    }

    #[test]
    fn test_invalid_ratio_keeps_everything() {
        assert!(!dropped_by_ratio(3, 0.0));
        assert!(!dropped_by_ratio(3, -2.0));
        assert!(!dropped_by_ratio(3, f64::NAN));
        assert!(!dropped_by_ratio(3, f64::INFINITY));
    }

    #[test]
    fn test_explicit_list_without_conversion() {
        let decision = DropDecision::new([3, 7]);
        let dropped: Vec<_> = (0..10)
            .filter_map(|i| decision.evaluate(i, 1.0).map(|reason| (i, reason)))
            .collect();
        assert_eq!(
            dropped,
            vec![(3, DropReason::Explicit), (7, DropReason::Explicit)]
        );
    }

    #[test]
    fn test_explicit_overrides_ratio() {
        let decision = DropDecision::new([1]);
        // Frame 1 is kept by r=2 but explicitly listed
        assert_eq!(decision.evaluate(1, 2.0), Some(DropReason::Explicit));
        assert_eq!(decision.evaluate(2, 2.0), Some(DropReason::RateConversion));
        assert_eq!(decision.evaluate(3, 2.0), None);
    }

    #[test]
    fn test_thirty_to_twenty_four() {
        let decision = DropDecision::default();
        let kept = kept(&decision, 0..30, 30.0 / 24.0);
        assert_eq!(kept.len(), 24);
    }
}
