//! Statistics report.
//!
//! Immutable snapshot of a test's statistics, serialized with the key names
//! downstream tooling reads (`frames[].frame`, `meanbitrate`, `proctime`, ...).

use crate::drop_decision::DropReason;
use crate::result::{BenchResult, TestFailure};
use crate::session::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One encoded frame, numbered in completion order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameReport {
    /// Position in completion order
    #[serde(rename = "frame")]
    pub sequence: u64,
    /// Input frame index the sample was produced from
    pub original_frame: u64,
    /// Sync frame flag
    #[serde(rename = "iframe")]
    pub is_key_frame: bool,
    /// Output size in bytes
    pub size: usize,
    /// Submission pts in microseconds
    pub pts: i64,
    /// Submission time, ns since the statistics epoch
    #[serde(rename = "starttime")]
    pub submit_time_ns: u64,
    /// Completion time, ns since the statistics epoch
    #[serde(rename = "stoptime")]
    pub complete_time_ns: u64,
    /// Completion minus submission, ns
    #[serde(rename = "proctime")]
    pub processing_ns: u64,
}

/// One decoded frame, numbered in completion order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedFrameReport {
    /// Position in completion order
    #[serde(rename = "frame")]
    pub sequence: u64,
    /// Input frame index
    pub original_frame: u64,
    /// Submission pts in microseconds
    pub pts: i64,
    /// Submission time, ns since the statistics epoch
    #[serde(rename = "starttime")]
    pub submit_time_ns: u64,
    /// Completion time, ns since the statistics epoch
    #[serde(rename = "stoptime")]
    pub complete_time_ns: u64,
    /// Completion minus submission, ns
    #[serde(rename = "proctime")]
    pub processing_ns: u64,
}

/// Frames the harness chose not to submit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessDrops {
    /// Dropped by the explicit drop list
    pub explicit: u64,
    /// Dropped for frame-rate conversion
    pub rate_conversion: u64,
}

impl HarnessDrops {
    /// Count one drop
    pub fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::Explicit => self.explicit += 1,
            DropReason::RateConversion => self.rate_conversion += 1,
        }
    }

    /// Total frames dropped by the harness
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.explicit + self.rate_conversion
    }
}

/// Snapshot of a test's statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsReport {
    /// Statistics id (`bench_<uuid>`)
    pub id: String,
    /// Test description
    pub description: String,
    /// Test id
    #[serde(rename = "test")]
    pub test_id: String,
    /// Codec name reported by the session
    pub codec: String,
    /// Encode or decode
    pub direction: Direction,
    /// Source identifier
    #[serde(rename = "sourcefile")]
    pub source: String,
    /// Output identifier
    #[serde(rename = "encodedfile")]
    pub output: String,
    /// Wall-clock start
    #[serde(rename = "date")]
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock stop
    pub stopped_at: Option<DateTime<Utc>>,
    /// Start to stop, ns
    #[serde(rename = "proctime")]
    pub processing_ns: u64,
    /// Completed frames
    #[serde(rename = "framecount")]
    pub frame_count: usize,
    /// Mean bitrate over the completed frames
    #[serde(rename = "meanbitrate")]
    pub mean_bitrate_bps: u64,
    /// Frames handed to the session
    pub submitted: u64,
    /// Submissions still unmatched when the snapshot was taken
    pub pending_at_stop: usize,
    /// Completions that matched nothing
    pub correlation_misses: u64,
    /// Submissions the codec reported as dropped
    pub codec_dropped: u64,
    /// Frames the harness did not submit
    pub harness_dropped: HarnessDrops,
    /// Test failed before finishing normally
    pub partial: bool,
    /// Failure that ended the test
    pub failure: Option<TestFailure>,
    /// Snapshot taken after stop
    pub finalized: bool,
    /// Free-form key/value properties
    pub properties: BTreeMap<String, String>,
    /// Encoded frames in completion order
    pub frames: Vec<FrameReport>,
    /// Decoded frames in completion order
    pub decoded_frames: Vec<DecodedFrameReport>,
}

impl StatisticsReport {
    /// Pretty JSON
    pub fn to_json_pretty(&self) -> BenchResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write `<dir>/<id>.json`, creating `dir` if needed
    pub async fn write_json(&self, dir: &Path) -> BenchResult<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.json", self.id));
        tokio::fs::write(&path, self.to_json_pretty()?).await?;
        Ok(path)
    }

    /// Keyframe count
    #[must_use]
    pub fn key_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.is_key_frame).count()
    }
}

/// Mean bitrate of encoded frames.
///
/// Frames are ordered by pts; the last frame's bytes are excluded because its
/// duration is unknown, and the rest are spread over the first-to-last pts
/// span. Fewer than two frames, or a zero span, give 0.
#[must_use]
pub fn mean_bitrate_bps(frames: &[FrameReport]) -> u64 {
    if frames.len() < 2 {
        return 0;
    }
    let mut by_pts: Vec<(i64, usize)> = frames.iter().map(|f| (f.pts, f.size)).collect();
    by_pts.sort_by_key(|&(pts, _)| pts);
    let (first_pts, _) = by_pts[0];
    let (last_pts, _) = by_pts[by_pts.len() - 1];
    let span_usec = last_pts - first_pts;
    if span_usec <= 0 {
        return 0;
    }
    let bytes: usize = by_pts[..by_pts.len() - 1].iter().map(|&(_, size)| size).sum();
    (bytes as f64 * 8.0 * 1_000_000.0 / span_usec as f64).round() as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn frame(sequence: u64, pts: i64, size: usize) -> FrameReport {
        FrameReport {
            sequence,
            original_frame: sequence,
            is_key_frame: sequence == 0,
            size,
            pts,
            submit_time_ns: 0,
            complete_time_ns: 10,
            processing_ns: 10,
        }
    }

    fn empty_report() -> StatisticsReport {
        StatisticsReport {
            id: "bench_test".to_string(),
            description: String::new(),
            test_id: "t".to_string(),
            codec: "mock".to_string(),
            direction: Direction::Encode,
            source: "clip.yuv".to_string(),
            output: String::new(),
            started_at: None,
            stopped_at: None,
            processing_ns: 0,
            frame_count: 0,
            mean_bitrate_bps: 0,
            submitted: 0,
            pending_at_stop: 0,
            correlation_misses: 0,
            codec_dropped: 0,
            harness_dropped: HarnessDrops::default(),
            partial: false,
            failure: None,
            finalized: true,
            properties: BTreeMap::new(),
            frames: Vec::new(),
            decoded_frames: Vec::new(),
        }
    }

    #[test]
    fn test_mean_bitrate_excludes_last_frame() {
        // 30 fps, 1000 bytes per frame -> 240 kbps
        let frames: Vec<_> = (0..31).map(|i| frame(i, i as i64 * 33_333, 1000)).collect();
        let bps = mean_bitrate_bps(&frames);
        assert!((239_990..=240_010).contains(&bps), "got {bps}");
    }

    #[test]
    fn test_mean_bitrate_ignores_completion_order() {
        let ordered = vec![frame(0, 0, 500), frame(1, 500_000, 500), frame(2, 1_000_000, 9999)];
        let shuffled = vec![ordered[2].clone(), ordered[0].clone(), ordered[1].clone()];
        assert_eq!(mean_bitrate_bps(&ordered), 8_000);
        assert_eq!(mean_bitrate_bps(&shuffled), 8_000);
    }

    #[test]
    fn test_mean_bitrate_degenerate() {
        assert_eq!(mean_bitrate_bps(&[]), 0);
        assert_eq!(mean_bitrate_bps(&[frame(0, 0, 100)]), 0);
        assert_eq!(mean_bitrate_bps(&[frame(0, 5, 100), frame(1, 5, 100)]), 0);
    }

    #[test]
    fn test_harness_drops_record() {
        let mut drops = HarnessDrops::default();
        drops.record(DropReason::Explicit);
        drops.record(DropReason::RateConversion);
        drops.record(DropReason::RateConversion);
        assert_eq!(drops.explicit, 1);
        assert_eq!(drops.rate_conversion, 2);
        assert_eq!(drops.total(), 3);
    }

    #[test]
    fn test_json_key_names() {
        let mut report = empty_report();
        report.frames.push(frame(0, 0, 1200));
        let value: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        assert_eq!(value["test"], "t");
        assert_eq!(value["sourcefile"], "clip.yuv");
        assert!(value.get("meanbitrate").is_some());
        assert!(value.get("framecount").is_some());
        let first = &value["frames"][0];
        assert_eq!(first["frame"], 0);
        assert_eq!(first["iframe"], true);
        assert_eq!(first["size"], 1200);
        assert!(first.get("proctime").is_some());
    }

    #[tokio::test]
    async fn test_write_json_creates_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("reports");
        let report = empty_report();
        let path = report.write_json(&nested).await.unwrap();
        assert_eq!(path, nested.join("bench_test.json"));
        let text = std::fs::read_to_string(&path).unwrap();
        let back: StatisticsReport = serde_json::from_str(&text).unwrap();
        assert_eq!(back, report);
    }
}
