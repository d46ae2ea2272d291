//! Per-test statistics and completion correlation.
//!
//! Submissions enter a pending set; each codec completion is matched to the
//! pending record with the nearest pts (codecs round timestamps) and moved to
//! the completed list, which keeps completion order. Every mutation happens
//! under one mutex per `TestStatistics`; the lock is never held across an
//! await.

use crate::definition::TestDefinition;
use crate::drop_decision::DropReason;
use crate::report::{mean_bitrate_bps, DecodedFrameReport, FrameReport, HarnessDrops, StatisticsReport};
use crate::result::{BenchError, BenchResult, TestFailure};
use crate::session::Direction;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Index of the candidate nearest to `target`.
///
/// Ties go to the earliest candidate, i.e. the earliest submission.
pub fn nearest_match<I>(candidates: I, target: i64) -> Option<usize>
where
    I: IntoIterator<Item = i64>,
{
    let mut best: Option<(usize, u64)> = None;
    for (index, pts) in candidates.into_iter().enumerate() {
        let distance = pts.abs_diff(target);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((index, distance)),
        }
    }
    best.map(|(index, _)| index)
}

/// One submitted frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    /// Submission pts in microseconds
    pub pts_usec: i64,
    /// Input frame index
    pub original_frame_index: u64,
    /// When the frame was submitted
    pub submit_time: Instant,
    /// When the matching completion arrived
    pub complete_time: Option<Instant>,
    /// Output size in bytes (encode only)
    pub byte_size: usize,
    /// Sync frame flag (encode only)
    pub is_key_frame: bool,
}

impl FrameRecord {
    fn submitted(pts_usec: i64, original_frame_index: u64) -> Self {
        Self {
            pts_usec,
            original_frame_index,
            submit_time: Instant::now(),
            complete_time: None,
            byte_size: 0,
            is_key_frame: false,
        }
    }

    /// Completion minus submission
    #[must_use]
    pub fn processing_duration(&self) -> Option<Duration> {
        self.complete_time
            .map(|done| done.saturating_duration_since(self.submit_time))
    }
}

#[derive(Debug, Default)]
struct StatsState {
    codec: String,
    source: String,
    output: String,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    start_instant: Option<Instant>,
    stop_instant: Option<Instant>,
    pending: Vec<FrameRecord>,
    completed: Vec<FrameRecord>,
    properties: BTreeMap<String, String>,
    submitted: u64,
    correlation_misses: u64,
    codec_dropped: u64,
    harness_dropped: HarnessDrops,
    failure: Option<TestFailure>,
}

impl StatsState {
    fn take_nearest(&mut self, pts_usec: i64) -> BenchResult<FrameRecord> {
        match nearest_match(self.pending.iter().map(|r| r.pts_usec), pts_usec) {
            Some(index) => Ok(self.pending.remove(index)),
            None => {
                self.correlation_misses += 1;
                Err(BenchError::CorrelationMiss { pts: pts_usec })
            }
        }
    }
}

/// Statistics for one test run
#[derive(Debug)]
pub struct TestStatistics {
    id: String,
    test_id: String,
    description: String,
    direction: Direction,
    epoch: Instant,
    state: Mutex<StatsState>,
}

impl TestStatistics {
    /// Create statistics with a fresh `bench_<uuid>` id
    #[must_use]
    pub fn new(test: &TestDefinition) -> Self {
        let direction = if test.configure.encode {
            Direction::Encode
        } else {
            Direction::Decode
        };
        Self {
            id: format!("bench_{}", Uuid::new_v4()),
            test_id: test.id.clone(),
            description: test.description.clone(),
            direction,
            epoch: Instant::now(),
            state: Mutex::new(StatsState {
                codec: test.configure.codec.clone(),
                source: test.input.source.clone(),
                ..StatsState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StatsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Statistics id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Test id
    #[must_use]
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Encode or decode
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Record the codec name the session reports
    pub fn set_codec(&self, codec: impl Into<String>) {
        self.state().codec = codec.into();
    }

    /// Record the source identifier
    pub fn set_source(&self, source: impl Into<String>) {
        self.state().source = source.into();
    }

    /// Record the output identifier
    pub fn set_output(&self, output: impl Into<String>) {
        self.state().output = output.into();
    }

    /// Set a free-form property
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state().properties.insert(key.into(), value.into());
    }

    /// Timestamp the start of the run
    pub fn start(&self) {
        let mut state = self.state();
        state.started_at = Some(Utc::now());
        state.start_instant = Some(Instant::now());
    }

    /// Timestamp the end of the run; later calls are ignored
    pub fn stop(&self) {
        let mut state = self.state();
        if state.stop_instant.is_none() {
            state.stopped_at = Some(Utc::now());
            state.stop_instant = Some(Instant::now());
        }
    }

    /// Whether `stop` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state().stop_instant.is_some()
    }

    /// Add a submission to the pending set
    pub fn start_frame(&self, pts_usec: i64, original_frame_index: u64) {
        let mut state = self.state();
        state.pending.push(FrameRecord::submitted(pts_usec, original_frame_index));
        state.submitted += 1;
    }

    /// Match an encoded sample to its submission.
    ///
    /// Returns `CorrelationMiss` (already counted) when nothing is pending.
    pub fn complete_encoded(
        &self,
        pts_usec: i64,
        byte_size: usize,
        is_key_frame: bool,
    ) -> BenchResult<u64> {
        let mut state = self.state();
        let mut record = state.take_nearest(pts_usec)?;
        record.complete_time = Some(Instant::now());
        record.byte_size = byte_size;
        record.is_key_frame = is_key_frame;
        state.completed.push(record);
        Ok(state.completed.len() as u64 - 1)
    }

    /// Match a decoded frame to its submission
    pub fn complete_decoded(&self, pts_usec: i64) -> BenchResult<u64> {
        let mut state = self.state();
        let mut record = state.take_nearest(pts_usec)?;
        record.complete_time = Some(Instant::now());
        state.completed.push(record);
        Ok(state.completed.len() as u64 - 1)
    }

    /// Remove a submission the codec reported as dropped
    pub fn codec_dropped(&self, pts_usec: i64) -> BenchResult<()> {
        let mut state = self.state();
        state.take_nearest(pts_usec)?;
        state.codec_dropped += 1;
        Ok(())
    }

    /// Count a frame the harness did not submit
    pub fn record_drop(&self, reason: DropReason) {
        self.state().harness_dropped.record(reason);
    }

    /// Mark the run as failed; the first failure is kept
    pub fn mark_failed(&self, failure: TestFailure) {
        let mut state = self.state();
        if state.failure.is_none() {
            state.failure = Some(failure);
        }
    }

    /// Frames awaiting completion
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Frames matched so far
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.state().completed.len()
    }

    /// Frames submitted so far
    #[must_use]
    pub fn submitted_count(&self) -> u64 {
        self.state().submitted
    }

    /// Completions that matched nothing
    #[must_use]
    pub fn correlation_misses(&self) -> u64 {
        self.state().correlation_misses
    }

    fn since_epoch(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    /// Consistent snapshot; frames are numbered in completion order
    #[must_use]
    pub fn report(&self) -> StatisticsReport {
        let state = self.state();
        let mut frames = Vec::new();
        let mut decoded_frames = Vec::new();
        for (sequence, record) in state.completed.iter().enumerate() {
            let submit_time_ns = self.since_epoch(record.submit_time);
            let complete_time_ns = record
                .complete_time
                .map_or(submit_time_ns, |t| self.since_epoch(t));
            let processing_ns = complete_time_ns.saturating_sub(submit_time_ns);
            match self.direction {
                Direction::Encode => frames.push(FrameReport {
                    sequence: sequence as u64,
                    original_frame: record.original_frame_index,
                    is_key_frame: record.is_key_frame,
                    size: record.byte_size,
                    pts: record.pts_usec,
                    submit_time_ns,
                    complete_time_ns,
                    processing_ns,
                }),
                Direction::Decode => decoded_frames.push(DecodedFrameReport {
                    sequence: sequence as u64,
                    original_frame: record.original_frame_index,
                    pts: record.pts_usec,
                    submit_time_ns,
                    complete_time_ns,
                    processing_ns,
                }),
            }
        }
        let processing_ns = match (state.start_instant, state.stop_instant) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start).as_nanos() as u64,
            (Some(start), None) => start.elapsed().as_nanos() as u64,
            _ => 0,
        };

        StatisticsReport {
            id: self.id.clone(),
            description: self.description.clone(),
            test_id: self.test_id.clone(),
            codec: state.codec.clone(),
            direction: self.direction,
            source: state.source.clone(),
            output: state.output.clone(),
            started_at: state.started_at,
            stopped_at: state.stopped_at,
            processing_ns,
            frame_count: state.completed.len(),
            mean_bitrate_bps: mean_bitrate_bps(&frames),
            submitted: state.submitted,
            pending_at_stop: state.pending.len(),
            correlation_misses: state.correlation_misses,
            codec_dropped: state.codec_dropped,
            harness_dropped: state.harness_dropped,
            partial: state.failure.is_some(),
            failure: state.failure.clone(),
            finalized: state.stop_instant.is_some(),
            properties: state.properties.clone(),
            frames,
            decoded_frames,
        }
    }
}
