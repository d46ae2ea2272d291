//! Mock codec and media for exercising the harness without hardware.
//!
//! [`MockCodecFactory`] opens sessions whose behaviour is scripted per codec
//! name: open and submit failures, codec error events, B-frame style
//! reordering, pts rounding, latency, and a flush gate that holds a session
//! in `Draining` until the test releases it.

use crate::definition::{ParameterValue, TestDefinition};
use crate::media::{FrameSource, MediaIo, OutputSink, SyntheticSource};
use crate::orchestrator::{SuiteListener, SuiteSummary, TaskCompletion, TaskInfo};
use crate::result::{BenchError, BenchResult};
use crate::session::{
    CodecEvent, CodecSession, CompletionSender, Direction, EncodedSample, RawFrame, SessionConfig,
    SessionFactory, SessionHandle,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Codec
// =============================================================================

/// Session call recorded by the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// `submit_frame`
    Submit {
        /// Input frame index
        index: u64,
        /// Submission pts
        pts_usec: i64,
    },
    /// `force_keyframe`
    ForceKeyframe,
    /// `set_bitrate`
    SetBitrate {
        /// Bits per second
        bps: u64,
        /// Constant-rate flag
        constant_rate: bool,
    },
    /// `set_property`
    SetProperty {
        /// Key
        key: String,
        /// Value
        value: ParameterValue,
    },
    /// `flush`
    Flush {
        /// Flush bound
        until_pts_usec: i64,
    },
    /// `close`
    Close,
}

/// Scripted session behaviour
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// `open` fails
    pub fail_open: bool,
    /// `open` panics
    pub panic_on_open: bool,
    /// `submit_frame` fails when this many frames were already accepted
    pub fail_submit_at: Option<u64>,
    /// Emit a codec error event after this many accepted frames
    pub error_after: Option<u64>,
    /// Release completions in groups of this size, last frame first
    pub reorder_depth: usize,
    /// Added to every completion pts
    pub pts_jitter_usec: i64,
    /// Report every Nth accepted frame as dropped
    pub drop_every: Option<u64>,
    /// Size of a non-key sample; key samples are four times larger
    pub frame_bytes: usize,
    /// Key frame every N accepted frames (0: only the first)
    pub gop: u64,
    /// Delay inside every `submit_frame`
    pub submit_latency: Duration,
    /// `flush` waits for a permit from this semaphore
    pub flush_gate: Option<Arc<Semaphore>>,
    /// `open` fails while this many sessions of the codec are open
    pub max_instances: Option<usize>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_open: false,
            panic_on_open: false,
            fail_submit_at: None,
            error_after: None,
            reorder_depth: 1,
            pts_jitter_usec: 0,
            drop_every: None,
            frame_bytes: 1_000,
            gop: 30,
            submit_latency: Duration::ZERO,
            flush_gate: None,
            max_instances: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Buffered {
    pts_usec: i64,
    is_key_frame: bool,
}

/// A scripted codec session
#[derive(Debug)]
pub struct MockCodecSession {
    name: String,
    direction: Direction,
    behavior: MockBehavior,
    completions: Option<CompletionSender>,
    buffered: Vec<Buffered>,
    accepted: u64,
    force_next_key: bool,
    calls: Arc<Mutex<Vec<MockCall>>>,
    instances: Option<Arc<AtomicUsize>>,
}

impl MockCodecSession {
    fn record(&self, call: MockCall) {
        locked(&self.calls).push(call);
    }

    fn send(&self, event: CodecEvent) {
        if let Some(completions) = &self.completions {
            // Receiver gone means nobody is interested any more
            let _ = completions.send(event);
        }
    }

    fn emit(&self, frame: Buffered) {
        let pts_usec = frame.pts_usec + self.behavior.pts_jitter_usec;
        let event = match self.direction {
            Direction::Encode => {
                let size = if frame.is_key_frame {
                    self.behavior.frame_bytes * 4
                } else {
                    self.behavior.frame_bytes
                };
                CodecEvent::Encoded(EncodedSample {
                    pts_usec,
                    data: vec![0; size],
                    is_key_frame: frame.is_key_frame,
                })
            }
            Direction::Decode => CodecEvent::Decoded { pts_usec },
        };
        self.send(event);
    }

    fn release(&mut self) {
        let mut group = std::mem::take(&mut self.buffered);
        if group.len() > 1 {
            // Reference frame first, then the frames that depend on it
            let last = group.remove(group.len() - 1);
            group.insert(0, last);
        }
        for frame in group {
            self.emit(frame);
        }
    }
}

#[async_trait]
impl CodecSession for MockCodecSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_frame(&mut self, frame: RawFrame) -> BenchResult<()> {
        self.record(MockCall::Submit {
            index: frame.index,
            pts_usec: frame.pts_usec,
        });
        if !self.behavior.submit_latency.is_zero() {
            tokio::time::sleep(self.behavior.submit_latency).await;
        }
        if self.behavior.fail_submit_at == Some(self.accepted) {
            return Err(BenchError::session(format!(
                "mock rejected frame {}",
                frame.index
            )));
        }

        let is_key_frame = self.accepted == 0
            || self.force_next_key
            || (self.behavior.gop > 0 && self.accepted % self.behavior.gop == 0);
        self.force_next_key = false;
        self.accepted += 1;

        if self
            .behavior
            .drop_every
            .is_some_and(|n| n > 0 && self.accepted % n == 0)
        {
            self.send(CodecEvent::Dropped {
                pts_usec: frame.pts_usec + self.behavior.pts_jitter_usec,
            });
        } else {
            self.buffered.push(Buffered {
                pts_usec: frame.pts_usec,
                is_key_frame,
            });
            if self.buffered.len() >= self.behavior.reorder_depth.max(1) {
                self.release();
            }
        }

        if self.behavior.error_after == Some(self.accepted) {
            self.send(CodecEvent::Error {
                message: format!("mock failure after {} frames", self.accepted),
            });
        }
        Ok(())
    }

    async fn force_keyframe(&mut self) -> BenchResult<()> {
        self.record(MockCall::ForceKeyframe);
        self.force_next_key = true;
        Ok(())
    }

    async fn set_bitrate(&mut self, bps: u64, constant_rate: bool) -> BenchResult<()> {
        self.record(MockCall::SetBitrate { bps, constant_rate });
        Ok(())
    }

    async fn set_property(&mut self, key: &str, value: &ParameterValue) -> BenchResult<()> {
        self.record(MockCall::SetProperty {
            key: key.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    async fn flush(&mut self, until_pts_usec: i64) -> BenchResult<()> {
        self.record(MockCall::Flush { until_pts_usec });
        if let Some(gate) = self.behavior.flush_gate.clone() {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| BenchError::session("flush gate closed"))?;
        }
        self.release();
        Ok(())
    }

    async fn close(&mut self) -> BenchResult<()> {
        self.record(MockCall::Close);
        self.completions = None;
        if let Some(instances) = self.instances.take() {
            instances.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Opens [`MockCodecSession`]s, scripted per codec name
#[derive(Debug, Clone, Default)]
pub struct MockCodecFactory {
    behaviors: Arc<Mutex<HashMap<String, MockBehavior>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    opened: Arc<Mutex<Vec<String>>>,
    instances: Arc<Mutex<HashMap<String, Arc<AtomicUsize>>>>,
}

impl MockCodecFactory {
    /// Factory where every codec behaves by default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the sessions opened for `codec`
    #[must_use]
    pub fn with_behavior(self, codec: impl Into<String>, behavior: MockBehavior) -> Self {
        locked(&self.behaviors).insert(codec.into(), behavior);
        self
    }

    /// Calls made on every session, in order
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        locked(&self.calls).clone()
    }

    /// Codec names opened successfully, in order
    #[must_use]
    pub fn opened(&self) -> Vec<String> {
        locked(&self.opened).clone()
    }

    /// Sessions of `codec` opened and not yet closed
    #[must_use]
    pub fn open_instances(&self, codec: &str) -> usize {
        locked(&self.instances)
            .get(codec)
            .map_or(0, |count| count.load(Ordering::SeqCst))
    }

    fn claim_instance(&self, codec: &str, limit: Option<usize>) -> BenchResult<Arc<AtomicUsize>> {
        let mut instances = locked(&self.instances);
        let count = Arc::clone(instances.entry(codec.to_string()).or_default());
        let open = count.load(Ordering::SeqCst);
        if limit.is_some_and(|limit| open >= limit) {
            return Err(BenchError::session_create(
                codec,
                format!("mock supports {open} concurrent sessions"),
            ));
        }
        count.fetch_add(1, Ordering::SeqCst);
        Ok(count)
    }
}

#[async_trait]
impl SessionFactory for MockCodecFactory {
    async fn open(
        &self,
        config: &SessionConfig,
        completions: CompletionSender,
    ) -> BenchResult<SessionHandle> {
        let behavior = locked(&self.behaviors)
            .get(&config.codec)
            .cloned()
            .unwrap_or_default();
        if behavior.panic_on_open {
            panic!("mock codec {} panicked while opening", config.codec);
        }
        if behavior.fail_open {
            return Err(BenchError::session_create(
                &config.codec,
                "mock configured to fail",
            ));
        }
        let instances = self.claim_instance(&config.codec, behavior.max_instances)?;
        locked(&self.opened).push(config.codec.clone());
        Ok(Box::new(MockCodecSession {
            name: format!("mock.{}", config.codec),
            direction: config.direction,
            behavior,
            completions: Some(completions),
            buffered: Vec::new(),
            accepted: 0,
            force_next_key: false,
            calls: Arc::clone(&self.calls),
            instances: Some(instances),
        }))
    }
}

// =============================================================================
// Media
// =============================================================================

/// Sink that keeps samples in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    samples: Arc<Mutex<Vec<EncodedSample>>>,
    finished: Arc<AtomicBool>,
}

impl MemorySink {
    /// Samples appended so far
    #[must_use]
    pub fn samples(&self) -> Vec<EncodedSample> {
        locked(&self.samples).clone()
    }

    /// Whether `finish` was called
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn append(&mut self, sample: &EncodedSample) -> BenchResult<()> {
        if self.is_finished() {
            return Err(BenchError::io("memory sink already finished"));
        }
        locked(&self.samples).push(sample.clone());
        Ok(())
    }

    async fn finish(&mut self) -> BenchResult<()> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Synthetic sources and memory sinks keyed by test id
#[derive(Debug, Clone, Default)]
pub struct MockMediaIo {
    frames_per_source: u64,
    source_frames: HashMap<String, u64>,
    missing: HashSet<String>,
    sinks: Arc<Mutex<HashMap<String, MemorySink>>>,
}

impl MockMediaIo {
    /// Every source yields `frames_per_source` frames per pass
    #[must_use]
    pub fn new(frames_per_source: u64) -> Self {
        Self {
            frames_per_source,
            ..Self::default()
        }
    }

    /// Give one source locator its own length
    #[must_use]
    pub fn with_source_frames(mut self, locator: impl Into<String>, frames: u64) -> Self {
        self.source_frames.insert(locator.into(), frames);
        self
    }

    /// Make a source locator unreachable
    #[must_use]
    pub fn with_missing_source(mut self, locator: impl Into<String>) -> Self {
        self.missing.insert(locator.into());
        self
    }

    /// The sink opened for a test id
    #[must_use]
    pub fn sink(&self, test_id: &str) -> Option<MemorySink> {
        locked(&self.sinks).get(test_id).cloned()
    }
}

#[async_trait]
impl MediaIo for MockMediaIo {
    async fn open_source(&self, test: &TestDefinition) -> BenchResult<Box<dyn FrameSource>> {
        let locator = &test.input.source;
        if self.missing.contains(locator) {
            return Err(BenchError::io(format!("{locator} not found")));
        }
        let frames = self
            .source_frames
            .get(locator)
            .copied()
            .unwrap_or(self.frames_per_source);
        Ok(Box::new(SyntheticSource::new(frames)))
    }

    async fn open_sink(
        &self,
        test: &TestDefinition,
        _stats_id: &str,
    ) -> BenchResult<Box<dyn OutputSink>> {
        let sink = MemorySink::default();
        locked(&self.sinks).insert(test.id.clone(), sink.clone());
        Ok(Box::new(sink))
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Suite callback recorded by [`RecordingListener`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    /// A task started
    Started {
        /// Test id
        test_id: String,
        /// Whether it is a parallel sub-test
        parallel: bool,
        /// When the callback ran
        at: Instant,
    },
    /// A task completed
    Completed {
        /// Test id
        test_id: String,
        /// Whether it finished normally
        success: bool,
        /// When the callback ran
        at: Instant,
    },
    /// The suite completed
    SuiteComplete {
        /// Tasks still active at that point
        still_active: usize,
        /// When the callback ran
        at: Instant,
    },
}

/// Listener that keeps every callback in order
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingListener {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        locked(&self.events).clone()
    }

    /// Position of the start callback for `test_id`
    #[must_use]
    pub fn started_at(&self, test_id: &str) -> Option<usize> {
        self.events().iter().position(
            |e| matches!(e, RecordedEvent::Started { test_id: id, .. } if id == test_id),
        )
    }

    /// Position of the completion callback for `test_id`
    #[must_use]
    pub fn completed_at(&self, test_id: &str) -> Option<usize> {
        self.events().iter().position(
            |e| matches!(e, RecordedEvent::Completed { test_id: id, .. } if id == test_id),
        )
    }

    /// Position of the suite completion callback
    #[must_use]
    pub fn suite_completed_at(&self) -> Option<usize> {
        self.events()
            .iter()
            .position(|e| matches!(e, RecordedEvent::SuiteComplete { .. }))
    }

    /// Number of completion callbacks for `test_id`
    #[must_use]
    pub fn completions_of(&self, test_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RecordedEvent::Completed { test_id: id, .. } if id == test_id))
            .count()
    }
}

impl SuiteListener for RecordingListener {
    fn on_task_started(&self, task: &TaskInfo) {
        locked(&self.events).push(RecordedEvent::Started {
            test_id: task.test_id.clone(),
            parallel: task.parallel,
            at: Instant::now(),
        });
    }

    fn on_task_complete(&self, completion: &TaskCompletion) {
        locked(&self.events).push(RecordedEvent::Completed {
            test_id: completion.task.test_id.clone(),
            success: completion.outcome.is_success(),
            at: Instant::now(),
        });
    }

    fn on_suite_complete(&self, summary: &SuiteSummary) {
        locked(&self.events).push(RecordedEvent::SuiteComplete {
            still_active: summary.still_active,
            at: Instant::now(),
        });
    }
}
