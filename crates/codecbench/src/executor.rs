//! Single test execution.
//!
//! One executor runs one test end to end:
//!
//! ```text
//! Init ──► Opening ──► Running ──► Draining ──► Finalized
//!   │         │           │
//!   └─────────┴───────────┴──────► Errored
//! ```
//!
//! Completions are consumed by a separate drain task that correlates them
//! into the test's statistics and feeds the output sink. Failures stay inside
//! the executor: they end in `Errored` with partial statistics, never in a
//! panic or an error returned to the orchestrator.

use crate::config::HarnessConfig;
use crate::definition::TestDefinition;
use crate::drop_decision::DropDecision;
use crate::media::{FrameSource, MediaIo, OutputSink};
use crate::mutation::{MutationScheduler, MutationTarget};
use crate::pacer::FramePacer;
use crate::report::StatisticsReport;
use crate::result::{FailureKind, TestFailure};
use crate::session::{
    completion_channel, CodecEvent, CodecSession, CompletionReceiver, RawFrame, SessionConfig,
    SessionFactory,
};
use crate::statistics::TestStatistics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

// =============================================================================
// States
// =============================================================================

/// Executor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    /// Validating the definition and opening the source
    Init,
    /// Opening the codec session and output sink
    Opening,
    /// Reading, mutating, dropping, pacing and submitting frames
    Running,
    /// Flushing the session and waiting for outstanding completions
    Draining,
    /// Finished normally
    Finalized,
    /// Finished with a failure
    Errored,
}

impl ExecutorState {
    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Errored)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Opening => "opening",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Finalized => "finalized",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Termination
// =============================================================================

/// Why the running loop stopped reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Frame-count limit reached
    FrameLimit,
    /// Presentation-time limit reached
    TimeLimit,
    /// Source exhausted with no limit configured
    EndOfStream,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameLimit => f.write_str("frame_limit"),
            Self::TimeLimit => f.write_str("time_limit"),
            Self::EndOfStream => f.write_str("end_of_stream"),
        }
    }
}

/// Termination limits of a test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Termination {
    frame_limit: Option<u64>,
    time_limit_sec: Option<f64>,
}

impl Termination {
    /// Limits configured on a test
    #[must_use]
    pub fn for_test(test: &TestDefinition) -> Self {
        Self {
            frame_limit: test.input.frame_limit(),
            time_limit_sec: test.input.time_limit_sec(),
        }
    }

    /// Limit reached before reading input frame `index`, checked frame count first
    #[must_use]
    pub fn limit_reached(&self, index: u64, pacer: &FramePacer) -> Option<StopReason> {
        if self.frame_limit.is_some_and(|limit| index >= limit) {
            return Some(StopReason::FrameLimit);
        }
        if self
            .time_limit_sec
            .is_some_and(|limit| pacer.elapsed_sec(index) >= limit)
        {
            return Some(StopReason::TimeLimit);
        }
        None
    }

    /// End of stream stops the test only when no limit is configured;
    /// otherwise the source loops until a limit is hit.
    #[must_use]
    pub const fn stops_at_end_of_stream(&self) -> bool {
        self.frame_limit.is_none() && self.time_limit_sec.is_none()
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of one executor run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Test id
    pub test_id: String,
    /// Terminal state
    pub state: ExecutorState,
    /// Every state entered, in order
    pub history: Vec<ExecutorState>,
    /// Failure that ended the run
    pub failure: Option<TestFailure>,
    /// Statistics snapshot taken after stop
    pub report: StatisticsReport,
}

impl ExecutionOutcome {
    /// Whether the run finished normally
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == ExecutorState::Finalized
    }

    /// Whether the run ever entered `state`
    #[must_use]
    pub fn visited(&self, state: ExecutorState) -> bool {
        self.history.contains(&state)
    }
}

// =============================================================================
// Completion drain
// =============================================================================

type FailureWatch = watch::Receiver<Option<TestFailure>>;

fn spawn_drain(
    mut completions: CompletionReceiver,
    mut sink: Box<dyn OutputSink>,
    statistics: Arc<TestStatistics>,
) -> (JoinHandle<()>, FailureWatch) {
    let (failures, watcher) = watch::channel(None);
    let handle = tokio::spawn(
        async move {
            let mut sink_ok = true;
            while let Some(event) = completions.recv().await {
                match event {
                    CodecEvent::Encoded(sample) => {
                        if let Err(e) = statistics.complete_encoded(
                            sample.pts_usec,
                            sample.size(),
                            sample.is_key_frame,
                        ) {
                            warn!(error = %e, "completion discarded");
                        }
                        if sink_ok {
                            if let Err(e) = sink.append(&sample).await {
                                error!(error = %e, "output sink failed");
                                sink_ok = false;
                                failures.send_replace(Some(TestFailure::from(&e)));
                            }
                        }
                    }
                    CodecEvent::Decoded { pts_usec } => {
                        if let Err(e) = statistics.complete_decoded(pts_usec) {
                            warn!(error = %e, "completion discarded");
                        }
                    }
                    CodecEvent::Dropped { pts_usec } => {
                        debug!(pts_usec, "codec dropped frame");
                        if let Err(e) = statistics.codec_dropped(pts_usec) {
                            warn!(error = %e, "drop notification discarded");
                        }
                    }
                    CodecEvent::Error { message } => {
                        error!(%message, "codec reported an error");
                        failures.send_replace(Some(TestFailure::new(FailureKind::Session, message)));
                    }
                }
            }
            if let Err(e) = sink.finish().await {
                error!(error = %e, "output sink failed to finish");
                statistics.set_property("sink_error", e.to_string());
            }
        }
        .in_current_span(),
    );
    (handle, watcher)
}

// =============================================================================
// Executor
// =============================================================================

/// Runs one test against an injected session factory and media provider
pub struct SingleTestExecutor {
    test: TestDefinition,
    config: Arc<HarnessConfig>,
    factory: Arc<dyn SessionFactory>,
    media: Arc<dyn MediaIo>,
    statistics: Arc<TestStatistics>,
    history: Vec<ExecutorState>,
}

impl fmt::Debug for SingleTestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleTestExecutor")
            .field("test", &self.test.id)
            .field("statistics", &self.statistics.id())
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

impl SingleTestExecutor {
    /// Create an executor in `Init`
    #[must_use]
    pub fn new(
        test: TestDefinition,
        config: Arc<HarnessConfig>,
        factory: Arc<dyn SessionFactory>,
        media: Arc<dyn MediaIo>,
    ) -> Self {
        let statistics = Arc::new(TestStatistics::new(&test));
        Self {
            test,
            config,
            factory,
            media,
            statistics,
            history: vec![ExecutorState::Init],
        }
    }

    /// The test being run
    #[must_use]
    pub const fn test(&self) -> &TestDefinition {
        &self.test
    }

    /// Live statistics, readable while the test runs
    #[must_use]
    pub fn statistics(&self) -> Arc<TestStatistics> {
        Arc::clone(&self.statistics)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ExecutorState {
        self.history.last().copied().unwrap_or(ExecutorState::Init)
    }

    fn transition(&mut self, next: ExecutorState) {
        debug!(from = %self.state(), to = %next, "state transition");
        self.history.push(next);
    }

    /// Run the test to a terminal state
    pub async fn run(self) -> ExecutionOutcome {
        let span = info_span!(
            "test",
            test_id = %self.test.id,
            stats_id = %self.statistics.id()
        );
        self.execute().instrument(span).await
    }

    async fn execute(mut self) -> ExecutionOutcome {
        self.statistics.start();
        info!(
            codec = %self.test.configure.codec,
            source = %self.test.input.source,
            "test starting"
        );

        // Init
        if let Err(e) = self.test.validate() {
            return self.errored(TestFailure::from(&e));
        }
        let mut source = match self.media.open_source(&self.test).await {
            Ok(source) => source,
            Err(e) => {
                let failure = TestFailure::new(
                    FailureKind::Configuration,
                    format!("source '{}' unreachable: {e}", self.test.input.source),
                );
                return self.errored(failure);
            }
        };
        self.statistics.set_source(source.describe());

        // Opening
        self.transition(ExecutorState::Opening);
        let mut pacer = FramePacer::for_test(&self.test, self.config.pts_offset_usec);
        let session_config = SessionConfig::from_test(&self.test, pacer.output_rate());
        let (completions_tx, completions_rx) = completion_channel();
        let mut session = match self.factory.open(&session_config, completions_tx).await {
            Ok(session) => session,
            Err(e) => {
                close_source(source.as_mut()).await;
                return self.errored(TestFailure::from(&e));
            }
        };
        self.statistics.set_codec(session.name());
        let sink = match self.media.open_sink(&self.test, self.statistics.id()).await {
            Ok(sink) => sink,
            Err(e) => {
                close_session(session.as_mut()).await;
                close_source(source.as_mut()).await;
                return self.errored(TestFailure::from(&e));
            }
        };
        self.statistics.set_output(sink.describe());
        let (drain, failures) = spawn_drain(completions_rx, sink, self.statistics());

        // Running
        self.transition(ExecutorState::Running);
        let run = self
            .run_frames(source.as_mut(), session.as_mut(), &mut pacer, &failures)
            .await;

        match run {
            Ok(last_pts) => {
                // Draining
                self.transition(ExecutorState::Draining);
                let until = last_pts.unwrap_or(self.config.pts_offset_usec);
                self.flush(session.as_mut(), until).await;
                close_session(session.as_mut()).await;
                drop(session);
                self.await_drain(drain).await;
                close_source(source.as_mut()).await;
                // Every completion has been seen now, including a codec error
                // raised by the last submissions
                match reported_failure(&failures) {
                    Some(failure) => self.errored(failure),
                    None => self.finalized(),
                }
            }
            Err(failure) => {
                close_session(session.as_mut()).await;
                drop(session);
                self.await_drain(drain).await;
                close_source(source.as_mut()).await;
                self.errored(failure)
            }
        }
    }

    async fn run_frames(
        &self,
        source: &mut dyn FrameSource,
        session: &mut dyn CodecSession,
        pacer: &mut FramePacer,
        failures: &FailureWatch,
    ) -> Result<Option<i64>, TestFailure> {
        let scheduler = MutationScheduler::for_test(&self.test);
        let drops = DropDecision::new(scheduler.explicit_drops());
        let termination = Termination::for_test(&self.test);
        let frame_size = self.test.input.frame_size();
        let constant_rate = self.test.configure.bitrate_mode.is_constant();
        let realtime = self.test.input.realtime;
        let progress_interval = self.config.progress_interval;

        let mut index: u64 = 0;
        let mut pass: u64 = 0;
        let mut pass_frames: u64 = 0;
        let mut dropped: u64 = 0;
        let mut last_pts = None;

        loop {
            check_failures(failures).await?;
            if let Some(reason) = termination.limit_reached(index, pacer) {
                info!(%reason, frames = index, "termination limit reached");
                self.statistics.set_property("stop_reason", reason.to_string());
                break;
            }

            let frame = match source.read_frame(frame_size).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if pass_frames == 0 {
                        return Err(TestFailure::new(
                            FailureKind::Io,
                            format!("source '{}' holds less than one frame", source.describe()),
                        ));
                    }
                    if termination.stops_at_end_of_stream() {
                        info!(frames = index, "end of stream");
                        self.statistics
                            .set_property("stop_reason", StopReason::EndOfStream.to_string());
                        break;
                    }
                    source
                        .restart()
                        .await
                        .map_err(|e| TestFailure::from(&e))?;
                    pass += 1;
                    pass_frames = 0;
                    debug!(pass, "source restarted");
                    continue;
                }
                Err(e) => return Err(TestFailure::from(&e)),
            };
            pass_frames += 1;

            let pts = pacer.presentation_time_usec(index);
            scheduler
                .apply(
                    index,
                    MutationTarget {
                        session: &mut *session,
                        pacer: &mut *pacer,
                        statistics: &self.statistics,
                        constant_rate,
                    },
                )
                .await;

            if let Some(reason) = drops.evaluate(index, pacer.keep_interval()) {
                self.statistics.record_drop(reason);
                dropped += 1;
            } else {
                if realtime {
                    pacer.pace().await;
                }
                self.statistics.start_frame(pts, index);
                session
                    .submit_frame(RawFrame {
                        index,
                        data: frame,
                        pts_usec: pts,
                        duration_usec: pacer.output_frame_duration_usec() as i64,
                    })
                    .await
                    .map_err(|e| TestFailure::from(&e))?;
                last_pts = Some(pts);
            }

            index += 1;
            if progress_interval > 0 && index % progress_interval == 0 {
                info!(
                    frames = index,
                    submitted = self.statistics.submitted_count(),
                    dropped,
                    completed = self.statistics.completed_count(),
                    pending = self.statistics.pending_count(),
                    pass,
                    "progress"
                );
            }
        }

        self.statistics.set_property("input_frames", index.to_string());
        self.statistics.set_property("loop_passes", (pass + 1).to_string());
        check_failures(failures).await?;
        Ok(last_pts)
    }

    async fn flush(&self, session: &mut dyn CodecSession, until: i64) {
        match tokio::time::timeout(self.config.drain_timeout, session.flush(until)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "flush failed");
                self.statistics.set_property("drain_error", e.to_string());
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.drain_timeout.as_millis() as u64,
                    until_pts_usec = until,
                    "flush did not complete, giving up"
                );
                self.statistics.set_property("drain_timeout", "true");
            }
        }
    }

    async fn await_drain(&self, mut drain: JoinHandle<()>) {
        match tokio::time::timeout(self.config.drain_timeout, &mut drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "completion drain task failed");
                self.statistics.set_property("drain_error", e.to_string());
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.drain_timeout.as_millis() as u64,
                    pending = self.statistics.pending_count(),
                    "completions still outstanding, giving up"
                );
                drain.abort();
                self.statistics.set_property("drain_timeout", "true");
            }
        }
    }

    fn finalized(mut self) -> ExecutionOutcome {
        self.transition(ExecutorState::Finalized);
        self.statistics.stop();
        let report = self.statistics.report();
        info!(
            frames = report.frame_count,
            key_frames = report.key_frames(),
            mean_bitrate_bps = report.mean_bitrate_bps,
            "test finished"
        );
        ExecutionOutcome {
            test_id: self.test.id,
            state: ExecutorState::Finalized,
            history: self.history,
            failure: None,
            report,
        }
    }

    fn errored(mut self, failure: TestFailure) -> ExecutionOutcome {
        error!(%failure, state = %self.state(), "test failed");
        self.transition(ExecutorState::Errored);
        self.statistics.mark_failed(failure.clone());
        self.statistics.stop();
        ExecutionOutcome {
            test_id: self.test.id,
            state: ExecutorState::Errored,
            history: self.history,
            failure: Some(failure),
            report: self.statistics.report(),
        }
    }
}

fn reported_failure(failures: &FailureWatch) -> Option<TestFailure> {
    failures.borrow().clone()
}

/// Let the drain task catch up, then surface anything it reported.
///
/// Submissions may never suspend, so without the yield a current-thread
/// runtime would not run the drain task until Running is over.
async fn check_failures(failures: &FailureWatch) -> Result<(), TestFailure> {
    tokio::task::yield_now().await;
    reported_failure(failures).map_or(Ok(()), Err)
}

async fn close_session(session: &mut dyn CodecSession) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "session close failed");
    }
}

async fn close_source(source: &mut dyn FrameSource) {
    if let Err(e) = source.close().await {
        warn!(error = %e, "source close failed");
    }
}
