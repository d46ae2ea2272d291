//! codecbench: Codec Exercising Harness
//!
//! Drives video codecs through scripted test runs: frames are read from a raw
//! source, stamped with presentation times, thinned for frame-rate
//! conversion, mutated at runtime (bitrate, keyframes, parameters, frame
//! rate) and submitted to a codec session. Completions are correlated back to
//! their submissions to produce per-frame statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    CODECBENCH Architecture                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │   ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │   │ Suite        │    │ Single Test  │    │ Codec        │       │
//! │   │ Orchestrator │───►│ Executor     │───►│ Session      │       │
//! │   └──────┬───────┘    └──────┬───────┘    └──────┬───────┘       │
//! │          │         ┌─────────┼─────────┐         │ completions   │
//! │          │         ▼         ▼         ▼         ▼               │
//! │          │     ┌───────┐ ┌───────┐ ┌────────┐ ┌────────────┐     │
//! │          │     │ Pacer │ │ Drops │ │Mutation│ │ Statistics │     │
//! │          │     └───────┘ └───────┘ └────────┘ │ Correlator │     │
//! │          │                                    └─────┬──────┘     │
//! │          └◄──────────── report + completion ────────┘            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use codecbench::mock::{MockCodecFactory, MockMediaIo};
//! use codecbench::{HarnessConfig, SuiteOrchestrator, TestDefinition, TestSuite};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let suite = TestSuite::new("smoke").with_test(
//!     TestDefinition::new("720p", "h264", "clip.yuv").with_playout_frames(300),
//! );
//! let orchestrator = SuiteOrchestrator::new(
//!     HarnessConfig::default(),
//!     Arc::new(MockCodecFactory::new()),
//!     Arc::new(MockMediaIo::new(60)),
//! );
//! let summary = orchestrator.run_suite(&suite).await;
//! assert!(summary.all_passed());
//! # }
//! ```

#![warn(missing_docs)]
// Lints are configured in workspace Cargo.toml [workspace.lints.clippy]

mod config;
mod definition;
mod drop_decision;
mod executor;
mod media;
mod mutation;
mod orchestrator;
mod pacer;
mod report;
mod result;
mod session;
mod statistics;

/// Scripted codec and in-memory media for tests and dry runs
pub mod mock;

/// Tracing subscriber setup
pub mod telemetry;

pub use config::{
    HarnessConfig, HarnessConfigBuilder, DEFAULT_DRAIN_TIMEOUT, DEFAULT_PARALLEL_START_DELAY,
    DEFAULT_PROGRESS_INTERVAL, DEFAULT_PURSUIT_INTERVAL,
};
pub use definition::{
    parse_magnitude, Bitrate, BitrateMode, DataValueType, EncoderSpec, InputSpec, Parameter,
    ParameterValue, PixelFormat, Pursuit, Resolution, RuntimeEvent, RuntimeEventKind,
    TestDefinition, TestSuite,
};
pub use drop_decision::{dropped_by_ratio, DropDecision, DropReason};
pub use executor::{
    ExecutionOutcome, ExecutorState, SingleTestExecutor, StopReason, Termination,
};
pub use media::{
    output_extension, FileMediaIo, FileSink, FrameSource, MediaIo, NullSink, OutputSink,
    RawFileSource, SyntheticSource,
};
pub use mutation::{AppliedMutations, MutationScheduler, MutationTarget};
pub use orchestrator::{
    ActiveRegistry, LoggingListener, SuiteListener, SuiteOrchestrator, SuiteSummary,
    TaskCompletion, TaskId, TaskInfo,
};
pub use pacer::{resolve_rate, FramePacer, DEFAULT_FRAME_RATE};
pub use report::{
    mean_bitrate_bps, DecodedFrameReport, FrameReport, HarnessDrops, StatisticsReport,
};
pub use result::{BenchError, BenchResult, FailureKind, TestFailure};
pub use session::{
    completion_channel, CodecEvent, CodecSession, CompletionReceiver, CompletionSender,
    Direction, EncodedSample, RawFrame, SessionConfig, SessionFactory, SessionHandle,
};
pub use statistics::{nearest_match, FrameRecord, TestStatistics};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::{
        BenchError, BenchResult, Bitrate, BitrateMode, CodecEvent, CodecSession, ExecutionOutcome,
        ExecutorState, FramePacer, HarnessConfig, MediaIo, RuntimeEvent, SessionConfig,
        SessionFactory, SingleTestExecutor, StatisticsReport, SuiteListener, SuiteOrchestrator,
        SuiteSummary, TestDefinition, TestStatistics, TestSuite,
    };
}
