//! Test Suite Orchestrator
//!
//! Runs a suite's ordered entries one after another. An entry's parallel
//! sub-tests are started as detached tasks (staggered by
//! `parallel_start_delay`, recursively for nested lists) and never awaited;
//! the entry's own test is then started and awaited on a oneshot before the
//! next entry begins. A pursuit entry starts instance after instance of its
//! test, `pursuit_interval` apart and without waiting, until the count is used
//! up or an instance fails; the entry then waits for all of them.
//!
//! Every task, primary or parallel, completes exactly once: under the
//! registry lock it is removed from the [`ActiveRegistry`], its report is
//! persisted and the listener is told. Parallel tasks may still be running
//! when `on_suite_complete` fires; [`SuiteOrchestrator::wait_idle`] waits for
//! them.

use crate::config::HarnessConfig;
use crate::definition::{Pursuit, TestDefinition, TestSuite};
use crate::executor::{ExecutionOutcome, ExecutorState, SingleTestExecutor};
use crate::media::MediaIo;
use crate::result::{BenchError, FailureKind, TestFailure};
use crate::session::SessionFactory;
use crate::statistics::TestStatistics;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::RecvError;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

// =============================================================================
// Tasks
// =============================================================================

/// Identifier of a running task, unique per orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Description of a started task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    /// Task id
    pub id: TaskId,
    /// Test id
    pub test_id: String,
    /// Statistics id of the run
    pub stats_id: String,
    /// Started detached, as a parallel sub-test
    pub parallel: bool,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
}

/// A finished task
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    /// The task
    pub task: TaskInfo,
    /// How the executor ended
    pub outcome: ExecutionOutcome,
    /// Where the JSON report was written
    pub report_path: Option<PathBuf>,
    /// Start to completion
    pub elapsed: Duration,
}

/// Tasks currently running, keyed by id
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    tasks: Mutex<HashMap<TaskId, TaskInfo>>,
    idle: Notify,
}

impl ActiveRegistry {
    /// Number of running tasks
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Whether nothing is running
    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    /// Running tasks, ordered by id
    pub async fn snapshot(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.lock().await;
        let mut infos: Vec<_> = tasks.values().cloned().collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    async fn insert(&self, info: TaskInfo) {
        self.tasks.lock().await.insert(info.id, info);
    }

    /// Wait until no task is running
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a concurrent removal is not missed
            let notified = self.idle.notified();
            if self.is_empty().await {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Suite summary, also handed to `on_suite_complete`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteSummary {
    /// Suite name
    pub suite: String,
    /// Ordered entries run
    pub primaries_run: usize,
    /// Ordered entries that did not finish normally
    pub primaries_failed: usize,
    /// Parallel sub-tests started
    pub parallel_started: usize,
    /// Instances started by pursuit entries
    pub pursuit_instances: usize,
    /// Tasks still running when the last entry finished
    pub still_active: usize,
    /// Suite wall time
    pub elapsed: Duration,
}

impl SuiteSummary {
    fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            primaries_run: 0,
            primaries_failed: 0,
            parallel_started: 0,
            pursuit_instances: 0,
            still_active: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether every ordered entry finished normally
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.primaries_failed == 0
    }
}

/// Receives task and suite lifecycle callbacks.
///
/// `on_task_complete` runs while the registry lock is held, so completions
/// are delivered one at a time.
pub trait SuiteListener: Send + Sync {
    /// A task was registered and is about to run
    fn on_task_started(&self, _task: &TaskInfo) {}

    /// A task finished, normally or not
    fn on_task_complete(&self, _completion: &TaskCompletion) {}

    /// The last ordered entry finished
    fn on_suite_complete(&self, _summary: &SuiteSummary) {}
}

/// Logs every callback through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl SuiteListener for LoggingListener {
    fn on_task_started(&self, task: &TaskInfo) {
        info!(
            task = %task.id,
            test_id = %task.test_id,
            stats_id = %task.stats_id,
            parallel = task.parallel,
            "task started"
        );
    }

    fn on_task_complete(&self, completion: &TaskCompletion) {
        let result = if completion.outcome.is_success() {
            "ok"
        } else {
            "error"
        };
        info!(
            "Test finished id: \"{}\" run_id: {} result: \"{}\"",
            completion.task.test_id, completion.task.stats_id, result
        );
        if let Some(failure) = &completion.outcome.failure {
            warn!(test_id = %completion.task.test_id, %failure, "task failed");
        }
    }

    fn on_suite_complete(&self, summary: &SuiteSummary) {
        info!(
            suite = %summary.suite,
            primaries_run = summary.primaries_run,
            primaries_failed = summary.primaries_failed,
            parallel_started = summary.parallel_started,
            pursuit_instances = summary.pursuit_instances,
            still_active = summary.still_active,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "suite complete"
        );
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs test suites against an injected codec factory and media provider
#[derive(Clone)]
pub struct SuiteOrchestrator {
    config: Arc<HarnessConfig>,
    factory: Arc<dyn SessionFactory>,
    media: Arc<dyn MediaIo>,
    listener: Arc<dyn SuiteListener>,
    registry: Arc<ActiveRegistry>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for SuiteOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteOrchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl SuiteOrchestrator {
    /// Create an orchestrator that logs through [`LoggingListener`]
    #[must_use]
    pub fn new(
        config: HarnessConfig,
        factory: Arc<dyn SessionFactory>,
        media: Arc<dyn MediaIo>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            media,
            listener: Arc::new(LoggingListener),
            registry: Arc::new(ActiveRegistry::default()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Replace the listener
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn SuiteListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Harness configuration
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Registry of running tasks
    #[must_use]
    pub fn registry(&self) -> &ActiveRegistry {
        &self.registry
    }

    /// Number of running tasks
    pub async fn active_count(&self) -> usize {
        self.registry.len().await
    }

    /// Wait for every running task, including detached parallel ones
    pub async fn wait_idle(&self) {
        self.registry.wait_idle().await;
    }

    /// Run every entry of `suite` in order
    pub async fn run_suite(&self, suite: &TestSuite) -> SuiteSummary {
        let span = info_span!("suite", suite = %suite.name);
        self.run_entries(suite).instrument(span).await
    }

    async fn run_entries(&self, suite: &TestSuite) -> SuiteSummary {
        let started = Instant::now();
        let mut summary = SuiteSummary::new(&suite.name);
        info!(
            entries = suite.tests.len(),
            total = suite.total_tests(),
            "suite starting"
        );

        for entry in &suite.tests {
            summary.primaries_run += 1;
            let ok = match entry.input.pursuit() {
                Pursuit::Single => {
                    summary.parallel_started += self.start_parallel(&entry.parallel).await;
                    let done = self.spawn_task(entry.clone(), false).await;
                    passed(entry, done.await)
                }
                pursuit => self.run_pursuit(entry, pursuit, &mut summary).await,
            };
            if !ok {
                summary.primaries_failed += 1;
            }
        }

        summary.still_active = self.active_count().await;
        summary.elapsed = started.elapsed();
        self.listener.on_suite_complete(&summary);
        summary
    }

    async fn run_pursuit(
        &self,
        entry: &TestDefinition,
        pursuit: Pursuit,
        summary: &mut SuiteSummary,
    ) -> bool {
        let mut running: FuturesUnordered<oneshot::Receiver<TaskCompletion>> =
            FuturesUnordered::new();
        let mut started: u64 = 0;
        let mut peak_active = 0;
        let mut failed = false;

        while pursuit.allows(started) {
            if started > 0 {
                if self.config.pursuit_interval.is_zero() {
                    // Started instances must get to run before the next check
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(self.config.pursuit_interval).await;
                }
            }
            while let Some(Some(received)) = running.next().now_or_never() {
                failed |= !passed(entry, received);
            }
            if failed {
                break;
            }

            summary.parallel_started += self.start_parallel(&entry.parallel).await;
            running.push(self.spawn_task(entry.clone(), false).await);
            started += 1;
            let active = self.active_count().await;
            peak_active = peak_active.max(active);
            debug!(test_id = %entry.id, instance = started, active, "pursuit instance started");
        }

        while let Some(received) = running.next().await {
            failed |= !passed(entry, received);
        }
        summary.pursuit_instances += started as usize;
        info!(
            test_id = %entry.id,
            instances = started,
            peak_active,
            failed,
            "pursuit over"
        );
        !failed
    }

    /// Start `tests` detached, nested lists first, and return how many started
    fn start_parallel<'a>(&'a self, tests: &'a [TestDefinition]) -> BoxFuture<'a, usize> {
        async move {
            let mut started = 0;
            for test in tests {
                started += self.start_parallel(&test.parallel).await;
                let delay = self.config.parallel_start_delay;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                // Nobody waits on a parallel task
                drop(self.spawn_task(test.clone(), true).await);
                started += 1;
            }
            started
        }
        .boxed()
    }

    async fn spawn_task(
        &self,
        test: TestDefinition,
        parallel: bool,
    ) -> oneshot::Receiver<TaskCompletion> {
        let executor = SingleTestExecutor::new(
            test,
            Arc::clone(&self.config),
            Arc::clone(&self.factory),
            Arc::clone(&self.media),
        );
        let statistics = executor.statistics();
        let info = TaskInfo {
            id: TaskId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            test_id: executor.test().id.clone(),
            stats_id: statistics.id().to_string(),
            parallel,
            started_at: Utc::now(),
        };

        self.registry.insert(info.clone()).await;
        self.listener.on_task_started(&info);

        let (done_tx, done_rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(
            async move {
                let started = Instant::now();
                let outcome = match AssertUnwindSafe(executor.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => panicked(&info, &statistics, panic.as_ref()),
                };
                let completion = this.complete(info, outcome, started.elapsed()).await;
                // A detached task has no receiver
                let _ = done_tx.send(completion);
            }
            .in_current_span(),
        );
        done_rx
    }

    async fn complete(
        &self,
        task: TaskInfo,
        outcome: ExecutionOutcome,
        elapsed: Duration,
    ) -> TaskCompletion {
        let mut tasks = self.registry.tasks.lock().await;
        if tasks.remove(&task.id).is_none() {
            let err = BenchError::registry(format!("{} completed but was not registered", task.id));
            warn!(error = %err, "registry out of sync");
        }

        let report_path = if self.config.write_reports {
            match outcome.report.write_json(&self.config.work_dir).await {
                Ok(path) => Some(path),
                Err(e) => {
                    error!(test_id = %task.test_id, error = %e, "failed to persist report");
                    None
                }
            }
        } else {
            None
        };

        let completion = TaskCompletion {
            task,
            outcome,
            report_path,
            elapsed,
        };
        self.listener.on_task_complete(&completion);
        if tasks.is_empty() {
            self.registry.idle.notify_waiters();
        }
        completion
    }
}

fn passed(entry: &TestDefinition, received: Result<TaskCompletion, RecvError>) -> bool {
    match received {
        Ok(completion) => completion.outcome.is_success(),
        Err(_) => {
            error!(test_id = %entry.id, "completion signal lost");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn panicked(
    task: &TaskInfo,
    statistics: &TestStatistics,
    panic: &(dyn Any + Send),
) -> ExecutionOutcome {
    let failure = TestFailure::new(
        FailureKind::Internal,
        format!("executor panicked: {}", panic_message(panic)),
    );
    error!(test_id = %task.test_id, %failure, "task panicked");
    statistics.mark_failed(failure.clone());
    statistics.stop();
    ExecutionOutcome {
        test_id: task.test_id.clone(),
        state: ExecutorState::Errored,
        history: vec![ExecutorState::Errored],
        failure: Some(failure),
        report: statistics.report(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockCodecFactory, MockMediaIo, RecordedEvent, RecordingListener};

    fn orchestrator(factory: MockCodecFactory, listener: &RecordingListener) -> SuiteOrchestrator {
        let config = HarnessConfig::builder()
            .write_reports(false)
            .parallel_start_delay(Duration::ZERO)
            .build();
        SuiteOrchestrator::new(config, Arc::new(factory), Arc::new(MockMediaIo::new(5)))
            .with_listener(Arc::new(listener.clone()))
    }

    fn test(id: &str, codec: &str) -> TestDefinition {
        TestDefinition::new(id, codec, "clip.yuv").with_resolution(16, 16)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    #[tokio::test]
    async fn test_wait_idle_returns_when_empty() {
        let registry = ActiveRegistry::default();
        registry.wait_idle().await;
        assert!(registry.is_empty().await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(7).to_string(), "task-7");
    }

    #[test]
    fn test_panic_message_variants() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(owned.as_ref()), "bang");
        let other: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    // =========================================================================
    // Suites
    // =========================================================================

    #[tokio::test]
    async fn test_entries_run_in_order() {
        let listener = RecordingListener::new();
        let orch = orchestrator(MockCodecFactory::new(), &listener);
        let suite = TestSuite::new("ordered")
            .with_test(test("a", "mock"))
            .with_test(test("b", "mock"))
            .with_test(test("c", "mock"));

        let summary = orch.run_suite(&suite).await;

        assert_eq!(summary.primaries_run, 3);
        assert!(summary.all_passed());
        assert_eq!(summary.still_active, 0);
        assert!(listener.completed_at("a").unwrap() < listener.started_at("b").unwrap());
        assert!(listener.completed_at("b").unwrap() < listener.started_at("c").unwrap());
        assert!(listener.completed_at("c").unwrap() < listener.suite_completed_at().unwrap());
    }

    #[tokio::test]
    async fn test_failed_entry_does_not_stop_suite() {
        let listener = RecordingListener::new();
        let factory = MockCodecFactory::new().with_behavior(
            "broken",
            MockBehavior {
                fail_open: true,
                ..MockBehavior::default()
            },
        );
        let orch = orchestrator(factory, &listener);
        let suite = TestSuite::new("isolation")
            .with_test(test("bad", "broken"))
            .with_test(test("good", "mock"));

        let summary = orch.run_suite(&suite).await;

        assert_eq!(summary.primaries_run, 2);
        assert_eq!(summary.primaries_failed, 1);
        assert_eq!(listener.completions_of("bad"), 1);
        assert_eq!(listener.completions_of("good"), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported_once() {
        let listener = RecordingListener::new();
        let factory = MockCodecFactory::new().with_behavior(
            "explosive",
            MockBehavior {
                panic_on_open: true,
                ..MockBehavior::default()
            },
        );
        let orch = orchestrator(factory, &listener);
        let suite = TestSuite::new("panic")
            .with_test(test("boom", "explosive"))
            .with_test(test("after", "mock"));

        let summary = orch.run_suite(&suite).await;

        assert_eq!(summary.primaries_failed, 1);
        assert_eq!(listener.completions_of("boom"), 1);
        assert_eq!(listener.completions_of("after"), 1);
        assert_eq!(orch.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_nested_parallel_tests_all_start() {
        let listener = RecordingListener::new();
        let orch = orchestrator(MockCodecFactory::new(), &listener);
        let inner = test("p1", "mock").with_parallel(test("p1a", "mock"));
        let suite = TestSuite::new("nested")
            .with_test(test("main", "mock").with_parallel(inner));

        let summary = orch.run_suite(&suite).await;
        orch.wait_idle().await;

        assert_eq!(summary.parallel_started, 2);
        for id in ["main", "p1", "p1a"] {
            assert_eq!(listener.completions_of(id), 1, "{id}");
        }
        assert!(listener.started_at("p1a").unwrap() < listener.started_at("p1").unwrap());
        assert!(listener.started_at("p1").unwrap() < listener.started_at("main").unwrap());
    }

    #[tokio::test]
    async fn test_stuck_flush_does_not_stall_suite() {
        let listener = RecordingListener::new();
        let factory = MockCodecFactory::new().with_behavior(
            "stuck",
            MockBehavior {
                flush_gate: Some(Arc::new(tokio::sync::Semaphore::new(0))),
                ..MockBehavior::default()
            },
        );
        let config = HarnessConfig::builder()
            .write_reports(false)
            .drain_timeout(Duration::from_millis(50))
            .build();
        let orch = SuiteOrchestrator::new(config, Arc::new(factory), Arc::new(MockMediaIo::new(5)))
            .with_listener(Arc::new(listener.clone()));
        let suite = TestSuite::new("stuck")
            .with_test(test("hung", "stuck"))
            .with_test(test("next", "mock"));

        let summary = tokio::time::timeout(Duration::from_secs(5), orch.run_suite(&suite))
            .await
            .expect("suite stalled on a flush");

        assert_eq!(summary.primaries_run, 2);
        assert_eq!(listener.completions_of("next"), 1);
        assert!(listener.completed_at("hung").unwrap() < listener.started_at("next").unwrap());
    }

    // =========================================================================
    // Pursuit
    // =========================================================================

    #[tokio::test]
    async fn test_pursuit_runs_counted_instances() {
        let listener = RecordingListener::new();
        let config = HarnessConfig::builder()
            .write_reports(false)
            .pursuit_interval(Duration::ZERO)
            .build();
        let orch = SuiteOrchestrator::new(
            config,
            Arc::new(MockCodecFactory::new()),
            Arc::new(MockMediaIo::new(5)),
        )
        .with_listener(Arc::new(listener.clone()));
        let suite = TestSuite::new("pursuit")
            .with_test(test("many", "mock").with_pursuit(3))
            .with_test(test("after", "mock"));

        let summary = orch.run_suite(&suite).await;

        assert_eq!(summary.primaries_run, 2);
        assert!(summary.all_passed());
        assert_eq!(summary.pursuit_instances, 3);
        assert_eq!(summary.still_active, 0);
        assert_eq!(listener.completions_of("many"), 3);
        // Every instance finished before the next entry started
        let after = listener.started_at("after").unwrap();
        let events = listener.events();
        let last_instance = events
            .iter()
            .rposition(|e| matches!(e, RecordedEvent::Completed { test_id, .. } if test_id == "many"))
            .unwrap();
        assert!(last_instance < after);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pursuit_stops_at_first_failure() {
        // Instances stay open until their flush times out, so the fourth
        // concurrent one is refused
        let listener = RecordingListener::new();
        let factory = MockCodecFactory::new().with_behavior(
            "limited",
            MockBehavior {
                max_instances: Some(3),
                flush_gate: Some(Arc::new(tokio::sync::Semaphore::new(0))),
                ..MockBehavior::default()
            },
        );
        let config = HarnessConfig::builder()
            .write_reports(false)
            .pursuit_interval(Duration::from_millis(20))
            .drain_timeout(Duration::from_millis(500))
            .build();
        let orch = SuiteOrchestrator::new(config, Arc::new(factory), Arc::new(MockMediaIo::new(5)))
            .with_listener(Arc::new(listener.clone()));
        let suite = TestSuite::new("capacity").with_test(test("capacity_check", "limited").with_pursuit(-1));

        let summary = tokio::time::timeout(Duration::from_secs(10), orch.run_suite(&suite))
            .await
            .expect("pursuit never ended");

        assert_eq!(summary.primaries_failed, 1);
        assert!(summary.pursuit_instances >= 4);
        assert!(summary.pursuit_instances < 10);
        let results: Vec<bool> = listener
            .events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Completed { success, .. } => Some(success),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), summary.pursuit_instances);
        assert_eq!(results.iter().filter(|&&ok| ok).count(), 3);
        assert_eq!(orch.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_reports_persisted_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::builder()
            .work_dir(dir.path())
            .parallel_start_delay(Duration::ZERO)
            .build();
        let orch = SuiteOrchestrator::new(
            config,
            Arc::new(MockCodecFactory::new()),
            Arc::new(MockMediaIo::new(3)),
        );
        let suite = TestSuite::new("persist")
            .with_test(test("one", "mock").with_parallel(test("side", "mock")));

        orch.run_suite(&suite).await;
        orch.wait_idle().await;

        let reports = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .count();
        assert_eq!(reports, 2);
    }
}
