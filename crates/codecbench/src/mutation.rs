//! Runtime mutation scheduling.
//!
//! Runtime events are indexed by input frame once, then applied when that
//! frame is reached, before the drop decision, so a dropped frame still
//! carries its mutations. Within a frame, events run in kind priority
//! (bitrate, keyframe, parameter, frame rate); same-kind events run in
//! authored order and the last one wins.

use crate::definition::{RuntimeEvent, RuntimeEventKind, TestDefinition};
use crate::pacer::FramePacer;
use crate::session::CodecSession;
use crate::statistics::TestStatistics;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What a mutation pass changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedMutations {
    /// Last bitrate sent to the session
    pub bitrate: Option<u64>,
    /// A keyframe was requested
    pub keyframe_requested: bool,
    /// Parameters sent to the session
    pub parameters_sent: usize,
    /// Parameters only recorded into the statistics
    pub parameters_recorded: usize,
    /// New output frame rate
    pub framerate: Option<f64>,
    /// Frame is on the explicit drop list
    pub explicit_drop: bool,
}

impl AppliedMutations {
    /// Whether the pass did nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Targets a mutation pass acts on
pub struct MutationTarget<'a> {
    /// The test's codec session
    pub session: &'a mut dyn CodecSession,
    /// The test's pacer
    pub pacer: &'a mut FramePacer,
    /// The test's statistics
    pub statistics: &'a TestStatistics,
    /// Send bitrate changes as constant-rate
    pub constant_rate: bool,
}

impl std::fmt::Debug for MutationTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationTarget")
            .field("session", &self.session.name())
            .field("pacer", &self.pacer)
            .field("statistics", &self.statistics.id())
            .field("constant_rate", &self.constant_rate)
            .finish()
    }
}

/// Frame-indexed runtime events
#[derive(Debug, Clone, Default)]
pub struct MutationScheduler {
    events: BTreeMap<u64, Vec<RuntimeEventKind>>,
}

impl MutationScheduler {
    /// Index `events` by frame, ordered by kind priority within a frame
    #[must_use]
    pub fn new(events: &[RuntimeEvent]) -> Self {
        let mut indexed: BTreeMap<u64, Vec<RuntimeEventKind>> = BTreeMap::new();
        for event in events {
            indexed.entry(event.frame).or_default().push(event.kind.clone());
        }
        for kinds in indexed.values_mut() {
            kinds.sort_by_key(RuntimeEventKind::priority);
        }
        Self { events: indexed }
    }

    /// Scheduler for a test's runtime events
    #[must_use]
    pub fn for_test(test: &TestDefinition) -> Self {
        Self::new(&test.runtime)
    }

    /// Events at `frame`, in application order
    #[must_use]
    pub fn events_at(&self, frame: u64) -> &[RuntimeEventKind] {
        self.events
            .get(&frame)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Frames listed as explicit drops
    #[must_use]
    pub fn explicit_drops(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter(|(_, kinds)| kinds.iter().any(|k| matches!(k, RuntimeEventKind::Drop)))
            .map(|(&frame, _)| frame)
            .collect()
    }

    /// Number of frames with at least one event
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events are scheduled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Apply every event scheduled at `frame`.
    ///
    /// Session calls are fire-and-forget: failures are logged, not returned.
    pub async fn apply(&self, frame: u64, target: MutationTarget<'_>) -> AppliedMutations {
        let MutationTarget {
            session,
            pacer,
            statistics,
            constant_rate,
        } = target;
        let mut applied = AppliedMutations::default();

        for kind in self.events_at(frame) {
            match kind {
                RuntimeEventKind::Bitrate { bitrate } => {
                    let bps = bitrate.bps();
                    if let Err(e) = session.set_bitrate(bps, constant_rate).await {
                        warn!(frame, bps, error = %e, "bitrate change rejected");
                    }
                    applied.bitrate = Some(bps);
                }
                RuntimeEventKind::ForceKeyframe => {
                    if let Err(e) = session.force_keyframe().await {
                        warn!(frame, error = %e, "keyframe request rejected");
                    }
                    applied.keyframe_requested = true;
                }
                RuntimeEventKind::Parameter(parameter) => match parameter.session_value() {
                    Some(value) => {
                        if let Err(e) = session.set_property(&parameter.key, &value).await {
                            warn!(frame, key = %parameter.key, error = %e, "parameter rejected");
                        }
                        applied.parameters_sent += 1;
                    }
                    None => {
                        statistics.set_property(
                            format!("runtime.{frame}.{}", parameter.key),
                            parameter.value.clone(),
                        );
                        applied.parameters_recorded += 1;
                    }
                },
                RuntimeEventKind::DynamicFramerate { framerate } => {
                    if pacer.set_output_rate(*framerate) {
                        applied.framerate = Some(*framerate);
                    }
                }
                RuntimeEventKind::Drop => applied.explicit_drop = true,
            }
        }

        if !applied.is_empty() {
            debug!(frame, ?applied, "runtime mutations applied");
        }
        applied
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::definition::{Bitrate, DataValueType, Parameter};
    use crate::mock::{MockCall, MockCodecFactory};
    use crate::session::{completion_channel, SessionConfig, SessionFactory};

    async fn open_mock() -> (MockCodecFactory, crate::session::SessionHandle) {
        let factory = MockCodecFactory::new();
        let test = TestDefinition::new("m", "mock", "clip.yuv");
        let (tx, _rx) = completion_channel();
        let session = factory
            .open(&SessionConfig::from_test(&test, 30.0), tx)
            .await
            .unwrap();
        (factory, session)
    }

    #[test]
    fn test_events_sorted_by_priority() {
        let scheduler = MutationScheduler::new(&[
            RuntimeEvent::dynamic_framerate(5, 15.0),
            RuntimeEvent::force_keyframe(5),
            RuntimeEvent::bitrate(5, Bitrate::from_bps(1)),
            RuntimeEvent::bitrate(9, Bitrate::from_bps(2)),
        ]);
        let names: Vec<_> = scheduler.events_at(5).iter().map(RuntimeEventKind::name).collect();
        assert_eq!(names, ["bitrate", "force_keyframe", "dynamic_framerate"]);
        assert_eq!(scheduler.len(), 2);
        assert!(scheduler.events_at(6).is_empty());
    }

    #[test]
    fn test_explicit_drops_collected() {
        let scheduler = MutationScheduler::new(&[
            RuntimeEvent::drop_frame(7),
            RuntimeEvent::force_keyframe(5),
            RuntimeEvent::drop_frame(3),
        ]);
        assert_eq!(scheduler.explicit_drops(), vec![3, 7]);
    }

    #[tokio::test]
    async fn test_bitrate_and_keyframe_same_frame() {
        let (factory, mut session) = open_mock().await;
        let mut pacer = FramePacer::new(Some(30.0), None, 0);
        let stats = TestStatistics::new(&TestDefinition::new("m", "mock", "clip.yuv"));
        let scheduler = MutationScheduler::new(&[
            RuntimeEvent::force_keyframe(100),
            RuntimeEvent::bitrate(100, Bitrate::from_bps(2_000_000)),
        ]);

        let applied = scheduler
            .apply(
                100,
                MutationTarget {
                    session: session.as_mut(),
                    pacer: &mut pacer,
                    statistics: &stats,
                    constant_rate: true,
                },
            )
            .await;

        assert_eq!(applied.bitrate, Some(2_000_000));
        assert!(applied.keyframe_requested);
        assert_eq!(
            factory.calls(),
            vec![
                MockCall::SetBitrate {
                    bps: 2_000_000,
                    constant_rate: true
                },
                MockCall::ForceKeyframe,
            ]
        );
    }

    #[tokio::test]
    async fn test_last_bitrate_wins() {
        let (factory, mut session) = open_mock().await;
        let mut pacer = FramePacer::new(Some(30.0), None, 0);
        let stats = TestStatistics::new(&TestDefinition::new("m", "mock", "clip.yuv"));
        let scheduler = MutationScheduler::new(&[
            RuntimeEvent::bitrate(10, Bitrate::from_bps(500_000)),
            RuntimeEvent::bitrate(10, Bitrate::from_bps(800_000)),
        ]);
        let applied = scheduler
            .apply(
                10,
                MutationTarget {
                    session: session.as_mut(),
                    pacer: &mut pacer,
                    statistics: &stats,
                    constant_rate: false,
                },
            )
            .await;
        assert_eq!(applied.bitrate, Some(800_000));
        assert_eq!(factory.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_parameters_sent_or_recorded() {
        let (factory, mut session) = open_mock().await;
        let mut pacer = FramePacer::new(Some(30.0), None, 0);
        let stats = TestStatistics::new(&TestDefinition::new("m", "mock", "clip.yuv"));
        let scheduler = MutationScheduler::new(&[
            RuntimeEvent::parameter(4, Parameter::new("qp-max", DataValueType::Int, "40")),
            RuntimeEvent::parameter(4, Parameter::new("low-latency", DataValueType::Bool, "true")),
        ]);
        let applied = scheduler
            .apply(
                4,
                MutationTarget {
                    session: session.as_mut(),
                    pacer: &mut pacer,
                    statistics: &stats,
                    constant_rate: false,
                },
            )
            .await;
        assert_eq!(applied.parameters_sent, 1);
        assert_eq!(applied.parameters_recorded, 1);
        assert_eq!(factory.calls().len(), 1);
        assert_eq!(stats.report().properties["runtime.4.low-latency"], "true");
    }

    #[tokio::test]
    async fn test_dynamic_framerate_updates_pacer() {
        let (_factory, mut session) = open_mock().await;
        let mut pacer = FramePacer::new(Some(30.0), None, 0);
        let stats = TestStatistics::new(&TestDefinition::new("m", "mock", "clip.yuv"));
        let scheduler = MutationScheduler::new(&[
            RuntimeEvent::dynamic_framerate(20, 10.0),
            RuntimeEvent::dynamic_framerate(30, -1.0),
        ]);

        let target = MutationTarget {
            session: session.as_mut(),
            pacer: &mut pacer,
            statistics: &stats,
            constant_rate: false,
        };
        let applied = scheduler.apply(20, target).await;
        assert_eq!(applied.framerate, Some(10.0));
        assert_eq!(pacer.keep_interval(), 3.0);

        let target = MutationTarget {
            session: session.as_mut(),
            pacer: &mut pacer,
            statistics: &stats,
            constant_rate: false,
        };
        let applied = scheduler.apply(30, target).await;
        assert!(applied.is_empty());
        assert_eq!(pacer.output_rate(), 10.0);
    }
}
