#![cfg(feature = "transport-mock")]
use nexmark_replay::clock::{Clock, VirtualClock};
use nexmark_replay::dispatch::{DispatchError, FailurePolicy, KeyCodec, PublishWorkerPool};
use nexmark_replay::event::{Event, Topic};
use nexmark_replay::orchestrator::{
    OrchestratorConfig, OrchestratorError, Phase, PhaseError, PhaseOrchestrator, Waits,
};
use nexmark_replay::pacing::{LoopState, PacedEventLoop};
use nexmark_replay::side_input::SideInputSource;
use nexmark_replay::transport::mock::MockTransport;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_700_000_000_000;

fn events(n: i64) -> Vec<Event> {
    (0..n)
        .map(|i| Event::new(T0 + i * 100, format!(r#"{{"id":{i}}}"#)))
        .collect()
}

fn side_input_file(lines: usize) -> PathBuf {
    let path = std::env::temp_dir().join(format!("side-input-{}.txt", uuid::Uuid::new_v4()));
    let body: String = (0..lines).map(|i| format!("{i},category-{}\n", i % 7)).collect();
    std::fs::write(&path, body).unwrap();
    path
}

struct Harness {
    transport: MockTransport,
    clock: Arc<VirtualClock>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            clock: Arc::new(VirtualClock::new(T0)),
            cancel: CancellationToken::new(),
        }
    }

    fn orchestrator(
        &self,
        events: Vec<Event>,
        side_input: PathBuf,
        limit: usize,
        policy: FailurePolicy,
    ) -> PhaseOrchestrator<std::vec::IntoIter<Event>> {
        let clock: Arc<dyn Clock> = self.clock.clone();
        let transport = Arc::new(self.transport.clone());
        let config = OrchestratorConfig {
            events_topic: Topic::new("events").unwrap(),
            side_inputs_topic: Topic::new("side-inputs").unwrap(),
            workers: 3,
            key_codec: KeyCodec::Long,
            side_input: SideInputSource::new(side_input, limit),
            waits: Waits::default(),
        };
        let pacer = PacedEventLoop::new(events.into_iter(), clock.clone(), self.cancel.clone());
        let pool = PublishWorkerPool::new(transport.clone(), clock.clone())
            .with_workers(3)
            .with_warmup(Duration::from_secs(5))
            .with_policy(policy);
        PhaseOrchestrator::new(config, pacer, pool, transport, clock)
    }
}

#[tokio::test]
async fn full_run_publishes_events_then_side_inputs() {
    let h = Harness::new(MockTransport::new());
    let side = side_input_file(500);
    let report = h
        .orchestrator(events(9), side.clone(), 1000, FailurePolicy::FailFast)
        .run()
        .await
        .expect("run");

    let pacing = report.pacing.as_ref().unwrap();
    assert_eq!(pacing.state, LoopState::Exhausted);
    assert_eq!(pacing.emitted, 9);

    let ev = report.events.as_ref().unwrap();
    assert_eq!(ev.attempted, 9);
    assert_eq!(ev.per_worker, vec![3, 3, 3]);
    let published: BTreeSet<String> = h
        .transport
        .published_to("events")
        .into_iter()
        .map(|r| String::from_utf8(r.payload.to_vec()).unwrap())
        .collect();
    let expected: BTreeSet<String> = events(9).into_iter().map(|e| e.payload).collect();
    assert_eq!(published, expected);

    // Source holds 500 records; asking for 1000 yields 500.
    let side_summary = report.side_inputs.as_ref().unwrap();
    assert_eq!(side_summary.batch_size, 500);
    assert_eq!(side_summary.attempted, 500);
    assert_eq!(h.transport.published_to("side-inputs").len(), 500);
    assert_eq!(h.transport.attempts(), 509);

    // Three consumers per group, each sees every record.
    assert_eq!(report.events_consumed.as_ref().unwrap().received_count, 27);
    assert_eq!(report.side_inputs_consumed.as_ref().unwrap().received_count, 1500);
    assert_eq!(h.transport.subscriber_count("events"), 0);

    assert_eq!(report.completed.len(), 9);
    let sleeps = h.clock.sleeps();
    assert_eq!(sleeps.iter().filter(|d| **d == Duration::from_secs(60)).count(), 2);
    assert_eq!(sleeps.iter().filter(|d| **d == Duration::from_secs(5)).count(), 2);

    std::fs::remove_file(side).ok();
}

#[tokio::test]
async fn stepping_exposes_each_phase() {
    let h = Harness::new(MockTransport::new());
    let side = side_input_file(4);
    let mut orch = h.orchestrator(events(5), side.clone(), 1000, FailurePolicy::FailFast);

    assert_eq!(orch.phase(), Phase::Pacing);
    assert_eq!(orch.step().await.unwrap(), Phase::StartEventConsumer);
    assert!(h.clock.now_millis() >= T0 + 400);
    assert_eq!(h.transport.attempts(), 0);

    assert_eq!(orch.step().await.unwrap(), Phase::EventConsumerWarmup);
    assert_eq!(h.transport.subscriber_count("events"), 3);

    assert_eq!(orch.step().await.unwrap(), Phase::PublishEvents);
    assert_eq!(orch.step().await.unwrap(), Phase::EventSettle);
    assert_eq!(h.transport.published_to("events").len(), 5);

    assert_eq!(orch.step().await.unwrap(), Phase::StartSideInputConsumer);
    assert_eq!(orch.step().await.unwrap(), Phase::SideInputConsumerWarmup);
    assert_eq!(h.transport.subscriber_count("side-inputs"), 3);
    assert!(h.transport.published_to("side-inputs").is_empty());

    assert_eq!(orch.step().await.unwrap(), Phase::PublishSideInputs);
    assert_eq!(orch.step().await.unwrap(), Phase::SideInputSettle);
    assert_eq!(h.transport.published_to("side-inputs").len(), 4);

    assert_eq!(orch.step().await.unwrap(), Phase::Finished);
    assert_eq!(h.transport.subscriber_count("side-inputs"), 0);
    assert!(matches!(
        orch.step().await,
        Err(OrchestratorError::Terminal(Phase::Finished))
    ));

    std::fs::remove_file(side).ok();
}

#[tokio::test]
async fn delivery_failure_aborts_before_side_inputs() {
    let h = Harness::new(MockTransport::failing_at([2]));
    let side = side_input_file(10);
    let err = h
        .orchestrator(events(9), side.clone(), 1000, FailurePolicy::FailFast)
        .run()
        .await
        .unwrap_err();

    let OrchestratorError::Phase { phase, source } = err else {
        panic!("expected a phase failure");
    };
    assert_eq!(phase, Phase::PublishEvents);
    let PhaseError::Dispatch(DispatchError::DeliveryFailed { summary }) = source else {
        panic!("expected a delivery failure");
    };
    assert!(summary.delivered < 9);
    assert!(h.transport.published_to("side-inputs").is_empty());
    assert_eq!(h.transport.subscriber_count("events"), 0);

    std::fs::remove_file(side).ok();
}

#[tokio::test]
async fn continue_policy_keeps_going_after_failures() {
    let h = Harness::new(MockTransport::failing_at([2]));
    let side = side_input_file(10);
    let report = h
        .orchestrator(events(9), side.clone(), 1000, FailurePolicy::Continue)
        .run()
        .await
        .unwrap();

    let ev = report.events.unwrap();
    assert_eq!((ev.delivered, ev.failed), (8, 1));
    assert_eq!(report.side_inputs.unwrap().delivered, 10);

    std::fs::remove_file(side).ok();
}

#[tokio::test]
async fn missing_side_input_fails_without_rollback() {
    let h = Harness::new(MockTransport::new());
    let missing = std::env::temp_dir().join(format!("missing-{}.txt", uuid::Uuid::new_v4()));
    let mut orch = h.orchestrator(events(3), missing, 1000, FailurePolicy::FailFast);

    let err = loop {
        match orch.step().await {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(
        err,
        OrchestratorError::Phase { phase: Phase::PublishSideInputs, source: PhaseError::SideInput(_) }
    ));
    assert_eq!(orch.phase(), Phase::Failed);
    assert_eq!(h.transport.published_to("events").len(), 3);
    assert!(matches!(orch.step().await, Err(OrchestratorError::Terminal(Phase::Failed))));
}

#[tokio::test]
async fn cancelled_pacing_still_runs_later_phases() {
    let h = Harness::new(MockTransport::new());
    h.cancel.cancel();
    let side = side_input_file(2);
    let report = h
        .orchestrator(events(5), side.clone(), 1000, FailurePolicy::FailFast)
        .run()
        .await
        .unwrap();

    let pacing = report.pacing.unwrap();
    assert_eq!(pacing.state, LoopState::Stopped);
    assert_eq!(pacing.emitted, 0);
    assert_eq!(report.events.unwrap().attempted, 0);
    assert_eq!(report.side_inputs.unwrap().delivered, 2);

    std::fs::remove_file(side).ok();
}
