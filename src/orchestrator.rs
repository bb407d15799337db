//! End-to-end run as an ordered state machine.
//!
//! ```text
//! Pacing -> StartEventConsumer -> EventConsumerWarmup -> PublishEvents
//!        -> EventSettle -> StartSideInputConsumer -> SideInputConsumerWarmup
//!        -> PublishSideInputs -> SideInputSettle -> Finished
//! ```
//!
//! Any phase error moves to `Failed`. Both `Finished` and `Failed` are
//! terminal. [`PhaseOrchestrator::step`] runs exactly one phase so tests can
//! drive the run phase by phase against a virtual clock.

use crate::clock::Clock;
use crate::consumer::ConsumerGroup;
use crate::dispatch::{DispatchError, DispatchSummary, KeyCodec, PublishWorkerPool};
use crate::event::Topic;
use crate::generator::EventGenerator;
use crate::metrics::stats::StatsSnapshot;
use crate::pacing::{JsonSink, LoopReport, PacedEventLoop, PacingError};
use crate::side_input::{SideInputError, SideInputSource};
use crate::transport::{Transport, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pacing,
    StartEventConsumer,
    EventConsumerWarmup,
    PublishEvents,
    EventSettle,
    StartSideInputConsumer,
    SideInputConsumerWarmup,
    PublishSideInputs,
    SideInputSettle,
    Finished,
    Failed,
}

impl Phase {
    pub fn next(self) -> Option<Phase> {
        use Phase::*;
        match self {
            Pacing => Some(StartEventConsumer),
            StartEventConsumer => Some(EventConsumerWarmup),
            EventConsumerWarmup => Some(PublishEvents),
            PublishEvents => Some(EventSettle),
            EventSettle => Some(StartSideInputConsumer),
            StartSideInputConsumer => Some(SideInputConsumerWarmup),
            SideInputConsumerWarmup => Some(PublishSideInputs),
            PublishSideInputs => Some(SideInputSettle),
            SideInputSettle => Some(Finished),
            Finished | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Pacing => "pacing",
            Phase::StartEventConsumer => "start-event-consumer",
            Phase::EventConsumerWarmup => "event-consumer-warmup",
            Phase::PublishEvents => "publish-events",
            Phase::EventSettle => "event-settle",
            Phase::StartSideInputConsumer => "start-side-input-consumer",
            Phase::SideInputConsumerWarmup => "side-input-consumer-warmup",
            Phase::PublishSideInputs => "publish-side-inputs",
            Phase::SideInputSettle => "side-input-settle",
            Phase::Finished => "finished",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PhaseError {
    #[error(transparent)]
    Pacing(#[from] PacingError),
    #[error("consumer: {0}")]
    Consumer(#[from] TransportError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    SideInput(#[from] SideInputError),
}

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("phase {phase} failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: PhaseError,
    },
    #[error("run already {0}")]
    Terminal(Phase),
}

#[derive(Debug, Clone)]
pub struct Waits {
    /// After a consumer group reports ready, before publishing to it.
    pub consumer_warmup: Duration,
    /// Upper bound on waiting for the event consumers to catch up.
    pub events_settle: Duration,
    /// Upper bound on waiting for the side-input consumers to catch up.
    pub side_inputs_settle: Duration,
    pub settle_poll: Duration,
}

impl Default for Waits {
    fn default() -> Self {
        Self {
            consumer_warmup: Duration::from_secs(60),
            events_settle: Duration::from_secs(100),
            side_inputs_settle: Duration::from_secs(60),
            settle_poll: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub events_topic: Topic,
    pub side_inputs_topic: Topic,
    /// Publish workers and consumers per group.
    pub workers: usize,
    pub key_codec: KeyCodec,
    pub side_input: SideInputSource,
    pub waits: Waits,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub pacing: Option<LoopReport>,
    pub events: Option<DispatchSummary>,
    pub side_inputs: Option<DispatchSummary>,
    pub events_consumed: Option<StatsSnapshot>,
    pub side_inputs_consumed: Option<StatsSnapshot>,
    /// Phases in the order they completed.
    pub completed: Vec<Phase>,
}

pub struct PhaseOrchestrator<G> {
    phase: Phase,
    config: OrchestratorConfig,
    pacer: PacedEventLoop<G>,
    sink: JsonSink,
    pool: PublishWorkerPool,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    events_consumer: Option<ConsumerGroup>,
    side_inputs_consumer: Option<ConsumerGroup>,
    report: RunReport,
}

impl<G: EventGenerator> PhaseOrchestrator<G> {
    pub fn new(
        config: OrchestratorConfig,
        pacer: PacedEventLoop<G>,
        pool: PublishWorkerPool,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            phase: Phase::Pacing,
            config,
            pacer,
            sink: JsonSink::new(),
            pool,
            transport,
            clock,
            events_consumer: None,
            side_inputs_consumer: None,
            report: RunReport::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Run the current phase and advance. Returns the phase now current.
    pub async fn step(&mut self) -> Result<Phase, OrchestratorError> {
        let phase = self.phase;
        let Some(next) = phase.next() else {
            return Err(OrchestratorError::Terminal(phase));
        };
        tracing::info!(phase = %phase, "phase started");
        if let Err(source) = self.execute(phase).await {
            tracing::error!(phase = %phase, error = %source, "phase failed");
            self.phase = Phase::Failed;
            self.stop_consumers().await;
            return Err(OrchestratorError::Phase { phase, source });
        }
        self.report.completed.push(phase);
        self.phase = next;
        if next == Phase::Finished {
            self.stop_consumers().await;
        }
        Ok(next)
    }

    /// Step until `Finished`; the first phase error aborts the run.
    pub async fn run(mut self) -> Result<RunReport, OrchestratorError> {
        while !self.phase.is_terminal() {
            self.step().await?;
        }
        Ok(self.report)
    }

    async fn execute(&mut self, phase: Phase) -> Result<(), PhaseError> {
        match phase {
            Phase::Pacing => {
                let report = self.pacer.run(&mut self.sink).await?;
                self.report.pacing = Some(report);
            }
            Phase::StartEventConsumer => {
                let group = self.start_consumer(&self.config.events_topic).await?;
                self.events_consumer = Some(group);
            }
            Phase::EventConsumerWarmup | Phase::SideInputConsumerWarmup => {
                self.clock.sleep(self.config.waits.consumer_warmup).await;
            }
            Phase::PublishEvents => {
                let batch = self.sink.take_batch();
                let summary = self.pool.dispatch(batch, &self.config.events_topic).await?;
                self.report.events = Some(summary);
            }
            Phase::EventSettle => {
                let expected = self.report.events.as_ref().map_or(0, |s| s.delivered);
                settle(
                    self.events_consumer.as_ref(),
                    expected,
                    self.config.waits.events_settle,
                    self.config.waits.settle_poll,
                    self.clock.as_ref(),
                )
                .await;
            }
            Phase::StartSideInputConsumer => {
                let group = self.start_consumer(&self.config.side_inputs_topic).await?;
                self.side_inputs_consumer = Some(group);
            }
            Phase::PublishSideInputs => {
                let batch = self.config.side_input.load().await?;
                tracing::info!(records = batch.len(), "side input batch prepared");
                let summary = self
                    .pool
                    .dispatch(batch, &self.config.side_inputs_topic)
                    .await?;
                self.report.side_inputs = Some(summary);
            }
            Phase::SideInputSettle => {
                let expected = self.report.side_inputs.as_ref().map_or(0, |s| s.delivered);
                settle(
                    self.side_inputs_consumer.as_ref(),
                    expected,
                    self.config.waits.side_inputs_settle,
                    self.config.waits.settle_poll,
                    self.clock.as_ref(),
                )
                .await;
            }
            Phase::Finished | Phase::Failed => {}
        }
        Ok(())
    }

    async fn start_consumer(&self, topic: &Topic) -> Result<ConsumerGroup, TransportError> {
        ConsumerGroup::start(
            self.transport.as_ref(),
            topic,
            self.config.workers,
            self.clock.clone(),
            self.config.key_codec,
        )
        .await
    }

    async fn stop_consumers(&mut self) {
        if let Some(group) = self.events_consumer.take() {
            self.report.events_consumed = Some(group.shutdown().await);
        }
        if let Some(group) = self.side_inputs_consumer.take() {
            self.report.side_inputs_consumed = Some(group.shutdown().await);
        }
    }
}

/// Wait until the group has seen `expected` messages or `deadline` elapses.
async fn settle(
    group: Option<&ConsumerGroup>,
    expected: usize,
    deadline: Duration,
    poll: Duration,
    clock: &dyn Clock,
) {
    let Some(group) = group else {
        clock.sleep(deadline).await;
        return;
    };
    let poll = poll.max(Duration::from_millis(1));
    let started = clock.now_millis();
    loop {
        let received = group.received().await;
        if received >= expected as u64 {
            tracing::info!(topic = %group.topic(), received, expected, "consumers caught up");
            return;
        }
        let waited = Duration::from_millis((clock.now_millis() - started).max(0) as u64);
        if waited >= deadline {
            tracing::warn!(
                topic = %group.topic(),
                received,
                expected,
                waited = ?waited,
                "settle deadline passed before consumers caught up"
            );
            return;
        }
        clock.sleep(poll.min(deadline - waited)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order_and_end() {
        let mut phase = Phase::Pacing;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(seen.last(), Some(&Phase::Finished));
        assert!(Phase::Failed.is_terminal());
        assert_eq!(Phase::PublishSideInputs.to_string(), "publish-side-inputs");
    }
}
