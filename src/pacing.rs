//! Paced release of generated events.
//!
//! [`PacedEventLoop`] drains an [`EventGenerator`], holding each event back
//! until the clock reaches its recorded wall-clock timestamp, then hands it to
//! an [`EventSink`]. Events may arrive late if the sink lags; never early.

use crate::clock::Clock;
use crate::event::{Event, MessageBatch};
use crate::generator::EventGenerator;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("decode: {0}")]
    Decode(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Per-event downstream hook.
#[async_trait::async_trait]
pub trait EventSink: Send {
    async fn collect(&mut self, event: Event) -> Result<(), SinkError>;
}

/// Checks each payload is well-formed JSON and keeps its text untouched, in
/// arrival order, for the publish phase.
#[derive(Debug, Default)]
pub struct JsonSink {
    records: Vec<String>,
}

impl JsonSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drain collected records into a batch of JSON strings.
    pub fn take_batch(&mut self) -> MessageBatch {
        MessageBatch::new(std::mem::take(&mut self.records))
    }
}

#[async_trait::async_trait]
impl EventSink for JsonSink {
    async fn collect(&mut self, event: Event) -> Result<(), SinkError> {
        serde_json::from_str::<serde::de::IgnoredAny>(&event.payload)
            .map_err(|e| SinkError::Decode(e.to_string()))?;
        self.records.push(event.payload);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    /// Cancelled before the generator ran out.
    Stopped,
    /// Generator has no more events.
    Exhausted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exhausted)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PacingError {
    #[error("pacing loop already finished ({0:?})")]
    AlreadyFinished(LoopState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub state: LoopState,
    /// Events handed to the sink, including ones it rejected.
    pub emitted: u64,
    pub sink_errors: u64,
    /// Events released after their timestamp had already passed.
    pub late: u64,
    pub max_lateness_ms: i64,
}

pub struct PacedEventLoop<G> {
    generator: G,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    granularity: Duration,
    state: LoopState,
}

impl<G: EventGenerator> PacedEventLoop<G> {
    pub fn new(generator: G, clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            generator,
            clock,
            cancel,
            granularity: Duration::from_millis(1),
            state: LoopState::Idle,
        }
    }

    /// Round every pacing wait up to a multiple of `granularity`.
    /// One second reproduces coarse whole-second pacing.
    pub fn with_granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity.max(Duration::from_millis(1));
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn rounded_delay(&self, delay_ms: i64) -> Duration {
        let step = self.granularity.as_millis().max(1) as u64;
        let delay_ms = delay_ms as u64;
        Duration::from_millis(delay_ms.div_ceil(step) * step)
    }

    pub async fn run<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> Result<LoopReport, PacingError> {
        if self.state.is_terminal() {
            return Err(PacingError::AlreadyFinished(self.state));
        }
        self.state = LoopState::Running;
        let mut report = LoopReport {
            state: LoopState::Running,
            emitted: 0,
            sink_errors: 0,
            late: 0,
            max_lateness_ms: 0,
        };

        loop {
            if self.cancel.is_cancelled() {
                self.state = LoopState::Stopped;
                break;
            }
            let Some(event) = self.generator.next_event() else {
                self.state = LoopState::Exhausted;
                break;
            };

            let delay_ms = event.wallclock_timestamp - self.clock.now_millis();
            if delay_ms > 0 {
                let wait = self.rounded_delay(delay_ms);
                tokio::select! {
                    _ = self.clock.sleep(wait) => {}
                    _ = self.cancel.cancelled() => {
                        tracing::debug!(ts = event.wallclock_timestamp, "cancelled while pacing");
                        self.state = LoopState::Stopped;
                        break;
                    }
                }
            } else if delay_ms < 0 {
                report.late += 1;
                report.max_lateness_ms = report.max_lateness_ms.max(-delay_ms);
            }

            let ts = event.wallclock_timestamp;
            report.emitted += 1;
            if let Err(e) = sink.collect(event).await {
                report.sink_errors += 1;
                tracing::warn!(error = %e, ts, "sink rejected event");
            }
        }

        report.state = self.state;
        tracing::info!(
            state = ?report.state,
            emitted = report.emitted,
            sink_errors = report.sink_errors,
            late = report.late,
            "pacing loop finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    const T0: i64 = 1_700_000_000_000;

    /// Records the clock reading at each release.
    struct RecordingSink {
        clock: Arc<VirtualClock>,
        released: Vec<(i64, Event)>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl RecordingSink {
        fn new(clock: Arc<VirtualClock>) -> Self {
            Self { clock, released: Vec::new(), cancel_after: None }
        }
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn collect(&mut self, event: Event) -> Result<(), SinkError> {
            self.released.push((self.clock.now_millis(), event));
            if let Some((n, token)) = &self.cancel_after {
                if self.released.len() >= *n {
                    token.cancel();
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn releases_events_no_earlier_than_their_timestamp() {
        let clock = Arc::new(VirtualClock::new(T0));
        let events = vec![Event::new(T0, "A"), Event::new(T0 + 2_000, "B")];
        let mut pacer = PacedEventLoop::new(events.into_iter(), clock.clone(), CancellationToken::new());
        let mut sink = RecordingSink::new(clock.clone());

        let report = pacer.run(&mut sink).await.unwrap();

        assert_eq!(report.state, LoopState::Exhausted);
        assert_eq!(report.emitted, 2);
        assert_eq!(sink.released[0].0, T0);
        assert!(sink.released[1].0 >= T0 + 2_000);
        for (released_at, event) in &sink.released {
            assert!(*released_at >= event.wallclock_timestamp);
        }
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(2_000)]);
    }

    #[tokio::test]
    async fn preserves_generator_order() {
        let clock = Arc::new(VirtualClock::new(T0));
        let events: Vec<Event> = (0..20).map(|i| Event::new(T0 + i * 50, format!("e{i}"))).collect();
        let mut pacer = PacedEventLoop::new(events.clone().into_iter(), clock.clone(), CancellationToken::new());
        let mut sink = RecordingSink::new(clock);
        pacer.run(&mut sink).await.unwrap();
        let got: Vec<Event> = sink.released.into_iter().map(|(_, e)| e).collect();
        assert_eq!(got, events);
    }

    #[tokio::test]
    async fn stops_once_cancelled() {
        let clock = Arc::new(VirtualClock::new(T0));
        let token = CancellationToken::new();
        let events: Vec<Event> = (0..5).map(|i| Event::new(T0 + i * 100, format!("e{i}"))).collect();
        let mut pacer = PacedEventLoop::new(events.into_iter(), clock.clone(), token.clone());
        let mut sink = RecordingSink::new(clock);
        sink.cancel_after = Some((1, token));

        let report = pacer.run(&mut sink).await.unwrap();

        assert_eq!(report.state, LoopState::Stopped);
        assert_eq!(sink.released.len(), 1);
        assert!(matches!(pacer.run(&mut sink).await, Err(PacingError::AlreadyFinished(LoopState::Stopped))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_pacing_wait() {
        let clock = Arc::new(crate::clock::SystemClock);
        let token = CancellationToken::new();
        let far_future = clock.now_millis() + 3_600_000;
        let events = vec![Event::new(far_future, "late")];
        let mut pacer = PacedEventLoop::new(events.into_iter(), clock, token.clone());
        let mut sink = JsonSink::new();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let report = pacer.run(&mut sink).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(report.state, LoopState::Stopped);
        assert_eq!(report.emitted, 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn sink_errors_do_not_stop_the_loop() {
        let clock = Arc::new(VirtualClock::new(T0));
        let events = vec![
            Event::new(T0, r#"{"n":1}"#),
            Event::new(T0, "not json"),
            Event::new(T0, r#"{"n":3}"#),
        ];
        let mut pacer = PacedEventLoop::new(events.into_iter(), clock, CancellationToken::new());
        let mut sink = JsonSink::new();

        let report = pacer.run(&mut sink).await.unwrap();

        assert_eq!(report.emitted, 3);
        assert_eq!(report.sink_errors, 1);
        assert_eq!(sink.take_batch().into_messages(), vec![r#"{"n":1}"#, r#"{"n":3}"#]);
    }

    #[tokio::test]
    async fn json_sink_forwards_payload_text_verbatim() {
        let payload = r#"{"event_type":"bid","price":12,"auction":3, "bidder":"z"}"#;
        let mut sink = JsonSink::new();
        sink.collect(Event::new(T0, payload)).await.unwrap();
        assert!(sink.collect(Event::new(T0, r#"{"open":"#)).await.is_err());
        assert_eq!(sink.take_batch().into_messages(), vec![payload.to_string()]);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn coarse_granularity_rounds_waits_up() {
        let clock = Arc::new(VirtualClock::new(T0));
        let events = vec![Event::new(T0 + 1_200, r#"{}"#)];
        let mut pacer = PacedEventLoop::new(events.into_iter(), clock.clone(), CancellationToken::new())
            .with_granularity(Duration::from_secs(1));
        pacer.run(&mut JsonSink::new()).await.unwrap();
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn counts_late_events() {
        let clock = Arc::new(VirtualClock::new(T0 + 500));
        let events = vec![Event::new(T0, r#"{}"#), Event::new(T0 + 100, r#"{}"#)];
        let mut pacer = PacedEventLoop::new(events.into_iter(), clock.clone(), CancellationToken::new());
        let report = pacer.run(&mut JsonSink::new()).await.unwrap();
        assert_eq!(report.late, 2);
        assert_eq!(report.max_lateness_ms, 500);
        assert!(clock.sleeps().is_empty());
    }
}
