//! Consumer side of a run: N subscriptions on one topic, counting receipts.
//!
//! [`ConsumerGroup::start`] returns only after every subscription is
//! established, which is the readiness signal the orchestrator waits on.
//! Message handling happens off the transport callback: the callback stamps
//! the receive time and enqueues, a worker task decodes keys and records
//! end-to-end latency.

use crate::clock::Clock;
use crate::dispatch::KeyCodec;
use crate::event::Topic;
use crate::metrics::stats::{Stats, StatsSnapshot};
use crate::transport::{Subscription, Transport, TransportError, TransportMessage};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct ConsumerGroup {
    topic: Topic,
    subscriptions: Vec<Box<dyn Subscription>>,
    stats: Arc<Stats>,
    worker: JoinHandle<()>,
}

impl ConsumerGroup {
    pub async fn start(
        transport: &dyn Transport,
        topic: &Topic,
        consumers: usize,
        clock: Arc<dyn Clock>,
        key_codec: KeyCodec,
    ) -> Result<Self, TransportError> {
        let stats = Arc::new(Stats::new());
        let (tx, rx) = flume::unbounded::<(i64, Option<Bytes>)>();

        let stats_worker = stats.clone();
        let worker = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(1024);
            loop {
                let first = match rx.recv_async().await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                buf.clear();
                buf.push(first);
                // Drain what is already queued to amortize locking
                while let Ok(v) = rx.try_recv() {
                    buf.push(v);
                    if buf.len() >= 1024 {
                        break;
                    }
                }
                let lats: Vec<Option<u64>> = buf
                    .drain(..)
                    .map(|(recv_ms, key)| {
                        let sent_ms = key_codec.decode(key.as_deref()?)?;
                        Some(recv_ms.saturating_sub(sent_ms).max(0) as u64 * 1_000)
                    })
                    .collect();
                stats_worker.record_received_batch(&lats).await;
            }
        });

        let mut subscriptions = Vec::with_capacity(consumers);
        for consumer in 0..consumers.max(1) {
            let handler_tx = tx.clone();
            let clock = clock.clone();
            let subscription = transport
                .subscribe(
                    topic.as_str(),
                    Box::new(move |msg: TransportMessage| {
                        let _ = handler_tx.send((clock.now_millis(), msg.key));
                    }),
                )
                .await;
            match subscription {
                Ok(s) => subscriptions.push(s),
                Err(e) => {
                    for s in &subscriptions {
                        let _ = s.shutdown().await;
                    }
                    worker.abort();
                    return Err(e);
                }
            }
            tracing::debug!(topic = %topic, consumer, "consumer subscribed");
        }
        tracing::info!(topic = %topic, consumers = subscriptions.len(), "consumer group ready");

        Ok(Self {
            topic: topic.clone(),
            subscriptions,
            stats,
            worker,
        })
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn consumers(&self) -> usize {
        self.subscriptions.len()
    }

    /// Messages recorded so far across all consumers.
    pub async fn received(&self) -> u64 {
        self.stats.received().await
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot().await
    }

    pub async fn shutdown(self) -> StatsSnapshot {
        for s in &self.subscriptions {
            if let Err(e) = s.shutdown().await {
                tracing::warn!(topic = %self.topic, error = %e, "subscription shutdown failed");
            }
        }
        // Dropping the subscriptions releases the handlers' senders, which
        // lets the worker drain and exit.
        drop(self.subscriptions);
        let _ = self.worker.await;
        let snap = self.stats.snapshot().await;
        tracing::info!(
            topic = %self.topic,
            received = snap.received_count,
            p99_us = snap.latency_us_p99,
            "consumer group stopped"
        );
        snap
    }
}
