//! In-process broker (feature `transport-mock`) with fault injection.
//!
//! Every subscriber on a topic sees every record published to it. Options:
//! `fail.at` (comma-separated 0-based publish indices to reject),
//! `fail.subscribe` (`true` rejects subscriptions), `publish.delay.ms`.
use crate::transport::{
    ConnectOptions, MessageHandler, Publisher, Subscription, Transport, TransportError,
    TransportMessage,
};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

type HandlerTable = BTreeMap<String, Vec<(u64, Arc<MessageHandler>)>>;

#[derive(Default)]
struct Broker {
    handlers: Mutex<HandlerTable>,
    published: Mutex<Vec<PublishedRecord>>,
    attempts: AtomicUsize,
    next_sub_id: AtomicU64,
    fail_at: BTreeSet<usize>,
    fail_subscribe: bool,
    publish_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    broker: Arc<Broker>,
}

pub async fn connect(opts: ConnectOptions) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(MockTransport::from_options(&opts)?))
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_options(opts: &ConnectOptions) -> Result<Self, TransportError> {
        let fail_at = match opts.get("fail.at") {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    s.trim()
                        .parse::<usize>()
                        .map_err(|e| TransportError::Connect(format!("fail.at: {e}")))
                })
                .collect::<Result<BTreeSet<_>, _>>()?,
            None => BTreeSet::new(),
        };
        let publish_delay = opts
            .get("publish.delay.ms")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis);
        Ok(Self {
            broker: Arc::new(Broker {
                fail_at,
                fail_subscribe: opts.get("fail.subscribe") == Some("true"),
                publish_delay,
                ..Default::default()
            }),
        })
    }

    /// Reject the publish attempts with these 0-based indices.
    pub fn failing_at(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            broker: Arc::new(Broker {
                fail_at: indices.into_iter().collect(),
                ..Default::default()
            }),
        }
    }

    /// Accepted records, in acknowledgement order.
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.broker
            .published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedRecord> {
        self.published()
            .into_iter()
            .filter(|r| r.topic == topic)
            .collect()
    }

    /// Publish calls received, accepted or not.
    pub fn attempts(&self) -> usize {
        self.broker.attempts.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.broker
            .handlers
            .lock()
            .map(|h| h.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        if self.broker.fail_subscribe {
            return Err(TransportError::Subscribe(format!("mock rejected subscription to {topic}")));
        }
        let id = self.broker.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.broker
            .handlers
            .lock()
            .map_err(|e| TransportError::Other(e.to_string()))?
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Ok(Box::new(MockSubscription {
            broker: self.broker.clone(),
            topic: topic.to_string(),
            id,
        }))
    }

    async fn create_publisher(&self, topic: &str) -> Result<Box<dyn Publisher>, TransportError> {
        Ok(Box::new(MockPublisher {
            broker: self.broker.clone(),
            topic: topic.to_string(),
        }))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if let Ok(mut h) = self.broker.handlers.lock() {
            h.clear();
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MockPublisher {
    broker: Arc<Broker>,
    topic: String,
}

#[async_trait::async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, key: Option<Bytes>, payload: Bytes) -> Result<(), TransportError> {
        let attempt = self.broker.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.broker.publish_delay {
            tokio::time::sleep(delay).await;
        }
        if self.broker.fail_at.contains(&attempt) {
            return Err(TransportError::Publish(format!(
                "mock rejected attempt #{attempt} on {}",
                self.topic
            )));
        }
        self.broker
            .published
            .lock()
            .map_err(|e| TransportError::Other(e.to_string()))?
            .push(PublishedRecord {
                topic: self.topic.clone(),
                key: key.clone(),
                payload: payload.clone(),
            });
        // Snapshot handlers so none run under the lock.
        let handlers: Vec<Arc<MessageHandler>> = self
            .broker
            .handlers
            .lock()
            .map(|h| {
                h.get(&self.topic)
                    .map(|subs| subs.iter().map(|(_, f)| f.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        for handler in handlers {
            (handler)(TransportMessage {
                key: key.clone(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }
}

struct MockSubscription {
    broker: Arc<Broker>,
    topic: String,
    id: u64,
}

#[async_trait::async_trait]
impl Subscription for MockSubscription {
    async fn shutdown(&self) -> Result<(), TransportError> {
        if let Ok(mut h) = self.broker.handlers.lock() {
            if let Some(subs) = h.get_mut(&self.topic) {
                subs.retain(|(id, _)| *id != self.id);
            }
        }
        Ok(())
    }
}
