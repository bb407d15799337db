//! Kafka adapter (feature `transport-kafka`), using rdkafka's `FutureProducer`
//! and `StreamConsumer`.
//!
//! Connect options are passed straight through to librdkafka, except the
//! harness-only keys in [`HARNESS_KEYS`].
use crate::transport::{
    ConnectOptions, MessageHandler, Publisher, Subscription, Transport, TransportError,
    TransportMessage,
};
use bytes::Bytes;
use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Options consumed by the harness itself, never handed to librdkafka.
pub const HARNESS_KEYS: [&str; 3] = ["key.codec", "value.codec", "delivery.timeout.ms"];

const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KafkaTransport {
    base: ClientConfig,
    producer: Arc<FutureProducer>,
    delivery_timeout: Duration,
}

fn client_config(opts: &ConnectOptions) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (k, v) in &opts.params {
        if HARNESS_KEYS.contains(&k.as_str()) {
            continue;
        }
        config.set(k, v);
    }
    config
}

pub async fn connect(opts: ConnectOptions) -> Result<Box<dyn Transport>, TransportError> {
    if opts.get("bootstrap.servers").is_none() {
        return Err(TransportError::Connect("bootstrap.servers is required".into()));
    }
    let base = client_config(&opts);
    let producer: FutureProducer = base
        .create()
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let delivery_timeout = opts
        .get("delivery.timeout.ms")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_DELIVERY_TIMEOUT);
    Ok(Box::new(KafkaTransport {
        base,
        producer: Arc::new(producer),
        delivery_timeout,
    }))
}

#[async_trait::async_trait]
impl Transport for KafkaTransport {
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let mut config = self.base.clone();
        if config.get("group.id").is_none() {
            let group = format!(
                "{}-{topic}",
                config.get("client.id").unwrap_or("nexmark-replay")
            );
            config.set("group.id", group);
        }
        config.set("auto.offset.reset", "earliest");
        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        let topic = topic.to_string();
        let handle: JoinHandle<()> = tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(m) => {
                        (handler)(TransportMessage {
                            key: m.key().map(Bytes::copy_from_slice),
                            payload: m.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, topic = %topic, "kafka consumer error");
                    }
                }
            }
        });
        Ok(Box::new(KafkaSubscription { handle }))
    }

    async fn create_publisher(&self, topic: &str) -> Result<Box<dyn Publisher>, TransportError> {
        Ok(Box::new(KafkaPublisher {
            producer: self.producer.clone(),
            topic: topic.to_string(),
            delivery_timeout: self.delivery_timeout,
        }))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.producer
            .flush(Timeout::After(self.delivery_timeout))
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        self.producer
            .client()
            .fetch_metadata(None, Timeout::After(Duration::from_secs(5)))
            .map(|_| ())
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

struct KafkaPublisher {
    producer: Arc<FutureProducer>,
    topic: String,
    delivery_timeout: Duration,
}

#[async_trait::async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, key: Option<Bytes>, payload: Bytes) -> Result<(), TransportError> {
        let mut record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&self.topic).payload(payload.as_ref());
        if let Some(ref key) = key {
            record = record.key(key.as_ref());
        }
        self.producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _msg)| TransportError::Publish(e.to_string()))
    }
}

struct KafkaSubscription {
    handle: JoinHandle<()>,
}

#[async_trait::async_trait]
impl Subscription for KafkaSubscription {
    async fn shutdown(&self) -> Result<(), TransportError> {
        self.handle.abort();
        Ok(())
    }
}
