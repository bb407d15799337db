//! Transport abstraction: trait, types, and builder factory.

pub mod config;
#[cfg(feature = "transport-kafka")]
pub mod kafka;
#[cfg(any(test, feature = "transport-mock"))]
pub mod mock;
#[cfg(feature = "transport-mqtt")]
pub mod mqtt;

use std::collections::BTreeMap;

use bytes::Bytes;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Kafka,
    Mqtt,
    #[cfg(any(test, feature = "transport-mock"))]
    Mock,
}

impl Engine {
    /// Broker address used when `bootstrap.servers` is not configured.
    pub fn default_bootstrap(self) -> &'static str {
        match self {
            Engine::Kafka => "127.0.0.1:9092",
            Engine::Mqtt => "127.0.0.1:1883",
            #[cfg(any(test, feature = "transport-mock"))]
            Engine::Mock => "in-process",
        }
    }
}

/// Flat key-value broker options (`bootstrap.servers`, `client.id`, ...).
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub params: BTreeMap<String, String>,
}

impl ConnectOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("subscribe: {0}")]
    Subscribe(String),
    #[error("timeout")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
    #[error("other: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Disconnected)
    }
}

#[derive(Clone, Debug)]
pub struct TransportMessage {
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

pub type MessageHandler = Box<dyn Fn(TransportMessage) + Send + Sync + 'static>;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // Handler-based subscribe. Returns once the subscription is established;
    // the handle must be kept alive, dropping or shutdown stops delivery.
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, TransportError>;
    // Pre-declare publisher for repeated publish on the same topic.
    async fn create_publisher(&self, topic: &str) -> Result<Box<dyn Publisher>, TransportError>;
    async fn shutdown(&self) -> Result<(), TransportError>;
    async fn health_check(&self) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
pub trait Subscription: Send + Sync {
    async fn shutdown(&self) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Resolves once the broker has acknowledged (or rejected) the record.
    async fn publish(&self, key: Option<Bytes>, payload: Bytes) -> Result<(), TransportError>;
    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct TransportBuilder;

impl TransportBuilder {
    pub async fn connect(
        engine: Engine,
        opts: ConnectOptions,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match engine {
            Engine::Kafka => {
                #[cfg(feature = "transport-kafka")]
                {
                    crate::transport::kafka::connect(opts).await
                }
                #[cfg(not(feature = "transport-kafka"))]
                {
                    let _ = opts;
                    Err(TransportError::Connect("kafka feature disabled".into()))
                }
            }
            Engine::Mqtt => {
                #[cfg(feature = "transport-mqtt")]
                {
                    crate::transport::mqtt::connect(opts).await
                }
                #[cfg(not(feature = "transport-mqtt"))]
                {
                    let _ = opts;
                    Err(TransportError::Connect("mqtt feature disabled".into()))
                }
            }
            #[cfg(any(test, feature = "transport-mock"))]
            Engine::Mock => crate::transport::mock::connect(opts).await,
        }
    }
}
