//! MQTT adapter (feature `transport-mqtt`), using rumqttc (async).
//!
//! MQTT 3.1.1 has no record key, so publish keys are dropped and consumers see
//! `key: None`. Publishing resolves once the request is queued on the client.
//! Subscribing resolves only after the broker's SUBACK (bounded by
//! `mqtt.subscribe.timeout.ms`).
use crate::transport::config::first_host_port;
use crate::transport::{
    ConnectOptions, MessageHandler, Publisher, Subscription, Transport, TransportError,
    TransportMessage,
};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, SubscribeReasonCode};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct MqttTransport {
    host: String,
    port: u16,
    client_id: String,
    keep_alive: Duration,
    qos: QoS,
    subscribe_timeout: Duration,
}

const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn connect(opts: ConnectOptions) -> Result<Box<dyn Transport>, TransportError> {
    let (host, port) = first_host_port(opts.get("bootstrap.servers").unwrap_or(""), 1883);
    let client_id = opts
        .get("client.id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("nxr-{}", uuid::Uuid::new_v4()));
    let qos = match opts.get("mqtt.qos") {
        None | Some("0") => QoS::AtMostOnce,
        Some("1") => QoS::AtLeastOnce,
        Some("2") => QoS::ExactlyOnce,
        Some(other) => return Err(TransportError::Connect(format!("unknown mqtt.qos {other}"))),
    };
    let subscribe_timeout = opts
        .get("mqtt.subscribe.timeout.ms")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SUBSCRIBE_TIMEOUT);
    // Connection params are kept; each publisher/subscription gets its own client.
    Ok(Box::new(MqttTransport {
        host,
        port,
        client_id,
        keep_alive: Duration::from_secs(30),
        qos,
        subscribe_timeout,
    }))
}

impl MqttTransport {
    fn options(&self, role: &str) -> MqttOptions {
        let mut options = MqttOptions::new(
            format!("{}-{}-{}", self.client_id, role, uuid::Uuid::new_v4()),
            self.host.clone(),
            self.port,
        );
        options.set_keep_alive(self.keep_alive);
        options
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options("sub"), 100);
        client
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        // Drive the connection here until the broker confirms the subscription.
        let acked = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                        if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                            return Err(TransportError::Subscribe(format!(
                                "broker refused subscription to {topic}"
                            )));
                        }
                        return Ok(());
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        (handler)(TransportMessage {
                            key: None,
                            payload: p.payload,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => return Err(TransportError::Subscribe(e.to_string())),
                }
            }
        };
        tokio::time::timeout(self.subscribe_timeout, acked)
            .await
            .map_err(|_| {
                TransportError::Subscribe(format!(
                    "no SUBACK for {topic} within {:?}",
                    self.subscribe_timeout
                ))
            })??;
        tracing::debug!(topic, "mqtt subscription acknowledged");
        let handle: JoinHandle<()> = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        (handler)(TransportMessage {
                            key: None,
                            payload: p.payload,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "mqtt subscription closed");
                        break;
                    }
                }
            }
            drop(client);
        });
        Ok(Box::new(MqttSubscription { handle }))
    }

    async fn create_publisher(&self, topic: &str) -> Result<Box<dyn Publisher>, TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options("pub"), 100);
        let poller = tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    tracing::warn!(error = %e, "mqtt publisher connection error");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        });
        Ok(Box::new(MqttPublisher {
            client,
            topic: topic.to_string(),
            qos: self.qos,
            poller,
        }))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    qos: QoS,
    poller: JoinHandle<()>,
}

#[async_trait::async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, _key: Option<Bytes>, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish_bytes(&self.topic, self.qos, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        let _ = self.client.disconnect().await;
        self.poller.abort();
        Ok(())
    }
}

struct MqttSubscription {
    handle: JoinHandle<()>,
}

#[async_trait::async_trait]
impl Subscription for MqttSubscription {
    async fn shutdown(&self) -> Result<(), TransportError> {
        self.handle.abort();
        Ok(())
    }
}
