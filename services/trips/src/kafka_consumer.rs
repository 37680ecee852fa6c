use crate::config::KafkaConfig;
use crate::geo::Point;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// CloudEvent type whose vehicle events record a device/token mapping
pub const VEHICLE_MINT_EVENT_TYPE: &str = "com.dimo.zone.device.mint";

/// Errors that can occur while consuming from the bus
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Message has no payload")]
    MissingPayload,

    #[error("Message arrived on unsubscribed topic {0}")]
    UnknownTopic(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(#[from] serde_json::Error),
}

/// CloudEvents envelope shared by every topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudEvent<T> {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub specversion: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "type", default)]
    pub event_type: String,
    pub data: T,
}

impl<T> CloudEvent<T> {
    /// Same envelope around a different payload
    pub fn with_data<U>(self, data: U) -> CloudEvent<U> {
        CloudEvent {
            id: self.id,
            source: self.source,
            specversion: self.specversion,
            subject: self.subject,
            time: self.time,
            event_type: self.event_type,
            data,
        }
    }
}

/// One end of a segment: when, and where if the device knew
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<Point>,
}

/// Segment lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEvent {
    /// Segment id, unique across all vehicles
    pub id: String,
    /// External user-device id
    pub device_id: String,
    /// False on begin, true on complete
    #[serde(default)]
    pub completed: bool,
    pub start: Endpoint,
    /// Present only once the segment has completed
    #[serde(default)]
    pub end: Option<Endpoint>,
}

/// Vehicle identity event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleMintEvent {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub device: MintedDevice,
    pub nft: MintedNft,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MintedDevice {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MintedNft {
    pub token_id: i64,
}

/// Position of a message on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Delivery {
    fn of(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        }
    }
}

/// A decoded event waiting for a worker
#[derive(Debug, Clone)]
pub struct Task<E> {
    pub event: CloudEvent<E>,
    pub delivery: Delivery,
}

/// Records that a delivery no longer needs redelivery
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, delivery: &Delivery);
}

/// A decoded message, tagged with the queue it belongs in
#[derive(Debug)]
pub enum InboundTask {
    Segment(Task<SegmentEvent>),
    Vehicle(Task<VehicleMintEvent>),
    /// Vehicle topic event of a type nothing here consumes
    Ignored {
        delivery: Delivery,
        event_type: String,
    },
}

/// Maps subscribed topics onto event types
#[derive(Debug, Clone)]
pub struct TopicRouter {
    segment_topic: String,
    vehicle_topic: String,
}

impl TopicRouter {
    pub fn new(segment_topic: impl Into<String>, vehicle_topic: impl Into<String>) -> Self {
        Self {
            segment_topic: segment_topic.into(),
            vehicle_topic: vehicle_topic.into(),
        }
    }

    /// Decode `payload` according to the topic it arrived on. Vehicle events
    /// other than mints are passed through without decoding their data.
    pub fn decode(
        &self,
        delivery: Delivery,
        payload: Option<&[u8]>,
    ) -> Result<InboundTask, ConsumerError> {
        let payload = payload.ok_or(ConsumerError::MissingPayload)?;

        if delivery.topic == self.segment_topic {
            let event = serde_json::from_slice(payload)?;
            Ok(InboundTask::Segment(Task { event, delivery }))
        } else if delivery.topic == self.vehicle_topic {
            let mut envelope: CloudEvent<serde_json::Value> = serde_json::from_slice(payload)?;
            if envelope.event_type != VEHICLE_MINT_EVENT_TYPE {
                return Ok(InboundTask::Ignored {
                    delivery,
                    event_type: envelope.event_type,
                });
            }
            let data = std::mem::take(&mut envelope.data);
            let mint: VehicleMintEvent = serde_json::from_value(data)?;
            let event = envelope.with_data(mint);
            Ok(InboundTask::Vehicle(Task { event, delivery }))
        } else {
            Err(ConsumerError::UnknownTopic(delivery.topic))
        }
    }
}

/// Kafka subscription feeding the segment and vehicle queues
pub struct TripsKafkaConsumer {
    consumer: StreamConsumer,
    router: TopicRouter,
}

impl TripsKafkaConsumer {
    /// Create a consumer subscribed to both event topics
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.segment_topic, &config.vehicle_topic])
            .context("Failed to subscribe to trip event topics")?;

        info!(
            segment_topic = %config.segment_topic,
            vehicle_topic = %config.vehicle_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topics"
        );

        Ok(Self {
            consumer,
            router: TopicRouter::new(&config.segment_topic, &config.vehicle_topic),
        })
    }

    /// Poll the bus and push decoded events into the worker queues until
    /// `shutdown` fires or a queue closes
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        segments: mpsc::Sender<Task<SegmentEvent>>,
        vehicles: mpsc::Sender<Task<VehicleMintEvent>>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("Starting trips Kafka consumer");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.consumer.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("trips.kafka.errors").increment(1);
                    continue;
                }
            };

            let delivery = Delivery::of(&message);
            let task = match self.router.decode(delivery.clone(), message.payload()) {
                Ok(task) => task,
                Err(e) => {
                    warn!(
                        error = %e,
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        class = "invalid",
                        "Dropping undecodable message"
                    );
                    metrics::counter!("trips.events.undecodable").increment(1);
                    self.acknowledge(&delivery);
                    continue;
                }
            };

            // A full queue parks the loop here, which stops polling the bus.
            let sent = match task {
                InboundTask::Segment(task) => {
                    debug!(segment_id = %task.event.data.id, "Queueing segment event");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = segments.send(task) => sent.is_ok(),
                    }
                }
                InboundTask::Vehicle(task) => {
                    debug!(event_type = %task.event.event_type, "Queueing vehicle event");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = vehicles.send(task) => sent.is_ok(),
                    }
                }
                InboundTask::Ignored {
                    delivery,
                    event_type,
                } => {
                    debug!(event_type = %event_type, "Ignoring vehicle event");
                    metrics::counter!("trips.events.ignored").increment(1);
                    self.acknowledge(&delivery);
                    true
                }
            };

            if !sent {
                warn!("Worker queue closed, stopping consumer");
                break;
            }
        }

        info!("Trips Kafka consumer stopped");
        Ok(())
    }
}

impl Acknowledger for TripsKafkaConsumer {
    fn acknowledge(&self, delivery: &Delivery) {
        // The stored offset names the next message to read.
        if let Err(e) = self
            .consumer
            .store_offset(&delivery.topic, delivery.partition, delivery.offset + 1)
        {
            warn!(
                error = %e,
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                "Failed to store offset"
            );
        }
    }
}
