//! Event bus transport.
//!
//! JSON events over Kafka: `trinetra.detections` and `trinetra.identities`
//! are keyed by camera id (per-camera FIFO within a partition),
//! `trinetra.alerts` is unkeyed. Delivery is at-least-once: producers wait
//! for leader ack, consumers auto-commit offsets every second.

use std::time::Duration;

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
    ClientConfig,
};
use serde::Serialize;

use trinetra_types::{
    AlertEvent, InferenceEvent, ResolvedIdentity, ALERTS_TOPIC, DETECTIONS_TOPIC, IDENTITIES_TOPIC,
};

/// How long a send may wait for space in the producer queue.
const PRODUCER_QUEUE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kafka error: {source}")]
    Kafka {
        #[from]
        source: KafkaError,
    },
    #[error("JSON serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Producer configuration shared by the worker and the resolver.
///
/// Leader ack balances durability against latency; LZ4 keeps embedding-heavy
/// payloads small on the wire.
fn producer_config(bootstrap_servers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", bootstrap_servers)
        .set("acks", "1")
        .set("linger.ms", "5")
        .set("compression.type", "lz4")
        .set("retries", "5")
        .set("retry.backoff.ms", "100");
    config
}

/// Build the consumer the identity resolver reads `trinetra.detections` with.
pub fn build_detections_consumer(
    bootstrap_servers: &str,
    group_id: &str,
) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("group.id", group_id)
        .set("auto.offset.reset", "latest")
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "1000")
        .create()?;
    consumer.subscribe(&[DETECTIONS_TOPIC])?;
    Ok(consumer)
}

#[derive(Clone)]
pub struct EventPublisher {
    producer: FutureProducer,
}

impl EventPublisher {
    pub fn new(bootstrap_servers: &str) -> Result<Self> {
        let producer: FutureProducer = producer_config(bootstrap_servers).create()?;
        Ok(EventPublisher { producer })
    }

    /// Publish one inference event, keyed by camera id.
    ///
    /// Resolves once the leader has accepted the record, which is the
    /// precondition for acking the originating frame-bus entries.
    pub async fn publish_detections(&self, event: &InferenceEvent) -> Result<()> {
        self.send_json(DETECTIONS_TOPIC, Some(event.camera_id.as_str()), event)
            .await
    }

    /// Publish one resolved identity, keyed by camera id.
    pub async fn publish_identity(&self, resolved: &ResolvedIdentity) -> Result<()> {
        self.send_json(IDENTITIES_TOPIC, Some(resolved.camera_id.as_str()), resolved)
            .await
    }

    /// Publish one alert. Alerts carry no key.
    pub async fn publish_alert(&self, alert: &AlertEvent) -> Result<()> {
        self.send_json(ALERTS_TOPIC, None, alert).await
    }

    async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &T,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let mut record: FutureRecord<'_, str, Vec<u8>> =
            FutureRecord::to(topic).payload(&body);
        if let Some(key) = key {
            record = record.key(key);
        }
        match self
            .producer
            .send(record, Timeout::After(PRODUCER_QUEUE_TIMEOUT))
            .await
        {
            Ok(_delivery) => Ok(()),
            Err((e, _msg)) => Err(e.into()),
        }
    }
}
