use async_trait::async_trait;
use tracing::info;

use crate::domain::OutboxIntent;

pub const BOOKING_EVENTS_TOPIC: &str = "booking-events";

#[derive(Debug, thiserror::Error)]
#[error("failed to publish event: {0}")]
pub struct PublishError(pub String);

/// Fan-out of booking lifecycle events to the outside world.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, intent: &OutboxIntent) -> Result<(), PublishError>;
}

/// Writes events to the log; used when no broker is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl NotificationPublisher for LogPublisher {
    async fn publish(&self, intent: &OutboxIntent) -> Result<(), PublishError> {
        info!(
            "Booking event {} for {} {}: {}",
            intent.event_type, intent.aggregate_type, intent.aggregate_id, intent.payload
        );
        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaPublisher;

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use std::time::Duration;

    pub struct KafkaPublisher {
        producer: FutureProducer,
        topic: String,
    }

    impl KafkaPublisher {
        pub fn connect(brokers: &str) -> Result<Self, PublishError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "5000")
                .create()
                .map_err(|e| PublishError(e.to_string()))?;
            Ok(Self {
                producer,
                topic: BOOKING_EVENTS_TOPIC.to_string(),
            })
        }
    }

    #[async_trait]
    impl NotificationPublisher for KafkaPublisher {
        async fn publish(&self, intent: &OutboxIntent) -> Result<(), PublishError> {
            let json = serde_json::to_string(&intent.payload)
                .map_err(|e| PublishError(e.to_string()))?;
            let record = FutureRecord::to(&self.topic)
                .payload(&json)
                .key(&intent.aggregate_id)
                .headers(rdkafka::message::OwnedHeaders::new().insert(rdkafka::message::Header {
                    key: "event_type",
                    value: Some(intent.event_type.as_str()),
                }));

            self.producer
                .send(record, Duration::from_secs(5))
                .await
                .map_err(|(e, _)| PublishError(e.to_string()))?;
            Ok(())
        }
    }
}
