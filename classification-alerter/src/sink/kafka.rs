use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, error, info};

use crate::metrics_consts::{ALERTS_PUBLISHED, DEAD_LETTERED_EVENTS};
use crate::rules::Alert;
use crate::sink::{AlertSink, DeadLetterSink, SinkError};
use crate::stream::kafka::ConnectionSettings;
use crate::types::StreamEvent;

pub fn create_producer(
    settings: &ConnectionSettings,
    message_timeout: Duration,
) -> Result<FutureProducer, KafkaError> {
    let timeout_ms = message_timeout.as_millis().to_string();
    let mut client_config = settings.client_config();
    client_config
        .set("linger.ms", "20")
        .set("message.timeout.ms", timeout_ms)
        .set("compression.codec", "none");

    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: FutureProducer = client_config.create()?;

    // "Ping" the brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

/// Publishes to one topic. As an alert sink it re-publishes alerts as JSON keyed
/// by entity guid; as a dead-letter sink it forwards the raw event body.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(
        &self,
        key: &str,
        payload: &[u8],
        headers: Option<OwnedHeaders>,
    ) -> Result<(), SinkError> {
        let mut record = FutureRecord::to(&self.topic).key(key).payload(payload);
        if let Some(headers) = headers {
            record = record.headers(headers);
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| SinkError::Produce(e))?;

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(SinkError::Produce(e)),
            Err(_) => Err(SinkError::ProduceCanceled),
        }
    }
}

#[async_trait]
impl AlertSink for KafkaPublisher {
    async fn emit(&self, alert: &Alert) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(alert)?;
        let headers = OwnedHeaders::new().insert(Header {
            key: "alert_code",
            value: Some(alert.code.as_str()),
        });

        self.send(alert.entity.guid.as_str(), &payload, Some(headers))
            .await?;

        metrics::counter!(ALERTS_PUBLISHED, "code" => alert.code.as_str()).increment(1);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for KafkaPublisher {
    async fn dead_letter(&self, event: &StreamEvent, reason: &str) -> Result<(), SinkError> {
        let partition = event.partition.to_string();
        let sequence_number = event.sequence_number.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "reason",
                value: Some(reason),
            })
            .insert(Header {
                key: "partition",
                value: Some(partition.as_str()),
            })
            .insert(Header {
                key: "sequence_number",
                value: Some(sequence_number.as_str()),
            });

        self.send(&partition, event.body.as_slice(), Some(headers))
            .await?;

        metrics::counter!(DEAD_LETTERED_EVENTS).increment(1);
        Ok(())
    }
}
