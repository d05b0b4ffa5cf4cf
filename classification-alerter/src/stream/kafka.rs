//! Kafka-protocol stream source. Works against Kafka itself and against
//! Kafka-compatible endpoints such as Event Hubs (SASL PLAIN with a connection
//! string).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::metrics_consts::{EVENTS_READ, STREAM_READ_ERRORS};
use crate::stream::{PartitionReader, StreamError, StreamSource};
use crate::types::{StartPosition, StreamEvent};

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

/// How to reach the brokers.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub bootstrap_servers: String,
    /// When set, authenticate with SASL PLAIN using `$ConnectionString` as user.
    pub connection_string: Option<String>,
    pub tls: bool,
}

impl ConnectionSettings {
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("socket.timeout.ms", "10000");

        if let Some(connection_string) = &self.connection_string {
            config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", "$ConnectionString")
                .set("sasl.password", connection_string);
        } else if self.tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        config
    }
}

/// Assign-only consumers, one per partition: ownership is decided by the
/// coordinator and progress lives in the checkpoint store, so the broker's
/// group management and offset commits are not used.
pub struct KafkaStreamSource {
    settings: ConnectionSettings,
    topic: String,
    group_id: String,
    metadata: Arc<BaseConsumer>,
}

impl KafkaStreamSource {
    pub fn new(
        settings: ConnectionSettings,
        topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Result<Self, StreamError> {
        let group_id = group_id.into();
        let metadata: BaseConsumer = Self::consumer_config(&settings, &group_id).create()?;

        Ok(Self {
            settings,
            topic: topic.into(),
            group_id,
            metadata: Arc::new(metadata),
        })
    }

    fn consumer_config(settings: &ConnectionSettings, group_id: &str) -> ClientConfig {
        let mut config = settings.client_config();
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");
        config
    }
}

#[async_trait]
impl StreamSource for KafkaStreamSource {
    async fn partition_ids(&self) -> Result<Vec<i32>, StreamError> {
        let consumer = self.metadata.clone();
        let topic = self.topic.clone();

        // fetch_metadata blocks the calling thread
        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
        })
        .await??;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .ok_or_else(|| StreamError::UnknownStream(self.topic.clone()))?;
        if let Some(error) = topic.error() {
            warn!(topic = %self.topic, ?error, "topic metadata reported an error");
            return Err(StreamError::UnknownStream(self.topic.clone()));
        }

        let mut ids: Vec<i32> = topic.partitions().iter().map(|p| p.id()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn open(
        &self,
        partition: i32,
        start: StartPosition,
    ) -> Result<Box<dyn PartitionReader>, StreamError> {
        let offset = match start {
            StartPosition::Earliest => Offset::Beginning,
            StartPosition::Latest => Offset::End,
            StartPosition::Sequence(n) => Offset::Offset(n),
        };
        let reset = match start {
            StartPosition::Latest => "latest",
            _ => "earliest",
        };

        let consumer: StreamConsumer = Self::consumer_config(&self.settings, &self.group_id)
            .set("auto.offset.reset", reset)
            .create()?;

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(&self.topic, partition, offset)?;
        consumer.assign(&assignment)?;

        info!(
            topic = %self.topic,
            partition,
            start = %start,
            "opened partition reader"
        );

        Ok(Box::new(KafkaPartitionReader {
            consumer,
            partition,
        }))
    }
}

struct KafkaPartitionReader {
    consumer: StreamConsumer,
    partition: i32,
}

fn to_event(message: &rdkafka::message::BorrowedMessage<'_>) -> StreamEvent {
    let mut event = StreamEvent::new(
        message.partition(),
        message.offset(),
        message.payload().unwrap_or_default(),
    );
    event.enqueued_at = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis);
    event
}

#[async_trait]
impl PartitionReader for KafkaPartitionReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_batch(
        &mut self,
        max_events: usize,
        max_wait: Duration,
    ) -> Result<Vec<StreamEvent>, StreamError> {
        let mut batch = Vec::with_capacity(max_events);
        let deadline = tokio::time::sleep(max_wait);
        tokio::pin!(deadline);

        while batch.len() < max_events {
            tokio::select! {
                _ = &mut deadline => break,
                received = self.consumer.recv() => match received {
                    Ok(message) => batch.push(to_event(&message)),
                    Err(KafkaError::PartitionEOF(_)) => {
                        debug!(partition = self.partition, "reached end of partition");
                    }
                    Err(e) => {
                        metrics::counter!(STREAM_READ_ERRORS).increment(1);
                        if batch.is_empty() {
                            return Err(e.into());
                        }
                        warn!(partition = self.partition, error = ?e, "read error, returning partial batch");
                        break;
                    }
                },
            }
        }

        metrics::counter!(EVENTS_READ).increment(batch.len() as u64);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_enables_sasl() {
        let settings = ConnectionSettings {
            bootstrap_servers: "ns.servicebus.windows.net:9093".to_string(),
            connection_string: Some("Endpoint=sb://ns/;SharedAccessKey=k".to_string()),
            tls: false,
        };
        let config = settings.client_config();
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.username"), Some("$ConnectionString"));
        assert_eq!(
            config.get("sasl.password"),
            Some("Endpoint=sb://ns/;SharedAccessKey=k")
        );
    }

    #[test]
    fn plain_tls() {
        let settings = ConnectionSettings {
            bootstrap_servers: "localhost:9092".to_string(),
            connection_string: None,
            tls: true,
        };
        let config = settings.client_config();
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("sasl.mechanism"), None);
    }

    #[test]
    fn consumer_config_disables_broker_commits() {
        let settings = ConnectionSettings {
            bootstrap_servers: "localhost:9092".to_string(),
            connection_string: None,
            tls: false,
        };
        let config = KafkaStreamSource::consumer_config(&settings, "$Default");
        assert_eq!(config.get("group.id"), Some("$Default"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("security.protocol"), None);
    }
}
