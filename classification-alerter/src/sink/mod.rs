//! Where alerts and unprocessable events go.

pub mod console;
pub mod dedup;
pub mod kafka;

use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::rules::Alert;
use crate::types::StreamEvent;

pub use console::{AlertFormat, ConsoleAlertSink};
pub use dedup::DedupingAlertSink;
pub use kafka::KafkaPublisher;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write alert: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize alert: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Produce(#[from] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    ProduceCanceled,
}

/// Accepts alerts. Returning an error means the alert was not delivered and
/// the event it came from must be retried.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Parks events that can never be processed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, event: &StreamEvent, reason: &str) -> Result<(), SinkError>;
}

/// Delivers every alert to each inner sink in order, stopping at the first failure.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AlertSink for FanOutSink {
    async fn emit(&self, alert: &Alert) -> Result<(), SinkError> {
        for sink in &self.sinks {
            sink.emit(alert).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_alert, CollectingAlertSink, FailingAlertSink};

    #[tokio::test]
    async fn fan_out_delivers_to_every_sink() {
        let first = Arc::new(CollectingAlertSink::default());
        let second = Arc::new(CollectingAlertSink::default());
        let sink = FanOutSink::new(vec![first.clone(), second.clone()]);

        sink.emit(&sample_alert("g1")).await.unwrap();

        assert_eq!(first.alerts().len(), 1);
        assert_eq!(second.alerts().len(), 1);
    }

    #[tokio::test]
    async fn fan_out_stops_at_first_failure() {
        let after = Arc::new(CollectingAlertSink::default());
        let sink = FanOutSink::new(vec![Arc::new(FailingAlertSink), after.clone()]);

        assert!(sink.emit(&sample_alert("g1")).await.is_err());
        assert!(after.alerts().is_empty());
    }
}
