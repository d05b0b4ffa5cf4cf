//! Partitioned event stream abstraction.
//!
//! A [`StreamSource`] lists the partitions of one stream and opens independent
//! readers on them. Readers return events of their partition in sequence
//! order, starting at the requested [`StartPosition`].

pub mod kafka;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::types::{StartPosition, StreamEvent};

pub use kafka::KafkaStreamSource;
pub use memory::MemoryStream;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("partition {0} does not exist")]
    UnknownPartition(i32),
    #[error("stream {0} not found")]
    UnknownStream(String),
    #[error("metadata task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn partition_ids(&self) -> Result<Vec<i32>, StreamError>;

    async fn open(
        &self,
        partition: i32,
        start: StartPosition,
    ) -> Result<Box<dyn PartitionReader>, StreamError>;
}

#[async_trait]
pub trait PartitionReader: Send {
    fn partition(&self) -> i32;

    /// Up to `max_events` events, waiting at most `max_wait` for the first one.
    /// An empty batch means nothing arrived in time.
    async fn next_batch(
        &mut self,
        max_events: usize,
        max_wait: Duration,
    ) -> Result<Vec<StreamEvent>, StreamError>;
}
