use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::stream::{PartitionReader, StreamError, StreamSource};
use crate::types::{StartPosition, StreamEvent};

struct Inner {
    partitions: Vec<Mutex<Vec<StreamEvent>>>,
    appended: Notify,
}

/// An in-process stream with a fixed number of partitions. Sequence numbers
/// are the position of the event in its partition, starting at 0.
#[derive(Clone)]
pub struct MemoryStream {
    inner: Arc<Inner>,
}

impl MemoryStream {
    pub fn new(partition_count: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: (0..partition_count).map(|_| Mutex::new(Vec::new())).collect(),
                appended: Notify::new(),
            }),
        }
    }

    /// Append an event, returning its sequence number.
    pub fn publish(&self, partition: i32, body: impl Into<Vec<u8>>) -> Result<i64, StreamError> {
        let sequence_number = {
            let mut events = self.events(partition)?;
            let sequence_number = events.len() as i64;
            let mut event = StreamEvent::new(partition, sequence_number, body);
            event.enqueued_at = Some(Utc::now());
            events.push(event);
            sequence_number
        };
        self.inner.appended.notify_waiters();
        Ok(sequence_number)
    }

    pub fn len(&self, partition: i32) -> usize {
        self.events(partition).map(|e| e.len()).unwrap_or(0)
    }

    fn events(&self, partition: i32) -> Result<MutexGuard<'_, Vec<StreamEvent>>, StreamError> {
        let slot = usize::try_from(partition)
            .ok()
            .and_then(|p| self.inner.partitions.get(p))
            .ok_or(StreamError::UnknownPartition(partition))?;
        // A poisoned partition only means a test panicked while publishing.
        Ok(slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

#[async_trait]
impl StreamSource for MemoryStream {
    async fn partition_ids(&self) -> Result<Vec<i32>, StreamError> {
        Ok((0..self.inner.partitions.len())
            .filter_map(|p| i32::try_from(p).ok())
            .collect())
    }

    async fn open(
        &self,
        partition: i32,
        start: StartPosition,
    ) -> Result<Box<dyn PartitionReader>, StreamError> {
        let len = self.events(partition)?.len();
        let position = match start {
            StartPosition::Earliest => 0,
            StartPosition::Latest => len,
            StartPosition::Sequence(n) => usize::try_from(n).unwrap_or(0),
        };

        Ok(Box::new(MemoryPartitionReader {
            stream: self.clone(),
            partition,
            position,
        }))
    }
}

struct MemoryPartitionReader {
    stream: MemoryStream,
    partition: i32,
    position: usize,
}

impl MemoryPartitionReader {
    fn take(&mut self, max_events: usize) -> Result<Vec<StreamEvent>, StreamError> {
        let events = self.stream.events(self.partition)?;
        let batch: Vec<StreamEvent> = events
            .iter()
            .skip(self.position)
            .take(max_events)
            .cloned()
            .collect();
        self.position += batch.len();
        Ok(batch)
    }
}

#[async_trait]
impl PartitionReader for MemoryPartitionReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_batch(
        &mut self,
        max_events: usize,
        max_wait: Duration,
    ) -> Result<Vec<StreamEvent>, StreamError> {
        let deadline = Instant::now() + max_wait;
        let inner = self.stream.inner.clone();
        loop {
            // Registered before looking, so a publish in between is not missed.
            let appended = inner.appended.notified();

            let batch = self.take(max_events)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}
