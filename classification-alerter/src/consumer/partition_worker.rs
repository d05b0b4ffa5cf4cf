//! Partition worker: reads one partition in order, hands every event to the
//! handler and checkpoints it once handled.
//!
//! One worker runs per owned partition, each in its own task, so a slow
//! catalog lookup or a failing checkpoint write only holds back its own
//! partition.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::checkpointer::Checkpointer;
use crate::consumer::ConsumerError;
use crate::metrics_consts::EVENT_RETRIES;
use crate::processor::EventHandler;
use crate::retry::RetryPolicy;
use crate::stream::{PartitionReader, StreamSource};
use crate::types::{StartPosition, StreamEvent};

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    pub batch_size: usize,
    pub batch_max_wait: Duration,
    /// Where to begin when the partition has no checkpoint yet.
    pub start_position: StartPosition,
    pub retry: RetryPolicy,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_max_wait: Duration::from_millis(500),
            start_position: StartPosition::Earliest,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct PartitionWorker {
    partition: i32,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    /// Start processing `partition` in a new task. The worker stops when
    /// `cancel` fires or [`PartitionWorker::stop`] is called.
    pub fn spawn(
        partition: i32,
        source: Arc<dyn StreamSource>,
        handler: Arc<dyn EventHandler>,
        checkpointer: Checkpointer,
        config: PartitionWorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let worker = Worker {
            partition,
            source,
            handler,
            checkpointer,
            config,
            cancel: cancel.clone(),
        };

        let handle = tokio::spawn(async move {
            match worker.run().await {
                Ok(()) | Err(ConsumerError::Cancelled) => {
                    info!(partition, "partition worker stopped");
                }
                Err(e) => {
                    error!(partition, error = ?e, "partition worker failed");
                }
            }
        });

        Self {
            partition,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// The task exited on its own, e.g. after an unrecoverable stream error.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the worker and wait for it. The event in flight, if any, is
    /// finished and checkpointed first.
    pub async fn stop(mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(
                    partition = self.partition,
                    error = ?e,
                    "partition worker panicked during shutdown"
                );
            }
        }
    }
}

struct Worker {
    partition: i32,
    source: Arc<dyn StreamSource>,
    handler: Arc<dyn EventHandler>,
    checkpointer: Checkpointer,
    config: PartitionWorkerConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) -> Result<(), ConsumerError> {
        let checkpoint = self.checkpointer.load(&self.cancel).await?;
        let start = StartPosition::resume(checkpoint, self.config.start_position);
        info!(
            partition = self.partition,
            checkpoint = ?checkpoint,
            start = %start,
            "starting partition worker"
        );

        let mut reader = self.open_reader(start).await?;
        let mut read_failures = 0;

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                batch = reader.next_batch(self.config.batch_size, self.config.batch_max_wait) => batch,
            };

            let batch = match batch {
                Ok(batch) => {
                    read_failures = 0;
                    batch
                }
                Err(e) => {
                    read_failures += 1;
                    warn!(
                        partition = self.partition,
                        attempt = read_failures,
                        error = ?e,
                        "failed to read from partition"
                    );
                    if !self.config.retry.backoff(read_failures, &self.cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            for event in batch {
                if self.checkpointer.is_committed(event.sequence_number) {
                    debug!(
                        partition = self.partition,
                        sequence_number = event.sequence_number,
                        "skipping already checkpointed event"
                    );
                    continue;
                }
                if self.cancel.is_cancelled() {
                    return Ok(());
                }

                self.process(&event).await?;
                self.checkpointer
                    .commit(event.sequence_number, &self.cancel)
                    .await?;
            }
        }
    }

    async fn open_reader(
        &self,
        start: StartPosition,
    ) -> Result<Box<dyn PartitionReader>, ConsumerError> {
        let mut attempt = 0;
        loop {
            match self.source.open(self.partition, start).await {
                Ok(reader) => return Ok(reader),
                Err(e) => {
                    attempt += 1;
                    warn!(
                        partition = self.partition,
                        attempt,
                        error = ?e,
                        "failed to open partition reader"
                    );
                    if !self.config.retry.backoff(attempt, &self.cancel).await {
                        return Err(ConsumerError::Cancelled);
                    }
                }
            }
        }
    }

    /// Handle one event until it completes. Retryable failures are retried
    /// with backoff for as long as the worker runs; the handler call itself is
    /// never interrupted.
    async fn process(&self, event: &StreamEvent) -> Result<(), ConsumerError> {
        let mut attempt = 0;
        loop {
            match self.handler.process(event).await {
                Ok(completion) => {
                    debug!(
                        partition = event.partition,
                        sequence_number = event.sequence_number,
                        outcome = completion.label(),
                        "event processed"
                    );
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    metrics::counter!(EVENT_RETRIES, "reason" => e.reason()).increment(1);
                    warn!(
                        partition = event.partition,
                        sequence_number = event.sequence_number,
                        attempt,
                        error = ?e,
                        "event processing failed, retrying"
                    );
                    if !self.config.retry.backoff(attempt, &self.cancel).await {
                        return Err(ConsumerError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::stream::MemoryStream;
    use crate::test_utils::{wait_for_checkpoint, RecordingHandler};
    use crate::types::StreamScope;

    fn config() -> PartitionWorkerConfig {
        PartitionWorkerConfig {
            batch_size: 10,
            batch_max_wait: Duration::from_millis(20),
            start_position: StartPosition::Earliest,
            retry: RetryPolicy::build(1, Duration::from_millis(5)).provide(),
        }
    }

    fn spawn(
        stream: &MemoryStream,
        handler: &Arc<RecordingHandler>,
        store: &Arc<MemoryCheckpointStore>,
        partition: i32,
    ) -> PartitionWorker {
        let key = StreamScope::new("$Default", "atlas").checkpoint_key(partition);
        PartitionWorker::spawn(
            partition,
            Arc::new(stream.clone()),
            handler.clone(),
            Checkpointer::new(store.clone(), key, config().retry),
            config(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn processes_in_order_and_checkpoints() {
        let stream = MemoryStream::new(1);
        for i in 0..5 {
            stream.publish(0, format!("{i}")).unwrap();
        }
        let handler = Arc::new(RecordingHandler::default());
        let store = Arc::new(MemoryCheckpointStore::new());

        let worker = spawn(&stream, &handler, &store, 0);
        let key = StreamScope::new("$Default", "atlas").checkpoint_key(0);
        wait_for_checkpoint(&*store, &key, 4).await;
        worker.stop().await;

        assert_eq!(handler.sequence_numbers(0), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn resumes_after_checkpoint() {
        let stream = MemoryStream::new(1);
        for i in 0..5 {
            stream.publish(0, format!("{i}")).unwrap();
        }
        let handler = Arc::new(RecordingHandler::default());
        let store = Arc::new(MemoryCheckpointStore::new());
        let key = StreamScope::new("$Default", "atlas").checkpoint_key(0);
        store.save(&key, 2).await.unwrap();

        let worker = spawn(&stream, &handler, &store, 0);
        wait_for_checkpoint(&*store, &key, 4).await;
        worker.stop().await;

        assert_eq!(handler.sequence_numbers(0), vec![3, 4]);
    }

    #[tokio::test]
    async fn retryable_failure_holds_back_checkpoint() {
        let stream = MemoryStream::new(1);
        for i in 0..3 {
            stream.publish(0, format!("{i}")).unwrap();
        }
        let handler = Arc::new(RecordingHandler::default());
        handler.fail_sequence(1, 3);
        let store = Arc::new(MemoryCheckpointStore::new());
        let key = StreamScope::new("$Default", "atlas").checkpoint_key(0);

        let worker = spawn(&stream, &handler, &store, 0);
        wait_for_checkpoint(&*store, &key, 2).await;
        worker.stop().await;

        // three failed attempts on event 1, then success
        assert_eq!(handler.sequence_numbers(0), vec![0, 1, 1, 1, 1, 2]);
    }

    #[tokio::test]
    async fn stop_while_retrying_leaves_event_uncommitted() {
        let stream = MemoryStream::new(1);
        stream.publish(0, "0").unwrap();
        stream.publish(0, "1").unwrap();
        let handler = Arc::new(RecordingHandler::default());
        handler.fail_sequence(1, usize::MAX);
        let store = Arc::new(MemoryCheckpointStore::new());
        let key = StreamScope::new("$Default", "atlas").checkpoint_key(0);

        let worker = spawn(&stream, &handler, &store, 0);
        wait_for_checkpoint(&*store, &key, 0).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        worker.stop().await;

        assert_eq!(store.load(&key).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn stop_finishes_in_flight_event_and_takes_no_more() {
        let stream = MemoryStream::new(1);
        stream.publish(0, "0").unwrap();
        stream.publish(0, "1").unwrap();
        let handler = Arc::new(RecordingHandler::default());
        handler.delay_each(Duration::from_millis(200));
        let store = Arc::new(MemoryCheckpointStore::new());
        let key = StreamScope::new("$Default", "atlas").checkpoint_key(0);

        let worker = spawn(&stream, &handler, &store, 0);
        while handler.sequence_numbers(0).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        worker.stop().await;

        assert_eq!(store.load(&key).await.unwrap(), Some(0));
        assert_eq!(handler.sequence_numbers(0), vec![0]);
    }
}
