use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checkpoint::CheckpointStore;
use crate::consumer::ConsumerError;
use crate::metrics_consts::{CHECKPOINT_COMMITS, CHECKPOINT_LAST_SEQUENCE};
use crate::retry::RetryPolicy;
use crate::types::CheckpointKey;

/// Checkpoint bookkeeping for one partition worker.
///
/// Remembers the last sequence number it committed, so commits never go
/// backwards and events at or below it can be skipped on replay.
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    key: CheckpointKey,
    retry: RetryPolicy,
    committed: Option<i64>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, key: CheckpointKey, retry: RetryPolicy) -> Self {
        Self {
            store,
            key,
            retry,
            committed: None,
        }
    }

    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }

    pub fn committed(&self) -> Option<i64> {
        self.committed
    }

    /// Whether the event at `sequence_number` is already covered by a commit.
    pub fn is_committed(&self, sequence_number: i64) -> bool {
        self.committed.is_some_and(|c| sequence_number <= c)
    }

    /// Load the stored checkpoint, retrying until it succeeds or `cancel` fires.
    pub async fn load(&mut self, cancel: &CancellationToken) -> Result<Option<i64>, ConsumerError> {
        let mut attempt = 0;
        loop {
            match self.store.load(&self.key).await {
                Ok(stored) => {
                    self.committed = stored;
                    return Ok(stored);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(key = %self.key, attempt, error = ?e, "failed to load checkpoint");
                    if !self.retry.backoff(attempt, cancel).await {
                        return Err(ConsumerError::Cancelled);
                    }
                }
            }
        }
    }

    /// Commit `sequence_number` as processed.
    ///
    /// The first attempt runs even when `cancel` already fired, so the event
    /// that was in flight at shutdown still gets its checkpoint. Retries stop
    /// once cancelled.
    pub async fn commit(
        &mut self,
        sequence_number: i64,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        if self.is_committed(sequence_number) {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.store.save(&self.key, sequence_number).await {
                Ok(advanced) => {
                    let result = if advanced { "committed" } else { "stale" };
                    metrics::counter!(CHECKPOINT_COMMITS, "result" => result).increment(1);
                    let partition = self.key.partition().to_string();
                    metrics::gauge!(CHECKPOINT_LAST_SEQUENCE, "partition" => partition)
                        .set(sequence_number as f64);
                    if !advanced {
                        debug!(
                            key = %self.key,
                            sequence_number,
                            "stored checkpoint is already ahead"
                        );
                    }
                    self.committed = Some(sequence_number);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    metrics::counter!(CHECKPOINT_COMMITS, "result" => "error").increment(1);
                    warn!(
                        key = %self.key,
                        sequence_number,
                        attempt,
                        error = ?e,
                        "failed to commit checkpoint"
                    );
                    if !self.retry.backoff(attempt, cancel).await {
                        return Err(ConsumerError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::test_utils::FlakyCheckpointStore;
    use crate::types::StreamScope;

    fn key() -> CheckpointKey {
        StreamScope::new("$Default", "atlas").checkpoint_key(0)
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::build(1, Duration::from_millis(1)).provide()
    }

    #[tokio::test]
    async fn commits_only_move_forward() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut checkpointer = Checkpointer::new(store.clone(), key(), quick_retry());
        let cancel = CancellationToken::new();

        assert_eq!(checkpointer.load(&cancel).await.unwrap(), None);
        checkpointer.commit(5, &cancel).await.unwrap();
        checkpointer.commit(3, &cancel).await.unwrap();

        assert_eq!(checkpointer.committed(), Some(5));
        assert!(checkpointer.is_committed(4));
        assert!(!checkpointer.is_committed(6));
        assert_eq!(store.load(&key()).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn failed_commits_are_retried() {
        let store = Arc::new(FlakyCheckpointStore::failing_saves(2));
        let mut checkpointer = Checkpointer::new(store.clone(), key(), quick_retry());

        checkpointer
            .commit(7, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.save_attempts(), 3);
        assert_eq!(store.load(&key()).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn cancelled_commit_attempts_once() {
        let store = Arc::new(FlakyCheckpointStore::failing_saves(10));
        let mut checkpointer = Checkpointer::new(store.clone(), key(), quick_retry());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = checkpointer.commit(7, &cancel).await;

        assert!(matches!(result, Err(ConsumerError::Cancelled)));
        assert_eq!(store.save_attempts(), 1);
        assert_eq!(checkpointer.committed(), None);
    }

    #[tokio::test]
    async fn load_resumes_from_stored_checkpoint() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.save(&key(), 41).await.unwrap();

        let mut checkpointer = Checkpointer::new(store, key(), quick_retry());
        assert_eq!(
            checkpointer.load(&CancellationToken::new()).await.unwrap(),
            Some(41)
        );
        assert!(checkpointer.is_committed(41));
    }
}
