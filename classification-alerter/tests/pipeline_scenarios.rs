use std::sync::Arc;
use std::time::Duration;

use classification_alerter::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use classification_alerter::consumer::{ConsumerConfig, StreamConsumer};
use classification_alerter::coordination::LeaseCoordinator;
use classification_alerter::processor::EventProcessor;
use classification_alerter::retry::RetryPolicy;
use classification_alerter::sink::{AlertSink, DedupingAlertSink};
use classification_alerter::stream::MemoryStream;
use classification_alerter::test_utils::{
    column_entity, notification_body, policy_table, wait_for_checkpoint, CollectingAlertSink,
    ScriptedLookup, CONFIDENTIAL, CREDIT_CARD, SENSITIVE,
};
use classification_alerter::{AlertCode, StartPosition, StreamScope};
use tokio_util::sync::CancellationToken;

fn scope() -> StreamScope {
    StreamScope::new("$Default", "atlas_hook")
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        batch_size: 10,
        batch_max_wait: Duration::from_millis(20),
        start_position: StartPosition::Earliest,
        retry: RetryPolicy::build(1, Duration::from_millis(5)).provide(),
        rebalance_interval: Duration::from_millis(20),
        ownership_timeout: Duration::from_secs(5),
    }
}

struct Pipeline {
    stream: MemoryStream,
    store: Arc<MemoryCheckpointStore>,
    lookup: Arc<ScriptedLookup>,
    alerts: Arc<CollectingAlertSink>,
}

impl Pipeline {
    fn new(partitions: usize) -> Self {
        Self {
            stream: MemoryStream::new(partitions),
            store: Arc::new(MemoryCheckpointStore::new()),
            lookup: Arc::new(ScriptedLookup::default()),
            alerts: Arc::new(CollectingAlertSink::default()),
        }
    }

    fn publish(&self, partition: i32, operation_type: &str, guid: &str) -> i64 {
        self.stream
            .publish(partition, notification_body(operation_type, guid))
            .unwrap()
    }

    /// Script a credit card column declared as `declared`.
    fn found_column(&self, guid: &str, declared: &str, encryption: u8) {
        let entity = column_entity(guid, CREDIT_CARD, Some(declared), encryption);
        self.lookup.found(guid, entity);
    }

    fn consumer(&self, sink: Arc<dyn AlertSink>) -> StreamConsumer {
        let processor = EventProcessor::new(self.lookup.clone(), Arc::new(policy_table()), sink);
        let coordinator = LeaseCoordinator::new(
            self.store.clone(),
            scope(),
            "instance-a",
            Duration::from_secs(60),
        );
        StreamConsumer::new(
            Arc::new(self.stream.clone()),
            Arc::new(processor),
            self.store.clone(),
            Arc::new(coordinator),
            scope(),
            consumer_config(),
        )
    }

    /// Run a consumer until `partition` is checkpointed at `sequence_number`.
    async fn consume_until(&self, sink: Arc<dyn AlertSink>, partition: i32, sequence_number: i64) {
        let consumer = self.consumer(sink);
        let cancel = CancellationToken::new();
        let running = {
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(None, cancel).await })
        };

        let key = scope().checkpoint_key(partition);
        wait_for_checkpoint(&*self.store, &key, sequence_number).await;
        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    fn codes(&self) -> Vec<(String, AlertCode)> {
        self.alerts
            .alerts()
            .iter()
            .map(|a| (a.entity.guid.as_str().to_string(), a.code))
            .collect()
    }
}

#[tokio::test]
async fn classification_events_raise_alerts_in_order() {
    let pipeline = Pipeline::new(1);
    pipeline.found_column("g1", SENSITIVE, 0);
    pipeline.found_column("g2", CONFIDENTIAL, 0);

    pipeline.publish(0, "CLASSIFICATION_ADD", "g1");
    pipeline.publish(0, "CLASSIFICATION_UPDATE", "g2");
    let last = pipeline.publish(0, "ENTITY_DELETE", "g3");

    pipeline
        .consume_until(pipeline.alerts.clone(), 0, last)
        .await;

    assert_eq!(
        pipeline.codes(),
        vec![
            ("g1".to_string(), AlertCode::UnencryptedSensitiveData),
            ("g2".to_string(), AlertCode::UnencryptedSensitiveData),
            ("g2".to_string(), AlertCode::DeclaredSensitivityMismatch),
        ]
    );
    // the delete never reaches the catalog
    assert_eq!(pipeline.lookup.calls(), 2);
}

#[tokio::test]
async fn non_alerting_outcomes_still_checkpoint() {
    let pipeline = Pipeline::new(1);
    pipeline.lookup.not_found("deleted");
    pipeline.lookup.found(
        "ip",
        column_entity("ip", "MICROSOFT.PERSONAL.IP_ADDRESS", None, 0),
    );
    pipeline.found_column("ok", SENSITIVE, 1);

    pipeline.publish(0, "CLASSIFICATION_ADD", "deleted");
    pipeline.publish(0, "CLASSIFICATION_ADD", "ip");
    pipeline
        .stream
        .publish(0, "this is not a notification")
        .unwrap();
    let last = pipeline.publish(0, "CLASSIFICATION_ADD", "ok");

    pipeline
        .consume_until(pipeline.alerts.clone(), 0, last)
        .await;

    assert!(pipeline.alerts.alerts().is_empty());
    assert_eq!(
        pipeline
            .store
            .load(&scope().checkpoint_key(0))
            .await
            .unwrap(),
        Some(last)
    );
}

#[tokio::test]
async fn catalog_outage_is_retried_without_skipping() {
    let pipeline = Pipeline::new(1);
    pipeline.found_column("g1", SENSITIVE, 0);
    pipeline.lookup.fail("g1", 2);

    let only = pipeline.publish(0, "CLASSIFICATION_ADD", "g1");
    pipeline
        .consume_until(pipeline.alerts.clone(), 0, only)
        .await;

    assert_eq!(pipeline.lookup.calls(), 3);
    assert_eq!(
        pipeline.codes(),
        vec![("g1".to_string(), AlertCode::UnencryptedSensitiveData)]
    );
}

#[tokio::test]
async fn restart_resumes_after_checkpoint() {
    let pipeline = Pipeline::new(1);
    pipeline.found_column("g1", SENSITIVE, 0);

    let first = pipeline.publish(0, "CLASSIFICATION_ADD", "g1");
    pipeline
        .consume_until(pipeline.alerts.clone(), 0, first)
        .await;

    let second = pipeline.publish(0, "CLASSIFICATION_UPDATE", "g1");
    pipeline
        .consume_until(pipeline.alerts.clone(), 0, second)
        .await;

    // each event was looked up exactly once across both runs
    assert_eq!(pipeline.lookup.calls(), 2);
    assert_eq!(pipeline.alerts.alerts().len(), 2);
}

#[tokio::test]
async fn replayed_events_do_not_repeat_alerts() {
    let pipeline = Pipeline::new(1);
    pipeline.found_column("g1", CONFIDENTIAL, 0);
    let deduping: Arc<dyn AlertSink> =
        Arc::new(DedupingAlertSink::new(pipeline.alerts.clone(), Duration::from_secs(60)));

    let only = pipeline.publish(0, "CLASSIFICATION_ADD", "g1");
    pipeline.consume_until(deduping.clone(), 0, only).await;

    // lose the checkpoint, so the event is delivered again
    let replay = Pipeline {
        stream: pipeline.stream.clone(),
        store: Arc::new(MemoryCheckpointStore::new()),
        lookup: pipeline.lookup.clone(),
        alerts: pipeline.alerts.clone(),
    };
    replay.consume_until(deduping, 0, only).await;

    assert_eq!(pipeline.lookup.calls(), 2);
    assert_eq!(
        pipeline.codes(),
        vec![
            ("g1".to_string(), AlertCode::UnencryptedSensitiveData),
            ("g1".to_string(), AlertCode::DeclaredSensitivityMismatch),
        ]
    );
}

#[tokio::test]
async fn partitions_progress_independently() {
    let pipeline = Pipeline::new(2);
    pipeline.found_column("slow", SENSITIVE, 0);
    pipeline.found_column("fast", SENSITIVE, 1);
    // partition 0 is stuck retrying its only event for a while
    pipeline.lookup.fail("slow", 40);

    pipeline.publish(0, "CLASSIFICATION_ADD", "slow");
    let mut last = 0;
    for _ in 0..5 {
        last = pipeline.publish(1, "CLASSIFICATION_ADD", "fast");
    }

    let consumer = pipeline.consumer(pipeline.alerts.clone());
    let cancel = CancellationToken::new();
    let running = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(None, cancel).await })
    };

    wait_for_checkpoint(&*pipeline.store, &scope().checkpoint_key(1), last).await;
    assert_eq!(
        pipeline
            .store
            .load(&scope().checkpoint_key(0))
            .await
            .unwrap(),
        None
    );

    wait_for_checkpoint(&*pipeline.store, &scope().checkpoint_key(0), 0).await;
    cancel.cancel();
    running.await.unwrap().unwrap();
}
