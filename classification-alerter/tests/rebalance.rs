use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use classification_alerter::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use classification_alerter::consumer::{ConsumerConfig, StreamConsumer};
use classification_alerter::coordination::LeaseCoordinator;
use classification_alerter::retry::RetryPolicy;
use classification_alerter::stream::MemoryStream;
use classification_alerter::test_utils::{wait_for_checkpoint, RecordingHandler};
use classification_alerter::{StartPosition, StreamScope};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PARTITIONS: i32 = 4;

fn scope() -> StreamScope {
    StreamScope::new("$Default", "atlas_hook")
}

struct Instance {
    handler: Arc<RecordingHandler>,
    cancel: CancellationToken,
    running: JoinHandle<()>,
}

impl Instance {
    fn start(owner: &str, stream: &MemoryStream, store: &Arc<MemoryCheckpointStore>) -> Self {
        let handler = Arc::new(RecordingHandler::default());
        let coordinator =
            LeaseCoordinator::new(store.clone(), scope(), owner, Duration::from_secs(30));
        let consumer = StreamConsumer::new(
            Arc::new(stream.clone()),
            handler.clone(),
            store.clone(),
            Arc::new(coordinator),
            scope(),
            ConsumerConfig {
                batch_size: 10,
                batch_max_wait: Duration::from_millis(20),
                start_position: StartPosition::Earliest,
                retry: RetryPolicy::build(1, Duration::from_millis(5)).provide(),
                rebalance_interval: Duration::from_millis(20),
                ownership_timeout: Duration::from_secs(30),
            },
        );

        let cancel = CancellationToken::new();
        let running = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                consumer.run(None, cancel).await.unwrap();
            })
        };

        Self {
            handler,
            cancel,
            running,
        }
    }

    async fn stop(self) -> Arc<RecordingHandler> {
        self.cancel.cancel();
        self.running.await.unwrap();
        self.handler
    }
}

fn publish_round(stream: &MemoryStream) -> i64 {
    let mut last = 0;
    for partition in 0..PARTITIONS {
        last = stream.publish(partition, format!("{partition}")).unwrap();
    }
    last
}

async fn wait_for_all_checkpoints(store: &MemoryCheckpointStore, sequence_number: i64) {
    for partition in 0..PARTITIONS {
        let key = scope().checkpoint_key(partition);
        wait_for_checkpoint(store, &key, sequence_number).await;
    }
}

/// Poll until the ownership records hold exactly `expected` partitions per owner.
async fn wait_for_owners(store: &MemoryCheckpointStore, expected: &[(&str, usize)]) {
    let expected: HashMap<String, usize> = expected
        .iter()
        .map(|(owner, count)| (owner.to_string(), *count))
        .collect();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut owners: HashMap<String, usize> = HashMap::new();
        for record in store.list_ownership(&scope()).await.unwrap() {
            *owners.entry(record.owner_id).or_default() += 1;
        }
        if owners == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ownership never settled, last seen {owners:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn assert_strictly_increasing(sequence_numbers: &[i64]) {
    assert!(
        sequence_numbers.windows(2).all(|w| w[0] < w[1]),
        "events out of order or repeated: {sequence_numbers:?}"
    );
}

#[tokio::test]
async fn partitions_are_shared_and_handed_over() {
    let stream = MemoryStream::new(PARTITIONS as usize);
    let store = Arc::new(MemoryCheckpointStore::new());

    publish_round(&stream);
    let last = publish_round(&stream);
    let a = Instance::start("a", &stream, &store);
    wait_for_all_checkpoints(&store, last).await;
    wait_for_owners(&store, &[("a", 4)]).await;

    let b = Instance::start("b", &stream, &store);
    wait_for_owners(&store, &[("a", 2), ("b", 2)]).await;
    // let a notice the partitions it lost before more traffic arrives
    tokio::time::sleep(Duration::from_millis(200)).await;

    publish_round(&stream);
    let last = publish_round(&stream);
    wait_for_all_checkpoints(&store, last).await;

    let a_handler = a.stop().await;
    wait_for_owners(&store, &[("b", 4)]).await;

    let last = publish_round(&stream);
    wait_for_all_checkpoints(&store, last).await;
    let b_handler = b.stop().await;

    for partition in 0..PARTITIONS {
        let by_a = a_handler.sequence_numbers(partition);
        let by_b = b_handler.sequence_numbers(partition);
        assert_strictly_increasing(&by_a);
        assert_strictly_increasing(&by_b);

        // every event handled exactly once, handing over at a checkpoint
        let mut all: Vec<i64> = by_a.iter().chain(by_b.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4], "partition {partition}");
        if let (Some(a_last), Some(b_first)) = (by_a.last(), by_b.first()) {
            assert!(a_last < b_first, "partition {partition}");
        }
    }

    let records = store.list_ownership(&scope()).await.unwrap();
    assert!(records.iter().all(|r| r.is_released()));
}

#[tokio::test]
async fn shutdown_releases_for_immediate_takeover() {
    let stream = MemoryStream::new(PARTITIONS as usize);
    let store = Arc::new(MemoryCheckpointStore::new());

    let last = publish_round(&stream);
    let a = Instance::start("a", &stream, &store);
    wait_for_all_checkpoints(&store, last).await;
    a.stop().await;
    wait_for_owners(&store, &[("", 4)]).await;

    // leases run for 30s, so only a release lets b in this quickly
    let last = publish_round(&stream);
    let b = Instance::start("b", &stream, &store);
    wait_for_all_checkpoints(&store, last).await;
    let b_handler = b.stop().await;

    for partition in 0..PARTITIONS {
        assert_eq!(b_handler.sequence_numbers(partition), vec![1]);
    }
}
