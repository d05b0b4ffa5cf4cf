//! The stream consumer: keeps one partition worker running for every
//! partition this instance owns.
//!
//! Ownership is re-evaluated every `rebalance_interval`. Workers of lost
//! partitions are stopped (their in-flight event still completes and
//! checkpoints), workers for newly owned partitions are started from the
//! stored checkpoint, and workers that died are restarted on the next tick.

pub mod checkpointer;
pub mod partition_worker;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointStore, StoreError};
use crate::coordination::{CoordinationError, FixedCoordinator, OwnershipCoordinator};
use crate::health::HealthHandle;
use crate::metrics_consts::{PARTITIONS_LOST, REBALANCE_ERRORS};
use crate::processor::EventHandler;
use crate::retry::RetryPolicy;
use crate::stream::{StreamError, StreamSource};
use crate::types::{StartPosition, StreamScope};

pub use checkpointer::Checkpointer;
pub use partition_worker::{PartitionWorker, PartitionWorkerConfig};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("checkpoint store failed: {0}")]
    Store(#[from] StoreError),
    #[error("stream failed: {0}")]
    Stream(#[from] StreamError),
    #[error("ownership coordination failed: {0}")]
    Coordination(#[from] CoordinationError),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub batch_max_wait: Duration,
    pub start_position: StartPosition,
    pub retry: RetryPolicy,
    pub rebalance_interval: Duration,
    /// How long ownership survives without a successful rebalance. Workers
    /// are stopped once this passes, as other instances may have taken over.
    pub ownership_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_max_wait: Duration::from_millis(500),
            start_position: StartPosition::Earliest,
            retry: RetryPolicy::default(),
            rebalance_interval: Duration::from_secs(10),
            ownership_timeout: Duration::from_secs(60),
        }
    }
}

impl ConsumerConfig {
    fn worker_config(&self) -> PartitionWorkerConfig {
        PartitionWorkerConfig {
            batch_size: self.batch_size,
            batch_max_wait: self.batch_max_wait,
            start_position: self.start_position,
            retry: self.retry.clone(),
        }
    }
}

pub struct StreamConsumer {
    source: Arc<dyn StreamSource>,
    handler: Arc<dyn EventHandler>,
    store: Arc<dyn CheckpointStore>,
    coordinator: Arc<dyn OwnershipCoordinator>,
    scope: StreamScope,
    config: ConsumerConfig,
    liveness: Option<HealthHandle>,
}

impl StreamConsumer {
    pub fn new(
        source: Arc<dyn StreamSource>,
        handler: Arc<dyn EventHandler>,
        store: Arc<dyn CheckpointStore>,
        coordinator: Arc<dyn OwnershipCoordinator>,
        scope: StreamScope,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            handler,
            store,
            coordinator,
            scope,
            config,
            liveness: None,
        }
    }

    /// Report healthy on `liveness` after every successful ownership cycle.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Consume until `cancel` fires.
    ///
    /// With a non-empty `partition_filter` exactly those partitions are
    /// processed and no ownership is arbitrated; otherwise partitions are
    /// shared with the other instances through the coordinator. On shutdown
    /// every worker is stopped and owned partitions are released.
    pub async fn run(
        &self,
        partition_filter: Option<Vec<i32>>,
        cancel: CancellationToken,
    ) -> Result<(), ConsumerError> {
        let fixed;
        let coordinator: &dyn OwnershipCoordinator = match partition_filter {
            Some(partitions) if !partitions.is_empty() => {
                info!(?partitions, "consuming fixed partitions, load balancing disabled");
                fixed = FixedCoordinator::new(self.coordinator.owner_id(), partitions);
                &fixed
            }
            _ => self.coordinator.as_ref(),
        };

        info!(
            scope = %self.scope,
            owner_id = coordinator.owner_id(),
            "starting stream consumer"
        );

        let mut workers: BTreeMap<i32, PartitionWorker> = BTreeMap::new();
        let mut owned: BTreeSet<i32> = BTreeSet::new();
        let mut last_rebalance = Instant::now();

        let mut ticker = tokio::time::interval(self.config.rebalance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            reap_finished(&mut workers);

            match self.rebalance(coordinator).await {
                Ok(now_owned) => {
                    last_rebalance = Instant::now();

                    let lost: Vec<i32> = workers
                        .keys()
                        .filter(|p| !now_owned.contains(p))
                        .copied()
                        .collect();
                    if !lost.is_empty() {
                        info!(?lost, "partitions no longer owned");
                        metrics::counter!(PARTITIONS_LOST).increment(lost.len() as u64);
                        stop_workers(&mut workers, &lost).await;
                    }

                    for &partition in &now_owned {
                        if !workers.contains_key(&partition) {
                            let worker = self.spawn_worker(partition, &cancel);
                            workers.insert(partition, worker);
                        }
                    }

                    owned = now_owned;
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy();
                    }
                }
                Err(e) => {
                    metrics::counter!(REBALANCE_ERRORS).increment(1);
                    error!(error = ?e, "ownership cycle failed");

                    if !workers.is_empty()
                        && last_rebalance.elapsed() >= self.config.ownership_timeout
                    {
                        warn!(
                            partitions = workers.len(),
                            "ownership could not be renewed in time, stopping all workers"
                        );
                        let all: Vec<i32> = workers.keys().copied().collect();
                        stop_workers(&mut workers, &all).await;
                        owned.clear();
                    }
                }
            }
        }

        info!(partitions = workers.len(), "stopping stream consumer");
        let all: Vec<i32> = workers.keys().copied().collect();
        stop_workers(&mut workers, &all).await;

        let owned: Vec<i32> = owned.into_iter().collect();
        if !owned.is_empty() {
            if let Err(e) = coordinator.release(&owned).await {
                warn!(error = ?e, "failed to release partition ownership");
            }
        }

        Ok(())
    }

    async fn rebalance(
        &self,
        coordinator: &dyn OwnershipCoordinator,
    ) -> Result<BTreeSet<i32>, ConsumerError> {
        let partitions = self.source.partition_ids().await?;
        Ok(coordinator.rebalance(&partitions).await?)
    }

    fn spawn_worker(&self, partition: i32, cancel: &CancellationToken) -> PartitionWorker {
        let checkpointer = Checkpointer::new(
            self.store.clone(),
            self.scope.checkpoint_key(partition),
            self.config.retry.clone(),
        );
        PartitionWorker::spawn(
            partition,
            self.source.clone(),
            self.handler.clone(),
            checkpointer,
            self.config.worker_config(),
            cancel.child_token(),
        )
    }
}

fn reap_finished(workers: &mut BTreeMap<i32, PartitionWorker>) {
    let finished: Vec<i32> = workers
        .values()
        .filter(|w| w.is_finished())
        .map(|w| w.partition())
        .collect();
    for partition in finished {
        warn!(partition, "partition worker exited, restarting");
        workers.remove(&partition);
    }
}

async fn stop_workers(workers: &mut BTreeMap<i32, PartitionWorker>, partitions: &[i32]) {
    let stopping: Vec<PartitionWorker> = partitions
        .iter()
        .filter_map(|p| workers.remove(p))
        .collect();
    futures::future::join_all(stopping.into_iter().map(PartitionWorker::stop)).await;
}
