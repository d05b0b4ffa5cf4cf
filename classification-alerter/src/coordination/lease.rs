use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointStore, OwnershipClaim};
use crate::coordination::balancer::{self, Acquisition};
use crate::coordination::{CoordinationError, OwnershipCoordinator};
use crate::metrics_consts::{OWNED_PARTITIONS, PARTITIONS_ACQUIRED};
use crate::types::StreamScope;

/// Lease-based ownership using the checkpoint store's ownership records.
///
/// Every record write is a compare-and-swap on the record version, so two
/// instances racing for a partition cannot both win. A lease not renewed
/// within `lease_duration` is up for grabs.
pub struct LeaseCoordinator {
    store: Arc<dyn CheckpointStore>,
    scope: StreamScope,
    owner_id: String,
    lease_duration: Duration,
}

impl LeaseCoordinator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        scope: StreamScope,
        owner_id: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            store,
            scope,
            owner_id: owner_id.into(),
            lease_duration,
        }
    }
}

#[async_trait]
impl OwnershipCoordinator for LeaseCoordinator {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    async fn rebalance(&self, partitions: &[i32]) -> Result<BTreeSet<i32>, CoordinationError> {
        let records = self.store.list_ownership(&self.scope).await?;
        let plan = balancer::plan(
            &self.owner_id,
            partitions,
            &records,
            Utc::now(),
            self.lease_duration,
        );

        let attempted: Vec<(i32, Acquisition)> = plan
            .acquisitions
            .iter()
            .map(|(claim, how)| (claim.partition, *how))
            .collect();

        let won = self
            .store
            .claim_ownership(&self.scope, plan.into_claims())
            .await?;

        let owned: BTreeSet<i32> = won
            .iter()
            .filter(|o| o.owner_id == self.owner_id)
            .map(|o| o.partition)
            .collect();

        for (partition, how) in attempted {
            if owned.contains(&partition) {
                info!(
                    owner_id = %self.owner_id,
                    partition,
                    how = how.as_str(),
                    "acquired partition"
                );
                metrics::counter!(PARTITIONS_ACQUIRED, "how" => how.as_str()).increment(1);
            } else {
                debug!(owner_id = %self.owner_id, partition, "lost race for partition");
            }
        }

        metrics::gauge!(OWNED_PARTITIONS).set(owned.len() as f64);
        Ok(owned)
    }

    async fn release(&self, partitions: &[i32]) -> Result<(), CoordinationError> {
        let records = self.store.list_ownership(&self.scope).await?;
        let claims: Vec<OwnershipClaim> = records
            .into_iter()
            .filter(|o| partitions.contains(&o.partition) && o.owner_id == self.owner_id)
            .map(|o| OwnershipClaim {
                partition: o.partition,
                owner_id: String::new(),
                expected_version: Some(o.version),
            })
            .collect();

        let released = self.store.claim_ownership(&self.scope, claims).await?;
        info!(
            owner_id = %self.owner_id,
            released = released.len(),
            "released partition ownership"
        );
        Ok(())
    }
}
