use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::warn;

use crate::coordination::{CoordinationError, OwnershipCoordinator};

/// Owns an explicitly configured set of partitions, without arbitration.
pub struct FixedCoordinator {
    owner_id: String,
    partitions: BTreeSet<i32>,
}

impl FixedCoordinator {
    pub fn new(owner_id: impl Into<String>, partitions: impl IntoIterator<Item = i32>) -> Self {
        Self {
            owner_id: owner_id.into(),
            partitions: partitions.into_iter().collect(),
        }
    }
}

#[async_trait]
impl OwnershipCoordinator for FixedCoordinator {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    async fn rebalance(&self, partitions: &[i32]) -> Result<BTreeSet<i32>, CoordinationError> {
        let available: BTreeSet<i32> = partitions.iter().copied().collect();
        let missing: Vec<i32> = self.partitions.difference(&available).copied().collect();
        if !missing.is_empty() {
            warn!(?missing, "configured partitions do not exist on the stream");
        }

        Ok(self.partitions.intersection(&available).copied().collect())
    }

    async fn release(&self, _partitions: &[i32]) -> Result<(), CoordinationError> {
        Ok(())
    }
}
