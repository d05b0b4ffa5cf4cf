//! Partition ownership: which instance of the consumer group reads which partition.

pub mod balancer;
pub mod fixed;
pub mod lease;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::checkpoint::StoreError;

pub use fixed::FixedCoordinator;
pub use lease::LeaseCoordinator;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("ownership store failed: {0}")]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait OwnershipCoordinator: Send + Sync {
    fn owner_id(&self) -> &str;

    /// Run one ownership cycle against the partitions the stream currently
    /// has, returning the set this instance owns afterwards.
    async fn rebalance(&self, partitions: &[i32]) -> Result<BTreeSet<i32>, CoordinationError>;

    /// Give up ownership, so another instance can pick the partitions up
    /// without waiting for the lease to expire.
    async fn release(&self, partitions: &[i32]) -> Result<(), CoordinationError>;
}
