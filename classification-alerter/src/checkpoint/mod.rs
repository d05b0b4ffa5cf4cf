//! Durable per-partition progress, and the ownership records partitions are
//! arbitrated with.
//!
//! Checkpoints are keyed by `(consumer_group, stream, partition)` and only move
//! forward: saving a sequence number at or below the stored one is a no-op, so
//! a consumer that briefly overlaps with the next owner during a handoff cannot
//! move a partition backwards.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{CheckpointKey, StreamScope};

pub use memory::MemoryCheckpointStore;
pub use postgres::PgCheckpointStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreation { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("migrations failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Who holds the lease on a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub partition: i32,
    /// Empty once the owner released the partition.
    pub owner_id: String,
    /// Bumped by every successful claim; claims must name the version they saw.
    pub version: i64,
    pub last_modified: DateTime<Utc>,
}

impl Ownership {
    pub fn is_released(&self) -> bool {
        self.owner_id.is_empty()
    }

    pub fn is_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match chrono::Duration::from_std(lease) {
            Ok(lease) => self.last_modified + lease <= now,
            Err(_) => false,
        }
    }

    /// Held by someone whose lease is still running.
    pub fn is_active(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        !self.is_released() && !self.is_expired(now, lease)
    }
}

/// A compare-and-swap request on one ownership record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipClaim {
    pub partition: i32,
    /// New owner; empty to release.
    pub owner_id: String,
    /// Version the caller last saw, `None` if it saw no record at all.
    pub expected_version: Option<i64>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<i64>, StoreError>;

    /// Returns whether the stored checkpoint moved forward.
    async fn save(&self, key: &CheckpointKey, sequence_number: i64) -> Result<bool, StoreError>;

    async fn list_ownership(&self, scope: &StreamScope) -> Result<Vec<Ownership>, StoreError>;

    /// Applies each claim whose expected version still matches. Returns the
    /// records of the claims that won; the rest lost a race and are omitted.
    async fn claim_ownership(
        &self,
        scope: &StreamScope,
        claims: Vec<OwnershipClaim>,
    ) -> Result<Vec<Ownership>, StoreError>;
}
