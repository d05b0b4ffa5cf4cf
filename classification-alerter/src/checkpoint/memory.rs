use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::checkpoint::{CheckpointStore, Ownership, OwnershipClaim, StoreError};
use crate::types::{CheckpointKey, StreamScope};

type OwnershipTable = HashMap<StreamScope, HashMap<i32, Ownership>>;

/// In-process store. Shared between consumers of one process it behaves like
/// the database-backed store, which makes it the backbone of the tests.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<CheckpointKey, i64>,
    ownership: Mutex<OwnershipTable>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ownership_guard(&self) -> Result<std::sync::MutexGuard<'_, OwnershipTable>, StoreError> {
        self.ownership
            .lock()
            .map_err(|_| StoreError::Unavailable("ownership lock poisoned".to_string()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<i64>, StoreError> {
        Ok(self.checkpoints.get(key).map(|entry| *entry))
    }

    async fn save(&self, key: &CheckpointKey, sequence_number: i64) -> Result<bool, StoreError> {
        match self.checkpoints.entry(key.clone()) {
            Entry::Occupied(mut current) => {
                if sequence_number > *current.get() {
                    current.insert(sequence_number);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(sequence_number);
                Ok(true)
            }
        }
    }

    async fn list_ownership(&self, scope: &StreamScope) -> Result<Vec<Ownership>, StoreError> {
        let guard = self.ownership_guard()?;
        let mut records: Vec<Ownership> = guard
            .get(scope)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|o| o.partition);
        Ok(records)
    }

    async fn claim_ownership(
        &self,
        scope: &StreamScope,
        claims: Vec<OwnershipClaim>,
    ) -> Result<Vec<Ownership>, StoreError> {
        let mut guard = self.ownership_guard()?;
        let records = guard.entry(scope.clone()).or_default();
        let now = Utc::now();

        let mut won = Vec::with_capacity(claims.len());
        for claim in claims {
            let current_version = records.get(&claim.partition).map(|o| o.version);
            if current_version != claim.expected_version {
                continue;
            }

            let ownership = Ownership {
                partition: claim.partition,
                owner_id: claim.owner_id,
                version: current_version.unwrap_or(0) + 1,
                last_modified: now,
            };
            records.insert(claim.partition, ownership.clone());
            won.push(ownership);
        }

        Ok(won)
    }
}
