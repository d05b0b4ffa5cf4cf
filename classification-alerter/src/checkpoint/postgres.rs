use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::checkpoint::{CheckpointStore, Ownership, OwnershipClaim, StoreError};
use crate::types::{CheckpointKey, StreamScope};

#[derive(sqlx::FromRow)]
struct OwnershipRow {
    partition_id: i32,
    owner_id: String,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl From<OwnershipRow> for Ownership {
    fn from(row: OwnershipRow) -> Self {
        Ownership {
            partition: row.partition_id,
            owner_id: row.owner_id,
            version: row.version,
            last_modified: row.last_modified,
        }
    }
}

/// Checkpoints and ownership records in PostgreSQL, shared by every instance
/// of the consumer group.
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|error| StoreError::PoolCreation { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn claim(
        &self,
        scope: &StreamScope,
        claim: OwnershipClaim,
    ) -> Result<Option<Ownership>, StoreError> {
        let row = match claim.expected_version {
            None => sqlx::query_as::<_, OwnershipRow>(
                r#"
INSERT INTO partition_ownership (consumer_group, stream, partition_id, owner_id, version, last_modified)
VALUES ($1, $2, $3, $4, 1, NOW())
ON CONFLICT (consumer_group, stream, partition_id) DO NOTHING
RETURNING partition_id, owner_id, version, last_modified
"#,
            )
            .bind(scope.consumer_group())
            .bind(scope.stream())
            .bind(claim.partition)
            .bind(&claim.owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "INSERT".to_owned(),
                error,
            })?,
            Some(expected_version) => sqlx::query_as::<_, OwnershipRow>(
                r#"
UPDATE partition_ownership
SET owner_id = $4, version = version + 1, last_modified = NOW()
WHERE consumer_group = $1 AND stream = $2 AND partition_id = $3 AND version = $5
RETURNING partition_id, owner_id, version, last_modified
"#,
            )
            .bind(scope.consumer_group())
            .bind(scope.stream())
            .bind(claim.partition)
            .bind(&claim.owner_id)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?,
        };

        Ok(row.map(Ownership::from))
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<i64>, StoreError> {
        let sequence_number: Option<i64> = sqlx::query_scalar(
            r#"
SELECT sequence_number
FROM stream_checkpoints
WHERE consumer_group = $1 AND stream = $2 AND partition_id = $3
"#,
        )
        .bind(key.consumer_group())
        .bind(key.stream())
        .bind(key.partition())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(sequence_number)
    }

    async fn save(&self, key: &CheckpointKey, sequence_number: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO stream_checkpoints (consumer_group, stream, partition_id, sequence_number, updated_at)
VALUES ($1, $2, $3, $4, NOW())
ON CONFLICT (consumer_group, stream, partition_id) DO UPDATE
SET sequence_number = EXCLUDED.sequence_number, updated_at = EXCLUDED.updated_at
WHERE stream_checkpoints.sequence_number < EXCLUDED.sequence_number
"#,
        )
        .bind(key.consumer_group())
        .bind(key.stream())
        .bind(key.partition())
        .bind(sequence_number)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "UPSERT".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_ownership(&self, scope: &StreamScope) -> Result<Vec<Ownership>, StoreError> {
        let rows = sqlx::query_as::<_, OwnershipRow>(
            r#"
SELECT partition_id, owner_id, version, last_modified
FROM partition_ownership
WHERE consumer_group = $1 AND stream = $2
ORDER BY partition_id
"#,
        )
        .bind(scope.consumer_group())
        .bind(scope.stream())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(rows.into_iter().map(Ownership::from).collect())
    }

    async fn claim_ownership(
        &self,
        scope: &StreamScope,
        claims: Vec<OwnershipClaim>,
    ) -> Result<Vec<Ownership>, StoreError> {
        let mut won = Vec::with_capacity(claims.len());
        for claim in claims {
            if let Some(ownership) = self.claim(scope, claim).await? {
                won.push(ownership);
            }
        }
        Ok(won)
    }
}
