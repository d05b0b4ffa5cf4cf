//! Metadata lookup against the data catalog.

pub mod auth;
pub mod client;
pub mod record;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::EntityGuid;

pub use client::{CatalogClient, CatalogClientConfig};
pub use record::{EntityRecord, EntitySnapshot, SnapshotError};

/// Result of a successful conversation with the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(Box<EntityRecord>),
    /// The entity does not exist (anymore). Expected for deleted entities.
    NotFound,
}

/// Failures talking to the catalog. All of them are retryable: none of them
/// say anything about the entity itself.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("catalog request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("catalog lookup timed out")]
    Timeout,
    #[error("catalog rejected credentials with status {status}")]
    Unauthorized { status: u16 },
    #[error("catalog responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode catalog response: {0}")]
    Decode(#[source] reqwest::Error),
    #[error(transparent)]
    Auth(#[from] auth::AuthError),
}

impl LookupError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LookupError::Transport(_) => "transport",
            LookupError::Timeout => "timeout",
            LookupError::Unauthorized { .. } => "unauthorized",
            LookupError::Status { .. } => "status",
            LookupError::Decode(_) => "decode",
            LookupError::Auth(_) => "auth",
        }
    }
}

#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, guid: &EntityGuid) -> Result<LookupOutcome, LookupError>;
}
