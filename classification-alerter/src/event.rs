//! Wire contract of catalog change notifications.
//!
//! Only the fields the processor relies on are modelled; anything else in the
//! notification is ignored.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("event body is not a valid notification: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("classification event has no entity guid")]
    MissingEntityGuid,
}

/// Opaque stable identifier of a catalog entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityGuid(String);

impl EntityGuid {
    pub fn new(guid: impl Into<String>) -> Self {
        Self(guid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationType {
    ClassificationAdd,
    ClassificationUpdate,
    Other(String),
}

impl OperationType {
    pub fn triggers_evaluation(&self) -> bool {
        matches!(
            self,
            OperationType::ClassificationAdd | OperationType::ClassificationUpdate
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            OperationType::ClassificationAdd => "CLASSIFICATION_ADD",
            OperationType::ClassificationUpdate => "CLASSIFICATION_UPDATE",
            OperationType::Other(other) => other,
        }
    }
}

impl From<String> for OperationType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CLASSIFICATION_ADD" => OperationType::ClassificationAdd,
            "CLASSIFICATION_UPDATE" => OperationType::ClassificationUpdate,
            _ => OperationType::Other(value),
        }
    }
}

#[derive(Deserialize)]
struct RawNotification {
    message: RawMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    operation_type: String,
    entity: Option<RawEntityHeader>,
}

#[derive(Deserialize)]
struct RawEntityHeader {
    guid: Option<String>,
}

/// A parsed change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub operation_type: OperationType,
    pub entity_guid: Option<EntityGuid>,
}

impl ChangeNotification {
    pub fn parse(body: &[u8]) -> Result<Self, EventParseError> {
        let raw: RawNotification = serde_json::from_slice(body)?;
        let entity_guid = raw
            .message
            .entity
            .and_then(|e| e.guid)
            .filter(|g| !g.is_empty())
            .map(EntityGuid);

        Ok(Self {
            operation_type: raw.message.operation_type.into(),
            entity_guid,
        })
    }

    /// The guid of the entity a classification event refers to.
    pub fn classified_entity(&self) -> Result<&EntityGuid, EventParseError> {
        self.entity_guid
            .as_ref()
            .ok_or(EventParseError::MissingEntityGuid)
    }
}
