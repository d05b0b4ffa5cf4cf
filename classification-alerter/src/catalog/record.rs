use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::EntityGuid;
use crate::policy::{EncryptionLevel, PolicyError};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("entity is missing attribute {0}")]
    MissingAttribute(&'static str),
    #[error("entity carries no classification")]
    NoClassification,
    #[error("entity has an invalid encryption attribute: {0}")]
    InvalidEncryption(#[from] PolicyError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRef {
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermRef {
    pub display_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipAttributes {
    pub meanings: Option<Vec<TermRef>>,
}

/// An entity as returned by the catalog: attributes, classifications,
/// relationship metadata and last update time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub guid: Option<String>,
    pub type_name: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub classifications: Vec<ClassificationRef>,
    #[serde(default)]
    pub relationship_attributes: RelationshipAttributes,
    /// Milliseconds since the epoch.
    pub update_time: Option<i64>,
}

impl EntityRecord {
    pub fn is_deleted(&self) -> bool {
        self.status.as_deref() == Some("DELETED")
    }

    fn string_attribute(&self, name: &'static str) -> Option<String> {
        match self.attributes.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Build the point-in-time view the rule engine evaluates.
    ///
    /// The first classification is the one evaluated, the first glossary term
    /// is the declared sensitivity. A missing `encryptionType` attribute means
    /// the column is unencrypted.
    pub fn snapshot(&self, guid: &EntityGuid) -> Result<EntitySnapshot, SnapshotError> {
        let column_name = self
            .string_attribute("name")
            .ok_or(SnapshotError::MissingAttribute("name"))?;
        let qualified_name = self
            .string_attribute("qualifiedName")
            .ok_or(SnapshotError::MissingAttribute("qualifiedName"))?;
        let classification_type = self
            .classifications
            .first()
            .map(|c| c.type_name.clone())
            .ok_or(SnapshotError::NoClassification)?;

        let current_encryption = match self.attributes.get("encryptionType") {
            None | Some(Value::Null) => EncryptionLevel::NONE,
            Some(value) => EncryptionLevel::try_from(value)?,
        };

        let declared_sensitivity = self
            .relationship_attributes
            .meanings
            .as_ref()
            .and_then(|m| m.first())
            .and_then(|t| t.display_text.clone());

        Ok(EntitySnapshot {
            guid: guid.clone(),
            column_name,
            qualified_name,
            data_type: self.string_attribute("data_type"),
            classification_type,
            declared_sensitivity,
            current_encryption,
            updated_at: self.update_time.and_then(DateTime::from_timestamp_millis),
        })
    }
}

/// The enriched view of one entity at processing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySnapshot {
    pub guid: EntityGuid,
    pub column_name: String,
    pub qualified_name: String,
    pub data_type: Option<String>,
    pub classification_type: String,
    pub declared_sensitivity: Option<String>,
    pub current_encryption: EncryptionLevel,
    pub updated_at: Option<DateTime<Utc>>,
}
