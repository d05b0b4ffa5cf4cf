//! Classification policy table.
//!
//! Maps a catalog classification type (e.g. `MICROSOFT.FINANCIAL.CREDIT_CARD_NUMBER`)
//! to the sensitivity label that data carrying it must be declared with, and the
//! minimum encryption level it must be stored at. Loaded once at startup from a
//! JSON document and read-only afterwards:
//!
//! ```json
//! {
//!   "sensitivity_labels": {
//!     "Contoso_IC_Confidential": "confidential",
//!     "Contoso_IC_Sensitive": "sensitive"
//!   },
//!   "classifications": {
//!     "MICROSOFT.PERSONAL.NAME": { "sensitivity": "Contoso_IC_Confidential", "encryption": 0 },
//!     "MICROSOFT.FINANCIAL.CREDIT_CARD_NUMBER": { "sensitivity": "Contoso_IC_Sensitive", "encryption": 1 }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {error}")]
    Read {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to parse policy document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("classification {classification} references undeclared sensitivity label {label}")]
    UndeclaredLabel {
        classification: String,
        label: String,
    },
    #[error("{0} is not a valid encryption level")]
    InvalidEncryptionLevel(String),
}

/// Policy-level bucket a sensitivity label belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityTier {
    Public,
    General,
    Confidential,
    Sensitive,
}

impl FromStr for SensitivityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "public" => Ok(SensitivityTier::Public),
            "general" => Ok(SensitivityTier::General),
            "confidential" => Ok(SensitivityTier::Confidential),
            "sensitive" | "highly_confidential" => Ok(SensitivityTier::Sensitive),
            _ => Err(format!("Unknown sensitivity tier: {s}")),
        }
    }
}

/// Ordered encryption requirement. Level 0 means unencrypted; a stored level
/// meets a requirement when it is at least as high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct EncryptionLevel(u8);

impl EncryptionLevel {
    pub const NONE: EncryptionLevel = EncryptionLevel(0);

    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn meets(&self, required: EncryptionLevel) -> bool {
        *self >= required
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EncryptionLevel {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .map(EncryptionLevel)
            .map_err(|_| PolicyError::InvalidEncryptionLevel(s.to_owned()))
    }
}

impl TryFrom<&serde_json::Value> for EncryptionLevel {
    type Error = PolicyError;

    /// The catalog stores encryption as either a number or a numeric string.
    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .map(EncryptionLevel)
                .ok_or_else(|| PolicyError::InvalidEncryptionLevel(n.to_string())),
            serde_json::Value::String(s) => s.parse(),
            other => Err(PolicyError::InvalidEncryptionLevel(other.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for EncryptionLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        EncryptionLevel::try_from(&value).map_err(serde::de::Error::custom)
    }
}

/// A named sensitivity label as used in the catalog glossary, with its tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SensitivityLabel {
    pub name: String,
    pub tier: SensitivityTier,
}

/// What a classification requires: declared label and minimum encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyEntry {
    pub classification_type: String,
    pub sensitivity: SensitivityLabel,
    pub required_encryption: EncryptionLevel,
}

#[derive(Deserialize)]
struct PolicyDocument {
    sensitivity_labels: HashMap<String, SensitivityTier>,
    classifications: HashMap<String, ClassificationRequirement>,
}

#[derive(Deserialize)]
struct ClassificationRequirement {
    sensitivity: String,
    encryption: EncryptionLevel,
}

#[derive(Debug, Clone, Default)]
pub struct ClassificationPolicyTable {
    entries: HashMap<String, PolicyEntry>,
}

impl ClassificationPolicyTable {
    pub fn new(entries: impl IntoIterator<Item = PolicyEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.classification_type.clone(), e))
                .collect(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| PolicyError::Read {
            path: path.display().to_string(),
            error,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, PolicyError> {
        let document: PolicyDocument = serde_json::from_str(raw)?;

        let mut entries = HashMap::with_capacity(document.classifications.len());
        for (classification, requirement) in document.classifications {
            let Some(tier) = document.sensitivity_labels.get(&requirement.sensitivity) else {
                return Err(PolicyError::UndeclaredLabel {
                    classification,
                    label: requirement.sensitivity,
                });
            };
            let entry = PolicyEntry {
                classification_type: classification.clone(),
                sensitivity: SensitivityLabel {
                    name: requirement.sensitivity,
                    tier: *tier,
                },
                required_encryption: requirement.encryption,
            };
            entries.insert(classification, entry);
        }

        Ok(Self { entries })
    }

    /// Absence is not an error: callers treat it as "no policy, no alert".
    pub fn lookup(&self, classification_type: &str) -> Option<&PolicyEntry> {
        self.entries.get(classification_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
