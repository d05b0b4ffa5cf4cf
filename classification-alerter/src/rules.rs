//! Rule engine: pure evaluation of an entity snapshot against its policy entry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::EntitySnapshot;
use crate::policy::{EncryptionLevel, PolicyEntry, SensitivityLabel, SensitivityTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertCode {
    /// Sensitive data stored below its required encryption level.
    #[serde(rename = "ALERT-001")]
    UnencryptedSensitiveData,
    /// The declared sensitivity differs from the one implied by the detected classification.
    #[serde(rename = "ALERT-002")]
    DeclaredSensitivityMismatch,
}

impl AlertCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCode::UnencryptedSensitiveData => "ALERT-001",
            AlertCode::DeclaredSensitivityMismatch => "ALERT-002",
        }
    }

    fn cause(&self, label: &SensitivityLabel) -> String {
        match self {
            AlertCode::UnencryptedSensitiveData => {
                format!("Detected data classification {} in sample data", label.name)
            }
            AlertCode::DeclaredSensitivityMismatch => {
                "Detected schema classification does not match the declared state".to_string()
            }
        }
    }

    fn action(&self) -> &'static str {
        match self {
            AlertCode::UnencryptedSensitiveData => "Data must be encrypted",
            AlertCode::DeclaredSensitivityMismatch => {
                "Must change declared classification to match actual"
            }
        }
    }
}

impl fmt::Display for AlertCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy violation found on one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub code: AlertCode,
    pub cause: String,
    pub action: String,
    pub entity: EntitySnapshot,
    /// Sensitivity implied by the entity's classification.
    pub resulting_sensitivity: SensitivityLabel,
    pub required_encryption: EncryptionLevel,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    fn new(
        code: AlertCode,
        snapshot: &EntitySnapshot,
        policy: &PolicyEntry,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            cause: code.cause(&policy.sensitivity),
            action: code.action().to_string(),
            entity: snapshot.clone(),
            resulting_sensitivity: policy.sensitivity.clone(),
            required_encryption: policy.required_encryption,
            raised_at,
        }
    }
}

/// Evaluate both rules. The result is fully determined by the arguments, and
/// ALERT-001 always precedes ALERT-002 when both fire.
pub fn evaluate(
    snapshot: &EntitySnapshot,
    policy: &PolicyEntry,
    raised_at: DateTime<Utc>,
) -> Vec<Alert> {
    let mut alerts = Vec::with_capacity(2);

    let required = policy.required_encryption;
    if policy.sensitivity.tier == SensitivityTier::Sensitive
        && !snapshot.current_encryption.meets(required)
    {
        alerts.push(Alert::new(
            AlertCode::UnencryptedSensitiveData,
            snapshot,
            policy,
            raised_at,
        ));
    }

    if snapshot.declared_sensitivity.as_deref() != Some(policy.sensitivity.name.as_str()) {
        alerts.push(Alert::new(
            AlertCode::DeclaredSensitivityMismatch,
            snapshot,
            policy,
            raised_at,
        ));
    }

    alerts
}
