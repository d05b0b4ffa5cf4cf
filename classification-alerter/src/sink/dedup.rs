use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use tracing::debug;

use crate::metrics_consts::ALERTS_SUPPRESSED;
use crate::policy::EncryptionLevel;
use crate::rules::{Alert, AlertCode};
use crate::sink::{AlertSink, SinkError};

const MAX_FINGERPRINTS: u64 = 100_000;

/// Everything that makes two alerts "the same finding". The time the alert was
/// raised is deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlertFingerprint {
    code: AlertCode,
    guid: String,
    classification_type: String,
    declared_sensitivity: Option<String>,
    current_encryption: EncryptionLevel,
    updated_at: Option<DateTime<Utc>>,
}

impl From<&Alert> for AlertFingerprint {
    fn from(alert: &Alert) -> Self {
        Self {
            code: alert.code,
            guid: alert.entity.guid.as_str().to_owned(),
            classification_type: alert.entity.classification_type.clone(),
            declared_sensitivity: alert.entity.declared_sensitivity.clone(),
            current_encryption: alert.entity.current_encryption,
            updated_at: alert.entity.updated_at,
        }
    }
}

/// Suppresses alerts already delivered within the TTL window, so replays after
/// a restart or a retried event do not repeat findings downstream.
pub struct DedupingAlertSink {
    inner: Arc<dyn AlertSink>,
    emitted: Cache<AlertFingerprint, ()>,
}

impl DedupingAlertSink {
    pub fn new(inner: Arc<dyn AlertSink>, ttl: Duration) -> Self {
        let emitted = Cache::builder()
            .max_capacity(MAX_FINGERPRINTS)
            .time_to_live(ttl)
            .build();

        Self { inner, emitted }
    }
}

#[async_trait]
impl AlertSink for DedupingAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), SinkError> {
        let fingerprint = AlertFingerprint::from(alert);
        if self.emitted.contains_key(&fingerprint) {
            debug!(
                code = %alert.code,
                guid = %alert.entity.guid,
                "suppressing already emitted alert"
            );
            metrics::counter!(ALERTS_SUPPRESSED, "code" => alert.code.as_str()).increment(1);
            return Ok(());
        }

        self.inner.emit(alert).await?;

        // Only remembered once delivered, a failed emit must be retried for real.
        self.emitted.insert(fingerprint, ());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_alert, CollectingAlertSink, FlakyAlertSink};

    #[tokio::test]
    async fn identical_alerts_are_emitted_once() {
        let inner = Arc::new(CollectingAlertSink::default());
        let sink = DedupingAlertSink::new(inner.clone(), Duration::from_secs(60));

        let alert = sample_alert("g1");
        sink.emit(&alert).await.unwrap();

        let mut replayed = alert.clone();
        replayed.raised_at = Utc::now() + chrono::Duration::seconds(5);
        sink.emit(&replayed).await.unwrap();

        assert_eq!(inner.alerts().len(), 1);
    }

    #[tokio::test]
    async fn changed_entity_state_is_a_new_alert() {
        let inner = Arc::new(CollectingAlertSink::default());
        let sink = DedupingAlertSink::new(inner.clone(), Duration::from_secs(60));

        let alert = sample_alert("g1");
        sink.emit(&alert).await.unwrap();

        let mut changed = alert.clone();
        changed.entity.declared_sensitivity = Some("Contoso_IC_Confidential".to_string());
        sink.emit(&changed).await.unwrap();
        sink.emit(&sample_alert("g2")).await.unwrap();

        assert_eq!(inner.alerts().len(), 3);
    }

    #[tokio::test]
    async fn failed_delivery_is_not_remembered() {
        let inner = Arc::new(FlakyAlertSink::failing_first(1));
        let sink = DedupingAlertSink::new(inner.clone(), Duration::from_secs(60));

        let alert = sample_alert("g1");
        assert!(sink.emit(&alert).await.is_err());
        sink.emit(&alert).await.unwrap();

        assert_eq!(inner.delivered().len(), 1);
    }

    #[tokio::test]
    async fn fingerprints_expire() {
        let inner = Arc::new(CollectingAlertSink::default());
        let sink = DedupingAlertSink::new(inner.clone(), Duration::from_millis(200));

        let alert = sample_alert("g1");
        sink.emit(&alert).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        sink.emit(&alert).await.unwrap();

        assert_eq!(inner.alerts().len(), 2);
    }
}
