//! Shared test helpers: scripted collaborators and sample data, used by the
//! unit tests and by the integration tests under `tests/`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::catalog::record::{ClassificationRef, RelationshipAttributes, TermRef};
use crate::catalog::{EntityRecord, EntitySnapshot, LookupError, LookupOutcome, MetadataLookup};
use crate::checkpoint::{
    CheckpointStore, MemoryCheckpointStore, Ownership, OwnershipClaim, StoreError,
};
use crate::event::EntityGuid;
use crate::policy::{
    ClassificationPolicyTable, EncryptionLevel, PolicyEntry, SensitivityLabel, SensitivityTier,
};
use crate::processor::{Completion, EventHandler, ProcessError, ProcessOutcome};
use crate::rules::{Alert, AlertCode};
use crate::sink::{AlertSink, DeadLetterSink, SinkError};
use crate::types::{CheckpointKey, StreamEvent, StreamScope};

pub const CREDIT_CARD: &str = "MICROSOFT.FINANCIAL.CREDIT_CARD_NUMBER";
pub const SENSITIVE: &str = "Contoso_IC_Sensitive";
pub const CONFIDENTIAL: &str = "Contoso_IC_Confidential";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Body of a catalog change notification as it arrives on the stream.
pub fn notification_body(operation_type: &str, guid: &str) -> Vec<u8> {
    json!({
        "version": {"version": "1.0.0"},
        "msgCreationTime": 1640995200000_i64,
        "message": {
            "type": "ENTITY_NOTIFICATION_V2",
            "operationType": operation_type,
            "entity": {"guid": guid, "typeName": "azure_sql_column"},
            "eventTime": 1640995200000_i64
        }
    })
    .to_string()
    .into_bytes()
}

pub fn classification_event(
    partition: i32,
    sequence_number: i64,
    operation_type: &str,
    guid: &str,
) -> StreamEvent {
    StreamEvent::new(
        partition,
        sequence_number,
        notification_body(operation_type, guid),
    )
}

/// A column entity carrying `classification`, declared with `declared` and
/// stored at `encryption`.
pub fn column_entity(
    guid: &str,
    classification: &str,
    declared: Option<&str>,
    encryption: u8,
) -> EntityRecord {
    let mut attributes = Map::new();
    attributes.insert("name".to_string(), json!("card_number"));
    attributes.insert(
        "qualifiedName".to_string(),
        json!("mssql://srv/db/dbo/payments#card_number"),
    );
    attributes.insert("data_type".to_string(), json!("nvarchar"));
    attributes.insert("encryptionType".to_string(), Value::from(encryption));

    EntityRecord {
        guid: Some(guid.to_string()),
        type_name: Some("azure_sql_column".to_string()),
        status: Some("ACTIVE".to_string()),
        attributes,
        classifications: vec![ClassificationRef {
            type_name: classification.to_string(),
        }],
        relationship_attributes: RelationshipAttributes {
            meanings: declared.map(|d| {
                vec![TermRef {
                    display_text: Some(d.to_string()),
                }]
            }),
        },
        update_time: Some(1640995200000),
    }
}

fn label(name: &str, tier: SensitivityTier) -> SensitivityLabel {
    SensitivityLabel {
        name: name.to_string(),
        tier,
    }
}

/// Credit cards are sensitive and must be encrypted; names and emails are
/// confidential. IP addresses have no entry.
pub fn policy_table() -> ClassificationPolicyTable {
    ClassificationPolicyTable::new([
        PolicyEntry {
            classification_type: CREDIT_CARD.to_string(),
            sensitivity: label(SENSITIVE, SensitivityTier::Sensitive),
            required_encryption: EncryptionLevel::new(1),
        },
        PolicyEntry {
            classification_type: "MICROSOFT.PERSONAL.NAME".to_string(),
            sensitivity: label(CONFIDENTIAL, SensitivityTier::Confidential),
            required_encryption: EncryptionLevel::NONE,
        },
        PolicyEntry {
            classification_type: "MICROSOFT.PERSONAL.EMAIL".to_string(),
            sensitivity: label(CONFIDENTIAL, SensitivityTier::Confidential),
            required_encryption: EncryptionLevel::NONE,
        },
    ])
}

/// ALERT-001 for an unencrypted credit card column that is correctly declared.
pub fn sample_alert(guid: &str) -> Alert {
    Alert {
        code: AlertCode::UnencryptedSensitiveData,
        cause: format!("Detected data classification {SENSITIVE} in sample data"),
        action: "Data must be encrypted".to_string(),
        entity: EntitySnapshot {
            guid: EntityGuid::new(guid),
            column_name: "card_number".to_string(),
            qualified_name: "mssql://srv/db/dbo/payments#card_number".to_string(),
            data_type: Some("nvarchar".to_string()),
            classification_type: CREDIT_CARD.to_string(),
            declared_sensitivity: Some(SENSITIVE.to_string()),
            current_encryption: EncryptionLevel::NONE,
            updated_at: DateTime::from_timestamp_millis(1640995200000),
        },
        resulting_sensitivity: label(SENSITIVE, SensitivityTier::Sensitive),
        required_encryption: EncryptionLevel::new(1),
        raised_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct CollectingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CollectingAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).clone()
    }
}

#[async_trait]
impl AlertSink for CollectingAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), SinkError> {
        lock(&self.alerts).push(alert.clone());
        Ok(())
    }
}

pub struct FailingAlertSink;

#[async_trait]
impl AlertSink for FailingAlertSink {
    async fn emit(&self, _alert: &Alert) -> Result<(), SinkError> {
        Err(SinkError::Io(io::Error::other("alert sink unavailable")))
    }
}

/// Fails the first `n` emits, then delivers.
pub struct FlakyAlertSink {
    failures_left: AtomicUsize,
    delivered: Mutex<Vec<Alert>>,
}

impl FlakyAlertSink {
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<Alert> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl AlertSink for FlakyAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), SinkError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Io(io::Error::other("alert sink unavailable")));
        }
        lock(&self.delivered).push(alert.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingDeadLetterSink {
    events: Mutex<Vec<(StreamEvent, String)>>,
}

impl CollectingDeadLetterSink {
    pub fn events(&self) -> Vec<(StreamEvent, String)> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl DeadLetterSink for CollectingDeadLetterSink {
    async fn dead_letter(&self, event: &StreamEvent, reason: &str) -> Result<(), SinkError> {
        lock(&self.events).push((event.clone(), reason.to_string()));
        Ok(())
    }
}

/// In-memory writer whose contents can be read back after handing a clone
/// to a sink.
#[derive(Default, Clone)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Script {
    failures_left: usize,
    outcome: LookupOutcome,
}

/// Catalog stand-in answering from a per-guid script. Unscripted guids are
/// not found.
#[derive(Default)]
pub struct ScriptedLookup {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedLookup {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn found(&self, guid: &str, entity: EntityRecord) {
        self.script(guid, LookupOutcome::Found(Box::new(entity)));
    }

    pub fn not_found(&self, guid: &str) {
        self.script(guid, LookupOutcome::NotFound);
    }

    /// Fail the next `times` lookups of `guid` before answering as scripted.
    pub fn fail(&self, guid: &str, times: usize) {
        lock(&self.scripts)
            .entry(guid.to_string())
            .or_insert(Script {
                failures_left: 0,
                outcome: LookupOutcome::NotFound,
            })
            .failures_left = times;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn script(&self, guid: &str, outcome: LookupOutcome) {
        let mut scripts = lock(&self.scripts);
        let failures_left = scripts.get(guid).map_or(0, |s| s.failures_left);
        scripts.insert(
            guid.to_string(),
            Script {
                failures_left,
                outcome,
            },
        );
    }
}

#[async_trait]
impl MetadataLookup for ScriptedLookup {
    async fn lookup(&self, guid: &EntityGuid) -> Result<LookupOutcome, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut scripts = lock(&self.scripts);
        match scripts.get_mut(guid.as_str()) {
            Some(script) if script.failures_left > 0 => {
                script.failures_left -= 1;
                Err(LookupError::Status {
                    status: 503,
                    body: "catalog unavailable".to_string(),
                })
            }
            Some(script) => Ok(script.outcome.clone()),
            None => Ok(LookupOutcome::NotFound),
        }
    }
}

/// Records every processing attempt; selected sequence numbers fail a
/// number of times first.
#[derive(Default)]
pub struct RecordingHandler {
    attempts: Mutex<Vec<(i32, i64)>>,
    failures: Mutex<HashMap<i64, usize>>,
    delay: Mutex<Duration>,
}

impl RecordingHandler {
    /// Hold every event inside `process` for `delay` after recording it.
    pub fn delay_each(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn fail_sequence(&self, sequence_number: i64, times: usize) {
        lock(&self.failures).insert(sequence_number, times);
    }

    /// Sequence numbers attempted on `partition`, in attempt order.
    pub fn sequence_numbers(&self, partition: i32) -> Vec<i64> {
        lock(&self.attempts)
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn process(&self, event: &StreamEvent) -> ProcessOutcome {
        lock(&self.attempts).push((event.partition, event.sequence_number));

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(left) = lock(&self.failures).get_mut(&event.sequence_number) {
            if *left > 0 {
                *left -= 1;
                return Err(ProcessError::Lookup(LookupError::Timeout));
            }
        }
        Ok(Completion::Skipped {
            reason: "recorded".to_string(),
        })
    }
}

/// Memory store whose first `n` saves fail.
pub struct FlakyCheckpointStore {
    inner: MemoryCheckpointStore,
    failures_left: AtomicUsize,
    save_attempts: AtomicUsize,
}

impl FlakyCheckpointStore {
    pub fn failing_saves(n: usize) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            failures_left: AtomicUsize::new(n),
            save_attempts: AtomicUsize::new(0),
        }
    }

    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<i64>, StoreError> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &CheckpointKey, sequence_number: i64) -> Result<bool, StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected save failure".to_string()));
        }
        self.inner.save(key, sequence_number).await
    }

    async fn list_ownership(&self, scope: &StreamScope) -> Result<Vec<Ownership>, StoreError> {
        self.inner.list_ownership(scope).await
    }

    async fn claim_ownership(
        &self,
        scope: &StreamScope,
        claims: Vec<OwnershipClaim>,
    ) -> Result<Vec<Ownership>, StoreError> {
        self.inner.claim_ownership(scope, claims).await
    }
}

/// Poll `store` until the checkpoint of `key` reaches `sequence_number`.
/// Panics after five seconds.
pub async fn wait_for_checkpoint(
    store: &dyn CheckpointStore,
    key: &CheckpointKey,
    sequence_number: i64,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(committed)) = store.load(key).await {
            if committed >= sequence_number {
                return;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("checkpoint {key} did not reach {sequence_number}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
