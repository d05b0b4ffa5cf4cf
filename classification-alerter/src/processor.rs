//! Event processor: parse, enrich via the catalog, evaluate rules, emit alerts.
//!
//! Every outcome that says something about the event itself (non-classification
//! operation, deleted entity, classification without a policy, malformed body)
//! is a [`Completion`] and lets the checkpoint advance. Only failures of the
//! collaborators (catalog, alert sink, dead-letter sink) are [`ProcessError`]s,
//! and all of them mean "retry this event".

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{LookupError, LookupOutcome, MetadataLookup, SnapshotError};
use crate::event::{ChangeNotification, EntityGuid};
use crate::metrics_consts::{
    ALERTS_RAISED, EVENTS_PROCESSED, EVENT_PROCESSING_DURATION_MS, MALFORMED_EVENTS,
    UNKNOWN_CLASSIFICATIONS,
};
use crate::policy::ClassificationPolicyTable;
use crate::rules;
use crate::sink::{AlertSink, DeadLetterSink, SinkError};
use crate::types::StreamEvent;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with an event whose body cannot be understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedEventPolicy {
    Skip,
    DeadLetter,
}

impl FromStr for MalformedEventPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "skip" => Ok(MalformedEventPolicy::Skip),
            "dead_letter" | "dead-letter" => Ok(MalformedEventPolicy::DeadLetter),
            other => Err(format!(
                "Unknown malformed event policy: {other}, must be skip or dead_letter"
            )),
        }
    }
}

enum MalformedHandling {
    Skip,
    DeadLetter(Arc<dyn DeadLetterSink>),
}

/// How an event finished. All variants allow the checkpoint to advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Not a classification event.
    Ignored { operation_type: String },
    /// The catalog no longer knows the entity.
    EntityNotFound { guid: EntityGuid },
    /// The entity carries no classification to evaluate.
    Unclassified { guid: EntityGuid },
    /// The classification has no entry in the policy table.
    UnknownClassification {
        guid: EntityGuid,
        classification_type: String,
    },
    /// The catalog returned an entity we cannot build a snapshot from.
    InvalidEntity { guid: EntityGuid, reason: String },
    /// Malformed body, logged and dropped.
    Skipped { reason: String },
    /// Malformed body, handed to the dead-letter sink.
    DeadLettered { reason: String },
    Evaluated { guid: EntityGuid, alerts: usize },
}

impl Completion {
    pub fn label(&self) -> &'static str {
        match self {
            Completion::Ignored { .. } => "ignored",
            Completion::EntityNotFound { .. } => "entity_not_found",
            Completion::Unclassified { .. } => "unclassified",
            Completion::UnknownClassification { .. } => "unknown_classification",
            Completion::InvalidEntity { .. } => "invalid_entity",
            Completion::Skipped { .. } => "skipped",
            Completion::DeadLettered { .. } => "dead_lettered",
            Completion::Evaluated { .. } => "evaluated",
        }
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("metadata lookup failed: {0}")]
    Lookup(#[from] LookupError),
    #[error("failed to emit alert: {0}")]
    Emit(#[source] SinkError),
    #[error("failed to dead-letter event: {0}")]
    DeadLetter(#[source] SinkError),
}

impl ProcessError {
    pub fn reason(&self) -> &'static str {
        match self {
            ProcessError::Lookup(e) => e.kind(),
            ProcessError::Emit(_) => "emit",
            ProcessError::DeadLetter(_) => "dead_letter",
        }
    }
}

pub type ProcessOutcome = Result<Completion, ProcessError>;

/// Seam between the stream consumer and whatever handles its events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn process(&self, event: &StreamEvent) -> ProcessOutcome;
}

pub struct EventProcessor {
    lookup: Arc<dyn MetadataLookup>,
    policy: Arc<ClassificationPolicyTable>,
    alerts: Arc<dyn AlertSink>,
    malformed: MalformedHandling,
    lookup_timeout: Duration,
}

impl EventProcessor {
    pub fn new(
        lookup: Arc<dyn MetadataLookup>,
        policy: Arc<ClassificationPolicyTable>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            lookup,
            policy,
            alerts,
            malformed: MalformedHandling::Skip,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Route malformed events to `sink` instead of dropping them.
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.malformed = MalformedHandling::DeadLetter(sink);
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    async fn handle_malformed(&self, event: &StreamEvent, reason: String) -> ProcessOutcome {
        match &self.malformed {
            MalformedHandling::Skip => {
                warn!(
                    partition = event.partition,
                    sequence_number = event.sequence_number,
                    reason = %reason,
                    "skipping malformed event"
                );
                metrics::counter!(MALFORMED_EVENTS, "action" => "skip").increment(1);
                Ok(Completion::Skipped { reason })
            }
            MalformedHandling::DeadLetter(sink) => {
                sink.dead_letter(event, &reason)
                    .await
                    .map_err(ProcessError::DeadLetter)?;
                warn!(
                    partition = event.partition,
                    sequence_number = event.sequence_number,
                    reason = %reason,
                    "dead-lettered malformed event"
                );
                metrics::counter!(MALFORMED_EVENTS, "action" => "dead_letter").increment(1);
                Ok(Completion::DeadLettered { reason })
            }
        }
    }

    async fn lookup(&self, guid: &EntityGuid) -> Result<LookupOutcome, LookupError> {
        match tokio::time::timeout(self.lookup_timeout, self.lookup.lookup(guid)).await {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout),
        }
    }

    async fn evaluate(&self, event: &StreamEvent) -> ProcessOutcome {
        let notification = match ChangeNotification::parse(&event.body) {
            Ok(notification) => notification,
            Err(e) => return self.handle_malformed(event, e.to_string()).await,
        };

        if !notification.operation_type.triggers_evaluation() {
            debug!(
                partition = event.partition,
                sequence_number = event.sequence_number,
                operation_type = notification.operation_type.as_str(),
                "ignoring non-classification event"
            );
            return Ok(Completion::Ignored {
                operation_type: notification.operation_type.as_str().to_owned(),
            });
        }

        let guid = match notification.classified_entity() {
            Ok(guid) => guid.clone(),
            Err(e) => return self.handle_malformed(event, e.to_string()).await,
        };

        let entity = match self.lookup(&guid).await? {
            LookupOutcome::Found(entity) => entity,
            LookupOutcome::NotFound => {
                info!(guid = %guid, "entity no longer exists in catalog, nothing to evaluate");
                return Ok(Completion::EntityNotFound { guid });
            }
        };

        let snapshot = match entity.snapshot(&guid) {
            Ok(snapshot) => snapshot,
            Err(SnapshotError::NoClassification) => {
                info!(guid = %guid, "entity carries no classification");
                return Ok(Completion::Unclassified { guid });
            }
            Err(e) => {
                warn!(guid = %guid, error = ?e, "cannot evaluate catalog entity");
                return Ok(Completion::InvalidEntity {
                    guid,
                    reason: e.to_string(),
                });
            }
        };

        let Some(policy) = self.policy.lookup(&snapshot.classification_type) else {
            warn!(
                guid = %guid,
                classification_type = snapshot.classification_type.as_str(),
                "classification has no policy entry"
            );
            metrics::counter!(UNKNOWN_CLASSIFICATIONS).increment(1);
            return Ok(Completion::UnknownClassification {
                guid,
                classification_type: snapshot.classification_type,
            });
        };

        let alerts = rules::evaluate(&snapshot, policy, Utc::now());
        for alert in &alerts {
            self.alerts.emit(alert).await.map_err(ProcessError::Emit)?;
            metrics::counter!(ALERTS_RAISED, "code" => alert.code.as_str()).increment(1);
        }

        Ok(Completion::Evaluated {
            guid,
            alerts: alerts.len(),
        })
    }
}

#[async_trait]
impl EventHandler for EventProcessor {
    async fn process(&self, event: &StreamEvent) -> ProcessOutcome {
        let start = Instant::now();
        let outcome = self.evaluate(event).await;

        let label = match &outcome {
            Ok(completion) => completion.label(),
            Err(_) => "retryable_error",
        };
        metrics::counter!(EVENTS_PROCESSED, "outcome" => label).increment(1);
        metrics::histogram!(EVENT_PROCESSING_DURATION_MS)
            .record(start.elapsed().as_millis() as f64);

        outcome
    }
}
