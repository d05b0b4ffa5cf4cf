// ==== Event processing ====
/// Counter for processed events, labelled by `outcome`
pub const EVENTS_PROCESSED: &str = "classification_events_processed_total";

/// Histogram for end-to-end processing time of one event
pub const EVENT_PROCESSING_DURATION_MS: &str = "classification_event_processing_duration_ms";

/// Counter for events whose processing failed and will be retried, labelled by `reason`
pub const EVENT_RETRIES: &str = "classification_event_retries_total";

/// Counter for events that could not be parsed, labelled by `action` (skip / dead_letter)
pub const MALFORMED_EVENTS: &str = "classification_malformed_events_total";

/// Counter for classifications with no entry in the policy table
pub const UNKNOWN_CLASSIFICATIONS: &str = "classification_unknown_classifications_total";

// ==== Catalog ====
/// Counter for catalog lookups, labelled by `outcome`
pub const CATALOG_LOOKUPS: &str = "classification_catalog_lookups_total";

/// Histogram for catalog lookup latency
pub const CATALOG_LOOKUP_DURATION_MS: &str = "classification_catalog_lookup_duration_ms";

// ==== Alerts ====
/// Counter for alerts raised by the rule engine, labelled by `code`
pub const ALERTS_RAISED: &str = "classification_alerts_raised_total";

/// Counter for alerts suppressed because an identical alert was already emitted
pub const ALERTS_SUPPRESSED: &str = "classification_alerts_suppressed_total";

/// Counter for alerts published to the alert topic
pub const ALERTS_PUBLISHED: &str = "classification_alerts_published_total";

/// Counter for events published to the dead-letter topic
pub const DEAD_LETTERED_EVENTS: &str = "classification_dead_lettered_events_total";

// ==== Checkpoints ====
/// Counter for checkpoint commits, labelled by `result` (committed / stale / error)
pub const CHECKPOINT_COMMITS: &str = "classification_checkpoint_commits_total";

/// Gauge for the last committed sequence number per partition
pub const CHECKPOINT_LAST_SEQUENCE: &str = "classification_checkpoint_last_sequence_number";

// ==== Ownership ====
/// Gauge for the number of partitions owned by this instance
pub const OWNED_PARTITIONS: &str = "classification_owned_partitions";

/// Counter for partitions acquired, labelled by `how` (unowned / expired / stolen)
pub const PARTITIONS_ACQUIRED: &str = "classification_partitions_acquired_total";

/// Counter for partitions lost to another owner or released
pub const PARTITIONS_LOST: &str = "classification_partitions_lost_total";

/// Counter for failed rebalance cycles
pub const REBALANCE_ERRORS: &str = "classification_rebalance_errors_total";

// ==== Stream ====
/// Counter for events read from the stream
pub const EVENTS_READ: &str = "classification_stream_events_read_total";

/// Counter for stream read errors
pub const STREAM_READ_ERRORS: &str = "classification_stream_read_errors_total";
