use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Identifies a partition of one stream, as seen by one consumer group.
///
/// Checkpoints and ownership records are scoped by `(consumer_group, stream)`,
/// so two groups reading the same stream never see each other's progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamScope {
    consumer_group: String,
    stream: String,
}

impl StreamScope {
    pub fn new(consumer_group: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            stream: stream.into(),
        }
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn checkpoint_key(&self, partition: i32) -> CheckpointKey {
        CheckpointKey {
            scope: self.clone(),
            partition,
        }
    }
}

impl fmt::Display for StreamScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.consumer_group, self.stream)
    }
}

/// `(consumer_group, stream, partition)`, the key a checkpoint is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    scope: StreamScope,
    partition: i32,
}

impl CheckpointKey {
    pub fn scope(&self) -> &StreamScope {
        &self.scope
    }

    pub fn consumer_group(&self) -> &str {
        self.scope.consumer_group()
    }

    pub fn stream(&self) -> &str {
        self.scope.stream()
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.partition)
    }
}

/// High-water mark of fully processed events for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub partition: i32,
    pub sequence_number: i64,
}

/// An immutable unit of work read from one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub partition: i32,
    pub sequence_number: i64,
    pub body: Vec<u8>,
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl StreamEvent {
    pub fn new(partition: i32, sequence_number: i64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            sequence_number,
            body: body.into(),
            enqueued_at: None,
        }
    }
}

/// Where a partition reader begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
    /// Inclusive: the first event returned has this sequence number (or the
    /// next one available after it).
    Sequence(i64),
}

impl StartPosition {
    /// Position to resume from, given the last committed checkpoint.
    pub fn resume(checkpoint: Option<i64>, default: StartPosition) -> StartPosition {
        match checkpoint {
            Some(sequence_number) => StartPosition::Sequence(sequence_number + 1),
            None => default,
        }
    }
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "earliest" | "-1" => Ok(StartPosition::Earliest),
            "latest" | "@latest" => Ok(StartPosition::Latest),
            other => Err(format!(
                "Unknown start position: {other}, must be earliest or latest"
            )),
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Earliest => write!(f, "earliest"),
            StartPosition::Latest => write!(f, "latest"),
            StartPosition::Sequence(n) => write!(f, "sequence:{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_starts_after_checkpoint() {
        assert_eq!(
            StartPosition::resume(Some(41), StartPosition::Earliest),
            StartPosition::Sequence(42)
        );
        assert_eq!(
            StartPosition::resume(None, StartPosition::Latest),
            StartPosition::Latest
        );
    }

    #[test]
    fn start_position_from_str() {
        assert_eq!(
            "earliest".parse::<StartPosition>().unwrap(),
            StartPosition::Earliest
        );
        assert_eq!(
            "LATEST".parse::<StartPosition>().unwrap(),
            StartPosition::Latest
        );
        assert_eq!(
            "-1".parse::<StartPosition>().unwrap(),
            StartPosition::Earliest
        );
        assert!("tomorrow".parse::<StartPosition>().is_err());
    }

    #[test]
    fn checkpoint_key_display() {
        let key = StreamScope::new("$Default", "atlas_hook").checkpoint_key(3);
        assert_eq!(key.to_string(), "$Default/atlas_hook/3");
        assert_eq!(key.partition(), 3);
        assert_eq!(key.stream(), "atlas_hook");
    }
}
