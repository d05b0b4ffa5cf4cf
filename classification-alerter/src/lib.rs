//! Classification alerter: consumes catalog change notifications, looks up
//! the classified entity and raises alerts where its classification, declared
//! sensitivity or encryption break the classification policy.
//!
//! ## Error logging
//!
//! Log errors as a structured field with `error = ?e` (or `{e:#}` inline), so
//! the whole cause chain ends up in the log line.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod coordination;
pub mod event;
pub mod health;
pub mod metrics_consts;
pub mod policy;
pub mod processor;
pub mod retry;
pub mod rules;
pub mod server;
pub mod service;
pub mod sink;
pub mod stream;
pub mod test_utils;
pub mod types;

pub use processor::{Completion, EventHandler, EventProcessor, ProcessError, ProcessOutcome};
pub use rules::{Alert, AlertCode};
pub use types::{StartPosition, StreamEvent, StreamScope};
