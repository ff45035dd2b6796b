//! Persistence contracts: workflow definitions and the two outboxes.
//!
//! The outbox contract deliberately pushes the emit-under-lock loop into the
//! backend: row locking is an engine-specific idiom (mutex for the in-memory
//! twin, `FOR UPDATE SKIP LOCKED` inside one transaction for PostgreSQL) and
//! the emit must commit together with the row's status update.

use crate::messaging::MessageEmitter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Database error: {message}"))]
    Database { message: String },

    #[snafu(display("Definition {name}:{version} already exists"))]
    DuplicateDefinition { name: String, version: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A persisted workflow definition; the verbatim source is authoritative,
/// parsed trees are cache-only.
#[derive(Debug, Clone)]
pub struct StoredDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub definition: String,
}

#[async_trait]
pub trait DefinitionRepository: Send + Sync + std::fmt::Debug {
    async fn find(&self, name: &str, version: &str) -> Result<Option<StoredDefinition>>;

    /// Insert a definition; `(name, version)` is unique.
    async fn put(&self, name: &str, version: &str, definition: &str) -> Result<Uuid>;
}

/// Lifecycle of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "PENDING" => Some(OutboxStatus::Pending),
            "SENT" => Some(OutboxStatus::Sent),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// One delayed or to-retry message. The compound index over
/// `(status, delayed_until, attempt_count)` backs the ready query.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: Uuid,
    pub message: String,
    pub status: OutboxStatus,
    pub delayed_until: DateTime<Utc>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub version: i32,
}

/// Knobs of one processing batch.
#[derive(Debug, Clone)]
pub struct OutboxProcessOptions {
    pub batch_size: u32,
    pub max_attempts: i32,
    pub initial_delay: Duration,
}

/// Counters of one processing batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxBatchStats {
    /// Rows selected and locked by this batch.
    pub locked: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

impl OutboxBatchStats {
    pub fn absorb(&mut self, other: OutboxBatchStats) {
        self.locked += other.locked;
        self.sent += other.sent;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

#[async_trait]
pub trait OutboxRepository: Send + Sync + std::fmt::Debug {
    /// Enqueue a PENDING message to be emitted once `delayed_until` passes.
    async fn enqueue(&self, message: &str, delayed_until: DateTime<Utc>) -> Result<Uuid>;

    /// Record a message as FAILED immediately (fault archive / dead input).
    async fn enqueue_failed(&self, message: &str, error: &str) -> Result<Uuid>;

    /// Select, lock and process one batch of due rows: emit each through
    /// `emitter`, then mark SENT, reschedule with backoff, or mark FAILED.
    /// Concurrent callers never observe the same PENDING row.
    async fn process_due(
        &self,
        options: &OutboxProcessOptions,
        emitter: &dyn MessageEmitter,
    ) -> Result<OutboxBatchStats>;

    /// Delete up to `batch_size` SENT rows older than `cutoff`; returns the
    /// number deleted.
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>, batch_size: u32) -> Result<u64>;
}
