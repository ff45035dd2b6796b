//! The scheduled outbox processor.
//!
//! One processor instance drives one outbox table (retries or waits): a
//! periodic processing job pushes due rows to the broker, a slower cleanup
//! job deletes old SENT rows. Ticks skip when the previous run is still in
//! flight. Row locking and the emit-with-status-commit discipline live in
//! the repository implementations; the shared backoff policy lives here.

use crate::messaging::MessageEmitter;
use crate::repository::{self, OutboxBatchStats, OutboxProcessOptions, OutboxRepository};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Floor for the computed backoff delay.
const MIN_BACKOFF: Duration = Duration::from_millis(100);
/// Uniform jitter applied to the backoff base, as a fraction of it.
const JITTER_RATIO: f64 = 0.2;

/// All knobs of one outbox table's two jobs.
#[derive(Debug, Clone)]
pub struct OutboxOptions {
    pub batch_size: u32,
    pub max_attempts: i32,
    pub initial_delay: Duration,
    pub schedule: Duration,
    pub cleanup_after: Duration,
    pub cleanup_batch_size: u32,
    pub cleanup_schedule: Duration,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            schedule: Duration::from_secs(2),
            cleanup_after: Duration::from_secs(3600),
            cleanup_batch_size: 500,
            cleanup_schedule: Duration::from_secs(3600),
        }
    }
}

impl OutboxOptions {
    #[must_use]
    pub fn process_options(&self) -> OutboxProcessOptions {
        OutboxProcessOptions {
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
        }
    }
}

/// Exponential backoff with ±20% uniform jitter, floored at 100 ms:
/// `initial_delay × 2^(attempt−1)` for the attempt just recorded.
#[must_use]
pub fn emit_backoff(attempt_count: i32, initial_delay: Duration) -> Duration {
    let base = initial_delay.as_secs_f64() * 2f64.powi(attempt_count.saturating_sub(1).max(0));
    let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO) * base;
    Duration::from_secs_f64((base + jitter).max(MIN_BACKOFF.as_secs_f64()))
}

/// Wall-clock instant a freshly parked message becomes due.
#[must_use]
pub fn next_ready_at(delay: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero())
}

/// When a redelivery attempt should run, on the wall clock.
#[must_use]
pub fn next_attempt_at(
    now: DateTime<Utc>,
    attempt_count: i32,
    initial_delay: Duration,
) -> DateTime<Utc> {
    let delay = emit_backoff(attempt_count, initial_delay);
    now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(1))
}

/// One outbox table's scheduled processor.
#[derive(Debug)]
pub struct OutboxProcessor {
    name: &'static str,
    repository: Arc<dyn OutboxRepository>,
    emitter: Arc<dyn MessageEmitter>,
    options: OutboxOptions,
    busy: tokio::sync::Mutex<()>,
}

impl OutboxProcessor {
    #[must_use]
    pub fn new(
        name: &'static str,
        repository: Arc<dyn OutboxRepository>,
        emitter: Arc<dyn MessageEmitter>,
        options: OutboxOptions,
    ) -> Self {
        Self {
            name,
            repository,
            emitter,
            options,
            busy: tokio::sync::Mutex::new(()),
        }
    }

    /// Drain every due batch once. Skips silently when a previous run still
    /// holds the slot.
    pub async fn process_once(&self) -> repository::Result<OutboxBatchStats> {
        let Ok(_guard) = self.busy.try_lock() else {
            tracing::debug!(outbox = self.name, "previous run still in flight, skipping tick");
            return Ok(OutboxBatchStats::default());
        };

        let options = self.options.process_options();
        let mut totals = OutboxBatchStats::default();
        loop {
            let stats = self
                .repository
                .process_due(&options, self.emitter.as_ref())
                .await?;
            totals.absorb(stats);
            if stats.locked < self.options.batch_size as usize {
                break;
            }
        }
        if totals.locked > 0 {
            tracing::info!(
                outbox = self.name,
                locked = totals.locked,
                sent = totals.sent,
                retried = totals.retried,
                failed = totals.failed,
                "outbox batch processed"
            );
        }
        Ok(totals)
    }

    /// Delete SENT rows older than the configured retention, in batches.
    pub async fn cleanup_once(&self) -> repository::Result<u64> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.options.cleanup_after)
                .unwrap_or_else(|_| ChronoDuration::hours(1));
        let mut total = 0;
        loop {
            let deleted = self
                .repository
                .delete_sent_before(cutoff, self.options.cleanup_batch_size)
                .await?;
            total += deleted;
            if deleted < u64::from(self.options.cleanup_batch_size) {
                break;
            }
        }
        if total > 0 {
            tracing::info!(outbox = self.name, deleted = total, "outbox cleanup");
        }
        Ok(total)
    }

    /// Spawn the periodic processing and cleanup jobs. The handles are
    /// aborted on shutdown.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let processor = Arc::clone(self);
        let processing = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(processor.options.schedule);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = processor.process_once().await {
                    tracing::error!(outbox = processor.name, error = %e, "outbox processing failed");
                }
            }
        });

        let processor = Arc::clone(self);
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(processor.options.cleanup_schedule);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = processor.cleanup_once().await {
                    tracing::error!(outbox = processor.name, error = %e, "outbox cleanup failed");
                }
            }
        });
        (processing, cleanup)
    }
}
