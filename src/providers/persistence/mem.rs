//! In-memory repositories: the test and single-process twins of the SQL
//! implementations. The outbox holds its map across the emit call, which
//! gives the same mutual-exclusion guarantee row locks give in SQL.

use crate::messaging::MessageEmitter;
use crate::outbox::next_attempt_at;
use crate::repository::{
    DefinitionRepository, Error, OutboxBatchStats, OutboxProcessOptions, OutboxRepository,
    OutboxRow, OutboxStatus, Result, StoredDefinition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryDefinitionRepository {
    definitions: Mutex<HashMap<(String, String), StoredDefinition>>,
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn find(&self, name: &str, version: &str) -> Result<Option<StoredDefinition>> {
        let definitions = self.definitions.lock().await;
        Ok(definitions
            .get(&(name.to_string(), version.to_string()))
            .cloned())
    }

    async fn put(&self, name: &str, version: &str, definition: &str) -> Result<Uuid> {
        let mut definitions = self.definitions.lock().await;
        let key = (name.to_string(), version.to_string());
        if definitions.contains_key(&key) {
            return Err(Error::DuplicateDefinition {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        let id = Uuid::new_v4();
        definitions.insert(
            key,
            StoredDefinition {
                id,
                name: name.to_string(),
                version: version.to_string(),
                definition: definition.to_string(),
            },
        );
        Ok(id)
    }
}

/// One in-memory outbox table (instantiate once for retries, once for
/// waits).
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    rows: Mutex<HashMap<Uuid, OutboxRow>>,
}

impl InMemoryOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows, for assertions and observability.
    pub async fn rows(&self) -> Vec<OutboxRow> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.rows
            .lock()
            .await
            .values()
            .filter(|row| row.status == status)
            .count()
    }

    /// Force every PENDING row due immediately (on-demand redelivery, also
    /// used by tests to skip backoff waits).
    pub async fn make_all_due(&self) {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        for row in rows.values_mut() {
            if row.status == OutboxStatus::Pending {
                row.delayed_until = now;
            }
        }
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutbox {
    async fn enqueue(&self, message: &str, delayed_until: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.rows.lock().await.insert(
            id,
            OutboxRow {
                id,
                message: message.to_string(),
                status: OutboxStatus::Pending,
                delayed_until,
                attempt_count: 0,
                last_error: None,
                version: 0,
            },
        );
        Ok(id)
    }

    async fn enqueue_failed(&self, message: &str, error: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.rows.lock().await.insert(
            id,
            OutboxRow {
                id,
                message: message.to_string(),
                status: OutboxStatus::Failed,
                delayed_until: Utc::now(),
                attempt_count: 0,
                last_error: Some(error.to_string()),
                version: 0,
            },
        );
        Ok(id)
    }

    async fn process_due(
        &self,
        options: &OutboxProcessOptions,
        emitter: &dyn MessageEmitter,
    ) -> Result<OutboxBatchStats> {
        // Holding the map lock across the emit is the in-memory analogue of
        // the row lock: concurrent workers never see the same PENDING row.
        let mut rows = self.rows.lock().await;
        let now = Utc::now();

        let mut due: Vec<Uuid> = rows
            .values()
            .filter(|row| {
                row.status == OutboxStatus::Pending
                    && row.delayed_until <= now
                    && row.attempt_count < options.max_attempts
            })
            .map(|row| row.id)
            .collect();
        // Order by delayed_until ascending, mirroring the SQL query.
        due.sort_by_key(|id| rows.get(id).map(|row| row.delayed_until));
        due.truncate(options.batch_size as usize);

        let mut stats = OutboxBatchStats {
            locked: due.len(),
            ..OutboxBatchStats::default()
        };

        for id in due {
            let Some(row) = rows.get(&id).cloned() else {
                continue;
            };
            match emitter.emit(&row.message).await {
                Ok(()) => {
                    if let Some(row) = rows.get_mut(&id) {
                        row.status = OutboxStatus::Sent;
                        row.version += 1;
                    }
                    stats.sent += 1;
                }
                Err(e) => {
                    if let Some(row) = rows.get_mut(&id) {
                        row.attempt_count += 1;
                        row.last_error = Some(e.to_string());
                        row.version += 1;
                        if row.attempt_count >= options.max_attempts {
                            row.status = OutboxStatus::Failed;
                            stats.failed += 1;
                        } else {
                            row.delayed_until =
                                next_attempt_at(now, row.attempt_count, options.initial_delay);
                            stats.retried += 1;
                        }
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let doomed: Vec<Uuid> = rows
            .values()
            .filter(|row| row.status == OutboxStatus::Sent && row.delayed_until < cutoff)
            .take(batch_size as usize)
            .map(|row| row.id)
            .collect();
        for id in &doomed {
            rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::mem::FailingEmitter;
    use crate::messaging::InMemoryBroker;
    use std::time::Duration;

    fn options() -> OutboxProcessOptions {
        OutboxProcessOptions {
            batch_size: 10,
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_due_rows_are_sent() {
        let outbox = InMemoryOutbox::new();
        outbox.enqueue("a", Utc::now()).await.unwrap();
        outbox
            .enqueue("later", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let broker = InMemoryBroker::new();
        let emitter = broker.emitter();
        let stats = outbox
            .process_due(&options(), emitter.as_ref())
            .await
            .unwrap();

        assert_eq!(stats.locked, 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(outbox.count_with_status(OutboxStatus::Sent).await, 1);
        assert_eq!(outbox.count_with_status(OutboxStatus::Pending).await, 1);
        assert_eq!(broker.source().recv().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_then_fails() {
        let outbox = InMemoryOutbox::new();
        outbox.enqueue("doomed", Utc::now()).await.unwrap();
        let emitter = FailingEmitter;

        // First two failures reschedule with growing delay.
        for expected_attempts in 1..=2 {
            // Force the row due again.
            {
                let mut rows = outbox.rows.lock().await;
                for row in rows.values_mut() {
                    row.delayed_until = Utc::now();
                }
            }
            let stats = outbox.process_due(&options(), &emitter).await.unwrap();
            assert_eq!(stats.retried, 1, "attempt {expected_attempts}");
            let rows = outbox.rows().await;
            let row = rows.first().unwrap();
            assert_eq!(row.attempt_count, expected_attempts);
            assert_eq!(row.status, OutboxStatus::Pending);
            assert!(row.last_error.is_some());
            assert!(row.delayed_until > Utc::now());
        }

        // Third failure exhausts the attempts.
        {
            let mut rows = outbox.rows.lock().await;
            for row in rows.values_mut() {
                row.delayed_until = Utc::now();
            }
        }
        let stats = outbox.process_due(&options(), &emitter).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(outbox.count_with_status(OutboxStatus::Failed).await, 1);
    }

    #[tokio::test]
    async fn test_failed_rows_are_never_selected() {
        let outbox = InMemoryOutbox::new();
        outbox.enqueue_failed("poison", "decode error").await.unwrap();
        let broker = InMemoryBroker::new();
        let stats = outbox
            .process_due(&options(), broker.emitter().as_ref())
            .await
            .unwrap();
        assert_eq!(stats.locked, 0);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_old_sent_rows() {
        let outbox = InMemoryOutbox::new();
        outbox.enqueue("sent-old", Utc::now() - chrono::Duration::hours(3)).await.unwrap();
        outbox.enqueue("pending", Utc::now()).await.unwrap();
        {
            let mut rows = outbox.rows.lock().await;
            for row in rows.values_mut() {
                if row.message == "sent-old" {
                    row.status = OutboxStatus::Sent;
                }
            }
        }
        let deleted = outbox
            .delete_sent_before(Utc::now() - chrono::Duration::hours(1), 100)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(outbox.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_definitions_are_unique_by_name_version() {
        let repository = InMemoryDefinitionRepository::default();
        repository.put("wf", "1", "doc").await.unwrap();
        assert!(matches!(
            repository.put("wf", "1", "doc").await,
            Err(Error::DuplicateDefinition { .. })
        ));
        repository.put("wf", "2", "doc").await.unwrap();
        assert!(repository.find("wf", "2").await.unwrap().is_some());
        assert!(repository.find("wf", "3").await.unwrap().is_none());
    }
}
