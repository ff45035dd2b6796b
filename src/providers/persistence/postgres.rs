//! PostgreSQL repositories.
//!
//! The outbox batch runs inside one transaction: rows are selected with
//! `FOR UPDATE SKIP LOCKED`, emitted, and updated before the commit — so
//! the emit and the status change commit together and concurrent workers
//! skip each other's rows. A crash between emit and commit redelivers,
//! which the at-least-once contract allows.

use crate::messaging::MessageEmitter;
use crate::outbox::next_attempt_at;
use crate::repository::{
    DefinitionRepository, Error, OutboxBatchStats, OutboxProcessOptions, OutboxRepository,
    OutboxRow, OutboxStatus, Result, StoredDefinition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

fn db_error(e: sqlx::Error) -> Error {
    Error::Database {
        message: e.to_string(),
    }
}

async fn bootstrap(pool: &PgPool, schema_sql: &str) -> Result<()> {
    for statement in schema_sql.split(';').filter(|s| !s.trim().is_empty()) {
        sqlx::query(statement).execute(pool).await.map_err(db_error)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct PostgresDefinitionRepository {
    pool: PgPool,
}

impl PostgresDefinitionRepository {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: PgPool) -> Result<Self> {
        bootstrap(&pool, include_str!("./sql/definitions_postgres.sql")).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DefinitionRepository for PostgresDefinitionRepository {
    async fn find(&self, name: &str, version: &str) -> Result<Option<StoredDefinition>> {
        let row = sqlx::query_as::<_, (Uuid, String, String, String)>(
            "SELECT id, name, version, definition FROM definitions WHERE name = $1 AND version = $2",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|(id, name, version, definition)| StoredDefinition {
            id,
            name,
            version,
            definition,
        }))
    }

    async fn put(&self, name: &str, version: &str, definition: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO definitions (id, name, version, definition) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(name)
        .bind(version)
        .bind(definition)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(Error::DuplicateDefinition {
                    name: name.to_string(),
                    version: version.to_string(),
                })
            }
            Err(e) => Err(db_error(e)),
        }
    }
}

/// One PostgreSQL outbox table (`retries` or `waits`).
#[derive(Debug)]
pub struct PostgresOutbox {
    pool: PgPool,
    table: &'static str,
}

impl PostgresOutbox {
    pub async fn new(database_url: &str, table: &'static str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        Self::with_pool(pool, table).await
    }

    pub async fn with_pool(pool: PgPool, table: &'static str) -> Result<Self> {
        let schema = include_str!("./sql/outbox_postgres.sql").replace("{table}", table);
        bootstrap(&pool, &schema).await?;
        Ok(Self { pool, table })
    }
}

type OutboxTuple = (
    Uuid,
    String,
    String,
    DateTime<Utc>,
    i32,
    Option<String>,
    i32,
);

fn row_from_tuple(
    (id, message, status, delayed_until, attempt_count, last_error, version): OutboxTuple,
) -> OutboxRow {
    OutboxRow {
        id,
        message,
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Failed),
        delayed_until,
        attempt_count,
        last_error,
        version,
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutbox {
    async fn enqueue(&self, message: &str, delayed_until: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let sql = format!(
            "INSERT INTO {} (id, message, status, delayed_until) VALUES ($1, $2, 'PENDING', $3)",
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(message)
            .bind(delayed_until)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(id)
    }

    async fn enqueue_failed(&self, message: &str, error: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let sql = format!(
            "INSERT INTO {} (id, message, status, delayed_until, last_error) \
             VALUES ($1, $2, 'FAILED', now(), $3)",
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(message)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(id)
    }

    async fn process_due(
        &self,
        options: &OutboxProcessOptions,
        emitter: &dyn MessageEmitter,
    ) -> Result<OutboxBatchStats> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let select = format!(
            "SELECT id, message, status, delayed_until, attempt_count, last_error, version \
             FROM {} \
             WHERE status = 'PENDING' AND delayed_until <= now() AND attempt_count < $1 \
             ORDER BY delayed_until ASC \
             LIMIT $2 \
             FOR UPDATE SKIP LOCKED",
            self.table
        );
        let rows: Vec<OutboxRow> = sqlx::query_as::<_, OutboxTuple>(&select)
            .bind(options.max_attempts)
            .bind(i64::from(options.batch_size))
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?
            .into_iter()
            .map(row_from_tuple)
            .collect();

        let mut stats = OutboxBatchStats {
            locked: rows.len(),
            ..OutboxBatchStats::default()
        };

        let mark_sent = format!(
            "UPDATE {} SET status = 'SENT', version = version + 1 WHERE id = $1",
            self.table
        );
        let mark_retry = format!(
            "UPDATE {} SET attempt_count = $2, last_error = $3, delayed_until = $4, \
             version = version + 1 WHERE id = $1",
            self.table
        );
        let mark_failed = format!(
            "UPDATE {} SET status = 'FAILED', attempt_count = $2, last_error = $3, \
             version = version + 1 WHERE id = $1",
            self.table
        );

        let now = Utc::now();
        for row in rows {
            match emitter.emit(&row.message).await {
                Ok(()) => {
                    sqlx::query(&mark_sent)
                        .bind(row.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_error)?;
                    stats.sent += 1;
                }
                Err(e) => {
                    let attempts = row.attempt_count + 1;
                    if attempts >= options.max_attempts {
                        sqlx::query(&mark_failed)
                            .bind(row.id)
                            .bind(attempts)
                            .bind(e.to_string())
                            .execute(&mut *tx)
                            .await
                            .map_err(db_error)?;
                        stats.failed += 1;
                    } else {
                        let delayed_until = next_attempt_at(now, attempts, options.initial_delay);
                        sqlx::query(&mark_retry)
                            .bind(row.id)
                            .bind(attempts)
                            .bind(e.to_string())
                            .bind(delayed_until)
                            .execute(&mut *tx)
                            .await
                            .map_err(db_error)?;
                        stats.retried += 1;
                    }
                }
            }
        }

        tx.commit().await.map_err(db_error)?;
        Ok(stats)
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE id IN ( \
             SELECT id FROM {} WHERE status = 'SENT' AND delayed_until < $1 \
             LIMIT $2 FOR UPDATE SKIP LOCKED)",
            self.table, self.table
        );
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .bind(i64::from(batch_size))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}
