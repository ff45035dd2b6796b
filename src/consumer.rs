//! The broker consumer: decode → load → drive → route.
//!
//! One worker processes one message from decode to routing; a pool of
//! cooperative workers drains the shared inbound stream. A message that
//! cannot be decoded — or that blows up outside the instance — is archived
//! as a FAILED retry row and dead-lettered; the broker must be configured
//! with a DLQ or delivery will stall.

use crate::activities::ActivityRunners;
use crate::definitions::DefinitionCache;
use crate::instance::{StepOutcome, WorkflowInstance};
use crate::messaging::{Disposition, MessageEmitter, MessageSource};
use crate::outbox;
use crate::repository::OutboxRepository;
use crate::schema::SchemaRegistry;
use crate::secrets::{self, SecretStore};
use crate::state::Envelope;
use chrono::Utc;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to decode envelope: {source}"))]
    Decode { source: serde_json::Error },

    #[snafu(display("Definition error: {source}"))]
    Definition { source: crate::definitions::Error },

    #[snafu(display("Secret resolution failed: {source}"))]
    Secrets { source: crate::secrets::Error },

    #[snafu(display("Broker error: {source}"))]
    Broker { source: crate::messaging::Error },

    #[snafu(display("Outbox error: {source}"))]
    Outbox { source: crate::repository::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Consumer {
    definitions: Arc<DefinitionCache>,
    secrets: Arc<dyn SecretStore>,
    runners: Arc<ActivityRunners>,
    schemas: Arc<SchemaRegistry>,
    emitter: Arc<dyn MessageEmitter>,
    retry_outbox: Arc<dyn OutboxRepository>,
    wait_outbox: Arc<dyn OutboxRepository>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

impl Consumer {
    #[must_use]
    pub fn new(
        definitions: Arc<DefinitionCache>,
        secrets: Arc<dyn SecretStore>,
        runners: Arc<ActivityRunners>,
        schemas: Arc<SchemaRegistry>,
        emitter: Arc<dyn MessageEmitter>,
        retry_outbox: Arc<dyn OutboxRepository>,
        wait_outbox: Arc<dyn OutboxRepository>,
    ) -> Self {
        Self {
            definitions,
            secrets,
            runners,
            schemas,
            emitter,
            retry_outbox,
            wait_outbox,
        }
    }

    /// Handle one inbound message and decide its broker disposition.
    pub async fn handle(&self, raw: &str) -> Disposition {
        match self.process(raw).await {
            Ok(()) => Disposition::Ack,
            Err(error) => {
                tracing::error!(error = %error, "message processing failed");
                // Archive the raw payload so the failure is observable even
                // after the broker dead-letters the message.
                if let Err(archive_error) = self
                    .retry_outbox
                    .enqueue_failed(raw, &error.to_string())
                    .await
                {
                    tracing::error!(error = %archive_error, "failed to archive dead message");
                }
                Disposition::DeadLetter
            }
        }
    }

    async fn process(&self, raw: &str) -> Result<()> {
        let envelope = Envelope::decode(raw).context(DecodeSnafu)?;
        let workflow = self
            .definitions
            .get(&envelope.name, &envelope.version)
            .await
            .context(DefinitionSnafu)?;
        let resolved_secrets =
            secrets::resolve_secrets(self.secrets.as_ref(), &workflow.definition.use_.secrets)
                .await
                .context(SecretsSnafu)?;

        let mut instance = WorkflowInstance::from_envelope(
            workflow,
            envelope,
            resolved_secrets,
            Arc::clone(&self.runners),
            Arc::clone(&self.schemas),
        );
        let outcome = instance.drive().await;
        self.route(outcome).await
    }

    async fn route(&self, outcome: StepOutcome) -> Result<()> {
        match outcome {
            StepOutcome::Continue(envelope) => {
                tracing::debug!(position = %envelope.position, "emitting next step");
                self.emitter
                    .emit(&envelope.encode())
                    .await
                    .context(BrokerSnafu)
            }
            StepOutcome::Wait(envelope, delay) => {
                tracing::debug!(position = %envelope.position, ?delay, "parking in wait outbox");
                self.wait_outbox
                    .enqueue(&envelope.encode(), delayed_until(delay))
                    .await
                    .map(|_| ())
                    .context(OutboxSnafu)
            }
            StepOutcome::Retry(envelope, delay) => {
                tracing::debug!(position = %envelope.position, ?delay, "parking in retry outbox");
                self.retry_outbox
                    .enqueue(&envelope.encode(), delayed_until(delay))
                    .await
                    .map(|_| ())
                    .context(OutboxSnafu)
            }
            StepOutcome::Completed(output) => {
                tracing::info!(output = ?output, "workflow completed");
                Ok(())
            }
            StepOutcome::Faulted(envelope, error) => {
                tracing::warn!(position = %envelope.position, error = %error, "workflow faulted");
                self.retry_outbox
                    .enqueue_failed(&envelope.encode(), &error.to_string())
                    .await
                    .map(|_| ())
                    .context(OutboxSnafu)
            }
        }
    }

    /// Spawn `worker_count` cooperative workers draining the source. The
    /// handles run until the source closes or they are aborted.
    #[must_use]
    pub fn spawn_workers(
        self: &Arc<Self>,
        source: Arc<dyn MessageSource>,
        dead_letters: Arc<dyn MessageEmitter>,
        worker_count: usize,
    ) -> Vec<JoinHandle<()>> {
        (0..worker_count.max(1))
            .map(|worker| {
                let consumer = Arc::clone(self);
                let source = Arc::clone(&source);
                let dead_letters = Arc::clone(&dead_letters);
                tokio::spawn(async move {
                    while let Some(message) = source.recv().await {
                        if consumer.handle(&message).await == Disposition::DeadLetter {
                            if let Err(e) = dead_letters.emit(&message).await {
                                tracing::error!(worker, error = %e, "dead-letter publish failed");
                            }
                        }
                    }
                    tracing::debug!(worker, "inbound channel closed, worker exiting");
                })
            })
            .collect()
    }
}

fn delayed_until(delay: Duration) -> chrono::DateTime<Utc> {
    outbox::next_ready_at(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delayed_until_is_in_the_future() {
        let at = delayed_until(Duration::from_secs(30));
        let expected = Utc::now() + chrono::Duration::seconds(30);
        let skew = (at - expected).num_milliseconds().abs();
        assert!(skew < 1000, "skew {skew}ms");
    }
}
