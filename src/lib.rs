//! # Lemline - Serverless Workflow Runtime
//!
//! Lemline is a broker-driven runtime for [Serverless Workflow](https://serverlessworkflow.io/)
//! DSL 1.0 documents. It consumes workflow-execution messages, advances the
//! instance to the next blocking point, and emits the next message or parks
//! a delayed one in a transactional outbox.
//!
//! ## How it runs
//!
//! - **One message = one step**: each envelope carries the instance's full
//!   non-default node state; a worker rebuilds the instance, drives it to
//!   the next activity boundary, wait, retry, or terminal status, and routes
//!   the result. No long-lived in-memory workflow process exists.
//! - **Durable dispatch**: waits and retries become rows in the `waits` and
//!   `retries` outboxes; scheduled processors push due rows back to the
//!   broker under row locks, with exponential backoff on transient publish
//!   failures.
//! - **At-least-once**: the database write commits before the broker ack;
//!   duplicate delivery is tolerated by construction.
//!
//! ## Core Modules
//!
//! - [`instance`] - Per-instance node runtime and the drive loop
//! - [`tree`] - Workflow documents compiled into position-addressed trees
//! - [`expressions`] - JQ expression evaluation over the task scope
//! - [`consumer`] - Broker-side decode/drive/route pipeline
//! - [`outbox`] - Scheduled outbox processing and cleanup
//! - [`state`] - The compact wire envelope and per-node state
//!
//! ## Example
//!
//! ```rust,no_run
//! use lemline::activities::ActivityRunners;
//! use lemline::definitions::DefinitionCache;
//! use lemline::messaging::InMemoryBroker;
//! use lemline::providers::persistence::{InMemoryDefinitionRepository, InMemoryOutbox};
//! use lemline::schema::SchemaRegistry;
//! use lemline::secrets::InMemorySecretStore;
//! use lemline::state::Envelope;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let definitions = Arc::new(DefinitionCache::new(Arc::new(
//!     InMemoryDefinitionRepository::default(),
//! )));
//! definitions
//!     .put("hello", "1", r#"
//! document: {dsl: '1.0.0', namespace: examples, name: hello, version: '1'}
//! do:
//!   - sayHello:
//!       set:
//!         message: Hello World!
//! "#)
//!     .await?;
//!
//! let consumer = Arc::new(lemline::consumer::Consumer::new(
//!     definitions,
//!     Arc::new(InMemorySecretStore::default()),
//!     Arc::new(ActivityRunners::standard(broker.emitter())),
//!     Arc::new(SchemaRegistry::new()),
//!     broker.emitter(),
//!     Arc::new(InMemoryOutbox::new()),
//!     Arc::new(InMemoryOutbox::new()),
//! ));
//! consumer.handle(&Envelope::initial("hello", "1").encode()).await;
//! # Ok(())
//! # }
//! ```

pub mod activities;
pub mod config;
pub mod consumer;
pub mod definitions;
pub mod error;
pub mod expressions;
pub mod instance;
pub mod messaging;
pub mod model;
pub mod outbox;
pub mod position;
pub mod providers;
pub mod repository;
pub mod schema;
pub mod secrets;
pub mod state;
pub mod tree;
