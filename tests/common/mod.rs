//! Shared fixtures: a full in-memory stack and direct-instance helpers.
#![allow(dead_code)]

use lemline::activities::ActivityRunners;
use lemline::consumer::Consumer;
use lemline::definitions::{CompiledWorkflow, DefinitionCache};
use lemline::instance::WorkflowInstance;
use lemline::messaging::InMemoryBroker;
use lemline::providers::persistence::{InMemoryDefinitionRepository, InMemoryOutbox};
use lemline::schema::SchemaRegistry;
use lemline::secrets::InMemorySecretStore;
use lemline::state::Envelope;
use std::collections::HashMap;
use std::sync::Arc;

/// A complete single-process runtime over the in-memory providers.
pub struct TestStack {
    pub broker: Arc<InMemoryBroker>,
    pub consumer: Arc<Consumer>,
    pub retries: Arc<InMemoryOutbox>,
    pub waits: Arc<InMemoryOutbox>,
    pub definitions: Arc<DefinitionCache>,
}

impl TestStack {
    pub async fn new() -> Self {
        Self::with_secrets(HashMap::new()).await
    }

    pub async fn with_secrets(secrets: HashMap<String, serde_json::Value>) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let retries = Arc::new(InMemoryOutbox::new());
        let waits = Arc::new(InMemoryOutbox::new());
        let definitions = Arc::new(DefinitionCache::new(Arc::new(
            InMemoryDefinitionRepository::default(),
        )));
        let consumer = Arc::new(Consumer::new(
            Arc::clone(&definitions),
            Arc::new(InMemorySecretStore::new(secrets)),
            Arc::new(ActivityRunners::standard(broker.emitter())),
            Arc::new(SchemaRegistry::new()),
            broker.emitter(),
            Arc::clone(&retries) as _,
            Arc::clone(&waits) as _,
        ));
        Self {
            broker,
            consumer,
            retries,
            waits,
            definitions,
        }
    }

    pub async fn register(&self, source: &str) -> (String, String) {
        let parsed = lemline::model::parse_document(source).unwrap();
        let name = parsed.document.name.clone();
        let version = parsed.document.version.clone();
        self.definitions.put(&name, &version, source).await.unwrap();
        (name, version)
    }

    /// Feed every queued broker message through the consumer until the
    /// channel drains; returns the number of messages processed.
    pub async fn pump(&self) -> usize {
        let mut processed = 0;
        while let Some(message) = self.broker.try_recv().await {
            self.consumer.handle(&message).await;
            processed += 1;
        }
        processed
    }
}

/// Compile a document for direct instance tests.
pub fn compile(source: &str) -> Arc<CompiledWorkflow> {
    Arc::new(CompiledWorkflow::compile("test", "test", source).unwrap())
}

/// An instance with in-memory runners, driven directly (no broker loop).
pub fn instance(workflow: &Arc<CompiledWorkflow>, envelope: Envelope) -> WorkflowInstance {
    let broker = InMemoryBroker::new();
    WorkflowInstance::from_envelope(
        Arc::clone(workflow),
        envelope,
        serde_json::Map::new(),
        Arc::new(ActivityRunners::standard(broker.emitter())),
        Arc::new(SchemaRegistry::new()),
    )
}

/// The first message of an instance whose root raw input is `input`.
pub fn envelope_with_input(
    name: &str,
    version: &str,
    input: serde_json::Value,
) -> Envelope {
    let mut envelope = Envelope::initial(name, version);
    let mut root = lemline::state::NodeState::default();
    root.raw_input = Some(input);
    envelope
        .states
        .insert(lemline::position::JsonPointer::root(), root);
    envelope
}
