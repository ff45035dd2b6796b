//! The Emit activity runner: assembles a cloud event and publishes it
//! through the outbound sink.

use super::{ActivityContext, ActivityRunner};
use crate::error::WorkflowError;
use crate::messaging::MessageEmitter;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug)]
pub struct EmitRunner {
    emitter: Arc<dyn MessageEmitter>,
}

impl EmitRunner {
    #[must_use]
    pub fn new(emitter: Arc<dyn MessageEmitter>) -> Self {
        Self { emitter }
    }
}

#[async_trait]
impl ActivityRunner for EmitRunner {
    async fn execute(&self, context: ActivityContext) -> Result<Value, WorkflowError> {
        let Value::Object(attributes) = context.arguments.clone() else {
            return Err(WorkflowError::configuration("Emit event has no attributes")
                .with_details("emit.event.with must be a mapping"));
        };

        let mut event = attributes;
        if !event.contains_key("type") {
            return Err(WorkflowError::configuration(
                "Emit event declares no 'type' attribute",
            ));
        }
        event
            .entry("id".to_string())
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        event
            .entry("specversion".to_string())
            .or_insert_with(|| Value::String("1.0".to_string()));
        event
            .entry("time".to_string())
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        event.entry("source".to_string()).or_insert_with(|| {
            Value::String(format!(
                "/lemline/{}",
                context.workflow.definition.document.name
            ))
        });

        let payload = Value::Object(event);
        let encoded = serde_json::to_string(&payload).map_err(|e| {
            WorkflowError::runtime("Failed to encode event").with_details(e.to_string())
        })?;
        self.emitter.emit(&encoded).await.map_err(|e| {
            WorkflowError::communication("Failed to publish event").with_details(e.to_string())
        })?;
        tracing::debug!(task = %context.task_name, "event emitted");
        Ok(payload)
    }
}
