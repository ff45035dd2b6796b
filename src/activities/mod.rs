//! Activity runners: pluggable execution of leaf activity tasks.
//!
//! The engine resolves an activity kind ("http", "run", "emit", …) against
//! a registry and hands the runner a fully templated argument value (every
//! `${…}` already evaluated against the task's transformed input). Kinds
//! with no registered runner fail with a CONFIGURATION error at the raising
//! node — grpc/openapi/asyncapi/listen parse but do not ship a runner.

use crate::definitions::CompiledWorkflow;
use crate::error::WorkflowError;
use crate::expressions::{self, Scope};
use crate::messaging::MessageEmitter;
use crate::model::AuthenticationPolicy;
use crate::position::JsonPointer;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod http;
pub mod run;

mod emit;

pub use emit::EmitRunner;
pub use http::HttpRunner;
pub use run::ProcessRunner;

/// Everything a runner may need for one execution. Owned values: the runner
/// outlives no borrow of the instance.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub position: JsonPointer,
    pub task_name: String,
    /// The task's transformed input.
    pub input: Value,
    /// The task's arguments (`with`, `run`, `emit.event.with`), templated.
    pub arguments: Value,
    pub scope: Scope,
    pub workflow: Arc<CompiledWorkflow>,
    pub secrets: serde_json::Map<String, Value>,
}

#[async_trait]
pub trait ActivityRunner: Send + Sync + std::fmt::Debug {
    async fn execute(&self, context: ActivityContext) -> Result<Value, WorkflowError>;
}

/// Registry of runners keyed by activity kind.
#[derive(Debug, Default)]
pub struct ActivityRunners {
    by_kind: HashMap<String, Box<dyn ActivityRunner>>,
}

impl ActivityRunners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The shipped set: HTTP calls, child processes, event emission.
    #[must_use]
    pub fn standard(emitter: Arc<dyn MessageEmitter>) -> Self {
        let mut runners = Self::new();
        runners.register("http", Box::new(HttpRunner::new()));
        runners.register("run", Box::new(ProcessRunner::new()));
        runners.register("emit", Box::new(EmitRunner::new(emitter)));
        runners
    }

    pub fn register(&mut self, kind: impl Into<String>, runner: Box<dyn ActivityRunner>) {
        self.by_kind.insert(kind.into(), runner);
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&dyn ActivityRunner> {
        self.by_kind.get(kind).map(Box::as_ref)
    }
}

/// Resolve an endpoint value into a concrete URI plus its authentication:
/// accepts a literal string, a `{uri, authentication}` descriptor, and
/// `{param}` URI-template segments filled from the task input.
pub(crate) fn resolve_endpoint(
    endpoint: &Value,
    input: &Value,
) -> Result<(String, Option<AuthenticationPolicy>), WorkflowError> {
    let (uri, authentication) = match endpoint {
        Value::String(uri) => (uri.clone(), None),
        Value::Object(descriptor) => {
            let uri = descriptor
                .get("uri")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    WorkflowError::configuration("Endpoint descriptor has no 'uri'")
                })?
                .to_string();
            let authentication = match descriptor.get("authentication") {
                Some(auth_value) => Some(
                    serde_json::from_value::<AuthenticationPolicy>(auth_value.clone()).map_err(
                        |e| {
                            WorkflowError::configuration("Invalid authentication policy")
                                .with_details(e.to_string())
                        },
                    )?,
                ),
                None => None,
            };
            (uri, authentication)
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::Array(_) => {
            return Err(WorkflowError::configuration("Invalid endpoint")
                .with_details(format!("endpoint must be a URI or descriptor, got {endpoint}")));
        }
    };
    Ok((interpolate_uri(&uri, input), authentication))
}

/// Replace `{param}` segments with fields of the task input.
fn interpolate_uri(uri: &str, input: &Value) -> String {
    let Ok(pattern) = regex::Regex::new(r"\{([^}]+)\}") else {
        return uri.to_string();
    };
    let mut result = uri.to_string();
    for capture in pattern.captures_iter(uri) {
        let Some(name) = capture.get(1).map(|m| m.as_str()) else {
            continue;
        };
        if let Some(value) = input.get(name) {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            result = result.replace(&format!("{{{name}}}"), &text);
        }
    }
    result
}

/// Resolve a named authentication policy against `use.authentications`.
pub(crate) fn resolve_authentication(
    policy: &AuthenticationPolicy,
    workflow: &CompiledWorkflow,
) -> Result<AuthenticationPolicy, WorkflowError> {
    let Some(name) = policy.use_.as_ref() else {
        return Ok(policy.clone());
    };
    workflow
        .definition
        .use_
        .authentications
        .get(name)
        .cloned()
        .ok_or_else(|| {
            WorkflowError::configuration("Unknown named authentication")
                .with_details(format!("'{name}' is not declared in use.authentications"))
        })
}

/// Resolve a credential value: a bare key naming a workflow secret yields
/// the secret; a `${…}` string is evaluated and, when the result names a
/// secret, resolved once more.
pub(crate) fn resolve_secret_value(
    value: &Value,
    context: &ActivityContext,
) -> Result<Value, WorkflowError> {
    let resolved = match value {
        Value::String(text) if expressions::is_expression(text) => {
            expressions::evaluate(text, &context.input, &context.scope, false).map_err(|e| {
                WorkflowError::expression("Credential expression failed")
                    .with_details(e.to_string())
            })?
        }
        other => other.clone(),
    };
    if let Value::String(name) = &resolved {
        if let Some(secret) = context.secrets.get(name) {
            return Ok(secret.clone());
        }
    }
    Ok(resolved)
}

pub(crate) fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
