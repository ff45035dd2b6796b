//! The Serverless Workflow DSL 1.0 object model.
//!
//! Documents are accepted in YAML or JSON and deserialized into these types
//! before the node tree is compiled. The model keeps expression-bearing
//! fields (`input.from`, `output.as`, `set`, call arguments) as raw JSON
//! values; evaluation happens at runtime against the node scope.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

mod duration;
mod retry;
mod task;

pub use duration::{DurationError, DurationFields, DurationSpec};
pub use retry::{
    AttemptLimit, BackoffDefinition, BackoffKind, CatchDefinition, ErrorDefinition, ErrorFilter,
    ErrorFilterWith, JitterDefinition, RetryLimit, RetryPolicy, RetryPolicyOrRef,
};
pub use task::{
    CallTaskDefinition, DoTaskDefinition, EmitDefinition, EmitTaskDefinition, EventDefinition,
    ForDefinition, ForTaskDefinition, ForkDefinition, ForkTaskDefinition, ListenTaskDefinition,
    RaiseDefinition, RaiseErrorOrRef, RaiseTaskDefinition, RunReturnMode, RunSpec,
    RunTaskDefinition, ScriptSpec, SetTaskDefinition, ShellSpec, SubscriptionIterator,
    SwitchCase, SwitchTaskDefinition, TaskCommon, TaskDefinition, TryTaskDefinition,
    WaitTaskDefinition,
};

/// A list of named entries preserving document order, parsed from the DSL's
/// `- name: {…}` sequence-of-single-entry-maps shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedList<T>(pub Vec<NamedItem<T>>);

#[derive(Debug, Clone, PartialEq)]
pub struct NamedItem<T> {
    pub name: String,
    pub value: T,
}

impl<T> Default for NamedList<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> NamedList<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedItem<T>> {
        self.0.iter()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&NamedItem<T>> {
        self.0.get(index)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedList<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Vec<BTreeMap<String, T>> = Vec::deserialize(deserializer)?;
        let mut items = Vec::with_capacity(raw.len());
        for entry in raw {
            if entry.len() != 1 {
                return Err(D::Error::custom(
                    "each list entry must be a map with exactly one name",
                ));
            }
            for (name, value) in entry {
                items.push(NamedItem { name, value });
            }
        }
        Ok(Self(items))
    }
}

impl<T: Serialize> Serialize for NamedList<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw: Vec<BTreeMap<&str, &T>> = self
            .0
            .iter()
            .map(|item| BTreeMap::from([(item.name.as_str(), &item.value)]))
            .collect();
        raw.serialize(serializer)
    }
}

/// A task list (`do`, `try`, `catch.do`, fork `branches`).
pub type TaskList = NamedList<TaskDefinition>;

/// A workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub document: DocumentDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
    #[serde(rename = "use", default, skip_serializing_if = "UseDefinition::is_empty")]
    pub use_: UseDefinition,
    #[serde(rename = "do")]
    pub do_: TaskList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDefinition {
    pub dsl: String,
    pub namespace: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The `use` block: named resources shared across the workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UseDefinition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, ErrorDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retries: BTreeMap<String, RetryPolicy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub authentications: BTreeMap<String, AuthenticationPolicy>,
}

impl UseDefinition {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
            && self.errors.is_empty()
            && self.retries.is_empty()
            && self.authentications.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDefinition>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDefinition>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<serde_json::Value>,
}

/// An inline JSON schema or a reference to an external one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ExternalResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResource {
    pub endpoint: Endpoint,
}

/// An endpoint: a bare URI string or a descriptor with authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    Uri(String),
    Descriptor(EndpointDescriptor),
}

impl Endpoint {
    #[must_use]
    pub fn uri(&self) -> &str {
        match self {
            Endpoint::Uri(uri) => uri,
            Endpoint::Descriptor(descriptor) => &descriptor.uri,
        }
    }

    #[must_use]
    pub fn authentication(&self) -> Option<&AuthenticationPolicy> {
        match self {
            Endpoint::Uri(_) => None,
            Endpoint::Descriptor(descriptor) => descriptor.authentication.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationPolicy>,
}

/// An authentication policy: inline credentials or a named reference into
/// `use.authentications`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationPolicy {
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthentication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<BearerAuthentication>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuthentication {
    pub username: serde_json::Value,
    pub password: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BearerAuthentication {
    pub token: serde_json::Value,
}

/// A DSL flow directive attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FlowDirective {
    #[default]
    Continue,
    Exit,
    End,
    Named(String),
}

impl FlowDirective {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            FlowDirective::Continue => "continue",
            FlowDirective::Exit => "exit",
            FlowDirective::End => "end",
            FlowDirective::Named(name) => name,
        }
    }
}

impl From<&str> for FlowDirective {
    fn from(value: &str) -> Self {
        match value {
            "continue" => FlowDirective::Continue,
            "exit" => FlowDirective::Exit,
            "end" => FlowDirective::End,
            other => FlowDirective::Named(other.to_string()),
        }
    }
}

impl fmt::Display for FlowDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for FlowDirective {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FlowDirective {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FlowDirective::from(raw.as_str()))
    }
}

/// Parse a workflow document from YAML or JSON source text (YAML is the
/// superset parser).
pub fn parse_document(source: &str) -> Result<WorkflowDefinition, serde_yaml::Error> {
    serde_yaml::from_str(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_document() {
        let workflow = parse_document(
            r"
document:
  dsl: '1.0.0'
  namespace: examples
  name: hello
  version: '1.0.0'
do:
  - sayHello:
      set:
        message: Hello World!
",
        )
        .unwrap();
        assert_eq!(workflow.document.name, "hello");
        assert_eq!(workflow.do_.len(), 1);
        let item = workflow.do_.get(0).unwrap();
        assert_eq!(item.name, "sayHello");
        assert!(matches!(item.value, TaskDefinition::Set(_)));
    }

    #[test]
    fn test_named_list_rejects_multi_key_entries() {
        let result: Result<WorkflowDefinition, _> = serde_yaml::from_str(
            r"
document:
  dsl: '1.0.0'
  namespace: examples
  name: bad
  version: '1.0.0'
do:
  - a:
      set: {x: 1}
    b:
      set: {y: 2}
",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_flow_directive_parsing() {
        assert_eq!(FlowDirective::from("continue"), FlowDirective::Continue);
        assert_eq!(FlowDirective::from("exit"), FlowDirective::Exit);
        assert_eq!(FlowDirective::from("end"), FlowDirective::End);
        assert_eq!(
            FlowDirective::from("nextTask"),
            FlowDirective::Named("nextTask".to_string())
        );
    }

    #[test]
    fn test_use_block() {
        let workflow = parse_document(
            r"
document:
  dsl: '1.0.0'
  namespace: examples
  name: with-use
  version: '1.0.0'
use:
  secrets:
    - apiKey
  retries:
    transient:
      delay:
        seconds: 1
      backoff:
        exponential: {}
      limit:
        attempt:
          count: 3
  errors:
    notFound:
      type: https://serverlessworkflow.io/spec/1.0.0/errors/communication
      status: 404
      title: Not Found
do:
  - noop:
      set: {}
",
        )
        .unwrap();
        assert_eq!(workflow.use_.secrets, vec!["apiKey"]);
        assert!(workflow.use_.retries.contains_key("transient"));
        assert_eq!(
            workflow.use_.errors.get("notFound").unwrap().status,
            Some(404)
        );
    }

    #[test]
    fn test_endpoint_forms() {
        let bare: Endpoint = serde_yaml::from_str("https://example.com/api").unwrap();
        assert_eq!(bare.uri(), "https://example.com/api");

        let descriptor: Endpoint = serde_yaml::from_str(
            r"
uri: https://example.com/api
authentication:
  basic:
    username: admin
    password: secret
",
        )
        .unwrap();
        assert_eq!(descriptor.uri(), "https://example.com/api");
        assert!(descriptor.authentication().unwrap().basic.is_some());
    }
}
