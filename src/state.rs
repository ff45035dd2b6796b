//! Per-position execution state and the wire envelope.
//!
//! [`NodeState`] is serialized with short keys — these are part of the wire
//! contract, not a style choice: every in-flight message carries the full
//! non-default state map. A state equal to the default is never serialized.

use crate::position::JsonPointer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mutable execution state of one node within one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Index of the child currently executing inside a sequence (−1 = not
    /// entered yet). Monotonically increasing until the sequence completes.
    #[serde(
        rename = "i",
        default = "default_child_index",
        skip_serializing_if = "is_default_child_index"
    )]
    pub child_index: i32,

    /// Retry attempts consumed by a Try node. Monotonically increasing.
    #[serde(rename = "try", default, skip_serializing_if = "is_zero")]
    pub attempt_index: u32,

    /// Node-local variable bindings (`$item`, `$index`, `$error`, …).
    #[serde(rename = "var", default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, serde_json::Value>,

    /// Raw input as handed over by the predecessor.
    #[serde(rename = "inp", default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<serde_json::Value>,

    /// Raw output. `None` means the node has not produced output yet;
    /// re-entry resumes execution of this node.
    #[serde(rename = "out", default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,

    /// Workflow context. Only meaningful on the root state.
    #[serde(rename = "ctx", default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,

    /// Workflow instance id (root only, immutable after creation).
    #[serde(rename = "wid", default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    /// Start timestamp (root only, immutable after creation).
    #[serde(rename = "sat", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Current iteration of a For node.
    #[serde(rename = "fori", default, skip_serializing_if = "Option::is_none")]
    pub for_index: Option<u64>,
}

fn default_child_index() -> i32 {
    -1
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_default_child_index(value: &i32) -> bool {
    *value == -1
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            child_index: -1,
            attempt_index: 0,
            variables: serde_json::Map::new(),
            raw_input: None,
            raw_output: None,
            context: serde_json::Map::new(),
            workflow_id: None,
            started_at: None,
            for_index: None,
        }
    }
}

impl NodeState {
    /// True when every field holds its default; such states are elided from
    /// the envelope.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self == &NodeState::default()
    }
}

/// The on-the-wire message: workflow coordinates, the non-default state
/// overlay, and the current position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "v")]
    pub version: String,
    #[serde(rename = "s", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub states: BTreeMap<JsonPointer, NodeState>,
    #[serde(rename = "p", default)]
    pub position: JsonPointer,
}

impl Envelope {
    /// The first message of a fresh instance: empty overlay, root position.
    #[must_use]
    pub fn initial(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            states: BTreeMap::new(),
            position: JsonPointer::root(),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Encode to compact JSON, eliding all-default states.
    #[must_use]
    pub fn encode(&self) -> String {
        let pruned = Self {
            name: self.name.clone(),
            version: self.version.clone(),
            states: self
                .states
                .iter()
                .filter(|(_, state)| !state.is_default())
                .map(|(position, state)| (position.clone(), state.clone()))
                .collect(),
            position: self.position.clone(),
        };
        serde_json::to_string(&pruned).unwrap_or_else(|_| String::from("{}"))
    }
}
