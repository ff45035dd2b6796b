use super::duration::DurationSpec;
use super::TaskList;
use serde::{Deserialize, Serialize};

/// A retry policy, inline or referenced by name from `use.retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicyOrRef {
    Reference(String),
    Policy(RetryPolicy),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(rename = "exceptWhen", default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<JitterDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<RetryLimit>,
}

/// Backoff strategy. The DSL marks the strategy by which key is present;
/// the values carry no options today.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackoffDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exponential: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffKind {
    #[default]
    Constant,
    Linear,
    Exponential,
}

impl BackoffDefinition {
    #[must_use]
    pub fn kind(&self) -> BackoffKind {
        if self.exponential.is_some() {
            BackoffKind::Exponential
        } else if self.linear.is_some() {
            BackoffKind::Linear
        } else {
            BackoffKind::Constant
        }
    }
}

/// Uniform random jitter range added to the computed delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterDefinition {
    #[serde(alias = "min")]
    pub from: DurationSpec,
    #[serde(alias = "max")]
    pub to: DurationSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<DurationSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<DurationSpec>,
}

/// The `catch` block of a Try task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilter>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(rename = "exceptWhen", default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyOrRef>,
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<ErrorFilterWith>,
}

/// Exact-match filter over error fields; every present field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilterWith {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// An error declaration (for Raise and `use.errors`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDefinition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(alias = "detail", default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}
