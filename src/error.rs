//! The workflow error taxonomy.
//!
//! Unlike the infrastructure errors of the surrounding modules (snafu enums),
//! a [`WorkflowError`] is a first-class JSON value: it travels through the
//! engine, is matched by `try`/`catch` filters, is bound into catch scopes as
//! `$error`, and is persisted as the fault record of a FAULTED instance.

use crate::position::JsonPointer;
use serde::{Deserialize, Serialize};
use std::fmt;

const ERROR_TYPE_BASE: &str = "https://serverlessworkflow.io/spec/1.0.0/errors";

/// Stable error kinds with their default HTTP-like status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Expression,
    Authentication,
    Authorization,
    Timeout,
    Communication,
    Runtime,
}

impl ErrorKind {
    #[must_use]
    pub fn uri(self) -> String {
        format!("{ERROR_TYPE_BASE}/{}", self.slug())
    }

    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Expression => "expression",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Communication => "communication",
            ErrorKind::Runtime => "runtime",
        }
    }

    #[must_use]
    pub fn default_status(self) -> u16 {
        match self {
            ErrorKind::Configuration | ErrorKind::Validation | ErrorKind::Expression => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::Timeout => 408,
            ErrorKind::Communication | ErrorKind::Runtime => 500,
        }
    }
}

/// The error record raised by tasks and exposed to catch blocks.
///
/// Field names follow the DSL problem-details shape; `instance` is the
/// JSON pointer of the raising node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<JsonPointer>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl WorkflowError {
    #[must_use]
    pub fn new(kind: ErrorKind, title: impl Into<String>) -> Self {
        Self {
            error_type: kind.uri(),
            status: kind.default_status(),
            instance: None,
            title: title.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Tag the error with the raising node's position, keeping an existing
    /// tag if one was already set (a re-raised error keeps its origin).
    #[must_use]
    pub fn at(mut self, position: &JsonPointer) -> Self {
        if self.instance.is_none() {
            self.instance = Some(position.clone());
        }
        self
    }

    pub fn configuration(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, title)
    }

    pub fn validation(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, title)
    }

    pub fn expression(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expression, title)
    }

    pub fn authentication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, title)
    }

    pub fn timeout(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, title)
    }

    pub fn communication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Communication, title)
    }

    pub fn runtime(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, title)
    }

    /// The JSON value bound into catch scopes as `$error`.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "type": self.error_type,
                "status": self.status,
                "title": self.title,
            })
        })
    }

    #[must_use]
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.error_type == kind.uri()
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.error_type, self.status, self.title)?;
        if let Some(details) = &self.details {
            write!(f, ": {details}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkflowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_statuses() {
        assert_eq!(ErrorKind::Configuration.default_status(), 400);
        assert_eq!(ErrorKind::Authentication.default_status(), 401);
        assert_eq!(ErrorKind::Authorization.default_status(), 403);
        assert_eq!(ErrorKind::Timeout.default_status(), 408);
        assert_eq!(ErrorKind::Communication.default_status(), 500);
    }

    #[test]
    fn test_serializes_with_dsl_field_names() {
        let err = WorkflowError::communication("HTTP 503")
            .with_status(503)
            .with_details("GET https://example/ok failed")
            .at(&JsonPointer::from("/do/0/fetch"));
        let value = err.to_value();
        assert_eq!(
            value["type"],
            "https://serverlessworkflow.io/spec/1.0.0/errors/communication"
        );
        assert_eq!(value["status"], 503);
        assert_eq!(value["instance"], "/do/0/fetch");
    }

    #[test]
    fn test_at_keeps_first_position() {
        let err = WorkflowError::runtime("boom")
            .at(&JsonPointer::from("/do/0/a"))
            .at(&JsonPointer::from("/do/1/b"));
        assert_eq!(err.instance.unwrap().as_str(), "/do/0/a");
    }

    #[test]
    fn test_round_trip() {
        let err = WorkflowError::expression("no matching case").at(&JsonPointer::from("/do/0/r"));
        let json = serde_json::to_string(&err).unwrap();
        let back: WorkflowError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
