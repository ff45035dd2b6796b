//! JSON-Schema validation for task inputs, outputs and exported context.
//!
//! Schemas come inline (`schema.document`) or as an external resource
//! (`schema.resource.endpoint`). External documents are fetched once and the
//! compiled validator is cached by URI for the lifetime of the process.

use crate::model::SchemaDefinition;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Schema compile error: {message}"))]
    Compile { message: String },

    #[snafu(display("Failed to fetch schema from {uri}: {message}"))]
    Fetch { uri: String, message: String },

    #[snafu(display("Schema definition carries neither an inline document nor a resource"))]
    EmptyDefinition,

    #[snafu(display("{violations}"))]
    Violations { violations: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Compiles and caches schema validators.
pub struct SchemaRegistry {
    client: reqwest::Client,
    by_uri: RwLock<HashMap<String, Arc<jsonschema::Validator>>>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry").finish_non_exhaustive()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            by_uri: RwLock::new(HashMap::new()),
        }
    }

    /// Validate `value` against the schema definition. All violations are
    /// collected and concatenated into a single error.
    pub async fn validate(&self, value: &serde_json::Value, schema: &SchemaDefinition) -> Result<()> {
        let validator = self.validator_for(schema).await?;
        let violations: Vec<String> = validator
            .iter_errors(value)
            .map(|violation| {
                let path = violation.instance_path.to_string();
                if path.is_empty() {
                    violation.to_string()
                } else {
                    format!("{path}: {violation}")
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Violations {
                violations: violations.join("; "),
            })
        }
    }

    async fn validator_for(&self, schema: &SchemaDefinition) -> Result<Arc<jsonschema::Validator>> {
        if let Some(document) = &schema.document {
            return compile(document).map(Arc::new);
        }
        let Some(resource) = &schema.resource else {
            return Err(Error::EmptyDefinition);
        };
        let uri = resource.endpoint.uri().to_string();

        if let Some(cached) = self.by_uri.read().await.get(&uri) {
            return Ok(Arc::clone(cached));
        }

        let document = self
            .client
            .get(&uri)
            .send()
            .await
            .map_err(|e| Error::Fetch {
                uri: uri.clone(),
                message: e.to_string(),
            })?
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::Fetch {
                uri: uri.clone(),
                message: e.to_string(),
            })?;

        let validator = Arc::new(compile(&document)?);
        let mut cache = self.by_uri.write().await;
        Ok(Arc::clone(
            cache.entry(uri).or_insert_with(|| Arc::clone(&validator)),
        ))
    }
}

fn compile(document: &serde_json::Value) -> Result<jsonschema::Validator> {
    jsonschema::validator_for(document).map_err(|e| Error::Compile {
        message: e.to_string(),
    })
}
