//! Secret lookup: a `name → JSON value` contract, read-only on the
//! execution path.

use async_trait::async_trait;
use snafu::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Secret '{name}' is not defined"))]
    Missing { name: String },

    #[snafu(display("Secret store error: {message}"))]
    Store { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait SecretStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>>;
}

/// Resolve a workflow's declared `use.secrets` into the scope map handed to
/// expressions as `$secrets`. Every declared name must resolve.
pub async fn resolve_secrets(
    store: &dyn SecretStore,
    names: &[String],
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut resolved = serde_json::Map::new();
    for name in names {
        let value = store.get(name).await?.context(MissingSnafu { name })?;
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Fixed map of secrets, used by tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    values: HashMap<String, serde_json::Value>,
}

impl InMemorySecretStore {
    #[must_use]
    pub fn new(values: HashMap<String, serde_json::Value>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.values.insert(name.into(), value);
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.get(name).cloned())
    }
}

/// Secrets from process environment variables. A value that parses as JSON
/// is exposed structured; anything else is exposed as a string.
#[derive(Debug, Default)]
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>> {
        match std::env::var(name) {
            Ok(raw) => Ok(Some(
                serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
            )),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(Error::Store {
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_collects_declared_names() {
        let mut store = InMemorySecretStore::default();
        store.insert("apiKey", json!("s3cr3t"));
        store.insert("oauth", json!({"client": "a", "secret": "b"}));

        let resolved = resolve_secrets(&store, &["apiKey".into(), "oauth".into()])
            .await
            .unwrap();
        assert_eq!(resolved["apiKey"], json!("s3cr3t"));
        assert_eq!(resolved["oauth"]["client"], json!("a"));
    }

    #[tokio::test]
    async fn test_missing_secret_is_an_error() {
        let store = InMemorySecretStore::default();
        let err = resolve_secrets(&store, &["nope".into()]).await.unwrap_err();
        assert!(matches!(err, Error::Missing { .. }));
    }
}
