//! The workflow definition cache (name + version → compiled workflow).
//!
//! The authoritative copy is the verbatim source text in the definition
//! repository; the cache keeps the parsed document and the compiled node
//! tree. Process-global, no eviction: definitions are assumed to fit.

use crate::model::{self, WorkflowDefinition};
use crate::repository::DefinitionRepository;
use crate::tree::{self, NodeTree};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Workflow {name}:{version} is not defined"))]
    NotFound { name: String, version: String },

    #[snafu(display("Failed to parse workflow {name}:{version}: {source}"))]
    Parse {
        name: String,
        version: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("Failed to compile workflow {name}:{version}: {source}"))]
    Compile {
        name: String,
        version: String,
        source: tree::Error,
    },

    #[snafu(display("Repository error: {source}"))]
    Repository { source: crate::repository::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A parsed document together with its compiled node tree.
#[derive(Debug)]
pub struct CompiledWorkflow {
    pub source: String,
    pub definition: WorkflowDefinition,
    pub tree: NodeTree,
}

impl CompiledWorkflow {
    /// Parse and compile one document.
    pub fn compile(name: &str, version: &str, source: &str) -> Result<Self> {
        let definition = model::parse_document(source).context(ParseSnafu { name, version })?;
        let tree = NodeTree::build(&definition).context(CompileSnafu { name, version })?;
        Ok(Self {
            source: source.to_string(),
            definition,
            tree,
        })
    }
}

/// Process-global cache in front of the definition repository.
#[derive(Debug)]
pub struct DefinitionCache {
    repository: Arc<dyn DefinitionRepository>,
    cache: RwLock<HashMap<(String, String), Arc<CompiledWorkflow>>>,
    // Serializes misses so concurrent loads of the same definition compile
    // once (compute-if-absent).
    load: Mutex<()>,
}

impl DefinitionCache {
    #[must_use]
    pub fn new(repository: Arc<dyn DefinitionRepository>) -> Self {
        Self {
            repository,
            cache: RwLock::new(HashMap::new()),
            load: Mutex::new(()),
        }
    }

    pub async fn get(&self, name: &str, version: &str) -> Result<Arc<CompiledWorkflow>> {
        let key = (name.to_string(), version.to_string());
        if let Some(cached) = self.cache.read().await.get(&key) {
            return Ok(Arc::clone(cached));
        }

        let _guard = self.load.lock().await;
        if let Some(cached) = self.cache.read().await.get(&key) {
            return Ok(Arc::clone(cached));
        }

        let stored = self
            .repository
            .find(name, version)
            .await
            .context(RepositorySnafu)?
            .context(NotFoundSnafu { name, version })?;
        let compiled = Arc::new(CompiledWorkflow::compile(name, version, &stored.definition)?);
        self.cache
            .write()
            .await
            .insert(key, Arc::clone(&compiled));
        tracing::debug!(name, version, nodes = compiled.tree.len(), "compiled workflow definition");
        Ok(compiled)
    }

    /// Store a definition and compile it into the cache immediately.
    /// Used by deployments; the consumer path only reads.
    pub async fn put(&self, name: &str, version: &str, source: &str) -> Result<Arc<CompiledWorkflow>> {
        let compiled = Arc::new(CompiledWorkflow::compile(name, version, source)?);
        self.repository
            .put(name, version, source)
            .await
            .context(RepositorySnafu)?;
        self.cache
            .write()
            .await
            .insert((name.to_string(), version.to_string()), Arc::clone(&compiled));
        Ok(compiled)
    }
}
