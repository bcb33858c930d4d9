//! Graph file loading: JSON and YAML front ends for workflow definitions.
//!
//! This is the external-collaborator surface for definitions on disk. Both
//! formats share the same field names; the format is picked by file
//! extension (`.json` vs `.yaml`/`.yml`), with JSON as the fallback.

use std::path::Path;

use miette::Diagnostic;
use thiserror::Error;

use crate::definition::WorkflowDefinition;

#[derive(Debug, Error, Diagnostic)]
pub enum LoaderError {
    #[error("failed to read graph file {path}: {source}")]
    #[diagnostic(code(loomflow::loader::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {context}: {source}")]
    #[diagnostic(
        code(loomflow::loader::json),
        help("Check the graph file against the documented field names (workflowId, nodes, connections).")
    )]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid YAML in {context}: {source}")]
    #[diagnostic(code(loomflow::loader::yaml))]
    Yaml {
        context: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Parse a definition from JSON text.
pub fn from_json(text: &str) -> Result<WorkflowDefinition, LoaderError> {
    serde_json::from_str(text).map_err(|source| LoaderError::Json {
        context: "inline JSON".into(),
        source,
    })
}

/// Parse a definition from YAML text.
pub fn from_yaml(text: &str) -> Result<WorkflowDefinition, LoaderError> {
    serde_yaml::from_str(text).map_err(|source| LoaderError::Yaml {
        context: "inline YAML".into(),
        source,
    })
}

/// Serialize a definition to pretty JSON.
pub fn to_json(definition: &WorkflowDefinition) -> Result<String, LoaderError> {
    serde_json::to_string_pretty(definition).map_err(|source| LoaderError::Json {
        context: "serialization".into(),
        source,
    })
}

/// Serialize a definition to YAML.
pub fn to_yaml(definition: &WorkflowDefinition) -> Result<String, LoaderError> {
    serde_yaml::to_string(definition).map_err(|source| LoaderError::Yaml {
        context: "serialization".into(),
        source,
    })
}

/// Load a definition from a path, picking the format by extension.
pub fn load_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition, LoaderError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let context = path.display().to_string();
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&text).map_err(|source| LoaderError::Yaml { context, source })
        }
        _ => serde_json::from_str(&text).map_err(|source| LoaderError::Json { context, source }),
    }
}
