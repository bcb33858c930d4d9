//! Registry for externally supplied node implementations.

use dashmap::DashMap;
use std::sync::Arc;

use super::{NodeInitError, WorkflowNode};
use crate::definition::NodeDefinition;

/// Constructor for a native node, keyed by assembly reference.
pub type NativeBuilder =
    Arc<dyn Fn(&NodeDefinition) -> Result<Box<dyn WorkflowNode>, NodeInitError> + Send + Sync>;

/// Maps `assemblyReference` strings to builders supplied by the host.
#[derive(Default)]
pub struct NativeNodeRegistry {
    builders: DashMap<String, NativeBuilder>,
}

impl NativeNodeRegistry {
    pub fn register(&self, reference: impl Into<String>, builder: NativeBuilder) {
        self.builders.insert(reference.into(), builder);
    }

    pub fn build(
        &self,
        definition: &NodeDefinition,
    ) -> Result<Box<dyn WorkflowNode>, NodeInitError> {
        let reference = definition.assembly_reference.as_deref().ok_or_else(|| {
            NodeInitError::MissingOption {
                node_id: definition.node_id.clone(),
                option: "assemblyReference".into(),
            }
        })?;
        let builder = self
            .builders
            .get(reference)
            .ok_or_else(|| NodeInitError::UnknownNative {
                reference: reference.to_string(),
            })?;
        builder(definition)
    }
}
