//! Merges the variable/attribute namespace of every open sub-engine into one
//! flat, dataset-prefixed namespace (§4.7).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::subengine::{AttributeInfo, SubEngine, VariableInfo};

/// One entry of the merged namespace: `fullName = dataset.name + "/" +
/// innerName`, plus enough to route a read back to its owner without the
/// owner ever needing a back-reference to the merger (§9 "replaced
/// patterns": index into a vector the federated engine holds, never a
/// raw back-pointer).
#[derive(Debug, Clone)]
pub struct MergedVariable {
    pub full_name: String,
    pub inner_name: String,
    pub owner_engine_idx: usize,
    pub info: VariableInfo,
}

#[derive(Debug, Clone)]
pub struct MergedAttribute {
    pub full_name: String,
    pub inner_name: String,
    pub owner_engine_idx: usize,
    pub info: AttributeInfo,
}

/// Builds and holds the merged namespace for one `FederatedEngine` instance.
#[derive(Debug, Default)]
pub struct NamespaceMerger {
    variables: HashMap<String, MergedVariable>,
    attributes: HashMap<String, MergedAttribute>,
}

impl NamespaceMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Imports every variable/attribute of `engine`, prefixing each name
    /// with `dataset_name`. Struct-typed entries have no representation in
    /// `ElementType` and are simply absent from `SubEngine::available_*`,
    /// so no explicit skip logic is needed here (§4.7).
    ///
    /// If a `fullName` collides with one already registered, the new
    /// registration replaces the old one and a warning is logged; names are
    /// never mangled to avoid the collision (§4.7 conflict policy).
    pub async fn import(
        &mut self,
        dataset_name: &str,
        owner_engine_idx: usize,
        engine: &dyn SubEngine,
    ) {
        for info in engine.available_variables() {
            let full_name = format!("{dataset_name}/{}", info.name);
            if self.variables.contains_key(&full_name) {
                warn!(
                    full_name = %full_name,
                    "merged variable name collision; later registration wins"
                );
            }
            self.variables.insert(
                full_name.clone(),
                MergedVariable {
                    full_name,
                    inner_name: info.name.clone(),
                    owner_engine_idx,
                    info,
                },
            );
        }

        for info in engine.available_attributes() {
            let full_name = format!("{dataset_name}/{}", info.name);
            if self.attributes.contains_key(&full_name) {
                warn!(
                    full_name = %full_name,
                    "merged attribute name collision; later registration wins"
                );
            }
            self.attributes.insert(
                full_name.clone(),
                MergedAttribute {
                    full_name,
                    inner_name: info.name.clone(),
                    owner_engine_idx,
                    info,
                },
            );
        }
    }

    pub fn variable(&self, full_name: &str) -> Option<&MergedVariable> {
        self.variables.get(full_name)
    }

    pub fn attribute(&self, full_name: &str) -> Option<&MergedAttribute> {
        self.attributes.get(full_name)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }
}

/// One dataset's owned sub-engine plus its display name, held by the
/// `FederatedEngine` in open order so `Close` can tear them down in reverse
/// (§3 ownership: "creates them in open order and destroys in reverse").
pub struct OwnedSubEngine {
    pub dataset_name: String,
    pub engine: Arc<dyn SubEngine>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subengine::{ElementType, MemorySubEngine};

    fn engine_with(name: &str) -> MemorySubEngine {
        MemorySubEngine::new().with_variable(
            VariableInfo {
                name: name.into(),
                element_type: ElementType::I32,
                shape: vec![1],
            },
            vec![0; 4],
        )
    }

    #[tokio::test]
    async fn import_prefixes_names_with_dataset() {
        let mut merger = NamespaceMerger::new();
        let engine = engine_with("temperature");
        merger.import("sim.bp", 0, &engine).await;
        assert!(merger.variable("sim.bp/temperature").is_some());
        assert!(merger.variable("temperature").is_none());
    }

    #[tokio::test]
    async fn later_registration_wins_on_collision() {
        let mut merger = NamespaceMerger::new();
        let first = engine_with("pressure");
        let second = engine_with("pressure");
        merger.import("sim.bp", 0, &first).await;
        merger.import("sim.bp", 1, &second).await;
        let entry = merger.variable("sim.bp/pressure").unwrap();
        assert_eq!(entry.owner_engine_idx, 1);
    }
}
