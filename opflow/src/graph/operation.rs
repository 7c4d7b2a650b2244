//! Operation descriptors.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::graph::definition::Definition;

/// Execution phase of an operation within a context.
///
/// Stages run strictly in order per context: no operation of a stage runs
/// until the previous stage is quiescent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Processing,
    Cleanup,
    Output,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 3] = [Stage::Processing, Stage::Cleanup, Stage::Output];
}

/// Immutable descriptor of one operation: the implementation it names, its
/// typed input and output ports, gating conditions, stage, and fan-out ports.
///
/// An operation carries no instance name; a [`DataFlow`](crate::DataFlow)
/// maps instance names to operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Name of the implementation to load.
    pub name: String,
    pub inputs: BTreeMap<String, Arc<Definition>>,
    pub outputs: BTreeMap<String, Arc<Definition>>,
    /// Definitions which must have at least one truthy value present in the
    /// context for the operation to be eligible.
    pub conditions: Vec<Arc<Definition>>,
    pub stage: Stage,
    /// Output ports whose value is a list to be unpacked into one input per
    /// element.
    pub expand: Vec<String>,
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            conditions: Vec::new(),
            stage: Stage::Processing,
            expand: Vec::new(),
        }
    }

    pub fn input(mut self, port: impl Into<String>, definition: &Arc<Definition>) -> Self {
        self.inputs.insert(port.into(), Arc::clone(definition));
        self
    }

    pub fn output(mut self, port: impl Into<String>, definition: &Arc<Definition>) -> Self {
        self.outputs.insert(port.into(), Arc::clone(definition));
        self
    }

    pub fn condition(mut self, definition: &Arc<Definition>) -> Self {
        self.conditions.push(Arc::clone(definition));
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Mark an output port for fan-out expansion.
    pub fn expand(mut self, port: impl Into<String>) -> Self {
        self.expand.push(port.into());
        self
    }

    /// All definitions this operation references.
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<Definition>> {
        self.inputs
            .values()
            .chain(self.outputs.values())
            .chain(self.conditions.iter())
    }
}

/// Union of the definitions referenced by a set of operations, keyed by name.
///
/// Name collisions must be identity collisions; two operations binding the
/// same name to distinct definitions is a validation error.
pub fn definitions_of<'a>(
    operations: impl IntoIterator<Item = &'a Operation>,
) -> Result<BTreeMap<String, Arc<Definition>>, Error> {
    let mut definitions: BTreeMap<String, Arc<Definition>> = BTreeMap::new();
    for operation in operations {
        for definition in operation.definitions() {
            match definitions.get(&definition.name) {
                None => {
                    definitions.insert(definition.name.clone(), Arc::clone(definition));
                }
                Some(existing) if **existing == **definition => {}
                Some(_) => {
                    return Err(Error::FlowValidation(format!(
                        "definition name `{}` bound to two distinct definitions",
                        definition.name
                    )));
                }
            }
        }
    }
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_union_rejects_mismatch() {
        let url = Definition::new("URL", "string");
        let url_locked = Definition::new_locked("URL", "string");
        let a = Operation::new("fetch").input("url", &url);
        let b = Operation::new("probe").input("url", &url_locked);
        assert!(definitions_of([&a, &b]).is_err());
        assert!(definitions_of([&a, &a.clone()]).is_ok());
    }

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(Stage::Processing).unwrap(),
            serde_json::json!("processing")
        );
        let stage: Stage = serde_json::from_value(serde_json::json!("output")).unwrap();
        assert_eq!(stage, Stage::Output);
    }
}
