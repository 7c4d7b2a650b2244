//! On-disk / over-the-wire form of dataflows.
//!
//! In the linked form, operation ports reference definitions by name and a
//! top-level definitions table supplies them; in the unlinked form each port
//! carries its full definition inline. Seed inputs serialize value and
//! definition only: uids exist per creation and never cross the boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::graph::dataflow::{DataFlow, InputFlow};
use crate::graph::definition::Definition;
use crate::graph::operation::{Operation, Stage};
use crate::input::Input;
use crate::value::Value;

/// A port's definition: by name (linked) or inline (unlinked).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortDoc {
    Name(String),
    Inline(Definition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDoc {
    pub name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, PortDoc>,
    #[serde(default)]
    pub outputs: BTreeMap<String, PortDoc>,
    /// Always definition names, in both forms.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expand: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedDoc {
    pub value: serde_json::Value,
    pub definition: Definition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFlowDoc {
    pub operations: BTreeMap<String, OperationDoc>,
    #[serde(default)]
    pub seed: Vec<SeedDoc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, serde_json::Value>,
    /// Empty means: derive by auto-wiring on import.
    #[serde(default)]
    pub flow: BTreeMap<String, InputFlow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions: Option<BTreeMap<String, Definition>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub linked: bool,
}

impl DataFlow {
    /// Export to descriptor form. Fails if a seed value is opaque.
    pub fn export(&self, linked: bool) -> Result<DataFlowDoc, Error> {
        let port = |definition: &Arc<Definition>| {
            if linked {
                PortDoc::Name(definition.name.clone())
            } else {
                PortDoc::Inline((**definition).clone())
            }
        };
        let operations = self
            .operations
            .iter()
            .map(|(instance, operation)| {
                (
                    instance.clone(),
                    OperationDoc {
                        name: operation.name.clone(),
                        inputs: operation
                            .inputs
                            .iter()
                            .map(|(p, d)| (p.clone(), port(d)))
                            .collect(),
                        outputs: operation
                            .outputs
                            .iter()
                            .map(|(p, d)| (p.clone(), port(d)))
                            .collect(),
                        conditions: operation
                            .conditions
                            .iter()
                            .map(|d| d.name.clone())
                            .collect(),
                        stage: operation.stage,
                        expand: operation.expand.clone(),
                    },
                )
            })
            .collect();
        let seed = self
            .seed
            .iter()
            .map(|input| {
                Ok(SeedDoc {
                    value: input.value().to_json()?,
                    definition: (**input.definition()).clone(),
                })
            })
            .collect::<Result<_, Error>>()?;
        Ok(DataFlowDoc {
            operations,
            seed,
            configs: self.configs.clone(),
            flow: self.flow.clone(),
            definitions: linked.then(|| {
                self.definitions
                    .iter()
                    .map(|(name, definition)| (name.clone(), (**definition).clone()))
                    .collect()
            }),
            linked,
        })
    }

    pub fn to_json(&self, linked: bool) -> Result<serde_json::Value, Error> {
        serde_json::to_value(self.export(linked)?)
            .map_err(|error| Error::Export(error.to_string()))
    }

    /// Import a descriptor, re-running full validation.
    pub fn from_doc(doc: DataFlowDoc) -> Result<DataFlow, Error> {
        // Linked definitions table; the key supplies an omitted name.
        let mut known: BTreeMap<String, Arc<Definition>> = BTreeMap::new();
        if let Some(definitions) = doc.definitions {
            for (name, mut definition) in definitions {
                if definition.name.is_empty() {
                    definition.name = name.clone();
                }
                known.insert(name, Arc::new(definition));
            }
        }

        let mut builder = DataFlow::builder();
        for seed in doc.seed {
            let definition = Arc::new(seed.definition);
            known
                .entry(definition.name.clone())
                .or_insert_with(|| Arc::clone(&definition));
            builder = builder.seed(Input::new(Value::from_json(seed.value), &definition));
        }

        // Ports first, so conditions can resolve against inline definitions.
        let mut pending: Vec<(String, Operation, Vec<String>)> = Vec::new();
        for (instance, doc_op) in doc.operations {
            let mut operation = Operation::new(doc_op.name).stage(doc_op.stage);
            for (port_name, port) in doc_op.inputs {
                let definition = resolve_port(&instance, port, &mut known)?;
                operation = operation.input(port_name, &definition);
            }
            for (port_name, port) in doc_op.outputs {
                let definition = resolve_port(&instance, port, &mut known)?;
                operation = operation.output(port_name, &definition);
            }
            for port_name in doc_op.expand {
                operation = operation.expand(port_name);
            }
            pending.push((instance, operation, doc_op.conditions));
        }
        for (instance, mut operation, conditions) in pending {
            for name in conditions {
                let definition = known.get(&name).ok_or_else(|| Error::DefinitionMissing {
                    instance: instance.clone(),
                    definition: name,
                })?;
                operation = operation.condition(definition);
            }
            builder = builder.operation(instance, operation);
        }

        for (instance, flow) in doc.flow {
            builder = builder.flow(instance, flow);
        }
        for (instance, config) in doc.configs {
            builder = builder.config(instance, config);
        }
        builder.build()
    }

    pub fn from_json(json: serde_json::Value) -> Result<DataFlow, Error> {
        let doc: DataFlowDoc = serde_json::from_value(json)
            .map_err(|error| Error::Descriptor(error.to_string()))?;
        Self::from_doc(doc)
    }
}

fn resolve_port(
    instance: &str,
    port: PortDoc,
    known: &mut BTreeMap<String, Arc<Definition>>,
) -> Result<Arc<Definition>, Error> {
    match port {
        PortDoc::Name(name) => known.get(&name).cloned().ok_or_else(|| Error::DefinitionMissing {
            instance: instance.to_owned(),
            definition: name,
        }),
        PortDoc::Inline(definition) => {
            let definition = Arc::new(definition);
            known
                .entry(definition.name.clone())
                .or_insert_with(|| Arc::clone(&definition));
            Ok(definition)
        }
    }
}
