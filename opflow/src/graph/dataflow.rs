//! Dataflow graphs: operation instances plus explicit routing.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::graph::definition::Definition;
use crate::graph::operation::{Operation, definitions_of};
use crate::input::Input;
use crate::op::ImplementationFactory;

/// Where a value satisfying an input port may come from: seeded into the
/// context, or produced on a named output port of a named operation instance.
///
/// Rendered as `"seed"` or `"<instance>.<port>"` in descriptors. Instance
/// names may contain dots; output ports may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Seed,
    Op { instance: String, port: String },
}

impl Source {
    pub fn op(instance: impl Into<String>, port: impl Into<String>) -> Self {
        Source::Op {
            instance: instance.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Seed => f.write_str("seed"),
            Source::Op { instance, port } => write!(f, "{instance}.{port}"),
        }
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "seed" {
            return Ok(Source::Seed);
        }
        let (instance, port) = s
            .rsplit_once('.')
            .ok_or_else(|| Error::Descriptor(format!("source `{s}` is not `seed` or `<instance>.<port>`")))?;
        Ok(Source::op(instance, port))
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|err| D::Error::custom(format!("{err}")))
    }
}

/// Routing table for one operation instance: input port to the sources whose
/// values may satisfy it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputFlow(pub BTreeMap<String, Vec<Source>>);

impl InputFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, port: impl Into<String>, source: Source) -> Self {
        self.0.entry(port.into()).or_default().push(source);
        self
    }

    pub fn sources(&self, port: &str) -> &[Source] {
        self.0.get(port).map(Vec::as_slice).unwrap_or_default()
    }
}

/// A validated graph of operation instances, their routing, per-dataflow seed
/// inputs, and per-instance configs.
///
/// Built via [`DataFlow::builder`], which validates routing and derives the
/// definitions table. Inline implementations (not exported) take precedence
/// over the orchestrator's resolver.
#[derive(Clone)]
pub struct DataFlow {
    pub operations: BTreeMap<String, Operation>,
    pub flow: BTreeMap<String, InputFlow>,
    /// Added to every context's network at context start.
    pub seed: Vec<Arc<Input>>,
    /// Opaque per-instance configs, delivered to implementations at open time.
    pub configs: BTreeMap<String, serde_json::Value>,
    /// Union of all referenced definitions, keyed by name. Derived.
    pub definitions: BTreeMap<String, Arc<Definition>>,
    pub(crate) implementations: FxHashMap<String, Arc<dyn ImplementationFactory>>,
}

impl DataFlow {
    pub fn builder() -> DataFlowBuilder {
        DataFlowBuilder::default()
    }
}

impl fmt::Debug for DataFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFlow")
            .field("operations", &self.operations)
            .field("flow", &self.flow)
            .field("seed", &self.seed)
            .field("configs", &self.configs)
            .field(
                "implementations",
                &self.implementations.keys().collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl PartialEq for DataFlow {
    /// Structural equality: seed inputs compare by value and definition (uids
    /// are per-creation and never serialized); inline implementations are
    /// ignored.
    fn eq(&self, other: &Self) -> bool {
        self.operations == other.operations
            && self.flow == other.flow
            && self.configs == other.configs
            && self.definitions == other.definitions
            && self.seed.len() == other.seed.len()
            && self
                .seed
                .iter()
                .zip(other.seed.iter())
                .all(|(a, b)| a.value() == b.value() && a.definition() == b.definition())
    }
}

/// Derive routing for a set of operations.
///
/// For every input port: if any operation outputs the port's definition, the
/// port is wired to all such `(instance, output-port)` pairs, in lexicographic
/// order; otherwise it is wired to `seed`.
pub fn auto_wire(operations: &BTreeMap<String, Operation>) -> BTreeMap<String, InputFlow> {
    let mut producers: BTreeMap<&str, Vec<Source>> = BTreeMap::new();
    for (instance, operation) in operations {
        for (port, definition) in &operation.outputs {
            producers
                .entry(&definition.name)
                .or_default()
                .push(Source::op(instance, port));
        }
    }
    operations
        .iter()
        .map(|(instance, operation)| {
            let mut flow = InputFlow::new();
            for (port, definition) in &operation.inputs {
                let sources = match producers.get(definition.name.as_str()) {
                    Some(sources) => sources.clone(),
                    None => vec![Source::Seed],
                };
                flow.0.insert(port.clone(), sources);
            }
            (instance.clone(), flow)
        })
        .collect()
}

#[derive(Default)]
pub struct DataFlowBuilder {
    operations: BTreeMap<String, Operation>,
    flow: Option<BTreeMap<String, InputFlow>>,
    seed: Vec<Arc<Input>>,
    configs: BTreeMap<String, serde_json::Value>,
    implementations: FxHashMap<String, Arc<dyn ImplementationFactory>>,
}

impl DataFlowBuilder {
    pub fn operation(mut self, instance: impl Into<String>, operation: Operation) -> Self {
        self.operations.insert(instance.into(), operation);
        self
    }

    /// Explicit routing for one instance. When no routing is given for any
    /// instance, the whole flow is derived via [`auto_wire`].
    pub fn flow(mut self, instance: impl Into<String>, flow: InputFlow) -> Self {
        self.flow
            .get_or_insert_with(BTreeMap::new)
            .insert(instance.into(), flow);
        self
    }

    pub fn seed(mut self, input: Input) -> Self {
        self.seed.push(Arc::new(input));
        self
    }

    pub fn config(mut self, instance: impl Into<String>, config: serde_json::Value) -> Self {
        self.configs.insert(instance.into(), config);
        self
    }

    /// Register an implementation inline, keyed by operation name. Inline
    /// implementations shadow the orchestrator's resolver.
    pub fn implementation(
        mut self,
        name: impl Into<String>,
        factory: impl ImplementationFactory + 'static,
    ) -> Self {
        self.implementations.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn build(self) -> Result<DataFlow, Error> {
        let mut definitions = definitions_of(self.operations.values())?;
        for input in &self.seed {
            let definition = input.definition();
            match definitions.get(&definition.name) {
                None => {
                    definitions.insert(definition.name.clone(), Arc::clone(definition));
                }
                Some(existing) if existing == definition => {}
                Some(_) => {
                    return Err(Error::FlowValidation(format!(
                        "seed input definition `{}` conflicts with the operations'",
                        definition.name
                    )));
                }
            }
        }

        let flow = match self.flow {
            Some(flow) => flow,
            None => auto_wire(&self.operations),
        };
        validate_flow(&self.operations, &flow)?;

        for (instance, operation) in &self.operations {
            for port in &operation.expand {
                if !operation.outputs.contains_key(port) {
                    return Err(Error::FlowValidation(format!(
                        "`{instance}` expands `{port}` which is not one of its output ports"
                    )));
                }
            }
        }

        Ok(DataFlow {
            operations: self.operations,
            flow,
            seed: self.seed,
            configs: self.configs,
            definitions,
            implementations: self.implementations,
        })
    }
}

fn validate_flow(
    operations: &BTreeMap<String, Operation>,
    flow: &BTreeMap<String, InputFlow>,
) -> Result<(), Error> {
    for instance in flow.keys() {
        if !operations.contains_key(instance) {
            return Err(Error::FlowValidation(format!(
                "flow routes unknown instance `{instance}`"
            )));
        }
    }
    for (instance, operation) in operations {
        let instance_flow = flow.get(instance).ok_or_else(|| {
            Error::FlowValidation(format!("no flow for instance `{instance}`"))
        })?;
        for port in instance_flow.0.keys() {
            if !operation.inputs.contains_key(port) {
                return Err(Error::FlowValidation(format!(
                    "flow for `{instance}` routes unknown input port `{port}`"
                )));
            }
        }
        for (port, definition) in &operation.inputs {
            let sources = instance_flow.sources(port);
            if sources.is_empty() {
                return Err(Error::FlowValidation(format!(
                    "input port `{instance}.{port}` has no sources"
                )));
            }
            for source in sources {
                let Source::Op {
                    instance: producer,
                    port: output,
                } = source
                else {
                    continue;
                };
                let Some(producing) = operations.get(producer) else {
                    return Err(Error::FlowValidation(format!(
                        "`{instance}.{port}` sources unknown instance `{producer}`"
                    )));
                };
                let Some(produced) = producing.outputs.get(output) else {
                    return Err(Error::FlowValidation(format!(
                        "`{instance}.{port}` sources unknown output `{producer}.{output}`"
                    )));
                };
                if produced != definition {
                    return Err(Error::FlowValidation(format!(
                        "`{producer}.{output}` produces `{}` but `{instance}.{port}` expects `{}`",
                        produced.name, definition.name
                    )));
                }
            }
        }
    }
    Ok(())
}
