//! Concrete values produced within a context, and their assignment to
//! operation ports.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::graph::dataflow::Source;
use crate::graph::definition::Definition;
use crate::value::Value;

/// A value produced in a context, typed by a [`Definition`].
///
/// Every input has a stable unique identifier, the inputs consumed to produce
/// it (`parents`), and the identity of its producer (`origin`) for routing.
/// Parent links form a DAG by construction; the input network enforces this
/// at append time.
pub struct Input {
    uid: Uuid,
    value: Value,
    definition: Arc<Definition>,
    parents: Vec<Arc<Input>>,
    origin: Source,
}

impl Input {
    /// A seed input, created at context start.
    pub fn new(value: impl Into<Value>, definition: &Arc<Definition>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            value: value.into(),
            definition: Arc::clone(definition),
            parents: Vec::new(),
            origin: Source::Seed,
        }
    }

    /// An input produced by an operation, carrying producer identity for
    /// downstream routing.
    pub(crate) fn produced(
        value: Value,
        definition: &Arc<Definition>,
        parents: Vec<Arc<Input>>,
        origin: Source,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid: Uuid::new_v4(),
            value,
            definition: Arc::clone(definition),
            parents,
            origin,
        })
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }

    pub fn parents(&self) -> &[Arc<Input>] {
        &self.parents
    }

    pub fn origin(&self) -> &Source {
        &self.origin
    }

    /// Transitive ancestry, deduplicated by uid. Does not include `self`.
    pub fn ancestors(&self) -> Vec<Arc<Input>> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        let mut stack: Vec<&Arc<Input>> = self.parents.iter().collect();
        while let Some(input) = stack.pop() {
            if seen.insert(input.uid) {
                out.push(Arc::clone(input));
                stack.extend(input.parents.iter());
            }
        }
        out
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.definition.name, self.value)
    }
}

/// One binding of an input to an operation port.
#[derive(Debug, Clone)]
pub struct Parameter {
    port: String,
    input: Arc<Input>,
}

impl Parameter {
    pub(crate) fn new(port: impl Into<String>, input: Arc<Input>) -> Self {
        Self {
            port: port.into(),
            input,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn input(&self) -> &Arc<Input> {
        &self.input
    }

    pub fn value(&self) -> &Value {
        self.input.value()
    }

    pub fn definition(&self) -> &Arc<Definition> {
        self.input.definition()
    }
}

/// Identity of a parameter set: the sorted multiset of its inputs' uids.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ParameterSetId(Box<[Uuid]>);

impl fmt::Debug for ParameterSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for uid in &self.0 {
            if !first {
                f.write_str("+")?;
            }
            first = false;
            let hex = uid.simple().to_string();
            f.write_str(&hex[..8])?;
        }
        Ok(())
    }
}

/// One complete assignment of inputs to an operation's input ports.
///
/// Parameters are kept in lexicographic port order.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    parameters: SmallVec<[Parameter; 4]>,
}

impl ParameterSet {
    pub(crate) fn new(mut parameters: SmallVec<[Parameter; 4]>) -> Self {
        parameters.sort_by(|a, b| a.port.cmp(&b.port));
        Self { parameters }
    }

    pub fn id(&self) -> ParameterSetId {
        let mut uids: Box<[Uuid]> = self.parameters.iter().map(|p| p.input.uid()).collect();
        uids.sort_unstable();
        ParameterSetId(uids)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Arc<Input>> {
        self.parameters.iter().map(Parameter::input)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// The value bound to a port.
    pub fn get(&self, port: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|p| p.port == port)
            .map(Parameter::value)
    }

    /// The input bound to a port.
    pub fn input(&self, port: &str) -> Option<&Arc<Input>> {
        self.parameters
            .iter()
            .find(|p| p.port == port)
            .map(Parameter::input)
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::graph::definition::Definition;

    #[test]
    fn ancestors_closes_over_parents() {
        let def = Definition::new("n", "int");
        let root = Arc::new(Input::new(0_i64, &def));
        let mid = Input::produced(
            Value::Int(1),
            &def,
            vec![Arc::clone(&root)],
            Source::op("a", "n"),
        );
        let leaf = Input::produced(
            Value::Int(2),
            &def,
            vec![Arc::clone(&mid)],
            Source::op("b", "n"),
        );
        let ancestors: FxHashSet<Uuid> = leaf.ancestors().iter().map(|i| i.uid()).collect();
        assert_eq!(ancestors.len(), 2);
        assert!(ancestors.contains(&root.uid()));
        assert!(ancestors.contains(&mid.uid()));
    }

    #[test]
    fn id_ignores_port_assignment_order() {
        let def = Definition::new("n", "int");
        let a = Arc::new(Input::new(1_i64, &def));
        let b = Arc::new(Input::new(2_i64, &def));
        let x = ParameterSet::new(smallvec![
            Parameter::new("left", Arc::clone(&a)),
            Parameter::new("right", Arc::clone(&b)),
        ]);
        let y = ParameterSet::new(smallvec![
            Parameter::new("right", Arc::clone(&b)),
            Parameter::new("left", Arc::clone(&a)),
        ]);
        assert_eq!(x.id(), y.id());
    }
}
