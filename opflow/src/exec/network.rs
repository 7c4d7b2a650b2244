//! Per-context store of produced inputs.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::Error;
use crate::input::{Input, ParameterSet, ParameterSetId};

/// The network of inputs produced within one context.
///
/// Contexts are disjoint: each owns its network, and all mutation happens on
/// the context's driver task. Locks are the exception; their handles are
/// shared into operation invocations running concurrently within a stage.
#[derive(Default)]
pub struct InputNetwork {
    inputs: FxHashMap<Uuid, Arc<Input>>,
    /// Insertion-ordered per definition name.
    by_definition: FxHashMap<String, Vec<Arc<Input>>>,
    /// Lazily created, one per lock-bearing input.
    locks: FxHashMap<Uuid, Arc<Mutex<()>>>,
    /// Parameter sets already committed per operation instance.
    seen: FxHashMap<String, FxHashSet<ParameterSetId>>,
}

impl InputNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an input, idempotently by uid.
    ///
    /// Parent links must reference inputs already present: produced inputs
    /// only ever point backwards, so the parentage stays a DAG.
    pub fn add(&mut self, input: Arc<Input>) -> Result<(), Error> {
        if self.inputs.contains_key(&input.uid()) {
            return Ok(());
        }
        for parent in input.parents() {
            if !self.inputs.contains_key(&parent.uid()) {
                return Err(Error::Network(format!(
                    "input {} has parent {} not present in the network",
                    input.uid(),
                    parent.uid()
                )));
            }
        }
        self.by_definition
            .entry(input.definition().name.clone())
            .or_default()
            .push(Arc::clone(&input));
        self.inputs.insert(input.uid(), input);
        Ok(())
    }

    /// All inputs of a definition, in insertion order.
    pub fn by_definition(&self, name: &str) -> &[Arc<Input>] {
        self.by_definition
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, uid: Uuid) -> bool {
        self.inputs.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn seen(&self, instance: &str, id: &ParameterSetId) -> bool {
        self.seen
            .get(instance)
            .is_some_and(|ids| ids.contains(id))
    }

    pub fn record_seen(&mut self, instance: &str, id: ParameterSetId) {
        self.seen.entry(instance.to_owned()).or_default().insert(id);
    }

    /// Lock handles for the lock-bearing inputs of a parameter set, in
    /// canonical `(definition name, uid)` order so concurrent acquirers
    /// cannot deadlock. Acquire with [`LockSet::acquire`].
    pub fn locks_for(&mut self, parameters: &ParameterSet) -> LockSet {
        let mut keyed: Vec<(&str, Uuid)> = parameters
            .inputs()
            .filter(|input| input.definition().lock)
            .map(|input| (input.definition().name.as_str(), input.uid()))
            .collect();
        keyed.sort_unstable();
        keyed.dedup();
        let handles = keyed
            .into_iter()
            .map(|(_, uid)| Arc::clone(self.locks.entry(uid).or_default()))
            .collect();
        LockSet { handles }
    }
}

/// Locks to be held for the duration of one operation invocation.
pub struct LockSet {
    handles: Vec<Arc<Mutex<()>>>,
}

impl LockSet {
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Await every lock in canonical order. The underlying mutexes are fair,
    /// so waiters are granted FIFO and cannot starve.
    pub async fn acquire(self) -> Lease {
        let mut guards = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            guards.push(handle.lock_owned().await);
        }
        Lease { _guards: guards }
    }
}

/// Exclusive hold on a set of lock-bearing inputs. Released on drop, on every
/// exit path.
pub struct Lease {
    _guards: Vec<OwnedMutexGuard<()>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::dataflow::Source;
    use crate::graph::definition::Definition;
    use crate::input::Parameter;
    use crate::value::Value;

    fn param_set(inputs: &[&Arc<Input>]) -> ParameterSet {
        ParameterSet::new(
            inputs
                .iter()
                .enumerate()
                .map(|(i, input)| Parameter::new(format!("p{i}"), Arc::clone(input)))
                .collect::<smallvec::SmallVec<_>>(),
        )
    }

    #[test]
    fn add_is_idempotent_and_ordered() {
        let def = Definition::new("word", "string");
        let mut network = InputNetwork::new();
        let a = Arc::new(Input::new("a", &def));
        let b = Arc::new(Input::new("b", &def));
        network.add(Arc::clone(&a)).unwrap();
        network.add(Arc::clone(&b)).unwrap();
        network.add(Arc::clone(&a)).unwrap();
        let uids: Vec<_> = network.by_definition("word").iter().map(|i| i.uid()).collect();
        assert_eq!(uids, vec![a.uid(), b.uid()]);
        assert_eq!(network.len(), 2);
    }

    #[test]
    fn dangling_parent_rejected() {
        let def = Definition::new("word", "string");
        let mut network = InputNetwork::new();
        let orphan_parent = Arc::new(Input::new("gone", &def));
        let child = Input::produced(
            Value::from("x"),
            &def,
            vec![orphan_parent],
            Source::op("op", "out"),
        );
        assert!(matches!(network.add(child), Err(Error::Network(_))));
    }

    #[test]
    fn seen_table_dedupes_per_instance() {
        let def = Definition::new("word", "string");
        let mut network = InputNetwork::new();
        let input = Arc::new(Input::new("a", &def));
        network.add(Arc::clone(&input)).unwrap();
        let id = param_set(&[&input]).id();
        assert!(!network.seen("op_a", &id));
        network.record_seen("op_a", id.clone());
        assert!(network.seen("op_a", &id));
        assert!(!network.seen("op_b", &id));
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_dropped() {
        let def = Definition::new_locked("repo", "string");
        let mut network = InputNetwork::new();
        let input = Arc::new(Input::new("r", &def));
        network.add(Arc::clone(&input)).unwrap();
        let ps = param_set(&[&input]);

        let lease = network.locks_for(&ps).acquire().await;
        let contended = network.locks_for(&ps);
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            contended.acquire(),
        );
        assert!(second.await.is_err(), "lease should still be held");
        drop(lease);
        let reacquire = network.locks_for(&ps);
        tokio::time::timeout(std::time::Duration::from_millis(20), reacquire.acquire())
            .await
            .expect("lease released on drop");
    }

    #[test]
    fn unlocked_definitions_need_no_lease() {
        let def = Definition::new("word", "string");
        let mut network = InputNetwork::new();
        let input = Arc::new(Input::new("a", &def));
        network.add(Arc::clone(&input)).unwrap();
        assert!(network.locks_for(&param_set(&[&input])).is_empty());
    }
}
