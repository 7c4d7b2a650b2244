//! Parameter set generation: matching operations against available inputs.

use std::sync::Arc;

use itertools::Itertools;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::exec::network::InputNetwork;
use crate::graph::dataflow::InputFlow;
use crate::graph::operation::Operation;
use crate::input::{Input, Parameter, ParameterSet};

/// Compute the parameter sets newly eligible to run for one operation
/// instance in one context.
///
/// The enumeration is deterministic given the network's insertion order and
/// the lexicographic order of input ports. Accepted sets are recorded in the
/// network's seen table *before* being returned, so an operation body runs at
/// most once per set even if the invocation later fails or times out.
pub fn generate(
    instance: &str,
    operation: &Operation,
    flow: &InputFlow,
    network: &mut InputNetwork,
) -> Vec<ParameterSet> {
    // Conditions gate: every condition definition needs at least one truthy
    // value in the context.
    for condition in &operation.conditions {
        let satisfied = network
            .by_definition(&condition.name)
            .iter()
            .any(|input| input.value().is_truthy());
        if !satisfied {
            return Vec::new();
        }
    }

    // An operation with no input ports has exactly one (empty) assignment;
    // the seen table makes it run once per context.
    if operation.inputs.is_empty() {
        let set = ParameterSet::new(SmallVec::new());
        let id = set.id();
        if network.seen(instance, &id) {
            return Vec::new();
        }
        network.record_seen(instance, id);
        return vec![set];
    }

    // Candidate inputs per port, restricted to the routed sources.
    let mut ports: Vec<&str> = Vec::with_capacity(operation.inputs.len());
    let mut candidates: Vec<Vec<Arc<Input>>> = Vec::with_capacity(operation.inputs.len());
    for (port, definition) in &operation.inputs {
        let sources = flow.sources(port);
        let eligible: Vec<Arc<Input>> = network
            .by_definition(&definition.name)
            .iter()
            .filter(|input| sources.contains(input.origin()))
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        ports.push(port.as_str());
        candidates.push(eligible);
    }

    let mut accepted = Vec::new();
    for combination in candidates
        .iter()
        .map(|eligible| eligible.iter())
        .multi_cartesian_product()
    {
        if !coherent_ancestry(&combination) {
            continue;
        }
        let parameters: SmallVec<[Parameter; 4]> = ports
            .iter()
            .zip(&combination)
            .map(|(port, input)| Parameter::new(*port, Arc::clone(input)))
            .collect();
        let set = ParameterSet::new(parameters);
        let id = set.id();
        if network.seen(instance, &id) {
            continue;
        }
        network.record_seen(instance, id);
        accepted.push(set);
    }
    accepted
}

/// A combination is coherent when the union of each chosen input's
/// origin-plus-ancestor closure never contains two distinct inputs of the
/// same definition. This keeps one row of the dataflow from mixing values
/// produced on different branches of a fan-out.
fn coherent_ancestry(combination: &[&Arc<Input>]) -> bool {
    let mut by_definition: FxHashMap<String, Uuid> = FxHashMap::default();
    for input in combination {
        if conflicts(&mut by_definition, input) {
            return false;
        }
        for ancestor in input.ancestors() {
            if conflicts(&mut by_definition, &ancestor) {
                return false;
            }
        }
    }
    true
}

fn conflicts(by_definition: &mut FxHashMap<String, Uuid>, input: &Arc<Input>) -> bool {
    let name = input.definition().name.as_str();
    match by_definition.get(name) {
        Some(uid) => *uid != input.uid(),
        None => {
            by_definition.insert(name.to_owned(), input.uid());
            false
        }
    }
}
