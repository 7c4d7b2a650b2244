//! Driving contexts through stages to quiescence.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::stream::{BoxStream, FuturesUnordered};
use futures::{Future, Stream, StreamExt};
use rustc_hash::FxHashMap;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::Error;
use crate::exec::network::{InputNetwork, LockSet};
use crate::exec::paramset::generate;
use crate::graph::dataflow::{DataFlow, Source};
use crate::graph::operation::Stage;
use crate::input::{Input, ParameterSet};
use crate::op::{ImplementationResolver, OperationContext, OperationImplementation};
use crate::value::Value;

/// Values produced by a context's output-stage operations, keyed by output
/// port.
pub type OutputMap = BTreeMap<String, Value>;

/// Terminal event for one context.
pub type ContextResult = (String, Result<OutputMap, Error>);

/// Executes dataflows over streams of input contexts.
///
/// Cheap to clone; implementations may capture a clone to run sub-dataflows
/// from within an operation.
#[derive(Clone)]
pub struct Orchestrator {
    resolver: Arc<dyn ImplementationResolver>,
    max_in_flight: usize,
    max_contexts: usize,
    timeout: Option<Duration>,
    grace: Duration,
}

impl Orchestrator {
    pub fn new(resolver: Arc<dyn ImplementationResolver>) -> Self {
        Self {
            resolver,
            max_in_flight: 64,
            max_contexts: 16,
            timeout: None,
            grace: Duration::from_secs(5),
        }
    }

    /// Bound on simultaneously running operation invocations, across all
    /// contexts.
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        assert!(limit > 0, "max_in_flight must be nonzero");
        self.max_in_flight = limit;
        self
    }

    /// Bound on simultaneously active contexts. The context producer is
    /// backpressured when saturated.
    pub fn max_contexts(mut self, limit: usize) -> Self {
        assert!(limit > 0, "max_contexts must be nonzero");
        self.max_contexts = limit;
        self
    }

    /// Per-invocation timeout. A timed-out invocation is cancelled; its
    /// parameter set stays consumed and no outputs are recorded.
    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How long in-flight invocations get to finish after cancellation.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Start a run: resolve and open every operation instance's
    /// implementation, then admit contexts from `contexts` as capacity
    /// allows.
    ///
    /// Returns a handle streaming `(handle, output-map)` results in
    /// completion order. Startup failures (unknown implementation, missing
    /// config, `open` error) reject the run before any context is admitted;
    /// already-opened implementations are closed again.
    pub async fn run(
        &self,
        dataflow: DataFlow,
        contexts: impl Stream<Item = (String, Vec<Input>)> + Send + 'static,
    ) -> Result<RunHandle, Error> {
        // Resolve everything before opening anything.
        let mut implementations: FxHashMap<String, Arc<dyn OperationImplementation>> =
            FxHashMap::default();
        for (instance, operation) in &dataflow.operations {
            let factory = dataflow
                .implementations
                .get(&operation.name)
                .cloned()
                .or_else(|| self.resolver.resolve(&operation.name))
                .ok_or_else(|| Error::ImplementationNotFound(operation.name.clone()))?;
            let implementation: Arc<dyn OperationImplementation> =
                Arc::from(factory.instantiate());
            if implementation.requires_config() && !dataflow.configs.contains_key(instance) {
                return Err(Error::MissingConfig(instance.clone()));
            }
            implementations.insert(instance.clone(), implementation);
        }

        let mut opened: Vec<String> = Vec::with_capacity(implementations.len());
        for (instance, implementation) in &implementations {
            let config = dataflow.configs.get(instance);
            if let Err(source) = implementation.open(config).await {
                for name in &opened {
                    close_one(name, &implementations[name]).await;
                }
                return Err(Error::Startup {
                    instance: instance.clone(),
                    source,
                });
            }
            opened.push(instance.clone());
        }

        let shared = Arc::new(RunShared {
            dataflow,
            implementations,
            in_flight: Semaphore::new(self.max_in_flight),
            timeout: self.timeout,
            grace: self.grace,
            cancel: CancellationToken::new(),
        });
        let (results_send, results_recv) = mpsc::unbounded_channel();
        let cancel = shared.cancel.clone();
        let driver = tokio::spawn(drive(
            shared,
            contexts.boxed(),
            results_send,
            self.max_contexts,
        ));
        Ok(RunHandle {
            results: UnboundedReceiverStream::new(results_recv),
            cancel,
            driver,
        })
    }
}

/// Handle on a running dataflow: a stream of per-context results, plus
/// cancellation.
///
/// The stream ends once every admitted context has terminated and all
/// implementations are closed.
pub struct RunHandle {
    results: UnboundedReceiverStream<ContextResult>,
    cancel: CancellationToken,
    driver: tokio::task::JoinHandle<()>,
}

impl RunHandle {
    /// Stop admitting contexts and signal in-flight work to wind down.
    /// In-flight invocations get the configured grace period; affected
    /// contexts terminate with [`Error::ContextCancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for shutdown, discarding pending results.
    /// Implementations are closed before this returns.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.driver.await;
    }
}

impl Stream for RunHandle {
    type Item = ContextResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().results).poll_next(cx)
    }
}

struct RunShared {
    dataflow: DataFlow,
    implementations: FxHashMap<String, Arc<dyn OperationImplementation>>,
    in_flight: Semaphore,
    timeout: Option<Duration>,
    grace: Duration,
    cancel: CancellationToken,
}

async fn drive(
    shared: Arc<RunShared>,
    mut contexts: BoxStream<'static, (String, Vec<Input>)>,
    results: mpsc::UnboundedSender<ContextResult>,
    max_contexts: usize,
) {
    let admission = Arc::new(Semaphore::new(max_contexts));
    let mut running = JoinSet::new();
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = contexts.next() => next,
        };
        let Some((handle, seeds)) = next else { break };
        let permit = tokio::select! {
            _ = shared.cancel.cancelled() => {
                // Pulled but never admitted.
                let _ = results.send((handle.clone(), Err(Error::ContextCancelled(handle))));
                break;
            }
            permit = Arc::clone(&admission).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let task_shared = Arc::clone(&shared);
        let task_results = results.clone();
        running.spawn(async move {
            let _permit = permit;
            let span = info_span!("context", handle = %handle);
            let outcome = run_context(&task_shared, &handle, seeds)
                .instrument(span)
                .await;
            let _ = task_results.send((handle, outcome));
        });
    }
    while running.join_next().await.is_some() {}
    for (instance, implementation) in &shared.implementations {
        close_one(instance, implementation).await;
    }
}

async fn close_one(instance: &str, implementation: &Arc<dyn OperationImplementation>) {
    if let Err(error) = implementation.close().await {
        warn!(instance = %instance, error = %error, "close failed");
    }
}

/// Drive one context through the stages to quiescence.
async fn run_context(
    shared: &RunShared,
    handle: &str,
    seeds: Vec<Input>,
) -> Result<OutputMap, Error> {
    let mut network = InputNetwork::new();
    for input in &shared.dataflow.seed {
        network.add(Arc::clone(input))?;
    }
    for input in seeds {
        network.add(Arc::new(input))?;
    }

    let bindings: FxHashMap<&str, Arc<dyn OperationContext>> = shared
        .implementations
        .iter()
        .map(|(instance, implementation)| {
            (instance.as_str(), Arc::from(implementation.context(handle)))
        })
        .collect();

    let mut outputs = OutputMap::new();
    for stage in Stage::ALL {
        // Repeat until no operation in this stage can advance. Inputs
        // produced in one round are visible to the next.
        loop {
            if shared.cancel.is_cancelled() {
                return Err(Error::ContextCancelled(handle.to_owned()));
            }
            let mut round = FuturesUnordered::new();
            for (instance, operation) in &shared.dataflow.operations {
                if operation.stage != stage {
                    continue;
                }
                let flow = &shared.dataflow.flow[instance];
                for set in generate(instance, operation, flow, &mut network) {
                    debug!(instance = %instance, set = ?set.id(), "scheduling");
                    let locks = network.locks_for(&set);
                    let binding = Arc::clone(&bindings[instance.as_str()]);
                    round.push(run_invocation(instance.clone(), set, locks, binding, shared));
                }
            }
            if round.is_empty() {
                break;
            }
            let (completions, cancelled) = drain_round(round, &shared.cancel, shared.grace).await;
            if cancelled {
                return Err(Error::ContextCancelled(handle.to_owned()));
            }
            for (instance, set, result) in completions {
                match result {
                    Ok(values) => {
                        apply_outputs(&mut network, shared, &instance, &set, values, &mut outputs);
                    }
                    Err(error) => {
                        // Consumed, not retried; the context proceeds.
                        warn!(instance = %instance, set = ?set.id(), error = %error, "operation failed");
                    }
                }
            }
        }
    }
    Ok(outputs)
}

async fn run_invocation(
    instance: String,
    set: ParameterSet,
    locks: LockSet,
    binding: Arc<dyn OperationContext>,
    shared: &RunShared,
) -> (String, ParameterSet, anyhow::Result<OutputMap>) {
    let _permit = match shared.in_flight.acquire().await {
        Ok(permit) => permit,
        Err(_) => return (instance, set, Err(anyhow::anyhow!("run is shutting down"))),
    };
    let _lease = locks.acquire().await;
    let result = match shared.timeout {
        Some(limit) => match tokio::time::timeout(limit, binding.run(&set)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("invocation exceeded {limit:?}")),
        },
        None => binding.run(&set).await,
    };
    (instance, set, result)
}

/// Await a round of invocations. On cancellation, in-flight invocations get
/// `grace` to finish; stragglers are dropped.
async fn drain_round<F: Future>(
    mut round: FuturesUnordered<F>,
    cancel: &CancellationToken,
    grace: Duration,
) -> (Vec<F::Output>, bool) {
    let mut completions = Vec::with_capacity(round.len());
    loop {
        tokio::select! {
            next = round.next() => match next {
                Some(done) => completions.push(done),
                None => return (completions, false),
            },
            _ = cancel.cancelled() => break,
        }
    }
    let _ = tokio::time::timeout(grace, async {
        while let Some(done) = round.next().await {
            completions.push(done);
        }
    })
    .await;
    (completions, true)
}

/// Route one invocation's returned values back into the network, expanding
/// fan-out ports and collecting output-stage results.
fn apply_outputs(
    network: &mut InputNetwork,
    shared: &RunShared,
    instance: &str,
    set: &ParameterSet,
    values: OutputMap,
    context_outputs: &mut OutputMap,
) {
    let operation = &shared.dataflow.operations[instance];
    for (port, value) in values {
        let Some(definition) = operation.outputs.get(&port) else {
            warn!(instance = %instance, port = %port, "undeclared output port, dropped");
            continue;
        };
        if operation.stage == Stage::Output {
            context_outputs.insert(port.clone(), value.clone());
        }
        let parents: Vec<Arc<Input>> = set.inputs().cloned().collect();
        let origin = Source::op(instance, &port);
        if operation.expand.iter().any(|expanded| *expanded == port) {
            let Value::List(items) = value else {
                warn!(instance = %instance, port = %port, "expand port did not produce a list");
                continue;
            };
            for item in items {
                insert(network, Input::produced(item, definition, parents.clone(), origin.clone()));
            }
        } else {
            insert(network, Input::produced(value, definition, parents, origin));
        }
    }
}

fn insert(network: &mut InputNetwork, input: Arc<Input>) {
    if let Err(error) = network.add(input) {
        warn!(error = %error, "dropped produced input");
    }
}
