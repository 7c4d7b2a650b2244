//! Operation implementations: lifecycle, per-context binding, and discovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::input::ParameterSet;
use crate::value::Value;

/// A bound operation implementation, shared by all contexts of a run.
///
/// Lifecycle: [`open`](Self::open) once per orchestrator run before any
/// context, [`context`](Self::context) per context per operation instance,
/// [`close`](Self::close) once after all contexts drain. `close` runs on
/// every exit path, including startup failure and cancellation.
///
/// Implementations hold process-wide resources (HTTP clients, database
/// handles) and must be safe for concurrent use across contexts, or provide
/// their own internal synchronization.
#[async_trait]
pub trait OperationImplementation: Send + Sync {
    /// Allocate shared resources. The instance's config, if any, is delivered
    /// here.
    async fn open(&self, config: Option<&serde_json::Value>) -> anyhow::Result<()> {
        let _ = config;
        Ok(())
    }

    /// Whether a missing config is a fatal startup error for this
    /// implementation.
    fn requires_config(&self) -> bool {
        false
    }

    /// Cheap per-context binding.
    fn context(&self, handle: &str) -> Box<dyn OperationContext>;

    /// Release shared resources.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One operation instance bound to one input context.
#[async_trait]
pub trait OperationContext: Send + Sync {
    /// Run the operation body on one parameter set, returning produced values
    /// keyed by output port.
    ///
    /// Errors are logged by the orchestrator and the parameter set is
    /// consumed; nothing is retried. Must tolerate concurrent invocations on
    /// distinct parameter sets.
    async fn run(&self, parameters: &ParameterSet) -> anyhow::Result<BTreeMap<String, Value>>;
}

/// Builds implementation instances. One instance is created per operation
/// *instance* in a dataflow, since configs are per instance.
///
/// Closures returning boxed implementations are factories.
pub trait ImplementationFactory: Send + Sync {
    fn instantiate(&self) -> Box<dyn OperationImplementation>;
}

impl<F> ImplementationFactory for F
where
    F: Fn() -> Box<dyn OperationImplementation> + Send + Sync,
{
    fn instantiate(&self) -> Box<dyn OperationImplementation> {
        (self)()
    }
}

/// Pluggable discovery of implementations by operation name. The orchestrator
/// never hard-codes implementations.
pub trait ImplementationResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ImplementationFactory>>;
}

/// Explicit name-to-factory registration, the default resolver.
#[derive(Default)]
pub struct ImplementationRegistry {
    factories: rustc_hash::FxHashMap<String, Arc<dyn ImplementationFactory>>,
}

impl ImplementationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl ImplementationFactory + 'static,
    ) -> &mut Self {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }
}

impl ImplementationResolver for ImplementationRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ImplementationFactory>> {
        self.factories.get(name).cloned()
    }
}
