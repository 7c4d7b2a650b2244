//! Toy operation implementations driving the engine through its public
//! traits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use opflow::{OperationContext, OperationImplementation, ParameterSet, Value};

pub fn output(port: &str, value: impl Into<Value>) -> BTreeMap<String, Value> {
    [(port.to_owned(), value.into())].into_iter().collect()
}

/// Honor `RUST_LOG` when a test is run by hand.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn param_str(parameters: &ParameterSet, port: &str) -> anyhow::Result<String> {
    Ok(parameters
        .get(port)
        .and_then(Value::as_str)
        .with_context(|| format!("port `{port}` missing or not a string"))?
        .to_owned())
}

/// Applies a configured format string to its `data` input.
#[derive(Default)]
pub struct Format {
    fmt: OnceLock<String>,
}

#[async_trait]
impl OperationImplementation for Format {
    async fn open(&self, config: Option<&serde_json::Value>) -> anyhow::Result<()> {
        let fmt = config
            .and_then(|config| config.get("fmt"))
            .and_then(serde_json::Value::as_str)
            .context("config key `fmt` missing")?;
        let _ = self.fmt.set(fmt.to_owned());
        Ok(())
    }

    fn requires_config(&self) -> bool {
        true
    }

    fn context(&self, _handle: &str) -> Box<dyn OperationContext> {
        Box::new(FormatContext {
            fmt: self.fmt.get().cloned().unwrap_or_default(),
        })
    }
}

struct FormatContext {
    fmt: String,
}

#[async_trait]
impl OperationContext for FormatContext {
    async fn run(&self, parameters: &ParameterSet) -> anyhow::Result<BTreeMap<String, Value>> {
        let data = param_str(parameters, "data")?;
        Ok(output("msg", self.fmt.replace("{}", &data)))
    }
}

/// Forwards the value on one port to another, counting invocations.
#[derive(Clone, Default)]
pub struct Forward {
    pub from: &'static str,
    pub to: &'static str,
    pub calls: Arc<AtomicUsize>,
}

impl Forward {
    pub fn new(from: &'static str, to: &'static str) -> Self {
        Self {
            from,
            to,
            calls: Arc::default(),
        }
    }
}

#[async_trait]
impl OperationImplementation for Forward {
    fn context(&self, _handle: &str) -> Box<dyn OperationContext> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl OperationContext for Forward {
    async fn run(&self, parameters: &ParameterSet) -> anyhow::Result<BTreeMap<String, Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = parameters
            .get(self.from)
            .cloned()
            .with_context(|| format!("port `{}` missing", self.from))?;
        Ok(output(self.to, value))
    }
}

/// Emits a fixed value on a fixed port, regardless of its inputs.
#[derive(Clone)]
pub struct Emit {
    pub port: &'static str,
    pub value: Value,
}

#[async_trait]
impl OperationImplementation for Emit {
    fn context(&self, _handle: &str) -> Box<dyn OperationContext> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl OperationContext for Emit {
    async fn run(&self, _parameters: &ParameterSet) -> anyhow::Result<BTreeMap<String, Value>> {
        Ok(output(self.port, self.value.clone()))
    }
}

/// Records every `file` value it is invoked with and answers `flag: true`.
#[derive(Clone, Default)]
pub struct Probe {
    pub seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl OperationImplementation for Probe {
    fn context(&self, _handle: &str) -> Box<dyn OperationContext> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl OperationContext for Probe {
    async fn run(&self, parameters: &ParameterSet) -> anyhow::Result<BTreeMap<String, Value>> {
        let file = param_str(parameters, "file")?;
        self.seen.lock().unwrap().push(file);
        Ok(output("flag", true))
    }
}

/// Holds its (lock-bearing) input for a while, flagging any overlap between
/// concurrent holders.
#[derive(Clone, Default)]
pub struct Hold {
    pub active: Arc<AtomicUsize>,
    pub overlapped: Arc<AtomicBool>,
    pub hold: Duration,
}

impl Hold {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }
}

#[async_trait]
impl OperationImplementation for Hold {
    fn context(&self, _handle: &str) -> Box<dyn OperationContext> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl OperationContext for Hold {
    async fn run(&self, _parameters: &ParameterSet) -> anyhow::Result<BTreeMap<String, Value>> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(BTreeMap::new())
    }
}

/// Always fails.
#[derive(Clone, Default)]
pub struct Boom {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl OperationImplementation for Boom {
    fn context(&self, _handle: &str) -> Box<dyn OperationContext> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl OperationContext for Boom {
    async fn run(&self, _parameters: &ParameterSet) -> anyhow::Result<BTreeMap<String, Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("synthetic failure")
    }
}

/// Forwards a port after a fixed latency; counts closes for shutdown tests.
#[derive(Clone)]
pub struct Sleeper {
    pub latency: Duration,
    pub from: &'static str,
    pub to: &'static str,
    pub calls: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl Sleeper {
    pub fn new(latency: Duration, from: &'static str, to: &'static str) -> Self {
        Self {
            latency,
            from,
            to,
            calls: Arc::default(),
            closed: Arc::default(),
        }
    }
}

#[async_trait]
impl OperationImplementation for Sleeper {
    fn context(&self, _handle: &str) -> Box<dyn OperationContext> {
        Box::new(self.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl OperationContext for Sleeper {
    async fn run(&self, parameters: &ParameterSet) -> anyhow::Result<BTreeMap<String, Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        let value = parameters
            .get(self.from)
            .cloned()
            .with_context(|| format!("port `{}` missing", self.from))?;
        Ok(output(self.to, value))
    }
}

/// Fails in `open`, for startup-abort tests.
#[derive(Clone, Default)]
pub struct BrokenOpen;

#[async_trait]
impl OperationImplementation for BrokenOpen {
    async fn open(&self, _config: Option<&serde_json::Value>) -> anyhow::Result<()> {
        bail!("refusing to open")
    }

    fn context(&self, _handle: &str) -> Box<dyn OperationContext> {
        Box::new(Emit {
            port: "never",
            value: Value::Null,
        })
    }
}
