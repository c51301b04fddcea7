//! Shared harness for engine integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use weft::store::MemoryBackend;
use weft::{
    Config, Engine, Event, FnRef, FunctionResolver, FunctionRuntime, InvocationEntity, Invoked,
    Registry, Result, RuntimeError, ValueMap,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Echoes its inputs back as the output, after an optional delay.
#[derive(Debug)]
pub struct EchoRuntime {
    delay: Duration,
}

impl EchoRuntime {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl FunctionRuntime for EchoRuntime {
    async fn invoke(
        &self,
        _fn_ref: &FnRef,
        inputs: ValueMap,
        _deadline: Option<time::OffsetDateTime>,
    ) -> std::result::Result<Invoked, RuntimeError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Invoked::Output(inputs))
    }
}

/// Fails every invocation with a function-level error.
#[derive(Debug)]
pub struct FailingRuntime;

#[async_trait]
impl FunctionRuntime for FailingRuntime {
    async fn invoke(
        &self,
        _fn_ref: &FnRef,
        _inputs: ValueMap,
        _deadline: Option<time::OffsetDateTime>,
    ) -> std::result::Result<Invoked, RuntimeError> {
        Err(RuntimeError::function("function exploded"))
    }
}

/// Resolves any name to itself within the `native` namespace.
pub struct AnyResolver;

#[async_trait]
impl FunctionResolver for AnyResolver {
    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        Ok(Some(format!("fn-{name}")))
    }
}

/// A registry with an echo runtime under the `native` namespace.
pub fn echo_registry() -> Arc<Registry> {
    registry_with(Arc::new(EchoRuntime::new()))
}

pub fn registry_with(runtime: Arc<dyn FunctionRuntime>) -> Arc<Registry> {
    Arc::new(
        Registry::new()
            .with_runtime("native", runtime)
            .with_resolver("native", Arc::new(AnyResolver)),
    )
}

/// A running engine over an in-memory backend, stopped on drop.
pub struct TestApp {
    pub engine: Arc<Engine>,
    pub backend: Arc<MemoryBackend>,
    shutdown: watch::Sender<bool>,
}

impl TestApp {
    pub async fn start(registry: Arc<Registry>) -> Self {
        Self::start_on(registry, Arc::new(MemoryBackend::new())).await
    }

    /// Start an engine over an existing backend (restart scenarios).
    pub async fn start_on(registry: Arc<Registry>, backend: Arc<MemoryBackend>) -> Self {
        let mut config = Config::default();
        config.controller.tick_interval = Duration::from_millis(50);

        let engine = Arc::new(Engine::with_backend(config, registry, backend.clone()));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let runner = Arc::clone(&engine);
        tokio::spawn(async move {
            let wait = async move {
                let _ = shutdown_rx.changed().await;
            };
            let _ = runner.run(wait).await;
        });
        // Let the workers come up before the test starts appending.
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            engine,
            backend,
            shutdown,
        }
    }

    /// Poll until the invocation satisfies `pred` or the timeout expires.
    pub async fn wait_for<F>(&self, id: &str, timeout: Duration, pred: F) -> InvocationEntity
    where
        F: Fn(&InvocationEntity) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(invocation) = self.engine.invocations().get_by_id(id).await {
                if pred(&invocation) {
                    return invocation;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for invocation {id}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait for the invocation to reach a terminal status.
    pub async fn wait_terminal(&self, id: &str) -> InvocationEntity {
        self.wait_for(id, DEFAULT_TIMEOUT, |inv| inv.is_terminal())
            .await
    }

    /// The raw event log of an invocation.
    pub async fn events(&self, id: &str) -> Vec<Event> {
        use weft::store::Backend;
        self.backend
            .get(&weft::Aggregate::invocation(id))
            .await
            .unwrap()
    }

    /// Event type names in append order.
    pub async fn event_types(&self, id: &str) -> Vec<String> {
        self.events(id)
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
