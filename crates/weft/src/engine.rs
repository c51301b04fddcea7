//! Engine bundle: wires the backend, cache, stores, APIs, and controller.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{InvocationApi, TaskApi, WorkflowApi};
use crate::cache::EntityCache;
use crate::config::{BackendConfig, Config};
use crate::controller::InvocationController;
use crate::error::Result;
use crate::runtime::Registry;
use crate::scheduler::Scheduler;
use crate::store::{Backend, Invocations, MemoryBackend, Workflows};

/// The assembled engine.
///
/// Construction wires every component over a shared backend and cache;
/// [`Engine::run`] drives the cache refresh worker and the controller until
/// the shutdown future completes.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use weft::{Config, Engine, Registry};
///
/// let registry = Arc::new(Registry::new()
///     .with_runtime("native", native_runtime)
///     .with_resolver("native", native_resolver));
/// let engine = Engine::new(Config::default(), registry).await?;
///
/// let wf = engine.workflow_api().create(spec).await?;
/// let inv = engine.invocation_api().invoke(&wf, inputs).await?;
///
/// engine.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
/// ```
pub struct Engine {
    backend: Arc<dyn Backend>,
    cache: Arc<EntityCache>,
    workflows: Workflows,
    invocations: Invocations,
    workflow_api: WorkflowApi,
    invocation_api: InvocationApi,
    controller: Arc<InvocationController>,
    config: Config,
}

impl Engine {
    /// Build an engine from configuration and a runtime registry.
    pub async fn new(config: Config, registry: Arc<Registry>) -> Result<Self> {
        let backend: Arc<dyn Backend> = match &config.backend {
            BackendConfig::Memory(memory) => {
                Arc::new(MemoryBackend::with_config(memory.clone()))
            }
            #[cfg(feature = "postgres")]
            BackendConfig::Postgres(pg) => {
                Arc::new(crate::store::PgBackend::connect(pg.clone()).await?)
            }
        };
        Ok(Self::with_backend(config, registry, backend))
    }

    /// Build an engine over an existing backend.
    pub fn with_backend(
        config: Config,
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let cache = Arc::new(EntityCache::new(
            Arc::clone(&backend),
            config.notification_buffer,
        ));
        let workflows = Workflows::new(Arc::clone(&cache));
        let invocations = Invocations::new(Arc::clone(&cache));

        let workflow_api = WorkflowApi::new(Arc::clone(&backend), Arc::clone(&registry));
        let mut invocation_api = InvocationApi::new(
            Arc::clone(&backend),
            workflows.clone(),
            invocations.clone(),
        );
        if let Some(deadline) = config.default_deadline {
            invocation_api = invocation_api.with_default_deadline(deadline);
        }
        let tasks = TaskApi::new(Arc::clone(&backend), registry);

        let controller = InvocationController::new(
            Arc::clone(&backend),
            invocations.clone(),
            workflows.clone(),
            Scheduler::new(config.prepare_horizon),
            tasks,
            invocation_api.clone(),
            config.controller.clone(),
        );

        Self {
            backend,
            cache,
            workflows,
            invocations,
            workflow_api,
            invocation_api,
            controller,
            config,
        }
    }

    /// The shared event backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Typed workflow store.
    pub fn workflows(&self) -> &Workflows {
        &self.workflows
    }

    /// Typed invocation store.
    pub fn invocations(&self) -> &Invocations {
        &self.invocations
    }

    /// Workflow definition API.
    pub fn workflow_api(&self) -> &WorkflowApi {
        &self.workflow_api
    }

    /// Invocation API.
    pub fn invocation_api(&self) -> &InvocationApi {
        &self.invocation_api
    }

    /// Explicitly trigger a reconciliation for an invocation.
    pub fn poke(&self, invocation_id: &str) {
        Arc::clone(&self.controller).poke(invocation_id);
    }

    /// Run the cache refresh worker and the controller until the shutdown
    /// future completes, then stop both within the shutdown timeout.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(debug = self.config.debug, "Engine starting");

        let cache_worker = tokio::spawn(Arc::clone(&self.cache).run(shutdown_rx.clone()));
        let controller_worker = tokio::spawn(Arc::clone(&self.controller).run(shutdown_rx));

        shutdown.await;
        let _ = shutdown_tx.send(true);

        let all_workers = async {
            let _ = cache_worker.await;
            let _ = controller_worker.await;
        };
        match tokio::time::timeout(self.config.shutdown_timeout, all_workers).await {
            Ok(()) => info!("Engine stopped gracefully"),
            Err(_) => warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout exceeded, forcing stop"
            ),
        }
        Ok(())
    }
}
