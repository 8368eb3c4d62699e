//! Core context: owns the shared navigation stack, kind registry, store and
//! scheduler, plus every engine started through it.

use std::sync::{Arc, Mutex};

use crate::checkpoint::{CheckpointHooks, StateCheckpointer, StateMetadata};
use crate::config::CoreConfig;
use crate::engine::{EngineWork, ExecutionEngine};
use crate::navigation::{NavigationStack, UnitKindRegistry};
use crate::scheduler::OperationScheduler;
use crate::store::ObjectStore;
use crate::util::lock;

/// Name of the engine driving scheduler sweeps.
pub const SCHEDULER_ENGINE: &str = "operations";

pub struct CoreContext {
    config: CoreConfig,
    store: Arc<dyn ObjectStore>,
    stack: Arc<NavigationStack>,
    registry: Arc<UnitKindRegistry>,
    scheduler: OperationScheduler,
    engines: Mutex<Vec<Arc<ExecutionEngine>>>,
}

impl CoreContext {
    /// Build a context. Nothing runs until engines are started.
    pub fn new(config: CoreConfig, store: Arc<dyn ObjectStore>, registry: UnitKindRegistry) -> Self {
        let stack = Arc::new(NavigationStack::new(config.navigation.clone()));
        let scheduler = OperationScheduler::new(config.scheduler.clone());
        Self {
            config,
            store,
            stack,
            registry: Arc::new(registry),
            scheduler,
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn stack(&self) -> &Arc<NavigationStack> {
        &self.stack
    }

    pub fn registry(&self) -> &Arc<UnitKindRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &OperationScheduler {
        &self.scheduler
    }

    /// Start the engine that sweeps pending and queued operations.
    pub fn start_scheduler(&self) -> Arc<ExecutionEngine> {
        self.start_engine(SCHEDULER_ENGINE, Arc::new(self.scheduler.clone()))
    }

    /// Create a checkpointer over this context's store, stack and registry.
    pub fn checkpointer<M, H>(&self, hooks: H) -> Arc<StateCheckpointer<M, H>>
    where
        M: StateMetadata,
        H: CheckpointHooks<M>,
    {
        Arc::new(StateCheckpointer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.stack),
            Arc::clone(&self.registry),
            hooks,
            self.config.checkpoint.clone(),
        ))
    }

    /// Create, track and start an engine for `work`.
    pub fn start_engine(&self, name: &str, work: Arc<dyn EngineWork>) -> Arc<ExecutionEngine> {
        let engine = Arc::new(ExecutionEngine::new(name, self.config.engine.clone(), work));
        if !engine.start(false) {
            tracing::warn!(engine = name, "Engine did not start");
        }
        lock(&self.engines).push(Arc::clone(&engine));
        engine
    }

    /// Engines started through this context.
    pub fn engines(&self) -> Vec<Arc<ExecutionEngine>> {
        lock(&self.engines).clone()
    }

    /// Stop every engine and the scheduler's workers.
    pub async fn shutdown(&self) {
        let engines = std::mem::take(&mut *lock(&self.engines));
        for engine in &engines {
            if !engine.shutdown().await {
                tracing::warn!(engine = %engine.name(), "Engine did not stop cleanly");
            }
        }
        drop(engines);
        self.scheduler.shutdown();
        tracing::info!("Core context shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::checkpoint::{NoopHooks, StateMetadataSummary};
    use crate::config::EngineConfig;
    use crate::scheduler::OperationStatus;
    use crate::store::MemoryObjectStore;

    fn context() -> CoreContext {
        let mut config = CoreConfig::default();
        config.engine = EngineConfig {
            active_delay: Duration::from_millis(1),
            idle_delay: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        CoreContext::new(
            config,
            Arc::new(MemoryObjectStore::new()),
            UnitKindRegistry::new(),
        )
    }

    #[tokio::test]
    async fn scheduler_engine_drives_queued_operations() {
        let ctx = context();
        let engine = ctx.start_scheduler();
        assert_eq!(engine.name(), SCHEDULER_ENGINE);

        let op = ctx.scheduler().enqueue("q", None, || async { Ok(()) });
        let status = tokio::time::timeout(Duration::from_secs(2), op.finished())
            .await
            .unwrap();
        assert_eq!(status, OperationStatus::Completed);

        ctx.shutdown().await;
        assert!(ctx.engines().is_empty());
        assert!(!engine.is_loop_alive());
    }

    #[tokio::test]
    async fn checkpointer_shares_context_stack() {
        let ctx = context();
        let checkpointer = ctx.checkpointer::<StateMetadataSummary, _>(NoopHooks);
        assert_eq!(checkpointer.area().root(), "State");
        assert!(!checkpointer.attempted_restore());
    }
}
