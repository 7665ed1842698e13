//! Explicit assembly of the clone runtime.
//!
//! One [`CloneRuntime`] owns one bus, registry, manager, queue, worker pool,
//! metrics observer and admin service. Nothing is global: tests and embedders
//! can run several runtimes side by side.
//!
//! Backend selection:
//!
//! ```text
//!   redis_url set and reachable ──► RedisQueueBackend + RedisStore
//!   otherwise                   ──► in-process queue + FileStore(store_path)
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use crate::admin::AdminService;
use crate::clones::CloneRegistry;
use crate::config::RuntimeConfig;
use crate::error::{PoolError, RuntimeError};
use crate::events::EventBus;
use crate::metrics::RuntimeMetrics;
use crate::scheduler::{CloneManager, CloneQueue, RedisQueueBackend, WorkerPool};
use crate::storage::{FileStore, KeyValueStore, NamespacedStore, RedisStore};

/// A fully wired clone runtime.
pub struct CloneRuntime {
    config: RuntimeConfig,
    bus: EventBus,
    registry: Arc<CloneRegistry>,
    manager: Arc<CloneManager>,
    queue: Arc<CloneQueue>,
    pool: Arc<WorkerPool>,
    metrics: RuntimeMetrics,
    admin: AdminService,
}

impl CloneRuntime {
    /// Builds a runtime with the built-in clone types.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if the configuration is invalid, the file store
    /// cannot be opened or the metrics cannot be registered. An unreachable
    /// Redis is not an error: the runtime falls back to local backends.
    pub async fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_registry(config, CloneRegistry::with_builtins()).await
    }

    /// Builds a runtime around a caller-populated registry.
    pub async fn with_registry(
        config: RuntimeConfig,
        registry: CloneRegistry,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let bus = EventBus::with_dead_letter_capacity(config.dead_letter_capacity);
        let registry = Arc::new(registry);
        // Metrics subscribe first so they observe the queue's first events.
        let metrics = RuntimeMetrics::attach(&bus)?;

        let (queue, store) = Self::backends(&config, &bus).await?;
        let store = NamespacedStore::new(store, config.key_prefix.clone());

        let manager = CloneManager::new(
            config.manager_config(),
            Arc::clone(&registry),
            bus.clone(),
            store,
        );
        let pool = WorkerPool::new(
            config.pool_config(),
            Arc::clone(&manager),
            Arc::clone(&queue),
            bus.clone(),
        );
        let admin = AdminService::new(Arc::clone(&manager), Arc::clone(&queue));

        info!(
            queue_backend = queue.backend_name(),
            clone_types = registry.type_names().len(),
            "Clone runtime assembled"
        );

        Ok(Self {
            config,
            bus,
            registry,
            manager,
            queue,
            pool,
            metrics,
            admin,
        })
    }

    async fn backends(
        config: &RuntimeConfig,
        bus: &EventBus,
    ) -> Result<(Arc<CloneQueue>, Arc<dyn KeyValueStore>), RuntimeError> {
        if let Some(url) = &config.redis_url {
            match RedisQueueBackend::connect(url, &config.key_prefix, config.connect_timeout).await {
                Ok(backend) => {
                    let store: Arc<dyn KeyValueStore> =
                        Arc::new(RedisStore::from_connection(backend.connection()));
                    info!("Using Redis for the queue and the store");
                    return Ok((CloneQueue::with_backend(Arc::new(backend), bus.clone()), store));
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, using local queue and file store");
                }
            }
        }

        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(config.store_path.clone()).await?);
        Ok((CloneQueue::in_memory(bus.clone()), store))
    }

    /// Recovers persisted clones, starts the heartbeat and the workers.
    ///
    /// Returns the number of recovered clones.
    pub async fn start(&self) -> Result<usize, RuntimeError> {
        let recovered = self.manager.startup().await?;
        if let Err(e) = self.pool.start() {
            self.manager.shutdown().await;
            return Err(e.into());
        }
        info!(recovered = recovered, "Clone runtime started");
        Ok(recovered)
    }

    /// Stops the workers, then the manager (which stops active clones).
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let pool_result = match self.pool.shutdown().await {
            Err(PoolError::NotRunning) => Ok(()),
            other => other,
        };
        self.manager.shutdown().await;
        info!("Clone runtime shut down");
        pool_result.map_err(RuntimeError::from)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<CloneRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<CloneManager> {
        &self.manager
    }

    pub fn queue(&self) -> &Arc<CloneQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }
}

impl std::fmt::Debug for CloneRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneRuntime")
            .field("queue_backend", &self.queue.backend_name())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
