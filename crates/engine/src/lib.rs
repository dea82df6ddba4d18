//! Chain engine: registry, worker pool, and training batcher
//!
//! This crate assembles the engine the external adapter talks to:
//! - `StoreRegistry`: lazy-loading, LRU-bounded cache of per-tenant
//!   chain stores
//! - `WorkerPool`: fixed worker set keeping CPU-bound chain work off the
//!   request path
//! - `TrainBatcher`: streaming normalization of message sources into
//!   priority-ordered record batches
//! - `TrainingLock`: per-tenant advisory lock for bulk training
//! - `Engine`: the injectable facade owning all of the above
//!
//! There are no process-wide singletons: the host constructs one
//! [`Engine`] at startup and passes it to its collaborators.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batcher;
pub mod pool;
pub mod registry;
pub mod train_lock;

pub use batcher::{read_training_file, TrainBatcher, TrainReport};
pub use pool::{JobHandle, PoolStats, Task, TaskOutput, TaskPriority, UpdateOp, WorkerPool};
pub use registry::StoreRegistry;
pub use train_lock::TrainingLock;

// Re-export the layers below for single-crate consumers
pub use markgen_core::{
    EngineConfig, Error, Result, StoreStats, TenantId, TrainingMessage, TrainingRecord,
};
pub use markgen_store::{ChainStore, SNAPSHOT_MAGIC, SNAPSHOT_SCHEMA_VERSION};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// The assembled chain engine.
///
/// Owns the registry and the pool; shared with collaborators by
/// reference (or wrapped in an `Arc` by the host). Shut down explicitly
/// with [`Engine::shutdown`]; dropping an engine that was not shut down
/// performs the same flush as a last resort.
pub struct Engine {
    config: Arc<EngineConfig>,
    registry: Arc<StoreRegistry>,
    pool: Arc<WorkerPool>,
    batcher: TrainBatcher,
    shut_down: AtomicBool,
}

impl Engine {
    /// Validate the configuration, create the data and config
    /// directories, and start the pool.
    pub fn new(config: EngineConfig) -> Result<Engine> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            Error::io(format!("create data dir {}", config.data_dir.display()), e)
        })?;
        std::fs::create_dir_all(&config.config_dir).map_err(|e| {
            Error::io(
                format!("create config dir {}", config.config_dir.display()),
                e,
            )
        })?;

        let config = Arc::new(config);
        let registry = Arc::new(StoreRegistry::new(Arc::clone(&config)));
        let pool = Arc::new(WorkerPool::new(&config, Arc::clone(&registry)));
        let batcher = TrainBatcher::new(Arc::clone(&pool), Arc::clone(&config));

        info!(
            state_size = config.state_size,
            workers = config.worker_pool_size,
            data_dir = %config.data_dir.display(),
            "engine started"
        );
        Ok(Engine {
            config,
            registry,
            pool,
            batcher,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The store registry.
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// The worker pool, for direct task submission.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Generate synchronously on the calling thread.
    ///
    /// The request path resolves the store through the registry and
    /// samples directly; alias-table builds triggered here are per-prefix
    /// and amortized.
    pub fn generate(&self, tenant: &TenantId, seed: &[String], max_len: usize) -> Result<Vec<String>> {
        Ok(self.registry.get(tenant)?.generate(seed, max_len))
    }

    /// Generate on the pool, returning a single-shot handle.
    pub fn generate_async(
        &self,
        tenant: &TenantId,
        seed: Vec<String>,
        max_len: usize,
        temperature: Option<f64>,
    ) -> JobHandle {
        self.pool.submit(
            TaskPriority::High,
            Task::GenerateResponse {
                tenant: tenant.clone(),
                seed,
                max_len,
                temperature,
            },
        )
    }

    /// Stats for one tenant's store.
    pub fn stats(&self, tenant: &TenantId) -> Result<StoreStats> {
        Ok(self.registry.get(tenant)?.stats())
    }

    /// Bulk-train a tenant from a message source, guarded by the
    /// tenant's advisory training lock.
    ///
    /// # Errors
    ///
    /// `Contention` (before anything is touched) when another training
    /// run holds the lock; otherwise the first task-level failure.
    pub fn train<I>(&self, tenant: &TenantId, source: I, rebuild: bool) -> Result<TrainReport>
    where
        I: IntoIterator<Item = TrainingMessage>,
    {
        let _lock = TrainingLock::acquire(&self.config.config_dir, tenant)?;
        self.batcher.train(tenant, source, rebuild)
    }

    /// Bulk-train from an external JSON import file (rebuild semantics).
    pub fn train_file(&self, tenant: &TenantId, path: &Path) -> Result<TrainReport> {
        let messages = read_training_file(path)?;
        self.train(tenant, messages, true)
    }

    /// Stop the pool and flush every cached store.
    ///
    /// Idempotent; later calls return immediately.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.shutdown();
        let result = self.registry.flush_all();
        info!("engine shut down");
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            if let Err(e) = self.shutdown() {
                warn!(error = %e, "flush during engine drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .finish()
    }
}
