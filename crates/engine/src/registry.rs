//! Process-wide store registry
//!
//! Maps tenant ids to their `ChainStore`, loading lazily on first access
//! and evicting least-recently-used stores once the summed approximate
//! memory crosses the configured ceiling. Eviction is deferred for dirty
//! stores (their debounce has not fired yet); a forced eviction flushes
//! first and waits on any in-flight save.
//!
//! The registry is the sole owner of stores; every other component
//! borrows `Arc` references through it.

use markgen_core::{EngineConfig, Error, Result, TenantId};
use markgen_store::{snapshot_path, ChainStore};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct CacheSlot {
    store: Arc<ChainStore>,
    last_used: u64,
}

struct RegistryInner {
    stores: FxHashMap<TenantId, CacheSlot>,
    tick: u64,
}

/// Tenant-keyed cache of chain stores with an LRU memory ceiling.
pub struct StoreRegistry {
    inner: Mutex<RegistryInner>,
    config: Arc<EngineConfig>,
}

impl StoreRegistry {
    /// Create a registry over the configured data directory.
    pub fn new(config: Arc<EngineConfig>) -> StoreRegistry {
        StoreRegistry {
            inner: Mutex::new(RegistryInner {
                stores: FxHashMap::default(),
                tick: 0,
            }),
            config,
        }
    }

    /// Fetch a tenant's store, loading (or creating empty) on first
    /// access, then apply the LRU ceiling.
    pub fn get(&self, tenant: &TenantId) -> Result<Arc<ChainStore>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let store = if let Some(slot) = inner.stores.get_mut(tenant) {
            slot.last_used = tick;
            Arc::clone(&slot.store)
        } else {
            std::fs::create_dir_all(&self.config.data_dir).map_err(|e| {
                Error::io(
                    format!("create data dir {}", self.config.data_dir.display()),
                    e,
                )
            })?;

            let store = ChainStore::open(tenant.clone(), &self.config);
            inner.stores.insert(
                tenant.clone(),
                CacheSlot {
                    store: Arc::clone(&store),
                    last_used: tick,
                },
            );
            debug!(tenant = %tenant, "store loaded into registry");
            store
        };

        self.evict_over_ceiling(&mut inner);
        Ok(store)
    }

    /// Fetch a tenant's store only if a snapshot exists on disk.
    ///
    /// # Errors
    ///
    /// `NotFound` when the tenant has neither a cached store nor a
    /// snapshot file.
    pub fn open_existing(&self, tenant: &TenantId) -> Result<Arc<ChainStore>> {
        let cached = self.inner.lock().stores.contains_key(tenant);
        if !cached && !snapshot_path(&self.config.data_dir, tenant).exists() {
            return Err(Error::not_found(tenant.clone()));
        }
        self.get(tenant)
    }

    /// Forcibly evict one tenant: flush if dirty (waiting on an in-flight
    /// save), then drop. Returns whether the tenant was cached.
    pub fn evict(&self, tenant: &TenantId) -> Result<bool> {
        let slot = self.inner.lock().stores.remove(tenant);
        match slot {
            Some(slot) => {
                slot.store.flush()?;
                info!(tenant = %tenant, "store evicted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flush every cached store; all stores are attempted even if some
    /// fail, and the first failure is returned.
    pub fn flush_all(&self) -> Result<()> {
        let stores: Vec<Arc<ChainStore>> = {
            let inner = self.inner.lock();
            inner
                .stores
                .values()
                .map(|slot| Arc::clone(&slot.store))
                .collect()
        };
        let mut first_err = None;
        for store in stores {
            if let Err(e) = store.flush() {
                warn!(tenant = %store.tenant(), error = %e, "flush failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush and drop every cached store.
    pub fn clear(&self) -> Result<()> {
        self.flush_all()?;
        self.inner.lock().stores.clear();
        Ok(())
    }

    /// Tenants currently cached.
    pub fn loaded(&self) -> Vec<TenantId> {
        self.inner.lock().stores.keys().cloned().collect()
    }

    /// Number of cached stores.
    pub fn len(&self) -> usize {
        self.inner.lock().stores.len()
    }

    /// Whether no stores are cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().stores.is_empty()
    }

    /// Summed approximate memory of cached stores.
    pub fn memory_usage(&self) -> u64 {
        self.inner
            .lock()
            .stores
            .values()
            .map(|slot| slot.store.stats().approx_memory_bytes)
            .sum()
    }

    fn evict_over_ceiling(&self, inner: &mut RegistryInner) {
        let limit = self.config.chain_cache_memory_limit;
        let mut total: u64 = inner
            .stores
            .values()
            .map(|slot| slot.store.stats().approx_memory_bytes)
            .sum();
        if total <= limit {
            return;
        }

        // Oldest first; dirty stores are skipped until their debounce
        // fires and they become clean. The slot touched this tick is the
        // one being handed out and is never a candidate.
        let current_tick = inner.tick;
        let mut candidates: Vec<(TenantId, u64, u64)> = inner
            .stores
            .iter()
            .filter(|(_, slot)| !slot.store.is_dirty() && slot.last_used != current_tick)
            .map(|(tenant, slot)| {
                (
                    tenant.clone(),
                    slot.last_used,
                    slot.store.stats().approx_memory_bytes,
                )
            })
            .collect();
        candidates.sort_by_key(|&(_, last_used, _)| last_used);

        for (tenant, _, bytes) in candidates {
            if total <= limit {
                break;
            }
            inner.stores.remove(&tenant);
            total = total.saturating_sub(bytes);
            info!(tenant = %tenant, freed = bytes, "store evicted under memory pressure");
        }
        if total > limit {
            debug!(
                total,
                limit, "memory above ceiling; remaining stores are dirty, eviction deferred"
            );
        }
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("loaded", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> StoreRegistry {
        StoreRegistry::new(Arc::new(EngineConfig::for_testing(dir, dir)))
    }

    #[test]
    fn test_get_creates_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let store = registry.get(&TenantId::new("g1")).unwrap();
        assert_eq!(store.stats().prefix_count, 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_returns_same_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let a = registry.get(&TenantId::new("g1")).unwrap();
        let b = registry.get(&TenantId::new("g1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_open_existing_without_snapshot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let err = registry.open_existing(&TenantId::new("ghost")).unwrap_err();
        assert!(err.is_not_found());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_open_existing_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        {
            let store = registry.get(&TenantId::new("g1")).unwrap();
            store.add_record("a b", "c", 1).unwrap();
            store.flush().unwrap();
        }
        registry.clear().unwrap();

        let store = registry.open_existing(&TenantId::new("g1")).unwrap();
        assert_eq!(store.stats().prefix_count, 1);
    }

    #[test]
    fn test_evict_flushes_dirty_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let tenant = TenantId::new("g1");
        {
            let store = registry.get(&tenant).unwrap();
            store.add_record("a b", "c", 1).unwrap();
            assert!(store.is_dirty());
        }
        assert!(registry.evict(&tenant).unwrap());
        assert!(!registry.evict(&tenant).unwrap());

        // The flushed snapshot is loadable again
        let store = registry.open_existing(&tenant).unwrap();
        assert_eq!(store.stats().prefix_count, 1);
    }

    #[test]
    fn test_lru_eviction_under_memory_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_testing(dir.path(), dir.path());
        config.chain_cache_memory_limit = 4096;
        let registry = StoreRegistry::new(Arc::new(config));

        // Three tenants, each with enough chains to be over ~2 KiB, all
        // flushed clean so they are evictable.
        for name in ["old", "mid", "new"] {
            let store = registry.get(&TenantId::new(name)).unwrap();
            for i in 0..40 {
                store
                    .add_record(&format!("p{} q{}", i, i), "suffix-token", 1)
                    .unwrap();
            }
            store.flush().unwrap();
        }

        // Touch "old" is stalest; next access triggers eviction of the
        // least recently used clean stores.
        let _ = registry.get(&TenantId::new("new")).unwrap();
        assert!(registry.len() < 3, "expected LRU eviction to shrink cache");
        assert!(registry.loaded().contains(&TenantId::new("new")));
    }

    #[test]
    fn test_dirty_store_eviction_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_testing(dir.path(), dir.path());
        config.chain_cache_memory_limit = 1024;
        let registry = StoreRegistry::new(Arc::new(config));

        let tenant = TenantId::new("busy");
        let store = registry.get(&tenant).unwrap();
        for i in 0..50 {
            store
                .add_record(&format!("p{} q{}", i, i), "suffix-token", 1)
                .unwrap();
        }
        assert!(store.is_dirty());

        // Over the ceiling but dirty: must stay cached
        let _ = registry.get(&TenantId::new("other")).unwrap();
        assert!(registry.loaded().contains(&tenant));
    }

    #[test]
    fn test_flush_all_persists_everything() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        for name in ["a", "b"] {
            let store = registry.get(&TenantId::new(name)).unwrap();
            store.add_record("a b", "c", 1).unwrap();
        }
        registry.flush_all().unwrap();
        for name in ["a", "b"] {
            let store = registry.get(&TenantId::new(name)).unwrap();
            assert!(!store.is_dirty());
            assert_eq!(store.version(), 1);
        }
    }
}
