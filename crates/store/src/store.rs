//! Per-tenant chain store
//!
//! A `ChainStore` owns one tenant's prefix → suffix-distribution map
//! behind a single reader/writer lock, persists it as a debounced JSON
//! snapshot, and serves weighted random generation from it.
//!
//! # Locking
//!
//! - write: `add_record`, `add_batch`, `clear`, `remove_prefix`, `load`
//! - read: `get_next`, `generate`, `stats`, `export`, snapshot
//!   serialization inside `save`
//!
//! Lazy alias-table rebuild inside sampling takes only the entry's own
//! mutex, so concurrent samplers of different prefixes proceed
//! independently under the shared read lock.

use crate::debounce::SaveDebouncer;
use crate::entry::PrefixEntry;
use crate::snapshot::{self, ChainRecord, SnapshotDocument};
use markgen_core::{prefix_key, EngineConfig, Error, Result, TenantId, TrainingRecord};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of applying a batch of training records.
///
/// Per-record failures are collected, never aborting the rest of the
/// batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Records applied.
    pub inserted: usize,
    /// (record index, rejection) pairs for records that failed validation.
    pub errors: Vec<(usize, Error)>,
}

/// One tenant's Markov chains with persistence and sampling.
pub struct ChainStore {
    // Declared first: dropping the debouncer joins its timer thread
    // before the rest of the store is torn down.
    debouncer: SaveDebouncer,
    tenant: TenantId,
    path: PathBuf,
    state_size: AtomicUsize,
    eol_token: Option<String>,
    map: RwLock<FxHashMap<String, PrefixEntry>>,
    dirty: AtomicBool,
    version: AtomicU64,
    /// Serializes snapshot writes; a forced flush waits here on any
    /// in-flight debounced save.
    save_lock: Mutex<()>,
}

impl ChainStore {
    /// Create a store without touching disk. Use [`ChainStore::open`] to
    /// also load an existing snapshot.
    pub fn new(tenant: TenantId, config: &EngineConfig) -> Arc<ChainStore> {
        let path = snapshot::snapshot_path(&config.data_dir, &tenant);
        let delay = Duration::from_millis(config.chain_save_debounce_ms);
        let thread_name = format!("markgen-save-{}", tenant);

        Arc::new_cyclic(|weak: &Weak<ChainStore>| {
            let weak = weak.clone();
            let on_fire = move || {
                if let Some(store) = weak.upgrade() {
                    if store.dirty.load(Ordering::SeqCst) {
                        if let Err(e) = store.save() {
                            warn!(tenant = %store.tenant, error = %e, "debounced snapshot save failed");
                        }
                    }
                }
            };
            ChainStore {
                debouncer: SaveDebouncer::spawn(thread_name, delay, on_fire),
                tenant,
                path,
                state_size: AtomicUsize::new(config.state_size),
                eol_token: config.eol_token.clone(),
                map: RwLock::new(FxHashMap::default()),
                dirty: AtomicBool::new(false),
                version: AtomicU64::new(0),
                save_lock: Mutex::new(()),
            }
        })
    }

    /// Create a store and load its snapshot if one exists.
    pub fn open(tenant: TenantId, config: &EngineConfig) -> Arc<ChainStore> {
        let store = Self::new(tenant, config);
        store.load();
        store
    }

    /// The owning tenant.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prefix order in effect (the snapshot's recorded value after load).
    pub fn state_size(&self) -> usize {
        self.state_size.load(Ordering::SeqCst)
    }

    /// Whether unsaved mutations exist.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Monotone save counter, captured from the snapshot on load.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Populate the store from its snapshot file.
    ///
    /// A missing file is a normal first run. An unreadable, truncated, or
    /// schema-incompatible file starts the store empty with a warning and
    /// is left on disk for operator inspection.
    pub fn load(&self) {
        if !self.path.exists() {
            debug!(tenant = %self.tenant, "no snapshot; starting empty");
            return;
        }
        let doc = match snapshot::read_snapshot(&self.path) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    tenant = %self.tenant,
                    path = %self.path.display(),
                    error = %e,
                    "snapshot unreadable; starting empty (file kept)"
                );
                return;
            }
        };

        let configured = self.state_size.load(Ordering::SeqCst);
        if doc.state_size != configured {
            warn!(
                tenant = %self.tenant,
                snapshot = doc.state_size,
                configured,
                "state size differs from snapshot; snapshot value wins"
            );
        }
        self.state_size.store(doc.state_size, Ordering::SeqCst);

        let mut loaded: FxHashMap<String, PrefixEntry> = FxHashMap::default();
        for (key, record) in doc.chains {
            let mut entry = PrefixEntry::new();
            for suffix in &record.suffixes {
                if suffix.word.is_empty() || suffix.weight == 0 {
                    warn!(
                        tenant = %self.tenant,
                        prefix = %key,
                        "dropping malformed suffix from snapshot"
                    );
                    continue;
                }
                entry.insert(&suffix.word, suffix.weight);
            }
            if entry.total_weight() != record.total_weight {
                warn!(
                    tenant = %self.tenant,
                    prefix = %key,
                    recorded = record.total_weight,
                    recomputed = entry.total_weight(),
                    "snapshot total weight mismatch; using recomputed value"
                );
            }
            if entry.suffix_count() > 0 {
                loaded.insert(key, entry);
            }
        }

        let prefix_count = loaded.len();
        *self.map.write() = loaded;
        self.version.store(doc.version, Ordering::SeqCst);
        self.dirty.store(false, Ordering::SeqCst);
        info!(
            tenant = %self.tenant,
            prefixes = prefix_count,
            version = doc.version,
            "snapshot loaded"
        );
    }

    /// Merge one observation.
    ///
    /// # Errors
    ///
    /// `InvalidInput` on an empty or wrong-order prefix, an empty or
    /// whitespace-bearing suffix, or a zero weight.
    pub fn add_record(&self, prefix: &str, suffix: &str, weight: u64) -> Result<()> {
        self.validate_record(prefix, suffix, weight)?;
        {
            let mut map = self.map.write();
            map.entry(prefix.to_string())
                .or_default()
                .insert(suffix, weight);
        }
        self.mark_dirty();
        Ok(())
    }

    /// Apply a batch of records under one write acquisition.
    ///
    /// Invalid records are skipped and reported; the batch never aborts.
    /// One debounced save is scheduled if anything was applied.
    pub fn add_batch(&self, records: &[TrainingRecord]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        {
            let mut map = self.map.write();
            for (i, record) in records.iter().enumerate() {
                match self.validate_record(&record.prefix, &record.suffix, record.weight) {
                    Ok(()) => {
                        map.entry(record.prefix.clone())
                            .or_default()
                            .insert(&record.suffix, record.weight);
                        outcome.inserted += 1;
                    }
                    Err(e) => outcome.errors.push((i, e)),
                }
            }
        }
        if outcome.inserted > 0 {
            self.mark_dirty();
        }
        if !outcome.errors.is_empty() {
            debug!(
                tenant = %self.tenant,
                rejected = outcome.errors.len(),
                "batch contained invalid records"
            );
        }
        outcome
    }

    /// Sample one suffix for a prefix, or `None` for an unknown prefix or
    /// a dead end.
    pub fn get_next(&self, prefix: &str) -> Option<String> {
        let map = self.map.read();
        let mut rng = rand::thread_rng();
        map.get(prefix)
            .and_then(|entry| entry.sample(&mut rng))
            .map(str::to_string)
    }

    /// Generate a token sequence from a seed prefix.
    ///
    /// Repeatedly samples a suffix for the last `state_size` output
    /// tokens, stopping on a dead end, on the configured end-of-line
    /// sentinel, or once `max_len` total tokens exist. The returned
    /// sequence includes the seed; an unknown seed (or an empty store)
    /// returns just the seed.
    pub fn generate(&self, seed: &[String], max_len: usize) -> Vec<String> {
        let mut output: Vec<String> = seed.to_vec();
        let state_size = self.state_size();
        let map = self.map.read();
        let mut rng = rand::thread_rng();

        while output.len() < max_len {
            if output.len() < state_size {
                break;
            }
            let key = prefix_key(&output[output.len() - state_size..]);
            let token = match map.get(&key).and_then(|entry| entry.sample(&mut rng)) {
                Some(token) => token.to_string(),
                None => break,
            };
            if self.eol_token.as_deref() == Some(token.as_str()) {
                break;
            }
            output.push(token);
        }
        output
    }

    /// Drop every prefix.
    pub fn clear(&self) {
        self.map.write().clear();
        self.mark_dirty();
        info!(tenant = %self.tenant, "store cleared");
    }

    /// Remove one prefix; returns whether it was present.
    pub fn remove_prefix(&self, prefix: &str) -> bool {
        let removed = self.map.write().remove(prefix).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> markgen_core::StoreStats {
        let map = self.map.read();
        let mut total_suffixes = 0usize;
        let mut approx: u64 = 0;
        for (key, entry) in map.iter() {
            total_suffixes += entry.suffix_count();
            // Key string plus hash-slot overhead.
            approx += key.len() as u64 + 48 + entry.approx_bytes();
        }
        markgen_core::StoreStats {
            prefix_count: map.len(),
            total_suffixes,
            approx_memory_bytes: approx,
        }
    }

    /// Write the snapshot now.
    ///
    /// Serialization happens under the read lock; the file write is
    /// atomic (tmp + fsync + rename). Concurrent saves serialize on an
    /// internal mutex. On failure the store stays dirty.
    pub fn save(&self) -> Result<()> {
        let _in_flight = self.save_lock.lock();
        self.dirty.store(false, Ordering::SeqCst);

        let doc = self.to_document(self.version.load(Ordering::SeqCst) + 1);
        match snapshot::write_snapshot(&self.path, &doc) {
            Ok(()) => {
                self.version.store(doc.version, Ordering::SeqCst);
                debug!(
                    tenant = %self.tenant,
                    prefixes = doc.chains.len(),
                    version = doc.version,
                    "snapshot written"
                );
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                warn!(tenant = %self.tenant, error = %e, "snapshot write failed");
                Err(e)
            }
        }
    }

    /// Cancel any pending debounce and save if dirty.
    ///
    /// Used on shutdown and forced eviction; waits on an in-flight
    /// debounced save.
    pub fn flush(&self) -> Result<()> {
        self.debouncer.cancel();
        if self.is_dirty() {
            self.save()
        } else {
            // Still serialize behind an in-flight save so callers can
            // rely on the file being complete when flush returns.
            let _in_flight = self.save_lock.lock();
            Ok(())
        }
    }

    /// Chains as (prefix, suffixes, total weight) records, sorted by
    /// prefix for deterministic output.
    pub fn export(&self) -> Vec<ChainRecord> {
        let map = self.map.read();
        let mut records: Vec<ChainRecord> = map
            .iter()
            .map(|(key, entry)| ChainRecord {
                prefix: key.clone(),
                suffixes: entry.suffixes().to_vec(),
                total_weight: entry.total_weight(),
            })
            .collect();
        records.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        records
    }

    /// Merge exported chain records back in.
    ///
    /// The inverse of [`ChainStore::export`] on an empty store. Malformed
    /// suffixes are rejected per-record via the returned outcome.
    pub fn import_chains(&self, records: &[ChainRecord]) -> BatchOutcome {
        let expanded: Vec<TrainingRecord> = records
            .iter()
            .flat_map(|record| {
                record.suffixes.iter().map(|s| {
                    TrainingRecord::new(record.prefix.clone(), s.word.clone(), s.weight)
                })
            })
            .collect();
        self.add_batch(&expanded)
    }

    fn to_document(&self, version: u64) -> SnapshotDocument {
        let map = self.map.read();
        let mut doc = SnapshotDocument::empty(self.tenant.clone(), self.state_size());
        doc.version = version;
        for (key, entry) in map.iter() {
            doc.chains.insert(
                key.clone(),
                ChainRecord {
                    prefix: key.clone(),
                    suffixes: entry.suffixes().to_vec(),
                    total_weight: entry.total_weight(),
                },
            );
        }
        doc
    }

    fn validate_record(&self, prefix: &str, suffix: &str, weight: u64) -> Result<()> {
        if weight == 0 {
            return Err(Error::invalid_input("weight must be >= 1"));
        }
        if suffix.is_empty() || suffix.contains(char::is_whitespace) {
            return Err(Error::invalid_input(format!(
                "suffix must be one non-empty token, got {:?}",
                suffix
            )));
        }
        let token_count = prefix.split_whitespace().count();
        if token_count == 0 {
            return Err(Error::invalid_input("prefix must not be empty"));
        }
        let state_size = self.state_size();
        if token_count != state_size {
            return Err(Error::invalid_input(format!(
                "prefix {:?} has {} tokens, expected {}",
                prefix, token_count, state_size
            )));
        }
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.debouncer.arm();
    }
}

impl Drop for ChainStore {
    fn drop(&mut self) {
        // Final forced flush: debounced work must not be lost at exit.
        if self.dirty.load(Ordering::SeqCst) {
            if let Err(e) = self.save() {
                warn!(tenant = %self.tenant, error = %e, "final flush on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore")
            .field("tenant", &self.tenant)
            .field("state_size", &self.state_size())
            .field("dirty", &self.is_dirty())
            .field("version", &self.version())
            .finish()
    }
}
