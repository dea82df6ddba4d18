//! Snapshot file format and crash-safe writer
//!
//! One JSON document per tenant, `markov_<tenantId>.json` under the data
//! directory. The document carries a header (magic string, schema
//! version, state size, tenant id, save counter) and the chain mapping;
//! alias tables are never persisted.
//!
//! # Crash safety
//!
//! Writes follow the write-fsync-rename pattern:
//! 1. Serialize to `<path>.tmp`
//! 2. fsync the temporary file
//! 3. Atomic rename over the final path
//! 4. fsync the parent directory
//!
//! Either the complete new snapshot is visible or the previous one is;
//! a partial write never survives.

use markgen_core::{Error, Result, SuffixEntry, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Magic string identifying a markgen snapshot.
pub const SNAPSHOT_MAGIC: &str = "MARKGEN";
/// Current schema version.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Snapshot path for a tenant: `<data_dir>/markov_<tenantId>.json`.
pub fn snapshot_path(data_dir: &Path, tenant: &TenantId) -> PathBuf {
    data_dir.join(format!("markov_{}.json", tenant))
}

/// Serialized form of one prefix's chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRecord {
    /// Canonical prefix key (repeated from the map key for portability).
    pub prefix: String,
    /// Suffixes in insertion order.
    pub suffixes: Vec<SuffixEntry>,
    /// Sum of suffix weights.
    pub total_weight: u64,
}

/// The persistent form of one tenant's chain store.
///
/// The `chains` map is a `BTreeMap` so key order is deterministic across
/// saves of identical content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    /// Must equal [`SNAPSHOT_MAGIC`].
    pub magic: String,
    /// Must equal [`SNAPSHOT_SCHEMA_VERSION`].
    pub schema: u32,
    /// Prefix order the chains were built with.
    pub state_size: usize,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Monotone save counter.
    pub version: u64,
    /// Prefix key → chain record.
    pub chains: BTreeMap<String, ChainRecord>,
}

impl SnapshotDocument {
    /// Create an empty document for a tenant.
    pub fn empty(tenant: TenantId, state_size: usize) -> Self {
        SnapshotDocument {
            magic: SNAPSHOT_MAGIC.to_string(),
            schema: SNAPSHOT_SCHEMA_VERSION,
            state_size,
            tenant_id: tenant,
            version: 0,
            chains: BTreeMap::new(),
        }
    }
}

/// Read and validate a snapshot document.
///
/// # Errors
///
/// - `Io` when the file cannot be opened or read (including not-found;
///   callers distinguish first runs by probing the path beforehand)
/// - `Corrupt` on malformed JSON, wrong magic, or an unknown schema
///   version
pub fn read_snapshot(path: &Path) -> Result<SnapshotDocument> {
    let file = File::open(path)
        .map_err(|e| Error::io(format!("open snapshot {}", path.display()), e))?;
    let doc: SnapshotDocument = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| Error::corrupt(format!("{}: {}", path.display(), e)))?;

    if doc.magic != SNAPSHOT_MAGIC {
        return Err(Error::corrupt(format!(
            "{}: bad magic {:?}",
            path.display(),
            doc.magic
        )));
    }
    if doc.schema != SNAPSHOT_SCHEMA_VERSION {
        return Err(Error::corrupt(format!(
            "{}: unknown schema version {}",
            path.display(),
            doc.schema
        )));
    }
    Ok(doc)
}

/// Write a snapshot atomically.
pub fn write_snapshot(path: &Path, doc: &SnapshotDocument) -> Result<()> {
    let tmp_path = temp_path(path);

    // A leftover .tmp from a crashed writer is truncated, not an error.
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| Error::io(format!("create {}", tmp_path.display()), e))?;

    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, doc)
        .map_err(|e| Error::io(format!("serialize {}", path.display()), e.into()))?;
    writer
        .flush()
        .map_err(|e| Error::io(format!("flush {}", tmp_path.display()), e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| Error::io(format!("fsync {}", tmp_path.display()), e))?;

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::io(format!("rename {}", path.display()), e))?;

    // fsync the directory so the rename itself is durable.
    if let Some(parent) = path.parent() {
        let dir = File::open(parent)
            .map_err(|e| Error::io(format!("open dir {}", parent.display()), e))?;
        dir.sync_all()
            .map_err(|e| Error::io(format!("fsync dir {}", parent.display()), e))?;
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}
