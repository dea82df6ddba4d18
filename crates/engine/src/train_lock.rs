//! Per-tenant advisory training lock
//!
//! Bulk training would corrupt progress tracking if two runs raced on
//! one tenant, so it is guarded by a lock file under the configuration
//! directory, `<config_dir>/<tenantId>_training.lock`, holding the
//! owner's decimal PID.
//!
//! Acquisition is non-blocking: an OS-level exclusive lock on the file
//! decides ownership, so a holder's death releases the lock implicitly
//! and a stale file from a dead owner is reclaimed on the next attempt.
//! The PID content is diagnostic — it names the holder in the
//! `Contention` error and in operator tooling.

use fs2::FileExt;
use markgen_core::{Error, Result, TenantId};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Held advisory lock for one tenant's bulk training.
///
/// Released (and the lock file removed) on drop.
pub struct TrainingLock {
    tenant: TenantId,
    path: PathBuf,
    file: File,
}

impl TrainingLock {
    /// Try to acquire the tenant's training lock without blocking.
    ///
    /// # Errors
    ///
    /// - `Contention` when a live process holds the lock; the error
    ///   carries the holder's PID as recorded in the file
    /// - `Io` when the configuration directory or lock file cannot be
    ///   created
    pub fn acquire(config_dir: &Path, tenant: &TenantId) -> Result<TrainingLock> {
        std::fs::create_dir_all(config_dir).map_err(|e| {
            Error::io(format!("create config dir {}", config_dir.display()), e)
        })?;
        let path = lock_path(config_dir, tenant);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::io(format!("open lock file {}", path.display()), e))?;

        if file.try_lock_exclusive().is_err() {
            let pid = read_pid(&path);
            debug!(tenant = %tenant, pid, "training lock held by live process");
            return Err(Error::contention(tenant.clone(), pid));
        }

        // We hold the lock. Leftover content means the previous owner
        // died without cleanup; the file is ours to reclaim.
        let own_pid = std::process::id();
        let previous = read_pid(&path);
        if previous != 0 && previous != own_pid {
            info!(tenant = %tenant, stale_pid = previous, "reclaimed stale training lock");
        }

        file.set_len(0)
            .map_err(|e| Error::io(format!("truncate lock file {}", path.display()), e))?;
        (&file)
            .write_all(own_pid.to_string().as_bytes())
            .map_err(|e| Error::io(format!("write lock file {}", path.display()), e))?;

        debug!(tenant = %tenant, pid = own_pid, "training lock acquired");
        Ok(TrainingLock {
            tenant: tenant.clone(),
            path,
            file,
        })
    }

    /// The guarded tenant.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TrainingLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(tenant = %self.tenant, error = %e, "failed to release training lock");
        }
        // Best effort; a leftover file is reclaimed on the next attempt.
        let _ = std::fs::remove_file(&self.path);
        debug!(tenant = %self.tenant, "training lock released");
    }
}

impl std::fmt::Debug for TrainingLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingLock")
            .field("tenant", &self.tenant)
            .field("path", &self.path)
            .finish()
    }
}

/// Lock file path for a tenant: `<config_dir>/<tenantId>_training.lock`.
pub fn lock_path(config_dir: &Path, tenant: &TenantId) -> PathBuf {
    config_dir.join(format!("{}_training.lock", tenant))
}

fn read_pid(path: &Path) -> u32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
        .unwrap_or(0)
}
