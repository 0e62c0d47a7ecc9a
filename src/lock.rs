// src/lock.rs

//! Named, directory-based provisioning locks
//!
//! Each provisioning operation serializes on a lock name (`webmail-setup`,
//! `service-enable`, `dns-forward`). A lock is a directory under the lock
//! root, which makes it visible to every server process on the host and
//! lets it survive a crash of its holder.
//!
//! # Lock Strategy
//!
//! - **Acquire**: a staging directory holding a `holder` record is renamed
//!   onto `<root>/<name>.lock`. The rename only succeeds when the target does
//!   not exist, so the lock directory appears atomically and never without
//!   its holder record.
//! - **Stale reclaim**: a lock older than [`STALE_AFTER`] may only be
//!   removed by the process holding the `.<name>.reclaim` gate, itself a
//!   directory created with `mkdir`. Under the gate the age is checked
//!   again, the stale lock is renamed to a scratch name and deleted, and the
//!   lock is re-acquired through the normal path. Racing reclaimers without
//!   the gate back off, so at most one caller ends up holding the lock.
//! - **Release**: [`LockGuard`] removes the lock on drop, including during
//!   unwinding from a panic.
//!
//! # Example
//!
//! ```ignore
//! use mailsmith::lock::LockManager;
//!
//! let locks = LockManager::new("/run/mailsmith/locks");
//! match locks.try_acquire("webmail-setup")? {
//!     Some(_guard) => { /* run the session */ }
//!     None => { /* setup already in progress */ }
//! }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Age after which a held lock is presumed abandoned
///
/// Comfortably longer than the sum of all phase timeouts in the slowest session.
pub const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Default lock root
pub const DEFAULT_LOCK_DIR: &str = "/run/mailsmith/locks";

/// Age after which an abandoned reclaim gate is cleared
const RECLAIM_GATE_STALE: Duration = Duration::from_secs(60);

const HOLDER_FILE: &str = "holder";

/// Contents of a lock's `holder` file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    /// Lock directory path
    pub path: PathBuf,
    /// Acquisition time, milliseconds since the Unix epoch
    pub acquired_at_millis: i64,
    /// Process that acquired the lock
    pub pid: u32,
    /// Distinguishes this acquisition from any later one on the same name
    pub token: String,
}

impl LockRecord {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            acquired_at_millis: chrono::Utc::now().timestamp_millis(),
            pid: std::process::id(),
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Age relative to now; a record from the future counts as brand new
    pub fn age(&self) -> Duration {
        let now = chrono::Utc::now().timestamp_millis();
        Duration::from_millis(now.saturating_sub(self.acquired_at_millis).max(0) as u64)
    }
}

/// Hands out named locks rooted at one directory
#[derive(Debug, Clone)]
pub struct LockManager {
    root: PathBuf,
    stale_after: Duration,
}

impl LockManager {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            stale_after: STALE_AFTER,
        }
    }

    /// Path of the lock directory for `name`
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.lock", name))
    }

    /// Try to take the lock without waiting
    ///
    /// Returns:
    /// - `Ok(Some(guard))` if this caller now owns the lock
    /// - `Ok(None)` if another holder owns it, or a reclaim race was lost
    /// - `Err` on I/O errors unrelated to contention
    pub fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        validate_lock_name(name)?;
        fs::create_dir_all(&self.root)?;
        let path = self.lock_path(name);

        if let Some(guard) = self.install(&path)? {
            return Ok(Some(guard));
        }

        let age = match self.age_of(&path) {
            Some(age) => age,
            // Released between our attempt and the age probe
            None => return self.install(&path),
        };

        if age < self.stale_after {
            debug!("Lock {} held ({}s old)", name, age.as_secs());
            return Ok(None);
        }

        warn!(
            "Lock {} is stale ({}s old, threshold {}s), attempting reclaim",
            name,
            age.as_secs(),
            self.stale_after.as_secs()
        );
        self.reclaim(name, &path)
    }

    /// Remove the lock for `name` regardless of who holds it
    ///
    /// Best-effort: errors are logged and swallowed.
    pub fn release(&self, name: &str) {
        let path = self.lock_path(name);
        discard(&self.root, name, &path);
    }

    /// Holder record of a currently held lock, if readable
    pub fn holder(&self, name: &str) -> Option<LockRecord> {
        read_record(&self.lock_path(name))
    }

    /// Whether `name` is currently held (stale or not)
    pub fn is_held(&self, name: &str) -> bool {
        self.lock_path(name).is_dir()
    }

    fn reclaim(&self, name: &str, path: &Path) -> Result<Option<LockGuard>> {
        let gate = self.root.join(format!(".{}.reclaim", name));
        if let Err(e) = fs::create_dir(&gate) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
            // A reclaimer that died mid-way leaves its gate behind
            if mtime_age(&gate).is_some_and(|age| age >= RECLAIM_GATE_STALE) {
                warn!("Clearing abandoned reclaim gate for {}", name);
                let _ = fs::remove_dir(&gate);
            }
            debug!("Lost reclaim race for {}", name);
            return Ok(None);
        }

        let result = self.reclaim_gated(name, path);
        if let Err(e) = fs::remove_dir(&gate) {
            warn!("Failed to remove reclaim gate {:?}: {}", gate, e);
        }
        result
    }

    fn reclaim_gated(&self, name: &str, path: &Path) -> Result<Option<LockGuard>> {
        // Another reclaimer may have finished between our probe and the gate
        let stale_token = match self.age_of(path) {
            None => return self.install(path),
            Some(age) if age < self.stale_after => return Ok(None),
            Some(_) => read_record(path).map(|r| r.token),
        };

        let scratch = self.root.join(format!(".{}.reclaim-{}", name, Uuid::new_v4()));
        if let Err(e) = fs::rename(path, &scratch) {
            debug!("Stale lock {} vanished before reclaim: {}", name, e);
            return self.install(path);
        }

        // The holder may have released and a new owner installed in between
        if read_record(&scratch).map(|r| r.token) != stale_token {
            if let Err(e) = fs::rename(&scratch, path) {
                warn!("Failed to restore live lock {}: {}", name, e);
            }
            return Ok(None);
        }

        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!("Failed to delete reclaimed lock {:?}: {}", scratch, e);
        }

        let guard = self.install(path)?;
        if guard.is_some() {
            info!("Reclaimed stale lock {}", name);
        }
        Ok(guard)
    }

    /// Atomically create `path` with a fresh holder record
    fn install(&self, path: &Path) -> Result<Option<LockGuard>> {
        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));
        fs::create_dir(&staging)?;

        let record = LockRecord::new(path.to_path_buf());
        if let Err(e) = fs::write(staging.join(HOLDER_FILE), serde_json::to_vec(&record)?) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        match fs::rename(&staging, path) {
            Ok(()) => {
                info!("Acquired lock at {:?}", path);
                Ok(Some(LockGuard {
                    root: self.root.clone(),
                    path: path.to_path_buf(),
                    token: record.token,
                }))
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                if path.exists() || is_contention(&e) {
                    Ok(None)
                } else {
                    Err(Error::Io(e))
                }
            }
        }
    }

    /// Age from the holder record, else the directory mtime; `None` if gone
    fn age_of(&self, path: &Path) -> Option<Duration> {
        if let Some(record) = read_record(path) {
            return Some(record.age());
        }
        mtime_age(path)
    }
}

fn mtime_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

fn is_contention(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty
    )
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let bytes = fs::read(path.join(HOLDER_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Rename-then-delete so a concurrent acquirer never sees a half-removed lock
fn discard(root: &Path, name: &str, path: &Path) {
    let scratch = root.join(format!(".{}.release-{}", name, Uuid::new_v4()));
    match fs::rename(path, &scratch) {
        Ok(()) => {
            if let Err(e) = fs::remove_dir_all(&scratch) {
                debug!("Failed to delete released lock {:?}: {}", scratch, e);
            }
        }
        Err(e) => debug!("Failed to release lock {:?}: {}", path, e),
    }
}

/// Lock names become directory names; keep them boring
fn validate_lock_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid lock name: {:?}", name)))
    }
}

/// Ownership of a held lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    root: PathBuf,
    path: PathBuf,
    token: String,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the lock directory still carries this guard's record
    pub fn is_owned(&self) -> bool {
        read_record(&self.path).is_some_and(|r| r.token == self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.is_owned() {
            warn!("Lock at {:?} was taken over before release; leaving it", self.path);
            return;
        }
        let name = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        discard(&self.root, &name, &self.path);
        info!("Released lock at {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release_on_drop() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        {
            let guard = locks.try_acquire("webmail-setup").unwrap();
            assert!(guard.is_some());
            assert!(locks.is_held("webmail-setup"));
            assert!(guard.unwrap().is_owned());
        }

        assert!(!locks.is_held("webmail-setup"));
    }

    #[test]
    fn test_second_acquire_is_locked() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        let _first = locks.try_acquire("webmail-setup").unwrap().unwrap();
        assert!(locks.try_acquire("webmail-setup").unwrap().is_none());
    }

    #[test]
    fn test_distinct_names_do_not_contend() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        let _a = locks.try_acquire("webmail-setup").unwrap().unwrap();
        let _b = locks.try_acquire("service-enable").unwrap().unwrap();
    }

    #[test]
    fn test_holder_record_written() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        let _guard = locks.try_acquire("dns-forward").unwrap().unwrap();
        let record = locks.holder("dns-forward").unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.path, locks.lock_path("dns-forward"));
        assert!(record.age() < Duration::from_secs(60));
    }

    #[test]
    fn test_explicit_release_is_best_effort() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        // Releasing a lock nobody holds must not panic
        locks.release("service-enable");

        let guard = locks.try_acquire("service-enable").unwrap().unwrap();
        locks.release("service-enable");
        assert!(!locks.is_held("service-enable"));
        // Guard notices it no longer owns anything
        assert!(!guard.is_owned());
        drop(guard);
        assert!(locks.try_acquire("service-enable").unwrap().is_some());
    }

    #[test]
    fn test_fresh_lock_not_reclaimed() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        let _guard = locks.try_acquire("webmail-setup").unwrap().unwrap();
        let record_before = locks.holder("webmail-setup").unwrap();
        assert!(locks.try_acquire("webmail-setup").unwrap().is_none());
        assert_eq!(locks.holder("webmail-setup").unwrap(), record_before);
    }

    #[test]
    fn test_invalid_lock_name_rejected() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());
        assert!(locks.try_acquire("../etc").is_err());
        assert!(locks.try_acquire("").is_err());
    }

    #[test]
    fn test_released_guard_does_not_remove_successor() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        let stale = locks.try_acquire("webmail-setup").unwrap().unwrap();
        // Simulate a reclaimer replacing the lock underneath the first holder
        locks.release("webmail-setup");
        let successor = locks.try_acquire("webmail-setup").unwrap().unwrap();

        drop(stale);
        assert!(locks.is_held("webmail-setup"));
        assert!(successor.is_owned());
    }
}
