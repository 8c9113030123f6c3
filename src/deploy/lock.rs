//! The two independent halves of the deploy lock.
//!
//! [`DeployGate`] serializes deploys inside this process and answers "is a
//! deploy running?" without blocking. [`LockProvider`] guards against other
//! processes (a restarted or duplicated agent) through an OS advisory lock.
//! The coordinator composes both; neither knows about the other.

use anyhow::Context;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// In-process deploy mutex, created once at startup and cloned into every
/// task that needs it.
#[derive(Debug, Clone, Default)]
pub struct DeployGate {
    inner: Arc<Mutex<()>>,
}

/// Proof of holding the [`DeployGate`]. Dropping it releases the gate.
#[derive(Debug)]
pub struct DeployPermit {
    _guard: OwnedMutexGuard<()>,
}

impl DeployGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking query.
    pub fn is_running(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Take the gate if free. Used by the dispatcher so that checking and
    /// claiming happen in one step.
    pub fn try_begin(&self) -> Option<DeployPermit> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(|guard| DeployPermit { _guard: guard })
    }

    /// Wait for the gate.
    pub async fn begin(&self) -> DeployPermit {
        DeployPermit {
            _guard: Arc::clone(&self.inner).lock_owned().await,
        }
    }
}

/// An acquired cross-process lock. Dropping it releases the lock.
pub struct LockHold {
    _inner: Box<dyn Send>,
}

impl LockHold {
    pub fn new(inner: impl Send + 'static) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for LockHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockHold")
    }
}

/// Cross-process exclusive lock, always attempted without blocking.
///
/// `Ok(None)` means another holder has it: an expected outcome, not an
/// error. `Err` is reserved for failures to even attempt (unwritable
/// directory, bad path). Called from a blocking worker thread.
pub trait LockProvider: Send + Sync {
    fn try_acquire(&self) -> anyhow::Result<Option<LockHold>>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// `flock`-style advisory lock on a file path.
///
/// The file's content is irrelevant and never read; only the OS lock table
/// entry matters, so the file may be deleted whenever no deploy is active.
/// The OS drops the lock when the holder exits, so a crashed run cannot jam
/// later attempts.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    path: PathBuf,
}

impl FileLockProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockProvider for FileLockProvider {
    fn try_acquire(&self) -> anyhow::Result<Option<LockHold>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create lock directory {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open lock file {}", self.path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(LockHold::new(FileLockGuard { file }))),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to lock {}", self.path.display())),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
