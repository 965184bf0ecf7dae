//! Scratch file broker used by the image pipeline
//!
//! Every path handed out by [`ScratchBroker::allocate`] is a real, empty file
//! created with a unique name, so concurrent pipeline runs never collide. The
//! broker remembers which paths are still live; [`ScratchBroker::release`]
//! deletes a path and forgets it, and releasing the same path twice is a no-op.
//! A [`ScratchSet`] groups the allocations of one run and releases them when
//! dropped, so a run abandoned halfway still cleans up after itself.

use crate::{Error, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PREFIX: &str = "boardshot-";

/// Allocates and deletes uniquely named scratch files.
#[derive(Clone)]
pub struct ScratchBroker {
    dir: PathBuf,
    live: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ScratchBroker {
    /// Broker rooted at the system temporary directory.
    pub fn new() -> Self {
        Self::in_dir(std::env::temp_dir())
    }

    /// Broker rooted at `dir` (which must already exist).
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start a set of allocations that is released as a whole when the
    /// set is dropped, including when its owner is cancelled mid-run.
    pub fn scope(&self) -> ScratchSet {
        ScratchSet {
            broker: self.clone(),
            state: Arc::new(Mutex::new(SetState::default())),
        }
    }

    async fn allocate_into(&self, suffix: &str, owner: Arc<Mutex<SetState>>) -> Result<PathBuf> {
        let dir = self.dir.clone();
        let suffix = suffix.to_string();
        let live = Arc::clone(&self.live);
        // Bookkeeping happens on the blocking thread, so a caller dropped
        // while the file is being created cannot lose track of it.
        let path = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            let file = tempfile::Builder::new()
                .prefix(PREFIX)
                .suffix(&suffix)
                .tempfile_in(&dir)?;
            // The broker owns deletion from here on.
            let path = file.into_temp_path().keep().map_err(|e| e.error)?;
            let mut state = owner.lock();
            if state.closed {
                let _ = std::fs::remove_file(&path);
                return Err(std::io::Error::new(ErrorKind::Interrupted, "scratch set already released"));
            }
            live.lock().insert(path.clone());
            state.paths.push(path.clone());
            Ok(path)
        })
        .await
        .map_err(|e| Error::Other(format!("Scratch allocation task failed: {}", e)))?
        .map_err(Error::ResourceExhausted)?;

        debug!(target: "boardshot::scratch", "allocated {}", path.display());
        Ok(path)
    }

    /// Delete `path`. Already-deleted paths are fine.
    pub async fn release(&self, path: &Path) -> Result<()> {
        let tracked = self.live.lock().remove(path);
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(target: "boardshot::scratch", "released {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                if tracked {
                    // Keep it visible so a later release can retry.
                    self.live.lock().insert(path.to_path_buf());
                }
                Err(Error::Io(e))
            }
        }
    }

    /// Release every path, logging failures instead of returning them.
    pub async fn release_all(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = self.release(path).await {
                warn!(target: "boardshot::scratch", "failed to delete {}: {}", path.display(), e);
            }
        }
    }

    /// Hand `paths` to a detached task that releases them in the background.
    ///
    /// Outside a tokio runtime the paths are deleted on the spot and no
    /// handle is returned.
    pub fn release_detached(&self, paths: Vec<PathBuf>) -> Option<tokio::task::JoinHandle<()>> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let broker = self.clone();
                Some(handle.spawn(async move {
                    broker.release_all(&paths).await;
                }))
            }
            Err(_) => {
                for path in &paths {
                    self.live.lock().remove(path);
                    if let Err(e) = std::fs::remove_file(path) {
                        if e.kind() != ErrorKind::NotFound {
                            warn!(target: "boardshot::scratch", "failed to delete {}: {}", path.display(), e);
                        }
                    }
                }
                None
            }
        }
    }

    /// Number of allocations not yet released.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl Default for ScratchBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct SetState {
    paths: Vec<PathBuf>,
    closed: bool,
}

/// Allocations owned by one pipeline run.
///
/// Dropping the set hands every path it allocated to
/// [`ScratchBroker::release_detached`], exactly once.
pub struct ScratchSet {
    broker: ScratchBroker,
    state: Arc<Mutex<SetState>>,
}

impl ScratchSet {
    /// Create a fresh empty file ending in `suffix` and return its path.
    ///
    /// Only filesystem exhaustion (or an unusable scratch directory) makes
    /// this fail, surfaced as [`Error::ResourceExhausted`].
    pub async fn allocate(&self, suffix: &str) -> Result<PathBuf> {
        self.broker.allocate_into(suffix, Arc::clone(&self.state)).await
    }
}

impl Drop for ScratchSet {
    fn drop(&mut self) {
        let paths = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.paths)
        };
        if !paths.is_empty() {
            self.broker.release_detached(paths);
        }
    }
}
