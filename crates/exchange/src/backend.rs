//! Pluggable spool storage contract and the filesystem backend.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ftq_common::{ExchangeConfig, FtqError, Result};

/// Storage abstraction behind the exchange manager.
///
/// Paths are opaque `/`-separated relative keys produced by [`crate::layout`].
/// Implementations must make each stored object independently readable and
/// must tolerate `delete_prefix` for prefixes that no longer exist.
pub trait ExchangeBackend: Send + Sync {
    /// Stores one object. Overwrites are contract violations upstream; the
    /// backend itself does not enforce write-once.
    ///
    /// # Errors
    /// Returns an error for IO failures.
    fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Reads one whole object.
    ///
    /// # Errors
    /// Returns an error for IO failures or a missing object.
    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Returns whether an object exists.
    ///
    /// # Errors
    /// Returns an error for IO failures.
    fn exists(&self, path: &str) -> Result<bool>;

    /// Deletes every object under `prefix`, best-effort.
    ///
    /// # Errors
    /// Returns an error for IO failures other than the prefix being absent.
    fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// Filesystem spool backend with round-robin spreading across base roots.
///
/// An attempt directory is pinned to one root on its first write; reads
/// consult the pin first and fall back to probing every root, so spooled
/// attempts stay readable after a process restart loses the pin map.
pub struct FsBackend {
    roots: Vec<PathBuf>,
    next_root: AtomicUsize,
    // attempt prefix -> root index, assigned round-robin on first write
    assignments: Mutex<HashMap<String, usize>>,
}

impl FsBackend {
    /// Creates a backend over the configured base directories.
    ///
    /// # Errors
    /// Fails when the configuration names no base directory.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            roots: config.base_directories.clone(),
            next_root: AtomicUsize::new(0),
            assignments: Mutex::new(HashMap::new()),
        })
    }

    fn root_for_write(&self, path: &str) -> usize {
        let prefix = attempt_prefix(path);
        let mut assignments = self.assignments.lock().expect("fs backend assignments");
        *assignments.entry(prefix).or_insert_with(|| {
            self.next_root.fetch_add(1, Ordering::Relaxed) % self.roots.len()
        })
    }

    fn locate(&self, path: &str) -> Option<PathBuf> {
        let prefix = attempt_prefix(path);
        {
            let assignments = self.assignments.lock().expect("fs backend assignments");
            if let Some(idx) = assignments.get(&prefix) {
                let abs = self.roots[*idx].join(path);
                if abs.exists() {
                    return Some(abs);
                }
            }
        }
        self.roots
            .iter()
            .map(|r| r.join(path))
            .find(|abs| abs.exists())
    }
}

impl ExchangeBackend for FsBackend {
    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let root = self.root_for_write(path);
        let abs = self.roots[root].join(path);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(abs, data)?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let abs = self.locate(path).ok_or_else(|| {
            FtqError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("spooled object not found: {path}"),
            ))
        })?;
        Ok(fs::read(abs)?)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.locate(path).is_some())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        for root in &self.roots {
            let abs = root.join(prefix);
            match fs::remove_dir_all(&abs) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let mut assignments = self.assignments.lock().expect("fs backend assignments");
        assignments.retain(|p, _| !p.starts_with(prefix));
        Ok(())
    }
}

// First four segments: exchange/{query}/{stage}/{attempt}.
fn attempt_prefix(path: &str) -> String {
    path.split('/').take(4).collect::<Vec<_>>().join("/")
}
