// =============================================================================
// Durable persistence -- one record per (coin, interval) key
// =============================================================================
//
// Writes use a tmp sibling + rename so a crash mid-write never leaves a
// corrupted file visible to a concurrent reader. Each key has exactly one
// writer (its orchestrator task), so writes per key are naturally serialized.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use super::series::PairKey;

/// Byte-level durable storage, atomic per key.
pub trait Persistence: Send + Sync {
    /// Read the record for `key`. `None` means no prior state exists.
    fn read(&self, key: &PairKey) -> Result<Option<Vec<u8>>>;

    /// Atomically replace the record for `key`.
    fn write(&self, key: &PairKey, bytes: &[u8]) -> Result<()>;
}

/// Flat-file persistence: `<root>/<coin>-<interval>.json` per key.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &PairKey) -> PathBuf {
        self.root
            .join(format!("{}-{}.json", key.coin, key.interval))
    }
}

impl Persistence for FileStore {
    fn read(&self, key: &PairKey) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed to read series file {}", path.display()))?;
        Ok(Some(bytes))
    }

    fn write(&self, key: &PairKey, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create data directory {}", self.root.display())
        })?;

        let path = self.path_for(key);
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, bytes)
            .with_context(|| format!("failed to write tmp series file {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp series file to {}", path.display()))?;

        debug!(key = %key, bytes = bytes.len(), "series persisted (atomic)");
        Ok(())
    }
}

/// In-memory persistence for tests.
#[cfg(test)]
pub struct MemoryStore(std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>);

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self(std::sync::Mutex::new(std::collections::HashMap::new()))
    }
}

#[cfg(test)]
impl Persistence for MemoryStore {
    fn read(&self, key: &PairKey) -> Result<Option<Vec<u8>>> {
        Ok(self.0.lock().unwrap().get(&key.to_string()).cloned())
    }

    fn write(&self, key: &PairKey, bytes: &[u8]) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
