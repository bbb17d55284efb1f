//! Filesystem instance store and atomic write operations
//!
//! Manages the .trellis/ directory structure: `config.json`, one
//! `instances/<uuid>.json` snapshot per persisted workflow and the
//! `meta/instances.json` index. Every write goes through a temp file and a
//! rename.

use anyhow::Context;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::RuntimeConfig;
use super::error::{SnapshotError, SnapshotResult, StorageError, StorageResult};
use super::snapshot::{InstanceSnapshot, SnapshotIndex, SnapshotIndexEntry};

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp_path = path.with_extension("tmp");
    let failed = |detail: String| StorageError::AtomicWriteFailed {
        path: path.to_path_buf(),
        detail,
    };

    let mut file = File::create(&temp_path).map_err(|e| failed(format!("create {:?}: {}", temp_path, e)))?;
    file.write_all(data).map_err(|e| failed(format!("write: {}", e)))?;
    file.sync_all().map_err(|e| failed(format!("sync: {}", e)))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| failed(format!("rename {:?}: {}", temp_path, e)))?;

    // Sync parent directory
    if let Some(parent) = path.parent() {
        let dir = OpenOptions::new().read(true).open(parent)?;
        dir.sync_all()?;
    }

    Ok(())
}

/// Persisted workflow instances under one root
#[derive(Debug, Clone)]
pub struct InstanceStore {
    root: PathBuf,
    index: Arc<RwLock<SnapshotIndex>>,
}

impl InstanceStore {
    /// Open the store at `root`, loading its index
    pub fn open(root: impl Into<PathBuf>) -> SnapshotResult<Self> {
        let root = root.into();
        let index = SnapshotIndex::load(&root.join("meta").join("instances.json"))?;
        Ok(Self {
            root,
            index: Arc::new(RwLock::new(index)),
        })
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the meta directory path
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    /// Get the instances directory path
    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    /// Snapshot file for `id`
    pub fn instance_path(&self, id: &Uuid) -> PathBuf {
        self.instances_dir().join(format!("{}.json", id))
    }

    /// Index file path
    pub fn index_path(&self) -> PathBuf {
        self.meta_dir().join("instances.json")
    }

    /// Write `snapshot` and record it in the index
    pub fn save(&self, snapshot: &InstanceSnapshot) -> SnapshotResult<()> {
        let data = serde_json::to_vec_pretty(snapshot).map_err(StorageError::from)?;
        write_atomic(&self.instance_path(&snapshot.instance_id), &data)?;

        let mut index = self.index.write();
        index.upsert(snapshot.index_entry());
        index.save(&self.index_path())?;

        tracing::debug!(
            instance = %snapshot.instance_id,
            status = %snapshot.execution_state,
            bytes = data.len(),
            "instance persisted"
        );
        Ok(())
    }

    /// Read the snapshot persisted for `id`
    pub fn load(&self, id: &Uuid) -> SnapshotResult<InstanceSnapshot> {
        let path = self.instance_path(id);
        if !path.exists() {
            return Err(SnapshotError::NotFound(*id));
        }
        let data = fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|e| SnapshotError::InvalidFormat(e.to_string()))
    }

    /// Remove the snapshot for `id`. Returns whether one existed.
    pub fn delete(&self, id: &Uuid) -> SnapshotResult<bool> {
        let path = self.instance_path(id);
        let existed = path.exists();
        if existed {
            fs::remove_file(&path)?;
        }
        let mut index = self.index.write();
        if index.remove(id).is_some() || existed {
            index.save(&self.index_path())?;
        }
        Ok(existed)
    }

    /// Whether a snapshot exists for `id`
    pub fn contains(&self, id: &Uuid) -> bool {
        self.instance_path(id).exists()
    }

    /// Persisted instances, most recent first
    pub fn list(&self) -> Vec<SnapshotIndexEntry> {
        self.index.read().entries()
    }

    /// Index entry for `id`
    pub fn entry(&self, id: &Uuid) -> Option<SnapshotIndexEntry> {
        self.index.read().get(id).cloned()
    }
}

/// Initialize storage directories for a new store
pub fn init_storage(root: &Path) -> anyhow::Result<()> {
    for dir in [root.to_path_buf(), root.join("meta"), root.join("instances")] {
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;
    }
    Ok(())
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> anyhow::Result<()> {
    let config_path = config.root.join("config.json");
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(&config_path, &json)?;
    Ok(())
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> anyhow::Result<RuntimeConfig> {
    let config_path = root.join("config.json");
    let data = fs::read(&config_path).with_context(|| format!("Failed to read file: {:?}", config_path))?;
    let config: RuntimeConfig = serde_json::from_slice(&data).context("Failed to deserialize config")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        init_storage(root).unwrap();

        assert!(root.join("meta").exists());
        assert!(root.join("instances").exists());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        init_storage(&root).unwrap();

        let config = RuntimeConfig {
            root: root.clone(),
            acquire_lock_timeout: Duration::from_millis(1500),
            persist_exceptions: false,
            debug: true,
            ..RuntimeConfig::default()
        };

        write_config(&config).unwrap();
        let loaded = load_config(&root).unwrap();

        assert_eq!(loaded.acquire_lock_timeout, Duration::from_millis(1500));
        assert!(!loaded.persist_exceptions);
        assert!(loaded.auto_disassociate_scopes);
        assert!(loaded.debug);
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let test_file = temp.path().join("test.dat");

        let data = b"Hello, world!";
        write_atomic(&test_file, data).unwrap();

        let read_data = fs::read(&test_file).unwrap();
        assert_eq!(data, &read_data[..]);
        assert!(!temp.path().join("test.tmp").exists());
    }

    #[test]
    fn test_missing_instance() {
        let temp = TempDir::new().unwrap();
        init_storage(temp.path()).unwrap();
        let store = InstanceStore::open(temp.path()).unwrap();

        let id = Uuid::new_v4();
        assert!(matches!(store.load(&id), Err(SnapshotError::NotFound(missing)) if missing == id));
        assert!(!store.delete(&id).unwrap());
        assert!(store.list().is_empty());
    }
}
