use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use vanity_name_registry::RegistrySnapshot;

const SNAPSHOT_KEY: &[u8] = b"snapshot";
const SNAPSHOT_FORMAT: u32 = 1;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unsupported snapshot format {found}, expected {expected}")]
    UnsupportedFormat { found: u32, expected: u32 },
}

/// Snapshot as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    format: u32,
    saved_at: u64,
    registry: RegistrySnapshot,
}

/// Abstract storage trait
pub trait RegistryStore: Send + Sync {
    /// Most recently saved snapshot, if any.
    fn load_snapshot(&self) -> Result<Option<RegistrySnapshot>>;
    /// Replace the stored snapshot. `saved_at` is the registry clock at save time.
    fn save_snapshot(&self, snapshot: &RegistrySnapshot, saved_at: u64) -> Result<()>;
}

/// Sled-backed implementation
pub struct SledRegistryStore {
    db: Db,
    registry: Tree,
}

impl SledRegistryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).map_err(StorageError::from)?;
        let registry = db.open_tree("registry").map_err(StorageError::from)?;
        Ok(Self { db, registry })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(StorageError::from)?;
        Ok(())
    }
}

impl RegistryStore for SledRegistryStore {
    fn load_snapshot(&self) -> Result<Option<RegistrySnapshot>> {
        let Some(raw) = self.registry.get(SNAPSHOT_KEY).map_err(StorageError::from)? else {
            return Ok(None);
        };
        let stored: StoredSnapshot =
            serde_json::from_slice(&raw).map_err(StorageError::from)?;
        if stored.format != SNAPSHOT_FORMAT {
            return Err(StorageError::UnsupportedFormat {
                found: stored.format,
                expected: SNAPSHOT_FORMAT,
            }
            .into());
        }
        debug!("Loaded registry snapshot saved at {}", stored.saved_at);
        Ok(Some(stored.registry))
    }

    fn save_snapshot(&self, snapshot: &RegistrySnapshot, saved_at: u64) -> Result<()> {
        let stored = StoredSnapshot {
            format: SNAPSHOT_FORMAT,
            saved_at,
            registry: snapshot.clone(),
        };
        let data = serde_json::to_vec(&stored).map_err(StorageError::from)?;
        self.registry
            .insert(SNAPSHOT_KEY, data)
            .map_err(StorageError::from)?;
        self.flush()
    }
}

/// In-memory testing backend
#[derive(Default)]
pub struct MemoryRegistryStore {
    snapshot: Arc<RwLock<Option<(u64, RegistrySnapshot)>>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock value passed to the last save.
    pub fn saved_at(&self) -> Option<u64> {
        self.snapshot.read().as_ref().map(|(at, _)| *at)
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn load_snapshot(&self) -> Result<Option<RegistrySnapshot>> {
        Ok(self.snapshot.read().as_ref().map(|(_, s)| s.clone()))
    }

    fn save_snapshot(&self, snapshot: &RegistrySnapshot, saved_at: u64) -> Result<()> {
        *self.snapshot.write() = Some((saved_at, snapshot.clone()));
        Ok(())
    }
}
