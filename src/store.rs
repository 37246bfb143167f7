//! Pool record storage
//!
//! The canonical pool and the rendezvous envelopes live outside this crate.
//! These traits are the boundary; an in-memory store backs tests and a
//! JSON-file store backs the CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{VmPool, VmPoolInfo};
use crate::Result;

/// Canonical pool records keyed by owner
pub trait PoolStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<VmPool>>;
    fn update(&self, pool: &VmPool) -> Result<()>;
}

/// Rendezvous envelopes keyed by pool owner
pub trait InfoStore: Send + Sync {
    fn get_info(&self, key: &str) -> Result<Option<VmPoolInfo>>;
    fn update_info(&self, info: &VmPoolInfo) -> Result<()>;
}

/// In-process store, cloneable and shareable across threads
#[derive(Clone, Default)]
pub struct MemoryStore {
    pools: Arc<RwLock<HashMap<String, VmPool>>>,
    infos: Arc<RwLock<HashMap<String, VmPoolInfo>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(self, pool: VmPool) -> Self {
        self.pools.write().insert(pool.key.clone(), pool);
        self
    }
}

impl PoolStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<VmPool>> {
        Ok(self.pools.read().get(key).cloned())
    }

    fn update(&self, pool: &VmPool) -> Result<()> {
        self.pools.write().insert(pool.key.clone(), pool.clone());
        Ok(())
    }
}

impl InfoStore for MemoryStore {
    fn get_info(&self, key: &str) -> Result<Option<VmPoolInfo>> {
        Ok(self.infos.read().get(key).cloned())
    }

    fn update_info(&self, info: &VmPoolInfo) -> Result<()> {
        self.infos.write().insert(info.key.clone(), info.clone());
        Ok(())
    }
}

/// Stores each record as a JSON document under a directory
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open or create the store directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    /// Record file for a key. Keys are URL-safe base64 encoded, so distinct
    /// keys never share a file.
    fn path(&self, key: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.json", URL_SAFE_NO_PAD.encode(key), kind))
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match std::fs::read_to_string(path) {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a sibling temp file so readers never see a torn record
    fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl PoolStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<VmPool>> {
        self.read(&self.path(key, "pool"))
    }

    fn update(&self, pool: &VmPool) -> Result<()> {
        tracing::debug!(pool = %pool.key, "Writing pool record");
        self.write(&self.path(&pool.key, "pool"), pool)
    }
}

impl InfoStore for FileStore {
    fn get_info(&self, key: &str) -> Result<Option<VmPoolInfo>> {
        self.read(&self.path(key, "info"))
    }

    fn update_info(&self, info: &VmPoolInfo) -> Result<()> {
        tracing::debug!(pool = %info.key, action = %info.action, "Writing pool info record");
        self.write(&self.path(&info.key, "info"), info)
    }
}
