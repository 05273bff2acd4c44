//! Configuration for the outbox store

use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::store::OutboxStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process memory; lost on restart
    #[default]
    Memory,
    /// RocksDB under `data_dir` (requires the `rocksdb` feature)
    Rocksdb,
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Storage backend
    pub backend: Backend,

    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// RocksDB tuning
    pub rocksdb: RocksDbConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            data_dir: PathBuf::from("./data/ledger"),
            rocksdb: RocksDbConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync the WAL on every commit
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_background_jobs: 2,
            sync_writes: true,
        }
    }
}

impl LedgerConfig {
    /// Open the configured backend
    pub fn open(&self) -> Result<Arc<dyn OutboxStore>> {
        match self.backend {
            Backend::Memory => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "rocksdb")]
            Backend::Rocksdb => Ok(Arc::new(crate::rocks::RocksStore::open(self)?)),
            #[cfg(not(feature = "rocksdb"))]
            Backend::Rocksdb => Err(Error::Config(
                "ledger-core was built without the `rocksdb` feature".to_string(),
            )),
        }
    }

    /// Reject impossible values
    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::Rocksdb && self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("ledger.data_dir must be set".to_string()));
        }
        if self.rocksdb.write_buffer_size_mb == 0 {
            return Err(Error::Config(
                "ledger.rocksdb.write_buffer_size_mb must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
