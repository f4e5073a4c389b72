//! Configuration structures for StrataDB.

use crate::error::{Result, StrataError};
use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the page store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the data file.
    pub data_path: PathBuf,
    /// Number of frames in the buffer pool.
    pub pool_frames: usize,
    /// K parameter of the LRU-K replacement policy.
    pub replacer_k: usize,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./strata.db"),
            pool_frames: 1024,
            replacer_k: 2,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn pool_size_bytes(&self) -> usize {
        self.pool_frames * PAGE_SIZE
    }

    /// Checks the configuration for invalid parameter combinations.
    pub fn validate(&self) -> Result<()> {
        if self.pool_frames == 0 {
            return Err(StrataError::ConfigError(
                "pool_frames must be > 0".to_string(),
            ));
        }
        if self.replacer_k == 0 {
            return Err(StrataError::ConfigError(
                "replacer_k must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
