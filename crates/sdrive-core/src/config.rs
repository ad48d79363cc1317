use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from sdrive.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SdriveConfig {
    pub transfer: TransferConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl SdriveConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("parsing config: {e}"))
    }
}

/// Block transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Target plaintext block size in bytes (default: 4 MiB)
    pub block_size: usize,
    /// Blocks requested per listing page (default: 10)
    pub block_page_size: u32,
    /// Concurrent block pipelines per direction (0 = min(cpus/2, 10))
    pub max_block_transfers: usize,
    /// Capacity of the block listing/creation pools (0 = derived from transfers)
    pub max_block_processing: usize,
    /// Client identity used to resume our own drafts (random when unset)
    pub client_id: Option<String>,
}

pub const DEFAULT_BLOCK_SIZE: usize = 1 << 22;
pub const DEFAULT_BLOCK_PAGE_SIZE: u32 = 10;
const MAX_AUTO_BLOCK_TRANSFERS: usize = 10;

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_page_size: DEFAULT_BLOCK_PAGE_SIZE,
            max_block_transfers: 0,
            max_block_processing: 0,
            client_id: None,
        }
    }
}

impl TransferConfig {
    /// Size of the per-direction block-transfer pool.
    pub fn effective_block_transfers(&self) -> usize {
        if self.max_block_transfers > 0 {
            return self.max_block_transfers;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cpus / 2).clamp(1, MAX_AUTO_BLOCK_TRANSFERS)
    }

    /// Size of the block listing/creation pools.
    pub fn effective_block_processing(&self) -> usize {
        if self.max_block_processing > 0 {
            return self.max_block_processing;
        }
        let transfers = self.effective_block_transfers();
        transfers + (transfers / 2).clamp(2, 4)
    }

    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Blob storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "memory", "fs" or "s3"
    pub backend: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Enforce HTTPS for S3 connections
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            root: PathBuf::from("~/.local/share/sdrive/blobs"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "sdrive".into(),
            enforce_tls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
