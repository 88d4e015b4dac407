use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{Result, SyncError};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub library_dir: PathBuf,
    pub peers: Vec<String>,
    pub node_name: String,
    /// Nodes only replicate with peers announcing the same logical name.
    pub logical_name: String,
    pub rate_log: Option<PathBuf>,
    pub transfer: TransferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            library_dir: PathBuf::from("./library"),
            peers: Vec::new(),
            node_name: "DefaultNode".to_string(),
            logical_name: "default".to_string(),
            rate_log: None,
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            SyncError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.transfer.validate()?;
        Ok(config)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.library_dir.join(crate::storage::STAGING_DIR)
    }
}

/// Tunables for the transfer engine. Durations are stored in milliseconds so the
/// JSON config stays flat.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub block_size: u64,
    pub initial_window: usize,
    pub max_piece_window: usize,
    pub min_block_window: usize,
    pub chunk_timeout_ms: u64,
    pub retry_grace_ms: u64,
    pub decrease_interval_ms: u64,
    pub cooldown_base_ms: u64,
    pub cooldown_max_ms: u64,
    pub increase_retry_base_ms: u64,
    pub increase_retry_max_ms: u64,
    pub timeout_sweep_ms: u64,
    pub rtt_sweep_ms: u64,
    pub congestion_factor: u32,
    pub lock_timeout_ms: u64,
    pub idle_close_ms: u64,
    pub max_upload_peers: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: 16 * 1024,
            initial_window: 4,
            max_piece_window: 16,
            min_block_window: 2,
            chunk_timeout_ms: 1_000,
            retry_grace_ms: 3_000,
            decrease_interval_ms: 3_000,
            cooldown_base_ms: 200,
            cooldown_max_ms: 5_000,
            increase_retry_base_ms: 1_000,
            increase_retry_max_ms: 30_000,
            timeout_sweep_ms: 1_000,
            rtt_sweep_ms: 500,
            congestion_factor: 8,
            lock_timeout_ms: 5_000,
            idle_close_ms: 5_000,
            max_upload_peers: 32,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(SyncError::ConfigError("block_size must be > 0".to_string()));
        }
        if self.min_block_window == 0 || self.initial_window < self.min_block_window {
            return Err(SyncError::ConfigError(format!(
                "initial_window ({}) must be >= min_block_window ({}) > 0",
                self.initial_window, self.min_block_window
            )));
        }
        if self.max_piece_window == 0 {
            return Err(SyncError::ConfigError(
                "max_piece_window must be > 0".to_string(),
            ));
        }
        if self.congestion_factor < 2 {
            return Err(SyncError::ConfigError(
                "congestion_factor must be >= 2".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn retry_grace(&self) -> Duration {
        Duration::from_millis(self.retry_grace_ms)
    }

    pub fn decrease_interval(&self) -> Duration {
        Duration::from_millis(self.decrease_interval_ms)
    }

    pub fn timeout_sweep(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_ms)
    }

    pub fn rtt_sweep(&self) -> Duration {
        Duration::from_millis(self.rtt_sweep_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn idle_close(&self) -> Duration {
        Duration::from_millis(self.idle_close_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"port": 9000, "logical_name": "team", "transfer": {"lock_timeout_ms": 100}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.logical_name, "team");
        assert_eq!(config.transfer.lock_timeout(), Duration::from_millis(100));
        assert_eq!(config.transfer.initial_window, 4);
        assert_eq!(config.transfer.max_piece_window, 16);
    }

    #[test]
    fn test_invalid_window_rejected() {
        let config = TransferConfig {
            initial_window: 1,
            ..TransferConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::ConfigError(_))));
    }
}
