//! Configuration file management.
//!
//! `config.toml` lives in the data directory. Every field has a default, so
//! a missing file or a partial one is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub kx: KxConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
    /// Where completed downloads are assembled. Empty = $data_dir/downloads/.
    #[serde(default)]
    pub downloads_dir: String,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Nick used when a new identity is generated on first start.
    #[serde(default = "default_nick")]
    pub nick: String,
}

/// Key exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KxConfig {
    /// Unfinished handshakes older than this are collected.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Outstanding mediation requests older than this expire.
    #[serde(default = "default_mediation_ttl")]
    pub mediation_ttl_secs: u64,
    /// Period of the expiry sweep and outbox resend.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

/// Payment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    /// Payments per attempt cycle before a subject is marked exhausted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_wallet_check_initial")]
    pub wallet_check_initial_secs: u64,
    #[serde(default = "default_wallet_check_max")]
    pub wallet_check_max_secs: u64,
    /// Chunk invoices at or below this price are paid without asking.
    /// 0 disables automatic payment.
    #[serde(default = "default_max_chunk_price")]
    pub max_chunk_price_milli_atoms: u64,
}

/// Advanced configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log file path. Empty = stderr.
    #[serde(default)]
    pub log_file: String,
}

// Default value functions

fn default_nick() -> String {
    "rvmesh".to_string()
}

fn default_session_ttl() -> u64 {
    3 * 24 * 60 * 60
}

fn default_mediation_ttl() -> u64 {
    24 * 60 * 60
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    rvmesh_payments::DEFAULT_MAX_ATTEMPTS
}

fn default_wallet_check_initial() -> u64 {
    10
}

fn default_wallet_check_max() -> u64 {
    60
}

fn default_max_chunk_price() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            downloads_dir: String::new(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { nick: default_nick() }
    }
}

impl Default for KxConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            mediation_ttl_secs: default_mediation_ttl(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            wallet_check_initial_secs: default_wallet_check_initial(),
            wallet_check_max_secs: default_wallet_check_max(),
            max_chunk_price_milli_atoms: default_max_chunk_price(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: String::new(),
        }
    }
}

impl PaymentsConfig {
    pub fn wallet_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.wallet_check_initial_secs),
            Duration::from_secs(self.wallet_check_max_secs),
        )
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    pub fn downloads_dir(&self) -> PathBuf {
        if self.storage.downloads_dir.is_empty() {
            self.data_dir().join("downloads")
        } else {
            PathBuf::from(&self.storage.downloads_dir)
        }
    }

    /// `EnvFilter` directive for the configured level.
    pub fn log_directive(&self) -> String {
        format!("rvmesh={}", self.advanced.log_level)
    }

    fn config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    /// Platform-specific default data directory.
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("RVMESH_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/rvmesh")
        }
        #[cfg(target_os = "windows")]
        {
            dirs_fallback("rvmesh")
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            dirs_fallback(".rvmesh")
        }
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/rvmesh"))
}
