//! Vault configuration (§6.3, §6.7): TOML on disk, layered with environment
//! overrides, following this codebase's existing `cli::config` approach of
//! a `#[derive(Serialize, Deserialize)]` struct loaded/saved via `toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_replication_factor() -> usize {
    4
}
fn default_kad_upper_threshold() -> usize {
    3
}
fn default_max_account_amendments() -> usize {
    10_000
}
fn default_max_repeated_account_amendments() -> usize {
    4
}
fn default_account_amendment_timeout() -> String {
    "30s".to_string()
}
fn default_account_amendment_result_timeout() -> String {
    "5m".to_string()
}
fn default_max_chunk_store_retries() -> u32 {
    10
}
fn default_max_load_retries() -> u32 {
    3
}
fn default_min_regular_file_size() -> u64 {
    512
}
fn default_available_space() -> u64 {
    10 * 1024 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_listen_addr() -> String {
    "0.0.0.0:7400".to_string()
}

/// Top-level `vault.toml` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Path to the Ed25519 identity keypair (PKCS#8), as produced by `vaultd init`.
    pub identity_path: PathBuf,

    /// Root directory for the on-disk chunk store.
    pub chunkstore_path: PathBuf,

    /// Address the RPC listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `K` and the amendment-quorum parameters (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_replication_factor")]
    pub k: usize,
    #[serde(default = "default_kad_upper_threshold")]
    pub kad_upper_threshold: usize,
    #[serde(default = "default_max_account_amendments")]
    pub max_account_amendments: usize,
    #[serde(default = "default_max_repeated_account_amendments")]
    pub max_repeated_account_amendments: usize,
    #[serde(default = "default_account_amendment_timeout")]
    pub account_amendment_timeout: String,
    #[serde(default = "default_account_amendment_result_timeout")]
    pub account_amendment_result_timeout: String,
}

impl ReplicationConfig {
    pub fn amendment_timeout(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.account_amendment_timeout)
    }

    pub fn amendment_result_timeout(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.account_amendment_result_timeout)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            k: default_replication_factor(),
            kad_upper_threshold: default_kad_upper_threshold(),
            max_account_amendments: default_max_account_amendments(),
            max_repeated_account_amendments: default_max_repeated_account_amendments(),
            account_amendment_timeout: default_account_amendment_timeout(),
            account_amendment_result_timeout: default_account_amendment_result_timeout(),
        }
    }
}

/// Client-informational retry counts and the small/regular file boundary,
/// plus the chunk-store byte budget (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_chunk_store_retries")]
    pub max_chunk_store_retries: u32,
    #[serde(default = "default_max_load_retries")]
    pub max_load_retries: u32,
    #[serde(default = "default_min_regular_file_size")]
    pub min_regular_file_size: u64,
    #[serde(default = "default_available_space")]
    pub available_space: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_chunk_store_retries: default_max_chunk_store_retries(),
            max_load_retries: default_max_load_retries(),
            min_regular_file_size: default_min_regular_file_size(),
            available_space: default_available_space(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Environment variable overrides, applied after the file loads (§6.7).
const ENV_LISTEN_ADDR: &str = "VAULTD_LISTEN_ADDR";
const ENV_LOG_LEVEL: &str = "VAULTD_LOG_LEVEL";
const ENV_AVAILABLE_SPACE: &str = "VAULTD_AVAILABLE_SPACE";

impl VaultConfig {
    pub fn new(identity_path: PathBuf, chunkstore_path: PathBuf) -> Self {
        Self {
            identity_path,
            chunkstore_path,
            listen_addr: default_listen_addr(),
            replication: ReplicationConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {}", path.display(), e))?;
        let mut config: VaultConfig = toml::from_str(&contents)
            .map_err(|e| format!("failed to parse config file '{}': {}", path.display(), e))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {}", e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create config directory: {}", e))?;
        }
        fs::write(path, contents)
            .map_err(|e| format!("failed to write config file '{}': {}", path.display(), e))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var(ENV_LISTEN_ADDR) {
            self.listen_addr = addr;
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Ok(space) = std::env::var(ENV_AVAILABLE_SPACE) {
            if let Ok(parsed) = space.parse() {
                self.limits.available_space = parsed;
            }
        }
    }

    /// Default location: `~/.local/share/vaultd/vault.toml`, matching this
    /// codebase's existing convention of storing state under `dirs::data_dir`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultd")
            .join("vault.toml")
    }
}
