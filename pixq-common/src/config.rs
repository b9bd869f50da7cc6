//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// TOML configuration file model (`pixq-ingest.toml`)
///
/// All fields are optional in the file; compiled defaults apply last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder for database, uploads and extraction work areas
    pub root_folder: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter: trace, debug, info, warn, error
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

fn default_log_level() -> String {
    "info".to_string()
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional bearer token; when set, mutating endpoints require it
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_token: None,
        }
    }
}

fn default_port() -> u16 {
    5870
}

/// Duplicate-detection scope
///
/// `Process`: one fingerprint index shared by all batches, warmed from
/// previously persisted fingerprints at startup.
/// `Batch`: a fresh index per job, so identical bytes may recur across
/// batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    Process,
    Batch,
}

impl Default for DedupScope {
    fn default() -> Self {
        DedupScope::Process
    }
}

/// Ingest pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Worker threads consuming the job queue
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum queued jobs before enqueue is rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Concurrent items within one job sub-batch
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,
    /// Item attempts before an item is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for storage upload backoff (delay = base * attempt)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Heartbeat age after which a processing item counts as stuck
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: i64,
    /// Interval between steady-state watchdog passes
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Idle lifetime of an unfinished chunked upload session
    #[serde(default = "default_upload_session_ttl_secs")]
    pub upload_session_ttl_secs: i64,
    #[serde(default)]
    pub dedup_scope: DedupScope,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            item_concurrency: default_item_concurrency(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            upload_session_ttl_secs: default_upload_session_ttl_secs(),
            dedup_scope: DedupScope::default(),
        }
    }
}

fn default_workers() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    100
}

fn default_item_concurrency() -> usize {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_stuck_timeout_secs() -> i64 {
    300
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

fn default_upload_session_ttl_secs() -> i64 {
    3600
}

/// Object storage collaborator endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_url")]
    pub base_url: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: default_storage_url(),
            bucket: default_bucket(),
        }
    }
}

fn default_storage_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_bucket() -> String {
    "pixq-images".to_string()
}

/// Reference-data collaborator endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    #[serde(default = "default_reference_url")]
    pub base_url: String,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_reference_url(),
        }
    }
}

fn default_reference_url() -> String {
    "http://localhost:9100".to_string()
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, env_var_name: &str) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(PathBuf::from(path));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        return Ok(PathBuf::from(path));
    }

    // Priority 3: TOML config file
    if let Ok(config_path) = find_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                    return Ok(PathBuf::from(root_folder));
                }
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    Ok(default_root_folder())
}

/// Load the full TOML configuration
///
/// Looks for `pixq-ingest.toml` in the root folder first, then at the OS
/// config location. A missing file yields defaults; a malformed file is an
/// error (silent fallback would hide operator mistakes).
pub fn load_toml_config(root_folder: &Path) -> Result<TomlConfig> {
    let root_candidate = root_folder.join("pixq-ingest.toml");
    let path = if root_candidate.exists() {
        root_candidate
    } else {
        match find_config_file() {
            Ok(p) => p,
            Err(_) => {
                debug!("No TOML config file found, using defaults");
                return Ok(TomlConfig::default());
            }
        }
    };

    let content = std::fs::read_to_string(&path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Find the platform configuration file path
fn find_config_file() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        // Try ~/.config/pixq/pixq-ingest.toml first, then /etc/pixq/pixq-ingest.toml
        let user_config = dirs::config_dir().map(|d| d.join("pixq").join("pixq-ingest.toml"));
        let system_config = PathBuf::from("/etc/pixq/pixq-ingest.toml");

        if let Some(path) = user_config {
            if path.exists() {
                return Ok(path);
            }
        }
        if system_config.exists() {
            return Ok(system_config);
        }
        return Err(Error::Config("No config file found".to_string()));
    }

    let candidate = dirs::config_dir()
        .map(|d| d.join("pixq").join("pixq-ingest.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if candidate.exists() {
        Ok(candidate)
    } else {
        Err(Error::Config(format!(
            "Config file not found: {}",
            candidate.display()
        )))
    }
}

/// OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/pixq (or /var/lib/pixq for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("pixq"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/pixq"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("pixq"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/pixq"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("pixq"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\pixq"))
    } else {
        PathBuf::from("./pixq_data")
    }
}
