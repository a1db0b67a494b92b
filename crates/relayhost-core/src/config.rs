//! RelayHost configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Hard upper bound on a dequeue batch.
pub const MAX_BATCH_SIZE: usize = 32;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayHostConfig {
    /// Host identity shared by cooperating processes. Derived from the hostname when absent.
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default)]
    pub blobs: BlobConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,
}

fn default_account() -> String { "default".into() }

impl Default for RelayHostConfig {
    fn default() -> Self {
        Self {
            host_id: None,
            account: default_account(),
            blobs: BlobConfig::default(),
            queues: QueueConfig::default(),
            storage: StorageConfig::default(),
            functions: Vec::new(),
        }
    }
}

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "RELAYHOST_CONFIG";

impl RelayHostConfig {
    /// Config file location: `explicit` (with `~` expanded), else
    /// `$RELAYHOST_CONFIG`, else [`Self::default_path`].
    pub fn resolve_path(explicit: Option<&str>) -> PathBuf {
        let from_env = || std::env::var(CONFIG_ENV).ok().filter(|v| !v.trim().is_empty());
        match explicit.map(str::to_string).or_else(from_env) {
            Some(raw) => PathBuf::from(shellexpand::tilde(&raw).into_owned()),
            None => Self::default_path(),
        }
    }

    /// `~/.relayhost/config.toml`, next to the default database and blob root.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relayhost")
            .join("config.toml")
    }

    /// Read and validate `path`. A missing file is `Ok(None)`.
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RelayError::Config(format!("reading {}: {e}", path.display())));
            }
        };
        match Self::parse(&content) {
            Ok(config) => Ok(Some(config)),
            Err(RelayError::Config(msg)) => {
                Err(RelayError::Config(format!("{}: {msg}", path.display())))
            }
            Err(e) => Err(e),
        }
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RelayError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate, then write as TOML via a sibling temp file renamed into place.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("serializing config: {e}")))?;
        let staging = path.with_extension("toml.partial");
        std::fs::write(&staging, content)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        let q = &self.queues;
        if q.batch_size == 0 || q.batch_size > MAX_BATCH_SIZE {
            return Err(RelayError::Config(format!(
                "queues.batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                q.batch_size
            )));
        }
        if q.max_dequeue_count == 0 {
            return Err(RelayError::Config("queues.max_dequeue_count must be at least 1".into()));
        }
        if q.min_poll_interval_ms == 0 || q.min_poll_interval_ms > q.max_poll_interval_ms {
            return Err(RelayError::Config(
                "queues.min_poll_interval_ms must be positive and not exceed max_poll_interval_ms".into(),
            ));
        }
        if q.retry_base_secs > q.retry_max_secs {
            return Err(RelayError::Config("queues.retry_base_secs exceeds retry_max_secs".into()));
        }
        let b = &self.blobs;
        if b.poll_interval_ms == 0 {
            return Err(RelayError::Config("blobs.poll_interval_ms must be positive".into()));
        }
        if b.lease_renew_interval_secs >= b.lease_duration_secs {
            return Err(RelayError::Config(
                "blobs.lease_renew_interval_secs must be shorter than lease_duration_secs".into(),
            ));
        }
        for f in &self.functions {
            match (&f.blob_path, &f.queue) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(RelayError::Config(format!(
                        "function '{}' needs exactly one of blob_path or queue",
                        f.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Host id from config, or derived from the machine hostname.
    pub fn resolve_host_id(&self) -> String {
        match &self.host_id {
            Some(id) if !id.trim().is_empty() => sanitize_host_id(id),
            _ => {
                let name = hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "localhost".into());
                sanitize_host_id(&name)
            }
        }
    }
}

/// Lower-case, `[a-z0-9-]` only, at most 32 characters. Queue names derive from it.
pub fn sanitize_host_id(raw: &str) -> String {
    let id: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(32)
        .collect();
    let id = id.trim_matches('-').to_string();
    if id.is_empty() { "host".into() } else { id }
}

/// Blob polling and receipt leasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    #[serde(default = "default_blob_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_list_retry_attempts")]
    pub list_retry_attempts: u32,
    #[serde(default = "default_list_retry_base_ms")]
    pub list_retry_base_ms: u64,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_lease_renew_interval_secs")]
    pub lease_renew_interval_secs: u64,
}

fn default_blob_poll_interval_ms() -> u64 { 10_000 }
fn default_list_retry_attempts() -> u32 { 3 }
fn default_list_retry_base_ms() -> u64 { 200 }
fn default_lease_duration_secs() -> u64 { 30 }
fn default_lease_renew_interval_secs() -> u64 { 10 }

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_blob_poll_interval_ms(),
            list_retry_attempts: default_list_retry_attempts(),
            list_retry_base_ms: default_list_retry_base_ms(),
            lease_duration_secs: default_lease_duration_secs(),
            lease_renew_interval_secs: default_lease_renew_interval_secs(),
        }
    }
}

impl BlobConfig {
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
    pub fn list_retry_base(&self) -> Duration { Duration::from_millis(self.list_retry_base_ms) }
    pub fn lease_duration(&self) -> Duration { Duration::from_secs(self.lease_duration_secs) }
    pub fn lease_renew_interval(&self) -> Duration { Duration::from_secs(self.lease_renew_interval_secs) }
}

/// Queue draining, retry and poison policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
    #[serde(default = "default_poison_queue_suffix")]
    pub poison_queue_suffix: String,
    #[serde(default = "bool_true")]
    pub fast_path: bool,
}

fn bool_true() -> bool { true }
fn default_batch_size() -> usize { 16 }
fn default_max_dequeue_count() -> u32 { 5 }
fn default_min_poll_interval_ms() -> u64 { 100 }
fn default_max_poll_interval_ms() -> u64 { 60_000 }
fn default_visibility_timeout_secs() -> u64 { 600 }
fn default_retry_base_secs() -> u64 { 1 }
fn default_retry_max_secs() -> u64 { 600 }
fn default_poison_queue_suffix() -> String { "-poison".into() }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_dequeue_count: default_max_dequeue_count(),
            min_poll_interval_ms: default_min_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
            poison_queue_suffix: default_poison_queue_suffix(),
            fast_path: true,
        }
    }
}

impl QueueConfig {
    pub fn min_poll_interval(&self) -> Duration { Duration::from_millis(self.min_poll_interval_ms) }
    pub fn max_poll_interval(&self) -> Duration { Duration::from_millis(self.max_poll_interval_ms) }
    pub fn visibility_timeout(&self) -> Duration { Duration::from_secs(self.visibility_timeout_secs) }
    pub fn retry_base(&self) -> Duration { Duration::from_secs(self.retry_base_secs) }
    pub fn retry_max(&self) -> Duration { Duration::from_secs(self.retry_max_secs) }

    /// Dead-letter queue for `queue`.
    pub fn poison_queue_name(&self, queue: &str) -> String {
        format!("{queue}{}", self.poison_queue_suffix)
    }
}

/// Which storage backend the binary wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local; receipts do not survive restarts.
    Memory,
    /// SQLite file shared by cooperating processes.
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_blob_root")]
    pub blob_root: String,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
}

fn default_backend() -> StorageBackend { StorageBackend::Sqlite }
fn default_database_path() -> String { "~/.relayhost/relay.db".into() }
fn default_blob_root() -> String { "~/.relayhost/blobs".into() }
fn default_list_page_size() -> usize { 500 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_path: default_database_path(),
            blob_root: default_blob_root(),
            list_page_size: default_list_page_size(),
        }
    }
}

impl StorageConfig {
    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Blob root with `~` expanded.
    pub fn blob_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.blob_root).to_string())
    }
}

/// A function hosted by the binary: one trigger plus a shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub id: String,
    #[serde(default)]
    pub blob_path: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    pub command: String,
}
