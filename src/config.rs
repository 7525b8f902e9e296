use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::bundle::{ArchiveFormat, MemberMode};

/// Agent configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Where the source collections live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Ceiling for the digest attestation fetch, which can take far longer
    /// than any other store call on large collections.
    #[serde(default = "default_checksum_timeout_secs")]
    pub checksum_timeout_secs: u64,
}

/// The repository service deposits land in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub base_url: String,
    pub api_token: String,
    /// Namespace for phase markers and the recorded persistent identifier.
    #[serde(default = "default_repository")]
    pub repository: String,
    /// Timeout for small control requests. Uploads deliberately run without
    /// one.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub mailer_url: Option<String>,
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default)]
    pub submit_for_review: bool,
    #[serde(default)]
    pub send_confirmation: bool,
}

/// How the deposit is shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Read block size while bundling, in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl BundleConfig {
    pub fn archive_format(&self) -> crate::Result<ArchiveFormat> {
        self.format.parse()
    }

    pub fn member_mode(&self) -> crate::Result<MemberMode> {
        self.compression.parse()
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            compression: default_compression(),
            block_size: default_block_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// How long the success marker stays visible before clearing itself.
    #[serde(default = "default_exported_grace_secs")]
    pub exported_grace_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            exported_grace_secs: default_exported_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.bundle.archive_format()?;
        self.bundle.member_mode()?;
        if self.destination.base_url.is_empty() {
            anyhow::bail!("destination.base_url must not be empty");
        }
        Ok(())
    }
}

fn default_checksum_timeout_secs() -> u64 {
    1200
}

fn default_repository() -> String {
    "Dataverse".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_format() -> String {
    "zip".to_string()
}

fn default_compression() -> String {
    "deflate".to_string()
}

fn default_block_size() -> usize {
    4 * 1024 * 1024
}

fn default_exported_grace_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}
