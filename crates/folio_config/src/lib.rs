//! Configuration management for Folio
//!
//! This crate handles loading and validating `.folio/config.toml`

use folio_common::{FolioError, Notebook, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Workspace root path (set programmatically, not in TOML)
    #[serde(skip)]
    pub root: PathBuf,

    /// Notebook identity
    #[serde(default)]
    pub notebook: NotebookConfig,

    /// Backend relay settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Direct peer connection settings
    #[serde(default)]
    pub peer: PeerConfig,

    /// Chunked framing settings
    #[serde(default)]
    pub framing: FramingConfig,

    /// Backend page directory settings
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Local persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Notebook identity ([notebook])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookConfig {
    #[serde(default = "default_app")]
    pub app: u16,

    #[serde(default)]
    pub workspace: String,
}

fn default_app() -> u16 {
    1
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self {
            app: default_app(),
            workspace: String::new(),
        }
    }
}

/// Relay configuration ([relay])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,

    /// Maximum bytes of message text per frame
    #[serde(default = "default_relay_frame_limit")]
    pub frame_limit: usize,

    /// Upper bound on the PENDING phase; absent means wait indefinitely
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

fn default_relay_url() -> String {
    "ws://localhost:3003".to_string()
}
fn default_relay_frame_limit() -> usize {
    32_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            frame_limit: default_relay_frame_limit(),
            connect_timeout_ms: None,
        }
    }
}

/// Peer connection configuration ([peer])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_peer_bind")]
    pub bind: String,

    /// Host placed in offered candidates instead of the bound address
    #[serde(default)]
    pub advertise_host: Option<String>,

    #[serde(default = "default_peer_frame_limit")]
    pub frame_limit: usize,

    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_peer_bind() -> String {
    "127.0.0.1:0".to_string()
}
fn default_peer_frame_limit() -> usize {
    16_000
}
fn default_negotiation_timeout() -> u64 {
    30_000
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_peer_bind(),
            advertise_host: None,
            frame_limit: default_peer_frame_limit(),
            negotiation_timeout_ms: default_negotiation_timeout(),
        }
    }
}

/// Framing configuration ([framing])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Incomplete chunk buffers older than this are dropped
    #[serde(default = "default_chunk_ttl")]
    pub chunk_ttl_secs: u64,

    /// Frames announcing more chunks than this are dropped
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

fn default_chunk_ttl() -> u64 {
    300
}

fn default_max_chunks() -> usize {
    4096
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            chunk_ttl_secs: default_chunk_ttl(),
            max_chunks: default_max_chunks(),
        }
    }
}

/// Directory configuration ([directory])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_directory_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub token: Option<String>,
}

fn default_directory_endpoint() -> String {
    "http://localhost:3003".to_string()
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_directory_endpoint(),
            token: None,
        }
    }
}

/// Storage configuration ([storage])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".folio/pages")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

impl Config {
    /// Load configuration from workspace root
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let config_path = workspace_root.join(".folio/config.toml");

        if !config_path.exists() {
            return Ok(Self {
                root: workspace_root.to_path_buf(),
                ..Self::default()
            });
        }

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| FolioError::ConfigError(format!("Failed to read config: {}", e)))?;

        let mut config = Self::parse(&content)?;
        config.root = workspace_root.to_path_buf();
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FolioError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// The notebook identity this workspace runs as
    pub fn notebook(&self) -> Result<Notebook> {
        if self.notebook.workspace.is_empty() {
            return Err(FolioError::ConfigError(
                "notebook.workspace cannot be empty".to_string(),
            ));
        }
        Ok(Notebook::new(self.notebook.app, self.notebook.workspace.clone()))
    }

    /// Storage directory resolved against the workspace root
    pub fn storage_dir(&self) -> PathBuf {
        if self.storage.dir.is_absolute() {
            self.storage.dir.clone()
        } else {
            self.root.join(&self.storage.dir)
        }
    }
}
