//! Configuration for the sync engine

use folio_common::Notebook;
use folio_config::Config;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for a sync session
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local notebook identity
    pub notebook: Notebook,

    /// WebSocket relay server URL
    pub relay_url: String,

    /// Credential presented with AUTHENTICATION and to the directory
    pub auth_token: Option<String>,

    /// Maximum bytes of message text per relay frame
    pub relay_frame_limit: usize,

    /// Bound on the PENDING phase of a relay connect
    pub connect_timeout: Option<Duration>,

    /// Whether direct peer channels are attempted at all
    pub peer_enabled: bool,

    /// Listen address for offered direct channels
    pub peer_bind: String,

    /// Host advertised in offer candidates
    pub peer_advertise_host: Option<String>,

    /// Maximum bytes of message text per peer frame
    pub peer_frame_limit: usize,

    /// Offer to CONNECTED must finish within this
    pub negotiation_timeout: Duration,

    /// Incomplete chunk buffers are dropped after this
    pub chunk_ttl: Duration,

    /// Largest `total` a chunk frame may announce
    pub max_chunks: usize,

    /// Page directory HTTP endpoint
    pub directory_endpoint: String,

    /// Where binary page states are persisted
    pub storage_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            notebook: Notebook::new(1, "default"),
            relay_url: "ws://localhost:3003".to_string(),
            auth_token: None,
            relay_frame_limit: 32_000,
            connect_timeout: None,
            peer_enabled: true,
            peer_bind: "127.0.0.1:0".to_string(),
            peer_advertise_host: None,
            peer_frame_limit: 16_000,
            negotiation_timeout: Duration::from_secs(30),
            chunk_ttl: Duration::from_secs(300),
            max_chunks: 4096,
            directory_endpoint: "http://localhost:3003".to_string(),
            storage_dir: PathBuf::from(".folio/pages"),
        }
    }
}

impl SyncConfig {
    /// Build from a loaded workspace config
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let notebook = config
            .notebook()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        let sync = Self {
            notebook,
            relay_url: config.relay.url.clone(),
            auth_token: config.directory.token.clone(),
            relay_frame_limit: config.relay.frame_limit,
            connect_timeout: config.relay.connect_timeout_ms.map(Duration::from_millis),
            peer_enabled: config.peer.enabled,
            peer_bind: config.peer.bind.clone(),
            peer_advertise_host: config.peer.advertise_host.clone(),
            peer_frame_limit: config.peer.frame_limit,
            negotiation_timeout: Duration::from_millis(config.peer.negotiation_timeout_ms),
            chunk_ttl: Duration::from_secs(config.framing.chunk_ttl_secs),
            max_chunks: config.framing.max_chunks,
            directory_endpoint: config.directory.endpoint.clone(),
            storage_dir: config.storage_dir(),
        };
        sync.validate()?;
        Ok(sync)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.notebook.workspace.is_empty() {
            anyhow::bail!("notebook workspace cannot be empty");
        }
        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            anyhow::bail!("relay_url must start with ws:// or wss://");
        }
        if !self.directory_endpoint.starts_with("http://")
            && !self.directory_endpoint.starts_with("https://")
        {
            anyhow::bail!("directory endpoint must start with http:// or https://");
        }
        // a single char may take four bytes
        if self.relay_frame_limit < 4 || self.peer_frame_limit < 4 {
            anyhow::bail!("frame limits must be at least 4 bytes");
        }
        if self.max_chunks == 0 {
            anyhow::bail!("max_chunks must be positive");
        }
        if self.negotiation_timeout.is_zero() {
            anyhow::bail!("negotiation timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_carries_sections() {
        let mut config = Config::parse(
            r#"
            [notebook]
            app = 3
            workspace = "lab"

            [relay]
            url = "wss://relay.example.dev"
            frame_limit = 1000
            connect_timeout_ms = 2500

            [peer]
            enabled = false
            "#,
        )
        .unwrap();
        config.root = PathBuf::from("/work");

        let sync = SyncConfig::from_config(&config).unwrap();
        assert_eq!(sync.notebook, Notebook::new(3, "lab"));
        assert_eq!(sync.relay_frame_limit, 1000);
        assert_eq!(sync.connect_timeout, Some(Duration::from_millis(2500)));
        assert!(!sync.peer_enabled);
        assert_eq!(sync.storage_dir, PathBuf::from("/work/.folio/pages"));
    }

    #[test]
    fn test_validate_rejects_bad_relay_url() {
        let config = SyncConfig {
            relay_url: "http://relay".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_frames() {
        let config = SyncConfig {
            peer_frame_limit: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_max_chunks() {
        let config = SyncConfig {
            max_chunks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_workspace_fails() {
        assert!(SyncConfig::from_config(&Config::default()).is_err());
    }
}
