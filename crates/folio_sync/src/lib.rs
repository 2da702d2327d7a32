//! # Folio Sync Engine
//!
//! Keeps a page shared between independent notebooks convergent.
//!
//! ## Architecture
//!
//! - **CRDT**: automerge-rs documents holding annotated text ([`doc`])
//! - **Relay**: authenticated WebSocket channel to the backend broker ([`relay`])
//! - **Peers**: direct notebook-to-notebook channels negotiated over the relay ([`peer`])
//! - **Framing**: oversized messages split into chunk frames ([`framing`])
//! - **Router**: operation dispatch and transport choice ([`router`])
//! - **Protocol**: share / invite / accept / update / force / disconnect ([`protocol`])
//!
//! ## Usage
//!
//! ```rust,no_run
//! use folio_sync::{MemoryHost, MemoryPageStore, HttpDirectory, SessionDeps, SyncConfig, SyncSession};
//! use folio_common::Notebook;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> folio_sync::Result<()> {
//!     let config = SyncConfig {
//!         notebook: Notebook::new(1, "home"),
//!         relay_url: "ws://localhost:3003".to_string(),
//!         ..Default::default()
//!     };
//!     let deps = SessionDeps {
//!         directory: Arc::new(HttpDirectory::new(&config)?),
//!         store: Arc::new(MemoryPageStore::new()),
//!         host: Arc::new(MemoryHost::new()),
//!     };
//!
//!     let session = SyncSession::init(config, deps).await?;
//!     session.connect().await?;
//!     session.pages().init_page("page-1").await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod directory;
pub mod doc;
pub mod envelope;
pub mod events;
pub mod framing;
pub mod host;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod session;
pub mod store;
mod util;

pub use config::SyncConfig;
pub use directory::{Directory, HttpDirectory, InitResponse, JoinResponse};
pub use doc::SharedDocument;
pub use envelope::{operation, Envelope};
pub use events::{EventBus, LogEvent, Severity};
pub use framing::{ChunkAssembler, ChunkFrame};
pub use host::{MemoryHost, PageHost};
pub use peer::{PeerConnections, PeerStatus, SignalPayload};
pub use protocol::{PendingInvitation, SharedPages};
pub use relay::{ConnectionStatus, RelayChannel};
pub use router::{Incoming, Router, Via};
pub use session::{SessionDeps, SessionStatus, SyncSession};
pub use store::{FsPageStore, MemoryPageStore, PageLink, PageStore};

/// Common result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Not connected")]
    NotConnected,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Peer negotiation failed: {0}")]
    NegotiationError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Directory error: {0}")]
    DirectoryError(String),

    #[error("Unknown shared page: {0}")]
    UnknownPage(String),

    #[error("CRDT operation failed: {0}")]
    CrdtError(#[from] automerge::AutomergeError),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Text model error: {0}")]
    TextError(#[from] folio_text::TextError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    DecodeError(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocketError(Box::new(e))
    }
}

impl SyncError {
    /// Transport-level failures never end the session; the caller falls back
    /// to the other transport or waits for a manual reconnect.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::TransportError(_)
                | SyncError::WebSocketError(_)
                | SyncError::NotConnected
                | SyncError::Timeout(_)
                | SyncError::NegotiationError(_)
                | SyncError::HttpError(_)
        )
    }
}
