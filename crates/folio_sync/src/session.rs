//! Sync session orchestration

use crate::config::SyncConfig;
use crate::directory::Directory;
use crate::envelope::operation;
use crate::events::{EventBus, LogEvent};
use crate::host::PageHost;
use crate::peer::PeerConnections;
use crate::protocol::SharedPages;
use crate::relay::{ConnectionStatus, RelayChannel};
use crate::router::Router;
use crate::store::PageStore;
use crate::util::lock;
use crate::Result;
use folio_common::Notebook;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Collaborators a session is built from
pub struct SessionDeps {
    pub directory: Arc<dyn Directory>,
    pub store: Arc<dyn PageStore>,
    pub host: Arc<dyn PageHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub notebook: Notebook,
    pub relay: ConnectionStatus,
    pub peers: Vec<Notebook>,
    pub shared_pages: usize,
    pub broken_pages: Vec<String>,
}

/// Main sync session: one notebook's relay, peers, router, and shared pages
pub struct SyncSession {
    config: SyncConfig,
    events: EventBus,
    relay: RelayChannel,
    peers: PeerConnections,
    router: Router,
    pages: SharedPages,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    /// Wire up every component and restore persisted links. Does not
    /// connect; call [`SyncSession::connect`] for that.
    pub async fn init(config: SyncConfig, deps: SessionDeps) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let relay = RelayChannel::new(
            &config,
            deps.directory.clone(),
            inbound_tx.clone(),
            events.clone(),
        );
        let peers = PeerConnections::new(&config, relay.clone(), inbound_tx, events.clone());
        let router = Router::new(relay.clone(), peers.clone(), events.clone());
        let pages = SharedPages::new(
            config.notebook.clone(),
            router.clone(),
            deps.directory,
            deps.store,
            deps.host,
            events.clone(),
        );

        pages.restore().await?;
        peers.register_handlers(&router);
        pages.register_handlers(&router);
        let dispatch = router.run(inbound_rx);

        tracing::info!("Sync session ready for {}", config.notebook);
        Ok(Self {
            config,
            events,
            relay,
            peers,
            router,
            pages,
            dispatch: Mutex::new(Some(dispatch)),
        })
    }

    /// Connect to the relay and replay any backlog
    pub async fn connect(&self) -> Result<()> {
        self.relay.connect().await
    }

    /// Start negotiating a direct channel to `target`
    pub async fn connect_peer(&self, target: &Notebook) -> Result<()> {
        self.peers.connect(target).await
    }

    /// Close the direct channel to `target`; later sends use the relay
    pub fn disconnect_peer(&self, target: &Notebook) -> bool {
        self.peers.disconnect(target)
    }

    /// Close the relay; shared state stays in place for a later connect
    pub fn disconnect(&self) {
        self.relay.disconnect();
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            notebook: self.config.notebook.clone(),
            relay: self.relay.status(),
            peers: self.peers.connected(),
            shared_pages: self.pages.links().len(),
            broken_pages: self.pages.broken_pages(),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    pub fn notebook(&self) -> &Notebook {
        &self.config.notebook
    }

    pub fn pages(&self) -> &SharedPages {
        &self.pages
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn relay(&self) -> &RelayChannel {
        &self.relay
    }

    pub fn peers(&self) -> &PeerConnections {
        &self.peers
    }

    /// Close every transport and stop dispatching
    pub async fn shutdown(&self) {
        for op in [
            operation::OFFER,
            operation::ANSWER,
            operation::SHARE_PAGE,
            operation::SHARE_PAGE_RESPONSE,
            operation::SHARE_PAGE_UPDATE,
            operation::SHARE_PAGE_FORCE,
        ] {
            self.router.unregister(op);
        }
        self.peers.shutdown();
        self.relay.disconnect();

        let handle = lock(&self.dispatch).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        tracing::info!("Sync session for {} shut down", self.config.notebook);
    }
}
