//! Loopback backend for integration tests: a WebSocket broker plus an
//! in-memory page directory sharing one state.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use folio_common::Notebook;
use folio_sync::directory::{Directory, InitResponse, JoinResponse};
use folio_sync::envelope::{encode_frames, operation, read_frame, Envelope};
use folio_sync::relay::{AuthenticationRequest, AuthenticationResponse, ProxyRequest};
use folio_sync::{
    ChunkAssembler, LogEvent, MemoryHost, MemoryPageStore, SessionDeps, SharedDocument,
    SyncConfig, SyncError, SyncSession,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

struct PageRecord {
    state: Vec<u8>,
    links: HashMap<Notebook, String>,
}

#[derive(Default)]
struct BackendState {
    clients: HashMap<Notebook, mpsc::UnboundedSender<Message>>,
    rejected: HashSet<Notebook>,
    backlog: HashMap<Notebook, Vec<String>>,
    messages: HashMap<String, Envelope>,
    pages: HashMap<String, PageRecord>,
    versions: HashMap<(Notebook, String), String>,
    proxied: usize,
    failing_updates: usize,
}

impl BackendState {
    /// Push to an online notebook or park the message in its backlog
    fn deliver(&mut self, target: &Notebook, envelope: Envelope) {
        if let Some(tx) = self.clients.get(target) {
            let frames = encode_frames(&envelope, 1024).unwrap();
            if frames
                .into_iter()
                .all(|frame| tx.send(Message::Text(frame)).is_ok())
            {
                return;
            }
        }
        if envelope.ephemeral {
            return;
        }
        let uuid = Uuid::new_v4().to_string();
        self.messages.insert(uuid.clone(), envelope);
        self.backlog.entry(target.clone()).or_default().push(uuid);
    }

    fn page_of(&self, notebook: &Notebook, notebook_page_id: &str) -> Option<String> {
        self.pages
            .iter()
            .find(|(_, page)| page.links.get(notebook).map(String::as_str) == Some(notebook_page_id))
            .map(|(uuid, _)| uuid.clone())
    }
}

#[derive(Clone)]
pub struct TestBackend {
    state: Arc<Mutex<BackendState>>,
    pub url: String,
}

fn lock(state: &Mutex<BackendState>) -> MutexGuard<'_, BackendState> {
    state.lock().unwrap()
}

impl TestBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(BackendState::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(accept_state.clone(), socket));
            }
        });

        Self { state, url }
    }

    pub fn directory(&self, notebook: &Notebook) -> Arc<dyn Directory> {
        Arc::new(BackendDirectory {
            state: self.state.clone(),
            notebook: notebook.clone(),
        })
    }

    /// Make the next `n` page updates fail before they reach the backend
    pub fn fail_updates(&self, n: usize) {
        lock(&self.state).failing_updates = n;
    }

    pub fn reject(&self, notebook: &Notebook) {
        lock(&self.state).rejected.insert(notebook.clone());
    }

    pub fn is_online(&self, notebook: &Notebook) -> bool {
        lock(&self.state).clients.contains_key(notebook)
    }

    pub fn proxied(&self) -> usize {
        lock(&self.state).proxied
    }

    pub fn backlog_len(&self, notebook: &Notebook) -> usize {
        lock(&self.state)
            .backlog
            .get(notebook)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_linked(&self, page_uuid: &str, notebook: &Notebook) -> bool {
        lock(&self.state)
            .pages
            .get(page_uuid)
            .map(|page| page.links.contains_key(notebook))
            .unwrap_or(false)
    }

    pub fn page_count(&self) -> usize {
        lock(&self.state).pages.len()
    }

    pub fn stored_state(&self, page_uuid: &str) -> Option<Vec<u8>> {
        lock(&self.state).pages.get(page_uuid).map(|p| p.state.clone())
    }

    pub fn version(&self, notebook: &Notebook, notebook_page_id: &str) -> Option<String> {
        lock(&self.state)
            .versions
            .get(&(notebook.clone(), notebook_page_id.to_string()))
            .cloned()
    }
}

async fn serve(state: Arc<Mutex<BackendState>>, socket: TcpStream) {
    let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut assembler = ChunkAssembler::new(Duration::from_secs(60));
    let mut me: Option<Notebook> = None;

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(Some(envelope)) = read_frame(&text, &mut assembler) else {
            continue;
        };

        match envelope.operation.as_str() {
            operation::AUTHENTICATION => {
                let request: AuthenticationRequest = envelope.payload().unwrap();
                let response = {
                    let mut state = lock(&state);
                    if state.rejected.contains(&request.notebook) {
                        AuthenticationResponse {
                            success: false,
                            messages: vec![],
                            reason: Some("unknown notebook".into()),
                        }
                    } else {
                        state.clients.insert(request.notebook.clone(), tx.clone());
                        me = Some(request.notebook.clone());
                        AuthenticationResponse {
                            success: true,
                            messages: state.backlog.remove(&request.notebook).unwrap_or_default(),
                            reason: None,
                        }
                    }
                };
                let reply = Envelope::new(operation::AUTHENTICATION, response).unwrap();
                for frame in encode_frames(&reply, 1024).unwrap() {
                    let _ = tx.send(Message::Text(frame));
                }
            }
            operation::PROXY => {
                let Some(source) = me.clone() else {
                    continue;
                };
                let request: ProxyRequest = envelope.payload().unwrap();
                let target = request.target.clone();
                let mut state = lock(&state);
                state.proxied += 1;
                state.deliver(&target, request.into_delivery(source));
            }
            _ => {}
        }
    }

    if let Some(notebook) = me {
        let mut state = lock(&state);
        if state
            .clients
            .get(&notebook)
            .map(|current| current.same_channel(&tx))
            .unwrap_or(false)
        {
            state.clients.remove(&notebook);
        }
    }
}

pub struct BackendDirectory {
    state: Arc<Mutex<BackendState>>,
    notebook: Notebook,
}

#[async_trait]
impl Directory for BackendDirectory {
    async fn init_shared_page(&self, notebook_page_id: &str, state: &[u8]) -> folio_sync::Result<InitResponse> {
        let mut backend = lock(&self.state);
        if let Some(id) = backend.page_of(&self.notebook, notebook_page_id) {
            return Ok(InitResponse { id, created: false });
        }

        let id = Uuid::new_v4().to_string();
        let mut links = HashMap::new();
        links.insert(self.notebook.clone(), notebook_page_id.to_string());
        backend.pages.insert(
            id.clone(),
            PageRecord {
                state: state.to_vec(),
                links,
            },
        );
        Ok(InitResponse { id, created: true })
    }

    async fn join_shared_page(&self, notebook_page_id: &str, page_uuid: &str) -> folio_sync::Result<JoinResponse> {
        let mut backend = lock(&self.state);
        let page = backend
            .pages
            .get_mut(page_uuid)
            .ok_or_else(|| SyncError::DirectoryError(format!("no page {}", page_uuid)))?;
        let link_created = page
            .links
            .insert(self.notebook.clone(), notebook_page_id.to_string())
            .is_none();
        Ok(JoinResponse {
            state: page.state.clone(),
            link_created,
            notebook_page_id: notebook_page_id.to_string(),
        })
    }

    async fn update_shared_page(
        &self,
        notebook_page_id: &str,
        changes: &[Vec<u8>],
        _state: &[u8],
    ) -> folio_sync::Result<()> {
        let mut backend = lock(&self.state);
        if backend.failing_updates > 0 {
            backend.failing_updates -= 1;
            return Err(SyncError::DirectoryError("directory unavailable".to_string()));
        }
        let uuid = backend
            .page_of(&self.notebook, notebook_page_id)
            .ok_or_else(|| SyncError::DirectoryError(format!("{} is not shared", notebook_page_id)))?;

        let targets: Vec<(Notebook, String)> = {
            let page = backend.pages.get_mut(&uuid).unwrap();
            let mut doc = SharedDocument::load(&Notebook::new(0, "backend"), &page.state)?;
            doc.apply_changes(changes)?;
            page.state = doc.save();
            page.links
                .iter()
                .filter(|(notebook, _)| **notebook != self.notebook)
                .map(|(notebook, id)| (notebook.clone(), id.clone()))
                .collect()
        };

        let encoded: Vec<String> = changes.iter().map(|c| STANDARD.encode(c)).collect();
        for (target, page_id) in targets {
            let update = Envelope::new(
                operation::SHARE_PAGE_UPDATE,
                json!({ "changes": encoded, "notebookPageId": page_id }),
            )?
            .with_source(self.notebook.clone());
            backend.deliver(&target, update);
        }
        Ok(())
    }

    async fn disconnect_shared_page(&self, notebook_page_id: &str) -> folio_sync::Result<()> {
        let mut backend = lock(&self.state);
        if let Some(uuid) = backend.page_of(&self.notebook, notebook_page_id) {
            if let Some(page) = backend.pages.get_mut(&uuid) {
                page.links.remove(&self.notebook);
            }
        }
        Ok(())
    }

    async fn list_shared_pages(&self) -> folio_sync::Result<Vec<String>> {
        let backend = lock(&self.state);
        let mut ids: Vec<String> = backend
            .pages
            .values()
            .filter_map(|page| page.links.get(&self.notebook).cloned())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_page_version(&self, notebook_page_id: &str, version: &str) -> folio_sync::Result<()> {
        lock(&self.state).versions.insert(
            (self.notebook.clone(), notebook_page_id.to_string()),
            version.to_string(),
        );
        Ok(())
    }

    async fn relink_shared_page(&self, old_page_id: &str, new_page_id: &str) -> folio_sync::Result<()> {
        let mut backend = lock(&self.state);
        let uuid = backend
            .page_of(&self.notebook, old_page_id)
            .ok_or_else(|| SyncError::DirectoryError(format!("{} is not shared", old_page_id)))?;
        if let Some(page) = backend.pages.get_mut(&uuid) {
            page.links.insert(self.notebook.clone(), new_page_id.to_string());
        }
        Ok(())
    }

    async fn get_message(&self, message_uuid: &str) -> folio_sync::Result<Envelope> {
        lock(&self.state)
            .messages
            .remove(message_uuid)
            .ok_or_else(|| SyncError::DirectoryError(format!("no message {}", message_uuid)))
    }
}

/// One notebook wired to the test backend with in-memory host and store
pub struct Node {
    pub notebook: Notebook,
    pub session: SyncSession,
    pub host: Arc<MemoryHost>,
    pub store: Arc<MemoryPageStore>,
}

pub fn config_for(backend: &TestBackend, notebook: &Notebook) -> SyncConfig {
    SyncConfig {
        notebook: notebook.clone(),
        relay_url: backend.url.clone(),
        connect_timeout: Some(Duration::from_secs(5)),
        negotiation_timeout: Duration::from_secs(5),
        // small frames so real messages exercise chunking
        relay_frame_limit: 256,
        peer_frame_limit: 128,
        ..Default::default()
    }
}

pub async fn node(backend: &TestBackend, workspace: &str) -> Node {
    node_with(backend, workspace, |_| {}).await
}

pub async fn node_with(
    backend: &TestBackend,
    workspace: &str,
    adjust: impl FnOnce(&mut SyncConfig),
) -> Node {
    folio_test_helpers::logging::init_test_logging("warn");
    let notebook = Notebook::new(1, workspace);
    let mut config = config_for(backend, &notebook);
    adjust(&mut config);

    let host = Arc::new(MemoryHost::new());
    let store = Arc::new(MemoryPageStore::new());
    let session = SyncSession::init(
        config,
        SessionDeps {
            directory: backend.directory(&notebook),
            store: store.clone(),
            host: host.clone(),
        },
    )
    .await
    .unwrap();

    Node {
        notebook,
        session,
        host,
        store,
    }
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Next event with the given id, skipping others
pub async fn wait_for_event(rx: &mut broadcast::Receiver<LogEvent>, id: &str) -> Option<LogEvent> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if event.id == id => return Some(event),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}
