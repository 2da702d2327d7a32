//! Backend relay channel
//!
//! One authenticated WebSocket to the broker. States move
//! `DISCONNECTED -> PENDING -> CONNECTED`; any close returns to
//! `DISCONNECTED` and reconnecting is left to the caller.
//!
//! On successful AUTHENTICATION the channel flushes sends queued while it
//! was down, then replays the backlog the broker listed (fetched one by one
//! from the directory and dispatched in order) before reporting ready.

use crate::config::SyncConfig;
use crate::directory::Directory;
use crate::envelope::{encode_frames, operation, read_frame, Envelope};
use crate::events::EventBus;
use crate::framing::ChunkAssembler;
use crate::router::{Incoming, Via};
use crate::util::lock;
use crate::{Result, SyncError};
use folio_common::Notebook;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Disconnected,
    Pending,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RelayState {
    status: ConnectionStatus,
    /// Backlog replayed after authentication
    ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    pub notebook: Notebook,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    pub success: bool,
    /// Backlog message uuids to fetch from the directory
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Request for the broker to deliver `data` to `target` as `proxyOperation`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub target: Notebook,
    pub proxy_operation: String,
    /// Kept apart from the envelope's own `ephemeral` flag
    #[serde(default, rename = "proxyEphemeral")]
    pub ephemeral: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ProxyRequest {
    /// The envelope the broker hands to the target
    pub fn into_delivery(self, source: Notebook) -> Envelope {
        Envelope {
            operation: self.proxy_operation,
            source: Some(source),
            ephemeral: self.ephemeral,
            data: self.data,
        }
    }
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
}

/// Handle to the relay connection; clones share it
#[derive(Clone)]
pub struct RelayChannel {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    url: String,
    notebook: Notebook,
    token: Option<String>,
    frame_limit: usize,
    chunk_ttl: Duration,
    max_chunks: usize,
    connect_timeout: Option<Duration>,
    state: watch::Sender<RelayState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    queue: Mutex<VecDeque<Envelope>>,
    /// Bumped per connection so stale readers stay quiet
    generation: AtomicU64,
    last_error: Mutex<Option<String>>,
    inbound: mpsc::UnboundedSender<Incoming>,
    directory: Arc<dyn Directory>,
    events: EventBus,
}

impl RelayChannel {
    pub fn new(
        config: &SyncConfig,
        directory: Arc<dyn Directory>,
        inbound: mpsc::UnboundedSender<Incoming>,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(RelayState {
            status: ConnectionStatus::Disconnected,
            ready: false,
        });

        Self {
            inner: Arc::new(RelayInner {
                url: config.relay_url.clone(),
                notebook: config.notebook.clone(),
                token: config.auth_token.clone(),
                frame_limit: config.relay_frame_limit,
                chunk_ttl: config.chunk_ttl,
                max_chunks: config.max_chunks,
                connect_timeout: config.connect_timeout,
                state,
                writer: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                generation: AtomicU64::new(0),
                last_error: Mutex::new(None),
                inbound,
                directory,
                events,
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.borrow().status
    }

    /// Authenticated and backlog replayed
    pub fn is_ready(&self) -> bool {
        self.inner.state.borrow().ready
    }

    /// Sends waiting for the next connection
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Open the channel and wait until it is ready.
    ///
    /// A no-op unless DISCONNECTED. Fails on rejection, transport error, or
    /// when the configured connect timeout elapses while PENDING.
    pub async fn connect(&self) -> Result<()> {
        let claimed = self.inner.state.send_if_modified(|state| {
            if state.status == ConnectionStatus::Disconnected {
                state.status = ConnectionStatus::Pending;
                state.ready = false;
                true
            } else {
                false
            }
        });
        if !claimed {
            tracing::debug!("Relay connect ignored, already {:?}", self.status());
            return Ok(());
        }
        *lock(&self.inner.last_error) = None;

        let attempt = self.inner.clone().open();
        let outcome = match self.inner.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(format!(
                    "relay did not authenticate within {:?}",
                    limit
                ))),
            },
            None => attempt.await,
        };

        if let Err(e) = &outcome {
            self.inner.teardown();
            self.inner
                .events
                .error("relay-connect", "Relay connection failed", &e.to_string());
        }
        outcome
    }

    /// Close the channel; queued sends are kept for the next connect
    pub fn disconnect(&self) {
        if self.status() == ConnectionStatus::Disconnected {
            return;
        }
        self.inner.teardown();
        self.inner
            .events
            .info("relay-disconnected", "Disconnected", "Relay connection closed");
    }

    /// Send now if connected, otherwise queue until the next connect
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let mut queue = lock(&self.inner.queue);
        if self.status() == ConnectionStatus::Connected {
            match self.inner.write(&envelope) {
                Ok(()) => return Ok(()),
                Err(SyncError::NotConnected) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!("Queueing {} until relay connects", envelope.operation);
        queue.push_back(envelope);
        Ok(())
    }

    /// Ask the broker to deliver `envelope` to `target`
    pub fn proxy(&self, target: &Notebook, envelope: Envelope) -> Result<()> {
        let request = ProxyRequest {
            target: target.clone(),
            proxy_operation: envelope.operation,
            ephemeral: envelope.ephemeral,
            data: envelope.data,
        };
        self.send(Envelope::new(operation::PROXY, request)?)
    }
}

impl RelayInner {
    fn set_status(&self, status: ConnectionStatus, ready: bool) {
        self.state.send_replace(RelayState { status, ready });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Drop the socket and invalidate its reader
    fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.writer).take();
        self.set_status(ConnectionStatus::Disconnected, false);
    }

    fn write(&self, envelope: &Envelope) -> Result<()> {
        let frames = encode_frames(envelope, self.frame_limit)?;
        let writer = lock(&self.writer);
        let tx = writer.as_ref().ok_or(SyncError::NotConnected)?;
        for frame in frames {
            tx.send(Message::Text(frame))
                .map_err(|_| SyncError::NotConnected)?;
        }
        Ok(())
    }

    async fn open(self: Arc<Self>) -> Result<()> {
        tracing::info!("Connecting to relay: {}", self.url);
        let (ws, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.writer) = Some(tx);

        let mut state = self.state.subscribe();
        let reader = self.clone();
        tokio::spawn(async move { reader.read_loop(stream, generation).await });

        let auth = AuthenticationRequest {
            notebook: self.notebook.clone(),
            token: self.token.clone(),
        };
        self.write(&Envelope::new(operation::AUTHENTICATION, auth)?)?;

        loop {
            let current = *state.borrow_and_update();
            if current.ready {
                return Ok(());
            }
            if current.status == ConnectionStatus::Disconnected {
                let reason = lock(&self.last_error)
                    .clone()
                    .unwrap_or_else(|| "connection closed during authentication".to_string());
                return Err(SyncError::Unauthorized(reason));
            }
            if state.changed().await.is_err() {
                return Err(SyncError::NotConnected);
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>, generation: u64) {
        let mut assembler = ChunkAssembler::new(self.chunk_ttl).with_max_chunks(self.max_chunks);

        while let Some(frame) = stream.next().await {
            if !self.is_current(generation) {
                return;
            }
            match frame {
                Ok(Message::Text(text)) => match read_frame(&text, &mut assembler) {
                    Ok(Some(envelope)) => self.handle_envelope(envelope, generation).await,
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Dropping relay frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Relay socket error: {}", e);
                    break;
                }
            }
        }

        self.on_closed(generation);
    }

    fn on_closed(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        lock(&self.writer).take();
        let was_up = self.state.send_if_modified(|state| {
            let changed = state.status != ConnectionStatus::Disconnected;
            state.status = ConnectionStatus::Disconnected;
            state.ready = false;
            changed
        });
        if was_up {
            self.events.warning(
                "relay-disconnected",
                "Relay connection lost",
                "Sync is paused until the relay is reconnected",
            );
        }
    }

    async fn handle_envelope(&self, envelope: Envelope, generation: u64) {
        match envelope.operation.as_str() {
            operation::AUTHENTICATION => self.on_authentication(envelope, generation).await,
            operation::ERROR => {
                let message = envelope
                    .payload::<ErrorPayload>()
                    .map(|p| p.message)
                    .unwrap_or_default();
                if self.state.borrow().status == ConnectionStatus::Pending {
                    self.reject(generation, message);
                } else {
                    self.events.error("relay-error", "Relay error", &message);
                }
            }
            operation::PONG => {}
            _ => {
                let _ = self.inbound.send(Incoming::new(envelope, Via::Relay));
            }
        }
    }

    async fn on_authentication(&self, envelope: Envelope, generation: u64) {
        let response: AuthenticationResponse = match envelope.payload() {
            Ok(response) => response,
            Err(e) => {
                self.reject(generation, e.to_string());
                return;
            }
        };

        if !response.success {
            let reason = response
                .reason
                .unwrap_or_else(|| "authentication rejected".to_string());
            self.reject(generation, reason);
            return;
        }

        tracing::info!("Authenticated with relay as {}", self.notebook);
        self.flush_queue();

        for uuid in response.messages {
            if !self.is_current(generation) {
                return;
            }
            match self.directory.get_message(&uuid).await {
                Ok(envelope) => {
                    let (done, finished) = oneshot::channel();
                    let incoming = Incoming {
                        envelope,
                        via: Via::Relay,
                        done: Some(done),
                    };
                    if self.inbound.send(incoming).is_ok() {
                        let _ = finished.await;
                    }
                }
                Err(e) => self.events.warning(
                    format!("backlog-{}", uuid),
                    "Missed message unavailable",
                    &e.to_string(),
                ),
            }
        }

        if self.is_current(generation) {
            self.set_status(ConnectionStatus::Connected, true);
            self.events.success(
                "relay-ready",
                "Connected",
                &format!("Connected to relay as {}", self.notebook),
            );
        }
    }

    /// Move to CONNECTED and send everything queued, oldest first
    fn flush_queue(&self) {
        let mut queue = lock(&self.queue);
        self.set_status(ConnectionStatus::Connected, false);
        while let Some(envelope) = queue.pop_front() {
            if let Err(e) = self.write(&envelope) {
                tracing::warn!("Flush of {} failed: {}", envelope.operation, e);
                queue.push_front(envelope);
                break;
            }
        }
    }

    fn reject(&self, generation: u64, reason: String) {
        if !self.is_current(generation) {
            return;
        }
        *lock(&self.last_error) = Some(reason.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.writer).take();
        self.set_status(ConnectionStatus::Disconnected, false);
        self.events
            .error("relay-auth", "Relay rejected connection", &reason);
    }
}
