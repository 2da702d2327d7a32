//! Direct peer connections
//!
//! Negotiation rides on the relay: the offerer binds a listener and sends
//! `PROXY{OFFER}` with its candidates, the answerer replies `PROXY{ANSWER}`
//! and dials the first reachable candidate at `/<label>`. Once the socket
//! opens the offerer sends `PEER_IDENTITY`, the answerer re-keys the link by
//! that identity and echoes its own, and both sides are CONNECTED.
//!
//! Links are keyed by channel label until the identity exchange, then by
//! notebook key. Anything that fails or stalls past the negotiation timeout
//! is dropped and the router keeps using the relay.

use crate::config::SyncConfig;
use crate::envelope::{encode_frames, operation, read_frame, Envelope};
use crate::events::EventBus;
use crate::framing::ChunkAssembler;
use crate::relay::RelayChannel;
use crate::router::{Incoming, Router, Via};
use crate::util::lock;
use crate::{Result, SyncError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use folio_common::Notebook;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerStatus {
    Pending,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    fn new(kind: &str, label: &str) -> Self {
        Self {
            kind: kind.to_string(),
            sdp: format!("folio-direct/1 label={}", label),
        }
    }
}

/// Offer or answer exchanged over the relay, base64-encoded JSON on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub description: SessionDescription,
    pub candidates: Vec<String>,
    pub label: String,
}

impl SignalPayload {
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = STANDARD.decode(encoded)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::NegotiationError(format!("malformed signal: {}", e)))
    }
}

#[derive(Serialize, Deserialize)]
struct SignalMessage {
    payload: String,
}

#[derive(Serialize, Deserialize)]
struct PeerIdentity {
    notebook: Notebook,
}

struct PeerLink {
    notebook: Notebook,
    label: String,
    role: Role,
    status: PeerStatus,
    channel: Option<mpsc::UnboundedSender<Message>>,
    remote_candidates: Vec<String>,
}

/// Registry of direct channels; clones share it
#[derive(Clone)]
pub struct PeerConnections {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    local: Notebook,
    config: SyncConfig,
    links: Mutex<HashMap<String, PeerLink>>,
    relay: RelayChannel,
    inbound: mpsc::UnboundedSender<Incoming>,
    events: EventBus,
}

impl PeerConnections {
    pub fn new(
        config: &SyncConfig,
        relay: RelayChannel,
        inbound: mpsc::UnboundedSender<Incoming>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                local: config.notebook.clone(),
                config: config.clone(),
                links: Mutex::new(HashMap::new()),
                relay,
                inbound,
                events,
            }),
        }
    }

    /// Route OFFER and ANSWER to this registry
    pub fn register_handlers(&self, router: &Router) {
        let peers = self.clone();
        router.register(operation::OFFER, move |envelope| {
            let peers = peers.clone();
            async move { peers.handle_offer(envelope).await }
        });

        let peers = self.clone();
        router.register(operation::ANSWER, move |envelope| {
            let peers = peers.clone();
            async move { peers.handle_answer(envelope) }
        });
    }

    pub fn is_connected(&self, target: &Notebook) -> bool {
        self.status(target) == Some(PeerStatus::Connected)
    }

    /// State of the link with `target`, if any
    pub fn status(&self, target: &Notebook) -> Option<PeerStatus> {
        lock(&self.inner.links)
            .values()
            .find(|link| &link.notebook == target)
            .map(|link| link.status)
    }

    /// Candidates the remote side advertised for the link with `target`
    pub fn remote_candidates(&self, target: &Notebook) -> Vec<String> {
        lock(&self.inner.links)
            .values()
            .find(|link| &link.notebook == target)
            .map(|link| link.remote_candidates.clone())
            .unwrap_or_default()
    }

    pub fn connected(&self) -> Vec<Notebook> {
        let mut peers: Vec<Notebook> = lock(&self.inner.links)
            .values()
            .filter(|link| link.status == PeerStatus::Connected)
            .map(|link| link.notebook.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Start negotiating a direct channel to `target`.
    ///
    /// Returns once the offer is sent; the link turns CONNECTED later or is
    /// dropped when negotiation fails.
    pub async fn connect(&self, target: &Notebook) -> Result<()> {
        let inner = &self.inner;
        if !inner.config.peer_enabled {
            return Err(SyncError::NegotiationError(
                "direct peer channels are disabled".to_string(),
            ));
        }
        if target == &inner.local {
            return Err(SyncError::NegotiationError(
                "cannot connect to self".to_string(),
            ));
        }
        if self.status(target).is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(&inner.config.peer_bind)
            .await
            .map_err(|e| SyncError::NegotiationError(format!("bind {}: {}", inner.config.peer_bind, e)))?;
        let addr = listener.local_addr()?;
        let host = inner
            .config
            .peer_advertise_host
            .clone()
            .unwrap_or_else(|| addr.ip().to_string());

        let label = Uuid::new_v4().to_string();
        let offer = SignalPayload {
            description: SessionDescription::new("offer", &label),
            candidates: vec![format!("ws://{}:{}", host, addr.port())],
            label: label.clone(),
        };

        lock(&inner.links).insert(
            label.clone(),
            PeerLink {
                notebook: target.clone(),
                label: label.clone(),
                role: Role::Offerer,
                status: PeerStatus::Pending,
                channel: None,
                remote_candidates: Vec::new(),
            },
        );

        tracing::info!("Offering direct channel {} to {}", label, target);
        let signal = Envelope::new(
            operation::OFFER,
            SignalMessage {
                payload: offer.encode()?,
            },
        )?;
        if let Err(e) = inner.relay.proxy(target, signal) {
            lock(&inner.links).remove(&label);
            return Err(e);
        }

        inner.watch_negotiation(label.clone());
        let task_inner = inner.clone();
        tokio::spawn(async move {
            let accepted = tokio::time::timeout(
                task_inner.config.negotiation_timeout,
                accept_channel(listener, &label),
            )
            .await;
            match accepted {
                Ok(Ok(ws)) => task_inner.channel_open(label, ws, Role::Offerer),
                Ok(Err(e)) => task_inner.fail(&label, &e.to_string()),
                Err(_) => task_inner.fail(&label, "no inbound connection"),
            }
        });
        Ok(())
    }

    /// Answer a remote offer and dial its candidates
    pub async fn handle_offer(&self, envelope: Envelope) -> Result<()> {
        let inner = &self.inner;
        let source = envelope.require_source()?.clone();
        let signal: SignalMessage = envelope.payload()?;
        let offer = SignalPayload::decode(&signal.payload)?;
        if offer.description.kind != "offer" {
            return Err(SyncError::NegotiationError(format!(
                "expected offer, got {}",
                offer.description.kind
            )));
        }
        if !inner.config.peer_enabled {
            tracing::info!("Ignoring offer from {}, direct channels disabled", source);
            return Ok(());
        }

        let label = offer.label.clone();
        lock(&inner.links).insert(
            label.clone(),
            PeerLink {
                notebook: source.clone(),
                label: label.clone(),
                role: Role::Answerer,
                status: PeerStatus::Pending,
                channel: None,
                remote_candidates: offer.candidates.clone(),
            },
        );

        let answer = SignalPayload {
            description: SessionDescription::new("answer", &label),
            candidates: Vec::new(),
            label: label.clone(),
        };
        let reply = Envelope::new(
            operation::ANSWER,
            SignalMessage {
                payload: answer.encode()?,
            },
        )?;
        inner.relay.proxy(&source, reply)?;
        tracing::info!("Answered direct channel {} from {}", label, source);

        inner.watch_negotiation(label.clone());
        let task_inner = inner.clone();
        tokio::spawn(async move {
            let dialed = tokio::time::timeout(
                task_inner.config.negotiation_timeout,
                dial_channel(&offer.candidates, &label),
            )
            .await;
            match dialed {
                Ok(Ok(ws)) => task_inner.channel_open(label, ws, Role::Answerer),
                Ok(Err(e)) => task_inner.fail(&label, &e.to_string()),
                Err(_) => task_inner.fail(&label, "no candidate answered"),
            }
        });
        Ok(())
    }

    /// Record the answer for a pending offer
    pub fn handle_answer(&self, envelope: Envelope) -> Result<()> {
        let signal: SignalMessage = envelope.payload()?;
        let answer = SignalPayload::decode(&signal.payload)?;
        if answer.description.kind != "answer" {
            return Err(SyncError::NegotiationError(format!(
                "expected answer, got {}",
                answer.description.kind
            )));
        }

        let mut links = lock(&self.inner.links);
        match links.get_mut(&answer.label) {
            Some(link) if link.role == Role::Offerer && link.status == PeerStatus::Pending => {
                link.remote_candidates = answer.candidates;
                tracing::debug!("Answer received for {}", answer.label);
            }
            _ => tracing::warn!("Answer for unknown channel {}", answer.label),
        }
        Ok(())
    }

    /// Send over the direct channel to `target`
    pub fn send(&self, target: &Notebook, envelope: &Envelope) -> Result<()> {
        let tx = lock(&self.inner.links)
            .get(&target.key())
            .filter(|link| link.status == PeerStatus::Connected)
            .and_then(|link| link.channel.clone())
            .ok_or(SyncError::NotConnected)?;

        for frame in encode_frames(envelope, self.inner.config.peer_frame_limit)? {
            tx.send(Message::Text(frame))
                .map_err(|_| SyncError::TransportError(format!("channel to {} closed", target)))?;
        }
        Ok(())
    }

    /// Close the direct channel to `target`
    pub fn disconnect(&self, target: &Notebook) -> bool {
        let removed = lock(&self.inner.links).remove(&target.key());
        if removed.is_some() {
            self.inner.events.info(
                format!("peer-{}", target.key()),
                "Peer disconnected",
                &format!("Closed direct channel to {}", target),
            );
        }
        removed.is_some()
    }

    /// Close every channel
    pub fn shutdown(&self) {
        lock(&self.inner.links).clear();
    }
}

impl PeerInner {
    fn watch_negotiation(self: &Arc<Self>, label: String) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.negotiation_timeout).await;
            inner.fail(&label, "negotiation timed out");
        });
    }

    /// Drop a link still pending under `label`
    fn fail(&self, label: &str, reason: &str) {
        let removed = {
            let mut links = lock(&self.links);
            match links.get(label) {
                Some(link) if link.status == PeerStatus::Pending => links.remove(label),
                _ => None,
            }
        };

        if let Some(link) = removed {
            self.events.warning(
                format!("peer-{}", link.notebook.key()),
                "Direct connection failed",
                &format!("{}: {}; using relay", link.notebook, reason),
            );
        }
    }

    fn channel_open<S>(self: Arc<Self>, label: String, ws: WebSocketStream<S>, role: Role)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
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

        {
            let mut links = lock(&self.links);
            match links.get_mut(&label) {
                Some(link) if link.status == PeerStatus::Pending => link.channel = Some(tx.clone()),
                // abandoned while the socket was opening
                _ => return,
            }
        }
        tracing::debug!("Channel {} open", label);

        if role == Role::Offerer {
            if let Err(e) = self.send_identity(&tx) {
                self.fail(&label, &e.to_string());
                return;
            }
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let mut key = label.clone();
            let mut assembler = ChunkAssembler::new(inner.config.chunk_ttl)
                .with_max_chunks(inner.config.max_chunks);

            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let envelope = match read_frame(&text, &mut assembler) {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("Dropping peer frame on {}: {}", label, e);
                        continue;
                    }
                };

                if envelope.operation == operation::PEER_IDENTITY {
                    match envelope.payload::<PeerIdentity>() {
                        Ok(identity) => {
                            if let Some(new_key) = inner.finalize(&key, identity.notebook, role) {
                                key = new_key;
                            }
                        }
                        Err(e) => tracing::warn!("Bad identity on {}: {}", label, e),
                    }
                    continue;
                }
                inner.deliver(&key, envelope);
            }

            inner.channel_closed(&key, &label);
        });
    }

    fn send_identity(&self, tx: &mpsc::UnboundedSender<Message>) -> Result<()> {
        let identity = Envelope::new(
            operation::PEER_IDENTITY,
            PeerIdentity {
                notebook: self.local.clone(),
            },
        )?;
        for frame in encode_frames(&identity, self.config.peer_frame_limit)? {
            tx.send(Message::Text(frame))
                .map_err(|_| SyncError::TransportError("channel closed".to_string()))?;
        }
        Ok(())
    }

    /// Re-key the link under the remote identity and mark it CONNECTED
    fn finalize(&self, key: &str, notebook: Notebook, role: Role) -> Option<String> {
        let new_key = notebook.key();
        let channel = {
            let mut links = lock(&self.links);
            let mut link = links.remove(key)?;
            if link.status == PeerStatus::Connected {
                links.insert(key.to_string(), link);
                return None;
            }
            link.notebook = notebook.clone();
            link.status = PeerStatus::Connected;
            let channel = link.channel.clone();
            // a newer channel to the same notebook replaces the old one
            links.insert(new_key.clone(), link);
            channel
        };

        if role == Role::Answerer {
            if let Some(tx) = &channel {
                if let Err(e) = self.send_identity(tx) {
                    tracing::warn!("Identity echo to {} failed: {}", notebook, e);
                }
            }
        }

        self.events.success(
            format!("peer-{}", new_key),
            "Peer connected",
            &format!("Direct channel to {}", notebook),
        );
        Some(new_key)
    }

    fn deliver(&self, key: &str, mut envelope: Envelope) {
        let source = lock(&self.links)
            .get(key)
            .filter(|link| link.status == PeerStatus::Connected)
            .map(|link| link.notebook.clone());

        match source {
            Some(source) => {
                envelope.source = Some(source);
                let _ = self.inbound.send(Incoming::new(envelope, Via::Peer));
            }
            None => tracing::warn!("Dropping {} before identity exchange", envelope.operation),
        }
    }

    fn channel_closed(&self, key: &str, label: &str) {
        let removed = {
            let mut links = lock(&self.links);
            match links.get(key) {
                Some(link) if link.label == label => links.remove(key),
                _ => None,
            }
        };

        if let Some(link) = removed {
            if link.status == PeerStatus::Connected {
                self.events.warning(
                    format!("peer-{}", link.notebook.key()),
                    "Peer disconnected",
                    &format!("Direct channel to {} closed; using relay", link.notebook),
                );
            } else {
                self.events.warning(
                    format!("peer-{}", link.notebook.key()),
                    "Direct connection failed",
                    &format!("Channel to {} closed during negotiation", link.notebook),
                );
            }
        }
    }
}

/// Wait for the dialer that asks for `/<label>`; other connections are refused
async fn accept_channel(listener: TcpListener, label: &str) -> Result<WebSocketStream<TcpStream>> {
    let expected = format!("/{}", label);
    loop {
        let (socket, remote) = listener.accept().await?;
        let check = |request: &Request, response: Response| {
            if request.uri().path() == expected {
                Ok(response)
            } else {
                let mut refusal = ErrorResponse::new(Some("unknown channel".to_string()));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        };
        match tokio_tungstenite::accept_hdr_async(socket, check).await {
            Ok(ws) => {
                tracing::debug!("Inbound direct channel {} from {}", label, remote);
                return Ok(ws);
            }
            Err(e) => tracing::warn!("Refused inbound connection from {}: {}", remote, e),
        }
    }
}

async fn dial_channel(
    candidates: &[String],
    label: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut last_error = SyncError::NegotiationError("offer carried no candidates".to_string());
    for candidate in candidates {
        let url = format!("{}/{}", candidate.trim_end_matches('/'), label);
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => return Ok(ws),
            Err(e) => {
                tracing::debug!("Candidate {} failed: {}", candidate, e);
                last_error = e.into();
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accept_channel_refuses_other_paths() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepting = tokio::spawn(async move { accept_channel(listener, "abc").await });

        let stray = connect_async(format!("ws://{}/other", addr)).await;
        assert!(stray.is_err());
        assert!(!accepting.is_finished());

        let (_ws, _) = connect_async(format!("ws://{}/abc", addr)).await.unwrap();
        assert!(accepting.await.unwrap().is_ok());
    }

    #[test]
    fn test_signal_payload_roundtrip() {
        let payload = SignalPayload {
            description: SessionDescription::new("offer", "abc"),
            candidates: vec!["ws://127.0.0.1:4000".into()],
            label: "abc".into(),
        };
        let encoded = payload.encode().unwrap();
        assert!(!encoded.contains('{'));
        assert_eq!(SignalPayload::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_signal_json_shape() {
        let payload = SignalPayload {
            description: SessionDescription::new("answer", "l"),
            candidates: vec![],
            label: "l".into(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["description"]["type"], "answer");
        assert!(value["description"]["sdp"].is_string());
    }

    #[test]
    fn test_garbage_signal_is_negotiation_error() {
        let encoded = STANDARD.encode(b"not json");
        assert!(matches!(
            SignalPayload::decode(&encoded),
            Err(SyncError::NegotiationError(_))
        ));
        assert!(SignalPayload::decode("%%%").is_err());
    }

    #[tokio::test]
    async fn test_dial_without_candidates_fails() {
        assert!(dial_channel(&[], "label").await.is_err());
    }
}
