//! Notebook message router
//!
//! Inbound envelopes from both transports land on one channel and are
//! dispatched by a single task, so messages from one sender are handled in
//! arrival order. Outbound messages prefer a connected peer channel and fall
//! back to a relay PROXY.

use crate::envelope::Envelope;
use crate::events::EventBus;
use crate::peer::PeerConnections;
use crate::relay::RelayChannel;
use crate::Result;
use folio_common::Notebook;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Transport a message travelled over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Via {
    Relay,
    Peer,
}

/// An inbound envelope waiting for dispatch
pub struct Incoming {
    pub envelope: Envelope,
    pub via: Via,
    /// Signalled once the handler has finished
    pub done: Option<oneshot::Sender<()>>,
}

impl Incoming {
    pub fn new(envelope: Envelope, via: Via) -> Self {
        Self {
            envelope,
            via,
            done: None,
        }
    }
}

type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    handlers: RwLock<HashMap<String, Handler>>,
    relay: RelayChannel,
    peers: PeerConnections,
    events: EventBus,
}

impl Router {
    pub fn new(relay: RelayChannel, peers: PeerConnections, events: EventBus) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handlers: RwLock::new(HashMap::new()),
                relay,
                peers,
                events,
            }),
        }
    }

    /// Install the handler for `operation`, replacing any previous one
    pub fn register<F, Fut>(&self, operation: &str, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |envelope| Box::pin(handler(envelope)));
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if handlers.insert(operation.to_string(), handler).is_some() {
            tracing::debug!("Replaced handler for {}", operation);
        }
    }

    pub fn unregister(&self, operation: &str) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation)
            .is_some()
    }

    pub fn has_handler(&self, operation: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(operation)
    }

    /// Operations with a handler installed
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ops.sort();
        ops
    }

    /// Run the handler for one envelope
    pub async fn dispatch(&self, envelope: Envelope) {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&envelope.operation)
            .cloned();

        let operation = envelope.operation.clone();
        let source = envelope
            .source
            .as_ref()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "relay".to_string());

        let Some(handler) = handler else {
            if envelope.ephemeral {
                tracing::debug!("Dropping unhandled ephemeral {}", operation);
            } else {
                self.inner.events.error(
                    format!("unknown-operation-{}", operation),
                    "Unknown operation",
                    &format!("No handler for {} from {}", operation, source),
                );
            }
            return;
        };

        tracing::debug!("Dispatching {} from {}", operation, source);
        if let Err(e) = handler(envelope).await {
            let id = format!("{}-failed", operation.to_lowercase());
            let content = format!("{} from {}: {}", operation, source, e);
            if e.is_recoverable() {
                self.inner.events.warning(id, "Message handling failed", &content);
            } else {
                self.inner.events.error(id, "Message handling failed", &content);
            }
        }
    }

    /// Spawn the dispatch loop draining `inbound`
    pub fn run(&self, mut inbound: mpsc::UnboundedReceiver<Incoming>) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(incoming) = inbound.recv().await {
                router.dispatch(incoming.envelope).await;
                if let Some(done) = incoming.done {
                    let _ = done.send(());
                }
            }
            tracing::debug!("Router inbound closed");
        })
    }

    /// Send an operation to a notebook over the best available transport
    pub fn send_to_notebook(
        &self,
        target: &Notebook,
        operation: &str,
        data: impl Serialize,
    ) -> Result<Via> {
        self.send_envelope(target, Envelope::new(operation, data)?)
    }

    pub fn send_envelope(&self, target: &Notebook, envelope: Envelope) -> Result<Via> {
        if self.inner.peers.is_connected(target) {
            match self.inner.peers.send(target, &envelope) {
                Ok(()) => return Ok(Via::Peer),
                Err(e) => tracing::warn!(
                    "Direct send of {} to {} failed, using relay: {}",
                    envelope.operation,
                    target,
                    e
                ),
            }
        }

        self.inner.relay.proxy(target, envelope)?;
        Ok(Via::Relay)
    }
}
