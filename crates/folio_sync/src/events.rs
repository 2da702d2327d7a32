//! Host-facing log events
//!
//! User-visible notifications (share accepted, peer connected, relay lost)
//! are broadcast as [`LogEvent`]s and mirrored into `tracing`.

use folio_common::sanitizer::LogSanitizer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Stable id so hosts can replace an earlier notification
    pub id: String,
    pub level: Severity,
    pub title: String,
    pub content: String,
}

/// Fan-out of log events to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LogEvent>,
    sanitizer: Arc<LogSanitizer>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sanitizer: Arc::new(LogSanitizer::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, id: impl Into<String>, level: Severity, title: &str, content: &str) {
        let event = LogEvent {
            id: id.into(),
            level,
            title: self.sanitizer.sanitize(title),
            content: self.sanitizer.sanitize(content),
        };

        match level {
            Severity::Error => tracing::error!(id = %event.id, "{}: {}", event.title, event.content),
            Severity::Warning => tracing::warn!(id = %event.id, "{}: {}", event.title, event.content),
            Severity::Info | Severity::Success => {
                tracing::info!(id = %event.id, "{}: {}", event.title, event.content)
            }
        }

        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn info(&self, id: impl Into<String>, title: &str, content: &str) {
        self.emit(id, Severity::Info, title, content);
    }

    pub fn warning(&self, id: impl Into<String>, title: &str, content: &str) {
        self.emit(id, Severity::Warning, title, content);
    }

    pub fn error(&self, id: impl Into<String>, title: &str, content: &str) {
        self.emit(id, Severity::Error, title, content);
    }

    pub fn success(&self, id: impl Into<String>, title: &str, content: &str) {
        self.emit(id, Severity::Success, title, content);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
