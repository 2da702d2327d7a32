//! `folio connect`: run one notebook's sync session in the foreground

use crate::{read_schema, workspace_root};
use anyhow::Context;
use folio_common::Notebook;
use folio_config::Config;
use folio_sync::{
    FsPageStore, HttpDirectory, LogEvent, MemoryHost, SessionDeps, Severity, SyncConfig,
    SyncSession,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

pub async fn cmd_connect(shares: Vec<PathBuf>, peers: Vec<String>) -> anyhow::Result<()> {
    let root = workspace_root()?;
    let config = Config::load(&root).context("Failed to load .folio/config.toml")?;
    let sync_config = SyncConfig::from_config(&config)?;

    let peers = peers
        .iter()
        .map(|peer| {
            peer.parse::<Notebook>()
                .with_context(|| format!("Invalid --peer '{}'", peer))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let host = Arc::new(MemoryHost::new());
    let mut page_ids = Vec::new();
    for path in &shares {
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .with_context(|| format!("Cannot derive a page id from {}", path.display()))?;
        host.set_page(&id, read_schema(path)?);
        page_ids.push(id);
    }

    let deps = SessionDeps {
        directory: Arc::new(HttpDirectory::new(&sync_config)?),
        store: Arc::new(FsPageStore::new(sync_config.storage_dir.clone())),
        host,
    };
    let session = SyncSession::init(sync_config, deps).await?;
    let printer = tokio::spawn(print_events(session.events()));

    session
        .connect()
        .await
        .context("Failed to connect to relay")?;
    eprintln!("✓ Connected as {}", session.notebook());

    for id in &page_ids {
        let shared = session.pages().init_page(id).await?;
        eprintln!("✓ Shared {} as {}", id, shared.id);
    }

    for peer in &peers {
        if let Err(e) = session.connect_peer(peer).await {
            // the relay still carries everything
            tracing::warn!("Direct channel to {} not started: {}", peer, e);
        }
    }

    eprintln!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    session.shutdown().await;
    printer.abort();
    eprintln!("✓ Session closed");
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<LogEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => eprintln!("{}", format_event(&event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Skipped {} log events", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn format_event(event: &LogEvent) -> String {
    let marker = match event.level {
        Severity::Info => "·",
        Severity::Warning => "!",
        Severity::Error => "✗",
        Severity::Success => "✓",
    };
    format!("{} {}: {}", marker, event.title, event.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_event() {
        let event = LogEvent {
            id: "relay-ready".to_string(),
            level: Severity::Success,
            title: "Connected".to_string(),
            content: "Connected to relay as 1/home".to_string(),
        };
        assert_eq!(format_event(&event), "✓ Connected: Connected to relay as 1/home");
    }
}
