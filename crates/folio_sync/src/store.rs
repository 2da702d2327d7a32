//! Local persistence of shared page states and links

use crate::{Result, SyncError};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Binding of a local page to a shared page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageLink {
    pub shared_page_uuid: String,
    pub is_shared: bool,
}

/// Storage for binary CRDT states and the link table
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn load(&self, notebook_page_id: &str) -> Result<Option<Vec<u8>>>;

    async fn save(&self, notebook_page_id: &str, state: &[u8]) -> Result<()>;

    async fn remove(&self, notebook_page_id: &str) -> Result<()>;

    async fn load_links(&self) -> Result<HashMap<String, PageLink>>;

    async fn save_links(&self, links: &HashMap<String, PageLink>) -> Result<()>;
}

/// One file per page under a directory, plus `links.json`
pub struct FsPageStore {
    dir: PathBuf,
}

impl FsPageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn page_path(&self, notebook_page_id: &str) -> PathBuf {
        // page ids may contain path separators
        let name = URL_SAFE_NO_PAD.encode(notebook_page_id.as_bytes());
        self.dir.join(format!("{}.bin", name))
    }

    fn links_path(&self) -> PathBuf {
        self.dir.join("links.json")
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SyncError::PersistenceError(format!("create {}: {}", self.dir.display(), e)))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| SyncError::PersistenceError(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SyncError::PersistenceError(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl PageStore for FsPageStore {
    async fn load(&self, notebook_page_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.page_path(notebook_page_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::PersistenceError(format!(
                "read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save(&self, notebook_page_id: &str, state: &[u8]) -> Result<()> {
        let path = self.page_path(notebook_page_id);
        self.write_atomic(&path, state).await?;
        tracing::debug!("Persisted {} ({} bytes)", notebook_page_id, state.len());
        Ok(())
    }

    async fn remove(&self, notebook_page_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.page_path(notebook_page_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::PersistenceError(e.to_string())),
        }
    }

    async fn load_links(&self) -> Result<HashMap<String, PageLink>> {
        match tokio::fs::read(self.links_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(SyncError::PersistenceError(e.to_string())),
        }
    }

    async fn save_links(&self, links: &HashMap<String, PageLink>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(links)?;
        self.write_atomic(&self.links_path(), &bytes).await
    }
}

/// In-process store. Writes can be made to fail to exercise the broken
/// page path.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: Mutex<HashMap<String, Vec<u8>>>,
    links: Mutex<HashMap<String, PageLink>>,
    failing: AtomicBool,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `save` calls fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lock_pages(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.pages
            .lock()
            .map_err(|_| SyncError::PersistenceError("page store poisoned".into()))
    }

    fn lock_links(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PageLink>>> {
        self.links
            .lock()
            .map_err(|_| SyncError::PersistenceError("link store poisoned".into()))
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn load(&self, notebook_page_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock_pages()?.get(notebook_page_id).cloned())
    }

    async fn save(&self, notebook_page_id: &str, state: &[u8]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::PersistenceError(format!(
                "store unavailable for {}",
                notebook_page_id
            )));
        }
        self.lock_pages()?
            .insert(notebook_page_id.to_string(), state.to_vec());
        Ok(())
    }

    async fn remove(&self, notebook_page_id: &str) -> Result<()> {
        self.lock_pages()?.remove(notebook_page_id);
        Ok(())
    }

    async fn load_links(&self) -> Result<HashMap<String, PageLink>> {
        Ok(self.lock_links()?.clone())
    }

    async fn save_links(&self, links: &HashMap<String, PageLink>) -> Result<()> {
        *self.lock_links()? = links.clone();
        Ok(())
    }
}
