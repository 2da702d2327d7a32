//! Seam to the host application's page editor

use crate::util::lock;
use crate::{Result, SyncError};
use async_trait::async_trait;
use folio_text::InitialSchema;
use std::collections::HashMap;
use std::sync::Mutex;

/// Reads and writes pages in the host notebook
#[async_trait]
pub trait PageHost: Send + Sync {
    /// Current snapshot of a local page
    async fn load_page(&self, notebook_page_id: &str) -> Result<InitialSchema>;

    /// Replace the local page with a synchronized snapshot
    async fn apply_page(&self, notebook_page_id: &str, schema: &InitialSchema) -> Result<()>;
}

/// Host keeping pages in memory, used by the CLI and tests
#[derive(Default)]
pub struct MemoryHost {
    pages: Mutex<HashMap<String, InitialSchema>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_page(&self, notebook_page_id: &str, schema: InitialSchema) {
        lock(&self.pages).insert(notebook_page_id.to_string(), schema);
    }

    pub fn page(&self, notebook_page_id: &str) -> Option<InitialSchema> {
        lock(&self.pages).get(notebook_page_id).cloned()
    }
}

#[async_trait]
impl PageHost for MemoryHost {
    async fn load_page(&self, notebook_page_id: &str) -> Result<InitialSchema> {
        self.page(notebook_page_id)
            .ok_or_else(|| SyncError::UnknownPage(notebook_page_id.to_string()))
    }

    async fn apply_page(&self, notebook_page_id: &str, schema: &InitialSchema) -> Result<()> {
        self.set_page(notebook_page_id, schema.clone());
        Ok(())
    }
}
