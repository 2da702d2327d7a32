//! Backend page directory
//!
//! The directory registers shared pages, hands out their stored state to
//! joining notebooks, keeps backlog messages for offline notebooks, and
//! fans accepted updates out to every linked notebook.

use crate::config::SyncConfig;
use crate::envelope::Envelope;
use crate::{Result, SyncError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use folio_common::Notebook;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outcome of registering a page as shared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    /// Shared page uuid
    pub id: String,
    /// False when this notebook had already registered the page
    pub created: bool,
}

/// State handed to a notebook joining a shared page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResponse {
    pub state: Vec<u8>,
    /// Whether this call created the notebook's link on the backend
    pub link_created: bool,
    pub notebook_page_id: String,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn init_shared_page(&self, notebook_page_id: &str, state: &[u8]) -> Result<InitResponse>;

    async fn join_shared_page(&self, notebook_page_id: &str, page_uuid: &str) -> Result<JoinResponse>;

    /// Record changes and fan them out to the other linked notebooks
    async fn update_shared_page(
        &self,
        notebook_page_id: &str,
        changes: &[Vec<u8>],
        state: &[u8],
    ) -> Result<()>;

    async fn disconnect_shared_page(&self, notebook_page_id: &str) -> Result<()>;

    async fn list_shared_pages(&self) -> Result<Vec<String>>;

    async fn save_page_version(&self, notebook_page_id: &str, version: &str) -> Result<()>;

    async fn relink_shared_page(&self, old_page_id: &str, new_page_id: &str) -> Result<()>;

    /// Fetch one backlog message queued while this notebook was offline
    async fn get_message(&self, message_uuid: &str) -> Result<Envelope>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinWire {
    state: String,
    #[serde(default)]
    link_created: bool,
    notebook_page_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListWire {
    notebook_page_ids: Vec<String>,
}

/// Directory reached over HTTP: `POST <endpoint>/page` with a `method` field
pub struct HttpDirectory {
    client: reqwest::Client,
    endpoint: String,
    notebook: Notebook,
    token: Option<String>,
}

impl HttpDirectory {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.directory_endpoint.trim_end_matches('/').to_string(),
            notebook: config.notebook.clone(),
            token: config.auth_token.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, mut body: Value) -> Result<T> {
        if let Value::Object(map) = &mut body {
            map.insert("method".into(), json!(method));
            map.insert("notebook".into(), serde_json::to_value(&self.notebook)?);
        }

        let mut request = self.client.post(format!("{}/page", self.endpoint)).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        tracing::debug!("Directory call {}", method);
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::DirectoryError(format!(
                "{} failed ({}): {}",
                method, status, text
            )));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::DirectoryError(format!("{} returned malformed body: {}", method, e)))
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn init_shared_page(&self, notebook_page_id: &str, state: &[u8]) -> Result<InitResponse> {
        self.call(
            "init-shared-page",
            json!({ "notebookPageId": notebook_page_id, "state": STANDARD.encode(state) }),
        )
        .await
    }

    async fn join_shared_page(&self, notebook_page_id: &str, page_uuid: &str) -> Result<JoinResponse> {
        let wire: JoinWire = self
            .call(
                "join-shared-page",
                json!({ "notebookPageId": notebook_page_id, "pageUuid": page_uuid }),
            )
            .await?;
        Ok(JoinResponse {
            state: STANDARD.decode(wire.state)?,
            link_created: wire.link_created,
            notebook_page_id: wire.notebook_page_id,
        })
    }

    async fn update_shared_page(
        &self,
        notebook_page_id: &str,
        changes: &[Vec<u8>],
        state: &[u8],
    ) -> Result<()> {
        let changes: Vec<String> = changes.iter().map(|c| STANDARD.encode(c)).collect();
        let _: Value = self
            .call(
                "update-shared-page",
                json!({
                    "notebookPageId": notebook_page_id,
                    "changes": changes,
                    "state": STANDARD.encode(state),
                }),
            )
            .await?;
        Ok(())
    }

    async fn disconnect_shared_page(&self, notebook_page_id: &str) -> Result<()> {
        let _: Value = self
            .call(
                "disconnect-shared-page",
                json!({ "notebookPageId": notebook_page_id }),
            )
            .await?;
        Ok(())
    }

    async fn list_shared_pages(&self) -> Result<Vec<String>> {
        let wire: ListWire = self.call("list-shared-pages", json!({})).await?;
        Ok(wire.notebook_page_ids)
    }

    async fn save_page_version(&self, notebook_page_id: &str, version: &str) -> Result<()> {
        let _: Value = self
            .call(
                "save-page-version",
                json!({ "notebookPageId": notebook_page_id, "version": version }),
            )
            .await?;
        Ok(())
    }

    async fn relink_shared_page(&self, old_page_id: &str, new_page_id: &str) -> Result<()> {
        let _: Value = self
            .call(
                "relink-shared-page",
                json!({ "oldNotebookPageId": old_page_id, "newNotebookPageId": new_page_id }),
            )
            .await?;
        Ok(())
    }

    async fn get_message(&self, message_uuid: &str) -> Result<Envelope> {
        self.call("get-message", json!({ "messageUuid": message_uuid }))
            .await
    }
}
