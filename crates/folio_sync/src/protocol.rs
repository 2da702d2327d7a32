//! Shared-page protocol
//!
//! A page becomes shared when its notebook registers it with the directory.
//! Other notebooks are invited with SHARE_PAGE, join through the directory,
//! and from then on every local edit is committed to the page's CRDT,
//! persisted, and handed to the directory, which fans the diff out as
//! SHARE_PAGE_UPDATE to every other linked notebook.
//!
//! All work on one page is serialized by a per-page lock. A remote update
//! that cannot be applied leaves the page *broken*: the diffs are retained
//! and retried by the next update or by [`SharedPages::repair`]. Local diffs
//! the directory did not accept are kept the same way and go out ahead of
//! the next local diff, so peers never see a change without its parents.

use crate::directory::{Directory, InitResponse};
use crate::doc::{hex_heads, SharedDocument};
use crate::envelope::{operation, Envelope};
use crate::events::EventBus;
use crate::host::PageHost;
use crate::router::{Router, Via};
use crate::store::{PageLink, PageStore};
use crate::util::lock;
use crate::{Result, SyncError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use folio_common::Notebook;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareInvite {
    pub page_uuid: String,
    /// The inviter's page id, shown to the invitee
    pub notebook_page_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareResponse {
    pub success: bool,
    pub page_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareUpdate {
    /// Base64 change blobs
    pub changes: Vec<String>,
    /// The receiver's page id
    pub notebook_page_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareForce {
    /// Base64 full document state
    pub state: String,
    pub page_uuid: String,
}

/// An invitation waiting for the host to accept or reject it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInvitation {
    pub source: Notebook,
    pub page_uuid: String,
    pub notebook_page_id: String,
}

/// One async mutex per page id
#[derive(Default)]
pub struct PageLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PageLocks {
    pub async fn acquire(&self, notebook_page_id: &str) -> OwnedMutexGuard<()> {
        let page = lock(&self.locks)
            .entry(notebook_page_id.to_string())
            .or_default()
            .clone();
        page.lock_owned().await
    }
}

/// The shared pages of one notebook; clones share state
#[derive(Clone)]
pub struct SharedPages {
    inner: Arc<PagesInner>,
}

struct PagesInner {
    notebook: Notebook,
    router: Router,
    directory: Arc<dyn Directory>,
    store: Arc<dyn PageStore>,
    host: Arc<dyn PageHost>,
    events: EventBus,
    links: Mutex<HashMap<String, PageLink>>,
    invitations: Mutex<HashMap<String, PendingInvitation>>,
    broken: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    unsent: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    locks: PageLocks,
}

impl SharedPages {
    pub fn new(
        notebook: Notebook,
        router: Router,
        directory: Arc<dyn Directory>,
        store: Arc<dyn PageStore>,
        host: Arc<dyn PageHost>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(PagesInner {
                notebook,
                router,
                directory,
                store,
                host,
                events,
                links: Mutex::new(HashMap::new()),
                invitations: Mutex::new(HashMap::new()),
                broken: Mutex::new(HashMap::new()),
                unsent: Mutex::new(HashMap::new()),
                locks: PageLocks::default(),
            }),
        }
    }

    /// Load persisted links
    pub async fn restore(&self) -> Result<usize> {
        let links = self.inner.store.load_links().await?;
        let count = links.len();
        *lock(&self.inner.links) = links;
        tracing::info!("Restored {} shared page links", count);
        Ok(count)
    }

    pub fn register_handlers(&self, router: &Router) {
        let pages = self.clone();
        router.register(operation::SHARE_PAGE, move |envelope| {
            let pages = pages.clone();
            async move { pages.on_share_page(envelope) }
        });

        let pages = self.clone();
        router.register(operation::SHARE_PAGE_RESPONSE, move |envelope| {
            let pages = pages.clone();
            async move { pages.on_share_response(envelope) }
        });

        let pages = self.clone();
        router.register(operation::SHARE_PAGE_UPDATE, move |envelope| {
            let pages = pages.clone();
            async move { pages.on_share_update(envelope).await }
        });

        let pages = self.clone();
        router.register(operation::SHARE_PAGE_FORCE, move |envelope| {
            let pages = pages.clone();
            async move { pages.on_share_force(envelope).await }
        });
    }

    pub fn link(&self, notebook_page_id: &str) -> Option<PageLink> {
        lock(&self.inner.links).get(notebook_page_id).cloned()
    }

    pub fn links(&self) -> HashMap<String, PageLink> {
        lock(&self.inner.links).clone()
    }

    pub fn invitations(&self) -> Vec<PendingInvitation> {
        let mut pending: Vec<PendingInvitation> =
            lock(&self.inner.invitations).values().cloned().collect();
        pending.sort_by(|a, b| a.page_uuid.cmp(&b.page_uuid));
        pending
    }

    pub fn is_broken(&self, notebook_page_id: &str) -> bool {
        lock(&self.inner.broken).contains_key(notebook_page_id)
    }

    /// Local diffs of a page still waiting for the directory
    pub fn unsent_changes(&self, notebook_page_id: &str) -> usize {
        lock(&self.inner.unsent)
            .get(notebook_page_id)
            .map_or(0, Vec::len)
    }

    pub fn broken_pages(&self) -> Vec<String> {
        let mut pages: Vec<String> = lock(&self.inner.broken).keys().cloned().collect();
        pages.sort();
        pages
    }

    /// Register a local page as shared and seed its document
    #[tracing::instrument(skip(self))]
    pub async fn init_page(&self, notebook_page_id: &str) -> Result<InitResponse> {
        let inner = &self.inner;
        let _guard = inner.locks.acquire(notebook_page_id).await;

        let schema = inner.host.load_page(notebook_page_id).await?;
        let mut doc = SharedDocument::from_schema(&inner.notebook, &schema)?;
        let state = doc.save();
        let response = inner
            .directory
            .init_shared_page(notebook_page_id, &state)
            .await?;

        if !response.created {
            inner.events.warning(
                format!("share-page-{}", notebook_page_id),
                "Already shared",
                &format!("{} is already shared", notebook_page_id),
            );
            return Ok(response);
        }

        inner.store.save(notebook_page_id, &state).await?;
        self.insert_link(notebook_page_id, &response.id).await?;
        self.save_version(notebook_page_id, &mut doc).await;
        inner.events.success(
            format!("share-page-{}", notebook_page_id),
            "Page shared",
            &format!("{} is now shared", notebook_page_id),
        );
        Ok(response)
    }

    /// Invite `target` to a page this notebook shares
    pub fn invite(&self, notebook_page_id: &str, target: &Notebook) -> Result<Via> {
        let link = self.require_link(notebook_page_id)?;
        let via = self.inner.router.send_to_notebook(
            target,
            operation::SHARE_PAGE,
            ShareInvite {
                page_uuid: link.shared_page_uuid,
                notebook_page_id: notebook_page_id.to_string(),
            },
        )?;
        tracing::info!("Invited {} to {} via {:?}", target, notebook_page_id, via);
        Ok(via)
    }

    /// Join an invited page as the local page `notebook_page_id`.
    ///
    /// If the local side fails after the directory created the link, the
    /// link is disconnected again before the error is returned.
    #[tracing::instrument(skip(self))]
    pub async fn accept(&self, page_uuid: &str, notebook_page_id: &str) -> Result<()> {
        let inner = &self.inner;
        let invitation = lock(&inner.invitations)
            .remove(page_uuid)
            .ok_or_else(|| SyncError::UnknownPage(page_uuid.to_string()))?;
        let _guard = inner.locks.acquire(notebook_page_id).await;

        let joined = match inner
            .directory
            .join_shared_page(notebook_page_id, page_uuid)
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                self.respond(&invitation, false);
                return Err(e);
            }
        };

        if let Err(e) = self.adopt(notebook_page_id, page_uuid, &joined.state).await {
            if joined.link_created {
                if let Err(undo) = inner.directory.disconnect_shared_page(notebook_page_id).await {
                    tracing::warn!("Could not undo join of {}: {}", notebook_page_id, undo);
                }
            }
            self.respond(&invitation, false);
            inner.events.error(
                format!("share-page-{}", page_uuid),
                "Join failed",
                &format!("Could not join {}: {}", invitation.notebook_page_id, e),
            );
            return Err(e);
        }

        self.respond(&invitation, true);
        inner.events.success(
            format!("share-page-{}", page_uuid),
            "Joined page",
            &format!(
                "{} is now shared with {}",
                notebook_page_id, invitation.source
            ),
        );
        Ok(())
    }

    /// Decline an invitation
    pub fn reject(&self, page_uuid: &str) -> Result<()> {
        let invitation = lock(&self.inner.invitations)
            .remove(page_uuid)
            .ok_or_else(|| SyncError::UnknownPage(page_uuid.to_string()))?;
        self.respond(&invitation, false);
        Ok(())
    }

    /// Commit a local change to the page's document, persist it, and
    /// broadcast the resulting diff
    #[tracing::instrument(skip(self, change))]
    pub async fn edit<F>(&self, notebook_page_id: &str, change: F) -> Result<()>
    where
        F: FnOnce(&mut SharedDocument) -> Result<()> + Send,
    {
        let inner = &self.inner;
        self.require_link(notebook_page_id)?;
        let _guard = inner.locks.acquire(notebook_page_id).await;

        let mut doc = self.load_document(notebook_page_id).await?;
        let base = doc.heads();
        change(&mut doc)?;
        if doc.heads() == base {
            return Ok(());
        }

        let diff = doc.changes_since(&base);
        let state = doc.save();
        inner.store.save(notebook_page_id, &state).await?;
        inner
            .host
            .apply_page(notebook_page_id, &doc.to_schema()?)
            .await?;
        self.publish(notebook_page_id, Some(diff), &state).await?;
        self.save_version(notebook_page_id, &mut doc).await;
        Ok(())
    }

    pub async fn insert_text(&self, notebook_page_id: &str, index: usize, text: &str) -> Result<()> {
        let text = text.to_string();
        self.edit(notebook_page_id, move |doc| doc.insert_text(index, &text))
            .await
    }

    pub async fn delete_text(&self, notebook_page_id: &str, index: usize, count: usize) -> Result<()> {
        self.edit(notebook_page_id, move |doc| doc.delete_text(index, count))
            .await
    }

    /// Pull the host's current snapshot into the shared document
    pub async fn sync_from_host(&self, notebook_page_id: &str) -> Result<()> {
        let schema = self.inner.host.load_page(notebook_page_id).await?;
        self.edit(notebook_page_id, move |doc| doc.replace_with(&schema))
            .await
    }

    /// Materialized state of a shared page
    pub async fn page_state(&self, notebook_page_id: &str) -> Result<folio_text::InitialSchema> {
        self.load_document(notebook_page_id).await?.to_schema()
    }

    /// Retry diffs retained by a failed remote update, then resend local
    /// diffs the directory has not accepted yet
    #[tracing::instrument(skip(self))]
    pub async fn repair(&self, notebook_page_id: &str) -> Result<()> {
        let _guard = self.inner.locks.acquire(notebook_page_id).await;
        let pending = lock(&self.inner.broken)
            .remove(notebook_page_id)
            .unwrap_or_default();
        let unsent = self.unsent_changes(notebook_page_id) > 0;
        if pending.is_empty() && !unsent {
            return Ok(());
        }

        if !pending.is_empty() {
            if let Err(e) = self.apply_remote(notebook_page_id, &pending).await {
                lock(&self.inner.broken).insert(notebook_page_id.to_string(), pending);
                return Err(e);
            }
        }
        if unsent {
            let mut doc = self.load_document(notebook_page_id).await?;
            let state = doc.save();
            self.publish(notebook_page_id, None, &state).await?;
        }
        self.inner.events.success(
            format!("page-broken-{}", notebook_page_id),
            "Page repaired",
            &format!("{} is back in sync", notebook_page_id),
        );
        Ok(())
    }

    /// Overwrite `target`'s copy of the page with this notebook's state
    #[tracing::instrument(skip(self))]
    pub async fn force_push(&self, notebook_page_id: &str, target: &Notebook) -> Result<Via> {
        let link = self.require_link(notebook_page_id)?;
        let state = {
            let _guard = self.inner.locks.acquire(notebook_page_id).await;
            self.load_document(notebook_page_id).await?.save()
        };
        self.inner.router.send_to_notebook(
            target,
            operation::SHARE_PAGE_FORCE,
            ShareForce {
                state: STANDARD.encode(state),
                page_uuid: link.shared_page_uuid,
            },
        )
    }

    /// Move a shared page to a new local id
    #[tracing::instrument(skip(self))]
    pub async fn retitle(&self, old_page_id: &str, new_page_id: &str) -> Result<()> {
        let inner = &self.inner;
        let link = self.require_link(old_page_id)?;
        let _guard = inner.locks.acquire(old_page_id).await;

        let state = inner
            .store
            .load(old_page_id)
            .await?
            .ok_or_else(|| SyncError::UnknownPage(old_page_id.to_string()))?;
        inner
            .directory
            .relink_shared_page(old_page_id, new_page_id)
            .await?;
        inner.store.save(new_page_id, &state).await?;
        inner.store.remove(old_page_id).await?;
        for retained in [&inner.broken, &inner.unsent] {
            let mut retained = lock(retained);
            if let Some(diffs) = retained.remove(old_page_id) {
                retained.insert(new_page_id.to_string(), diffs);
            }
        }

        let snapshot = {
            let mut links = lock(&inner.links);
            links.remove(old_page_id);
            links.insert(new_page_id.to_string(), link);
            links.clone()
        };
        inner.store.save_links(&snapshot).await?;
        tracing::info!("Retitled shared page {} -> {}", old_page_id, new_page_id);
        Ok(())
    }

    /// Stop sharing a page locally; other notebooks are not told
    pub async fn disconnect(&self, notebook_page_id: &str) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.locks.acquire(notebook_page_id).await;

        let snapshot = {
            let mut links = lock(&inner.links);
            links
                .remove(notebook_page_id)
                .ok_or_else(|| SyncError::UnknownPage(notebook_page_id.to_string()))?;
            links.clone()
        };
        inner.store.save_links(&snapshot).await?;
        inner.store.remove(notebook_page_id).await?;
        lock(&inner.broken).remove(notebook_page_id);
        lock(&inner.unsent).remove(notebook_page_id);

        if let Err(e) = inner.directory.disconnect_shared_page(notebook_page_id).await {
            tracing::warn!("Directory disconnect of {} failed: {}", notebook_page_id, e);
        }
        inner.events.info(
            format!("share-page-{}", notebook_page_id),
            "Page unshared",
            &format!("{} is no longer shared", notebook_page_id),
        );
        Ok(())
    }

    pub async fn list_shared_pages(&self) -> Result<Vec<String>> {
        self.inner.directory.list_shared_pages().await
    }

    fn on_share_page(&self, envelope: Envelope) -> Result<()> {
        let source = envelope.require_source()?.clone();
        let invite: ShareInvite = envelope.payload()?;

        let invitation = PendingInvitation {
            source: source.clone(),
            page_uuid: invite.page_uuid.clone(),
            notebook_page_id: invite.notebook_page_id.clone(),
        };
        lock(&self.inner.invitations).insert(invite.page_uuid.clone(), invitation);

        self.inner.events.info(
            format!("share-page-{}", invite.page_uuid),
            "Page shared with you",
            &format!("{} invited you to {}", source, invite.notebook_page_id),
        );
        Ok(())
    }

    fn on_share_response(&self, envelope: Envelope) -> Result<()> {
        let source = envelope.require_source()?.clone();
        let response: ShareResponse = envelope.payload()?;
        let id = format!("share-page-{}", response.page_uuid);
        if response.success {
            self.inner
                .events
                .success(id, "Invitation accepted", &format!("{} joined the page", source));
        } else {
            self.inner
                .events
                .info(id, "Invitation declined", &format!("{} did not join the page", source));
        }
        Ok(())
    }

    async fn on_share_update(&self, envelope: Envelope) -> Result<()> {
        let update: ShareUpdate = envelope.payload()?;
        let page = update.notebook_page_id;
        if self.link(&page).is_none() {
            tracing::warn!("Update for page {} which is not shared here", page);
            return Ok(());
        }

        let changes = update
            .changes
            .iter()
            .map(|c| STANDARD.decode(c))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let _guard = self.inner.locks.acquire(&page).await;
        let mut pending = lock(&self.inner.broken).remove(&page).unwrap_or_default();
        pending.extend(changes);

        if let Err(e) = self.apply_remote(&page, &pending).await {
            lock(&self.inner.broken).insert(page.clone(), pending);
            self.inner.events.error(
                format!("page-broken-{}", page),
                "Shared page out of sync",
                &format!("{}: {}; changes kept for retry", page, e),
            );
        }
        Ok(())
    }

    async fn on_share_force(&self, envelope: Envelope) -> Result<()> {
        let source = envelope.require_source()?.clone();
        let force: ShareForce = envelope.payload()?;
        let page = self
            .page_for_uuid(&force.page_uuid)
            .ok_or_else(|| SyncError::UnknownPage(force.page_uuid.clone()))?;
        let state = STANDARD.decode(force.state)?;

        let _guard = self.inner.locks.acquire(&page).await;
        let mut doc = SharedDocument::load(&self.inner.notebook, &state)?;
        self.inner.store.save(&page, &doc.save()).await?;
        self.inner.host.apply_page(&page, &doc.to_schema()?).await?;
        lock(&self.inner.broken).remove(&page);

        self.inner.events.info(
            format!("page-forced-{}", page),
            "Page replaced",
            &format!("{} replaced {} with its copy", source, page),
        );
        Ok(())
    }

    /// Hand local diffs to the directory, oldest first. On failure they are
    /// kept for the next call.
    async fn publish(&self, notebook_page_id: &str, diff: Option<Vec<u8>>, state: &[u8]) -> Result<()> {
        let mut pending = lock(&self.inner.unsent)
            .remove(notebook_page_id)
            .unwrap_or_default();
        pending.extend(diff);
        if pending.is_empty() {
            return Ok(());
        }

        if let Err(e) = self
            .inner
            .directory
            .update_shared_page(notebook_page_id, &pending, state)
            .await
        {
            let count = pending.len();
            lock(&self.inner.unsent).insert(notebook_page_id.to_string(), pending);
            self.inner.events.warning(
                format!("page-unsent-{}", notebook_page_id),
                "Changes not sent",
                &format!(
                    "{}: {} change(s) kept until the directory accepts them",
                    notebook_page_id, count
                ),
            );
            return Err(e);
        }
        tracing::debug!("Sent {} change(s) of {}", pending.len(), notebook_page_id);
        Ok(())
    }

    async fn apply_remote(&self, notebook_page_id: &str, changes: &[Vec<u8>]) -> Result<()> {
        let mut doc = self.load_document(notebook_page_id).await?;
        doc.apply_changes(changes)?;
        let state = doc.save();
        self.inner.store.save(notebook_page_id, &state).await?;
        self.inner
            .host
            .apply_page(notebook_page_id, &doc.to_schema()?)
            .await?;
        self.save_version(notebook_page_id, &mut doc).await;
        Ok(())
    }

    async fn adopt(&self, notebook_page_id: &str, page_uuid: &str, state: &[u8]) -> Result<()> {
        let mut doc = SharedDocument::load(&self.inner.notebook, state)?;
        let schema = doc.to_schema()?;
        self.inner.store.save(notebook_page_id, &doc.save()).await?;
        self.inner.host.apply_page(notebook_page_id, &schema).await?;
        self.insert_link(notebook_page_id, page_uuid).await
    }

    async fn load_document(&self, notebook_page_id: &str) -> Result<SharedDocument> {
        let bytes = self
            .inner
            .store
            .load(notebook_page_id)
            .await?
            .ok_or_else(|| SyncError::UnknownPage(notebook_page_id.to_string()))?;
        SharedDocument::load(&self.inner.notebook, &bytes)
    }

    async fn insert_link(&self, notebook_page_id: &str, page_uuid: &str) -> Result<()> {
        let snapshot = {
            let mut links = lock(&self.inner.links);
            links.insert(
                notebook_page_id.to_string(),
                PageLink {
                    shared_page_uuid: page_uuid.to_string(),
                    is_shared: true,
                },
            );
            links.clone()
        };
        self.inner.store.save_links(&snapshot).await
    }

    async fn save_version(&self, notebook_page_id: &str, doc: &mut SharedDocument) {
        let version = hex_heads(&doc.heads()).join(",");
        if let Err(e) = self
            .inner
            .directory
            .save_page_version(notebook_page_id, &version)
            .await
        {
            tracing::warn!("Could not record version of {}: {}", notebook_page_id, e);
        }
    }

    fn respond(&self, invitation: &PendingInvitation, success: bool) {
        let response = ShareResponse {
            success,
            page_uuid: invitation.page_uuid.clone(),
        };
        if let Err(e) = self.inner.router.send_to_notebook(
            &invitation.source,
            operation::SHARE_PAGE_RESPONSE,
            response,
        ) {
            tracing::warn!("Could not answer {}: {}", invitation.source, e);
        }
    }

    fn require_link(&self, notebook_page_id: &str) -> Result<PageLink> {
        self.link(notebook_page_id)
            .ok_or_else(|| SyncError::UnknownPage(notebook_page_id.to_string()))
    }

    fn page_for_uuid(&self, page_uuid: &str) -> Option<String> {
        lock(&self.inner.links)
            .iter()
            .find(|(_, link)| link.shared_page_uuid == page_uuid)
            .map(|(id, _)| id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_payload_wire_names() {
        let update = serde_json::to_value(ShareUpdate {
            changes: vec!["AAE=".into()],
            notebook_page_id: "page-1".into(),
        })
        .unwrap();
        assert_eq!(
            update,
            serde_json::json!({"changes": ["AAE="], "notebookPageId": "page-1"})
        );

        let invite: ShareInvite =
            serde_json::from_str(r#"{"pageUuid": "u-1", "notebookPageId": "p"}"#).unwrap();
        assert_eq!(invite.page_uuid, "u-1");
    }

    #[tokio::test]
    async fn test_page_locks_serialize_one_page() {
        let locks = Arc::new(PageLocks::default());
        let guard = locks.acquire("page-1").await;

        // another page is independent
        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire("page-2")).await;
        assert!(other.is_ok());

        let waiting = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _second = locks.acquire("page-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }
}
