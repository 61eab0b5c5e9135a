//! Lazily-loaded hierarchy with structural edits under optimistic
//! concurrency (`expectedVersion`, server arbitrates).

mod cache;
mod search;

pub use cache::{NodeId, TreeCache, TreeNode, VisibleRow};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::debounce::Debouncer;
use crate::error::ApiError;
use crate::http::{ApiClient, ApiRequest};
use crate::notice::{LogNotifier, Notice, Notifier};

pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(350);
pub const DEFAULT_SEARCH_LIMIT: u32 = 20;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    pub search_debounce: Duration,
    pub search_limit: u32,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            search_debounce: DEFAULT_SEARCH_DEBOUNCE,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

/// Fields accepted when creating a node. `parentId` is added by
/// [`TreeController::create_child`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNode {
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

type LoadGate = Arc<tokio::sync::Mutex<()>>;

/// Clears the loading flag and the in-flight gate of one parent whether the
/// load completes or its future is dropped.
struct LoadingGuard<'a> {
    tree: &'a TreeController,
    parent: NodeId,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.tree.cache).set_loading(self.parent, false);
        lock(&self.tree.in_flight).remove(&self.parent);
    }
}

pub struct TreeController {
    api: ApiClient,
    base_path: String,
    config: TreeConfig,
    notifier: Arc<dyn Notifier>,
    cache: Mutex<TreeCache>,
    in_flight: Mutex<HashMap<NodeId, LoadGate>>,
    root_gate: tokio::sync::Mutex<()>,
    debouncer: Debouncer,
}

impl TreeController {
    pub fn new(api: ApiClient, base_path: impl Into<String>, config: TreeConfig) -> Self {
        let base_path = base_path.into();
        Self {
            api,
            base_path: base_path.trim_end_matches('/').to_string(),
            config,
            notifier: Arc::new(LogNotifier),
            cache: Mutex::new(TreeCache::default()),
            in_flight: Mutex::new(HashMap::new()),
            root_gate: tokio::sync::Mutex::new(()),
            debouncer: Debouncer::new(config.search_debounce),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> TreeConfig {
        self.config
    }

    /// Copy of the current cache, for rendering and assertions.
    pub fn snapshot(&self) -> TreeCache {
        lock(&self.cache).clone()
    }

    pub fn node(&self, id: NodeId) -> Option<TreeNode> {
        lock(&self.cache).node(id).cloned()
    }

    pub fn visible_rows(&self) -> Vec<VisibleRow> {
        lock(&self.cache).visible_rows()
    }

    fn url(&self, suffix: impl std::fmt::Display) -> String {
        format!("{}/{}", self.base_path, suffix)
    }

    fn report(&self, operation: &'static str, error: &ApiError) {
        warn!(operation, %error, "tree operation failed");
        self.notifier.notify(Notice::error(error.user_message()));
    }

    /// Fetches the root node once; later calls return the cached copy.
    pub async fn ensure_root(&self) -> Result<TreeNode, ApiError> {
        if let Some(root) = lock(&self.cache).root().cloned() {
            return Ok(root);
        }
        let _gate = self.root_gate.lock().await;
        if let Some(root) = lock(&self.cache).root().cloned() {
            return Ok(root);
        }
        let root: TreeNode = self.api.get_json(&self.url("root")).await?;
        debug!(id = root.id, "tree root loaded");
        lock(&self.cache).set_root(root.clone());
        Ok(root)
    }

    fn cached_children(&self, parent: NodeId) -> Option<Vec<TreeNode>> {
        lock(&self.cache).children_of(parent)
    }

    fn gate_for(&self, parent: NodeId) -> LoadGate {
        lock(&self.in_flight)
            .entry(parent)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Cached children when present (even if stale), otherwise one fetch.
    /// Concurrent callers for the same parent share that fetch.
    pub async fn load_children(&self, parent: NodeId) -> Result<Vec<TreeNode>, ApiError> {
        self.load_children_with(parent, None).await
    }

    /// [`load_children`](Self::load_children) that aborts its request when
    /// `cancel` fires. A cancelled load records nothing.
    pub async fn load_children_with(
        &self,
        parent: NodeId,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<TreeNode>, ApiError> {
        if let Some(children) = self.cached_children(parent) {
            return Ok(children);
        }

        let gate = self.gate_for(parent);
        let _guard = gate.lock().await;
        if let Some(children) = self.cached_children(parent) {
            return Ok(children);
        }

        lock(&self.cache).set_loading(parent, true);
        let loading = LoadingGuard { tree: self, parent };
        let request = ApiRequest::get(self.url(format!("{parent}/children")));
        let result: Result<Option<Vec<TreeNode>>, ApiError> = self
            .api
            .send(&request, cancel)
            .await
            .and_then(|response| response.data());
        if let Ok(children) = &result {
            lock(&self.cache).set_children(parent, children.clone().unwrap_or_default());
        }
        drop(loading);

        match result {
            Ok(children) => {
                let children = children.unwrap_or_default();
                debug!(parent, count = children.len(), "tree children loaded");
                Ok(children)
            }
            Err(error) => {
                warn!(parent, %error, "failed to load tree children");
                Err(error)
            }
        }
    }

    /// Returns the new expansion state of `id`.
    pub async fn toggle(&self, id: NodeId) -> Result<bool, ApiError> {
        if lock(&self.cache).is_expanded(id) {
            lock(&self.cache).collapse(id);
            return Ok(false);
        }
        self.load_children(id).await?;
        lock(&self.cache).expand(id);
        Ok(true)
    }

    /// Loads and expands every id of an ancestor chain, in order.
    pub async fn expand_path(&self, ids: &[NodeId]) -> Result<(), ApiError> {
        for id in ids {
            self.load_children(*id).await?;
            lock(&self.cache).expand(*id);
        }
        Ok(())
    }

    /// Breadth-first from the root, one request per internal node whose
    /// children are not cached yet. Returns the number of expanded nodes.
    pub async fn expand_all(&self) -> Result<usize, ApiError> {
        let root = self.ensure_root().await?;
        let mut queue = VecDeque::from([root]);
        let mut expanded = 0usize;
        while let Some(node) = queue.pop_front() {
            if !node.may_have_children() {
                continue;
            }
            let children = self.load_children(node.id).await?;
            if children.is_empty() {
                continue;
            }
            lock(&self.cache).expand(node.id);
            expanded += 1;
            queue.extend(children);
        }
        info!(expanded, "tree fully expanded");
        Ok(expanded)
    }

    pub fn collapse_all(&self) {
        lock(&self.cache).collapse_all();
    }

    /// Moves `id` under `new_parent` with the node's last known version as
    /// the precondition. On failure the cache is left untouched.
    pub async fn move_node(&self, id: NodeId, new_parent: NodeId) -> Result<TreeNode, ApiError> {
        let Some(node) = self.node(id) else {
            let error = ApiError::InvalidRequest(format!("node {id} is not loaded"));
            self.report("move", &error);
            return Err(error);
        };
        let request = ApiRequest::patch(self.url(format!("{id}/move"))).json(&json!({
            "newParentId": new_parent,
            "expectedVersion": node.version,
        }))?;
        if let Err(error) = self.api.send(&request, None).await {
            self.report("move", &error);
            return Err(error);
        }

        {
            let mut cache = lock(&self.cache);
            if let Some(old_parent) = node.parent_id {
                cache.evict_children(old_parent);
            }
            cache.evict_children(new_parent);
        }
        info!(id, old_parent = ?node.parent_id, new_parent, "tree node moved");

        match self.api.get_json::<TreeNode>(&self.url(id)).await {
            Ok(moved) => {
                lock(&self.cache).upsert(moved.clone());
                Ok(moved)
            }
            Err(error) => {
                warn!(id, %error, "failed to reload moved node");
                Err(error)
            }
        }
    }

    /// Creates a node under `parent`, appends it to the parent's loaded child
    /// list and expands the parent.
    pub async fn create_child(&self, parent: NodeId, payload: &NewNode) -> Result<TreeNode, ApiError> {
        let mut body = serde_json::to_value(payload)?;
        if let Value::Object(map) = &mut body {
            map.insert("parentId".to_string(), json!(parent));
        }
        let request = ApiRequest::post(self.base_path.clone()).json(&body)?;
        let created: TreeNode = match self.api.send(&request, None).await.and_then(|r| r.data()) {
            Ok(created) => created,
            Err(error) => {
                self.report("create", &error);
                return Err(error);
            }
        };

        let appended = lock(&self.cache).append_child(parent, created.clone());
        if !appended {
            // Parent never listed: fetch the full list so it is not a
            // one-element stand-in.
            self.load_children(parent).await?;
        }
        lock(&self.cache).expand(parent);
        info!(id = created.id, parent, "tree node created");
        Ok(created)
    }

    /// Updates `id` with its last known version as the precondition. Like
    /// [`move_node`](Self::move_node), the node must be loaded.
    pub async fn rename(&self, id: NodeId, patch: &NodePatch) -> Result<TreeNode, ApiError> {
        let Some(node) = self.node(id) else {
            let error = ApiError::InvalidRequest(format!("node {id} is not loaded"));
            self.report("rename", &error);
            return Err(error);
        };
        let version = node.version;
        let mut body = serde_json::to_value(patch)?;
        if let Value::Object(map) = &mut body {
            map.insert("expectedVersion".to_string(), json!(version));
        }
        let request = ApiRequest::patch(self.url(id)).json(&body)?;
        let updated: TreeNode = match self.api.send(&request, None).await.and_then(|r| r.data()) {
            Ok(updated) => updated,
            Err(error) => {
                self.report("rename", &error);
                return Err(error);
            }
        };
        lock(&self.cache).upsert(updated.clone());
        Ok(updated)
    }
}
