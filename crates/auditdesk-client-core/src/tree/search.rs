use tracing::debug;

use super::{NodeId, TreeController, TreeNode, lock};
use crate::cancel::CancelToken;
use crate::error::ApiError;
use crate::http::ApiRequest;

impl TreeController {
    /// Debounced search. `Ok(None)` means a newer query superseded this one,
    /// either before the request went out or while it was in flight.
    pub async fn search(&self, query: &str) -> Result<Option<Vec<TreeNode>>, ApiError> {
        self.search_with(query, None).await
    }

    /// [`search`](Self::search) whose request is aborted when `cancel` fires.
    pub async fn search_with(
        &self,
        query: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Vec<TreeNode>>, ApiError> {
        let query = query.trim();
        if query.is_empty() {
            self.debouncer.bump();
            return Ok(Some(Vec::new()));
        }
        let Some(ticket) = self.debouncer.settle().await else {
            debug!(query, "search superseded before dispatch");
            return Ok(None);
        };

        let request = ApiRequest::get(self.url("search"))
            .query("q", query)
            .query("limit", self.config.search_limit);
        let hits: Option<Vec<TreeNode>> = self.api.send(&request, cancel).await?.data()?;
        if !ticket.is_current() {
            debug!(query, "discarding stale search response");
            return Ok(None);
        }
        Ok(Some(hits.unwrap_or_default()))
    }

    /// Ancestors of `id`, root first, as reported by the server.
    pub async fn ancestors(&self, id: NodeId) -> Result<Vec<TreeNode>, ApiError> {
        let ancestors: Option<Vec<TreeNode>> =
            self.api.get_json(&self.url(format!("{id}/ancestors"))).await?;
        let ancestors = ancestors.unwrap_or_default();
        let mut cache = lock(&self.cache);
        for node in &ancestors {
            cache.upsert(node.clone());
        }
        Ok(ancestors)
    }

    /// Expands the chain leading to `id` so a search hit becomes visible,
    /// whatever the current expansion state. Returns the expanded chain.
    pub async fn reveal(&self, id: NodeId) -> Result<Vec<NodeId>, ApiError> {
        self.ensure_root().await?;
        let chain = self
            .ancestors(id)
            .await?
            .into_iter()
            .map(|node| node.id)
            .filter(|ancestor| *ancestor != id)
            .collect::<Vec<_>>();
        self.expand_path(&chain).await?;
        Ok(chain)
    }
}
