//! Generic server-side table controller: pagination, search, filters, sort,
//! and CRUD with refetch-after-write.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::ApiError;
use crate::http::{ApiClient, ApiRequest, ApiResponse};
use crate::notice::{LogNotifier, Notice, Notifier};

pub const DEFAULT_PAGE_SIZE: u32 = 10;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub key: String,
    pub label: String,
    pub sortable: bool,
}

impl ColumnDef {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            sortable: true,
        }
    }

    #[must_use]
    pub fn unsortable(mut self) -> Self {
        self.sortable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    pub page: u32,
    pub page_size: u32,
    pub search: String,
    pub filters: BTreeMap<String, Value>,
    pub sort_key: Option<String>,
    pub sort_order: SortOrder,
}

impl Default for TableQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            search: String::new(),
            filters: BTreeMap::new(),
            sort_key: None,
            sort_order: SortOrder::Asc,
        }
    }
}

impl TableQuery {
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("page".to_string(), self.page.to_string()),
            ("size".to_string(), self.page_size.to_string()),
        ];
        let search = self.search.trim();
        if !search.is_empty() {
            pairs.push(("search".to_string(), search.to_string()));
        }
        for (key, value) in &self.filters {
            let rendered = match value {
                Value::Null => continue,
                Value::String(text) if text.is_empty() => continue,
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            pairs.push((key.clone(), rendered));
        }
        if let Some(sort_key) = &self.sort_key {
            pairs.push(("sort".to_string(), sort_key.clone()));
            pairs.push(("order".to_string(), self.sort_order.as_str().to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone)]
pub struct TableSnapshot<T> {
    pub query: TableQuery,
    pub data: Vec<T>,
    pub total: u64,
    pub loading: bool,
}

/// One page of rows and the server's idea of the total row count.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Accepts a bare array (total from `X-Total-Count`, else its length) or a
/// paginated envelope `{content, totalElements}`.
pub fn parse_page<T: DeserializeOwned>(response: &ApiResponse) -> Result<Page<T>, ApiError> {
    let data: Value = response.data()?;
    let header_total = response.total_count();
    match data {
        Value::Array(rows) => {
            let items = decode_rows(rows)?;
            let total = header_total.unwrap_or(items.len() as u64);
            Ok(Page { items, total })
        }
        Value::Object(mut map) => {
            let rows = match map.remove("content") {
                Some(Value::Array(rows)) => rows,
                _ => {
                    return Err(ApiError::Decode(
                        "paginated response is missing a content array".to_string(),
                    ));
                }
            };
            let envelope_total = map.get("totalElements").and_then(Value::as_u64);
            let items = decode_rows(rows)?;
            let total = header_total
                .or(envelope_total)
                .unwrap_or(items.len() as u64);
            Ok(Page { items, total })
        }
        Value::Null => Ok(Page {
            items: Vec::new(),
            total: header_total.unwrap_or(0),
        }),
        other => Err(ApiError::Decode(format!(
            "unexpected table payload: {other}"
        ))),
    }
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, ApiError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(ApiError::from))
        .collect()
}

struct TableState<T> {
    query: TableQuery,
    data: Vec<T>,
    total: u64,
    loading: bool,
}

pub struct TableController<T> {
    api: ApiClient,
    resource: String,
    columns: Vec<ColumnDef>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<TableState<T>>,
    generation: AtomicU64,
    _rows: PhantomData<fn() -> T>,
}

impl<T> TableController<T>
where
    T: DeserializeOwned + Clone + Send,
{
    pub fn new(api: ApiClient, resource: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let resource = resource.into();
        Self {
            api,
            resource: resource.trim_end_matches('/').to_string(),
            columns,
            notifier: Arc::new(LogNotifier),
            state: Mutex::new(TableState {
                query: TableQuery::default(),
                data: Vec::new(),
                total: 0,
                loading: false,
            }),
            generation: AtomicU64::new(0),
            _rows: PhantomData,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_page_size(self, page_size: u32) -> Self {
        lock(&self.state).query.page_size = page_size.max(1);
        self
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn query(&self) -> TableQuery {
        lock(&self.state).query.clone()
    }

    pub fn snapshot(&self) -> TableSnapshot<T> {
        let state = lock(&self.state);
        TableSnapshot {
            query: state.query.clone(),
            data: state.data.clone(),
            total: state.total,
            loading: state.loading,
        }
    }

    /// Loads the page described by the current query state. A response that
    /// arrives after a newer fetch has started is discarded.
    pub async fn fetch(&self) -> Result<(), ApiError> {
        self.fetch_with(None).await
    }

    /// [`fetch`](Self::fetch) whose request is aborted when `cancel` fires.
    pub async fn fetch_with(&self, cancel: Option<&CancelToken>) -> Result<(), ApiError> {
        let (query, generation) = {
            let mut state = lock(&self.state);
            state.loading = true;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (state.query.clone(), generation)
        };
        let loading = LoadingGuard {
            state: &self.state,
            generation: &self.generation,
            mine: generation,
        };

        let request = ApiRequest::get(self.resource.clone()).query_pairs(query.query_pairs());
        let result = match self.api.send(&request, cancel).await {
            Ok(response) => parse_page::<T>(&response),
            Err(error) => Err(error),
        };
        drop(loading);

        let mut state = lock(&self.state);
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(resource = %self.resource, generation, "discarding superseded table response");
            return Ok(());
        }
        match result {
            Ok(page) => {
                state.data = page.items;
                state.total = page.total;
                Ok(())
            }
            Err(error) => {
                warn!(resource = %self.resource, %error, "table fetch failed");
                Err(error)
            }
        }
    }

    pub async fn create_item<B: Serialize>(&self, item: &B) -> Result<(), ApiError> {
        let request = ApiRequest::post(self.resource.clone()).json(item)?;
        self.write(request, "create").await
    }

    pub async fn update_item<B: Serialize>(
        &self,
        id: impl std::fmt::Display,
        item: &B,
    ) -> Result<(), ApiError> {
        let request = ApiRequest::put(format!("{}/{}", self.resource, id)).json(item)?;
        self.write(request, "update").await
    }

    pub async fn delete_item(&self, id: impl std::fmt::Display) -> Result<(), ApiError> {
        let request = ApiRequest::delete(format!("{}/{}", self.resource, id));
        self.write(request, "delete").await
    }

    /// Writes never patch local rows; the current page is re-read after every
    /// write, failed or not.
    async fn write(&self, request: ApiRequest, operation: &'static str) -> Result<(), ApiError> {
        let outcome = self.api.send(&request, None).await.map(drop);
        if let Err(error) = &outcome {
            warn!(resource = %self.resource, operation, %error, "table write failed");
            self.notifier.notify(Notice::error(error.user_message()));
        }
        // Fetch failures are logged inside `fetch`; the write outcome wins.
        let _ = self.fetch().await;
        outcome
    }

    pub async fn on_search(&self, search: impl Into<String>) -> Result<(), ApiError> {
        {
            let mut state = lock(&self.state);
            state.query.search = search.into();
            state.query.page = 1;
        }
        self.fetch().await
    }

    /// Sets (or with `None`, removes) one filter.
    pub async fn on_filter(&self, key: impl Into<String>, value: Option<Value>) -> Result<(), ApiError> {
        {
            let mut state = lock(&self.state);
            let key = key.into();
            match value {
                Some(value) => {
                    state.query.filters.insert(key, value);
                }
                None => {
                    state.query.filters.remove(&key);
                }
            }
            state.query.page = 1;
        }
        self.fetch().await
    }

    /// Same column flips direction; a different column starts ascending.
    /// Unknown or unsortable columns are ignored.
    pub async fn on_sort(&self, key: &str) -> Result<(), ApiError> {
        let sortable = self
            .columns
            .iter()
            .any(|column| column.key == key && column.sortable);
        if !sortable {
            debug!(resource = %self.resource, key, "ignoring sort on unsortable column");
            return Ok(());
        }
        {
            let mut state = lock(&self.state);
            if state.query.sort_key.as_deref() == Some(key) {
                state.query.sort_order = state.query.sort_order.flipped();
            } else {
                state.query.sort_key = Some(key.to_string());
                state.query.sort_order = SortOrder::Asc;
            }
        }
        self.fetch().await
    }

    /// Replaces the whole query state and fetches once.
    pub async fn apply_query(&self, query: TableQuery) -> Result<(), ApiError> {
        {
            let mut state = lock(&self.state);
            state.query = TableQuery {
                page: query.page.max(1),
                page_size: query.page_size.max(1),
                ..query
            };
        }
        self.fetch().await
    }

    pub async fn set_page(&self, page: u32) -> Result<(), ApiError> {
        lock(&self.state).query.page = page.max(1);
        self.fetch().await
    }

    pub async fn set_page_size(&self, page_size: u32) -> Result<(), ApiError> {
        {
            let mut state = lock(&self.state);
            state.query.page_size = page_size.max(1);
            state.query.page = 1;
        }
        self.fetch().await
    }

    pub fn page_count(&self) -> u64 {
        let state = lock(&self.state);
        let size = u64::from(state.query.page_size.max(1));
        state.total.div_ceil(size)
    }
}

/// Clears the loading flag when the owning fetch ends or is dropped, unless
/// a newer fetch has taken over.
struct LoadingGuard<'a, T> {
    state: &'a Mutex<TableState<T>>,
    generation: &'a AtomicU64,
    mine: u64,
}

impl<T> Drop for LoadingGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        if self.generation.load(Ordering::SeqCst) == self.mine {
            state.loading = false;
        }
    }
}
