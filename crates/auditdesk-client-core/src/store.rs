//! Durable key-value storage for the token pair and small UI preferences.
//!
//! Every writer is tagged with an origin id so that a session can tell its own
//! writes apart from writes made by another session sharing the same store
//! (the equivalent of a browser `storage` event from another tab).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const OPEN_SUBMENUS_KEY: &str = "openSubmenus";

const CHANGE_CHANNEL_CAPACITY: usize = 64;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

fn next_origin() -> u64 {
    NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(String),
    #[error("store encoding failed: {0}")]
    Encoding(String),
}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Encoding(error.to_string())
    }
}

/// Keys touched by one write, and who wrote them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub keys: Vec<String>,
    pub origin: u64,
}

impl StoreChange {
    pub fn touches_tokens(&self) -> bool {
        self.keys
            .iter()
            .any(|key| key == ACCESS_TOKEN_KEY || key == REFRESH_TOKEN_KEY)
    }
}

/// Process-wide durable store. Multi-key writes are applied as one unit.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_many(&self, entries: &[(&str, &str)], origin: u64) -> Result<(), StoreError>;
    fn remove_many(&self, keys: &[&str], origin: u64) -> Result<(), StoreError>;
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

fn publish_change(changes: &broadcast::Sender<StoreChange>, keys: Vec<String>, origin: u64) {
    // No receivers is fine.
    let _ = changes.send(StoreChange { keys, origin });
}

pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            changes,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, &str)], origin: u64) -> Result<(), StoreError> {
        {
            let mut guard = lock(&self.entries);
            for (key, value) in entries {
                guard.insert((*key).to_string(), (*value).to_string());
            }
        }
        let keys = entries.iter().map(|(key, _)| (*key).to_string()).collect();
        publish_change(&self.changes, keys, origin);
        Ok(())
    }

    fn remove_many(&self, keys: &[&str], origin: u64) -> Result<(), StoreError> {
        {
            let mut guard = lock(&self.entries);
            for key in keys {
                guard.remove(*key);
            }
        }
        let keys = keys.iter().map(|key| (*key).to_string()).collect();
        publish_change(&self.changes, keys, origin);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// JSON-file backed store. Reads go to disk every time; writes replace the
/// file through a sibling temp file so a reader never sees half a pair.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<StoreChange>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(entries)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, encoded)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set_many(&self, entries: &[(&str, &str)], origin: u64) -> Result<(), StoreError> {
        {
            let _guard = lock(&self.write_lock);
            let mut current = self.read_all()?;
            for (key, value) in entries {
                current.insert((*key).to_string(), (*value).to_string());
            }
            self.write_all(&current)?;
        }
        let keys = entries.iter().map(|(key, _)| (*key).to_string()).collect();
        publish_change(&self.changes, keys, origin);
        Ok(())
    }

    fn remove_many(&self, keys: &[&str], origin: u64) -> Result<(), StoreError> {
        {
            let _guard = lock(&self.write_lock);
            let mut current = self.read_all()?;
            for key in keys {
                current.remove(*key);
            }
            self.write_all(&current)?;
        }
        let keys = keys.iter().map(|key| (*key).to_string()).collect();
        publish_change(&self.changes, keys, origin);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Token-pair view over a [`KeyValueStore`]. Both keys are always written and
/// cleared in the same store operation.
#[derive(Clone)]
pub struct TokenVault {
    store: Arc<dyn KeyValueStore>,
    origin: u64,
}

impl TokenVault {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            origin: next_origin(),
        }
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn access_token(&self) -> Result<Option<String>, StoreError> {
        self.store.get(ACCESS_TOKEN_KEY).map(non_empty)
    }

    pub fn refresh_token(&self) -> Result<Option<String>, StoreError> {
        self.store.get(REFRESH_TOKEN_KEY).map(non_empty)
    }

    /// Both tokens as currently stored: `(access, refresh)`.
    pub fn tokens(&self) -> Result<(Option<String>, Option<String>), StoreError> {
        let refresh = self.refresh_token()?;
        let access = self.access_token()?;
        Ok((access, refresh))
    }

    pub fn persist(&self, pair: &TokenPair) -> Result<(), StoreError> {
        self.store.set_many(
            &[
                (ACCESS_TOKEN_KEY, pair.access_token.as_str()),
                (REFRESH_TOKEN_KEY, pair.refresh_token.as_str()),
            ],
            self.origin,
        )
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store
            .remove_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY], self.origin)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|token| !token.trim().is_empty())
}

/// Open/closed state of sidebar submenus, persisted as a JSON array of labels.
pub struct SubmenuState {
    store: Arc<dyn KeyValueStore>,
    origin: u64,
}

impl SubmenuState {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            origin: next_origin(),
        }
    }

    /// Unreadable or missing state loads as "everything closed".
    pub fn load(&self) -> Vec<String> {
        match self.store.get(OPEN_SUBMENUS_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                tracing::debug!(%error, "ignoring malformed submenu state");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::warn!(%error, "failed to read submenu state");
                Vec::new()
            }
        }
    }

    pub fn save(&self, open: &[String]) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(open)?;
        self.store
            .set_many(&[(OPEN_SUBMENUS_KEY, encoded.as_str())], self.origin)
    }

    /// Flips one label and persists the result.
    pub fn toggle(&self, label: &str) -> Result<Vec<String>, StoreError> {
        let mut open = self.load();
        if let Some(position) = open.iter().position(|entry| entry == label) {
            open.remove(position);
        } else {
            open.push(label.to_string());
        }
        self.save(&open)?;
        Ok(open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(access: &str, refresh: &str) -> TokenPair {
        TokenPair {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
        }
    }

    #[test]
    fn vault_writes_and_clears_both_keys() -> Result<(), StoreError> {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let vault = TokenVault::new(store.clone());

        vault.persist(&pair("a1", "r1"))?;
        assert_eq!(vault.tokens()?, (Some("a1".to_string()), Some("r1".to_string())));

        vault.clear()?;
        assert_eq!(store.get(ACCESS_TOKEN_KEY)?, None);
        assert_eq!(store.get(REFRESH_TOKEN_KEY)?, None);
        Ok(())
    }

    #[test]
    fn change_events_carry_origin_and_keys() -> Result<(), StoreError> {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let first = TokenVault::new(store.clone());
        let second = TokenVault::new(store.clone());
        let mut changes = store.subscribe();

        second.persist(&pair("a2", "r2"))?;
        let change = changes.try_recv().map_err(|error| StoreError::Io(error.to_string()))?;
        assert_eq!(change.origin, second.origin());
        assert_ne!(change.origin, first.origin());
        assert!(change.touches_tokens());
        Ok(())
    }

    #[test]
    fn file_store_round_trips_through_disk() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("store.json");
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path)?);
        let vault = TokenVault::new(store);
        vault.persist(&pair("a3", "r3"))?;

        let reopened = TokenVault::new(Arc::new(FileStore::open(&path)?));
        assert_eq!(reopened.access_token()?.as_deref(), Some("a3"));
        reopened.clear()?;
        assert_eq!(vault.tokens()?, (None, None));
        Ok(())
    }

    #[test]
    fn blank_tokens_read_as_absent() -> Result<(), StoreError> {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set_many(&[(ACCESS_TOKEN_KEY, "  ")], 0)?;
        assert_eq!(TokenVault::new(store).access_token()?, None);
        Ok(())
    }

    #[test]
    fn submenu_state_toggles_labels() -> Result<(), StoreError> {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let submenus = SubmenuState::new(store.clone());
        assert!(submenus.load().is_empty());

        assert_eq!(submenus.toggle("Registries")?, vec!["Registries".to_string()]);
        assert_eq!(
            submenus.toggle("Users")?,
            vec!["Registries".to_string(), "Users".to_string()]
        );
        assert_eq!(submenus.toggle("Registries")?, vec!["Users".to_string()]);
        assert_eq!(
            store.get(OPEN_SUBMENUS_KEY)?.as_deref(),
            Some(r#"["Users"]"#)
        );

        store.set_many(&[(OPEN_SUBMENUS_KEY, "not json")], 0)?;
        assert!(submenus.load().is_empty());
        Ok(())
    }
}
