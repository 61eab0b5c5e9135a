//! Payloads pushed on the live topics and the client-side buffers holding
//! them.

use std::collections::VecDeque;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub username: String,
    #[serde(default)]
    pub online_since: Option<String>,
    #[serde(default)]
    pub current_page: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    #[serde(default, deserialize_with = "string_or_number")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    /// Free text or a structured object, depending on the action.
    #[serde(default)]
    pub details: Option<Value>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// Online users (replaced wholesale on every push) and the newest-first log
/// buffer.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    online: Vec<OnlineUser>,
    logs: VecDeque<AuditLogEntry>,
    capacity: usize,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            online: Vec::new(),
            logs: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn replace_online(&mut self, users: Vec<OnlineUser>) {
        self.online = users;
    }

    pub fn push_log(&mut self, entry: AuditLogEntry) {
        self.logs.push_front(entry);
        self.logs.truncate(self.capacity);
    }

    pub fn online(&self) -> &[OnlineUser] {
        &self.online
    }

    pub fn logs(&self) -> impl Iterator<Item = &AuditLogEntry> {
        self.logs.iter()
    }

    pub fn log_count(&self) -> usize {
        self.logs.len()
    }
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
