//! Live event channel for the Auditdesk admin dashboard.
//!
//! Speaks STOMP 1.2 over a WebSocket, follows the online-users and audit-log
//! topics, and reconnects whenever the session's tokens change.

pub mod channel;
pub mod error;
pub mod feed;
pub mod stomp;

pub use channel::{ChannelState, LiveChannel, LiveConfig, LiveEvent};
pub use error::{LiveError, Result};
pub use feed::{AuditLogEntry, LiveFeed, OnlineUser};
pub use stomp::{Command, Frame};
