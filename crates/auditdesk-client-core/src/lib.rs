//! Client core for the Auditdesk admin API.
//!
//! - token store and session lifecycle with single-flight refresh
//! - authenticated HTTP transport with 401 recovery
//! - server-side paginated table controller
//! - lazily loaded tree controller

pub mod auth;
pub mod cancel;
pub mod claims;
pub mod config;
pub mod debounce;
pub mod envelope;
pub mod error;
pub mod http;
pub mod notice;
pub mod session;
pub mod store;
pub mod table;
pub mod tree;

pub use auth::{AuthApi, Credentials, HttpAuthApi};
pub use cancel::CancelToken;
pub use claims::{AccessClaims, decode_claims};
pub use config::{ClientConfig, ConfigError};
pub use error::{ApiError, AuthenticationError, Result};
pub use http::{ApiClient, ApiRequest, ApiResponse};
pub use notice::{ChannelNotifier, LogNotifier, Notice, NoticeLevel, Notifier};
pub use session::{AuthPhase, Session, SessionEvent, SessionState};
pub use store::{
    FileStore, KeyValueStore, MemoryStore, StoreChange, StoreError, SubmenuState, TokenPair,
    TokenVault,
};
pub use table::{ColumnDef, SortOrder, TableController, TableQuery, TableSnapshot};
pub use tree::{NewNode, NodeId, NodePatch, TreeConfig, TreeController, TreeNode};
