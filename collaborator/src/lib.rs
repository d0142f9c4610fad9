//! # collaborator: Document persistence for real-time collaborative editing
//!
//! Hosts shared Yrs documents over WebSocket and persists them as blobs,
//! notifying the platform's system of record after every successful store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Editor      │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (rooms)     │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ load / store
//!                                            ▼
//!                                    ┌───────────────┐
//!                                    │StorageExtension│
//!                                    └───┬───────┬───┘
//!                               blobs    │       │  attachment record
//!                                        ▼       ▼
//!                               ┌──────────┐ ┌────────────┐
//!                               │BlobStore │ │ Transactor │
//!                               └──────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`extension`]: load/store hooks and the storage-backed implementation
//! - [`storage`]: blob stores (in-memory, RocksDB)
//! - [`platform`]: system-of-record client (transactor WebSocket, in-memory)
//! - [`context`]: session tokens and per-session context
//! - [`measure`]: hierarchical timing spans
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage)
//! - [`server`]: WebSocket session runtime
//! - [`config`]: TOML + environment configuration

pub mod config;
pub mod context;
pub mod extension;
pub mod measure;
pub mod platform;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use config::{CollaboratorConfig, ConfigError};
pub use context::{SessionContext, Token, TokenError, TokenIssuer};
pub use extension::{
    Extension, ExtensionError, NotifyOutcome, StateError, StorageConfiguration, StorageExtension,
};
pub use measure::{MeasureContext, MeasureStats};
pub use platform::{
    MemoryPlatform, PlatformConnection, PlatformConnector, PlatformError, TransactorConnector,
    SYSTEM_ACCOUNT,
};
pub use protocol::{JoinRequest, MessageType, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    BlobError, BlobMetadata, BlobStore, MemoryBlobStore, RocksBlobStore, StoreConfig,
    YDOC_CONTENT_TYPE,
};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
