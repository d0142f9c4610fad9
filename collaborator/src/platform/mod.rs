//! System-of-record client.
//!
//! The platform tracks attachment records whose id equals a collaborative
//! document's id. After every successful snapshot write the collaborator
//! refreshes the record's `last_modified` and `size`, so the rest of the
//! platform can show them without reading the blob.
//!
//! Connections are short-lived: one per store call, opened with a freshly
//! issued credential and closed before the call returns.

pub mod memory;
pub mod transactor;

pub use memory::MemoryPlatform;
pub use transactor::TransactorConnector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Account used when the acting user cannot be resolved.
pub const SYSTEM_ACCOUNT: &str = "core:account:System";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
}

/// Attachment record as seen by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    /// Milliseconds since epoch
    pub last_modified: u64,
    pub size: u64,
    pub modified_by: String,
}

/// Fields the collaborator refreshes on an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUpdate {
    pub last_modified: u64,
    pub size: u64,
}

/// Platform client errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Credential error: {0}")]
    Credential(#[from] crate::context::TokenError),
}

/// Opens authenticated connections to the system of record.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        credential: &str,
    ) -> Result<Box<dyn PlatformConnection>, PlatformError>;
}

/// An open, authenticated connection.
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    async fn find_account(&self, email: &str) -> Result<Option<Account>, PlatformError>;

    async fn find_attachment(&self, id: &str) -> Result<Option<Attachment>, PlatformError>;

    async fn update_attachment(
        &self,
        id: &str,
        update: AttachmentUpdate,
        actor: &str,
    ) -> Result<(), PlatformError>;

    async fn close(&self) -> Result<(), PlatformError>;
}
