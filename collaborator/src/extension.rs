//! Document persistence hooks.
//!
//! The session runtime calls an [`Extension`] when a document session
//! starts (`on_load_document`) and whenever the live document should be
//! persisted (`on_store_document`).
//!
//! [`StorageExtension`] keeps full Yrs snapshots in a [`BlobStore`] and,
//! after each successful write, refreshes the matching attachment record
//! in the system of record:
//!
//! ```text
//! store ──► encode ──► BlobStore::put ──┬──► Err  → store fails
//!                                       │
//!                                       └──► Ok ──► notify platform
//!                                                   (errors logged, never returned)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::context::{SessionContext, Token, TokenIssuer};
use crate::measure::MeasureContext;
use crate::platform::{AttachmentUpdate, PlatformConnection, PlatformConnector, PlatformError, SYSTEM_ACCOUNT};
use crate::storage::{BlobError, BlobMetadata, BlobStore};

/// Errors surfaced by persistence hooks.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("Failed to persist document {document_id}: {source}")]
    Persist {
        document_id: String,
        #[source]
        source: BlobError,
    },
}

/// A Yrs update that could not be merged into a document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Malformed update: {0}")]
    Decode(String),
    #[error("Update rejected by document: {0}")]
    Apply(String),
}

/// Hook contract implemented for the session runtime.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Produce the live document for a new session. Never fails: missing or
    /// unreadable content yields an empty document.
    async fn on_load_document(&self, document_id: &str, context: &SessionContext) -> Doc;

    /// Persist the current state of `document`.
    async fn on_store_document(
        &self,
        document_id: &str,
        context: &SessionContext,
        document: &Doc,
    ) -> Result<(), ExtensionError>;
}

/// Result of the best-effort platform notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Updated,
    RecordAbsent,
}

pub struct StorageConfiguration {
    pub measure: MeasureContext,
    pub blobs: Arc<dyn BlobStore>,
    pub platform: Arc<dyn PlatformConnector>,
    pub issuer: Arc<TokenIssuer>,
    pub transactor_url: String,
}

/// Blob-backed persistence with system-of-record notification.
pub struct StorageExtension {
    configuration: StorageConfiguration,
}

impl StorageExtension {
    pub fn new(configuration: StorageConfiguration) -> Self {
        Self { configuration }
    }

    pub fn measure(&self) -> &MeasureContext {
        &self.configuration.measure
    }

    async fn read_blob(&self, document_id: &str, token: &Token) -> Result<Vec<u8>, BlobError> {
        self.configuration
            .blobs
            .read(&token.workspace, document_id)
            .await
    }

    /// Load `document_id` into a fresh document.
    pub async fn load_document(
        &self,
        ctx: &MeasureContext,
        context: &SessionContext,
        document_id: &str,
    ) -> Doc {
        log::info!("Loading document {document_id}");
        let token = &context.token;

        let content = ctx
            .with("minio", |_| async {
                match self.read_blob(document_id, token).await {
                    Ok(content) => Some(content),
                    Err(err) => {
                        log::debug!("No stored content for {document_id}: {err}");
                        let initial = context.initial_content()?;
                        match self.read_blob(initial, token).await {
                            Ok(content) => {
                                log::info!("Seeding {document_id} from initial content {initial}");
                                Some(content)
                            }
                            Err(err) => {
                                log::debug!("No initial content {initial} for {document_id}: {err}");
                                None
                            }
                        }
                    }
                }
            })
            .await;

        let doc = Doc::new();
        let Some(content) = content.filter(|c| !c.is_empty()) else {
            return doc;
        };

        ctx.measure("size", content.len() as f64);
        let applied = ctx
            .with("apply-update", |_| async { apply_update(&doc, &content) })
            .await;
        if let Err(err) = applied {
            log::error!("Failed to decode stored content for {document_id}: {err}");
            // A partially applied snapshot is never handed out
            return Doc::new();
        }

        doc
    }

    /// Persist `document` and notify the platform.
    pub async fn store_document(
        &self,
        ctx: &MeasureContext,
        context: &SessionContext,
        document_id: &str,
        document: &Doc,
    ) -> Result<(), ExtensionError> {
        log::info!("Storing document {document_id}");
        let token = &context.token;

        let buffer = ctx.with("encode", |_| async { encode_state(document) }).await;
        ctx.measure("size", buffer.len() as f64);

        ctx.with("minio", |_| async {
            self.configuration
                .blobs
                .put(
                    &token.workspace,
                    document_id,
                    &buffer,
                    BlobMetadata::ydoc(buffer.len() as u64),
                )
                .await
        })
        .await
        .map_err(|source| ExtensionError::Persist {
            document_id: document_id.to_string(),
            source,
        })?;

        let notified = ctx
            .with("platform", |ctx| async move {
                self.notify_platform(&ctx, token, document_id, buffer.len() as u64)
                    .await
            })
            .await;
        match notified {
            Ok(NotifyOutcome::Updated) => {
                log::debug!("Platform notified for document {document_id}")
            }
            Ok(NotifyOutcome::RecordAbsent) => {
                log::debug!("Platform attachment not found for document {document_id}")
            }
            Err(err) => log::warn!("Failed to notify platform for document {document_id}: {err}"),
        }

        Ok(())
    }

    /// Refresh the attachment record for `document_id`.
    ///
    /// The connection is closed on every path once it has been opened.
    pub async fn notify_platform(
        &self,
        ctx: &MeasureContext,
        token: &Token,
        document_id: &str,
        size: u64,
    ) -> Result<NotifyOutcome, PlatformError> {
        let credential = self
            .configuration
            .issuer
            .generate(&token.email, &token.workspace)?;

        let connection = ctx
            .with("connect", |_| {
                self.configuration
                    .platform
                    .connect(&self.configuration.transactor_url, &credential)
            })
            .await?;

        let result = update_attachment(ctx, connection.as_ref(), token, document_id, size).await;

        if let Err(err) = connection.close().await {
            log::warn!("Failed to close platform connection for {document_id}: {err}");
        }

        result
    }
}

async fn update_attachment(
    ctx: &MeasureContext,
    connection: &dyn PlatformConnection,
    token: &Token,
    document_id: &str,
    size: u64,
) -> Result<NotifyOutcome, PlatformError> {
    // The token belongs to whoever opened the document first; any
    // participant is an acceptable author for a collaborative document.
    let actor = resolve_account(connection, &token.email).await;

    let current = ctx
        .with("query", |_| connection.find_attachment(document_id))
        .await?;
    let Some(current) = current else {
        return Ok(NotifyOutcome::RecordAbsent);
    };
    let update = AttachmentUpdate {
        last_modified: crate::now_millis(),
        size,
    };
    ctx.with("update", |_| {
        connection.update_attachment(&current.id, update, &actor)
    })
    .await?;

    Ok(NotifyOutcome::Updated)
}

/// Account id for `email`, or the system account when it does not resolve.
async fn resolve_account(connection: &dyn PlatformConnection, email: &str) -> String {
    match connection.find_account(email).await {
        Ok(Some(account)) => account.id,
        Ok(None) => {
            log::debug!("No account for {email}, acting as system");
            SYSTEM_ACCOUNT.to_string()
        }
        Err(err) => {
            log::debug!("Account lookup for {email} failed, acting as system: {err}");
            SYSTEM_ACCOUNT.to_string()
        }
    }
}

/// Full document state as a self-contained v1 update.
pub fn encode_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Decode a v1 update and apply it to `doc`.
pub fn apply_update(doc: &Doc, bytes: &[u8]) -> Result<(), StateError> {
    let update = Update::decode_v1(bytes).map_err(|e| StateError::Decode(e.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| StateError::Apply(e.to_string()))
}

#[async_trait]
impl Extension for StorageExtension {
    async fn on_load_document(&self, document_id: &str, context: &SessionContext) -> Doc {
        self.configuration
            .measure
            .with("load-document", |ctx| async move {
                self.load_document(&ctx, context, document_id).await
            })
            .await
    }

    async fn on_store_document(
        &self,
        document_id: &str,
        context: &SessionContext,
        document: &Doc,
    ) -> Result<(), ExtensionError> {
        self.configuration
            .measure
            .with("store-document", |ctx| async move {
                self.store_document(&ctx, context, document_id, document)
                    .await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryPlatform;
    use crate::storage::{MemoryBlobStore, YDOC_CONTENT_TYPE};
    use std::time::Duration;
    use yrs::{GetString, Text, WriteTxn};

    /// Blob store whose writes always fail.
    struct BrokenBlobStore;

    #[async_trait]
    impl BlobStore for BrokenBlobStore {
        async fn read(&self, workspace: &str, id: &str) -> Result<Vec<u8>, BlobError> {
            Err(BlobError::not_found(workspace, id))
        }

        async fn put(&self, _: &str, _: &str, _: &[u8], _: BlobMetadata) -> Result<(), BlobError> {
            Err(BlobError::Database("disk full".into()))
        }

        async fn stat(&self, _: &str, _: &str) -> Result<Option<BlobMetadata>, BlobError> {
            Ok(None)
        }
    }

    fn extension_with(blobs: Arc<dyn BlobStore>, platform: MemoryPlatform) -> StorageExtension {
        StorageExtension::new(StorageConfiguration {
            measure: MeasureContext::new("collaborator"),
            blobs,
            platform: Arc::new(platform),
            issuer: Arc::new(TokenIssuer::new("test-secret", Duration::from_secs(30))),
            transactor_url: "ws://transactor".into(),
        })
    }

    fn context() -> SessionContext {
        SessionContext::new(Token::new("alice@example.com", "ws-1"))
    }

    fn doc_with_text(content: &str) -> Doc {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        doc
    }

    fn text_of(doc: &Doc) -> Option<String> {
        let txn = doc.transact();
        txn.get_text("content").map(|text| text.get_string(&txn))
    }

    fn is_empty(doc: &Doc) -> bool {
        doc.transact().state_vector().is_empty()
    }

    #[tokio::test]
    async fn test_load_missing_document_is_empty() {
        let ext = extension_with(Arc::new(MemoryBlobStore::new()), MemoryPlatform::new());
        let doc = ext.on_load_document("doc-1", &context()).await;
        assert!(is_empty(&doc));
    }

    #[tokio::test]
    async fn test_load_falls_back_to_initial_content() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let template = encode_state(&doc_with_text("Template body"));
        blobs
            .put("ws-1", "template-1", &template, BlobMetadata::ydoc(template.len() as u64))
            .await
            .unwrap();

        let ext = extension_with(blobs, MemoryPlatform::new());
        let ctx = context().with_initial_content("template-1");
        let doc = ext.on_load_document("doc-1", &ctx).await;
        assert_eq!(text_of(&doc).as_deref(), Some("Template body"));
    }

    #[tokio::test]
    async fn test_load_prefers_own_blob_over_initial_content() {
        let blobs = Arc::new(MemoryBlobStore::new());
        for (id, body) in [("doc-1", "Own"), ("template-1", "Template")] {
            let bytes = encode_state(&doc_with_text(body));
            blobs.put("ws-1", id, &bytes, BlobMetadata::ydoc(bytes.len() as u64)).await.unwrap();
        }

        let ext = extension_with(blobs, MemoryPlatform::new());
        let ctx = context().with_initial_content("template-1");
        let doc = ext.on_load_document("doc-1", &ctx).await;
        assert_eq!(text_of(&doc).as_deref(), Some("Own"));
    }

    #[tokio::test]
    async fn test_load_missing_initial_content_is_empty() {
        let ext = extension_with(Arc::new(MemoryBlobStore::new()), MemoryPlatform::new());
        let ctx = context().with_initial_content("template-404");
        let doc = ext.on_load_document("doc-1", &ctx).await;
        assert!(is_empty(&doc));
    }

    #[tokio::test]
    async fn test_load_corrupt_blob_is_empty() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.put("ws-1", "doc-1", &[0xFF; 32], BlobMetadata::ydoc(32)).await.unwrap();

        let ext = extension_with(blobs, MemoryPlatform::new());
        let doc = ext.on_load_document("doc-1", &context()).await;
        assert!(is_empty(&doc));
    }

    #[tokio::test]
    async fn test_load_truncated_snapshot_is_empty() {
        let state = encode_state(&doc_with_text("A paragraph long enough to cut in several places"));
        let len = state.len();

        for cut in [1, len / 4, len / 2, len - 1] {
            let blobs = Arc::new(MemoryBlobStore::new());
            blobs
                .put("ws-1", "doc-1", &state[..cut], BlobMetadata::ydoc(cut as u64))
                .await
                .unwrap();

            let ext = extension_with(blobs, MemoryPlatform::new());
            let doc = ext.on_load_document("doc-1", &context()).await;
            assert!(is_empty(&doc), "snapshot cut at {cut} of {len} bytes");
            assert_eq!(text_of(&doc), None);
        }
    }

    #[test]
    fn test_apply_update_reports_malformed_bytes() {
        let state = encode_state(&doc_with_text("Hello"));
        let doc = Doc::new();

        let err = apply_update(&doc, &state[..state.len() / 2]).unwrap_err();
        assert!(matches!(err, StateError::Decode(_)));
        assert!(is_empty(&doc));

        apply_update(&doc, &state).unwrap();
        assert_eq!(text_of(&doc).as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_load_empty_blob_is_empty() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.put("ws-1", "doc-1", &[], BlobMetadata::ydoc(0)).await.unwrap();

        let ext = extension_with(blobs, MemoryPlatform::new());
        let doc = ext.on_load_document("doc-1", &context()).await;
        assert!(is_empty(&doc));
    }

    #[tokio::test]
    async fn test_store_then_load_roundtrip() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let ext = extension_with(blobs.clone(), MemoryPlatform::new());

        let doc = doc_with_text("Hello");
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 5, ", world");
            text.remove_range(&mut txn, 0, 1);
        }
        ext.on_store_document("doc-1", &context(), &doc).await.unwrap();

        let meta = blobs.stat("ws-1", "doc-1").await.unwrap().unwrap();
        assert_eq!(meta.content_type, YDOC_CONTENT_TYPE);

        let loaded = ext.on_load_document("doc-1", &context()).await;
        assert_eq!(text_of(&loaded).as_deref(), Some("ello, world"));
    }

    #[tokio::test]
    async fn test_store_updates_existing_record() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let platform = MemoryPlatform::new();
        platform.insert_attachment("doc-1");
        platform.insert_account("acc-alice", "alice@example.com");
        let ext = extension_with(blobs.clone(), platform.clone());

        let doc = doc_with_text("Tracked");
        let before = crate::now_millis();
        ext.on_store_document("doc-1", &context(), &doc).await.unwrap();
        let after = crate::now_millis();

        let stored = blobs.read("ws-1", "doc-1").await.unwrap();
        let record = platform.attachment("doc-1").unwrap();
        assert_eq!(record.size, stored.len() as u64);
        assert!(record.last_modified >= before && record.last_modified <= after);
        assert_eq!(record.modified_by, "acc-alice");

        let stats = platform.stats();
        assert_eq!((stats.opened, stats.closed, stats.updates), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_store_uses_fresh_credential_for_token() {
        let platform = MemoryPlatform::new();
        let ext = extension_with(Arc::new(MemoryBlobStore::new()), platform.clone());
        ext.on_store_document("doc-1", &context(), &doc_with_text("x")).await.unwrap();

        let credentials = platform.credentials();
        assert_eq!(credentials.len(), 1);
        let issuer = TokenIssuer::new("test-secret", Duration::from_secs(30));
        let token = issuer.verify(&credentials[0]).unwrap();
        assert_eq!(token, Token::new("alice@example.com", "ws-1"));
    }

    #[tokio::test]
    async fn test_store_unknown_account_acts_as_system() {
        let platform = MemoryPlatform::new();
        platform.insert_attachment("doc-1");
        let ext = extension_with(Arc::new(MemoryBlobStore::new()), platform.clone());

        ext.on_store_document("doc-1", &context(), &doc_with_text("x")).await.unwrap();
        assert_eq!(platform.attachment("doc-1").unwrap().modified_by, SYSTEM_ACCOUNT);
    }

    #[tokio::test]
    async fn test_store_without_record_skips_update() {
        let platform = MemoryPlatform::new();
        let ext = extension_with(Arc::new(MemoryBlobStore::new()), platform.clone());

        ext.on_store_document("doc-1", &context(), &doc_with_text("x")).await.unwrap();
        let stats = platform.stats();
        assert_eq!(stats.updates, 0);
        assert_eq!(stats.opened, stats.closed);
    }

    #[tokio::test]
    async fn test_store_succeeds_when_platform_unreachable() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let platform = MemoryPlatform::new();
        platform.insert_attachment("doc-1");
        platform.fail_connect(true);
        let ext = extension_with(blobs.clone(), platform.clone());

        ext.on_store_document("doc-1", &context(), &doc_with_text("x")).await.unwrap();
        assert!(blobs.read("ws-1", "doc-1").await.is_ok());
        assert_eq!(platform.attachment("doc-1").unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_store_closes_connection_when_query_fails() {
        let platform = MemoryPlatform::new();
        platform.insert_attachment("doc-1");
        platform.fail_queries(true);
        let ext = extension_with(Arc::new(MemoryBlobStore::new()), platform.clone());

        ext.on_store_document("doc-1", &context(), &doc_with_text("x")).await.unwrap();
        let stats = platform.stats();
        assert_eq!((stats.opened, stats.closed, stats.updates), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_store_fails_when_blob_write_fails() {
        let platform = MemoryPlatform::new();
        platform.insert_attachment("doc-1");
        let ext = extension_with(Arc::new(BrokenBlobStore), platform.clone());

        let err = ext
            .on_store_document("doc-1", &context(), &doc_with_text("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("doc-1"));
        // No notification without a durable write
        assert_eq!(platform.stats().opened, 0);
    }

    #[tokio::test]
    async fn test_hooks_record_measurements() {
        let ext = extension_with(Arc::new(MemoryBlobStore::new()), MemoryPlatform::new());
        ext.on_store_document("doc-1", &context(), &doc_with_text("x")).await.unwrap();
        ext.on_load_document("doc-1", &context()).await;

        let snapshot = ext.measure().snapshot();
        for path in [
            "collaborator/store-document",
            "collaborator/store-document/encode",
            "collaborator/store-document/minio",
            "collaborator/store-document/platform/connect",
            "collaborator/load-document/minio",
            "collaborator/load-document/apply-update",
        ] {
            assert!(snapshot.contains_key(path), "missing span {path}");
        }
    }
}
