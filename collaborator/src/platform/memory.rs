//! In-process system of record.
//!
//! Keeps accounts and attachment records in memory and counts connection
//! lifecycle events, which makes it usable both for embedding the
//! collaborator without a transactor and for exercising failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    Account, Attachment, AttachmentUpdate, PlatformConnection, PlatformConnector, PlatformError,
};

#[derive(Default)]
struct Inner {
    accounts: Mutex<HashMap<String, Account>>,
    attachments: Mutex<HashMap<String, Attachment>>,
    credentials: Mutex<Vec<String>>,
    opened: AtomicU64,
    closed: AtomicU64,
    updates: AtomicU64,
    fail_connect: AtomicBool,
    fail_queries: AtomicBool,
}

/// Counters of connection lifecycle events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformStats {
    pub opened: u64,
    pub closed: u64,
    pub updates: u64,
}

/// Cheaply cloneable handle; clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryPlatform {
    inner: Arc<Inner>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, id: impl Into<String>, email: impl Into<String>) {
        let account = Account {
            id: id.into(),
            email: email.into(),
        };
        lock(&self.inner.accounts).insert(account.email.clone(), account);
    }

    /// Register an attachment record with the given id.
    pub fn insert_attachment(&self, id: impl Into<String>) {
        let id = id.into();
        let attachment = Attachment {
            id: id.clone(),
            last_modified: 0,
            size: 0,
            modified_by: String::new(),
        };
        lock(&self.inner.attachments).insert(id, attachment);
    }

    pub fn attachment(&self, id: &str) -> Option<Attachment> {
        lock(&self.inner.attachments).get(id).cloned()
    }

    /// Make every subsequent `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent query or update fail.
    pub fn fail_queries(&self, fail: bool) {
        self.inner.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Credentials presented on connect, oldest first.
    pub fn credentials(&self) -> Vec<String> {
        lock(&self.inner.credentials).clone()
    }

    pub fn stats(&self) -> PlatformStats {
        PlatformStats {
            opened: self.inner.opened.load(Ordering::SeqCst),
            closed: self.inner.closed.load(Ordering::SeqCst),
            updates: self.inner.updates.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl PlatformConnector for MemoryPlatform {
    async fn connect(
        &self,
        url: &str,
        credential: &str,
    ) -> Result<Box<dyn PlatformConnection>, PlatformError> {
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(PlatformError::Connect(format!("{url} unreachable")));
        }
        lock(&self.inner.credentials).push(credential.to_string());
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check(&self) -> Result<(), PlatformError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlatformError::ConnectionClosed);
        }
        if self.inner.fail_queries.load(Ordering::SeqCst) {
            return Err(PlatformError::Transport("query failed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformConnection for MemoryConnection {
    async fn find_account(&self, email: &str) -> Result<Option<Account>, PlatformError> {
        self.check()?;
        Ok(lock(&self.inner.accounts).get(email).cloned())
    }

    async fn find_attachment(&self, id: &str) -> Result<Option<Attachment>, PlatformError> {
        self.check()?;
        Ok(lock(&self.inner.attachments).get(id).cloned())
    }

    async fn update_attachment(
        &self,
        id: &str,
        update: AttachmentUpdate,
        actor: &str,
    ) -> Result<(), PlatformError> {
        self.check()?;
        let mut attachments = lock(&self.inner.attachments);
        let attachment = attachments
            .get_mut(id)
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))?;
        attachment.last_modified = update.last_modified;
        attachment.size = update.size;
        attachment.modified_by = actor.to_string();
        self.inner.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), PlatformError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
