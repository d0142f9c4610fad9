//! RocksDB-backed blob store.
//!
//! Column families:
//! - `blobs`: document snapshots (LZ4 compressed, size-prepended)
//! - `metadata`: `BlobMetadata` (bincode)
//!
//! Key format: `<workspace bytes> 0x00 <document id bytes>`. Workspaces may
//! not contain NUL, which keeps per-workspace prefix scans unambiguous.
//!
//! A blob and its metadata are written in one `WriteBatch`, so readers
//! never observe a snapshot without matching metadata.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{BlobError, BlobMetadata, BlobStore};

const CF_BLOBS: &str = "blobs";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_BLOBS, CF_METADATA];

const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: true, a stored snapshot must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collaborator_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable `BlobStore` on top of RocksDB.
///
/// Clones share the same database. The synchronous methods block the
/// calling thread; the `BlobStore` impl moves them onto tokio's blocking
/// pool.
#[derive(Clone)]
pub struct RocksBlobStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBlobStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, BlobError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        // One block cache shared by every column family
        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened blob store at {}", config.path.display());
        Ok(Self {
            inner: Arc::new(Inner { db, config }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_BLOBS => {
                // Values are already LZ4 framed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Read a blob synchronously.
    pub fn read_blob(&self, workspace: &str, id: &str) -> Result<Vec<u8>, BlobError> {
        let cf = self.cf(CF_BLOBS)?;
        let key = Self::key(workspace, id)?;

        match self.inner.db.get_cf(cf, &key)? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| BlobError::Compression(e.to_string())),
            None => Err(BlobError::not_found(workspace, id)),
        }
    }

    /// Write a blob and its metadata atomically.
    pub fn put_blob(
        &self,
        workspace: &str,
        id: &str,
        data: &[u8],
        metadata: &BlobMetadata,
    ) -> Result<(), BlobError> {
        let cf_blobs = self.cf(CF_BLOBS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = Self::key(workspace, id)?;

        let compressed = lz4_flex::compress_prepend_size(data);
        let meta = bincode::serde::encode_to_vec(metadata, bincode::config::standard())
            .map_err(|e| BlobError::Serialization(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_blobs, &key, &compressed);
        batch.put_cf(cf_meta, &key, &meta);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.inner.config.sync_writes);
        self.inner.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load blob metadata, `None` when the blob does not exist.
    pub fn metadata(&self, workspace: &str, id: &str) -> Result<Option<BlobMetadata>, BlobError> {
        let cf = self.cf(CF_METADATA)?;
        let key = Self::key(workspace, id)?;

        match self.inner.db.get_cf(cf, &key)? {
            Some(bytes) => {
                let (meta, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| BlobError::Serialization(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List document ids stored under a workspace.
    pub fn list(&self, workspace: &str) -> Result<Vec<String>, BlobError> {
        let cf = self.cf(CF_METADATA)?;
        let prefix = Self::prefix(workspace)?;

        let mut ids = Vec::new();
        let iter = self
            .inner
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| BlobError::InvalidKey(e.to_string()))?;
            ids.push(id.to_string());
        }

        Ok(ids)
    }

    /// Delete a blob and its metadata. Deleting a missing blob is a no-op.
    pub fn delete(&self, workspace: &str, id: &str) -> Result<(), BlobError> {
        let cf_blobs = self.cf(CF_BLOBS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = Self::key(workspace, id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_blobs, &key);
        batch.delete_cf(cf_meta, &key);
        self.inner.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), BlobError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, BlobError> {
        self.inner
            .db
            .cf_handle(name)
            .ok_or_else(|| BlobError::Database(format!("Column family '{name}' not found")))
    }

    fn prefix(workspace: &str) -> Result<Vec<u8>, BlobError> {
        if workspace.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(BlobError::InvalidKey(format!("workspace contains NUL: {workspace:?}")));
        }
        let mut prefix = Vec::with_capacity(workspace.len() + 1);
        prefix.extend_from_slice(workspace.as_bytes());
        prefix.push(KEY_SEPARATOR);
        Ok(prefix)
    }

    fn key(workspace: &str, id: &str) -> Result<Vec<u8>, BlobError> {
        let mut key = Self::prefix(workspace)?;
        key.extend_from_slice(id.as_bytes());
        Ok(key)
    }
}

impl RocksBlobStore {
    /// Run a synchronous store operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, BlobError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksBlobStore) -> Result<T, BlobError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| BlobError::Database(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl BlobStore for RocksBlobStore {
    async fn read(&self, workspace: &str, id: &str) -> Result<Vec<u8>, BlobError> {
        let (workspace, id) = (workspace.to_string(), id.to_string());
        self.blocking(move |store| store.read_blob(&workspace, &id))
            .await
    }

    async fn put(
        &self,
        workspace: &str,
        id: &str,
        data: &[u8],
        metadata: BlobMetadata,
    ) -> Result<(), BlobError> {
        let (workspace, id, data) = (workspace.to_string(), id.to_string(), data.to_vec());
        self.blocking(move |store| store.put_blob(&workspace, &id, &data, &metadata))
            .await
    }

    async fn stat(&self, workspace: &str, id: &str) -> Result<Option<BlobMetadata>, BlobError> {
        let (workspace, id) = (workspace.to_string(), id.to_string());
        self.blocking(move |store| store.metadata(&workspace, &id))
            .await
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
