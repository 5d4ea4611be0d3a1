use std::{path::Path, sync::Arc};

use dashmap::DashMap;
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Single key-value table holding both vectors and their metadata, keyed
/// `vector:<id>` and `metadata:<id>`. Vector values are raw little-endian
/// f32 bytes; metadata values are JSON.
const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

const VECTOR_PREFIX: &str = "vector:";
const METADATA_PREFIX: &str = "metadata:";

/// Typed per-vector metadata, replacing the free-form string blob the
/// vectors would otherwise carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorMeta {
    pub path: String,
    pub file_type: String,
    pub size: u64,
}

/// Which tier is actually persisting data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Writes go through to the embedded redb store.
    Redb,
    /// The persistent tier failed; data lives only in memory and is lost
    /// on restart.
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Redb => write!(f, "redb"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorStoreStats {
    pub vector_count: usize,
    pub cache_size: usize,
    pub backend: StorageBackend,
}

/// Two-tier vector store: a concurrent in-memory map write-through backed
/// by redb.
///
/// If the persistent tier fails to open or a write fails, the store keeps
/// serving from memory only; the degraded state is visible via [`stats`]
/// but never surfaces as an error.
///
/// [`stats`]: VectorStore::stats
pub struct VectorStore {
    vectors: DashMap<String, Arc<Vec<f32>>>,
    metadata: DashMap<String, VectorMeta>,
    db: Mutex<Option<Database>>,
}

impl VectorStore {
    /// Open or create the store at `path`, preloading the memory tier.
    ///
    /// A persistent-tier failure degrades to memory-only operation.
    pub fn open(path: &Path) -> Self {
        let store = Self {
            vectors: DashMap::new(),
            metadata: DashMap::new(),
            db: Mutex::new(None),
        };

        match Database::create(path) {
            Ok(db) => {
                *store.db.lock() = Some(db);
                if let Err(e) = store.preload() {
                    warn!(
                        "vector store preload failed, degrading to memory-only: {e}"
                    );
                    *store.db.lock() = None;
                } else {
                    info!(
                        "vector store opened: {} vectors loaded",
                        store.vectors.len()
                    );
                }
            }
            Err(e) => {
                warn!(
                    "vector store backend failed to open ({}), degrading to memory-only: {e}",
                    path.display()
                );
            }
        }

        store
    }

    /// A store with no persistent tier at all.
    pub fn in_memory() -> Self {
        Self {
            vectors: DashMap::new(),
            metadata: DashMap::new(),
            db: Mutex::new(None),
        }
    }

    fn preload(&self) -> Result<()> {
        let guard = self.db.lock();
        let Some(db) = guard.as_ref() else {
            return Ok(());
        };

        let txn = db.begin_read()?;
        // First open creates the table lazily; treat an absent table as empty.
        let table = match txn.open_table(KV) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in table.iter()? {
            let (key, value) = entry?;
            let key = key.value();
            if let Some(id) = key.strip_prefix(VECTOR_PREFIX) {
                let vector: Vec<f32> = bytemuck::pod_collect_to_vec(value.value());
                self.vectors.insert(id.to_string(), Arc::new(vector));
            } else if let Some(id) = key.strip_prefix(METADATA_PREFIX) {
                match serde_json::from_slice(value.value()) {
                    Ok(meta) => {
                        self.metadata.insert(id.to_string(), meta);
                    }
                    Err(e) => warn!("skipping unreadable metadata for {id}: {e}"),
                }
            }
        }

        Ok(())
    }

    /// Store a vector and its metadata, writing through both tiers.
    pub fn put(&self, id: &str, vector: Arc<Vec<f32>>, meta: VectorMeta) {
        self.vectors.insert(id.to_string(), Arc::clone(&vector));
        self.metadata.insert(id.to_string(), meta.clone());

        self.try_persist(|table| {
            write_entry(table, id, &vector, &meta)?;
            Ok(())
        });
        debug!("stored vector: {id}");
    }

    /// Store a batch of vectors in a single write transaction.
    pub fn put_batch(&self, entries: &[(String, Arc<Vec<f32>>, VectorMeta)]) {
        if entries.is_empty() {
            return;
        }

        for (id, vector, meta) in entries {
            self.vectors.insert(id.clone(), Arc::clone(vector));
            self.metadata.insert(id.clone(), meta.clone());
        }

        self.try_persist(|table| {
            for (id, vector, meta) in entries {
                write_entry(table, id, vector, meta)?;
            }
            Ok(())
        });
        info!("stored vector batch: {} entries", entries.len());
    }

    /// Fetch a vector, checking the memory tier first and backfilling it
    /// from disk on a persistent-tier hit.
    pub fn get(&self, id: &str) -> Option<Arc<Vec<f32>>> {
        if let Some(hit) = self.vectors.get(id) {
            return Some(Arc::clone(&hit));
        }

        let bytes = self.read_value(&format!("{VECTOR_PREFIX}{id}"))?;
        let vector: Arc<Vec<f32>> =
            Arc::new(bytemuck::pod_collect_to_vec(&bytes));
        self.vectors.insert(id.to_string(), Arc::clone(&vector));
        Some(vector)
    }

    pub fn get_metadata(&self, id: &str) -> Option<VectorMeta> {
        if let Some(hit) = self.metadata.get(id) {
            return Some(hit.clone());
        }

        let bytes = self.read_value(&format!("{METADATA_PREFIX}{id}"))?;
        let meta: VectorMeta = serde_json::from_slice(&bytes).ok()?;
        self.metadata.insert(id.to_string(), meta.clone());
        Some(meta)
    }

    /// Remove a vector from both tiers. Returns whether anything was held
    /// in the memory tier. The persistent tier keeps a tombstone until
    /// [`compact`] reclaims it.
    ///
    /// [`compact`]: VectorStore::compact
    pub fn delete(&self, id: &str) -> bool {
        let removed = self.vectors.remove(id).is_some();
        self.metadata.remove(id);

        self.try_persist(|table| {
            table.remove(format!("{VECTOR_PREFIX}{id}").as_str())?;
            table.remove(format!("{METADATA_PREFIX}{id}").as_str())?;
            Ok(())
        });
        debug!("deleted vector: {id}");
        removed
    }

    /// Drop every vector from both tiers.
    pub fn clear(&self) {
        self.vectors.clear();
        self.metadata.clear();

        self.try_persist(|table| {
            let keys: Vec<String> = table
                .iter()?
                .filter_map(|entry| entry.ok())
                .map(|(k, _)| k.value().to_string())
                .collect();
            for key in keys {
                table.remove(key.as_str())?;
            }
            Ok(())
        });
        info!("cleared vector store");
    }

    pub fn ids(&self) -> Vec<String> {
        self.vectors.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn backend(&self) -> StorageBackend {
        if self.db.lock().is_some() {
            StorageBackend::Redb
        } else {
            StorageBackend::Memory
        }
    }

    pub fn stats(&self) -> VectorStoreStats {
        VectorStoreStats {
            vector_count: self.vectors.len(),
            cache_size: self.vectors.len(),
            backend: self.backend(),
        }
    }

    /// Reclaim space held by tombstoned entries. The persistent tier does
    /// not reclaim it eagerly, so deletions only shrink the file here.
    ///
    /// Returns whether compaction ran and made progress. A no-op in
    /// memory-only mode.
    pub fn compact(&self) -> bool {
        let mut guard = self.db.lock();
        let Some(db) = guard.as_mut() else {
            return false;
        };

        match db.compact() {
            Ok(compacted) => {
                info!("vector store compaction finished (changed: {compacted})");
                compacted
            }
            Err(e) => {
                warn!("vector store compaction failed: {e}");
                false
            }
        }
    }

    /// Run `write` inside one write transaction. A persistent-tier failure
    /// logs, drops the backend, and leaves the memory tier authoritative.
    fn try_persist<F>(&self, write: F)
    where
        F: FnOnce(&mut redb::Table<'_, &str, &[u8]>) -> Result<()>,
    {
        let mut guard = self.db.lock();
        let Some(db) = guard.as_ref() else {
            return;
        };

        let result = (|| -> Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(KV)?;
                write(&mut table)?;
            }
            txn.commit()?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!("vector store write failed, degrading to memory-only: {e}");
            *guard = None;
        }
    }

    fn read_value(&self, key: &str) -> Option<Vec<u8>> {
        let guard = self.db.lock();
        let db = guard.as_ref()?;

        let result = (|| -> Result<Option<Vec<u8>>> {
            let txn = db.begin_read()?;
            let table = txn.open_table(KV)?;
            Ok(table.get(key)?.map(|v| v.value().to_vec()))
        })();

        match result {
            Ok(value) => value,
            Err(e) => {
                warn!("vector store read failed for {key}: {e}");
                None
            }
        }
    }
}

fn write_entry(
    table: &mut redb::Table<'_, &str, &[u8]>,
    id: &str,
    vector: &[f32],
    meta: &VectorMeta,
) -> Result<()> {
    let vector_bytes: &[u8] = bytemuck::cast_slice(vector);
    table.insert(format!("{VECTOR_PREFIX}{id}").as_str(), vector_bytes)?;

    let meta_bytes = serde_json::to_vec(meta)
        .map_err(|e| crate::error::Error::Config(e.to_string()))?;
    table.insert(
        format!("{METADATA_PREFIX}{id}").as_str(),
        meta_bytes.as_slice(),
    )?;
    Ok(())
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("vector_count", &self.vectors.len())
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}
