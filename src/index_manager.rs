use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    embedding::Embedder,
    error::{Error, Result},
    metadata_store::{FileRecord, MetadataStore},
    query_cache::QueryCache,
    vector_store::{VectorMeta, VectorStore},
    walker::{self, DiscoveredFile},
};

const WATCH_ROOTS_KEY: &str = "watch_roots";
const LAST_REBUILD_KEY: &str = "maintenance.last_rebuild";
const LAST_INCREMENTAL_KEY: &str = "maintenance.last_incremental";
const LAST_SWEEP_KEY: &str = "maintenance.last_sweep";

/// Extracts indexable text from a file.
pub trait ContentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<String>;
}

/// Default parser: reads bytes and decodes as UTF-8, replacing invalid
/// sequences rather than failing.
pub struct Utf8Parser;

impl ContentParser for Utf8Parser {
    fn parse(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RebuildReport {
    pub scanned: usize,
    pub indexed: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IncrementalReport {
    pub checked: usize,
    pub updated: usize,
    pub removed: usize,
    pub elapsed_ms: u64,
}

/// Snapshot of index health for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub record_count: usize,
    pub vector_count: usize,
    pub embedding_cache_size: usize,
    pub storage_backend: String,
    pub model_available: bool,
    pub watch_roots: Vec<String>,
    pub last_rebuild: Option<String>,
    pub last_incremental: Option<String>,
    pub last_sweep: Option<String>,
}

/// Owns indexing over the watch roots: per-file updates, full rebuilds,
/// incremental syncs and the periodic maintenance sweep.
pub struct IndexManager {
    metadata: Arc<MetadataStore>,
    vectors: Arc<VectorStore>,
    embedder: Arc<Embedder>,
    cache: Arc<QueryCache>,
    parser: Arc<dyn ContentParser>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl IndexManager {
    pub fn new(
        metadata: Arc<MetadataStore>,
        vectors: Arc<VectorStore>,
        embedder: Arc<Embedder>,
        cache: Arc<QueryCache>,
    ) -> Self {
        Self {
            metadata,
            vectors,
            embedder,
            cache,
            parser: Arc::new(Utf8Parser),
            maintenance: Mutex::new(None),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ContentParser>) -> Self {
        self.parser = parser;
        self
    }

    // -- Watch roots --

    pub fn roots(&self) -> Vec<String> {
        self.metadata
            .get_setting(WATCH_ROOTS_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn add_root(&self, path: &Path) -> Result<()> {
        let canonical = path.canonicalize().map_err(|e| {
            Error::Config(format!(
                "cannot resolve path {}: {e}",
                path.display()
            ))
        })?;
        if !canonical.is_dir() {
            return Err(Error::Config(format!(
                "path is not a directory: {}",
                canonical.display()
            )));
        }
        let root = canonical.to_string_lossy().into_owned();

        let mut roots = self.roots();
        if !roots.contains(&root) {
            roots.push(root.clone());
            roots.sort();
            self.save_roots(&roots);
            info!("watching {root}");
        }
        Ok(())
    }

    pub fn remove_root(&self, path: &Path) -> bool {
        let target = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned();

        let mut roots = self.roots();
        let before = roots.len();
        roots.retain(|r| *r != target);
        if roots.len() == before {
            return false;
        }
        self.save_roots(&roots);

        // Drop everything indexed under the removed root.
        for record in self.metadata.all() {
            if record.path.starts_with(&target) {
                self.metadata.remove(&record.path);
                self.vectors.delete(&record.path);
            }
        }
        self.cache.clear();
        info!("stopped watching {target}");
        true
    }

    fn save_roots(&self, roots: &[String]) {
        self.metadata.set_setting(
            WATCH_ROOTS_KEY,
            &serde_json::to_string(roots).unwrap_or_default(),
        );
    }

    // -- Per-file operations --

    /// Index one file. Returns `false` when the stored record is already
    /// current; unchanged files never get rewritten.
    pub async fn index_file(&self, path: &Path) -> Result<bool> {
        let canonical = path.canonicalize()?;
        if !walker::should_index(&canonical) {
            return Ok(false);
        }

        let meta = std::fs::metadata(&canonical)?;
        let mtime = meta
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let file = DiscoveredFile {
            absolute_path: canonical,
            mtime,
            size: meta.len(),
        };

        let key = file.absolute_path.to_string_lossy().into_owned();
        if !self.metadata.needs_reindex(&key, file.mtime_utc()) {
            debug!("unchanged, skipping {key}");
            return Ok(false);
        }

        let content = self.parser.parse(&file.absolute_path)?;
        self.store_one(&file, &content).await;
        self.cache.clear();
        Ok(true)
    }

    pub fn remove_file(&self, path: &Path) -> bool {
        let key = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned();

        let removed = self.metadata.remove(&key);
        self.vectors.delete(&key);
        if removed {
            self.cache.clear();
        }
        removed
    }

    async fn store_one(&self, file: &DiscoveredFile, content: &str) {
        let record = build_record(file, content);
        // The embedding provider applies its own input cap.
        let vector = self.embedder.generate(&record.content).await;

        self.vectors.put(
            &record.path,
            vector,
            VectorMeta {
                path: record.path.clone(),
                file_type: record.file_type.clone(),
                size: record.size,
            },
        );
        self.metadata.upsert(record);
    }

    // -- Bulk operations --

    /// Drop the whole index and re-index every watch root. Runs on a
    /// background task; the handle resolves to a report.
    pub fn rebuild_all(self: &Arc<Self>) -> JoinHandle<RebuildReport> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.rebuild_inner().await })
    }

    async fn rebuild_inner(&self) -> RebuildReport {
        let started = Instant::now();
        info!("full rebuild started");

        self.metadata.clear();
        self.vectors.clear();
        self.cache.clear();

        let files = self.discover_all();
        let loaded = self.read_contents(files).await;

        let mut report = RebuildReport {
            scanned: loaded.len(),
            ..Default::default()
        };

        let mut records = Vec::new();
        for (file, content) in loaded {
            match content {
                Ok(text) => records.push(build_record(&file, &text)),
                Err(e) => {
                    warn!("skipping {}: {e}", file.absolute_path.display());
                    report.failed += 1;
                }
            }
        }

        let texts: Vec<String> =
            records.iter().map(|r| r.content.clone()).collect();
        let vectors = self.embedder.generate_batch(&texts).await;

        let entries: Vec<_> = records
            .iter()
            .zip(vectors)
            .map(|(record, vector)| {
                (
                    record.path.clone(),
                    vector,
                    VectorMeta {
                        path: record.path.clone(),
                        file_type: record.file_type.clone(),
                        size: record.size,
                    },
                )
            })
            .collect();
        self.vectors.put_batch(&entries);

        report.indexed = records.len();
        for record in records {
            self.metadata.upsert(record);
        }

        self.metadata
            .set_setting(LAST_REBUILD_KEY, &Utc::now().to_rfc3339());
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "full rebuild finished: {} indexed, {} failed in {}ms",
            report.indexed, report.failed, report.elapsed_ms
        );
        report
    }

    /// Reconcile the index with the filesystem: reindex files whose mtime
    /// advanced, drop records whose file disappeared.
    pub fn update_incremental(self: &Arc<Self>) -> JoinHandle<IncrementalReport> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.incremental_inner().await })
    }

    async fn incremental_inner(&self) -> IncrementalReport {
        let started = Instant::now();
        let files = self.discover_all();

        let mut report = IncrementalReport {
            checked: files.len(),
            ..Default::default()
        };

        let stale: Vec<DiscoveredFile> = files
            .iter()
            .filter(|f| {
                let key = f.absolute_path.to_string_lossy();
                self.metadata.needs_reindex(&key, f.mtime_utc())
            })
            .cloned()
            .collect();

        let loaded = self.read_contents(stale).await;
        for (file, content) in loaded {
            match content {
                Ok(text) => {
                    self.store_one(&file, &text).await;
                    report.updated += 1;
                }
                Err(e) => {
                    warn!("skipping {}: {e}", file.absolute_path.display())
                }
            }
        }

        // Records under a watch root whose file no longer exists.
        let roots = self.roots();
        for record in self.metadata.all() {
            let under_root = roots.iter().any(|r| record.path.starts_with(r));
            if under_root && !Path::new(&record.path).exists() {
                self.metadata.remove(&record.path);
                self.vectors.delete(&record.path);
                report.removed += 1;
            }
        }

        if report.updated > 0 || report.removed > 0 {
            self.cache.clear();
        }

        self.metadata
            .set_setting(LAST_INCREMENTAL_KEY, &Utc::now().to_rfc3339());
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            "incremental sync: {} checked, {} updated, {} removed",
            report.checked, report.updated, report.removed
        );
        report
    }

    fn discover_all(&self) -> Vec<DiscoveredFile> {
        let mut files = Vec::new();
        for root in self.roots() {
            match walker::discover_files(Path::new(&root)) {
                Ok(found) => files.extend(found),
                Err(e) => warn!("cannot walk {root}: {e}"),
            }
        }
        files
    }

    /// Read file contents in parallel off the async runtime.
    async fn read_contents(
        &self,
        files: Vec<DiscoveredFile>,
    ) -> Vec<(DiscoveredFile, Result<String>)> {
        let parser = Arc::clone(&self.parser);
        let task = tokio::task::spawn_blocking(move || {
            files
                .into_par_iter()
                .map(|file| {
                    let content = parser.parse(&file.absolute_path);
                    (file, content)
                })
                .collect::<Vec<_>>()
        });

        match task.await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("content read task failed: {e}");
                Vec::new()
            }
        }
    }

    // -- Maintenance --

    /// One maintenance pass: reconcile with the filesystem, drop orphans,
    /// refresh statistics and sweep the query cache.
    pub async fn maintenance_pass(self: &Arc<Self>) {
        if let Ok(report) = self.update_incremental().await {
            debug!("maintenance incremental: {report:?}");
        }
        self.metadata.remove_orphans();
        self.metadata.refresh_stats();
        self.cache.sweep();
        self.metadata
            .set_setting(LAST_SWEEP_KEY, &Utc::now().to_rfc3339());
    }

    /// Start the periodic maintenance sweep. A previous sweep, if any,
    /// is stopped first.
    pub fn start_maintenance(self: &Arc<Self>, every: Duration) {
        self.stop_maintenance();

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.maintenance_pass().await;
            }
        });

        *self.maintenance.lock() = Some(handle);
        info!("maintenance sweep scheduled every {every:?}");
    }

    pub fn stop_maintenance(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }

    // -- Status --

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            record_count: self.metadata.len(),
            vector_count: self.vectors.len(),
            embedding_cache_size: self.embedder.cache_size(),
            storage_backend: self.vectors.backend().to_string(),
            model_available: self.embedder.is_model_available(),
            watch_roots: self.roots(),
            last_rebuild: self.metadata.get_setting(LAST_REBUILD_KEY),
            last_incremental: self.metadata.get_setting(LAST_INCREMENTAL_KEY),
            last_sweep: self.metadata.get_setting(LAST_SWEEP_KEY),
        }
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }
}

fn build_record(file: &DiscoveredFile, content: &str) -> FileRecord {
    let path = file.absolute_path.to_string_lossy();
    let name = file
        .absolute_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_type = file
        .absolute_path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    FileRecord::new(
        &path,
        &name,
        file.size,
        &file_type,
        content,
        file.mtime_utc().to_rfc3339(),
        Utc::now().to_rfc3339(),
    )
}
