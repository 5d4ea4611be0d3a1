use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");
const HISTORY: TableDefinition<u64, &[u8]> =
    TableDefinition::new("search_history");

/// Indexed content is capped at ~100 KB per file.
pub const CONTENT_LIMIT_BYTES: usize = 100_000;

/// Summaries are the first ~200 characters of content.
pub const SUMMARY_LIMIT_CHARS: usize = 200;

const HISTORY_MEMORY_LIMIT: usize = 1000;

/// One indexed file, keyed by its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub file_type: String,
    pub content: String,
    pub summary: String,
    /// Source mtime at index time, RFC 3339.
    pub last_modified: String,
    /// When this record was (re)written, RFC 3339.
    pub indexed_at: String,
}

impl FileRecord {
    /// Build a record from raw content, applying the content cap and
    /// deriving the summary.
    pub fn new(
        path: &str,
        name: &str,
        size: u64,
        file_type: &str,
        content: &str,
        last_modified: String,
        indexed_at: String,
    ) -> Self {
        Self {
            path: path.to_string(),
            name: name.to_string(),
            size,
            file_type: file_type.to_string(),
            content: truncate_content(content),
            summary: summarize(content),
            last_modified,
            indexed_at,
        }
    }
}

/// A recorded query, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub query: String,
    pub result_count: usize,
    pub search_type: String,
    pub searched_at: String,
}

/// File-metadata store: [`FileRecord`] rows keyed by path, with substring
/// search and the aggregate queries used for index health reporting.
///
/// Same degradation contract as the vector store: a failed persistent tier
/// means memory-only operation, observable but never fatal.
pub struct MetadataStore {
    records: DashMap<String, FileRecord>,
    settings: DashMap<String, String>,
    history: Mutex<Vec<SearchHistoryEntry>>,
    db: Mutex<Option<Database>>,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Self {
        let store = Self::in_memory();

        match Database::create(path) {
            Ok(db) => {
                *store.db.lock() = Some(db);
                if let Err(e) = store.preload() {
                    warn!(
                        "metadata store preload failed, degrading to memory-only: {e}"
                    );
                    *store.db.lock() = None;
                } else {
                    info!(
                        "metadata store opened: {} records loaded",
                        store.records.len()
                    );
                }
            }
            Err(e) => {
                warn!(
                    "metadata store backend failed to open ({}), degrading to memory-only: {e}",
                    path.display()
                );
            }
        }

        store
    }

    pub fn in_memory() -> Self {
        Self {
            records: DashMap::new(),
            settings: DashMap::new(),
            history: Mutex::new(Vec::new()),
            db: Mutex::new(None),
        }
    }

    fn preload(&self) -> Result<()> {
        let guard = self.db.lock();
        let Some(db) = guard.as_ref() else {
            return Ok(());
        };

        // Create all tables up front so later reads never race creation.
        let txn = db.begin_write()?;
        txn.open_table(FILES)?;
        txn.open_table(SETTINGS)?;
        txn.open_table(HISTORY)?;
        txn.commit()?;

        let txn = db.begin_read()?;

        let files = txn.open_table(FILES)?;
        for entry in files.iter()? {
            let (key, value) = entry?;
            match serde_json::from_slice::<FileRecord>(value.value()) {
                Ok(record) => {
                    self.records.insert(key.value().to_string(), record);
                }
                Err(e) => {
                    warn!("skipping unreadable record {}: {e}", key.value())
                }
            }
        }

        let settings = txn.open_table(SETTINGS)?;
        for entry in settings.iter()? {
            let (key, value) = entry?;
            self.settings
                .insert(key.value().to_string(), value.value().to_string());
        }

        let history = txn.open_table(HISTORY)?;
        let mut entries = self.history.lock();
        for entry in history.iter()? {
            let (_, value) = entry?;
            if let Ok(item) =
                serde_json::from_slice::<SearchHistoryEntry>(value.value())
            {
                entries.push(item);
            }
        }

        Ok(())
    }

    // -- Records --

    pub fn upsert(&self, record: FileRecord) {
        let path = record.path.clone();
        let bytes = serde_json::to_vec(&record).unwrap_or_default();
        self.records.insert(path.clone(), record);

        self.try_persist(|txn| {
            let mut table = txn.open_table(FILES)?;
            table.insert(path.as_str(), bytes.as_slice())?;
            Ok(())
        });
    }

    pub fn get(&self, path: &str) -> Option<FileRecord> {
        self.records.get(path).map(|r| r.clone())
    }

    pub fn remove(&self, path: &str) -> bool {
        let removed = self.records.remove(path).is_some();
        self.try_persist(|txn| {
            let mut table = txn.open_table(FILES)?;
            table.remove(path)?;
            Ok(())
        });
        removed
    }

    pub fn clear(&self) {
        self.records.clear();
        self.try_persist(|txn| {
            let mut table = txn.open_table(FILES)?;
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
        info!("cleared metadata store");
    }

    /// Snapshot of every record. Callers iterating this never block
    /// concurrent writers.
    pub fn all(&self) -> Vec<FileRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn backend(&self) -> crate::vector_store::StorageBackend {
        if self.db.lock().is_some() {
            crate::vector_store::StorageBackend::Redb
        } else {
            crate::vector_store::StorageBackend::Memory
        }
    }

    /// Case-insensitive substring search over file name and content.
    pub fn search_substring(&self, query: &str) -> Vec<FileRecord> {
        let needle = query.to_lowercase();
        self.records
            .iter()
            .filter(|r| {
                r.name.to_lowercase().contains(&needle)
                    || r.content.to_lowercase().contains(&needle)
            })
            .map(|r| r.clone())
            .collect()
    }

    // -- Change detection --

    /// Whether `path` must be (re)indexed given the source file's mtime.
    ///
    /// Unknown paths and unparseable stored timestamps both force a
    /// reindex; skipping is only allowed when the stored timestamp parses
    /// and is at least as new as the source.
    pub fn needs_reindex(&self, path: &str, fs_mtime: DateTime<Utc>) -> bool {
        let Some(record) = self.get(path) else {
            return true;
        };

        match parse_timestamp_lenient(&record.last_modified) {
            Some(stored) => fs_mtime.timestamp() > stored.timestamp(),
            None => {
                warn!(
                    "unparseable stored timestamp for {path} ({}), forcing reindex",
                    record.last_modified
                );
                true
            }
        }
    }

    // -- Aggregates --

    /// File-type histogram, descending by count.
    pub fn type_distribution(&self) -> Vec<(String, usize)> {
        let mut counts = std::collections::HashMap::new();
        for record in self.records.iter() {
            *counts.entry(record.file_type.clone()).or_insert(0) += 1;
        }
        let mut out: Vec<_> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out
    }

    /// Size-bucket histogram.
    pub fn size_distribution(&self) -> Vec<(&'static str, usize)> {
        let mut buckets = [0usize; 5];
        for record in self.records.iter() {
            let idx = match record.size {
                s if s < 10_000 => 0,
                s if s < 100_000 => 1,
                s if s < 1_000_000 => 2,
                s if s < 10_000_000 => 3,
                _ => 4,
            };
            buckets[idx] += 1;
        }
        SIZE_BUCKET_LABELS
            .iter()
            .zip(buckets)
            .map(|(label, count)| (*label, count))
            .collect()
    }

    /// Modification-age histogram bucketed from `last_modified`.
    /// Unparseable timestamps land in the oldest bucket.
    pub fn age_distribution(&self) -> Vec<(&'static str, usize)> {
        let now = Utc::now();
        let mut buckets = [0usize; 4];
        for record in self.records.iter() {
            let idx = match parse_timestamp_lenient(&record.last_modified) {
                Some(ts) => {
                    let age = now.signed_duration_since(ts);
                    if age.num_days() < 1 {
                        0
                    } else if age.num_days() < 7 {
                        1
                    } else if age.num_days() < 30 {
                        2
                    } else {
                        3
                    }
                }
                None => 3,
            };
            buckets[idx] += 1;
        }
        AGE_BUCKET_LABELS
            .iter()
            .zip(buckets)
            .map(|(label, count)| (*label, count))
            .collect()
    }

    // -- Maintenance --

    /// Check that the persistent tier is reachable and its tables open.
    pub fn verify(&self) -> bool {
        let guard = self.db.lock();
        let Some(db) = guard.as_ref() else {
            return false;
        };

        (|| -> Result<()> {
            let txn = db.begin_read()?;
            txn.open_table(FILES)?;
            txn.open_table(SETTINGS)?;
            txn.open_table(HISTORY)?;
            Ok(())
        })()
        .is_ok()
    }

    /// Recompute the aggregate distributions and stamp the refresh time
    /// into settings for later health reporting.
    pub fn refresh_stats(&self) {
        let types = self.type_distribution();
        let sizes = self.size_distribution();
        let ages = self.age_distribution();

        self.set_setting(
            "stats.types",
            &serde_json::to_string(&types).unwrap_or_default(),
        );
        self.set_setting(
            "stats.sizes",
            &serde_json::to_string(&sizes).unwrap_or_default(),
        );
        self.set_setting(
            "stats.ages",
            &serde_json::to_string(&ages).unwrap_or_default(),
        );
        self.set_setting("stats.refreshed_at", &Utc::now().to_rfc3339());
        debug!("refreshed table statistics");
    }

    /// Delete rows whose backing file no longer exists. Returns how many
    /// were removed.
    pub fn remove_orphans(&self) -> usize {
        let orphans: Vec<String> = self
            .records
            .iter()
            .filter(|r| !Path::new(r.key()).exists())
            .map(|r| r.key().clone())
            .collect();

        for path in &orphans {
            self.remove(path);
        }
        if !orphans.is_empty() {
            info!("removed {} orphaned records", orphans.len());
        }
        orphans.len()
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) {
        self.settings.insert(key.to_string(), value.to_string());
        let (key, value) = (key.to_string(), value.to_string());
        self.try_persist(|txn| {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key.as_str(), value.as_str())?;
            Ok(())
        });
    }

    pub fn get_setting(&self, key: &str) -> Option<String> {
        self.settings.get(key).map(|v| v.clone())
    }

    // -- Search history --

    /// Record one query. Failures here are logged and swallowed; history
    /// must never fail a search.
    pub fn record_search(
        &self,
        query: &str,
        result_count: usize,
        search_type: &str,
    ) {
        let entry = SearchHistoryEntry {
            query: query.to_string(),
            result_count,
            search_type: search_type.to_string(),
            searched_at: Utc::now().to_rfc3339(),
        };

        let seq = {
            let mut entries = self.history.lock();
            entries.push(entry.clone());
            if entries.len() > HISTORY_MEMORY_LIMIT {
                entries.remove(0);
            }
            entries.len() as u64
        };

        let bytes = serde_json::to_vec(&entry).unwrap_or_default();
        self.try_persist(move |txn| {
            let mut table = txn.open_table(HISTORY)?;
            table.insert(seq, bytes.as_slice())?;
            Ok(())
        });
    }

    /// Most recent queries, newest first.
    pub fn recent_searches(&self, limit: usize) -> Vec<SearchHistoryEntry> {
        let entries = self.history.lock();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
        self.try_persist(|txn| {
            let mut table = txn.open_table(HISTORY)?;
            let keys: Vec<u64> = table
                .iter()?
                .filter_map(|entry| entry.ok())
                .map(|(k, _)| k.value())
                .collect();
            for key in keys {
                table.remove(key)?;
            }
            Ok(())
        });
    }

    fn try_persist<F>(&self, write: F)
    where
        F: FnOnce(&redb::WriteTransaction) -> Result<()>,
    {
        let mut guard = self.db.lock();
        let Some(db) = guard.as_ref() else {
            return;
        };

        let result = (|| -> Result<()> {
            let txn = db.begin_write()?;
            write(&txn)?;
            txn.commit()?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!("metadata store write failed, degrading to memory-only: {e}");
            *guard = None;
        }
    }
}

const SIZE_BUCKET_LABELS: [&str; 5] =
    ["<10KB", "10KB-100KB", "100KB-1MB", "1MB-10MB", ">=10MB"];

const AGE_BUCKET_LABELS: [&str; 4] =
    ["<1 day", "1-7 days", "7-30 days", ">30 days"];

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("record_count", &self.records.len())
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}

/// Parse a stored timestamp, tolerating precision and timezone drift.
///
/// Tries RFC 3339 first, then a naive datetime with or without fractional
/// seconds (assumed UTC). Returns `None` when nothing fits; callers treat
/// that as "reindex".
pub fn parse_timestamp_lenient(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    // Fractional-second precision varies between writers; drop it.
    let truncated = match raw.split_once('.') {
        Some((whole, _)) => whole,
        None => raw,
    };

    for candidate in [raw, truncated] {
        if let Ok(naive) =
            NaiveDateTime::parse_from_str(candidate, "%Y-%m-%dT%H:%M:%S%.f")
        {
            return Some(naive.and_utc());
        }
        if let Ok(naive) =
            NaiveDateTime::parse_from_str(candidate, "%Y-%m-%dT%H:%M:%S")
        {
            return Some(naive.and_utc());
        }
    }

    None
}

fn truncate_content(content: &str) -> String {
    if content.len() <= CONTENT_LIMIT_BYTES {
        return content.to_string();
    }
    // Cut on a char boundary at or below the byte limit.
    let mut end = CONTENT_LIMIT_BYTES;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &content[..end])
}

fn summarize(content: &str) -> String {
    let chars: Vec<char> = content.chars().take(SUMMARY_LIMIT_CHARS + 1).collect();
    if chars.len() <= SUMMARY_LIMIT_CHARS {
        content.to_string()
    } else {
        let head: String = chars[..SUMMARY_LIMIT_CHARS].iter().collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record(path: &str, file_type: &str, size: u64) -> FileRecord {
        FileRecord::new(
            path,
            Path::new(path).file_name().unwrap().to_str().unwrap(),
            size,
            file_type,
            "some file content here",
            "2023-06-01T12:00:00+00:00".to_string(),
            Utc::now().to_rfc3339(),
        )
    }

    fn test_store() -> (tempfile::TempDir, MetadataStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&tmp.path().join("metadata.redb"));
        (tmp, store)
    }

    #[test]
    fn upsert_get_remove() {
        let (_tmp, store) = test_store();
        store.upsert(record("/tmp/a.txt", "txt", 100));

        let got = store.get("/tmp/a.txt").unwrap();
        assert_eq!(got.name, "a.txt");
        assert_eq!(got.file_type, "txt");

        assert!(store.remove("/tmp/a.txt"));
        assert!(!store.remove("/tmp/a.txt"));
        assert!(store.get("/tmp/a.txt").is_none());
    }

    #[test]
    fn reopen_preserves_records_and_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metadata.redb");

        {
            let store = MetadataStore::open(&path);
            store.upsert(record("/tmp/a.txt", "txt", 100));
            store.set_setting("watch_roots", "[\"/tmp\"]");
            store.record_search("hello", 3, "exact");
        }

        {
            let store = MetadataStore::open(&path);
            assert_eq!(store.len(), 1);
            assert_eq!(
                store.get_setting("watch_roots").unwrap(),
                "[\"/tmp\"]"
            );
            let history = store.recent_searches(10);
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].query, "hello");
        }
    }

    #[test]
    fn substring_search_matches_name_and_content() {
        let (_tmp, store) = test_store();
        let mut a = record("/tmp/budget.txt", "txt", 10);
        a.content = "annual figures".to_string();
        store.upsert(a);

        let mut b = record("/tmp/notes.md", "md", 10);
        b.content = "the BUDGET looks fine".to_string();
        store.upsert(b);

        let mut c = record("/tmp/other.md", "md", 10);
        c.content = "unrelated".to_string();
        store.upsert(c);

        let hits = store.search_substring("budget");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn content_is_truncated_and_summarized() {
        let long = "x".repeat(CONTENT_LIMIT_BYTES + 500);
        let rec = FileRecord::new(
            "/tmp/big.txt",
            "big.txt",
            0,
            "txt",
            &long,
            Utc::now().to_rfc3339(),
            Utc::now().to_rfc3339(),
        );

        assert!(rec.content.len() <= CONTENT_LIMIT_BYTES + 3);
        assert!(rec.content.ends_with("..."));
        assert_eq!(rec.summary.chars().count(), SUMMARY_LIMIT_CHARS + 3);
    }

    #[test]
    fn needs_reindex_unknown_path() {
        let (_tmp, store) = test_store();
        assert!(store.needs_reindex("/nope", Utc::now()));
    }

    #[test]
    fn needs_reindex_when_mtime_advances() {
        let (_tmp, store) = test_store();
        store.upsert(record("/tmp/a.txt", "txt", 1));

        let stored = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
        assert!(!store.needs_reindex("/tmp/a.txt", stored));
        assert!(
            !store.needs_reindex(
                "/tmp/a.txt",
                stored - chrono::Duration::hours(1)
            )
        );
        assert!(
            store.needs_reindex(
                "/tmp/a.txt",
                stored + chrono::Duration::hours(1)
            )
        );
    }

    #[test]
    fn needs_reindex_fails_open_on_garbage_timestamp() {
        let (_tmp, store) = test_store();
        let mut rec = record("/tmp/a.txt", "txt", 1);
        rec.last_modified = "not a timestamp".to_string();
        store.upsert(rec);

        let long_ago = Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap();
        assert!(store.needs_reindex("/tmp/a.txt", long_ago));
    }

    #[test]
    fn lenient_parse_tolerates_precision_and_naive_forms() {
        // RFC 3339 with offset
        assert!(parse_timestamp_lenient("2023-06-01T12:00:00+02:00").is_some());
        // Naive with nanosecond-ish fraction (original writer format)
        assert!(
            parse_timestamp_lenient("2023-06-01T12:00:00.123456789").is_some()
        );
        // Naive without fraction
        assert!(parse_timestamp_lenient("2023-06-01T12:00:00").is_some());
        // Garbage
        assert!(parse_timestamp_lenient("yesterday-ish").is_none());
    }

    #[test]
    fn type_distribution_sorted_by_count() {
        let (_tmp, store) = test_store();
        store.upsert(record("/tmp/a.txt", "txt", 1));
        store.upsert(record("/tmp/b.txt", "txt", 1));
        store.upsert(record("/tmp/c.pdf", "pdf", 1));

        let dist = store.type_distribution();
        assert_eq!(dist[0], ("txt".to_string(), 2));
        assert_eq!(dist[1], ("pdf".to_string(), 1));
    }

    #[test]
    fn size_distribution_buckets() {
        let (_tmp, store) = test_store();
        store.upsert(record("/tmp/small.txt", "txt", 500));
        store.upsert(record("/tmp/medium.txt", "txt", 50_000));
        store.upsert(record("/tmp/large.txt", "txt", 5_000_000));

        let dist = store.size_distribution();
        assert_eq!(dist[0], ("<10KB", 1));
        assert_eq!(dist[1], ("10KB-100KB", 1));
        assert_eq!(dist[3], ("1MB-10MB", 1));
    }

    #[test]
    fn age_distribution_counts_unparseable_as_old() {
        let (_tmp, store) = test_store();
        let mut fresh = record("/tmp/new.txt", "txt", 1);
        fresh.last_modified = Utc::now().to_rfc3339();
        store.upsert(fresh);

        let mut broken = record("/tmp/old.txt", "txt", 1);
        broken.last_modified = "???".to_string();
        store.upsert(broken);

        let dist = store.age_distribution();
        assert_eq!(dist[0], ("<1 day", 1));
        assert_eq!(dist[3], (">30 days", 1));
    }

    #[test]
    fn remove_orphans_deletes_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&tmp.path().join("metadata.redb"));

        let real = tmp.path().join("real.txt");
        std::fs::write(&real, "hello").unwrap();
        store.upsert(record(real.to_str().unwrap(), "txt", 5));
        store.upsert(record("/definitely/not/here.txt", "txt", 5));

        assert_eq!(store.remove_orphans(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(real.to_str().unwrap()).is_some());
    }

    #[test]
    fn verify_and_refresh_stats() {
        let (_tmp, store) = test_store();
        assert!(store.verify());

        store.upsert(record("/tmp/a.txt", "txt", 1));
        store.refresh_stats();
        assert!(store.get_setting("stats.types").is_some());
        assert!(store.get_setting("stats.refreshed_at").is_some());
    }

    #[test]
    fn history_recent_is_newest_first() {
        let (_tmp, store) = test_store();
        store.record_search("first", 1, "exact");
        store.record_search("second", 2, "fuzzy");

        let recent = store.recent_searches(5);
        assert_eq!(recent[0].query, "second");
        assert_eq!(recent[1].query, "first");

        store.clear_history();
        assert!(store.recent_searches(5).is_empty());
    }

    #[test]
    fn degraded_mode_still_serves_records() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory path cannot be opened as a database file.
        let store = MetadataStore::open(tmp.path());

        assert_eq!(
            store.backend(),
            crate::vector_store::StorageBackend::Memory
        );
        assert!(!store.verify());

        store.upsert(record("/tmp/a.txt", "txt", 1));
        assert!(store.get("/tmp/a.txt").is_some());
    }
}
