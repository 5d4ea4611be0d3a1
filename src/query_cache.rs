use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tracing::debug;

use crate::search::{SearchPipeline, SearchRequest, SearchResponse};

/// Cached responses live for five minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    response: SearchResponse,
    stored_at: Instant,
}

/// TTL cache for search responses, keyed by normalized query text and
/// page size. Expired entries are dropped lazily on lookup and in bulk
/// by [`QueryCache::sweep`].
pub struct QueryCache {
    entries: DashMap<(String, usize), CacheEntry>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn key(query: &str, page_size: usize) -> (String, usize) {
        (query.trim().to_lowercase(), page_size)
    }

    pub fn get(&self, query: &str, page_size: usize) -> Option<SearchResponse> {
        let key = Self::key(query, page_size);
        let entry = self.entries.get(&key)?;
        if entry.stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.response.clone())
    }

    pub fn put(&self, query: &str, page_size: usize, response: SearchResponse) {
        self.entries.insert(
            Self::key(query, page_size),
            CacheEntry {
                response,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("swept {removed} expired cached queries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Search facade that consults the cache before running the pipeline.
pub struct CachedSearch {
    pipeline: Arc<SearchPipeline>,
    cache: Arc<QueryCache>,
}

impl CachedSearch {
    pub fn new(pipeline: Arc<SearchPipeline>, cache: Arc<QueryCache>) -> Self {
        Self { pipeline, cache }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Filtered requests bypass the cache; the key would otherwise alias
    /// differently-filtered result sets.
    pub async fn search(&self, request: &SearchRequest) -> SearchResponse {
        let cacheable = request.filters.file_type.is_none()
            && request.filters.path_prefix.is_none();

        if cacheable
            && let Some(hit) = self.cache.get(&request.query, request.page_size)
        {
            debug!("cache hit for query {:?}", request.query);
            return hit;
        }

        let response = self.pipeline.search(request).await;
        if cacheable {
            self.cache
                .put(&request.query, request.page_size, response.clone());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        embedding::Embedder,
        metadata_store::{FileRecord, MetadataStore},
        vector_store::VectorStore,
    };

    fn response(query: &str) -> SearchResponse {
        SearchResponse {
            query: query.to_string(),
            results: Vec::new(),
            analysis: None,
        }
    }

    #[test]
    fn get_put_roundtrip() {
        let cache = QueryCache::new();
        assert!(cache.get("hello", 10).is_none());

        cache.put("hello", 10, response("hello"));
        assert!(cache.get("hello", 10).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn key_normalizes_query_text() {
        let cache = QueryCache::new();
        cache.put("  Hello World  ", 10, response("Hello World"));

        assert!(cache.get("hello world", 10).is_some());
        assert!(cache.get("hello world", 20).is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = QueryCache::with_ttl(Duration::from_millis(0));
        cache.put("hello", 10, response("hello"));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("hello", 10).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_drops_only_expired() {
        let cache = QueryCache::with_ttl(Duration::from_secs(60));
        cache.put("fresh", 10, response("fresh"));
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 1);

        let cache = QueryCache::with_ttl(Duration::from_millis(0));
        cache.put("stale", 10, response("stale"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    fn cached_search() -> CachedSearch {
        let metadata = Arc::new(MetadataStore::in_memory());
        metadata.upsert(FileRecord::new(
            "/docs/a.txt",
            "a.txt",
            5,
            "txt",
            "hello world",
            Utc::now().to_rfc3339(),
            Utc::now().to_rfc3339(),
        ));

        let pipeline = Arc::new(SearchPipeline::new(
            metadata,
            Arc::new(VectorStore::in_memory()),
            Arc::new(Embedder::new()),
        ));
        CachedSearch::new(pipeline, Arc::new(QueryCache::new()))
    }

    #[tokio::test]
    async fn second_search_is_served_from_cache() {
        let search = cached_search();

        let first = search.search(&SearchRequest::new("hello", 10)).await;
        assert_eq!(search.cache().len(), 1);

        let second = search.search(&SearchRequest::new("hello", 10)).await;
        assert_eq!(first.results.len(), second.results.len());
    }

    #[tokio::test]
    async fn filtered_requests_bypass_cache() {
        let search = cached_search();

        let mut request = SearchRequest::new("hello", 10);
        request.filters.file_type = Some("txt".to_string());
        search.search(&request).await;

        assert!(search.cache().is_empty());
    }
}
