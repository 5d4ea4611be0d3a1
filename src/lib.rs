//! filesage - hybrid keyword and semantic search over local files.
//!
//! filesage watches folders, keeps file metadata and embedding vectors in
//! [redb](https://github.com/cberner/redb) with write-through in-memory
//! caches, and answers queries through a three-stage cascade: exact
//! substring matching, weighted fuzzy matching, then cosine similarity
//! over stored vectors.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use filesage::{
//!     DataDir, Embedder, IndexManager, MetadataStore, QueryCache,
//!     SearchPipeline, SearchRequest, VectorStore,
//! };
//!
//! # async fn run() {
//! let data_dir = DataDir::resolve(None).unwrap();
//! let metadata = Arc::new(MetadataStore::open(&data_dir.metadata_db()));
//! let vectors = Arc::new(VectorStore::open(&data_dir.vectors_db()));
//! let embedder = Arc::new(Embedder::new());
//!
//! let manager = Arc::new(IndexManager::new(
//!     Arc::clone(&metadata),
//!     Arc::clone(&vectors),
//!     Arc::clone(&embedder),
//!     Arc::new(QueryCache::new()),
//! ));
//! manager.add_root("/home/me/documents".as_ref()).unwrap();
//! manager.rebuild_all().await.unwrap();
//!
//! let pipeline = SearchPipeline::new(metadata, vectors, embedder);
//! let response = pipeline.search(&SearchRequest::new("budget", 10)).await;
//! for hit in &response.results {
//!     println!("[{:.3}] {}", hit.score, hit.path);
//! }
//! # }
//! ```

pub mod cli;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod index_manager;
pub mod metadata_store;
pub mod query_cache;
pub mod search;
pub mod text_util;
pub mod vector_store;
pub mod walker;

pub use data_dir::DataDir;
pub use embedding::Embedder;
pub use error::{Error, Result};
pub use index_manager::IndexManager;
pub use metadata_store::MetadataStore;
pub use query_cache::{CachedSearch, QueryCache};
pub use search::{SearchPipeline, SearchRequest, SearchResponse};
pub use vector_store::VectorStore;
