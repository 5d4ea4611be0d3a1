use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use dashmap::DashMap;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::Result;

/// Default embedding dimension (all-MiniLM-L6-v2 family).
pub const DEFAULT_DIMENSION: usize = 384;

/// Maximum number of characters fed into the model per text.
const MAX_INPUT_CHARS: usize = 512;

/// Default number of concurrent inference calls.
const DEFAULT_INFERENCE_CONCURRENCY: usize = 2;

/// A pluggable inference backend producing real model embeddings.
///
/// None ships by default; when absent (or failing) the embedder falls back
/// to a deterministic pseudo-random vector seeded by the input text.
pub trait EmbeddingBackend: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Turns text into fixed-length unit vectors, with a process-lifetime cache.
///
/// Inference runs off the caller's thread through a semaphore-bounded pool.
/// Failures never reach callers: a blank input yields the zero vector and a
/// backend error silently activates the deterministic fallback.
pub struct Embedder {
    dimension: usize,
    backend: Option<Box<dyn EmbeddingBackend>>,
    cache: DashMap<String, Arc<Vec<f32>>>,
    inference: Arc<Semaphore>,
}

impl Embedder {
    pub fn new() -> Self {
        Self::with_dimension(DEFAULT_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            backend: None,
            cache: DashMap::new(),
            inference: Arc::new(Semaphore::new(DEFAULT_INFERENCE_CONCURRENCY)),
        }
    }

    /// Attach a real inference backend. Vectors it produces must match the
    /// configured dimension; mismatched output falls back deterministically.
    pub fn with_backend(mut self, backend: Box<dyn EmbeddingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Whether a real model backend is attached. When false, all embeddings
    /// come from the deterministic fallback.
    pub fn is_model_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Generate an embedding for `text`, dispatched off the caller's thread.
    ///
    /// Blank input yields an all-zero vector; everything else is unit-norm.
    pub async fn generate(self: &Arc<Self>, text: &str) -> Arc<Vec<f32>> {
        let key = text.trim().to_string();
        if let Some(hit) = self.cache.get(&key) {
            return Arc::clone(&hit);
        }

        let permit = match Arc::clone(&self.inference).acquire_owned().await {
            Ok(permit) => permit,
            // Only possible if the semaphore is closed; compute inline.
            Err(_) => return self.compute_and_cache(key),
        };

        let this = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            this.compute_and_cache(key)
        })
        .await;

        match result {
            Ok(vector) => vector,
            Err(e) => {
                warn!("embedding task failed: {e}");
                Arc::new(vec![0.0; self.dimension])
            }
        }
    }

    /// Generate embeddings for a batch, reusing the cache entry-by-entry.
    pub async fn generate_batch(
        self: &Arc<Self>,
        texts: &[String],
    ) -> Vec<Arc<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.generate(text).await);
        }
        vectors
    }

    fn compute_and_cache(&self, key: String) -> Arc<Vec<f32>> {
        let normalized = normalize_text(&key);
        if normalized.is_empty() {
            let zero = Arc::new(vec![0.0; self.dimension]);
            self.cache.insert(key, Arc::clone(&zero));
            return zero;
        }

        let vector = self
            .backend_embed(&normalized)
            .unwrap_or_else(|| self.fallback_embed(&normalized));

        let vector = Arc::new(vector);
        self.cache.insert(key, Arc::clone(&vector));
        vector
    }

    fn backend_embed(&self, text: &str) -> Option<Vec<f32>> {
        let backend = self.backend.as_ref()?;
        match backend.embed(text) {
            Ok(vector) if vector.len() == self.dimension => Some(vector),
            Ok(vector) => {
                warn!(
                    "backend returned dimension {} (expected {}), using fallback",
                    vector.len(),
                    self.dimension
                );
                None
            }
            Err(e) => {
                warn!("model inference failed, using fallback: {e}");
                None
            }
        }
    }

    /// Deterministic pseudo-random unit vector seeded by a stable hash of
    /// the normalized text. Identical input always yields the same vector.
    fn fallback_embed(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());

        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|_| rng.random_range(-1.0f32..1.0))
            .collect();
        l2_normalize(&mut vector);

        debug!("generated fallback embedding ({} chars)", text.len());
        vector
    }
}

impl Default for Embedder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("dimension", &self.dimension)
            .field("model_available", &self.backend.is_some())
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 when either vector is empty, lengths mismatch, or either
/// norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Trim, collapse whitespace runs, strip control characters, and cap length.
fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(MAX_INPUT_CHARS));
    let mut last_was_space = true;

    for c in text.trim().chars() {
        if c.is_control() {
            continue;
        }
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
            continue;
        }
        out.push(c);
        last_was_space = false;
        if out.chars().count() >= MAX_INPUT_CHARS {
            break;
        }
    }

    out.trim_end().to_string()
}

fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[tokio::test]
    async fn generated_vectors_are_unit_norm() {
        let embedder = Arc::new(Embedder::new());
        let v = embedder.generate("quarterly budget report").await;

        assert_eq!(v.len(), DEFAULT_DIMENSION);
        assert!((norm(&v) - 1.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn blank_input_yields_zero_vector() {
        let embedder = Arc::new(Embedder::new());
        let v = embedder.generate("   \t\n  ").await;

        assert_eq!(v.len(), DEFAULT_DIMENSION);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[tokio::test]
    async fn deterministic_without_model() {
        let embedder = Arc::new(Embedder::new());
        let a = embedder.generate("hello world").await;

        let fresh = Arc::new(Embedder::new());
        let b = fresh.generate("hello world").await;

        assert_eq!(*a, *b);
        assert!(!embedder.is_model_available());
    }

    #[tokio::test]
    async fn different_texts_differ() {
        let embedder = Arc::new(Embedder::new());
        let a = embedder.generate("alpha").await;
        let b = embedder.generate("beta").await;
        assert_ne!(*a, *b);
    }

    #[tokio::test]
    async fn cache_is_keyed_by_trimmed_text() {
        let embedder = Arc::new(Embedder::new());
        embedder.generate("  hello  ").await;
        embedder.generate("hello").await;
        assert_eq!(embedder.cache_size(), 1);
    }

    #[tokio::test]
    async fn batch_reuses_cache() {
        let embedder = Arc::new(Embedder::new());
        let texts =
            vec!["one".to_string(), "two".to_string(), "one".to_string()];
        let vectors = embedder.generate_batch(&texts).await;

        assert_eq!(vectors.len(), 3);
        assert_eq!(*vectors[0], *vectors[2]);
        assert_eq!(embedder.cache_size(), 2);
    }

    #[tokio::test]
    async fn failing_backend_falls_back_silently() {
        struct Broken;
        impl EmbeddingBackend for Broken {
            fn embed(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
                Err(crate::error::Error::Config("model exploded".into()))
            }
        }

        let embedder =
            Arc::new(Embedder::new().with_backend(Box::new(Broken)));
        let v = embedder.generate("hello").await;

        assert!(embedder.is_model_available());
        assert!((norm(&v) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn similarity_of_self_is_one() {
        let v = vec![0.5f32, -0.2, 0.8, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_of_negation_is_minus_one() {
        let v = vec![0.5f32, -0.2, 0.8];
        let neg: Vec<f32> = v.iter().map(|x| -x).collect();
        assert!((cosine_similarity(&v, &neg) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_edge_cases_are_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn normalize_collapses_whitespace_and_controls() {
        assert_eq!(
            normalize_text("  hello\t\tworld\u{0}\u{7f} again "),
            "hello world again"
        );
    }

    #[test]
    fn normalize_caps_length() {
        let long = "a".repeat(2000);
        assert_eq!(normalize_text(&long).chars().count(), MAX_INPUT_CHARS);
    }
}
