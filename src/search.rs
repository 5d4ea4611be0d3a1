use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    embedding::{cosine_similarity, Embedder},
    error::Result,
    metadata_store::{FileRecord, MetadataStore},
    text_util,
    vector_store::{VectorMeta, VectorStore},
};

/// Tunable weights and cutoffs for the cascade.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Weight of token overlap in the fuzzy score.
    pub w_token: f32,
    /// Weight of character overlap.
    pub w_char: f32,
    /// Weight of length similarity.
    pub w_length: f32,
    /// Weight of bigram similarity.
    pub w_bigram: f32,
    /// Weight of the shared-vocabulary boost.
    pub w_vocab: f32,
    /// Minimum fuzzy score for admission.
    pub fuzzy_threshold: f32,
    /// At most this many fuzzy hits are admitted.
    pub fuzzy_quota: usize,
    /// Minimum cosine similarity for semantic admission.
    pub semantic_threshold: f32,
    /// At most this many semantic hits are admitted.
    pub semantic_quota: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            w_token: 0.3,
            w_char: 0.2,
            w_length: 0.1,
            w_bigram: 0.15,
            w_vocab: 0.25,
            fuzzy_threshold: 0.1,
            fuzzy_quota: 10,
            semantic_threshold: 0.1,
            semantic_quota: 5,
        }
    }
}

/// Which stage of the cascade produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStage {
    Exact,
    Fuzzy,
    Semantic,
}

impl MatchStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Semantic => "semantic",
        }
    }
}

/// Optional constraints applied before any stage runs.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub file_type: Option<String>,
    pub path_prefix: Option<String>,
}

impl SearchFilters {
    fn accepts(&self, record: &FileRecord) -> bool {
        if let Some(ref ft) = self.file_type
            && !record.file_type.eq_ignore_ascii_case(ft)
        {
            return false;
        }
        if let Some(ref prefix) = self.path_prefix
            && !record.path.starts_with(prefix.as_str())
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub page_size: usize,
    pub filters: SearchFilters,
}

impl SearchRequest {
    pub fn new(query: &str, page_size: usize) -> Self {
        Self {
            query: query.to_string(),
            page_size,
            filters: SearchFilters::default(),
        }
    }
}

/// One result row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub name: String,
    pub file_type: String,
    pub size: u64,
    pub score: f32,
    pub stage: MatchStage,
    /// Highlighted excerpt around the first match.
    pub excerpt: String,
    pub summary: String,
    pub last_modified: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    /// Commentary on the top result, when a summarizer is attached.
    pub analysis: Option<String>,
}

/// Produces commentary for the best hit of a search.
pub trait Summarizer: Send + Sync {
    fn analyze(&self, query: &str, top: &SearchHit) -> Result<String>;
}

/// Three-stage cascading search over the metadata and vector stores.
///
/// Exact substring hits come first at score 1.0. If the page is not yet
/// full, weighted fuzzy matching fills it, then semantic similarity over
/// stored vectors. Earlier stages always win on dedupe.
pub struct SearchPipeline {
    metadata: Arc<MetadataStore>,
    vectors: Arc<VectorStore>,
    embedder: Arc<Embedder>,
    config: SearchConfig,
    summarizer: Option<Box<dyn Summarizer>>,
}

impl SearchPipeline {
    pub fn new(
        metadata: Arc<MetadataStore>,
        vectors: Arc<VectorStore>,
        embedder: Arc<Embedder>,
    ) -> Self {
        Self {
            metadata,
            vectors,
            embedder,
            config: SearchConfig::default(),
            summarizer: None,
        }
    }

    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub async fn search(&self, request: &SearchRequest) -> SearchResponse {
        let query = request.query.trim();
        if query.is_empty() || request.page_size == 0 {
            return SearchResponse {
                query: request.query.clone(),
                results: Vec::new(),
                analysis: None,
            };
        }

        let candidates: Vec<FileRecord> = self
            .metadata
            .all()
            .into_iter()
            .filter(|r| request.filters.accepts(r))
            .collect();

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Stage 1: exact substring matches at full score.
        for record in &candidates {
            if contains_ignore_case(&record.name, query)
                || contains_ignore_case(&record.content, query)
            {
                seen.insert(record.path.clone());
                hits.push(self.make_hit(record, 1.0, MatchStage::Exact, query));
            }
        }
        debug!("exact stage: {} hits", hits.len());

        // Stage 2: weighted fuzzy matching over the remainder.
        if hits.len() < request.page_size {
            let mut fuzzy: Vec<(f32, &FileRecord)> = candidates
                .iter()
                .filter(|r| !seen.contains(&r.path))
                .filter_map(|r| {
                    let score = self.fuzzy_score(query, r);
                    (score >= self.config.fuzzy_threshold)
                        .then_some((score, r))
                })
                .collect();
            fuzzy.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.path.cmp(&b.1.path))
            });
            fuzzy.truncate(self.config.fuzzy_quota);

            debug!("fuzzy stage: {} hits", fuzzy.len());
            for (score, record) in fuzzy {
                seen.insert(record.path.clone());
                hits.push(self.make_hit(record, score, MatchStage::Fuzzy, query));
            }
        }

        // Stage 3: semantic similarity for whatever is still missing.
        if hits.len() < request.page_size {
            let semantic = self.semantic_stage(query, &candidates, &seen).await;
            debug!("semantic stage: {} hits", semantic.len());
            for (score, record) in semantic {
                hits.push(self.make_hit(
                    &record,
                    score,
                    MatchStage::Semantic,
                    query,
                ));
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        hits.truncate(request.page_size);

        let analysis = self.analyze_top(query, hits.first());

        let stage = hits
            .first()
            .map(|h| h.stage.as_str())
            .unwrap_or("none");
        self.metadata.record_search(query, hits.len(), stage);

        SearchResponse {
            query: request.query.clone(),
            results: hits,
            analysis,
        }
    }

    /// Cosine-similarity ranking against stored vectors. Records without a
    /// vector get one computed from their content and persisted.
    async fn semantic_stage(
        &self,
        query: &str,
        candidates: &[FileRecord],
        seen: &HashSet<String>,
    ) -> Vec<(f32, FileRecord)> {
        let query_vec = self.embedder.generate(query).await;
        if query_vec.iter().all(|v| *v == 0.0) {
            return Vec::new();
        }

        let mut scored = Vec::new();
        for record in candidates {
            if seen.contains(&record.path) {
                continue;
            }

            let vector = match self.vectors.get(&record.path) {
                Some(v) => v,
                None => {
                    let v = self.embedder.generate(&record.content).await;
                    self.vectors.put(
                        &record.path,
                        v.clone(),
                        VectorMeta {
                            path: record.path.clone(),
                            file_type: record.file_type.clone(),
                            size: record.size,
                        },
                    );
                    v
                }
            };

            let score = cosine_similarity(&query_vec, &vector);
            if score >= self.config.semantic_threshold {
                scored.push((score, record.clone()));
            }
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.path.cmp(&b.1.path))
        });
        scored.truncate(self.config.semantic_quota);
        scored
    }

    /// Weighted blend of lexical similarity signals, in [0, 1].
    ///
    /// Token, character and vocabulary overlap run against the full
    /// indexed content; length and bigram similarity against the name.
    fn fuzzy_score(&self, query: &str, record: &FileRecord) -> f32 {
        let query_lower = query.to_lowercase();
        let content_lower =
            format!("{} {}", record.name, record.content).to_lowercase();
        let name_lower = record.name.to_lowercase();

        let c = &self.config;
        c.w_token * token_overlap(&query_lower, &content_lower)
            + c.w_char * char_overlap(&query_lower, &content_lower)
            + c.w_length * length_similarity(&query_lower, &name_lower)
            + c.w_bigram * bigram_similarity(&query_lower, &name_lower)
            + c.w_vocab * vocabulary_boost(&query_lower, &content_lower)
    }

    fn make_hit(
        &self,
        record: &FileRecord,
        score: f32,
        stage: MatchStage,
        query: &str,
    ) -> SearchHit {
        SearchHit {
            path: record.path.clone(),
            name: record.name.clone(),
            file_type: record.file_type.clone(),
            size: record.size,
            score,
            stage,
            excerpt: text_util::excerpt_around_match(&record.content, query),
            summary: record.summary.clone(),
            last_modified: record.last_modified.clone(),
        }
    }

    /// A summarizer failure downgrades to no analysis, never a failed
    /// search.
    fn analyze_top(&self, query: &str, top: Option<&SearchHit>) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        let top = top?;
        match summarizer.analyze(query, top) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("summarizer failed for query {query:?}: {e}");
                None
            }
        }
    }
}

/// Format a response for human-readable terminal output.
pub fn format_human(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{:>3}. [{:.3}] ({}) {}",
            i + 1,
            hit.score,
            hit.stage.as_str(),
            hit.path
        );
        if !hit.summary.is_empty() {
            println!("     {}", hit.summary);
        }
    }
    println!("\n{} result(s)", response.results.len());

    if let Some(ref analysis) = response.analysis {
        println!("\n{analysis}");
    }
}

/// Format a response as JSON on stdout.
pub fn format_json(response: &SearchResponse) {
    match serde_json::to_string_pretty(response) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("cannot serialize response: {e}"),
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Fraction of query tokens found as substrings of the target.
fn token_overlap(query: &str, target: &str) -> f32 {
    let query_tokens: Vec<&str> = query.split_whitespace().collect();
    if query_tokens.is_empty() {
        return 0.0;
    }
    let matched = query_tokens
        .iter()
        .filter(|t| target.contains(**t))
        .count();
    matched as f32 / query_tokens.len() as f32
}

/// Fraction of distinct query characters present in the target.
fn char_overlap(query: &str, target: &str) -> f32 {
    let query_chars: HashSet<char> =
        query.chars().filter(|c| !c.is_whitespace()).collect();
    if query_chars.is_empty() {
        return 0.0;
    }
    let target_chars: HashSet<char> = target.chars().collect();
    let matched = query_chars
        .iter()
        .filter(|c| target_chars.contains(c))
        .count();
    matched as f32 / query_chars.len() as f32
}

/// Ratio of the shorter length to the longer.
fn length_similarity(query: &str, name: &str) -> f32 {
    let (a, b) = (query.chars().count(), name.chars().count());
    if a == 0 || b == 0 {
        return 0.0;
    }
    a.min(b) as f32 / a.max(b) as f32
}

/// Dice coefficient over character bigrams.
fn bigram_similarity(query: &str, name: &str) -> f32 {
    let qb = bigrams(query);
    let nb = bigrams(name);
    if qb.is_empty() || nb.is_empty() {
        return 0.0;
    }
    let shared = qb.intersection(&nb).count();
    2.0 * shared as f32 / (qb.len() + nb.len()) as f32
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> =
        text.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Domain-vocabulary clusters. A query and target sharing a cluster get
/// the full vocabulary weight.
const VOCABULARY_CLUSTERS: &[&[&str]] = &[
    &[
        "profit", "revenue", "income", "earnings", "cost", "expense",
        "margin", "budget",
    ],
    &[
        "analysis", "report", "summary", "overview", "review", "trend",
        "forecast", "data",
    ],
    &[
        "technology", "research", "development", "innovation", "patent",
        "design", "engineering", "production",
    ],
];

/// Substring matching here keeps punctuation-adjacent words ("revenue,")
/// inside their cluster.
fn vocabulary_boost(query: &str, target: &str) -> f32 {
    for cluster in VOCABULARY_CLUSTERS {
        let query_in = cluster.iter().any(|word| query.contains(word));
        let target_in = cluster.iter().any(|word| target.contains(word));
        if query_in && target_in {
            return 1.0;
        }
    }
    0.0
}
