//! Retrieval-Augmented Context Assembly
//!
//! Embeds queries, searches a Qdrant collection for nearest neighbors,
//! and assembles the context block for the retrieval-augmented prompt.
//! Query embeddings are cached (LRU + TTL) to cut latency on repeated
//! and closely-spaced queries.
//!
//! Related-question suggestions come from a second, larger search that
//! skips the top hits: those are already consumed as the answer's
//! grounding context, so skipping them surfaces different follow-up
//! material. This is a heuristic, not a guarantee of topical diversity.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::ChatError;

/// Embedding service configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Embedding API URL
    pub url: String,
    /// Embedding model name
    pub model: String,
    /// Vector dimension (must match the index collection)
    pub dimension: usize,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("EMBEDDING_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "all-minilm".to_string()),
            dimension: 384,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embedding generator with query caching
pub struct EmbeddingClient {
    config: EmbeddingConfig,
    client: reqwest::Client,
    available: AtomicBool,
    /// LRU cache for query embeddings (1000 entries, 1 hour TTL)
    cache: Cache<String, Vec<f32>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");

        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Self {
            config,
            client,
            available: AtomicBool::new(true),
            cache,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EmbeddingConfig::default())
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Probe the embedding service and remember the result
    pub async fn check_availability(&self) -> bool {
        let available = self
            .client
            .get(format!("{}/api/tags", self.config.url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false);
        self.available.store(available, Ordering::Relaxed);
        available
    }

    /// Cached availability flag (fast, non-blocking)
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Generate an embedding for a query (with caching)
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cache_key = text.trim().to_string();

        if let Some(cached) = self.cache.get(&cache_key).await {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let embedding = self.embed_uncached(text).await?;
        self.cache.insert(cache_key, embedding.clone()).await;
        Ok(embedding)
    }

    /// Generate an embedding without caching (for document indexing)
    pub async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        if !self.is_available() {
            anyhow::bail!("Embedding service unavailable");
        }

        let url = format!("{}/api/embeddings", self.config.url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "model": self.config.model,
                "prompt": text,
            }))
            .send()
            .await
            .context("Failed to send embedding request")?;

        if !response.status().is_success() {
            let status = response.status();
            self.available.store(false, Ordering::Relaxed);
            anyhow::bail!("Embedding request failed: {}", status);
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        Ok(result.embedding)
    }
}

/// Similarity index configuration (Qdrant REST)
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://localhost:6333".to_string()),
            api_key: std::env::var("QDRANT_API_KEY").ok().filter(|k| !k.is_empty()),
            collection: std::env::var("QDRANT_COLLECTION_NAME")
                .unwrap_or_else(|_| "chatbot_documents".to_string()),
            timeout: Duration::from_secs(30),
        }
    }
}

/// One nearest-neighbor hit
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    pub score: f32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}

/// Document queued for indexing
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Thin Qdrant REST client
pub struct VectorIndexClient {
    config: IndexConfig,
    client: reqwest::Client,
}

impl VectorIndexClient {
    pub fn new(config: IndexConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    pub fn with_defaults() -> Self {
        Self::new(IndexConfig::default())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.url, path);
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    /// Top-k nearest neighbors with payloads
    pub async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredPoint>> {
        let path = format!("/collections/{}/points/search", self.config.collection);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "with_payload": true,
            }))
            .send()
            .await
            .context("Failed to send similarity search")?;

        if !response.status().is_success() {
            anyhow::bail!("Similarity search failed: {}", response.status());
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;
        Ok(parsed.result)
    }

    /// Total points in the collection
    pub async fn count(&self) -> Result<usize> {
        let path = format!("/collections/{}/points/count", self.config.collection);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&json!({ "exact": true }))
            .send()
            .await
            .context("Failed to send count request")?;

        if !response.status().is_success() {
            anyhow::bail!("Count request failed: {}", response.status());
        }

        let parsed: CountResponse = response
            .json()
            .await
            .context("Failed to parse count response")?;
        Ok(parsed.result.count)
    }

    /// Upsert embedded documents into the collection
    pub async fn upsert(&self, documents: &[DocumentInput], vectors: &[Vec<f32>]) -> Result<()> {
        let points: Vec<serde_json::Value> = documents
            .iter()
            .zip(vectors.iter())
            .map(|(doc, vector)| {
                let mut payload = doc.metadata.clone();
                if !payload.is_object() {
                    payload = json!({});
                }
                payload["content"] = json!(doc.content);
                json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "vector": vector,
                    "payload": payload,
                })
            })
            .collect();

        let path = format!("/collections/{}/points?wait=true", self.config.collection);
        let response = self
            .request(reqwest::Method::PUT, &path)
            .json(&json!({ "points": points }))
            .send()
            .await
            .context("Failed to send upsert request")?;

        if !response.status().is_success() {
            anyhow::bail!("Upsert failed: {}", response.status());
        }
        Ok(())
    }

    /// Create the collection if it does not exist yet
    pub async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        let path = format!("/collections/{}", self.config.collection);
        let existing = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .context("Failed to query collection")?;

        if existing.status().is_success() {
            debug!("Collection '{}' already exists", self.config.collection);
            return Ok(());
        }

        let response = self
            .request(reqwest::Method::PUT, &path)
            .json(&json!({
                "vectors": { "size": dimension, "distance": "Cosine" },
            }))
            .send()
            .await
            .context("Failed to create collection")?;

        if !response.status().is_success() {
            anyhow::bail!("Collection creation failed: {}", response.status());
        }

        debug!("Created collection '{}'", self.config.collection);
        Ok(())
    }
}

/// A document returned from the similarity index. Immutable for the
/// duration of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default, alias = "meta")]
    pub metadata: serde_json::Value,
}

/// Related-question sampling window. Tunables, not hard constraints.
#[derive(Debug, Clone)]
pub struct RelatedQuestionsConfig {
    /// Leading hits to discard (already consumed as answer context)
    pub skip: usize,
    /// Hits to consider after the skipped slice
    pub take: usize,
    /// Final suggestion count
    pub max: usize,
}

impl Default for RelatedQuestionsConfig {
    fn default() -> Self {
        Self {
            skip: 8,
            take: 10,
            max: 4,
        }
    }
}

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Lowercased, whitespace-collapsed comparison form
fn normalize_question(text: &str) -> String {
    WHITESPACE
        .replace_all(text.trim(), " ")
        .to_lowercase()
}

fn document_from_point(point: ScoredPoint) -> RetrievedDocument {
    let content = point
        .payload
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    RetrievedDocument {
        content,
        score: point.score,
        metadata: point.payload,
    }
}

/// Question text for a hit: explicit `question` payload field when
/// present, otherwise the first line of the content.
fn question_text(doc: &RetrievedDocument) -> String {
    if let Some(q) = doc.metadata.get("question").and_then(|q| q.as_str()) {
        return q.trim().to_string();
    }
    doc.content.lines().next().unwrap_or_default().trim().to_string()
}

/// Offset-sampled, de-duplicated suggestion selection
fn select_related(hits: &[RetrievedDocument], config: &RelatedQuestionsConfig) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for doc in hits.iter().skip(config.skip).take(config.take) {
        let question = question_text(doc);
        if question.is_empty() {
            continue;
        }
        if seen.insert(normalize_question(&question)) {
            selected.push(question);
            if selected.len() >= config.max {
                break;
            }
        }
    }

    selected
}

/// Query embedding + similarity search + context assembly
pub struct RetrievalAssembler {
    embedder: Arc<EmbeddingClient>,
    index: Arc<VectorIndexClient>,
    related: RelatedQuestionsConfig,
}

impl RetrievalAssembler {
    pub fn new(
        embedder: Arc<EmbeddingClient>,
        index: Arc<VectorIndexClient>,
        related: RelatedQuestionsConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            related,
        }
    }

    /// Top-k documents for a query
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>, ChatError> {
        let vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| ChatError::RetrievalUnavailable(e.to_string()))?;

        let hits = self
            .index
            .search(&vector, top_k)
            .await
            .map_err(|e| ChatError::RetrievalUnavailable(e.to_string()))?;

        debug!("Retrieved {} documents for query", hits.len());
        Ok(hits.into_iter().map(document_from_point).collect())
    }

    /// Context block: non-empty contents joined with a blank line.
    ///
    /// No truncation is applied here; context-length limits belong to
    /// the generation provider.
    pub fn build_context(documents: &[RetrievedDocument]) -> String {
        documents
            .iter()
            .map(|d| d.content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Follow-up suggestions sourced past the top hits
    pub async fn related_questions(&self, query: &str) -> Result<Vec<String>, ChatError> {
        let vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| ChatError::RetrievalUnavailable(e.to_string()))?;

        let limit = self.related.skip + self.related.take;
        let hits = self
            .index
            .search(&vector, limit)
            .await
            .map_err(|e| ChatError::RetrievalUnavailable(e.to_string()))?;

        let documents: Vec<RetrievedDocument> =
            hits.into_iter().map(document_from_point).collect();
        Ok(select_related(&documents, &self.related))
    }

    /// Embed and upsert documents into the index
    pub async fn index_documents(&self, documents: Vec<DocumentInput>) -> Result<usize, ChatError> {
        if documents.is_empty() {
            return Ok(0);
        }

        let mut vectors = Vec::with_capacity(documents.len());
        for doc in &documents {
            let vector = self
                .embedder
                .embed_uncached(&doc.content)
                .await
                .map_err(|e| ChatError::RetrievalUnavailable(e.to_string()))?;
            vectors.push(vector);
        }

        self.index
            .upsert(&documents, &vectors)
            .await
            .map_err(|e| ChatError::RetrievalUnavailable(e.to_string()))?;

        debug!("Indexed {} documents", documents.len());
        Ok(documents.len())
    }

    /// Total documents in the index
    pub async fn document_count(&self) -> Result<usize, ChatError> {
        self.index
            .count()
            .await
            .map_err(|e| {
                warn!("Document count failed: {}", e);
                ChatError::RetrievalUnavailable(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str, score: f32) -> RetrievedDocument {
        RetrievedDocument {
            content: content.to_string(),
            score,
            metadata: json!({ "content": content }),
        }
    }

    fn ranked_docs(count: usize) -> Vec<RetrievedDocument> {
        (0..count)
            .map(|i| doc(&format!("How do I do task {}?", i), 1.0 - i as f32 * 0.01))
            .collect()
    }

    #[test]
    fn test_build_context_joins_and_filters() {
        let docs = vec![doc("First document.", 0.9), doc("   ", 0.8), doc("Second.", 0.7)];
        let context = RetrievalAssembler::build_context(&docs);
        assert_eq!(context, "First document.\n\nSecond.");
    }

    #[test]
    fn test_build_context_empty_when_no_usable_docs() {
        let docs = vec![doc("", 0.9), doc("  \n ", 0.8)];
        assert!(RetrievalAssembler::build_context(&docs).is_empty());
    }

    #[test]
    fn test_normalize_question() {
        assert_eq!(
            normalize_question("  How  DO\tI reset\n my password? "),
            "how do i reset my password?"
        );
    }

    #[test]
    fn test_select_related_skips_top_hits() {
        let docs = ranked_docs(20);
        let config = RelatedQuestionsConfig::default();
        let related = select_related(&docs, &config);

        assert_eq!(related.len(), 4);
        // Nothing from the skipped top-8 slice appears
        for question in &related {
            for top in docs.iter().take(config.skip) {
                assert_ne!(normalize_question(question), normalize_question(&top.content));
            }
        }
        assert_eq!(related[0], "How do I do task 8?");
    }

    #[test]
    fn test_select_related_dedups_preserving_order() {
        let mut docs = ranked_docs(8);
        docs.push(doc("What is a webhook?", 0.5));
        docs.push(doc("what   is a WEBHOOK?", 0.49));
        docs.push(doc("How do refunds work?", 0.48));

        let related = select_related(&docs, &RelatedQuestionsConfig::default());
        assert_eq!(related, vec!["What is a webhook?", "How do refunds work?"]);
    }

    #[test]
    fn test_select_related_prefers_question_field() {
        let mut docs = ranked_docs(8);
        docs.push(RetrievedDocument {
            content: "Long answer text\nwith details".to_string(),
            score: 0.5,
            metadata: json!({ "question": "Can I export my data?" }),
        });

        let related = select_related(&docs, &RelatedQuestionsConfig::default());
        assert_eq!(related, vec!["Can I export my data?"]);
    }

    #[test]
    fn test_select_related_short_result_set() {
        // Fewer hits than the skip window leaves nothing to suggest
        let docs = ranked_docs(5);
        let related = select_related(&docs, &RelatedQuestionsConfig::default());
        assert!(related.is_empty());
    }

    #[test]
    fn test_select_related_window_is_tunable() {
        let docs = ranked_docs(10);
        let config = RelatedQuestionsConfig {
            skip: 2,
            take: 3,
            max: 2,
        };
        let related = select_related(&docs, &config);
        assert_eq!(related, vec!["How do I do task 2?", "How do I do task 3?"]);
    }

    #[test]
    fn test_document_from_point_extracts_content() {
        let point = ScoredPoint {
            score: 0.8,
            payload: json!({ "content": "body", "source": "faq" }),
        };
        let doc = document_from_point(point);
        assert_eq!(doc.content, "body");
        assert_eq!(doc.metadata["source"], "faq");
    }
}
