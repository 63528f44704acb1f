use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::ollama;

/// Turns text into dense vectors.
///
/// Implementations must return one vector per input, in input order, and be
/// deterministic for identical (model, text) pairs so results can be cached.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedder returned no vector for query"))
    }
}

/// `/api/embed` accepts either one string or a list under `input`.
#[derive(Serialize)]
#[serde(untagged)]
enum EmbedInput<'a> {
    One(&'a str),
    Many(&'a [String]),
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: EmbedInput<'a>,
}

/// Newer servers answer with `embeddings`, older ones with a single `embedding`.
#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

impl EmbedResponse {
    fn into_vectors(self) -> Vec<Vec<f32>> {
        match (self.embeddings, self.embedding) {
            (Some(many), _) => many,
            (None, Some(one)) => vec![one],
            (None, None) => vec![],
        }
    }
}

const QUERY_CACHE_SIZE: usize = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1200);

/// Embedding client for the Ollama `/api/embed` endpoint with an LRU cache
/// for query embeddings.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
    query_cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl OllamaEmbedder {
    /// Builds the client and checks that Ollama is reachable and the model is pulled.
    pub async fn connect(ollama_url: &str, model: &str) -> Result<Self> {
        let embedder = Self::new(ollama_url, model)?;
        ollama::ensure_model_pulled(&embedder.client, &embedder.ollama_url, model, "Embedding").await?;
        Ok(embedder)
    }

    pub fn new(ollama_url: &str, model: &str) -> Result<Self> {
        tracing::info!("Embedding via Ollama at {} with model '{}'", ollama_url, model);

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let cache_size = NonZeroUsize::new(QUERY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            client,
            ollama_url: ollama_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            query_cache: RwLock::new(LruCache::new(cache_size)),
        })
    }

    async fn request(&self, input: EmbedInput<'_>) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.ollama_url);
        let body = EmbedRequest {
            model: &self.model,
            input,
        };

        let send = self.client.post(&url).json(&body).send();
        let response = tokio::time::timeout(REQUEST_TIMEOUT, send)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Embedding request to {} timed out after {:?}", url, REQUEST_TIMEOUT)
            })?
            .with_context(|| format!("Failed to reach {url}"))?;

        let response = ollama::error_for_status(response, "Embedding endpoint").await?;
        let parsed: EmbedResponse = response
            .json()
            .await
            .context("Malformed embedding response")?;
        Ok(parsed.into_vectors())
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.request(EmbedInput::One(text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Ollama returned no vector for a single input"))
    }

    /// One batched call; if the server hands back the wrong number of
    /// vectors, every text is embedded on its own instead.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.request(EmbedInput::Many(texts)).await?;
        if vectors.len() == texts.len() {
            return Ok(vectors);
        }

        tracing::warn!(
            "Model '{}' answered a batch of {} with {} vectors, embedding one at a time",
            self.model,
            texts.len(),
            vectors.len()
        );
        let mut sequential = Vec::with_capacity(texts.len());
        for text in texts {
            sequential.push(self.embed_one(text).await?);
        }
        Ok(sequential)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match texts {
            [] => Ok(vec![]),
            [single] => Ok(vec![self.embed_one(single).await?]),
            _ => self.embed_many(texts).await,
        }
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.query_cache.write().await.get(text).cloned() {
            return Ok(hit);
        }

        let vector = self.embed_one(text).await?;
        self.query_cache.write().await.put(text.to_string(), vector.clone());
        Ok(vector)
    }
}

pub const HASH_EMBEDDER_MODEL: &str = "hash-embedder-v1";

/// Deterministic SHA-256-derived vectors. Not semantically meaningful, but
/// stable across runs, which is all index wiring and tests need.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            model: HASH_EMBEDDER_MODEL.to_string(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        // map each byte to [-1, 1], cycling through the digest
        (0..self.dim)
            .map(|i| digest[i % digest.len()] as f32 / 127.5 - 1.0)
            .collect()
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}
