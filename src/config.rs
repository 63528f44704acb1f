//! Process settings read from environment variables.
//!
//! Centralizes every `std::env::var` lookup the binary needs into one struct.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::profiles::RetrievalOverrides;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Ollama,
    /// Deterministic offline vectors.
    Hash,
}

impl FromStr for EmbeddingProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "hash" => Ok(Self::Hash),
            other => Err(format!("unknown embedding provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub index_name: String,
    pub profiles_dir: PathBuf,
    pub profile: Option<String>,

    pub ollama_url: String,
    pub embedding_model: String,
    pub rerank_model: String,
    pub chat_model: String,
    pub embedding_provider: EmbeddingProvider,
    pub embedding_cache: bool,
    pub embedding_batch_size: usize,

    pub token_budget: usize,
    pub max_chunks: usize,
    pub min_score: Option<f32>,
    pub rerank_timeout: Duration,
    pub rerank_retries: usize,

    pub chunk_size: usize,
    pub chunk_overlap: usize,

    pub overrides: RetrievalOverrides,
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup; unparseable values fall
    /// back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str| lookup(key).and_then(|v| parse_flag(&v));

        let embedding_provider = match lookup("EMBEDDING_PROVIDER").map(|v| v.parse::<EmbeddingProvider>()) {
            Some(Ok(provider)) => provider,
            Some(Err(e)) => {
                tracing::warn!("{}, using ollama", e);
                EmbeddingProvider::Ollama
            }
            None => EmbeddingProvider::Ollama,
        };

        Self {
            data_dir: PathBuf::from(string("DATA_DIR", "./data")),
            index_name: string("INDEX_NAME", "default"),
            profiles_dir: PathBuf::from(string("PROFILES_DIR", "./profiles")),
            profile: lookup("RAG_PROFILE").filter(|p| !p.trim().is_empty()),

            ollama_url: string("OLLAMA_URL", "http://localhost:11434"),
            embedding_model: string("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
            rerank_model: string("OLLAMA_RERANK_MODEL", "llama3.1"),
            chat_model: string("OLLAMA_CHAT_MODEL", "llama3.1"),
            embedding_provider,
            embedding_cache: flag("EMBEDDING_CACHE").unwrap_or(true),
            embedding_batch_size: parsed(&lookup, "EMBEDDING_BATCH_SIZE").unwrap_or(32),

            token_budget: parsed(&lookup, "RAG_TOKEN_BUDGET").unwrap_or(3000),
            max_chunks: parsed(&lookup, "RAG_MAX_CHUNKS").unwrap_or(12),
            min_score: parsed(&lookup, "RAG_MIN_SCORE"),
            rerank_timeout: Duration::from_secs(parsed(&lookup, "RAG_RERANK_TIMEOUT_SECS").unwrap_or(60)),
            rerank_retries: parsed(&lookup, "RAG_RERANK_RETRIES").unwrap_or(1),

            chunk_size: parsed(&lookup, "CHUNK_SIZE").unwrap_or(1200),
            chunk_overlap: parsed(&lookup, "CHUNK_OVERLAP").unwrap_or(150),

            overrides: RetrievalOverrides {
                retrieve_k: parsed(&lookup, "RAG_RETRIEVE_K"),
                context_k: parsed(&lookup, "RAG_CONTEXT_K"),
                ai_only: flag("RAG_AI_ONLY"),
                include_moc: flag("RAG_INCLUDE_MOC"),
                dedupe: flag("RAG_DEDUPE"),
                mmr: flag("RAG_MMR"),
                mmr_lambda: parsed(&lookup, "RAG_MMR_LAMBDA"),
                rerank: flag("RAG_RERANK"),
                rerank_candidates: parsed(&lookup, "RAG_RERANK_CANDIDATES"),
            },
        }
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("indexes").join(&self.index_name)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache").join("embeddings.sqlite3")
    }

    /// Build a summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "DATA_DIR={}  INDEX={}  OLLAMA={}  EMBED={}",
            self.data_dir.display(),
            self.index_name,
            self.ollama_url,
            self.embedding_model
        )
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
