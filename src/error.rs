use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the retrieval core.
///
/// Degraded stages (reranking, diversity selection) never produce these; they
/// recover locally and log a warning instead.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("chunks and vectors must have the same length (chunks={chunks}, vectors={vectors})")]
    LengthMismatch { chunks: usize, vectors: usize },

    #[error("vector {index} has a non-finite component; it could not be persisted")]
    InvalidVector { index: usize },

    #[error("invalid record in {} line {line}: {message}\nSnippet: {snippet}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        snippet: String,
        message: String,
    },

    #[error("No retrieved candidates after filtering/selection")]
    NoCandidates,

    #[error("No passages fit into the context budget of {token_budget} tokens")]
    EmptyContext { token_budget: usize },

    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),

    #[error("generation failed: {0:#}")]
    Generation(anyhow::Error),

    #[error("profile {}: {message}", path.display())]
    Profile { path: PathBuf, message: String },

    #[error("embedding cache error: {0}")]
    Cache(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;
