//! Grounded question answering over a personal note corpus.
//!
//! Query path: [`retriever::Retriever`] → sort → [`dedupe`] → [`mmr`] →
//! [`reranker::LlmReranker`] → truncate → [`context::ContextAssembler`] →
//! [`generator::Generator`], sequenced by [`pipeline::Pipeline`].

pub mod chunker;
pub mod config;
pub mod context;
pub mod dedupe;
pub mod embedding_cache;
pub mod embeddings;
pub mod error;
pub mod eval;
pub mod generator;
pub mod indexer;
pub mod mmr;
pub mod models;
pub mod ollama;
pub mod pipeline;
pub mod profiles;
pub mod reranker;
pub mod retriever;
pub mod store;

pub use error::{RagError, Result};
pub use models::{Answer, Candidate, Chunk, Citation, ContextPack, Document};
pub use pipeline::{Pipeline, PipelineOutput};
pub use profiles::{RetrievalConfig, RetrievalOverrides};
