//! End-to-end query flow over an index built on disk.
//!
//! Uses a bag-of-words embedder and scripted models so results are
//! deterministic without Ollama.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use notes_rag::chunker::FixedChunker;
use notes_rag::context::ContextAssembler;
use notes_rag::embeddings::Embedder;
use notes_rag::generator::{Generator, build_answer};
use notes_rag::indexer::IndexBuilder;
use notes_rag::pipeline::Stage;
use notes_rag::reranker::{CompletionModel, LlmReranker};
use notes_rag::retriever::Retriever;
use notes_rag::store::{JsonlStore, VectorStore};
use notes_rag::{Answer, Candidate, ContextPack, Pipeline, RagError, RetrievalConfig};

const VOCAB: [&str; 8] = [
    "ownership", "borrow", "lifetime", "garden", "tomato", "tax", "receipt", "rust",
];

/// One dimension per vocabulary word, counting occurrences.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    async fn embed_texts(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lowered = t.to_lowercase();
                VOCAB
                    .iter()
                    .map(|w| lowered.matches(w).count() as f32)
                    .collect()
            })
            .collect())
    }
}

struct ScriptedRanking(String);

#[async_trait]
impl CompletionModel for ScriptedRanking {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// Quotes the first packed chunk, or abstains on an empty pack.
struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, query: &str, context: &ContextPack) -> anyhow::Result<Answer> {
        let text = if context.chunks.is_empty() {
            "I don't know.".to_string()
        } else {
            format!("See [1]: {}", context.chunks[0].text)
        };
        Ok(build_answer(query, &text, context, self.model_name()))
    }
}

fn write_corpus(dir: &Path) {
    let notes = [
        ("ownership.md", "# Ownership\nRust ownership moves values. Ownership rules matter."),
        ("borrowing.md", "# Borrowing\nA borrow must not outlive its lifetime. Rust borrow checker."),
        ("ownership-copy.md", "# Ownership again\nOwnership ownership in Rust."),
        ("garden.md", "# Garden\nTomato plants in the garden need sun."),
        ("taxes.txt", "Keep every tax receipt for the tax office."),
        ("Rust MOC.md", "# Rust\nOwnership, borrow, lifetime: all my rust notes."),
    ];
    for (name, body) in notes {
        std::fs::write(dir.join(name), body).expect("Failed to write note");
    }
}

async fn build_pipeline() -> (tempfile::TempDir, Pipeline) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let corpus = temp_dir.path().join("vault");
    let index_dir = temp_dir.path().join("index");
    std::fs::create_dir_all(&corpus).expect("Failed to create corpus dir");
    write_corpus(&corpus);

    let manifest = IndexBuilder::new(&KeywordEmbedder, FixedChunker::default())
        .build(&corpus, &index_dir, "flow")
        .await
        .expect("Index build failed");
    assert_eq!(manifest.ingest.docs_indexed, 6);

    let store = JsonlStore::open(&index_dir).expect("Failed to open index");
    assert_eq!(store.count(), 6);

    let retriever = Retriever::new(Arc::new(KeywordEmbedder), Arc::new(store));
    (temp_dir, Pipeline::new(retriever))
}

#[tokio::test]
async fn test_default_flow_excludes_moc_and_dedupes() {
    let (_tmp, pipeline) = build_pipeline().await;
    let cfg = RetrievalConfig {
        context_k: 3,
        ..Default::default()
    };

    let output = pipeline.run("rust ownership", &cfg).await.unwrap();

    assert_eq!(output.raw.len(), 5, "MOC note is filtered out");
    assert!(output.final_candidates.len() <= 3);
    let top = &output.final_candidates[0];
    assert!(top.chunk.meta_str("file_name").unwrap().starts_with("ownership"));
    assert!(
        output
            .raw
            .iter()
            .all(|c| c.chunk.meta_str("classification").as_deref() == Some("note"))
    );
}

#[tokio::test]
async fn test_include_moc_widens_search() {
    let (_tmp, pipeline) = build_pipeline().await;
    let cfg = RetrievalConfig {
        include_moc: true,
        ..Default::default()
    };
    let output = pipeline.run("rust lifetime borrow", &cfg).await.unwrap();
    assert_eq!(output.raw.len(), 6);
}

#[tokio::test]
async fn test_full_flow_with_rerank_and_generation() {
    let (_tmp, pipeline) = build_pipeline().await;
    let pipeline = pipeline.with_reranker(LlmReranker::new(Box::new(ScriptedRanking(
        r#"{"ranked": [1, 0]}"#.to_string(),
    ))));
    let cfg = RetrievalConfig {
        rerank: true,
        rerank_candidates: 3,
        context_k: 2,
        ..Default::default()
    };

    let (output, pack, answer) = pipeline
        .answer(
            "rust ownership",
            &cfg,
            &ContextAssembler::default(),
            2000,
            &EchoGenerator,
        )
        .await
        .unwrap();

    assert_eq!(output.final_candidates.len(), 2);
    assert_eq!(output.count_after(Stage::Reranked), Some(2));
    assert!(output.final_candidates[0].rerank_score > output.final_candidates[1].rerank_score);

    // packing follows rerank order, not retrieval order
    assert_eq!(pack.chunks[0].chunk_id, output.final_candidates[0].chunk.chunk_id);
    assert_eq!(pack.citations.len(), pack.chunks.len());
    assert!(pack.tokens_used_est <= 2000);
    assert!(pack.rendered_context.contains("[1]\nSource: "));

    assert!(!answer.abstained);
    assert_eq!(answer.citations, pack.citations);
    assert!(answer.text.starts_with("See [1]:"));
}

#[tokio::test]
async fn test_garbage_rerank_output_matches_score_order() {
    let (_tmp, pipeline) = build_pipeline().await;
    let cfg = RetrievalConfig {
        rerank: false,
        context_k: 2,
        ..Default::default()
    };
    let baseline = pipeline.run("rust ownership", &cfg).await.unwrap();

    let pipeline = pipeline.with_reranker(LlmReranker::new(Box::new(ScriptedRanking(
        "I think chunk one is best".to_string(),
    ))));
    let reranked = pipeline
        .run(
            "rust ownership",
            &RetrievalConfig {
                rerank: true,
                ..cfg
            },
        )
        .await
        .unwrap();

    let ids = |cands: &[Candidate]| -> Vec<String> {
        cands.iter().map(|c| c.chunk.chunk_id.clone()).collect()
    };
    assert_eq!(ids(&reranked.final_candidates), ids(&baseline.final_candidates));
}

#[tokio::test]
async fn test_mmr_flow_returns_distinct_candidates() {
    let (_tmp, pipeline) = build_pipeline().await;
    let cfg = RetrievalConfig {
        mmr: true,
        mmr_lambda: 0.5,
        dedupe: false,
        context_k: 4,
        ..Default::default()
    };
    let output = pipeline.run("rust ownership borrow", &cfg).await.unwrap();

    let mut ids: Vec<_> = output
        .final_candidates
        .iter()
        .map(|c| c.chunk.chunk_id.clone())
        .collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total);
    assert_eq!(output.count_after(Stage::Diversified), Some(5));
}

#[tokio::test]
async fn test_ai_only_without_flagged_notes_is_an_error() {
    let (_tmp, pipeline) = build_pipeline().await;
    let cfg = RetrievalConfig {
        ai_only: true,
        ..Default::default()
    };
    let err = pipeline.run("rust", &cfg).await.unwrap_err();
    assert!(matches!(err, RagError::NoCandidates));
}
