use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use notes_rag::chunker::FixedChunker;
use notes_rag::config::{EmbeddingProvider, Settings};
use notes_rag::context::ContextAssembler;
use notes_rag::embedding_cache::CachedEmbedder;
use notes_rag::embeddings::{Embedder, HashEmbedder, OllamaEmbedder};
use notes_rag::eval::{DEFAULT_KS, evaluate, load_queries};
use notes_rag::generator::{Generator, OllamaGenerator};
use notes_rag::indexer::IndexBuilder;
use notes_rag::profiles::resolve_config;
use notes_rag::reranker::{LlmReranker, OllamaCompletion};
use notes_rag::retriever::Retriever;
use notes_rag::store::{IndexManifest, JsonlStore, VectorStore};
use notes_rag::{Candidate, Pipeline, RagError, RetrievalConfig};

const USAGE: &str = "usage:
  notes-rag index <corpus_dir>
  notes-rag ask <query...> [--dry-run]
  notes-rag eval <queries.jsonl> [--out <report.json>]
  notes-rag stats";

fn get_log_dir() -> String {
    std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string())
}

fn get_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

fn get_log_max_mb() -> u64 {
    std::env::var("LOG_MAX_MB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5)
}

/// Starts the log file over once it outgrows `max_mb`.
fn truncate_oversized_log(log_file: &Path, max_mb: u64) -> Result<()> {
    if let Ok(metadata) = std::fs::metadata(log_file)
        && metadata.len() > max_mb * 1024 * 1024
    {
        std::fs::write(
            log_file,
            format!("[LOG TRUNCATED - Size exceeded {}MB]\n", max_mb),
        )?;
    }
    Ok(())
}

fn setup_logging() -> Result<()> {
    let log_dir = get_log_dir();
    let log_level = get_log_level();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let is_development = std::env::var("DEVELOPMENT").is_ok() || std::env::var("DEV").is_ok();
    let force_console = std::env::var("CONSOLE_LOGS").is_ok();

    if is_development || force_console {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
        tracing::info!("Development mode: logging to console");
    } else {
        std::fs::create_dir_all(&log_dir)?;
        let log_file = Path::new(&log_dir).join("notes-rag.log");
        truncate_oversized_log(&log_file, get_log_max_mb())?;
        let file_appender = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .json()
            .init();
    }

    tracing::info!("Logging initialized");
    tracing::info!("Log directory: {}", log_dir);
    tracing::info!("Log level: {}", log_level);

    Ok(())
}

async fn build_embedder(settings: &Settings) -> Result<Arc<dyn Embedder>> {
    let cache_path = settings.cache_path();
    let embedder: Arc<dyn Embedder> = match (settings.embedding_provider, settings.embedding_cache) {
        (EmbeddingProvider::Hash, false) => Arc::new(HashEmbedder::default()),
        (EmbeddingProvider::Hash, true) => {
            Arc::new(CachedEmbedder::open(HashEmbedder::default(), &cache_path).await?)
        }
        (EmbeddingProvider::Ollama, cached) => {
            let ollama = OllamaEmbedder::connect(&settings.ollama_url, &settings.embedding_model)
                .await
                .context("Embedding service unavailable")?;
            if cached {
                Arc::new(CachedEmbedder::open(ollama, &cache_path).await?)
            } else {
                Arc::new(ollama)
            }
        }
    };
    tracing::info!(
        "Embedder '{}' ready (cache: {})",
        embedder.model_name(),
        settings.embedding_cache
    );
    Ok(embedder)
}

async fn run_index(settings: &Settings, corpus_dir: &Path) -> Result<()> {
    let embedder = build_embedder(settings).await?;
    let chunker = FixedChunker::new(settings.chunk_size, settings.chunk_overlap);

    let manifest = IndexBuilder::new(embedder.as_ref(), chunker)
        .batch_size(settings.embedding_batch_size)
        .cached(settings.embedding_cache)
        .build(corpus_dir, &settings.index_dir(), &settings.index_name)
        .await?;

    println!("Indexed {} into '{}'", corpus_dir.display(), manifest.index_name);
    println!("  docs:    {}", manifest.ingest.docs_indexed);
    println!("  chunks:  {}", manifest.ingest.chunk_count);
    println!("  skipped: {}", manifest.ingest.files_skipped);
    println!("  store:   {}", settings.index_dir().display());
    Ok(())
}

fn print_candidates(title: &str, candidates: &[Candidate]) {
    println!("{title}");
    for (i, c) in candidates.iter().enumerate() {
        let source = c.chunk.meta_str("file_name").unwrap_or_else(|| c.chunk.doc_id.clone());
        let rerank = c
            .rerank_score
            .map(|s| format!(" rerank={s:.3}"))
            .unwrap_or_default();
        println!(
            "  [{}] score={:.4}{} {} ({})",
            i + 1,
            c.score,
            rerank,
            source,
            c.chunk.section_heading.as_deref().unwrap_or("-")
        );
    }
}

/// Opens the index and wires the pipeline with the resolved retrieval config.
async fn open_pipeline(settings: &Settings) -> Result<(Pipeline, RetrievalConfig)> {
    let index_dir = settings.index_dir();
    let store = JsonlStore::open(&index_dir)?;
    if store.count() == 0 {
        return Err(anyhow::anyhow!(
            "Index at {} is empty. Run: notes-rag index <corpus_dir>",
            index_dir.display()
        ));
    }

    let cfg = resolve_config(&settings.profiles_dir, settings.profile.as_deref(), &settings.overrides)?;
    tracing::info!("Retrieval config: {:?}", cfg);

    let embedder = build_embedder(settings).await?;
    let mut pipeline = Pipeline::new(Retriever::new(embedder, Arc::new(store)));

    if cfg.rerank {
        match OllamaCompletion::connect(&settings.ollama_url, &settings.rerank_model).await {
            Ok(model) => {
                let reranker = LlmReranker::new(Box::new(model))
                    .with_timeout(settings.rerank_timeout)
                    .with_max_retries(settings.rerank_retries);
                pipeline = pipeline.with_reranker(reranker);
            }
            Err(e) => {
                tracing::warn!("Reranker unavailable, ranking by score instead: {:#}", e);
            }
        }
    }
    Ok((pipeline, cfg))
}

async fn run_ask(settings: &Settings, query: &str, dry_run: bool) -> Result<()> {
    let (pipeline, cfg) = open_pipeline(settings).await?;
    let mut output = pipeline.run(query, &cfg).await?;
    print_candidates("Final candidates:", &output.final_candidates);

    if dry_run {
        return Ok(());
    }

    let assembler = ContextAssembler {
        min_score: settings.min_score,
        max_chunks: settings.max_chunks,
        ..Default::default()
    };
    let pack = pipeline.pack(query, &mut output, &assembler, settings.token_budget)?;
    let generator = OllamaGenerator::new(&settings.ollama_url, &settings.chat_model)?;
    let answer = generator
        .generate(query, &pack)
        .await
        .map_err(RagError::Generation)?;

    println!("\nAnswer:\n{}", answer.text);
    if answer.abstained {
        println!("\n(the model abstained)");
    }
    println!("\nCitations:");
    for citation in &answer.citations {
        let section = citation
            .section_heading
            .as_deref()
            .map(|s| format!(" | {s}"))
            .unwrap_or_default();
        println!("  [{}] {}{}", citation.rank, citation.uri, section);
    }
    Ok(())
}

async fn run_eval(settings: &Settings, queries_path: &Path, out: Option<&Path>) -> Result<()> {
    let queries = load_queries(queries_path)?;
    if queries.is_empty() {
        return Err(anyhow::anyhow!("No queries in {}", queries_path.display()));
    }
    let (pipeline, cfg) = open_pipeline(settings).await?;
    let report = evaluate(&pipeline, &queries, &cfg, &DEFAULT_KS).await?;

    println!("=== Retrieval Eval Summary ===");
    for line in report.summary.lines() {
        println!("{line}");
    }
    if let Some(out) = out {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(out, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        println!("\nWrote: {}", out.display());
    }
    Ok(())
}

fn run_stats(settings: &Settings) -> Result<()> {
    let index_dir = settings.index_dir();
    let store = JsonlStore::open(&index_dir)?;
    println!("Index:  {}", index_dir.display());
    println!("Chunks: {}", store.count());

    match IndexManifest::read(&index_dir)? {
        Some(manifest) => {
            println!("Built:  {}", manifest.created_at);
            println!("Corpus: {}", manifest.corpus);
            println!(
                "Chunking: {} (size={}, overlap={})",
                manifest.chunking.strategy, manifest.chunking.chunk_size, manifest.chunking.overlap
            );
            println!(
                "Embedding: {} (cached={})",
                manifest.embedding.model, manifest.embedding.cached
            );
            println!(
                "Docs: {}  Skipped: {}",
                manifest.ingest.docs_indexed, manifest.ingest.files_skipped
            );
        }
        None => println!("No manifest found"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }
    setup_logging()?;

    let settings = Settings::from_env();
    tracing::info!("{}", settings.summary());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("index") => match args.get(1) {
            Some(dir) => run_index(&settings, Path::new(dir)).await,
            None => Err(anyhow::anyhow!("missing corpus directory\n{USAGE}")),
        },
        Some("ask") => {
            let dry_run = args.iter().any(|a| a == "--dry-run");
            let query = args[1..]
                .iter()
                .filter(|a| *a != "--dry-run")
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            if query.trim().is_empty() {
                Err(anyhow::anyhow!("missing query\n{USAGE}"))
            } else {
                run_ask(&settings, query.trim(), dry_run).await
            }
        }
        Some("eval") => {
            let out = args
                .iter()
                .position(|a| a == "--out")
                .and_then(|i| args.get(i + 1))
                .map(Path::new);
            match args.get(1).filter(|a| !a.starts_with("--")) {
                Some(path) => run_eval(&settings, Path::new(path), out).await,
                None => Err(anyhow::anyhow!("missing queries file\n{USAGE}")),
            }
        }
        Some("stats") => run_stats(&settings),
        _ => Err(anyhow::anyhow!("{USAGE}")),
    };

    if let Err(e) = &result {
        tracing::error!("Command failed: {:#}", e);
    }
    result
}
