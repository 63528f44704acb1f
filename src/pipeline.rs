//! Query-time orchestration: retrieve, sort, dedupe, diversify, rerank,
//! truncate, pack.
//!
//! Each optional stage is controlled by [`RetrievalConfig`]; a disabled stage
//! passes its input through unchanged. Every stage builds a new candidate
//! list rather than mutating the previous one.

use std::fmt;
use std::sync::Arc;

use crate::context::ContextAssembler;
use crate::dedupe::{SOURCE_KEY, dedupe_by_key};
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::generator::Generator;
use crate::mmr::mmr_select;
use crate::models::{Answer, Candidate, ContextPack, sort_by_score, top_by_score};
use crate::profiles::RetrievalConfig;
use crate::reranker::LlmReranker;
use crate::retriever::Retriever;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Retrieved,
    Sorted,
    Deduped,
    Diversified,
    Reranked,
    Truncated,
    Packed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Retrieved => "retrieved",
            Stage::Sorted => "sorted",
            Stage::Deduped => "deduped",
            Stage::Diversified => "diversified",
            Stage::Reranked => "reranked",
            Stage::Truncated => "truncated",
            Stage::Packed => "packed",
        };
        f.write_str(name)
    }
}

/// Candidate count after a stage ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCount {
    pub stage: Stage,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Retriever output before any post-processing.
    pub raw: Vec<Candidate>,
    /// At most `context_k` candidates for context packing.
    pub final_candidates: Vec<Candidate>,
    pub stages: Vec<StageCount>,
}

impl PipelineOutput {
    pub fn count_after(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| s.count)
    }
}

pub struct Pipeline {
    retriever: Retriever,
    diversity_embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<LlmReranker>,
}

impl Pipeline {
    /// Diversity selection shares the retriever's embedder unless replaced.
    pub fn new(retriever: Retriever) -> Self {
        let diversity_embedder = Some(Arc::clone(retriever.embedder()));
        Self {
            retriever,
            diversity_embedder,
            reranker: None,
        }
    }

    pub fn with_diversity_embedder(mut self, embedder: Option<Arc<dyn Embedder>>) -> Self {
        self.diversity_embedder = embedder;
        self
    }

    pub fn with_reranker(mut self, reranker: LlmReranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    fn record(stages: &mut Vec<StageCount>, stage: Stage, candidates: &[Candidate]) {
        tracing::debug!("Pipeline stage {}: {} candidates", stage, candidates.len());
        stages.push(StageCount {
            stage,
            count: candidates.len(),
        });
    }

    /// Runs every stage up to truncation.
    ///
    /// # Errors
    ///
    /// [`RagError::NoCandidates`] when nothing survives retrieval and filtering,
    /// or when `context_k` leaves an empty final list. Embedding failures of
    /// the query propagate; diversity and rerank failures degrade locally.
    pub async fn run(&self, query: &str, cfg: &RetrievalConfig) -> Result<PipelineOutput> {
        let mut stages = Vec::new();
        let filters = cfg.filters();

        let raw = self.retriever.retrieve(query, cfg.retrieve_k, &filters).await?;
        Self::record(&mut stages, Stage::Retrieved, &raw);
        if raw.is_empty() {
            return Err(RagError::NoCandidates);
        }

        let mut nodes = sort_by_score(&raw);
        Self::record(&mut stages, Stage::Sorted, &nodes);

        if cfg.dedupe {
            nodes = dedupe_by_key(&nodes, SOURCE_KEY);
            Self::record(&mut stages, Stage::Deduped, &nodes);
        }

        if cfg.mmr {
            let k = nodes.len().min(cfg.retrieve_k);
            nodes = mmr_select(
                query,
                &nodes,
                k,
                cfg.mmr_lambda,
                self.diversity_embedder.as_deref(),
            )
            .await;
            Self::record(&mut stages, Stage::Diversified, &nodes);
        }

        if cfg.rerank {
            let pool_size = nodes.len().min(cfg.rerank_candidates);
            let pool = &nodes[..pool_size];
            nodes = match &self.reranker {
                Some(reranker) => reranker.rerank(query, pool, cfg.context_k).await,
                None => {
                    tracing::warn!("Rerank requested but no rerank model configured, using score order");
                    top_by_score(pool, cfg.context_k)
                }
            };
            Self::record(&mut stages, Stage::Reranked, &nodes);
        }

        nodes.truncate(cfg.context_k);
        Self::record(&mut stages, Stage::Truncated, &nodes);
        if nodes.is_empty() {
            return Err(RagError::NoCandidates);
        }

        tracing::info!(
            "Pipeline selected {} of {} retrieved candidates",
            nodes.len(),
            raw.len()
        );

        Ok(PipelineOutput {
            raw,
            final_candidates: nodes,
            stages,
        })
    }

    /// Packs the final candidates, refusing to hand back an empty context.
    pub fn pack(
        &self,
        query: &str,
        output: &mut PipelineOutput,
        assembler: &ContextAssembler,
        token_budget: usize,
    ) -> Result<ContextPack> {
        let pack = assembler.build(query, &output.final_candidates, token_budget);
        output.stages.push(StageCount {
            stage: Stage::Packed,
            count: pack.chunks.len(),
        });
        if pack.chunks.is_empty() {
            return Err(RagError::EmptyContext { token_budget });
        }
        Ok(pack)
    }

    /// Full query path through to the generator.
    pub async fn answer(
        &self,
        query: &str,
        cfg: &RetrievalConfig,
        assembler: &ContextAssembler,
        token_budget: usize,
        generator: &dyn Generator,
    ) -> Result<(PipelineOutput, ContextPack, Answer)> {
        let mut output = self.run(query, cfg).await?;
        let pack = self.pack(query, &mut output, assembler, token_budget)?;
        let answer = generator
            .generate(query, &pack)
            .await
            .map_err(RagError::Generation)?;
        Ok((output, pack, answer))
    }
}
