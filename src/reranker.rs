use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::time::{Duration, Instant, timeout};

use crate::models::{Candidate, top_by_score};
use crate::ollama;

/// Single-prompt text completion, the only capability the reranker needs.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: SamplingOptions,
}

#[derive(Serialize)]
struct SamplingOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateReply {
    response: String,
}

/// Ollama `/api/generate` client used for reranking.
pub struct OllamaCompletion {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
}

impl OllamaCompletion {
    /// Creates the client and verifies the model is available.
    ///
    /// # Errors
    ///
    /// Returns an error if Ollama is unreachable at `ollama_url` or the model
    /// has not been pulled.
    pub async fn connect(ollama_url: &str, model: &str) -> Result<Self> {
        let completion = Self::new(ollama_url, model)?;
        ollama::ensure_model_pulled(&completion.client, &completion.ollama_url, model, "Rerank").await?;
        Ok(completion)
    }

    pub fn new(ollama_url: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Some(Duration::from_secs(300)))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            ollama_url: ollama_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl CompletionModel for OllamaCompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: Some("json"),
            options: SamplingOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.ollama_url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach rerank model at {}", self.ollama_url))?;

        let reply: GenerateReply = ollama::error_for_status(response, "Rerank model")
            .await?
            .json()
            .await
            .context("Malformed /api/generate response")?;
        Ok(reply.response)
    }
}

/// Result of validating a model's ranking output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankingOutcome {
    /// Distinct in-range indices in the model's order.
    Ranked(Vec<usize>),
    Invalid(String),
}

#[derive(Deserialize)]
struct RankedPayload {
    ranked: Vec<serde_json::Value>,
}

fn json_object_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

/// Parses `{"ranked": [...]}` from raw model text.
///
/// Accepts the object embedded in surrounding prose. Integer entries and
/// digit-only strings count as indices; anything else, out-of-range indices
/// and repeats are discarded.
pub fn parse_ranking(raw: &str, n: usize) -> RankingOutcome {
    let trimmed = raw.trim();
    let payload = serde_json::from_str::<RankedPayload>(trimmed).or_else(|first_err| {
        json_object_span(trimmed)
            .ok_or(first_err)
            .and_then(|span| serde_json::from_str::<RankedPayload>(span))
    });

    let payload = match payload {
        Ok(p) => p,
        Err(e) => return RankingOutcome::Invalid(format!("unparseable ranking: {e}")),
    };

    let mut seen = HashSet::new();
    let ranked: Vec<usize> = payload
        .ranked
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::Number(num) => num.as_u64(),
            serde_json::Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse().ok()
            }
            _ => None,
        })
        .filter_map(|i| usize::try_from(i).ok())
        .filter(|&i| i < n && seen.insert(i))
        .collect();

    if ranked.is_empty() {
        RankingOutcome::Invalid("no valid indices in ranking".to_string())
    } else {
        RankingOutcome::Ranked(ranked)
    }
}

#[derive(Serialize)]
struct RerankItem<'a> {
    i: usize,
    file: Option<String>,
    section: Option<&'a str>,
    preview: String,
}

pub const DEFAULT_PREVIEW_CHARS: usize = 700;

/// Reorders a candidate pool by asking a language model for a ranking.
///
/// Every failure (timeout, transport error, malformed or empty ranking) goes
/// through the same fallback: the pool sorted by retrieval score, truncated.
pub struct LlmReranker {
    model: Box<dyn CompletionModel>,
    preview_chars: usize,
    max_retries: usize,
    timeout: Duration,
}

impl LlmReranker {
    pub fn new(model: Box<dyn CompletionModel>) -> Self {
        Self {
            model,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            max_retries: 1,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    fn build_prompt(&self, query: &str, candidates: &[Candidate]) -> Result<String> {
        let items: Vec<RerankItem> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| RerankItem {
                i,
                file: c.chunk.meta_str("file_name"),
                section: c.chunk.section_heading.as_deref(),
                preview: c.text().chars().take(self.preview_chars).collect(),
            })
            .collect();

        let items_json = serde_json::to_string(&items)?;
        Ok(format!(
            "You are reranking retrieval chunks for a RAG system.\n\
             Given a user query and a list of chunks, return JSON: \
             {{\"ranked\": [indices...]}} with the most relevant first.\n\
             Do not include any extra keys.\n\n\
             Query:\n{}\n\n\
             Chunks:\n{}\n",
            query.trim(),
            items_json
        ))
    }

    async fn request_ranking(&self, prompt: &str, n: usize) -> RankingOutcome {
        match timeout(self.timeout, self.model.complete(prompt)).await {
            Ok(Ok(raw)) => parse_ranking(&raw, n),
            Ok(Err(e)) => RankingOutcome::Invalid(format!("model error: {e:#}")),
            Err(_) => RankingOutcome::Invalid(format!("timed out after {:?}", self.timeout)),
        }
    }

    /// Returns at most `keep_k` candidates in model order, each carrying a
    /// rerank score in `(0, 1]` that decreases with rank.
    pub async fn rerank(&self, query: &str, candidates: &[Candidate], keep_k: usize) -> Vec<Candidate> {
        if candidates.is_empty() || keep_k == 0 {
            return vec![];
        }

        let prompt = match self.build_prompt(query, candidates) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Failed to build rerank prompt, using score order: {}", e);
                return top_by_score(candidates, keep_k);
            }
        };

        let n = candidates.len();
        let start = Instant::now();
        for attempt in 0..=self.max_retries {
            match self.request_ranking(&prompt, n).await {
                RankingOutcome::Ranked(order) => {
                    tracing::debug!(
                        "Reranked {} candidates with '{}' in {}ms (attempt {})",
                        n,
                        self.model.model_name(),
                        start.elapsed().as_millis(),
                        attempt + 1
                    );
                    return order
                        .into_iter()
                        .take(keep_k)
                        .enumerate()
                        .map(|(pos, i)| {
                            let score = (n - pos) as f32 / n as f32;
                            candidates[i].clone().with_rerank_score(score)
                        })
                        .collect();
                }
                RankingOutcome::Invalid(reason) => {
                    tracing::warn!(
                        "Rerank attempt {}/{} failed: {}",
                        attempt + 1,
                        self.max_retries + 1,
                        reason
                    );
                }
            }
        }

        tracing::warn!("Reranking failed, falling back to retrieval score order");
        top_by_score(candidates, keep_k)
    }
}
