use std::collections::HashSet;

use serde_json::Value;

use crate::models::{Candidate, Chunk, Citation, ContextPack, Metadata, cmp_score_desc};

pub const QUOTE_CHARS: usize = 240;
const SIGNATURE_CHARS: usize = 500;
const BUDGET_HEADER: &str = "Context:\n";

/// Rough heuristic of four characters per token, never less than one.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Lowercased, whitespace-collapsed prefix used for content dedupe.
fn text_signature(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    normalized.chars().take(SIGNATURE_CHARS).collect()
}

/// Packs ranked candidates into a token budget and renders the prompt context.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    pub min_score: Option<f32>,
    pub max_chunks: usize,
    pub dedupe: bool,
    pub include_scores: bool,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self {
            min_score: None,
            max_chunks: 12,
            dedupe: true,
            include_scores: false,
        }
    }
}

impl ContextAssembler {
    /// Candidates are ordered by rerank score when present, else retrieval
    /// score. Packing stops at the first passage that would overflow the
    /// budget; passages are never partially included.
    pub fn build(&self, query: &str, candidates: &[Candidate], token_budget: usize) -> ContextPack {
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| cmp_score_desc(a.effective_score(), b.effective_score()));

        let mut chosen: Vec<Chunk> = Vec::new();
        let mut citations: Vec<Citation> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let header_cost = estimate_tokens(BUDGET_HEADER);
        let mut tokens_used = if header_cost > token_budget {
            tracing::debug!("Context budget {} cannot fit the header", token_budget);
            ordered.clear();
            0
        } else {
            header_cost
        };

        for candidate in ordered {
            if chosen.len() >= self.max_chunks {
                break;
            }

            let score = candidate.effective_score();
            if let Some(min_score) = self.min_score {
                match score {
                    Some(s) if s >= min_score => {}
                    _ => continue,
                }
            }

            let chunk = &candidate.chunk;
            if self.dedupe && !seen.insert(text_signature(chunk.text())) {
                continue;
            }

            let rank = chosen.len() + 1;
            let mut label = format!("[{rank}]");
            if self.include_scores
                && let Some(s) = score
            {
                label.push_str(&format!(" score={s:.4}"));
            }
            label.push('\n');

            let cost = estimate_tokens(&label) + estimate_tokens(chunk.text()) + estimate_tokens("\n\n");
            if tokens_used + cost > token_budget {
                tracing::debug!(
                    "Context budget reached at rank {} ({} + {} > {})",
                    rank,
                    tokens_used,
                    cost,
                    token_budget
                );
                break;
            }
            tokens_used += cost;

            citations.push(Citation {
                chunk_id: chunk.chunk_id.clone(),
                doc_id: chunk.doc_id.clone(),
                uri: chunk.uri().unwrap_or_default(),
                quote: chunk.text().chars().take(QUOTE_CHARS).collect(),
                section_heading: chunk.section_heading.clone(),
                section_path: chunk.section_path.clone(),
                start_char: chunk.start_char,
                end_char: chunk.end_char,
                rank,
                score,
            });
            chosen.push(chunk.clone());
        }

        let rendered_context = render(&chosen);
        let mut metadata = Metadata::new();
        metadata.insert("tokens_used_est".to_string(), Value::from(tokens_used));

        ContextPack {
            query: query.to_string(),
            chunks: chosen,
            rendered_context,
            citations,
            token_budget,
            tokens_used_est: tokens_used,
            metadata,
        }
    }
}

/// Renders the grounded-answer header followed by each numbered passage.
pub fn render(chunks: &[Chunk]) -> String {
    let mut lines: Vec<String> = vec![
        "You are given CONTEXT chunks from a document corpus. Answer the QUESTION using only the CONTEXT.\n"
            .to_string(),
        "If the answer is not supported by the CONTEXT, say you don't know.\n".to_string(),
        "CONTEXT:\n".to_string(),
    ];

    for (i, chunk) in chunks.iter().enumerate() {
        lines.push(format!("[{}]", i + 1));
        let title = chunk.meta_str("title");
        let uri = chunk.uri();
        if title.is_some() || uri.is_some() {
            let source = format!(
                "Source: {} {}",
                title.unwrap_or_default(),
                uri.unwrap_or_default()
            );
            lines.push(source.trim().to_string());
        }
        lines.push(chunk.text().trim().to_string());
        lines.push(String::new());
    }

    format!("{}\n", lines.join("\n").trim())
}
