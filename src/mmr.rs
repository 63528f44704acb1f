use crate::embeddings::Embedder;
use crate::models::{Candidate, top_by_score};
use crate::store::cosine_similarity;

/// Passage text is capped before embedding to keep diversity selection quick.
pub const MMR_TEXT_CAP: usize = 2000;

/// Greedy Maximal Marginal Relevance over precomputed similarities.
///
/// `value(i) = lambda * sim(query, i) - (1 - lambda) * max_j sim(i, j)` over the
/// already-selected `j`. The first pick is always the candidate closest to the
/// query, so `lambda = 0` still starts from the most relevant passage. Ties go
/// to the earliest index. Returns `min(k, n)` distinct indices in pick order.
pub fn mmr_order(query_sims: &[f32], doc_vectors: &[Vec<f32>], k: usize, lambda: f32) -> Vec<usize> {
    let n = query_sims.len().min(doc_vectors.len());
    let target = k.min(n);
    let mut selected: Vec<usize> = Vec::with_capacity(target);
    let mut remaining: Vec<usize> = (0..n).collect();

    while selected.len() < target && !remaining.is_empty() {
        let mut best: Option<(usize, f32)> = None;

        for (pos, &i) in remaining.iter().enumerate() {
            let value = if selected.is_empty() {
                query_sims[i]
            } else {
                let penalty = selected
                    .iter()
                    .map(|&j| cosine_similarity(&doc_vectors[i], &doc_vectors[j]))
                    .fold(f32::NEG_INFINITY, f32::max);
                lambda * query_sims[i] - (1.0 - lambda) * penalty
            };
            // NaN never beats a real value; remaining stays in index order so
            // strict > keeps the earliest index on ties
            let better = match best {
                None => true,
                Some((_, best_value)) => value > best_value || (best_value.is_nan() && !value.is_nan()),
            };
            if better {
                best = Some((pos, value));
            }
        }

        let Some((pos, value)) = best else { break };
        let picked = remaining.remove(pos);
        tracing::debug!(index = picked, mmr_score = %value, "MMR selected candidate");
        selected.push(picked);
    }

    selected
}

/// Selects up to `k` candidates balancing query relevance against redundancy.
///
/// Without an embedder, or when embedding fails, falls back to the top `k` by
/// retrieval score.
pub async fn mmr_select(
    query: &str,
    candidates: &[Candidate],
    k: usize,
    lambda: f32,
    embedder: Option<&dyn Embedder>,
) -> Vec<Candidate> {
    if candidates.is_empty() || k == 0 {
        return vec![];
    }

    let Some(embedder) = embedder else {
        tracing::debug!("MMR without embedder, using top {} by score", k);
        return top_by_score(candidates, k);
    };

    let texts: Vec<String> = candidates
        .iter()
        .map(|c| c.text().chars().take(MMR_TEXT_CAP).collect())
        .collect();

    let embedded = futures::try_join!(embedder.embed_query(query), embedder.embed_texts(&texts));
    let (query_vector, doc_vectors) = match embedded {
        Ok((q, docs)) if docs.len() == candidates.len() => (q, docs),
        Ok((_, docs)) => {
            tracing::warn!(
                "MMR embedder returned {} vectors for {} candidates, using top {} by score",
                docs.len(),
                candidates.len(),
                k
            );
            return top_by_score(candidates, k);
        }
        Err(e) => {
            tracing::warn!("MMR embedding failed, using top {} by score: {:#}", k, e);
            return top_by_score(candidates, k);
        }
    };

    let query_sims: Vec<f32> = doc_vectors
        .iter()
        .map(|v| cosine_similarity(&query_vector, v))
        .collect();

    mmr_order(&query_sims, &doc_vectors, k, lambda)
        .into_iter()
        .map(|i| candidates[i].clone())
        .collect()
}
