use std::collections::HashSet;

use crate::models::{Candidate, sort_by_score};

/// Metadata field used as the provenance key by default.
pub const SOURCE_KEY: &str = "source_path";

/// Keeps the best-scoring candidate per provenance key.
///
/// Input is re-sorted by score (missing last) before the scan, so the first
/// candidate seen for a key is the highest-scoring one. Candidates without the
/// key get a synthetic key built from their chunk id and are never merged.
pub fn dedupe_by_key(candidates: &[Candidate], key: &str) -> Vec<Candidate> {
    let sorted = sort_by_score(candidates);
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(sorted.len());

    for candidate in sorted {
        let provenance = candidate
            .chunk
            .meta_str(key)
            .unwrap_or_else(|| format!("__missing__::{}", candidate.chunk.chunk_id));
        if seen.insert(provenance) {
            kept.push(candidate);
        }
    }

    tracing::debug!(
        "Dedupe by '{}': {} -> {} candidates",
        key,
        candidates.len(),
        kept.len()
    );
    kept
}
