use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Open provenance map attached to documents and chunks (source path, tags, flags).
pub type Metadata = BTreeMap<String, Value>;

/// Exact-match metadata filters applied during similarity search.
pub type Filters = BTreeMap<String, Value>;

/// A raw source unit before chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub uri: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A chunk of document text, the unit of storage and retrieval.
///
/// `chunk_id` is derived from the owning document, the chunking strategy and
/// the character offsets, so re-chunking an unchanged document yields the
/// same identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub chunk_index: usize,
    #[serde(default)]
    pub start_char: Option<usize>,
    #[serde(default)]
    pub end_char: Option<usize>,
    #[serde(default)]
    pub section_heading: Option<String>,
    /// Heading trail such as "H1 > H2 > H3".
    #[serde(default)]
    pub section_path: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    pub fn derive_id(
        doc_id: &str,
        strategy: &str,
        chunk_index: usize,
        start_char: usize,
        end_char: usize,
    ) -> String {
        format!("{doc_id}:{strategy}:{chunk_index}:{start_char}-{end_char}")
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// String view of a metadata field. Non-string scalars are rendered with
    /// their JSON representation; null and missing both yield `None`.
    pub fn meta_str(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Source URI recorded at ingestion (`uri`, falling back to `source_uri`).
    pub fn uri(&self) -> Option<String> {
        self.meta_str("uri").or_else(|| self.meta_str("source_uri"))
    }
}

/// A retrieved chunk plus its retrieval score and, after reranking, a rerank score.
///
/// Both scores are higher-is-better and live on independent scales. A
/// non-finite retrieval score is treated as missing when ordering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub chunk: Chunk,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl Candidate {
    pub fn new(chunk: Chunk, score: f32) -> Self {
        Self {
            chunk,
            score,
            rerank_score: None,
        }
    }

    pub fn with_rerank_score(mut self, rerank_score: f32) -> Self {
        self.rerank_score = Some(rerank_score);
        self
    }

    pub fn text(&self) -> &str {
        self.chunk.text()
    }

    /// Retrieval score, or `None` when it is NaN or infinite.
    pub fn retrieval_score(&self) -> Option<f32> {
        self.score.is_finite().then_some(self.score)
    }

    /// Score used for final ordering: the rerank score when present, else the
    /// retrieval score.
    pub fn effective_score(&self) -> Option<f32> {
        match self.rerank_score {
            Some(r) if r.is_finite() => Some(r),
            Some(_) => None,
            None => self.retrieval_score(),
        }
    }
}

/// Descending comparison with missing scores ordered last.
pub fn cmp_score_desc(a: Option<f32>, b: Option<f32>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort by retrieval score, highest first, missing scores last.
pub fn sort_by_score(candidates: &[Candidate]) -> Vec<Candidate> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| cmp_score_desc(a.retrieval_score(), b.retrieval_score()));
    sorted
}

/// The deterministic ordering every degraded stage falls back to.
pub fn top_by_score(candidates: &[Candidate], k: usize) -> Vec<Candidate> {
    let mut sorted = sort_by_score(candidates);
    sorted.truncate(k);
    sorted
}

/// Pointer into the evidence actually shown to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub doc_id: String,
    pub uri: String,
    pub quote: String,
    pub section_heading: Option<String>,
    pub section_path: Option<String>,
    pub start_char: Option<usize>,
    pub end_char: Option<usize>,
    /// 1-based position in the packed context.
    pub rank: usize,
    pub score: Option<f32>,
}

/// The final evidence handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPack {
    pub query: String,
    pub chunks: Vec<Chunk>,
    pub rendered_context: String,
    pub citations: Vec<Citation>,
    pub token_budget: usize,
    pub tokens_used_est: usize,
    pub metadata: Metadata,
}

/// Model output, or an abstention when the evidence did not support an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub query: String,
    pub text: String,
    pub citations: Vec<Citation>,
    pub abstained: bool,
    pub model: Option<String>,
}

#[cfg(test)]
pub(crate) fn test_chunk(id: &str, source: Option<&str>, text: &str) -> Chunk {
    let mut metadata = Metadata::new();
    if let Some(source) = source {
        metadata.insert("source_path".to_string(), Value::from(source));
        metadata.insert("uri".to_string(), Value::from(format!("file://{source}")));
    }
    Chunk {
        chunk_id: id.to_string(),
        doc_id: source.unwrap_or("doc").to_string(),
        text: text.to_string(),
        chunk_index: 0,
        start_char: Some(0),
        end_char: Some(text.chars().count()),
        section_heading: None,
        section_path: None,
        language: None,
        metadata,
    }
}
