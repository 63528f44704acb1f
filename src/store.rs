use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};
use crate::models::{Candidate, Chunk, Filters, cmp_score_desc};

pub const DATA_FILE: &str = "chunks.jsonl";
pub const MANIFEST_FILE: &str = "manifest.json";

const SNIPPET_CHARS: usize = 200;

/// Stores (chunk, vector) pairs and answers cosine nearest-neighbour queries.
pub trait VectorStore: Send + Sync {
    /// Appends parallel chunk and vector sequences. Vectors with NaN or
    /// infinite components are rejected.
    fn upsert(&mut self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<()>;

    /// Returns the `top_k` most similar chunks that satisfy every filter.
    fn search(&self, query_vector: &[f32], top_k: usize, filters: &Filters) -> Vec<Candidate>;

    fn count(&self) -> usize;
}

/// Linear-scan store held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Chunk, &Vec<f32>)> {
        self.chunks.iter().zip(self.vectors.iter())
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.vectors.clear();
    }
}

impl VectorStore for InMemoryStore {
    fn upsert(&mut self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<()> {
        if chunks.len() != vectors.len() {
            return Err(RagError::LengthMismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        if let Some(index) = vectors
            .iter()
            .position(|v| v.iter().any(|x| !x.is_finite()))
        {
            return Err(RagError::InvalidVector { index });
        }
        self.chunks.extend(chunks);
        self.vectors.extend(vectors);
        Ok(())
    }

    fn search(&self, query_vector: &[f32], top_k: usize, filters: &Filters) -> Vec<Candidate> {
        let mut scored: Vec<Candidate> = self
            .entries()
            .filter(|(chunk, _)| matches_filters(chunk, filters))
            .map(|(chunk, vector)| {
                Candidate::new(chunk.clone(), cosine_similarity(query_vector, vector))
            })
            .collect();

        // sort_by is stable: equal scores keep insertion order
        scored.sort_by(|a, b| cmp_score_desc(a.retrieval_score(), b.retrieval_score()));
        scored.truncate(top_k);

        tracing::debug!(
            "Similarity search scanned {} chunks, returning {}",
            self.chunks.len(),
            scored.len()
        );
        scored
    }

    fn count(&self) -> usize {
        self.chunks.len()
    }
}

/// Every filter key must be present in the chunk metadata with an equal value.
fn matches_filters(chunk: &Chunk, filters: &Filters) -> bool {
    filters
        .iter()
        .all(|(key, expected)| chunk.metadata.get(key) == Some(expected))
}

#[derive(Serialize, Deserialize)]
struct StoreRecord {
    chunk: Chunk,
    vector: Vec<f32>,
}

#[derive(Serialize)]
struct StoreRecordRef<'a> {
    chunk: &'a Chunk,
    vector: &'a [f32],
}

/// Disk-persisted store: `chunks.jsonl` under the index directory, loaded into
/// memory for search.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    dir: PathBuf,
    inner: InMemoryStore,
}

impl JsonlStore {
    /// Creates an empty store rooted at `dir` without reading anything.
    pub fn empty(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inner: InMemoryStore::new(),
        }
    }

    /// Opens the store at `dir`, loading `chunks.jsonl` if it exists.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::empty(dir);
        store.load()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn data_file(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Chunk, &Vec<f32>)> {
        self.inner.entries()
    }

    /// Drops everything held in memory; the file on disk is untouched until `save`.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Replaces the in-memory contents with the records on disk.
    ///
    /// Blank lines are ignored. Any unparseable or non-UTF-8 line aborts the
    /// load with the 1-based line number and a snippet of the offending content.
    pub fn load(&mut self) -> Result<()> {
        self.inner.clear();

        let path = self.data_file();
        if !path.exists() {
            tracing::info!("No index data at {:?}, starting empty", path);
            return Ok(());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut chunks = Vec::new();
        let mut vectors = Vec::new();

        for (idx, bytes) in reader.split(b'\n').enumerate() {
            let bytes = bytes?;
            let malformed = |message: String| RagError::MalformedRecord {
                path: path.clone(),
                line: idx + 1,
                snippet: String::from_utf8_lossy(&bytes).chars().take(SNIPPET_CHARS).collect(),
                message,
            };
            let line = std::str::from_utf8(&bytes).map_err(|e| malformed(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: StoreRecord =
                serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
            chunks.push(record.chunk);
            vectors.push(record.vector);
        }

        self.inner.upsert(chunks, vectors)?;
        tracing::info!("Loaded {} chunks from {:?}", self.inner.count(), path);
        Ok(())
    }

    /// Persist the full contents atomically.
    /// Uses temp file + rename so a crash never truncates the live file.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let final_path = self.data_file();
        let temp_path = final_path.with_extension("jsonl.tmp");

        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            for (chunk, vector) in self.inner.entries() {
                serde_json::to_writer(&mut writer, &StoreRecordRef { chunk, vector })?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        std::fs::rename(&temp_path, &final_path)?;

        tracing::debug!("Saved {} chunks to {:?}", self.inner.count(), final_path);
        Ok(())
    }
}

impl VectorStore for JsonlStore {
    fn upsert(&mut self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<()> {
        self.inner.upsert(chunks, vectors)
    }

    fn search(&self, query_vector: &[f32], top_k: usize, filters: &Filters) -> Vec<Candidate> {
        self.inner.search(query_vector, top_k, filters)
    }

    fn count(&self) -> usize {
        self.inner.count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingInfo {
    pub strategy: String,
    pub chunk_size: usize,
    pub overlap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingInfo {
    pub model: String,
    pub cached: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestCounters {
    pub files_seen: usize,
    pub docs_indexed: usize,
    pub files_skipped: usize,
    pub chunk_count: usize,
}

/// Companion record written next to `chunks.jsonl` describing how the index was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub index_name: String,
    pub created_at: DateTime<Utc>,
    pub corpus: String,
    pub chunking: ChunkingInfo,
    pub embedding: EmbeddingInfo,
    pub ingest: IngestCounters,
}

impl IndexManifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let final_path = Self::path(dir);
        let temp_path = final_path.with_extension("json.tmp");
        std::fs::write(&temp_path, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

/// Cosine similarity: dot product over the product of L2 norms.
/// A zero-norm vector is treated as having norm 1, so its similarity is the dot product (0).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    dot_product(a, b) / (norm(a) * norm(b))
}

fn norm(v: &[f32]) -> f32 {
    let n = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if n == 0.0 { 1.0 } else { n }
}

/// Truncates to the shorter vector when lengths differ.
#[inline(always)]
fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
