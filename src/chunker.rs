use serde_json::Value;

use crate::models::{Chunk, Document};

pub const DEFAULT_STRATEGY: &str = "fixed_chars_v1";

/// Character-window chunker with overlap.
///
/// Offsets are character positions, not bytes, so ids stay stable for
/// non-ASCII notes.
#[derive(Debug, Clone)]
pub struct FixedChunker {
    pub chunk_size: usize,
    pub overlap: usize,
    pub strategy_name: String,
}

impl Default for FixedChunker {
    fn default() -> Self {
        Self::new(1200, 150)
    }
}

impl FixedChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap,
            strategy_name: DEFAULT_STRATEGY.to_string(),
        }
    }

    pub fn step(&self) -> usize {
        self.chunk_size.saturating_sub(self.overlap).max(1)
    }

    pub fn chunk(&self, doc: &Document) -> Vec<Chunk> {
        if doc.text.trim().is_empty() {
            return vec![];
        }

        let chars: Vec<char> = doc.text.chars().collect();
        let total = chars.len();
        let step = self.step();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < total {
            let end = total.min(start + self.chunk_size);
            let window: String = chars[start..end].iter().collect();
            let text = window.trim();

            if !text.is_empty() {
                let chunk_index = chunks.len();
                let mut metadata = doc.metadata.clone();
                metadata.insert("chunking_strategy".to_string(), Value::from(self.strategy_name.as_str()));
                metadata.insert("chunk_size".to_string(), Value::from(self.chunk_size));
                metadata.insert("overlap".to_string(), Value::from(self.overlap));

                chunks.push(Chunk {
                    chunk_id: Chunk::derive_id(&doc.doc_id, &self.strategy_name, chunk_index, start, end),
                    doc_id: doc.doc_id.clone(),
                    text: text.to_string(),
                    chunk_index,
                    start_char: Some(start),
                    end_char: Some(end),
                    section_heading: None,
                    section_path: None,
                    language: None,
                    metadata,
                });
            }

            start += step;
        }

        chunks
    }
}
