//! Builds a persisted index from a directory of notes.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::{DirEntry, WalkDir};

use crate::chunker::FixedChunker;
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::models::{Chunk, Document, Metadata};
use crate::store::{
    ChunkingInfo, EmbeddingInfo, IndexManifest, IngestCounters, JsonlStore, VectorStore,
};

const NOTE_EXTENSIONS: [&str; 2] = ["md", "txt"];

fn sha256_hex(data: &str) -> String {
    format!("{:x}", Sha256::digest(data.as_bytes()))
}

/// Stable across runs for unchanged content; changes when the file changes.
pub fn stable_doc_id(uri: &str, text: &str) -> String {
    sha256_hex(&format!("{uri}|{}", sha256_hex(text)))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

fn is_note(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| NOTE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Splits a leading `---` block of `key: value` lines from the body.
///
/// Values are flat scalars, `[a, b]` inline lists or `- item` block lists
/// under an empty key; `true`/`false` become booleans.
pub fn split_frontmatter(text: &str) -> (Metadata, &str) {
    let mut fields = Metadata::new();
    let Some(rest) = text.strip_prefix("---") else {
        return (fields, text);
    };
    let Some(rest) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (fields, text);
    };

    let mut offset = 0;
    let mut body_start = None;
    let mut list_key: Option<String> = None;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim();
        if trimmed == "---" {
            body_start = Some(offset);
            break;
        }
        if let (Some(key), Some(item)) = (&list_key, trimmed.strip_prefix("- ")) {
            let Some(field) = fields.get_mut(key) else {
                continue;
            };
            if !field.is_array() {
                *field = Value::Array(Vec::new());
            }
            if let Value::Array(items) = field {
                items.push(Value::from(unquote(item)));
            }
            continue;
        }
        list_key = None;
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim();
            let parsed = if value.is_empty() {
                list_key = Some(key.to_string());
                Value::from("")
            } else if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
                Value::Array(
                    inner
                        .split(',')
                        .map(unquote)
                        .filter(|item| !item.is_empty())
                        .map(Value::from)
                        .collect(),
                )
            } else {
                let value = unquote(value);
                match value.to_lowercase().as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => Value::from(value),
                }
            };
            fields.insert(key.to_string(), parsed);
        }
    }

    match body_start {
        Some(start) => (fields, &rest[start..]),
        None => (Metadata::new(), text),
    }
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches(|c: char| c == '"' || c == '\'')
}

/// Frontmatter `tags` as a list: a comma-separated string or a list of strings.
pub fn frontmatter_tags(frontmatter: &Metadata) -> Vec<String> {
    match frontmatter.get("tags") {
        Some(Value::String(tags)) => tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(tags)) => tags
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn tag_regex() -> &'static Regex {
    static TAG_REGEX: OnceLock<Regex> = OnceLock::new();
    TAG_REGEX.get_or_init(|| Regex::new(r"(?:^|[^\w])#([A-Za-z0-9/_-]+)").expect("valid tag regex pattern"))
}

fn wikilink_regex() -> &'static Regex {
    static WIKILINK_REGEX: OnceLock<Regex> = OnceLock::new();
    WIKILINK_REGEX.get_or_init(|| Regex::new(r"!?\[\[([^\]]+)\]\]").expect("valid wikilink regex pattern"))
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// Sorted, distinct `#tags` found in the body outside fenced code.
pub fn inline_tags(text: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut in_code = false;
    for line in text.lines() {
        if is_fence(line) {
            in_code = !in_code;
            continue;
        }
        if in_code {
            continue;
        }
        tags.extend(
            tag_regex()
                .captures_iter(line)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
        );
    }
    tags.sort();
    tags.dedup();
    tags
}

/// Replaces `[[target|alias]]` with `alias` and `[[target]]` with `target`,
/// leaving fenced code blocks untouched.
pub fn strip_wikilinks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_code = false;
    for line in text.split_inclusive('\n') {
        if is_fence(line) {
            in_code = !in_code;
            out.push_str(line);
            continue;
        }
        if in_code {
            out.push_str(line);
            continue;
        }
        let replaced = wikilink_regex().replace_all(line, |caps: &regex::Captures| {
            let inner = &caps[1];
            match inner.split_once('|') {
                Some((_, alias)) if !alias.trim().is_empty() => alias.trim().to_string(),
                Some((target, _)) => target.trim().to_string(),
                None => inner.trim().to_string(),
            }
        });
        out.push_str(&replaced);
    }
    out
}

/// `moc` for map-of-content notes (by file name, frontmatter type or a `moc`
/// frontmatter tag), else `note`.
pub fn classify_note(file_name: &str, frontmatter: &Metadata, tags: &[String]) -> &'static str {
    let is_moc_type = frontmatter
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("moc"));
    let has_moc_tag = tags.iter().any(|t| t.eq_ignore_ascii_case("moc"));
    if file_name.to_lowercase().contains("moc") || is_moc_type || has_moc_tag {
        "moc"
    } else {
        "note"
    }
}

/// Markdown headings with their character offset and level.
fn markdown_headings(text: &str) -> Vec<(usize, usize, String)> {
    let mut headings = Vec::new();
    let mut char_offset = 0;
    let mut in_code = false;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_code = !in_code;
        } else if !in_code && trimmed.starts_with('#') {
            let level = trimmed.chars().take_while(|&c| c == '#').count();
            let title = trimmed[level..].trim();
            if level <= 6 && !title.is_empty() && trimmed[level..].starts_with(' ') {
                headings.push((char_offset, level, title.to_string()));
            }
        }
        char_offset += line.chars().count();
    }
    headings
}

/// Sets the heading and heading trail that each chunk starts under.
pub fn annotate_sections(text: &str, chunks: &mut [Chunk]) {
    let headings = markdown_headings(text);
    if headings.is_empty() {
        return;
    }

    for chunk in chunks.iter_mut() {
        let start = chunk.start_char.unwrap_or(0);
        let mut trail: Vec<(usize, &str)> = Vec::new();
        for (_, level, title) in headings.iter().take_while(|(offset, _, _)| *offset <= start) {
            trail.retain(|(l, _)| l < level);
            trail.push((*level, title.as_str()));
        }
        if let Some((_, heading)) = trail.last() {
            chunk.section_heading = Some(heading.to_string());
            chunk.section_path = Some(
                trail
                    .iter()
                    .map(|(_, t)| *t)
                    .collect::<Vec<_>>()
                    .join(" > "),
            );
        }
    }
}

/// Reads one note into a document. `Ok(None)` means empty after frontmatter.
pub fn load_document(path: &Path) -> std::io::Result<Option<Document>> {
    let raw = std::fs::read_to_string(path)?;
    let (frontmatter, body) = split_frontmatter(&raw);
    let body = strip_wikilinks(body);
    if body.trim().is_empty() {
        return Ok(None);
    }

    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let uri = absolute.display().to_string();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let mut metadata = Metadata::new();
    metadata.insert("uri".to_string(), Value::from(uri.as_str()));
    metadata.insert("title".to_string(), Value::from(file_name.as_str()));
    metadata.insert("source_path".to_string(), Value::from(uri.as_str()));
    metadata.insert("file_name".to_string(), Value::from(file_name.as_str()));
    let tags = frontmatter_tags(&frontmatter);
    metadata.insert(
        "classification".to_string(),
        Value::from(classify_note(&file_name, &frontmatter, &tags)),
    );
    metadata.insert("frontmatter_tags".to_string(), Value::from(tags));
    metadata.insert("inline_tags".to_string(), Value::from(inline_tags(&body)));
    if let Some(is_ai) = frontmatter.get("is_ai") {
        metadata.insert("is_ai".to_string(), is_ai.clone());
    }
    if !frontmatter.is_empty() {
        metadata.insert(
            "frontmatter".to_string(),
            Value::Object(frontmatter.into_iter().collect()),
        );
    }

    Ok(Some(Document {
        doc_id: stable_doc_id(&uri, &body),
        uri,
        text: body,
        metadata,
    }))
}

/// Builds `chunks.jsonl` and `manifest.json` for a corpus directory.
pub struct IndexBuilder<'a> {
    embedder: &'a dyn Embedder,
    chunker: FixedChunker,
    batch_size: usize,
    cached: bool,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(embedder: &'a dyn Embedder, chunker: FixedChunker) -> Self {
        Self {
            embedder,
            chunker,
            batch_size: 32,
            cached: false,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Recorded in the manifest only.
    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    fn collect_files(corpus_dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(corpus_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_note(e.path()))
            .map(|e| e.into_path())
            .collect()
    }

    /// Rebuilds the index at `index_dir` from scratch and writes the manifest.
    pub async fn build(
        &self,
        corpus_dir: &Path,
        index_dir: &Path,
        index_name: &str,
    ) -> Result<IndexManifest> {
        if !corpus_dir.is_dir() {
            return Err(RagError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("corpus directory {} does not exist", corpus_dir.display()),
            )));
        }

        let files = Self::collect_files(corpus_dir);
        tracing::info!("Indexing {} files from {}", files.len(), corpus_dir.display());

        let mut counters = IngestCounters {
            files_seen: files.len(),
            ..Default::default()
        };
        let mut chunks = Vec::new();

        for path in &files {
            match load_document(path) {
                Ok(Some(doc)) => {
                    let mut doc_chunks = self.chunker.chunk(&doc);
                    annotate_sections(&doc.text, &mut doc_chunks);
                    tracing::debug!("{}: {} chunks", path.display(), doc_chunks.len());
                    counters.docs_indexed += 1;
                    chunks.extend(doc_chunks);
                }
                Ok(None) => {
                    tracing::info!("Skipping empty note {}", path.display());
                    counters.files_skipped += 1;
                }
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    counters.files_skipped += 1;
                }
            }
        }

        let mut vectors = Vec::with_capacity(chunks.len());
        for (batch_idx, batch) in chunks.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let batch_vectors = self
                .embedder
                .embed_texts(&texts)
                .await
                .map_err(RagError::Embedding)?;
            if batch_vectors.len() != texts.len() {
                return Err(RagError::LengthMismatch {
                    chunks: texts.len(),
                    vectors: batch_vectors.len(),
                });
            }
            vectors.extend(batch_vectors);
            tracing::debug!(
                "Embedded batch {} ({} of {} chunks)",
                batch_idx + 1,
                vectors.len(),
                chunks.len()
            );
        }

        counters.chunk_count = chunks.len();
        let mut store = JsonlStore::empty(index_dir);
        store.upsert(chunks, vectors)?;
        store.save()?;

        let manifest = IndexManifest {
            index_name: index_name.to_string(),
            created_at: Utc::now(),
            corpus: corpus_dir.display().to_string(),
            chunking: ChunkingInfo {
                strategy: self.chunker.strategy_name.clone(),
                chunk_size: self.chunker.chunk_size,
                overlap: self.chunker.overlap,
            },
            embedding: EmbeddingInfo {
                model: self.embedder.model_name().to_string(),
                cached: self.cached,
            },
            ingest: counters,
        };
        manifest.write(index_dir)?;

        tracing::info!(
            "Index '{}' built: {} docs, {} chunks, {} skipped",
            index_name,
            manifest.ingest.docs_indexed,
            manifest.ingest.chunk_count,
            manifest.ingest.files_skipped
        );
        Ok(manifest)
    }
}
