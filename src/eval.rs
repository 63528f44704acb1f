//! Retrieval quality over a set of labelled queries.
//!
//! Queries come from a JSONL file, one object per line:
//! `{"qid": "q1", "query": "...", "relevant_chunk_ids": ["..."]}`. A query may
//! name `expected_files` (note file names) instead of chunk ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use crate::dedupe::SOURCE_KEY;
use crate::error::{RagError, Result};
use crate::models::Candidate;
use crate::pipeline::Pipeline;
use crate::profiles::RetrievalConfig;

pub const DEFAULT_KS: [usize; 2] = [5, 10];

#[derive(Debug, Clone, PartialEq)]
pub struct EvalQuery {
    pub qid: String,
    pub query: String,
    pub relevant_chunk_ids: BTreeSet<String>,
    pub expected_files: BTreeSet<String>,
}

#[derive(Deserialize)]
struct QueryRecord {
    #[serde(default)]
    qid: Option<Value>,
    query: String,
    #[serde(default)]
    relevant_chunk_ids: BTreeSet<String>,
    #[serde(default)]
    expected_files: BTreeSet<String>,
}

/// Reads labelled queries, skipping blank lines. A missing `qid` becomes
/// `q<line>`; numeric ids are kept as their decimal text.
pub fn load_queries(path: &Path) -> Result<Vec<EvalQuery>> {
    let raw = std::fs::read_to_string(path)?;
    let mut queries = Vec::new();

    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |message: String| RagError::MalformedRecord {
            path: path.to_path_buf(),
            line: idx + 1,
            snippet: line.chars().take(200).collect(),
            message,
        };
        let record: QueryRecord = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
        if record.query.trim().is_empty() {
            return Err(malformed("query is empty".to_string()));
        }

        let qid = match record.qid {
            Some(Value::String(id)) => id,
            Some(Value::Null) | None => format!("q{}", idx + 1),
            Some(other) => other.to_string(),
        };
        queries.push(EvalQuery {
            qid,
            query: record.query,
            relevant_chunk_ids: record.relevant_chunk_ids,
            expected_files: record.expected_files,
        });
    }

    Ok(queries)
}

/// Share of `relevant` found among the first `k` retrieved ids.
pub fn recall_at_k(retrieved: &[String], relevant: &BTreeSet<String>, k: usize) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    let found: HashSet<&String> = retrieved
        .iter()
        .take(k)
        .filter(|id| relevant.contains(*id))
        .collect();
    found.len() as f64 / relevant.len() as f64
}

/// `1 / rank` of the first relevant id, 0 when none is retrieved.
pub fn reciprocal_rank(retrieved: &[String], relevant: &BTreeSet<String>) -> f64 {
    retrieved
        .iter()
        .position(|id| relevant.contains(id))
        .map_or(0.0, |pos| 1.0 / (pos + 1) as f64)
}

/// Entries among the first `k` whose key already appeared earlier.
pub fn duplicates_at_k(keys: &[String], k: usize) -> usize {
    let mut seen = HashSet::new();
    keys.iter().take(k).filter(|key| !seen.insert(*key)).count()
}

/// What one query retrieved, in final pipeline order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub qid: String,
    pub query: String,
    /// Chunk ids, or file names when the query is labelled by file.
    pub retrieved: Vec<String>,
    pub relevant: BTreeSet<String>,
    /// Provenance key per retrieved candidate.
    pub sources: Vec<String>,
}

impl QueryResult {
    pub fn from_candidates(query: &EvalQuery, candidates: &[Candidate]) -> Self {
        let by_file = query.relevant_chunk_ids.is_empty() && !query.expected_files.is_empty();
        let retrieved = candidates
            .iter()
            .map(|c| {
                if by_file {
                    c.chunk
                        .meta_str("file_name")
                        .unwrap_or_else(|| c.chunk.doc_id.clone())
                } else {
                    c.chunk.chunk_id.clone()
                }
            })
            .collect();
        let sources = candidates
            .iter()
            .map(|c| {
                c.chunk
                    .meta_str(SOURCE_KEY)
                    .unwrap_or_else(|| c.chunk.chunk_id.clone())
            })
            .collect();

        Self {
            qid: query.qid.clone(),
            query: query.query.clone(),
            retrieved,
            relevant: if by_file {
                query.expected_files.clone()
            } else {
                query.relevant_chunk_ids.clone()
            },
            sources,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalSummary {
    pub num_queries: usize,
    pub avg_retrieved: f64,
    /// Mean recall keyed by cutoff.
    pub recall: BTreeMap<usize, f64>,
    pub mrr: f64,
    /// Mean duplicate sources within the largest cutoff.
    pub avg_duplicates: f64,
    /// Mean share of retrieved candidates repeating an earlier source.
    pub duplicate_ratio: f64,
}

impl EvalSummary {
    /// One `name: value` line per metric.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("num_queries: {}", self.num_queries),
            format!("avg_retrieved: {:.4}", self.avg_retrieved),
        ];
        lines.extend(self.recall.iter().map(|(k, v)| format!("recall@{k}: {v:.4}")));
        lines.push(format!("mrr: {:.4}", self.mrr));
        lines.push(format!("avg_duplicates: {:.4}", self.avg_duplicates));
        lines.push(format!("duplicate_ratio: {:.4}", self.duplicate_ratio));
        lines
    }
}

pub fn summarize(results: &[QueryResult], ks: &[usize]) -> EvalSummary {
    if results.is_empty() {
        return EvalSummary::default();
    }
    let n = results.len() as f64;
    let mean = |metric: &dyn Fn(&QueryResult) -> f64| results.iter().map(metric).sum::<f64>() / n;
    let dupes_k = ks.iter().copied().max().unwrap_or(usize::MAX);

    EvalSummary {
        num_queries: results.len(),
        avg_retrieved: mean(&|r| r.retrieved.len() as f64),
        recall: ks
            .iter()
            .map(|&k| (k, mean(&|r| recall_at_k(&r.retrieved, &r.relevant, k))))
            .collect(),
        mrr: mean(&|r| reciprocal_rank(&r.retrieved, &r.relevant)),
        avg_duplicates: mean(&|r| duplicates_at_k(&r.sources, dupes_k) as f64),
        duplicate_ratio: mean(&|r| {
            if r.sources.is_empty() {
                0.0
            } else {
                duplicates_at_k(&r.sources, r.sources.len()) as f64 / r.sources.len() as f64
            }
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub summary: EvalSummary,
    pub per_query: Vec<QueryResult>,
}

/// Runs every query through the pipeline. A query with no candidates scores
/// zero instead of failing the run; any other error stops it.
pub async fn evaluate(
    pipeline: &Pipeline,
    queries: &[EvalQuery],
    cfg: &RetrievalConfig,
    ks: &[usize],
) -> Result<EvalReport> {
    let mut per_query = Vec::with_capacity(queries.len());
    for query in queries {
        if query.relevant_chunk_ids.is_empty() && query.expected_files.is_empty() {
            tracing::warn!("Eval query '{}' has no relevance labels", query.qid);
        }
        let candidates = match pipeline.run(&query.query, cfg).await {
            Ok(output) => output.final_candidates,
            Err(RagError::NoCandidates) => {
                tracing::warn!("Eval query '{}' retrieved nothing", query.qid);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        per_query.push(QueryResult::from_candidates(query, &candidates));
    }

    let summary = summarize(&per_query, ks);
    tracing::info!(
        "Evaluated {} queries: mrr={:.4} duplicate_ratio={:.4}",
        summary.num_queries,
        summary.mrr,
        summary.duplicate_ratio
    );
    Ok(EvalReport { summary, per_query })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::models::{Chunk, Filters, test_chunk};
    use crate::retriever::Retriever;
    use crate::store::VectorStore;
    use std::sync::Arc;

    fn strings(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Serves the same scored candidates for every query.
    struct FixedStore(Vec<Candidate>);

    impl VectorStore for FixedStore {
        fn upsert(&mut self, _chunks: Vec<Chunk>, _vectors: Vec<Vec<f32>>) -> Result<()> {
            Ok(())
        }

        fn search(&self, _query: &[f32], top_k: usize, filters: &Filters) -> Vec<Candidate> {
            self.0
                .iter()
                .filter(|c| filters.iter().all(|(k, v)| c.chunk.metadata.get(k) == Some(v)))
                .take(top_k)
                .cloned()
                .collect()
        }

        fn count(&self) -> usize {
            self.0.len()
        }
    }

    fn note(id: &str, source: &str, score: f32) -> Candidate {
        let mut chunk = test_chunk(id, Some(source), &format!("text of {id}"));
        chunk
            .metadata
            .insert("classification".to_string(), Value::from("note"));
        chunk
            .metadata
            .insert("file_name".to_string(), Value::from(format!("{source}.md")));
        Candidate::new(chunk, score)
    }

    #[test]
    fn test_recall_at_k() {
        let retrieved = strings(&["a", "b", "c", "d"]);
        assert_eq!(recall_at_k(&retrieved, &set(&["b", "d"]), 2), 0.5);
        assert_eq!(recall_at_k(&retrieved, &set(&["b", "d"]), 10), 1.0);
        assert_eq!(recall_at_k(&retrieved, &set(&["z"]), 4), 0.0);
        assert_eq!(recall_at_k(&retrieved, &BTreeSet::new(), 4), 0.0);
        // repeated file names count once
        assert_eq!(recall_at_k(&strings(&["x", "x"]), &set(&["x", "y"]), 2), 0.5);
    }

    #[test]
    fn test_reciprocal_rank() {
        let retrieved = strings(&["a", "b", "c"]);
        assert_eq!(reciprocal_rank(&retrieved, &set(&["a"])), 1.0);
        assert_eq!(reciprocal_rank(&retrieved, &set(&["c", "b"])), 0.5);
        assert_eq!(reciprocal_rank(&retrieved, &set(&["z"])), 0.0);
        assert_eq!(reciprocal_rank(&[], &set(&["a"])), 0.0);
    }

    #[test]
    fn test_duplicates_at_k() {
        let keys = strings(&["a", "a", "b", "a", "c"]);
        assert_eq!(duplicates_at_k(&keys, 2), 1);
        assert_eq!(duplicates_at_k(&keys, 5), 2);
        assert_eq!(duplicates_at_k(&[], 5), 0);
    }

    #[test]
    fn test_summarize_averages_queries() {
        let results = vec![
            QueryResult {
                qid: "q1".to_string(),
                query: "one".to_string(),
                retrieved: strings(&["a", "b"]),
                relevant: set(&["b"]),
                sources: strings(&["s1", "s1"]),
            },
            QueryResult {
                qid: "q2".to_string(),
                query: "two".to_string(),
                retrieved: vec![],
                relevant: set(&["c"]),
                sources: vec![],
            },
        ];
        let summary = summarize(&results, &[1, 5]);

        assert_eq!(summary.num_queries, 2);
        assert_eq!(summary.avg_retrieved, 1.0);
        assert_eq!(summary.recall[&1], 0.0);
        assert_eq!(summary.recall[&5], 0.5);
        assert_eq!(summary.mrr, 0.25);
        assert_eq!(summary.avg_duplicates, 0.5);
        assert_eq!(summary.duplicate_ratio, 0.25);
        assert!(summary.lines().contains(&"recall@5: 0.5000".to_string()));

        assert_eq!(summarize(&[], &DEFAULT_KS), EvalSummary::default());
    }

    #[test]
    fn test_load_queries_reads_jsonl() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("queries.jsonl");
        std::fs::write(
            &path,
            "{\"qid\": \"own\", \"query\": \"ownership\", \"relevant_chunk_ids\": [\"c1\", \"c2\"]}\n\
             \n\
             {\"qid\": 7, \"query\": \"garden\", \"expected_files\": [\"garden.md\"]}\n\
             {\"query\": \"taxes\"}\n",
        )
        .unwrap();

        let queries = load_queries(&path).unwrap();
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0].qid, "own");
        assert_eq!(queries[0].relevant_chunk_ids, set(&["c1", "c2"]));
        assert_eq!(queries[1].qid, "7");
        assert_eq!(queries[1].expected_files, set(&["garden.md"]));
        assert_eq!(queries[2].qid, "q4");
        assert!(queries[2].relevant_chunk_ids.is_empty());
    }

    #[test]
    fn test_load_queries_reports_bad_line() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("queries.jsonl");
        std::fs::write(&path, "{\"query\": \"ok\"}\n{\"qid\": \"x\"}\n").unwrap();

        match load_queries(&path).unwrap_err() {
            RagError::MalformedRecord { line, snippet, .. } => {
                assert_eq!(line, 2);
                assert_eq!(snippet, "{\"qid\": \"x\"}");
            }
            other => panic!("unexpected error: {other}"),
        }

        std::fs::write(&path, "{\"query\": \"  \"}\n").unwrap();
        assert!(matches!(
            load_queries(&path),
            Err(RagError::MalformedRecord { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_evaluate_runs_pipeline_per_query() {
        let store = FixedStore(vec![
            note("a1", "alpha", 0.9),
            note("a2", "alpha", 0.8),
            note("b1", "beta", 0.7),
            note("c1", "gamma", 0.6),
        ]);
        let pipeline = Pipeline::new(Retriever::new(
            Arc::new(HashEmbedder::new(8)),
            Arc::new(store),
        ));
        let cfg = RetrievalConfig {
            dedupe: false,
            context_k: 3,
            ..Default::default()
        };
        let queries = vec![
            EvalQuery {
                qid: "chunks".to_string(),
                query: "beta".to_string(),
                relevant_chunk_ids: set(&["b1"]),
                expected_files: BTreeSet::new(),
            },
            EvalQuery {
                qid: "files".to_string(),
                query: "gamma".to_string(),
                relevant_chunk_ids: BTreeSet::new(),
                expected_files: set(&["gamma.md"]),
            },
        ];

        let report = evaluate(&pipeline, &queries, &cfg, &[1, 3]).await.unwrap();

        assert_eq!(report.per_query[0].retrieved, strings(&["a1", "a2", "b1"]));
        assert_eq!(report.per_query[1].retrieved, strings(&["alpha.md", "alpha.md", "beta.md"]));
        assert_eq!(report.summary.num_queries, 2);
        assert_eq!(report.summary.recall[&1], 0.0);
        assert_eq!(report.summary.recall[&3], 0.5);
        assert!((report.summary.mrr - 1.0 / 6.0).abs() < 1e-9);
        assert_eq!(report.summary.avg_duplicates, 1.0);
    }

    #[tokio::test]
    async fn test_evaluate_scores_empty_retrieval_as_zero() {
        let mut moc = note("m1", "hub", 0.9);
        moc.chunk
            .metadata
            .insert("classification".to_string(), Value::from("moc"));
        let pipeline = Pipeline::new(Retriever::new(
            Arc::new(HashEmbedder::new(8)),
            Arc::new(FixedStore(vec![moc])),
        ));
        let queries = vec![EvalQuery {
            qid: "q".to_string(),
            query: "hub".to_string(),
            relevant_chunk_ids: set(&["m1"]),
            expected_files: BTreeSet::new(),
        }];

        let report = evaluate(&pipeline, &queries, &RetrievalConfig::default(), &DEFAULT_KS)
            .await
            .unwrap();
        assert!(report.per_query[0].retrieved.is_empty());
        assert_eq!(report.summary.mrr, 0.0);
        assert_eq!(report.summary.recall[&5], 0.0);
    }
}
