//! Disk cache for embeddings keyed by `(model, text hash)`.
//!
//! The cache is consulted before calling the wrapped embedder and written
//! through on misses, so repeated index builds and experiments do not pay for
//! the same embedding twice.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::embeddings::Embedder;

/// Stable cache key: sha256 over the model name and the sha256 of the text.
pub fn cache_key(model: &str, text: &str) -> String {
    let text_hash = Sha256::digest(text.as_bytes());
    let key = Sha256::digest(format!("{model}|{text_hash:x}").as_bytes());
    format!("{key:x}")
}

/// Wraps any [`Embedder`] with a SQLite-backed cache.
pub struct CachedEmbedder<E> {
    inner: E,
    pool: SqlitePool,
    key_locks: KeyTable,
}

type KeyTable = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

fn lock_table(table: &KeyTable) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-key locks held for one `embed_texts` call. Dropping it, including
/// when the call's future is cancelled, releases the keys and forgets
/// entries no other caller is waiting on.
struct HeldKeys<'a> {
    table: &'a KeyTable,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for HeldKeys<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        let mut table = lock_table(self.table);
        for key in &self.keys {
            if table.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                table.remove(key);
            }
        }
    }
}

impl<E: Embedder> CachedEmbedder<E> {
    pub async fn open(inner: E, db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .busy_timeout(std::time::Duration::from_secs(30))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open embedding cache at {}", db_path.display()))?;

        Self::with_pool(inner, pool).await
    }

    /// In-memory cache, mostly for tests.
    pub async fn in_memory(inner: E) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // a single connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(inner, pool).await
    }

    async fn with_pool(inner: E, pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                key TEXT PRIMARY KEY NOT NULL,
                model TEXT NOT NULL,
                vector_json TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        tracing::info!("Embedding cache ready for model '{}'", inner.model_name());

        Ok(Self {
            inner,
            pool,
            key_locks: KeyTable::default(),
        })
    }

    pub async fn len(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    async fn lookup(&self, keys: &[String]) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        if keys.is_empty() {
            return Ok(found);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT key, vector_json FROM embeddings WHERE key IN (");
        let mut separated = builder.separated(", ");
        for key in keys {
            separated.push_bind(key.clone());
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        for row in rows {
            let key: String = row.try_get("key")?;
            let vector_json: String = row.try_get("vector_json")?;
            match serde_json::from_str::<Vec<f32>>(&vector_json) {
                Ok(vector) => {
                    found.insert(key, vector);
                }
                Err(e) => {
                    tracing::warn!("Ignoring corrupt cache entry {}: {}", key, e);
                }
            }
        }
        Ok(found)
    }

    async fn store(&self, entries: &[(String, Vec<f32>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, vector) in entries {
            sqlx::query(
                "INSERT OR REPLACE INTO embeddings (key, model, vector_json) VALUES (?, ?, ?)",
            )
            .bind(key)
            .bind(self.inner.model_name())
            .bind(serde_json::to_string(vector)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Locks every distinct key in sorted order so two callers embedding
    /// overlapping batches cannot deadlock.
    async fn lock_keys(&self, keys: &[String]) -> HeldKeys<'_> {
        let mut unique: Vec<String> = keys.to_vec();
        unique.sort();
        unique.dedup();

        let locks: Vec<Arc<Mutex<()>>> = {
            let mut table = lock_table(&self.key_locks);
            unique
                .iter()
                .map(|k| Arc::clone(table.entry(k.clone()).or_default()))
                .collect()
        };

        let mut held = HeldKeys {
            table: &self.key_locks,
            keys: unique,
            guards: Vec::with_capacity(locks.len()),
        };
        for lock in locks {
            held.guards.push(lock.lock_owned().await);
        }
        held
    }

    async fn get_or_compute(&self, texts: &[String], keys: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut found = self.lookup(keys).await?;

        let mut missing_keys = Vec::new();
        let mut missing_texts = Vec::new();
        for (key, text) in keys.iter().zip(texts) {
            if !found.contains_key(key) && !missing_keys.contains(key) {
                missing_keys.push(key.clone());
                missing_texts.push(text.clone());
            }
        }

        if !missing_texts.is_empty() {
            tracing::debug!(
                "Embedding cache: {} hits, {} misses",
                keys.len() - missing_texts.len(),
                missing_texts.len()
            );
            let vectors = self.inner.embed_texts(&missing_texts).await?;
            if vectors.len() != missing_texts.len() {
                return Err(anyhow::anyhow!(
                    "Embedder returned {} vectors for {} texts",
                    vectors.len(),
                    missing_texts.len()
                ));
            }
            let entries: Vec<(String, Vec<f32>)> = missing_keys.into_iter().zip(vectors).collect();
            if let Err(e) = self.store(&entries).await {
                tracing::warn!("Failed to write embedding cache entries: {}", e);
            }
            found.extend(entries);
        }

        keys.iter()
            .map(|k| {
                found
                    .get(k)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Missing cached embedding for key {k}"))
            })
            .collect()
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let model = self.inner.model_name();
        let keys: Vec<String> = texts.iter().map(|t| cache_key(model, t)).collect();

        let _held = self.lock_keys(&keys).await;
        self.get_or_compute(texts, &keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                inner: HashEmbedder::new(8),
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_texts(texts).await
        }
    }

    #[test]
    fn test_cache_key_depends_on_model_and_text() {
        let a = cache_key("model-a", "hello");
        assert_eq!(a, cache_key("model-a", "hello"));
        assert_ne!(a, cache_key("model-b", "hello"));
        assert_ne!(a, cache_key("model-a", "hello!"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_cached_embedder_only_embeds_misses() {
        let cached = CachedEmbedder::in_memory(CountingEmbedder::new()).await.unwrap();

        let first = cached
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let second = cached
            .embed_texts(&["b".to_string(), "c".to_string(), "a".to_string()])
            .await
            .unwrap();

        assert_eq!(first[0], second[2]);
        assert_eq!(first[1], second[0]);
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cached.inner.texts.load(Ordering::SeqCst),
            3,
            "Only a, b and c should reach the upstream embedder"
        );
        assert_eq!(cached.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cached_embedder_dedupes_within_batch() {
        let cached = CachedEmbedder::in_memory(CountingEmbedder::new()).await.unwrap();
        let vectors = cached
            .embed_texts(&["same".to_string(), "same".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vectors[1]);
        assert_eq!(cached.inner.texts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_same_key_embed_once() {
        let cached = Arc::new(CachedEmbedder::in_memory(CountingEmbedder::new()).await.unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cached = Arc::clone(&cached);
                tokio::spawn(async move { cached.embed_texts(&["shared".to_string()]).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cached.inner.texts.load(Ordering::SeqCst), 1);
    }

    /// Never answers within any reasonable timeout.
    struct StalledEmbedder(HashEmbedder);

    #[async_trait]
    impl Embedder for StalledEmbedder {
        fn model_name(&self) -> &str {
            self.0.model_name()
        }

        async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_key_locks() {
        let cached = CachedEmbedder::in_memory(StalledEmbedder(HashEmbedder::new(8)))
            .await
            .unwrap();
        let texts = vec!["slow".to_string(), "slower".to_string()];

        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            cached.embed_texts(&texts),
        )
        .await;
        assert!(outcome.is_err(), "Stalled embedder should hit the timeout");
        assert!(
            lock_table(&cached.key_locks).is_empty(),
            "Cancelled call must not leave key locks behind"
        );

        // the same keys can be locked again once released
        let held = cached.lock_keys(&texts).await;
        assert_eq!(held.guards.len(), 2);
        drop(held);
        assert!(lock_table(&cached.key_locks).is_empty());
    }

    #[tokio::test]
    async fn test_completed_call_leaves_no_key_locks() {
        let cached = CachedEmbedder::in_memory(CountingEmbedder::new()).await.unwrap();
        cached.embed_texts(&["x".to_string(), "x".to_string()]).await.unwrap();
        assert!(lock_table(&cached.key_locks).is_empty());
    }

    #[tokio::test]
    async fn test_cache_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("cache").join("embeddings.sqlite3");

        let vector = {
            let cached = CachedEmbedder::open(CountingEmbedder::new(), &db_path).await.unwrap();
            cached.embed_query("persist me").await.unwrap()
        };

        let reopened = CachedEmbedder::open(CountingEmbedder::new(), &db_path).await.unwrap();
        let again = reopened.embed_query("persist me").await.unwrap();
        assert_eq!(vector, again);
        assert_eq!(reopened.inner.calls.load(Ordering::SeqCst), 0);
    }
}
