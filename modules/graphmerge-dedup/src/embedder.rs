//! Batch embedding with a copy-on-write cache.
//!
//! Workers only see an immutable snapshot of the cache; new vectors are
//! inserted by the owner after the batch results come back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ai_client::EmbedAgent;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use graphmerge_core::{DedupError, DedupResult};

use crate::cancel::CancelFlag;

#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    model: String,
    entries: Arc<HashMap<String, Vec<f32>>>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    model: String,
    entries: BTreeMap<String, Vec<f32>>,
}

impl EmbeddingCache {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            entries: Arc::new(HashMap::new()),
        }
    }

    /// SHA-256 of model and text, so switching models never serves stale vectors.
    pub fn key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, text: &str) -> Option<&Vec<f32>> {
        self.entries.get(&self.key(text))
    }

    pub fn contains(&self, text: &str) -> bool {
        self.entries.contains_key(&self.key(text))
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, Vec<f32>>> {
        Arc::clone(&self.entries)
    }

    pub fn insert_many(&mut self, items: impl IntoIterator<Item = (String, Vec<f32>)>) {
        let keyed: Vec<(String, Vec<f32>)> = items.into_iter().map(|(t, v)| (self.key(&t), v)).collect();
        if keyed.is_empty() {
            return;
        }
        let entries = Arc::make_mut(&mut self.entries);
        entries.extend(keyed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load a cache written by [`save`](Self::save). A missing file or a file
    /// for another model yields an empty cache.
    pub fn load(path: &Path, model: &str) -> DedupResult<Self> {
        if !path.exists() {
            return Ok(Self::new(model));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| DedupError::Io(format!("failed to read embedding cache {}: {e}", path.display())))?;
        let file: CacheFile = serde_json::from_str(&content)
            .map_err(|e| DedupError::Io(format!("invalid embedding cache {}: {e}", path.display())))?;
        if file.model != model {
            warn!(cached = file.model, configured = model, "Embedding cache is for another model, ignoring");
            return Ok(Self::new(model));
        }
        info!(path = %path.display(), entries = file.entries.len(), "Loaded embedding cache");
        Ok(Self {
            model: file.model,
            entries: Arc::new(file.entries.into_iter().collect()),
        })
    }

    pub fn save(&self, path: &Path) -> DedupResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = CacheFile {
            model: self.model.clone(),
            entries: self.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let json = serde_json::to_string(&file)
            .map_err(|e| DedupError::Io(format!("failed to serialise embedding cache: {e}")))?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), entries = self.entries.len(), "Flushed embedding cache");
        Ok(())
    }
}

pub struct Embedder {
    agent: Arc<dyn EmbedAgent>,
    cache: EmbeddingCache,
    batch_size: usize,
    concurrency: usize,
    timeout: Duration,
    cancel: CancelFlag,
}

impl Embedder {
    pub fn new(agent: Arc<dyn EmbedAgent>, cache: EmbeddingCache) -> Self {
        Self {
            agent,
            cache,
            batch_size: 64,
            concurrency: 4,
            timeout: Duration::from_secs(60),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Embed every text, in order. Cached vectors are reused; the rest are
    /// fetched in parallel batches. Any failed batch fails the whole call.
    pub async fn embed_all(&mut self, texts: &[String]) -> DedupResult<Vec<Vec<f32>>> {
        let snapshot = self.cache.snapshot();
        let mut seen = HashSet::new();
        let missing: Vec<String> = texts
            .iter()
            .filter(|t| !snapshot.contains_key(&self.cache.key(t)))
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect();

        if !missing.is_empty() {
            debug!(missing = missing.len(), cached = texts.len() - missing.len(), "Embedding texts");
            let fresh = self.fetch(missing).await?;
            self.cache.insert_many(fresh);
        }

        texts
            .iter()
            .map(|t| {
                self.cache
                    .get(t)
                    .cloned()
                    .ok_or_else(|| DedupError::Embedding(format!("no embedding for {t:?}")))
            })
            .collect()
    }

    async fn fetch(&self, missing: Vec<String>) -> DedupResult<Vec<(String, Vec<f32>)>> {
        let batches: Vec<Vec<String>> = missing.chunks(self.batch_size).map(<[String]>::to_vec).collect();
        let timeout = self.timeout;

        let mut results: Vec<(usize, Vec<String>, DedupResult<Vec<Vec<f32>>>)> =
            stream::iter(batches.into_iter().enumerate().map(|(index, batch)| {
                let agent = Arc::clone(&self.agent);
                let cancel = self.cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return (index, batch, Err(DedupError::Cancelled));
                    }
                    let outcome = match tokio::time::timeout(timeout, agent.embed_batch(batch.clone())).await {
                        Ok(Ok(vectors)) => Ok(vectors),
                        Ok(Err(e)) => Err(DedupError::Embedding(e.to_string())),
                        Err(_) => Err(DedupError::Embedding(format!(
                            "embedding batch timed out after {}s",
                            timeout.as_secs()
                        ))),
                    };
                    (index, batch, outcome)
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut fresh = Vec::new();
        for (_, batch, outcome) in results {
            let vectors = outcome?;
            if vectors.len() != batch.len() {
                return Err(DedupError::Embedding(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            fresh.extend(batch.into_iter().zip(vectors));
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_client::AiError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbedAgent for CountingEmbedder {
        fn embedding_model(&self) -> &str {
            "test-model"
        }

        async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn cached_texts_are_not_fetched_again() {
        let agent = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) });
        let mut embedder = Embedder::new(agent.clone(), EmbeddingCache::new("test-model")).with_batch_size(2);

        let texts = vec!["a".to_string(), "bb".to_string(), "a".to_string()];
        let first = embedder.embed_all(&texts).await.unwrap();
        assert_eq!(first[0], vec![1.0, 1.0]);
        assert_eq!(first[1], vec![2.0, 1.0]);
        assert_eq!(first[2], first[0]);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        embedder.embed_all(&texts).await.unwrap();
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshots_are_not_affected_by_later_inserts() {
        let mut cache = EmbeddingCache::new("m");
        let before = cache.snapshot();
        cache.insert_many([("x".to_string(), vec![1.0])]);
        assert!(before.is_empty());
        assert!(cache.contains("x"));
    }

    #[test]
    fn key_depends_on_model() {
        let a = EmbeddingCache::new("model-a");
        let b = EmbeddingCache::new("model-b");
        assert_ne!(a.key("text"), b.key("text"));
        assert_eq!(a.key("text").len(), 64);
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache/embeddings.json");
        let mut cache = EmbeddingCache::new("m");
        cache.insert_many([("hello".to_string(), vec![0.5, 0.25])]);
        cache.save(&path).unwrap();

        let loaded = EmbeddingCache::load(&path, "m").unwrap();
        assert_eq!(loaded.get("hello"), Some(&vec![0.5, 0.25]));

        let other = EmbeddingCache::load(&path, "other-model").unwrap();
        assert!(other.is_empty());
    }
}
