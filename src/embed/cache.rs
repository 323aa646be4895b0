//! Two-tier embedding cache in front of the injected [`Embedder`].
//!
//! Tier one is an in-process LRU; tier two is the sqlite fragment store.
//! Keys are the SHA-256 of the enriched text plus the embedder id, so a
//! fragment whose content is unchanged never re-embeds across process
//! restarts, and switching embedders never serves stale vectors.
//!
//! Misses go to the embedder in one batch. Transient failures retry with
//! exponential backoff inside the caller's deadline; when retries are
//! exhausted the error is surfaced per-text so callers can degrade to
//! lexical-only behavior instead of failing the batch.

use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::model::types::Deadline;
use crate::storage::sqlite::FragmentStore;

use super::{EmbedError, Embedder};

const MEMORY_CAPACITY: usize = 8192;
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

fn as_refs(texts: &[String]) -> Vec<&str> {
    texts.iter().map(String::as_str).collect()
}

/// Cache key: embedder id + SHA-256 of the text.
fn cache_key(embedder_id: &str, text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(embedder_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    memory: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    store: Arc<FragmentStore>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, store: Arc<FragmentStore>) -> Self {
        let capacity = std::num::NonZeroUsize::new(MEMORY_CAPACITY)
            .unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            inner,
            memory: Mutex::new(LruCache::new(capacity)),
            store,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn embedder_id(&self) -> &str {
        self.inner.id()
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    /// Fraction of lookups served from either tier. 1.0 when no lookups
    /// have happened yet.
    pub fn hit_rate(&self) -> f64 {
        use std::sync::atomic::Ordering;
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            1.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Embed a batch, serving cached members without calling the
    /// embedder for them. Output order matches input order.
    pub fn embed_batch(
        &self,
        texts: &[&str],
        deadline: Deadline,
    ) -> Result<Vec<Arc<Vec<f32>>>, EmbedError> {
        use std::sync::atomic::Ordering;

        let keys: Vec<String> = texts
            .iter()
            .map(|t| cache_key(self.inner.id(), t))
            .collect();

        let mut out: Vec<Option<Arc<Vec<f32>>>> = vec![None; texts.len()];
        let mut miss_idx: Vec<usize> = Vec::new();

        {
            let mut memory = self.memory.lock();
            for (i, key) in keys.iter().enumerate() {
                if let Some(vec) = memory.get(key) {
                    out[i] = Some(Arc::clone(vec));
                }
            }
        }

        // Memory misses fall through to the persistent tier.
        for (i, key) in keys.iter().enumerate() {
            if out[i].is_some() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.store.cached_embedding(key, self.inner.dimension()) {
                Ok(Some(vec)) => {
                    let vec = Arc::new(vec);
                    self.memory.lock().put(key.clone(), Arc::clone(&vec));
                    out[i] = Some(vec);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {
                    miss_idx.push(i);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, "embedding cache read failed, treating as miss");
                    miss_idx.push(i);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if miss_idx.is_empty() {
            return Ok(out.into_iter().flatten().collect());
        }

        debug!(
            total = texts.len(),
            misses = miss_idx.len(),
            "embedding cache misses"
        );

        let miss_texts: Vec<&str> = miss_idx.iter().map(|&i| texts[i]).collect();
        let vectors = self.embed_with_retry(&miss_texts, deadline)?;
        if vectors.len() != miss_texts.len() {
            return Err(EmbedError::Unavailable(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                miss_texts.len()
            )));
        }

        for (&i, vector) in miss_idx.iter().zip(vectors) {
            if vector.len() != self.inner.dimension() {
                return Err(EmbedError::DimensionMismatch {
                    expected: self.inner.dimension(),
                    got: vector.len(),
                });
            }
            let key = &keys[i];
            if let Err(e) = self.store.put_cached_embedding(key, &vector) {
                warn!(error = %e, "embedding cache write failed");
            }
            let vector = Arc::new(vector);
            self.memory.lock().put(key.clone(), Arc::clone(&vector));
            out[i] = Some(vector);
        }

        Ok(out.into_iter().flatten().collect())
    }

    fn embed_with_retry(
        &self,
        texts: &[&str],
        deadline: Deadline,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if deadline.expired() {
                return Err(EmbedError::DeadlineExceeded);
            }
            match self.embed_once(&owned, deadline) {
                Ok(vectors) => return Ok(vectors),
                Err(e @ EmbedError::DeadlineExceeded) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "embed batch failed");
                    last_err = Some(e);
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt);
                let wait = deadline.remaining_or(backoff).min(backoff);
                if wait.is_zero() {
                    return Err(EmbedError::DeadlineExceeded);
                }
                std::thread::sleep(wait);
            }
        }
        Err(last_err
            .unwrap_or_else(|| EmbedError::Unavailable("no attempts made".to_string())))
    }

    /// One embedder call, bounded by the deadline. The call runs on a
    /// helper thread so a hung embedder cannot wedge the caller; an
    /// abandoned call finishes (or dies) on its own thread.
    fn embed_once(
        &self,
        texts: &[String],
        deadline: Deadline,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let Some(remaining) = deadline.remaining() else {
            return self.inner.embed_batch(&as_refs(texts));
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let embedder = Arc::clone(&self.inner);
        let batch = texts.to_vec();
        std::thread::spawn(move || {
            let outcome = embedder.embed_batch(&as_refs(&batch));
            let _ = tx.send(outcome);
        });
        match rx.recv_timeout(remaining) {
            Ok(outcome) => outcome,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(EmbedError::DeadlineExceeded),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(
                EmbedError::Unavailable("embedder worker died".to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        inner: crate::embed::HashEmbedder,
        calls: AtomicUsize,
        texts_embedded: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                inner: crate::embed::HashEmbedder::new(32),
                calls: AtomicUsize::new(0),
                texts_embedded: AtomicUsize::new(0),
            }
        }
    }

    impl Embedder for CountingEmbedder {
        fn id(&self) -> &str {
            "counting"
        }
        fn dimension(&self) -> usize {
            32
        }
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts)
        }
    }

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn id(&self) -> &str {
            "failing"
        }
        fn dimension(&self) -> usize {
            8
        }
        fn embed_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Err(EmbedError::Unavailable("down".to_string()))
        }
    }

    fn store() -> (Arc<FragmentStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::open(&dir.path().join("store.db")).unwrap();
        (Arc::new(store), dir)
    }

    #[test]
    fn repeated_batch_hits_cache() {
        let counting = Arc::new(CountingEmbedder::new());
        let (store, _dir) = store();
        let cache = CachedEmbedder::new(counting.clone(), store);

        let first = cache
            .embed_batch(&["fn a()", "fn b()"], Deadline::none())
            .unwrap();
        assert_eq!(counting.texts_embedded.load(Ordering::SeqCst), 2);

        let second = cache
            .embed_batch(&["fn a()", "fn b()"], Deadline::none())
            .unwrap();
        assert_eq!(counting.texts_embedded.load(Ordering::SeqCst), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn partial_hit_only_embeds_misses() {
        let counting = Arc::new(CountingEmbedder::new());
        let (store, _dir) = store();
        let cache = CachedEmbedder::new(counting.clone(), store);

        cache.embed_batch(&["fn a()"], Deadline::none()).unwrap();
        cache
            .embed_batch(&["fn a()", "fn c()"], Deadline::none())
            .unwrap();
        assert_eq!(counting.texts_embedded.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn persistent_tier_survives_memory_eviction() {
        let counting = Arc::new(CountingEmbedder::new());
        let (shared, _dir) = store();
        let cache = CachedEmbedder::new(counting.clone(), Arc::clone(&shared));
        cache.embed_batch(&["fn a()"], Deadline::none()).unwrap();

        // Fresh memory tier over the same persistent store.
        let counting2 = Arc::new(CountingEmbedder::new());
        let cache2 = CachedEmbedder::new(counting2.clone(), shared);
        cache2.embed_batch(&["fn a()"], Deadline::none()).unwrap();
        assert_eq!(counting2.texts_embedded.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unavailable_embedder_surfaces_after_retries() {
        let (store, _dir) = store();
        let cache = CachedEmbedder::new(Arc::new(FailingEmbedder), store);
        let result = cache.embed_batch(
            &["fn a()"],
            Deadline::after(Duration::from_millis(50)),
        );
        assert!(matches!(
            result,
            Err(EmbedError::Unavailable(_)) | Err(EmbedError::DeadlineExceeded)
        ));
    }

    #[test]
    fn hit_rate_reflects_lookups() {
        let (store, _dir) = store();
        let cache = CachedEmbedder::new(Arc::new(CountingEmbedder::new()), store);
        assert_eq!(cache.hit_rate(), 1.0);
        cache.embed_batch(&["x"], Deadline::none()).unwrap();
        assert_eq!(cache.hit_rate(), 0.0);
        cache.embed_batch(&["x"], Deadline::none()).unwrap();
        assert!((cache.hit_rate() - 0.5).abs() < 1e-9);
    }
}
