//! Optional second-pass re-ranking of the fused top results.
//!
//! A [`Reranker`] scores (query, fragment) pairs with a signal that is
//! allowed to be slower than first-pass retrieval. Only the top window
//! of the fused ranking is re-scored; the tail keeps its fused order
//! below the window. Re-ranking reorders, it never adds or drops
//! results, and any reranker failure falls back to the fused order.
//!
//! Pair scores are cached with a TTL so paging through the same query
//! does not re-score the same pairs.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::index::tokenizer::code_tokens;
use crate::model::types::{Deadline, Fragment, FragmentId, RetrievalResult};

#[derive(Debug, Error)]
pub enum RerankError {
    #[error("reranker unavailable: {0}")]
    Unavailable(String),
}

pub trait Reranker: Send + Sync {
    fn id(&self) -> &str;

    /// Score each pair; higher is more relevant. Must return one score
    /// per fragment, in order.
    fn score_batch(&self, query: &str, fragments: &[&Fragment]) -> Result<Vec<f32>, RerankError>;
}

/// Query-term coverage reranker.
///
/// Scores by the fraction of distinct query tokens present in the
/// fragment, which rewards hits covering the whole query over hits
/// repeating one term. Deliberately a different signal from both
/// embedding cosine and BM25.
pub struct TermCoverageReranker;

impl Reranker for TermCoverageReranker {
    fn id(&self) -> &str {
        "term-coverage"
    }

    fn score_batch(&self, query: &str, fragments: &[&Fragment]) -> Result<Vec<f32>, RerankError> {
        let query_tokens: fxhash::FxHashSet<String> = code_tokens(query).into_iter().collect();
        if query_tokens.is_empty() {
            return Ok(vec![0.0; fragments.len()]);
        }
        Ok(fragments
            .iter()
            .map(|frag| {
                let frag_tokens: fxhash::FxHashSet<String> =
                    code_tokens(&frag.enriched_content).into_iter().collect();
                let present = query_tokens.intersection(&frag_tokens).count();
                present as f32 / query_tokens.len() as f32
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct RerankConfig {
    /// How many of the fused top results are re-scored.
    pub window: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            window: 32,
            cache_capacity: 4096,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

type PairKey = (u64, FragmentId);

pub struct RerankStage {
    reranker: Arc<dyn Reranker>,
    cache: Mutex<LruCache<PairKey, (f32, Instant)>>,
    cfg: RerankConfig,
}

impl RerankStage {
    pub fn new(reranker: Arc<dyn Reranker>, cfg: RerankConfig) -> Self {
        let capacity =
            NonZeroUsize::new(cfg.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            reranker,
            cache: Mutex::new(LruCache::new(capacity)),
            cfg,
        }
    }

    /// Re-rank `results` in place. Returns false when the fused order
    /// was kept, either because the reranker failed or because the
    /// query's deadline ran out before the pass could start.
    pub fn apply(&self, query: &str, deadline: Deadline, results: &mut [RetrievalResult]) -> bool {
        let window = self.cfg.window.min(results.len());
        if window < 2 {
            return true;
        }
        if deadline.expired() {
            debug!("deadline exhausted before rerank, keeping fused order");
            return false;
        }

        let query_hash = query_key(self.reranker.id(), query);
        let now = Instant::now();

        let mut scores: Vec<Option<f32>> = vec![None; window];
        {
            let mut cache = self.cache.lock();
            for (i, result) in results[..window].iter().enumerate() {
                if let Some(&(score, at)) = cache.get(&(query_hash, result.fragment.id)) {
                    if now.duration_since(at) < self.cfg.cache_ttl {
                        scores[i] = Some(score);
                    }
                }
            }
        }

        let miss_idx: Vec<usize> = (0..window).filter(|&i| scores[i].is_none()).collect();
        if !miss_idx.is_empty() {
            let fragments: Vec<&Fragment> =
                miss_idx.iter().map(|&i| &results[i].fragment).collect();
            match self.reranker.score_batch(query, &fragments) {
                Ok(fresh) if fresh.len() == fragments.len() => {
                    let mut cache = self.cache.lock();
                    for (&i, score) in miss_idx.iter().zip(fresh) {
                        cache.put((query_hash, results[i].fragment.id), (score, now));
                        scores[i] = Some(score);
                    }
                }
                Ok(fresh) => {
                    warn!(
                        expected = fragments.len(),
                        got = fresh.len(),
                        "reranker returned wrong batch size, keeping fused order"
                    );
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, "rerank failed, keeping fused order");
                    return false;
                }
            }
        }

        for (i, score) in scores.iter().enumerate() {
            results[i].rerank_score = *score;
        }
        // Reorder the window only; ties keep the fused order's criteria.
        results[..window].sort_by(|a, b| {
            let a_score = a.rerank_score.unwrap_or(0.0);
            let b_score = b.rerank_score.unwrap_or(0.0);
            b_score
                .total_cmp(&a_score)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.fragment.id.cmp(&b.fragment.id))
        });

        debug!(window, cached = window - miss_idx.len(), "reranked window");
        true
    }
}

fn query_key(reranker_id: &str, query: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = fxhash::FxHasher::default();
    reranker_id.hash(&mut hasher);
    query.hash(&mut hasher);
    hasher.finish()
}
