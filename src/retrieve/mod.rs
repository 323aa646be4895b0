//! Hybrid retrieval: fan out to the semantic and lexical indices in
//! parallel, normalize each side's scores, and fuse.
//!
//! Both sides contribute a candidate pool larger than `k` so fusion has
//! something to reorder. Scores are min-max normalized per source
//! (cosine and BM25 live on incompatible scales), then combined as a
//! weighted sum; a fragment found by only one source scores 0 on the
//! other. Metadata filters run before fusion so filtered-out candidates
//! never eat pool slots from the final ranking.
//!
//! Embedding failure degrades the query to lexical-only instead of
//! failing it; the outcome carries a flag so callers can surface that.

use std::sync::Arc;

use anyhow::{Context, Result};
use fxhash::FxHashMap;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::embed::cache::CachedEmbedder;
use crate::index::lexical::LexicalIndex;
use crate::index::semantic::{SemanticHit, SemanticIndex};
use crate::model::types::{
    Fragment, FragmentId, RetrievalMethod, RetrievalQuery, RetrievalResult,
};
use crate::storage::sqlite::FragmentStore;

/// Floor for the per-source candidate pool, overridable via `RAG_POOL`.
static POOL_FLOOR: Lazy<usize> = Lazy::new(|| {
    dotenvy::var("RAG_POOL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(50)
});

/// Extra headroom factor when metadata filters are active, since
/// filtering discards candidates after retrieval.
const FILTER_HEADROOM: usize = 4;

#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    pub results: Vec<RetrievalResult>,
    /// True when the semantic side was unavailable and only lexical
    /// evidence ranked the results.
    pub degraded: bool,
    pub semantic_candidates: usize,
    pub lexical_candidates: usize,
}

pub struct HybridRetriever {
    semantic: Arc<SemanticIndex>,
    lexical: Arc<LexicalIndex>,
    embedder: Arc<CachedEmbedder>,
    store: Arc<FragmentStore>,
}

impl HybridRetriever {
    pub fn new(
        semantic: Arc<SemanticIndex>,
        lexical: Arc<LexicalIndex>,
        embedder: Arc<CachedEmbedder>,
        store: Arc<FragmentStore>,
    ) -> Self {
        Self {
            semantic,
            lexical,
            embedder,
            store,
        }
    }

    pub fn retrieve(&self, query: &RetrievalQuery) -> Result<RetrievalOutcome> {
        let mut pool = query.k.max(*POOL_FLOOR);
        if !query.filters.is_empty() {
            pool *= FILTER_HEADROOM;
        }

        let (semantic_hits, lexical_hits) = rayon::join(
            || self.semantic_candidates(query, pool),
            || self.lexical.search(&query.text, pool),
        );

        let (semantic_hits, degraded) = match semantic_hits {
            Ok(hits) => (hits, false),
            Err(e) => {
                warn!(error = %e, "semantic retrieval unavailable, degrading to lexical");
                (Vec::new(), true)
            }
        };
        let lexical_hits = lexical_hits.context("lexical retrieval")?;

        let semantic_candidates = semantic_hits.len();
        let lexical_candidates = lexical_hits.len();

        // Per-source min-max normalization over the candidate pools.
        let sem_norm = normalize_scores(&semantic_hits.iter().map(|h| h.score).collect::<Vec<_>>());
        let lex_norm = normalize_scores(&lexical_hits.iter().map(|h| h.score).collect::<Vec<_>>());

        #[derive(Default, Clone, Copy)]
        struct Partial {
            semantic: Option<f32>,
            lexical: Option<f32>,
        }
        let mut by_id: FxHashMap<FragmentId, Partial> = FxHashMap::default();
        for (hit, &norm) in semantic_hits.iter().zip(&sem_norm) {
            by_id.entry(hit.id).or_default().semantic = Some(norm);
        }
        for (hit, &norm) in lexical_hits.iter().zip(&lex_norm) {
            by_id.entry(hit.id).or_default().lexical = Some(norm);
        }

        let ids: Vec<FragmentId> = by_id.keys().copied().collect();
        let fragments = self.store.fragments(&ids).context("resolving candidates")?;
        let fragment_by_id: FxHashMap<FragmentId, Fragment> =
            fragments.into_iter().map(|f| (f.id, f)).collect();

        let weights = query.weights.unwrap_or_default();
        let mut results: Vec<RetrievalResult> = Vec::new();
        for (id, partial) in &by_id {
            let Some(fragment) = fragment_by_id.get(id) else {
                // Index entry with no store row: stale, skip.
                continue;
            };
            if !query.filters.matches(fragment) {
                continue;
            }
            let method = match (partial.semantic, partial.lexical) {
                (Some(_), Some(_)) => RetrievalMethod::Both,
                (Some(_), None) => RetrievalMethod::Semantic,
                _ => RetrievalMethod::Lexical,
            };
            let score = weights.semantic * partial.semantic.unwrap_or(0.0)
                + weights.lexical * partial.lexical.unwrap_or(0.0);
            results.push(RetrievalResult {
                fragment: fragment.clone(),
                score,
                method,
                rerank_score: None,
            });
        }

        results.sort_by(|a, b| {
            b.score.total_cmp(&a.score).then_with(|| {
                let a_len = a.fragment.source_path.as_os_str().len();
                let b_len = b.fragment.source_path.as_os_str().len();
                a_len.cmp(&b_len).then_with(|| a.fragment.id.cmp(&b.fragment.id))
            })
        });
        results.truncate(query.k);

        debug!(
            semantic = semantic_candidates,
            lexical = lexical_candidates,
            fused = results.len(),
            degraded,
            "hybrid retrieval"
        );

        Ok(RetrievalOutcome {
            results,
            degraded,
            semantic_candidates,
            lexical_candidates,
        })
    }

    fn semantic_candidates(
        &self,
        query: &RetrievalQuery,
        pool: usize,
    ) -> Result<Vec<SemanticHit>> {
        let vectors = self
            .embedder
            .embed_batch(&[&query.text], query.deadline)
            .context("embedding query")?;
        Ok(self.semantic.search(&vectors[0], pool)?)
    }
}

/// Min-max normalize to [0, 1]. A constant list maps to all 1.0 so a
/// single-candidate source still contributes full weight.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    let Some(&first) = scores.first() else {
        return Vec::new();
    };
    let (min, max) = scores[1..]
        .iter()
        .fold((first, first), |(lo, hi), &s| (lo.min(s), hi.max(s)));

    let range = max - min;
    if range.abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|&s| (s - min) / range).collect()
}
