//! The retrieval engine: owns the store, both indices, the embedding
//! cache, the retriever and the re-rank stage, and exposes the query
//! and indexing entry points. Everything is instance state; two engines
//! over two corpora coexist in one process.
//!
//! `query` never returns an error. Failures degrade: semantic outage
//! falls back to lexical-only ranking, a failing re-ranker keeps the
//! fused order, and a hard retrieval failure yields an empty, flagged
//! response after bounded retries. Results for a (query, filters, k,
//! weights) tuple are cached per corpus generation; any committed write
//! advances the generation and thereby invalidates the whole cache
//! without scanning it.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fxhash::FxHashSet;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::chunker::Chunker;
use crate::config::EngineConfig;
use crate::embed::cache::CachedEmbedder;
use crate::embed::{Embedder, HashEmbedder};
use crate::index::lexical::LexicalIndex;
use crate::index::semantic::SemanticIndex;
use crate::indexer::{Indexer, ReindexReport};
use crate::model::types::{
    Deadline, FragmentId, FusionWeights, PathChange, RetrievalQuery, RetrievalResult,
};
use crate::rerank::{RerankStage, Reranker, TermCoverageReranker};
use crate::retrieve::HybridRetriever;
use crate::storage::sqlite::FragmentStore;

const QUERY_MAX_ATTEMPTS: u32 = 3;
const QUERY_BACKOFF_BASE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryTimings {
    pub retrieval: Duration,
    pub rerank: Duration,
    pub total: Duration,
}

/// What a query returns. Inspect `degraded` to learn whether the
/// ranking used both indices or fell back.
#[derive(Debug, Default)]
pub struct QueryResponse {
    pub results: Vec<RetrievalResult>,
    pub degraded: bool,
    pub from_cache: bool,
    pub generation: u64,
    pub timings: QueryTimings,
}

#[derive(Debug)]
pub struct HealthReport {
    pub fragments: u64,
    pub semantic_entries: usize,
    pub lexical_docs: u64,
    pub generation: u64,
    pub embedding_cache_hit_rate: f64,
    pub last_reindex: Option<chrono::DateTime<chrono::Utc>>,
}

/// Only complete responses are cached; degraded ones are retried fresh.
type CachedResults = Arc<Vec<RetrievalResult>>;

pub struct RetrievalEngine {
    cfg: EngineConfig,
    store: Arc<FragmentStore>,
    semantic: Arc<SemanticIndex>,
    lexical: Arc<LexicalIndex>,
    embedder: Arc<CachedEmbedder>,
    retriever: HybridRetriever,
    rerank: RerankStage,
    indexer: Indexer,
    generation: Arc<AtomicU64>,
    query_cache: Mutex<LruCache<u64, CachedResults>>,
}

impl RetrievalEngine {
    /// Open with the bundled deterministic hash embedder.
    pub fn open(cfg: EngineConfig) -> Result<Self> {
        let dimension = cfg.embedding_dimension;
        Self::open_with(cfg, Arc::new(HashEmbedder::new(dimension)), Arc::new(TermCoverageReranker))
    }

    /// Open with injected embedder and reranker implementations.
    pub fn open_with(
        cfg: EngineConfig,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cfg.data_dir)
            .with_context(|| format!("creating {}", cfg.data_dir.display()))?;

        let store = Arc::new(FragmentStore::open(&cfg.store_path())?);
        let embedder = Arc::new(CachedEmbedder::new(embedder, Arc::clone(&store)));
        let lexical = Arc::new(LexicalIndex::open_or_create(&cfg.lexical_index_dir())?);

        let semantic_path = cfg.semantic_index_path();
        let semantic = if semantic_path.exists() {
            match SemanticIndex::load(&semantic_path, embedder.embedder_id()) {
                Ok(index) => Arc::new(index),
                Err(e) => {
                    warn!(error = %e, "semantic index unusable, rebuilding from store");
                    let index = Arc::new(SemanticIndex::new(
                        embedder.dimension(),
                        embedder.embedder_id(),
                    ));
                    rebuild_semantic(&index, &store, &embedder);
                    index
                }
            }
        } else {
            let index = Arc::new(SemanticIndex::new(
                embedder.dimension(),
                embedder.embedder_id(),
            ));
            if store.fragment_count()? > 0 {
                rebuild_semantic(&index, &store, &embedder);
            }
            index
        };

        let generation = Arc::new(AtomicU64::new(0));
        let retriever = HybridRetriever::new(
            Arc::clone(&semantic),
            Arc::clone(&lexical),
            Arc::clone(&embedder),
            Arc::clone(&store),
        );
        let rerank = RerankStage::new(reranker, cfg.rerank.clone());
        let indexer = Indexer::new(
            Chunker::new(cfg.chunker.clone()),
            Arc::clone(&store),
            Arc::clone(&semantic),
            Arc::clone(&lexical),
            Arc::clone(&embedder),
            Arc::clone(&generation),
        );
        let cache_capacity =
            NonZeroUsize::new(cfg.query_cache_capacity).unwrap_or(NonZeroUsize::MIN);

        info!(data_dir = %cfg.data_dir.display(), "engine opened");
        Ok(Self {
            cfg,
            store,
            semantic,
            lexical,
            embedder,
            retriever,
            rerank,
            indexer,
            generation,
            query_cache: Mutex::new(LruCache::new(cache_capacity)),
        })
    }

    /// Index everything under `root`.
    pub fn index_directory(&self, root: &Path) -> Result<ReindexReport> {
        let artifacts = Indexer::scan_directory(root)?;
        let report = self.indexer.index_artifacts(&artifacts)?;
        self.persist()?;
        Ok(report)
    }

    /// Apply a batch of path change notifications rooted at `root`.
    pub fn apply_changes(&self, root: &Path, changes: &[PathChange]) -> Result<ReindexReport> {
        let report = self.indexer.apply_changes(root, changes)?;
        self.persist()?;
        Ok(report)
    }

    fn persist(&self) -> Result<()> {
        self.semantic.save(&self.cfg.semantic_index_path())?;
        Ok(())
    }

    /// Execute a query. Infallible by contract: hard failures return an
    /// empty response with `degraded` set, after bounded retries.
    pub fn query(&self, mut query: RetrievalQuery) -> QueryResponse {
        let started = Instant::now();
        if query.weights.is_none() {
            query.weights = Some(self.cfg.weights);
        }
        if query.deadline == Deadline::none() && !self.cfg.query_budget.is_zero() {
            query.deadline = Deadline::after(self.cfg.query_budget);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let key = cache_key(&query, generation);
        if let Some(results) = self.query_cache.lock().get(&key).cloned() {
            return QueryResponse {
                results: results.as_ref().clone(),
                degraded: false,
                from_cache: true,
                generation,
                timings: QueryTimings {
                    total: started.elapsed(),
                    ..QueryTimings::default()
                },
            };
        }

        let mut degraded = false;
        let mut results = Vec::new();
        let mut retrieval_elapsed = Duration::ZERO;
        let mut attempt = 0;
        loop {
            let attempt_started = Instant::now();
            match self.retriever.retrieve(&query) {
                Ok(outcome) => {
                    retrieval_elapsed = attempt_started.elapsed();
                    degraded = outcome.degraded;
                    results = outcome.results;
                    break;
                }
                Err(e) => {
                    retrieval_elapsed = attempt_started.elapsed();
                    attempt += 1;
                    if attempt >= QUERY_MAX_ATTEMPTS || query.deadline.expired() {
                        warn!(error = %e, attempts = attempt, "retrieval failed, returning empty response");
                        degraded = true;
                        break;
                    }
                    let backoff = QUERY_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    std::thread::sleep(query.deadline.remaining_or(backoff).min(backoff));
                }
            }
        }

        let rerank_started = Instant::now();
        if query.rerank && !results.is_empty() {
            if !self.rerank.apply(&query.text, query.deadline, &mut results) {
                degraded = true;
            }
        }
        let rerank_elapsed = rerank_started.elapsed();

        // A degraded response reflects a transient outage; caching it
        // would pin the outage until the next generation bump.
        if !degraded {
            self.query_cache
                .lock()
                .put(key, Arc::new(results.clone()));
        }

        QueryResponse {
            results,
            degraded,
            from_cache: false,
            generation,
            timings: QueryTimings {
                retrieval: retrieval_elapsed,
                rerank: rerank_elapsed,
                total: started.elapsed(),
            },
        }
    }

    /// Start a multi-step session that never repeats a fragment.
    pub fn session(&self) -> QuerySession<'_> {
        QuerySession {
            engine: self,
            seen: FxHashSet::default(),
        }
    }

    pub fn health(&self) -> Result<HealthReport> {
        Ok(HealthReport {
            fragments: self.store.fragment_count()?,
            semantic_entries: self.semantic.len(),
            lexical_docs: self.lexical.doc_count(),
            generation: self.generation.load(Ordering::SeqCst),
            embedding_cache_hit_rate: self.embedder.hit_rate(),
            last_reindex: self.store.last_reindex()?,
        })
    }
}

/// Iterative retrieval over one engine: each step excludes fragments
/// already returned by earlier steps, so follow-up queries surface new
/// context instead of repeating the first answer.
pub struct QuerySession<'a> {
    engine: &'a RetrievalEngine,
    seen: FxHashSet<FragmentId>,
}

impl QuerySession<'_> {
    pub fn step(&mut self, mut query: RetrievalQuery) -> QueryResponse {
        let k = query.k;
        // Over-fetch to cover the exclusions, then trim.
        query.k = k + self.seen.len();
        let mut response = self.engine.query(query);
        response
            .results
            .retain(|r| !self.seen.contains(&r.fragment.id));
        response.results.truncate(k);
        for result in &response.results {
            self.seen.insert(result.fragment.id);
        }
        response
    }
}

fn rebuild_semantic(
    index: &SemanticIndex,
    store: &FragmentStore,
    embedder: &CachedEmbedder,
) {
    let fragments = match store.all_fragments() {
        Ok(fragments) => fragments,
        Err(e) => {
            warn!(error = %e, "cannot read store for semantic rebuild");
            return;
        }
    };
    if fragments.is_empty() {
        return;
    }
    info!(fragments = fragments.len(), "rebuilding semantic index from store");
    for batch in fragments.chunks(64) {
        let texts: Vec<&str> = batch.iter().map(|f| f.enriched_content.as_str()).collect();
        match embedder.embed_batch(&texts, Deadline::none()) {
            Ok(vectors) => {
                let entries: Vec<(FragmentId, Vec<f32>)> = batch
                    .iter()
                    .zip(vectors)
                    .map(|(f, v)| (f.id, v.as_ref().clone()))
                    .collect();
                if let Err(e) = index.insert(&entries) {
                    warn!(error = %e, "semantic rebuild insert failed");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "semantic rebuild embedding failed, index stays partial");
                return;
            }
        }
    }
}

/// Cache key over the full request identity plus the corpus generation.
fn cache_key(query: &RetrievalQuery, generation: u64) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = fxhash::FxHasher::default();
    normalize_query_text(&query.text).hash(&mut hasher);
    query.k.hash(&mut hasher);
    query.rerank.hash(&mut hasher);
    if let Some(kinds) = &query.filters.kinds {
        for kind in kinds {
            kind.as_str().hash(&mut hasher);
        }
    }
    query.filters.path_prefix.hash(&mut hasher);
    query.filters.exclude_deprecated.hash(&mut hasher);
    let FusionWeights { semantic, lexical } = query.weights.unwrap_or_default();
    semantic.to_bits().hash(&mut hasher);
    lexical.to_bits().hash(&mut hasher);
    generation.hash(&mut hasher);
    hasher.finish()
}

/// Case-fold and collapse whitespace so trivially different phrasings
/// share a cache entry.
fn normalize_query_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&word.to_lowercase());
    }
    out
}
