//! End-to-end engine behavior over a real corpus on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rag_core::config::EngineConfig;
use rag_core::embed::{EmbedError, Embedder};
use rag_core::engine::RetrievalEngine;
use rag_core::model::types::{ContentKind, FusionWeights, QueryFilters, RetrievalQuery};
use rag_core::rerank::TermCoverageReranker;

fn write_corpus(root: &Path) {
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(
        root.join("src/db.rs"),
        r#"/// Opens the connection pool with the given timeout.
fn connect_pool(timeout_ms: u64) -> Pool {
    Pool::with_timeout(timeout_ms)
}

/// Closes every pooled connection.
fn close_pool(pool: Pool) {
    pool.shutdown();
}

#[deprecated(note = "use connect_pool")]
fn legacy_connect() -> Pool {
    Pool::default()
}
"#,
    )
    .unwrap();
    std::fs::write(
        root.join("src/http.rs"),
        "fn serve_requests(addr: SocketAddr) {}\n\nfn shutdown_server() {}\n",
    )
    .unwrap();
    std::fs::write(
        root.join("README.md"),
        "# Guide\n\nIntroduction.\n\n## Connection pooling\n\nHow the pool reconnects after failures.\n\n## Serving\n\nRequest handling notes.\n",
    )
    .unwrap();
    std::fs::write(
        root.join("app.toml"),
        "[pool]\nmax_size = 32\n\n[server]\nport = 8080\n",
    )
    .unwrap();
}

fn engine_over(root: &Path) -> RetrievalEngine {
    let cfg = EngineConfig {
        data_dir: root.join(".rag-data"),
        embedding_dimension: 64,
        ..EngineConfig::default()
    };
    let engine = RetrievalEngine::open(cfg).unwrap();
    engine.index_directory(root).unwrap();
    engine
}

#[test]
fn exact_identifier_query_ranks_its_definition_first() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = engine_over(dir.path());

    let response = engine.query(RetrievalQuery::new("connect pool", 5));
    assert!(!response.degraded);
    let top = &response.results[0];
    assert!(top.fragment.source_path.ends_with("db.rs"));
    assert!(top.fragment.content.contains("connect_pool"));
}

#[test]
fn results_are_unique_per_fragment() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = engine_over(dir.path());

    let response = engine.query(RetrievalQuery::new("pool", 10));
    let mut ids: Vec<_> = response.results.iter().map(|r| r.fragment.id).collect();
    let before = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), before);
}

#[test]
fn kind_and_prefix_filters_are_respected() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = engine_over(dir.path());

    let mut query = RetrievalQuery::new("pool", 10);
    query.filters = QueryFilters {
        kinds: Some(vec![ContentKind::DocSection]),
        ..QueryFilters::default()
    };
    let docs_only = engine.query(query);
    assert!(!docs_only.results.is_empty());
    assert!(docs_only
        .results
        .iter()
        .all(|r| r.fragment.kind() == ContentKind::DocSection));

    let mut query = RetrievalQuery::new("pool", 10);
    query.filters = QueryFilters {
        path_prefix: Some(PathBuf::from("src")),
        ..QueryFilters::default()
    };
    let src_only = engine.query(query);
    assert!(!src_only.results.is_empty());
    assert!(src_only
        .results
        .iter()
        .all(|r| r.fragment.source_path.starts_with("src")));
}

#[test]
fn deprecated_fragments_can_be_excluded() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = engine_over(dir.path());

    let mut query = RetrievalQuery::new("legacy_connect", 10);
    query.filters.exclude_deprecated = true;
    let response = engine.query(query);
    assert!(response
        .results
        .iter()
        .all(|r| !r.fragment.operational.is_deprecated()));
}

struct OfflineEmbedder;

impl Embedder for OfflineEmbedder {
    fn id(&self) -> &str {
        "offline"
    }
    fn dimension(&self) -> usize {
        16
    }
    fn embed_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::Unavailable("model host unreachable".into()))
    }
}

#[test]
fn embedding_outage_degrades_to_lexical_but_answers() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let cfg = EngineConfig {
        data_dir: dir.path().join(".rag-data"),
        embedding_dimension: 16,
        ..EngineConfig::default()
    };
    let engine = RetrievalEngine::open_with(
        cfg,
        Arc::new(OfflineEmbedder),
        Arc::new(TermCoverageReranker),
    )
    .unwrap();
    let report = engine.index_directory(dir.path()).unwrap();
    assert!(report.embedding_failures > 0);

    let response = engine.query(RetrievalQuery::new("connect_pool", 5));
    assert!(response.degraded);
    assert!(!response.results.is_empty());
    assert!(response.results[0].fragment.content.contains("connect_pool"));
}

#[test]
fn lexical_weight_shift_respects_monotonicity() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = engine_over(dir.path());

    let rank_of_db = |lexical: f32| {
        let mut query = RetrievalQuery::new("connect_pool timeout", 10);
        query.weights = Some(FusionWeights {
            semantic: 1.0 - lexical,
            lexical,
        });
        let response = engine.query(query);
        response
            .results
            .iter()
            .position(|r| {
                r.fragment.source_path.ends_with("db.rs")
                    && r.fragment.content.contains("fn connect_pool")
            })
            .unwrap_or(usize::MAX)
    };

    assert!(rank_of_db(0.9) <= rank_of_db(0.1));
}

#[test]
fn rerank_reorders_without_changing_the_set() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = engine_over(dir.path());

    let plain = engine.query(RetrievalQuery::new("pool reconnect", 8));
    let mut reranked_query = RetrievalQuery::new("pool reconnect", 8);
    reranked_query.rerank = true;
    let reranked = engine.query(reranked_query);

    let mut plain_ids: Vec<_> = plain.results.iter().map(|r| r.fragment.id).collect();
    let mut reranked_ids: Vec<_> = reranked.results.iter().map(|r| r.fragment.id).collect();
    plain_ids.sort();
    reranked_ids.sort();
    assert_eq!(plain_ids, reranked_ids);
    assert!(reranked.results[0].rerank_score.is_some());
}

#[test]
fn tight_deadline_still_returns_a_response() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = engine_over(dir.path());

    let mut query = RetrievalQuery::new("pool", 5);
    query.deadline = rag_core::model::types::Deadline::after(std::time::Duration::from_millis(1));
    // Deadlines are observed, not enforced; the call must complete.
    let _response = engine.query(query);
}

#[test]
fn cache_round_trip_preserves_ranking() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = engine_over(dir.path());

    let first = engine.query(RetrievalQuery::new("serve requests", 5));
    let second = engine.query(RetrievalQuery::new("serve requests", 5));
    assert!(second.from_cache);
    let first_ids: Vec<_> = first.results.iter().map(|r| r.fragment.id).collect();
    let second_ids: Vec<_> = second.results.iter().map(|r| r.fragment.id).collect();
    assert_eq!(first_ids, second_ids);
}
