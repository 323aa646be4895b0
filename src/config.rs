//! Engine configuration.
//!
//! Defaults work out of the box; every knob can be overridden through
//! `RAG_*` environment variables (read via dotenvy, so a `.env` file
//! works too). Paths for the store and indices all hang off `data_dir`.

use std::path::PathBuf;
use std::time::Duration;

use crate::chunker::ChunkerConfig;
use crate::model::types::FusionWeights;
use crate::rerank::RerankConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub embedding_dimension: usize,
    pub weights: FusionWeights,
    pub rerank: RerankConfig,
    pub chunker: ChunkerConfig,
    /// Capacity of the per-generation query result cache.
    pub query_cache_capacity: usize,
    /// Default per-query wall-clock budget. Zero means unbounded.
    pub query_budget: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedding_dimension: 256,
            weights: FusionWeights::default(),
            rerank: RerankConfig::default(),
            chunker: ChunkerConfig::default(),
            query_cache_capacity: 512,
            query_budget: Duration::ZERO,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `RAG_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = dotenvy::var("RAG_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(dim) = env_parse::<usize>("RAG_EMBED_DIM") {
            cfg.embedding_dimension = dim;
        }
        if let Some(semantic) = env_parse::<f32>("RAG_SEMANTIC_WEIGHT") {
            cfg.weights.semantic = semantic;
        }
        if let Some(lexical) = env_parse::<f32>("RAG_LEXICAL_WEIGHT") {
            cfg.weights.lexical = lexical;
        }
        if let Some(window) = env_parse::<usize>("RAG_RERANK_WINDOW") {
            cfg.rerank.window = window;
        }
        if let Some(cap) = env_parse::<usize>("RAG_QUERY_CACHE") {
            cfg.query_cache_capacity = cap;
        }
        if let Some(ms) = env_parse::<u64>("RAG_QUERY_BUDGET_MS") {
            cfg.query_budget = Duration::from_millis(ms);
        }
        cfg
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("fragments.db")
    }

    pub fn semantic_index_path(&self) -> PathBuf {
        self.data_dir.join("semantic.rfvi")
    }

    pub fn lexical_index_dir(&self) -> PathBuf {
        self.data_dir.join("lexical")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    dotenvy::var(key).ok()?.parse().ok()
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "rag-core")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".rag-core"))
}
