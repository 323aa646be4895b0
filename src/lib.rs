pub mod chunker;
pub mod config;
pub mod embed;
pub mod engine;
pub mod index;
pub mod indexer;
pub mod model;
pub mod rerank;
pub mod retrieve;
pub mod storage;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use config::EngineConfig;
use engine::RetrievalEngine;
use model::types::{ContentKind, QueryFilters, RetrievalQuery};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "rag-core",
    version,
    about = "Hybrid semantic + lexical retrieval over a source tree"
)]
pub struct Cli {
    /// Override the data directory (defaults to platform data dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build or refresh the index for a source tree
    Index {
        /// Root of the tree to index
        path: PathBuf,
    },
    /// Re-scan a tree and apply only the differences
    Reindex {
        path: PathBuf,
    },
    /// Run a query against the index
    Query {
        /// Free-text query
        text: String,

        /// Number of results
        #[arg(short, default_value_t = 10)]
        k: usize,

        /// Restrict to a content kind (code_unit, doc_section,
        /// config_entry, commit_message); repeatable
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// Restrict to fragments under this path prefix
        #[arg(long)]
        path_prefix: Option<PathBuf>,

        /// Drop deprecated fragments
        #[arg(long, default_value_t = false)]
        no_deprecated: bool,

        /// Second-pass re-ranking of the top results
        #[arg(long, default_value_t = false)]
        rerank: bool,

        /// Emit results as JSON lines
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print index health
    Status,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = EngineConfig::from_env();
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir;
    }

    match cli.command {
        Commands::Index { path } | Commands::Reindex { path } => {
            let engine = RetrievalEngine::open(cfg)?;
            let report = engine.index_directory(&path)?;
            println!(
                "indexed {} paths: +{} fragments, -{} fragments (generation {})",
                report.paths_processed,
                report.fragments_added,
                report.fragments_removed,
                report.generation
            );
            if report.embedding_failures > 0 {
                println!(
                    "warning: {} fragments are lexical-only (embedding unavailable)",
                    report.embedding_failures
                );
            }
            for (path, reason) in &report.paths_failed {
                println!("skipped {}: {reason}", path.display());
            }
            Ok(())
        }
        Commands::Query {
            text,
            k,
            kinds,
            path_prefix,
            no_deprecated,
            rerank,
            json,
        } => {
            let engine = RetrievalEngine::open(cfg)?;
            let mut query = RetrievalQuery::new(text, k);
            query.rerank = rerank;
            query.filters = QueryFilters {
                kinds: parse_kinds(&kinds)?,
                path_prefix,
                exclude_deprecated: no_deprecated,
            };

            let response = engine.query(query);
            if response.degraded {
                eprintln!("note: results are degraded (partial retrieval)");
            }
            for result in &response.results {
                if json {
                    println!("{}", serde_json::to_string(&result_json(result))?);
                } else {
                    let (start, end) = result.fragment.line_range;
                    println!(
                        "{:.3}  {}:{}-{}  [{}]",
                        result.score,
                        result.fragment.source_path.display(),
                        start,
                        end,
                        result.fragment.kind().as_str(),
                    );
                }
            }
            Ok(())
        }
        Commands::Status => {
            let engine = RetrievalEngine::open(cfg)?;
            let health = engine.health()?;
            println!("fragments:          {}", health.fragments);
            println!("semantic entries:   {}", health.semantic_entries);
            println!("lexical documents:  {}", health.lexical_docs);
            println!("generation:         {}", health.generation);
            println!(
                "embed cache hits:   {:.1}%",
                health.embedding_cache_hit_rate * 100.0
            );
            match health.last_reindex {
                Some(at) => println!("last reindex:       {}", at.to_rfc3339()),
                None => println!("last reindex:       never"),
            }
            Ok(())
        }
    }
}

fn parse_kinds(raw: &[String]) -> Result<Option<Vec<ContentKind>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut kinds = Vec::with_capacity(raw.len());
    for name in raw {
        let kind = ContentKind::parse(name)
            .with_context(|| format!("unknown content kind: {name}"))?;
        kinds.push(kind);
    }
    Ok(Some(kinds))
}

fn result_json(result: &model::types::RetrievalResult) -> serde_json::Value {
    let (start, end) = result.fragment.line_range;
    serde_json::json!({
        "id": result.fragment.id.to_hex(),
        "path": result.fragment.source_path,
        "lines": [start, end],
        "kind": result.fragment.kind().as_str(),
        "score": result.score,
        "rerank_score": result.rerank_score,
        "method": result.method,
        "content": result.fragment.content,
    })
}
