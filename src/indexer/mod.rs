//! Builds and incrementally maintains the fragment store and both
//! indices.
//!
//! Updates are diffed at the fragment-id level: chunking a changed file
//! yields a new id set for that path, and because ids are derived from
//! path, range and content hash, the unchanged fragments of the file
//! keep their ids. Only the difference touches the indices, so an
//! appended function re-embeds one fragment, not the file.
//!
//! A batch applies atomically with respect to queries: writes stage in
//! the lexical writer and a semantic shard swap, and become visible
//! together when the batch commits. The corpus generation counter
//! advances once per committed batch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use fxhash::FxHashSet;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunker::Chunker;
use crate::embed::cache::CachedEmbedder;
use crate::embed::EmbedError;
use crate::index::lexical::LexicalIndex;
use crate::index::semantic::SemanticIndex;
use crate::model::types::{
    ArtifactKind, ChangeKind, Deadline, Fragment, FragmentId, PathChange, SourceArtifact,
};
use crate::storage::sqlite::FragmentStore;

const EMBED_BATCH: usize = 64;

#[derive(Debug, Default)]
pub struct ReindexReport {
    pub paths_processed: usize,
    pub paths_failed: Vec<(PathBuf, String)>,
    pub fragments_added: usize,
    pub fragments_removed: usize,
    /// Fragments stored and lexically indexed but missing from the
    /// semantic index because embedding was unavailable.
    pub embedding_failures: usize,
    /// Corpus generation after this batch.
    pub generation: u64,
}

pub struct Indexer {
    chunker: Chunker,
    store: Arc<FragmentStore>,
    semantic: Arc<SemanticIndex>,
    lexical: Arc<LexicalIndex>,
    embedder: Arc<CachedEmbedder>,
    generation: Arc<AtomicU64>,
}

impl Indexer {
    pub fn new(
        chunker: Chunker,
        store: Arc<FragmentStore>,
        semantic: Arc<SemanticIndex>,
        lexical: Arc<LexicalIndex>,
        embedder: Arc<CachedEmbedder>,
        generation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            chunker,
            store,
            semantic,
            lexical,
            embedder,
            generation,
        }
    }

    /// Walk `root` and collect indexable artifacts. Hidden entries and
    /// build output directories are skipped.
    pub fn scan_directory(root: &Path) -> Result<Vec<SourceArtifact>> {
        let mut artifacts = Vec::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !(name.starts_with('.') && name.len() > 1 || name == "target" || name == "node_modules")
        });
        for entry in walker {
            let entry = entry.context("walking source tree")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(kind) = ArtifactKind::from_path(path) else {
                continue;
            };
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let rel = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            artifacts.push(SourceArtifact {
                path: rel,
                bytes,
                kind,
            });
        }
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(artifacts)
    }

    /// Index a batch of artifacts (initial build or re-index of known
    /// paths). Paths not mentioned are untouched.
    pub fn index_artifacts(&self, artifacts: &[SourceArtifact]) -> Result<ReindexReport> {
        let mut report = ReindexReport::default();

        // Chunk in parallel; failures skip the path, not the batch.
        let chunked: Vec<(PathBuf, Result<Vec<Fragment>, String>)> = artifacts
            .par_iter()
            .map(|artifact| {
                let outcome = self
                    .chunker
                    .chunk_artifact(artifact)
                    .map_err(|e| e.to_string());
                (artifact.path.clone(), outcome)
            })
            .collect();

        let mut to_add: Vec<Fragment> = Vec::new();
        let mut to_remove: Vec<FragmentId> = Vec::new();

        for (path, outcome) in chunked {
            match outcome {
                Ok(fragments) => {
                    self.diff_path(&path, fragments, &mut to_add, &mut to_remove)?;
                    report.paths_processed += 1;
                }
                Err(reason) => {
                    warn!(path = %path.display(), reason, "skipping path");
                    report.paths_failed.push((path, reason));
                }
            }
        }

        self.apply(to_add, to_remove, &mut report)?;
        Ok(report)
    }

    /// Apply watcher-style change notifications rooted at `root`. When
    /// one batch mentions a path more than once, the last change wins.
    pub fn apply_changes(&self, root: &Path, changes: &[PathChange]) -> Result<ReindexReport> {
        let mut latest: std::collections::BTreeMap<PathBuf, ChangeKind> =
            std::collections::BTreeMap::new();
        for change in changes {
            latest.insert(change.path.clone(), change.kind);
        }

        let mut artifacts = Vec::new();
        let mut deletions: Vec<PathBuf> = Vec::new();
        for (path, kind) in latest {
            let change = PathChange { path, kind };
            match change.kind {
                ChangeKind::Deleted => deletions.push(change.path.clone()),
                ChangeKind::Added | ChangeKind::Modified => {
                    let abs = root.join(&change.path);
                    let Some(kind) = ArtifactKind::from_path(&change.path) else {
                        continue;
                    };
                    match std::fs::read(&abs) {
                        Ok(bytes) => artifacts.push(SourceArtifact {
                            path: change.path.clone(),
                            bytes,
                            kind,
                        }),
                        Err(e) => {
                            // Racing deletes show up as read failures.
                            debug!(path = %abs.display(), error = %e, "treating unreadable change as deletion");
                            deletions.push(change.path.clone());
                        }
                    }
                }
            }
        }

        let mut report = ReindexReport::default();
        let mut to_add: Vec<Fragment> = Vec::new();
        let mut to_remove: Vec<FragmentId> = Vec::new();

        for path in &deletions {
            let old = self.store.ids_for_path(path)?;
            to_remove.extend(old);
            report.paths_processed += 1;
        }

        let chunked: Vec<(PathBuf, Result<Vec<Fragment>, String>)> = artifacts
            .par_iter()
            .map(|artifact| {
                let outcome = self
                    .chunker
                    .chunk_artifact(artifact)
                    .map_err(|e| e.to_string());
                (artifact.path.clone(), outcome)
            })
            .collect();
        for (path, outcome) in chunked {
            match outcome {
                Ok(fragments) => {
                    self.diff_path(&path, fragments, &mut to_add, &mut to_remove)?;
                    report.paths_processed += 1;
                }
                Err(reason) => {
                    warn!(path = %path.display(), reason, "skipping path");
                    report.paths_failed.push((path, reason));
                }
            }
        }

        self.apply(to_add, to_remove, &mut report)?;
        Ok(report)
    }

    /// Diff one path's fresh fragment set against what is stored.
    fn diff_path(
        &self,
        path: &Path,
        fragments: Vec<Fragment>,
        to_add: &mut Vec<Fragment>,
        to_remove: &mut Vec<FragmentId>,
    ) -> Result<()> {
        let old: FxHashSet<FragmentId> = self.store.ids_for_path(path)?.into_iter().collect();
        let new: FxHashSet<FragmentId> = fragments.iter().map(|f| f.id).collect();

        for id in old.difference(&new) {
            to_remove.push(*id);
        }
        let mut added = 0;
        for fragment in fragments {
            if !old.contains(&fragment.id) {
                added += 1;
                to_add.push(fragment);
            }
        }
        debug!(path = %path.display(), added, removed = old.difference(&new).count(), "diffed path");
        Ok(())
    }

    /// Commit one batch: store rows, lexical docs, semantic vectors,
    /// then advance the generation.
    fn apply(
        &self,
        to_add: Vec<Fragment>,
        to_remove: Vec<FragmentId>,
        report: &mut ReindexReport,
    ) -> Result<()> {
        report.fragments_added = to_add.len();
        report.fragments_removed = to_remove.len();

        if to_add.is_empty() && to_remove.is_empty() {
            report.generation = self.generation.load(Ordering::SeqCst);
            return Ok(());
        }

        // Embed before touching anything visible, so queries keep
        // seeing the pre-batch state for the whole (slow) embed phase.
        let mut entries: Vec<(FragmentId, Vec<f32>)> = Vec::with_capacity(to_add.len());
        for batch in to_add.chunks(EMBED_BATCH) {
            let texts: Vec<&str> = batch.iter().map(|f| f.enriched_content.as_str()).collect();
            match self.embedder.embed_batch(&texts, Deadline::none()) {
                Ok(vectors) => entries.extend(
                    batch
                        .iter()
                        .zip(vectors)
                        .map(|(f, v)| (f.id, v.as_ref().clone())),
                ),
                Err(EmbedError::Unavailable(reason)) => {
                    warn!(reason, batch = batch.len(), "embedding unavailable, fragments remain lexical-only");
                    report.embedding_failures += batch.len();
                }
                Err(e) => {
                    warn!(error = %e, batch = batch.len(), "embedding failed, fragments remain lexical-only");
                    report.embedding_failures += batch.len();
                }
            }
        }

        self.lexical.remove(&to_remove);
        self.lexical.add_fragments(&to_add)?;

        // Publication: one store transaction, one shard swap, one
        // lexical commit, back to back.
        self.store.apply_batch(&to_remove, &to_add)?;
        self.semantic.apply_batch(&to_remove, &entries)?;
        self.lexical.commit()?;
        self.store.set_last_reindex(chrono::Utc::now())?;
        report.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            added = report.fragments_added,
            removed = report.fragments_removed,
            embedding_failures = report.embedding_failures,
            generation = report.generation,
            "committed index batch"
        );
        Ok(())
    }
}
