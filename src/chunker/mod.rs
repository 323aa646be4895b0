//! Structure-aware chunking of source artifacts into fragments.
//!
//! Each artifact kind has its own splitter:
//!
//! - **[`code`]**: syntactic units via tree-sitter (functions, types,
//!   impl blocks; large impls split per method).
//! - **[`markup`]**: heading-bounded sections.
//! - **[`config`]**: top-level key/table entries (nested tables stay with
//!   their top-level key).
//! - Commit logs: one fragment per commit message.
//!
//! The contract for every splitter: fragments are emitted in source
//! order, line ranges never overlap, and gaps between consecutive
//! fragments never exceed the configured tolerance (whitespace-only gaps
//! are always allowed). Re-chunking unchanged content produces
//! byte-identical fragments and ids.

pub mod code;
pub mod config;
pub mod markup;

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use crate::model::types::{
    ArtifactKind, Fragment, SourceArtifact, StructuralMetadata,
};

/// Per-artifact chunking failure. Never fatal to a batch.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("artifact {path} is not valid UTF-8")]
    InvalidUtf8 { path: PathBuf },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// An artifact the batch skipped, with the reason.
#[derive(Debug)]
pub struct SkippedArtifact {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of chunking a batch of artifacts.
#[derive(Debug, Default)]
pub struct ChunkReport {
    pub fragments: Vec<Fragment>,
    pub skipped: Vec<SkippedArtifact>,
}

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Maximum non-whitespace gap, in lines, tolerated between
    /// consecutive fragments of one artifact.
    pub gap_tolerance_lines: u32,
    /// Impl/class bodies longer than this are split per method.
    pub unit_split_lines: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            gap_tolerance_lines: 3,
            unit_split_lines: 60,
        }
    }
}

pub struct Chunker {
    cfg: ChunkerConfig,
}

impl Chunker {
    pub fn new(cfg: ChunkerConfig) -> Self {
        Self { cfg }
    }

    /// Chunk one artifact into an ordered fragment sequence.
    ///
    /// An empty artifact yields an empty vec, not an error.
    pub fn chunk_artifact(&self, artifact: &SourceArtifact) -> Result<Vec<Fragment>, ChunkError> {
        let text = std::str::from_utf8(&artifact.bytes).map_err(|_| ChunkError::InvalidUtf8 {
            path: artifact.path.clone(),
        })?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let fragments = match artifact.kind {
            ArtifactKind::Code(language) => {
                code::chunk_code(&artifact.path, text, language, &self.cfg)?
            }
            ArtifactKind::Markup => markup::chunk_markup(&artifact.path, text),
            ArtifactKind::Config => config::chunk_config(&artifact.path, text)?,
            ArtifactKind::CommitLog => chunk_commit_log(&artifact.path, text),
        };

        debug!(
            path = %artifact.path.display(),
            fragments = fragments.len(),
            "chunked artifact"
        );
        Ok(fragments)
    }

    /// Chunk a batch, isolating per-artifact failures.
    pub fn chunk_batch(&self, artifacts: &[SourceArtifact]) -> ChunkReport {
        let mut report = ChunkReport::default();
        for artifact in artifacts {
            match self.chunk_artifact(artifact) {
                Ok(fragments) => report.fragments.extend(fragments),
                Err(e) => {
                    warn!(path = %artifact.path.display(), error = %e, "skipping artifact");
                    report.skipped.push(SkippedArtifact {
                        path: artifact.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

/// Synthesize embedding input: header (signature/heading + summary) then
/// the raw content. The header comes first on purpose: raw code alone
/// under-specifies intent for embedding.
pub(crate) fn enrich(header: &str, doc: Option<&str>, content: &str) -> String {
    let mut out = String::with_capacity(header.len() + content.len() + 64);
    out.push_str(header.trim());
    if let Some(doc) = doc {
        let doc = doc.trim();
        if !doc.is_empty() {
            out.push('\n');
            out.push_str(doc);
        }
    }
    out.push_str("\n\n");
    out.push_str(content);
    out
}

/// Split a git-log style text into one fragment per commit message.
///
/// Boundaries are lines starting with `commit `; input without any such
/// line is treated as a single message.
fn chunk_commit_log(path: &std::path::Path, text: &str) -> Vec<Fragment> {
    use itertools::Itertools;

    let lines: Vec<&str> = text.lines().collect();
    let mut starts: Vec<usize> = lines
        .iter()
        .positions(|l| l.starts_with("commit "))
        .collect();
    if starts.is_empty() {
        starts.push(0);
    }

    let mut fragments = Vec::new();
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(lines.len());
        let body = lines[start..end].join("\n");
        if body.trim().is_empty() {
            continue;
        }
        let subject = lines[start..end]
            .iter()
            .map(|l| l.trim())
            .find(|l| {
                !l.is_empty()
                    && !l.starts_with("commit ")
                    && !l.starts_with("Author:")
                    && !l.starts_with("Date:")
                    && !l.starts_with("Merge:")
            })
            .unwrap_or("")
            .to_string();
        fragments.push(Fragment::new(
            path.to_path_buf(),
            (start as u32 + 1, end as u32),
            body.clone(),
            enrich(&subject, None, &body),
            StructuralMetadata::CommitMessage { subject },
        ));
    }
    fragments
}

/// Check the coverage contract over one artifact's fragments: in-order,
/// non-overlapping ranges with gaps no larger than `tolerance` lines
/// unless the gap is whitespace-only.
#[cfg(test)]
pub(crate) fn verify_coverage(text: &str, fragments: &[Fragment], tolerance: u32) {
    let lines: Vec<&str> = text.lines().collect();
    let mut prev_end = 0u32;
    for frag in fragments {
        let (start, end) = frag.line_range;
        assert!(start >= 1 && end >= start, "bad range {start}..{end}");
        assert!(start > prev_end, "overlap at line {start}");
        let gap_lines = &lines[prev_end as usize..(start - 1) as usize];
        let non_ws = gap_lines.iter().filter(|l| !l.trim().is_empty()).count();
        assert!(
            non_ws as u32 <= tolerance,
            "gap of {non_ws} non-empty lines before line {start}"
        );
        prev_end = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn artifact(path: &str, kind: ArtifactKind, text: &str) -> SourceArtifact {
        SourceArtifact {
            path: PathBuf::from(path),
            bytes: text.as_bytes().to_vec(),
            kind,
        }
    }

    #[test]
    fn empty_artifact_is_a_noop() {
        let chunker = Chunker::new(ChunkerConfig::default());
        let a = artifact("empty.md", ArtifactKind::Markup, "   \n\n");
        assert!(chunker.chunk_artifact(&a).unwrap().is_empty());
    }

    #[test]
    fn invalid_utf8_is_reported_not_fatal() {
        let chunker = Chunker::new(ChunkerConfig::default());
        let bad = SourceArtifact {
            path: PathBuf::from("bad.md"),
            bytes: vec![0xff, 0xfe, 0x00],
            kind: ArtifactKind::Markup,
        };
        let good = artifact("good.md", ArtifactKind::Markup, "# Title\n\nbody\n");
        let report = chunker.chunk_batch(&[bad, good]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].path, PathBuf::from("bad.md"));
        assert!(!report.fragments.is_empty());
    }

    #[test]
    fn rechunking_is_deterministic() {
        let chunker = Chunker::new(ChunkerConfig::default());
        let a = artifact(
            "lib.rs",
            ArtifactKind::Code(crate::model::types::CodeLanguage::Rust),
            "/// Connects.\nfn connect_pool() {}\n\nfn other() {}\n",
        );
        let first = chunker.chunk_artifact(&a).unwrap();
        let second = chunker.chunk_artifact(&a).unwrap();
        assert_eq!(first, second);
        let ids: Vec<_> = first.iter().map(|f| f.id).collect();
        let ids2: Vec<_> = second.iter().map(|f| f.id).collect();
        assert_eq!(ids, ids2);
    }

    #[test]
    fn commit_log_splits_per_commit() {
        let log = "commit abc123\nAuthor: a\nDate: d\n\n    Fix pool leak\n\ncommit def456\nAuthor: b\nDate: d\n\n    Add retry logic\n";
        let frags = chunk_commit_log(Path::new("HEAD.log"), log);
        assert_eq!(frags.len(), 2);
        assert_eq!(
            frags[0].structural,
            StructuralMetadata::CommitMessage {
                subject: "Fix pool leak".into()
            }
        );
        assert!(frags[1].content.contains("Add retry logic"));
    }

    #[test]
    fn commit_log_without_markers_is_one_message() {
        let frags = chunk_commit_log(Path::new("msg"), "Fix everything\n\nLonger body.\n");
        assert_eq!(frags.len(), 1);
        assert_eq!(
            frags[0].structural,
            StructuralMetadata::CommitMessage {
                subject: "Fix everything".into()
            }
        );
    }
}
