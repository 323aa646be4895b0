//! Core retrieval entities: fragments, queries, results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identifier for a fragment.
///
/// Derived deterministically from (source path, line range, content hash),
/// so re-chunking identical content always yields the same id, and any
/// content change forces a new id. This property is what makes the
/// incremental indexer's id-set diffing correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId(pub [u8; 16]);

impl FragmentId {
    pub fn derive(source_path: &Path, line_range: (u32, u32), content_hash: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_path.to_string_lossy().as_bytes());
        hasher.update(line_range.0.to_le_bytes());
        hasher.update(line_range.1.to_le_bytes());
        hasher.update(content_hash);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// SHA256 of a fragment's raw content.
pub fn content_hash(text: &str) -> [u8; 32] {
    let digest = Sha256::digest(text.as_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash
}

/// What kind of content a fragment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    CodeUnit,
    DocSection,
    ConfigEntry,
    CommitMessage,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeUnit => "code_unit",
            Self::DocSection => "doc_section",
            Self::ConfigEntry => "config_entry",
            Self::CommitMessage => "commit_message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code_unit" => Some(Self::CodeUnit),
            "doc_section" => Some(Self::DocSection),
            "config_entry" => Some(Self::ConfigEntry),
            "commit_message" => Some(Self::CommitMessage),
            _ => None,
        }
    }
}

/// Kind-specific structure extracted by the chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuralMetadata {
    /// A syntactic unit of code (function, method, type, impl block).
    CodeUnit {
        signature: String,
        /// Attached doc/description text, if any.
        doc: Option<String>,
    },
    /// A markup section under one heading.
    DocSection { heading: String, level: u8 },
    /// A top-level key or table in a configuration file.
    ConfigEntry { key: String },
    /// A commit message (subject line kept separately).
    CommitMessage { subject: String },
}

impl StructuralMetadata {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::CodeUnit { .. } => ContentKind::CodeUnit,
            Self::DocSection { .. } => ContentKind::DocSection,
            Self::ConfigEntry { .. } => ContentKind::ConfigEntry,
            Self::CommitMessage { .. } => ContentKind::CommitMessage,
        }
    }
}

/// Optional free-form operational tags.
///
/// Well-known fields are closed; anything else goes through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_context: Option<String>,
    /// Set when the fragment documents a deprecated unit; carries the
    /// suggested replacement reference if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<Deprecation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deprecation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

impl OperationalMetadata {
    pub fn is_empty(&self) -> bool {
        self.purpose.is_none()
            && self.usage_context.is_none()
            && self.deprecated.is_none()
            && self.extra.is_empty()
    }

    pub fn is_deprecated(&self) -> bool {
        self.deprecated.is_some()
    }
}

/// The atomic retrievable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    /// Raw text of the fragment.
    pub content: String,
    /// Content prefixed with a synthesized header (signature + summary).
    /// Used only as embedding input, never shown verbatim to callers.
    pub enriched_content: String,
    pub source_path: PathBuf,
    /// 1-based inclusive line range in the source artifact.
    pub line_range: (u32, u32),
    pub structural: StructuralMetadata,
    #[serde(default, skip_serializing_if = "OperationalMetadata::is_empty")]
    pub operational: OperationalMetadata,
    pub content_hash: [u8; 32],
}

impl Fragment {
    /// Assemble a fragment, deriving `content_hash` and `id`.
    pub fn new(
        source_path: PathBuf,
        line_range: (u32, u32),
        content: String,
        enriched_content: String,
        structural: StructuralMetadata,
    ) -> Self {
        let hash = content_hash(&content);
        let id = FragmentId::derive(&source_path, line_range, &hash);
        Self {
            id,
            content,
            enriched_content,
            source_path,
            line_range,
            structural,
            operational: OperationalMetadata::default(),
            content_hash: hash,
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.structural.kind()
    }
}

/// Declared kind of a source artifact handed to the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Code(CodeLanguage),
    Markup,
    Config,
    CommitLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeLanguage {
    Rust,
    Python,
}

impl ArtifactKind {
    /// Infer the artifact kind from a path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("rs") => Some(Self::Code(CodeLanguage::Rust)),
            Some("py") => Some(Self::Code(CodeLanguage::Python)),
            Some("md") | Some("markdown") => Some(Self::Markup),
            Some("toml") => Some(Self::Config),
            _ => None,
        }
    }
}

/// A source artifact: path, raw bytes, declared kind.
#[derive(Debug, Clone)]
pub struct SourceArtifact {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub kind: ArtifactKind,
}

/// Change signal consumed from source-control integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Which index surfaced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Semantic,
    Lexical,
    Both,
}

/// Caller-facing query.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalQuery {
    pub text: String,
    pub k: usize,
    pub filters: QueryFilters,
    /// Per-query fusion weight override.
    pub weights: Option<FusionWeights>,
    pub rerank: bool,
    pub deadline: Deadline,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            filters: QueryFilters::default(),
            weights: None,
            rerank: false,
            deadline: Deadline::none(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilters {
    pub kinds: Option<Vec<ContentKind>>,
    pub path_prefix: Option<PathBuf>,
    pub exclude_deprecated: bool,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_none() && self.path_prefix.is_none() && !self.exclude_deprecated
    }

    /// Post-search predicate form of the filters.
    pub fn matches(&self, fragment: &Fragment) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&fragment.kind()) {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !fragment.source_path.starts_with(prefix) {
                return false;
            }
        }
        if self.exclude_deprecated && fragment.operational.is_deprecated() {
            return false;
        }
        true
    }
}

/// Fusion weights for combining normalized per-source scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub semantic: f32,
    pub lexical: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            semantic: 0.7,
            lexical: 0.3,
        }
    }
}

/// One ranked retrieval result.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub fragment: Fragment,
    /// Normalized relevance in [0, 1].
    pub score: f32,
    pub method: RetrievalMethod,
    /// Present only when the re-ranker ran over this result.
    pub rerank_score: Option<f32>,
}

/// An absolute wall-clock budget for an externally observable call.
///
/// `Deadline::none()` means unbounded. Expiry is observed, not enforced:
/// callers check `expired()` at suspension points and return the best
/// available partial result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(budget: Duration) -> Self {
        Self(Some(Instant::now() + budget))
    }

    pub fn expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Time left, clamped to zero. `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Smaller of `remaining()` and `cap`; `cap` when unbounded.
    pub fn remaining_or(&self, cap: Duration) -> Duration {
        self.remaining().map_or(cap, |r| r.min(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_id_is_deterministic() {
        let hash = content_hash("fn a() {}");
        let a = FragmentId::derive(Path::new("src/a.rs"), (1, 3), &hash);
        let b = FragmentId::derive(Path::new("src/a.rs"), (1, 3), &hash);
        assert_eq!(a, b);
    }

    #[test]
    fn fragment_id_changes_with_content() {
        let h1 = content_hash("fn a() {}");
        let h2 = content_hash("fn a() { todo!() }");
        let a = FragmentId::derive(Path::new("src/a.rs"), (1, 3), &h1);
        let b = FragmentId::derive(Path::new("src/a.rs"), (1, 3), &h2);
        assert_ne!(a, b);
    }

    #[test]
    fn fragment_id_changes_with_path() {
        let hash = content_hash("fn a() {}");
        let a = FragmentId::derive(Path::new("src/a.rs"), (1, 3), &hash);
        let b = FragmentId::derive(Path::new("src/b.rs"), (1, 3), &hash);
        assert_ne!(a, b);
    }

    #[test]
    fn fragment_id_hex_round_trip() {
        let hash = content_hash("x");
        let id = FragmentId::derive(Path::new("a"), (1, 1), &hash);
        assert_eq!(FragmentId::from_hex(&id.to_hex()), Some(id));
    }

    #[test]
    fn artifact_kind_from_extension() {
        assert_eq!(
            ArtifactKind::from_path(Path::new("src/lib.rs")),
            Some(ArtifactKind::Code(CodeLanguage::Rust))
        );
        assert_eq!(
            ArtifactKind::from_path(Path::new("README.md")),
            Some(ArtifactKind::Markup)
        );
        assert_eq!(
            ArtifactKind::from_path(Path::new("Cargo.toml")),
            Some(ArtifactKind::Config)
        );
        assert_eq!(ArtifactKind::from_path(Path::new("image.png")), None);
    }

    #[test]
    fn filters_match_kind_and_prefix() {
        let frag = Fragment::new(
            PathBuf::from("src/db/pool.rs"),
            (1, 4),
            "fn connect() {}".into(),
            "fn connect()\nfn connect() {}".into(),
            StructuralMetadata::CodeUnit {
                signature: "fn connect()".into(),
                doc: None,
            },
        );

        let mut filters = QueryFilters::default();
        assert!(filters.matches(&frag));

        filters.kinds = Some(vec![ContentKind::DocSection]);
        assert!(!filters.matches(&frag));

        filters.kinds = Some(vec![ContentKind::CodeUnit]);
        filters.path_prefix = Some(PathBuf::from("src/db"));
        assert!(filters.matches(&frag));

        filters.path_prefix = Some(PathBuf::from("docs"));
        assert!(!filters.matches(&frag));
    }

    #[test]
    fn exclude_deprecated_filter() {
        let mut frag = Fragment::new(
            PathBuf::from("src/old.rs"),
            (1, 2),
            "fn old() {}".into(),
            "fn old()\nfn old() {}".into(),
            StructuralMetadata::CodeUnit {
                signature: "fn old()".into(),
                doc: None,
            },
        );
        frag.operational.deprecated = Some(Deprecation {
            replacement: Some("new_fn".into()),
        });

        let filters = QueryFilters {
            exclude_deprecated: true,
            ..Default::default()
        };
        assert!(!filters.matches(&frag));
    }

    #[test]
    fn deadline_none_never_expires() {
        let d = Deadline::none();
        assert!(!d.expired());
        assert_eq!(d.remaining(), None);
        assert_eq!(
            d.remaining_or(Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn deadline_zero_budget_expires() {
        let d = Deadline::after(Duration::ZERO);
        assert!(d.expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }
}
