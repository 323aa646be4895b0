//! The two retrieval indices: semantic (dense vectors, exhaustive
//! scan with SIMD dot products) and lexical (tantivy BM25 with an
//! identifier-aware tokenizer).

pub mod lexical;
pub mod semantic;
pub mod tokenizer;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("vector dimension mismatch: index is {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("lexical index error: {0}")]
    Lexical(#[from] tantivy::TantivyError),

    #[error("lexical index path error: {0}")]
    LexicalDir(#[from] tantivy::directory::error::OpenDirectoryError),
}
