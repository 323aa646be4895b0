//! Embedding capability seam.
//!
//! The engine never talks to a model runtime directly: it depends on the
//! [`Embedder`] trait, injected at construction. The crate ships one
//! implementation, [`HashEmbedder`] (FNV-1a feature hashing over code
//! tokens), which is deterministic and good enough for tests and
//! degraded environments. Real deployments inject an ML-backed embedder
//! behind the same trait.

pub mod cache;

use thiserror::Error;

use crate::index::tokenizer::code_tokens;

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The embedding function failed and retries are exhausted.
    #[error("embedding function unavailable: {0}")]
    Unavailable(String),

    #[error("embedding deadline exceeded")]
    DeadlineExceeded,

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Injected embedding function: text in, vector out, batched.
pub trait Embedder: Send + Sync {
    /// Stable identifier, part of the persisted index compatibility key.
    fn id(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Embed a batch of texts. Must return one vector per input, in
    /// order, each of `dimension()` components.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// FNV-1a feature-hashing embedder.
///
/// Each token (whole identifiers plus their sub-tokens) is hashed into a
/// bucket; one hash bit picks the sign. The result is L2-normalized so
/// dot product equals cosine similarity.
pub struct HashEmbedder {
    dimension: usize,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];
        for token in code_tokens(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashEmbedder {
    fn id(&self) -> &str {
        "fnv-hash-256"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedder_is_deterministic() {
        let e = HashEmbedder::default();
        let a = e.embed_batch(&["fn connect_pool()"]).unwrap();
        let b = e.embed_batch(&["fn connect_pool()"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn vectors_are_unit_length() {
        let e = HashEmbedder::default();
        let v = &e.embed_batch(&["let total = count + offset;"]).unwrap()[0];
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn identical_text_beats_unrelated_text() {
        let e = HashEmbedder::default();
        let vecs = e
            .embed_batch(&[
                "fn connect_pool(timeout: u64) -> Pool",
                "fn connect_pool(timeout: u64) -> Pool",
                "completely unrelated markdown prose about gardening",
            ])
            .unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        let same = dot(&vecs[0], &vecs[1]);
        let other = dot(&vecs[0], &vecs[2]);
        assert!(same > other, "self-similarity {same} <= cross {other}");
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let e = HashEmbedder::new(16);
        let v = &e.embed_batch(&[""]).unwrap()[0];
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
