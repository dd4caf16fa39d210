//! Embedding generation seam.
//!
//! Embedding is an injected capability: the engine only assumes a
//! batch-capable, deterministic `embed(texts, level)`. The shipped
//! [`HashEmbedder`] is a deterministic token-hash embedding that keeps the
//! whole engine (and its tests) hermetic; a real model client implements
//! the same trait out of crate.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::LevelDefaults;
use crate::types::{Level, Vector};

/// Errors from an embedding backend.
#[derive(Debug, Error, Diagnostic)]
pub enum EmbedError {
    /// The backend could not be reached or refused the request.
    #[error("embedding backend unavailable ({provider}): {message}")]
    #[diagnostic(
        code(carbonloom::embed::unavailable),
        help("Check the embedding service endpoint and credentials.")
    )]
    Unavailable {
        provider: &'static str,
        message: String,
    },

    /// The backend returned a different number of vectors than inputs.
    #[error("embedding backend returned {got} vectors for {expected} inputs")]
    #[diagnostic(code(carbonloom::embed::output_mismatch))]
    OutputMismatch { expected: usize, got: usize },
}

/// Batch embedding provider, one embedding space per granularity level.
///
/// Implementations must be deterministic for a fixed model version: the
/// same text at the same level always yields the same vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Vector dimension produced for `level`.
    fn dimension(&self, level: Level) -> usize;

    /// Embeds a batch of texts at one level, preserving input order.
    async fn embed(&self, texts: &[String], level: Level) -> Result<Vec<Vector>, EmbedError>;

    /// Embeds one text at one level.
    async fn embed_one(&self, text: &str, level: Level) -> Result<Vector, EmbedError> {
        let batch = [text.to_string()];
        let mut vectors = self.embed(&batch, level).await?;
        vectors.pop().ok_or(EmbedError::OutputMismatch {
            expected: 1,
            got: 0,
        })
    }

    /// Embeds a batch at every level.
    async fn embed_all_levels(
        &self,
        texts: &[String],
    ) -> Result<FxHashMap<Level, Vec<Vector>>, EmbedError> {
        let mut by_level = FxHashMap::default();
        for level in Level::ALL {
            by_level.insert(level, self.embed(texts, level).await?);
        }
        Ok(by_level)
    }
}

/// Deterministic bag-of-hashed-tokens embedder.
///
/// Each token is hashed together with the level name; the digest picks a
/// bucket and a sign, and the accumulated vector is L2-normalized. Texts
/// sharing tokens land near each other, distinct levels get distinct
/// spaces, and output never depends on process state.
///
/// # Examples
///
/// ```
/// use carbonloom::embed::{Embedder, HashEmbedder};
/// use carbonloom::types::Level;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let embedder = HashEmbedder::default();
/// let a = embedder.embed_one("scope 3 transport emissions", Level::Chunk).await.unwrap();
/// let b = embedder.embed_one("scope 3 transport emissions", Level::Chunk).await.unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), embedder.dimension(Level::Chunk));
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct HashEmbedder {
    dimensions: FxHashMap<Level, usize>,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::from_levels(&LevelDefaults::default())
    }
}

impl HashEmbedder {
    /// Builds an embedder with the dimensions configured per level.
    #[must_use]
    pub fn from_levels(levels: &LevelDefaults) -> Self {
        let mut dimensions = FxHashMap::default();
        for level in Level::ALL {
            dimensions.insert(level, levels.get(level).dimension);
        }
        Self { dimensions }
    }

    /// Overrides one level's dimension. Handy for small test spaces.
    #[must_use]
    pub fn with_dimension(mut self, level: Level, dimension: usize) -> Self {
        self.dimensions.insert(level, dimension.max(1));
        self
    }

    fn embed_text(&self, text: &str, level: Level) -> Vector {
        let dim = self.dimension(level);
        let mut vector = vec![0.0f32; dim];
        for token in tokenize(text) {
            let mut hasher = Sha256::new();
            hasher.update(level.as_str().as_bytes());
            hasher.update(b":");
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();

            let mut eight = [0u8; 8];
            eight.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(eight) % dim as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self, level: Level) -> usize {
        self.dimensions.get(&level).copied().unwrap_or(1)
    }

    async fn embed(&self, texts: &[String], level: Level) -> Result<Vec<Vector>, EmbedError> {
        Ok(texts
            .iter()
            .map(|text| self.embed_text(text, level))
            .collect())
    }
}

/// Cosine similarity of two vectors, 0.0 when either has no magnitude or
/// the dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn embeddings_are_deterministic() {
        let embedder = HashEmbedder::default().with_dimension(Level::Chunk, 32);
        let (a, b) = block_on(async {
            (
                embedder.embed_one("fleet fuel usage", Level::Chunk).await.unwrap(),
                embedder.embed_one("fleet fuel usage", Level::Chunk).await.unwrap(),
            )
        });
        assert_eq!(a, b);
    }

    #[test]
    fn embeddings_are_normalized() {
        let embedder = HashEmbedder::default().with_dimension(Level::Semantic, 16);
        let vector = block_on(async {
            embedder
                .embed_one("upstream freight emissions by rail", Level::Semantic)
                .await
                .unwrap()
        });
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn levels_produce_distinct_spaces() {
        let embedder = HashEmbedder::default()
            .with_dimension(Level::Chunk, 32)
            .with_dimension(Level::Document, 32);
        let (chunk, document) = block_on(async {
            (
                embedder.embed_one("waste disposal", Level::Chunk).await.unwrap(),
                embedder.embed_one("waste disposal", Level::Document).await.unwrap(),
            )
        });
        assert_ne!(chunk, document);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let embedder = HashEmbedder::default().with_dimension(Level::Chunk, 64);
        let (base, close, far) = block_on(async {
            (
                embedder
                    .embed_one("transport emissions report", Level::Chunk)
                    .await
                    .unwrap(),
                embedder
                    .embed_one("transport emissions summary", Level::Chunk)
                    .await
                    .unwrap(),
                embedder
                    .embed_one("quarterly payroll ledger", Level::Chunk)
                    .await
                    .unwrap(),
            )
        });
        assert!(cosine_similarity(&base, &close) > cosine_similarity(&base, &far));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::default().with_dimension(Level::Chunk, 8);
        let vector = block_on(async { embedder.embed_one("", Level::Chunk).await.unwrap() });
        assert!(vector.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
