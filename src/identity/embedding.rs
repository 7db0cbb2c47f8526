//! Face embedding vectors and similarity scoring.

use ndarray::ArrayView1;
use thiserror::Error;

/// Dimension of the ArcFace embeddings produced by the extractor.
pub const EMBEDDING_DIM: usize = 512;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {expected} dimensions, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("embedding has zero norm")]
    ZeroNorm,
    #[error("embedding blob length {0} is not a multiple of 4")]
    Truncated(usize),
}

/// An L2-normalized feature vector.
///
/// Construction always normalizes, so cosine similarity between two
/// embeddings reduces to a dot product.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Validate and normalize a freshly extracted vector.
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::Dimension {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        normalize(values).map(Self)
    }

    /// Decode a stored little-endian f32 blob.
    ///
    /// Stored vectors are not held to the current model dimension; a
    /// mismatched vector simply never matches.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::Truncated(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        normalize(values).map(Self)
    }

    /// Encode for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 4);
        for &val in &self.0 {
            bytes.extend_from_slice(&val.to_le_bytes());
        }
        bytes
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cosine similarity in [-1, 1]; 0.0 when dimensions differ.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.0, &other.0)
    }
}

/// Dot product of two unit vectors
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    ArrayView1::from(a).dot(&ArrayView1::from(b))
}

fn normalize(mut values: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(EmbeddingError::NonFinite);
    }
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return Err(EmbeddingError::ZeroNorm);
    }
    for v in values.iter_mut() {
        *v /= norm;
    }
    Ok(values)
}
