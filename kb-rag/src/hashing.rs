//! Local feature-hashing embedding provider.
//!
//! [`HashingEmbeddingProvider`] needs no model files, network, or
//! credentials. Each lowercase word token is hashed (64-bit FNV-1a) into one
//! of `dimensions` buckets with a hash-derived sign, and the resulting vector
//! is L2-normalized. Texts that share vocabulary land close together, which
//! is enough for lexical retrieval, offline operation, and tests.

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// A deterministic bag-of-words embedding provider.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    dimensions: usize,
}

impl HashingEmbeddingProvider {
    /// The default output dimension.
    pub const DEFAULT_DIMENSIONS: usize = 384;

    /// Create a provider producing `dimensions`-long vectors.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `dimensions == 0`.
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(RagError::ConfigError("dimensions must be greater than zero".into()));
        }
        Ok(Self { dimensions })
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashingEmbeddingProvider {
    fn default() -> Self {
        Self { dimensions: Self::DEFAULT_DIMENSIONS }
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        "fnv1a-bow-v1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l2(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
    }

    #[tokio::test]
    async fn embeddings_are_deterministic_and_normalized() {
        let provider = HashingEmbeddingProvider::new(64).unwrap();
        let a = provider.embed("Contact the creditor first.").await.unwrap();
        let b = provider.embed("contact THE creditor, first").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_vocabulary_is_closer() {
        let provider = HashingEmbeddingProvider::default();
        let query = provider.embed("can I pay in installments").await.unwrap();
        let related = provider.embed("Pay in installments.").await.unwrap();
        let unrelated = provider.embed("File a complaint with the regulator.").await.unwrap();

        assert!(l2(&query, &related) < l2(&query, &unrelated));
    }

    #[tokio::test]
    async fn text_without_tokens_is_the_zero_vector() {
        let provider = HashingEmbeddingProvider::new(8).unwrap();
        assert_eq!(provider.embed("  ...  ").await.unwrap(), vec![0.0; 8]);
    }

    #[tokio::test]
    async fn batch_matches_single_calls() {
        let provider = HashingEmbeddingProvider::new(16).unwrap();
        let batch = provider.embed_batch(&["one", "two"]).await.unwrap();
        assert_eq!(batch[0], provider.embed("one").await.unwrap());
        assert_eq!(batch[1], provider.embed("two").await.unwrap());
    }

    #[test]
    fn zero_dimensions_is_rejected() {
        assert!(HashingEmbeddingProvider::new(0).is_err());
    }
}
