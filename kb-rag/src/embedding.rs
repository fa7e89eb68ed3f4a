//! Embedding provider trait and the service that calls it safely.
//!
//! [`EmbeddingProvider`] abstracts over embedding backends. Callers inside the
//! crate never talk to a provider directly; they go through
//! [`EmbeddingService`], which adds a per-call timeout, sub-batching with
//! order preservation, response-shape validation, a concurrency cap for
//! ingestion, and the ingestion retry policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::config::{EmbeddingBackend, EmbeddingConfig, RagConfig};
use crate::error::{RagError, Result};
use crate::hashing::HashingEmbeddingProvider;
use crate::retry::RetryPolicy;

/// A provider that generates vector embeddings from text input.
///
/// Implementations wrap specific embedding backends (a local model, a remote
/// API) behind a unified async interface. The default
/// [`embed_batch`](EmbeddingProvider::embed_batch) implementation calls
/// [`embed`](EmbeddingProvider::embed) sequentially; backends that support
/// native batching should override it. Output order must match input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embedding vectors for a batch of text inputs, in input order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// The provider name for diagnostics.
    fn name(&self) -> &str;

    /// The model identifier; recorded alongside persisted indexes.
    fn model(&self) -> &str {
        self.name()
    }
}

/// Construct the provider described by `config`.
///
/// # Errors
///
/// Returns [`RagError::ConfigError`] if the backend is not compiled in or is
/// missing credentials.
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider {
        EmbeddingBackend::Hashing => {
            let dimensions =
                config.dimensions.unwrap_or(HashingEmbeddingProvider::DEFAULT_DIMENSIONS);
            Ok(Arc::new(HashingEmbeddingProvider::new(dimensions)?))
        }
        #[cfg(feature = "openai")]
        EmbeddingBackend::OpenAi => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                RagError::ConfigError("the openai embedding backend requires an api_key".into())
            })?;
            let mut provider = crate::openai::OpenAIEmbeddingProvider::new(api_key)
                .map_err(|e| RagError::ConfigError(e.to_string()))?
                .with_model(&config.model);
            if let Some(dimensions) = config.dimensions {
                provider = provider.with_dimensions(dimensions);
            }
            Ok(Arc::new(provider))
        }
        #[cfg(not(feature = "openai"))]
        EmbeddingBackend::OpenAi => Err(RagError::ConfigError(
            "the openai embedding backend requires the `openai` feature".into(),
        )),
    }
}

/// Guarded access to an [`EmbeddingProvider`].
///
/// - Every provider call is bounded by the configured timeout; an expired
///   call fails with [`RagError::EmbeddingError`].
/// - Document embedding is split into sub-batches of `batch_size`, retried
///   per sub-batch under the [`RetryPolicy`], and holds one semaphore permit
///   per in-flight call so at most `ingest_concurrency` calls run at once.
///   The permit is a scoped guard, released on every exit path including
///   the caller dropping the future.
/// - Query embedding makes a single attempt and never waits for a permit.
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    batch_size: usize,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl EmbeddingService {
    /// Wrap `provider` with the limits from `config`.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &RagConfig) -> Self {
        Self {
            provider,
            timeout: config.embedding.timeout,
            batch_size: config.embedding.batch_size.max(1),
            retry: config.retry.clone(),
            permits: Arc::new(Semaphore::new(config.ingest_concurrency.max(1))),
        }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// `{provider}/{model}`, the identity recorded in persisted manifests.
    pub fn model_id(&self) -> String {
        format!("{}/{}", self.provider.name(), self.provider.model())
    }

    /// Number of ingestion permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Embed a query: one attempt, bounded by the timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::EmbeddingError`] on backend failure or timeout.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.call(&[text]).await?;
        vectors.pop().ok_or_else(|| RagError::embedding(self.provider.name(), "empty response"))
    }

    /// Embed document chunks in sub-batches, retrying transient failures.
    ///
    /// The returned vectors are in input order.
    ///
    /// # Errors
    ///
    /// Returns the last [`RagError::EmbeddingError`] once the retry budget of
    /// a sub-batch is exhausted.
    pub async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = self
                .retry
                .retry("embed_batch", || async move {
                    let _permit = self.permits.acquire().await.map_err(|_| {
                        RagError::PipelineError("embedding service is closed".to_string())
                    })?;
                    self.call(batch).await
                })
                .await?;
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    /// Stop handing out ingestion permits; pending document embeddings fail.
    pub fn close(&self) {
        self.permits.close();
    }

    async fn call(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let provider = self.provider.name();
        debug!(provider, batch_size = texts.len(), "embedding batch");

        let vectors = tokio::time::timeout(self.timeout, self.provider.embed_batch(texts))
            .await
            .map_err(|_| {
                error!(provider, timeout_ms = self.timeout.as_millis() as u64, "embedding timed out");
                RagError::embedding(
                    provider,
                    format!("timed out after {} ms", self.timeout.as_millis()),
                )
            })??;

        validate_shape(provider, texts.len(), &vectors)?;
        Ok(vectors)
    }
}

/// A malformed response is a provider failure, not a caller error.
fn validate_shape(provider: &str, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        return Err(RagError::embedding(
            provider,
            format!("expected {expected} vectors, got {}", vectors.len()),
        ));
    }
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    let dim = first.len();
    if dim == 0 {
        return Err(RagError::embedding(provider, "returned an empty vector"));
    }
    for vector in vectors {
        if vector.len() != dim {
            return Err(RagError::embedding(
                provider,
                format!("inconsistent vector lengths {dim} and {}", vector.len()),
            ));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(RagError::embedding(provider, "returned non-finite values"));
        }
    }
    Ok(())
}
