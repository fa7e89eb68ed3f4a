//! Configuration for the knowledge base.
//!
//! A [`RagConfig`] can be built in code with [`RagConfig::builder()`] or
//! parsed from TOML with [`RagConfig::from_toml_str`] / [`RagConfig::from_file`].
//! Every constructor validates the result.
//!
//! ```toml
//! chunk_size = 1000
//! chunk_overlap = 100
//! top_k = 5
//! max_context_chars = 4000
//! distance_metric = "squared_l2"
//! index_path = "data/kb_index.bin"
//! manifest_path = "data/kb_manifest.json"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! timeout_ms = 30000
//!
//! [retry]
//! max_attempts = 4
//! base_delay_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunking::validate_window;
use crate::error::{RagError, Result};
use crate::index::DistanceMetric;
use crate::retry::RetryPolicy;

/// The embedding backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Local feature-hashing embeddings; no network, no credentials.
    Hashing,
    /// The OpenAI embeddings API (requires the `openai` feature).
    #[serde(rename = "openai")]
    OpenAi,
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Which backend to use.
    pub provider: EmbeddingBackend,
    /// Backend model identifier.
    pub model: String,
    /// Credentials for remote backends. Never serialized.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Output dimension override; the backend default when unset.
    pub dimensions: Option<usize>,
    /// Per-call timeout.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Maximum number of texts sent to the backend in one call.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::OpenAi,
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            dimensions: None,
            timeout: Duration::from_secs(30),
            batch_size: 64,
        }
    }
}

/// Configuration parameters for the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Number of overlapping characters between consecutive chunks.
    pub chunk_overlap: usize,
    /// Default number of results returned by a query.
    pub top_k: usize,
    /// Maximum total characters of formatted query context.
    pub max_context_chars: usize,
    /// Distance metric, fixed for the lifetime of an index.
    pub distance_metric: DistanceMetric,
    /// Where the binary vector index is persisted.
    pub index_path: PathBuf,
    /// Where the chunk manifest is persisted.
    pub manifest_path: PathBuf,
    /// Maximum number of documents embedded concurrently during batch ingestion.
    pub ingest_concurrency: usize,
    /// Embedding provider settings.
    pub embedding: EmbeddingConfig,
    /// Retry policy for embedding calls during ingestion.
    pub retry: RetryPolicy,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
            top_k: 5,
            max_context_chars: 4000,
            distance_metric: DistanceMetric::SquaredL2,
            index_path: PathBuf::from("kb_index.bin"),
            manifest_path: PathBuf::from("kb_manifest.json"),
            ingest_concurrency: 4,
            embedding: EmbeddingConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }

    /// Parse and validate a TOML document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] on malformed TOML or invalid values.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: RagConfig = toml::from_str(source)
            .map_err(|e| RagError::ConfigError(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            RagError::ConfigError(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Check that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if:
    /// - `chunk_size == 0` or `chunk_overlap >= chunk_size`
    /// - `top_k`, `max_context_chars`, or `ingest_concurrency` is zero
    /// - the embedding timeout or batch size is zero
    /// - `retry.max_attempts == 0`
    pub fn validate(&self) -> Result<()> {
        validate_window(self.chunk_size, self.chunk_overlap)?;
        if self.top_k == 0 {
            return Err(RagError::ConfigError("top_k must be greater than zero".to_string()));
        }
        if self.max_context_chars == 0 {
            return Err(RagError::ConfigError(
                "max_context_chars must be greater than zero".to_string(),
            ));
        }
        if self.ingest_concurrency == 0 {
            return Err(RagError::ConfigError(
                "ingest_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.embedding.timeout.is_zero() {
            return Err(RagError::ConfigError("embedding timeout must be non-zero".to_string()));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::ConfigError(
                "embedding batch_size must be greater than zero".to_string(),
            ));
        }
        if self.embedding.dimensions == Some(0) {
            return Err(RagError::ConfigError(
                "embedding dimensions must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RagError::ConfigError(
                "retry max_attempts must be at least one".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Set the maximum chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in characters.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the default number of query results.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set the formatted context budget in characters.
    pub fn max_context_chars(mut self, chars: usize) -> Self {
        self.config.max_context_chars = chars;
        self
    }

    /// Set the distance metric.
    pub fn distance_metric(mut self, metric: DistanceMetric) -> Self {
        self.config.distance_metric = metric;
        self
    }

    /// Set both persistence paths.
    pub fn persistence_paths(
        mut self,
        index_path: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
    ) -> Self {
        self.config.index_path = index_path.into();
        self.config.manifest_path = manifest_path.into();
        self
    }

    /// Set the batch ingestion concurrency cap.
    pub fn ingest_concurrency(mut self, concurrency: usize) -> Self {
        self.config.ingest_concurrency = concurrency;
        self
    }

    /// Set the embedding provider settings.
    pub fn embedding(mut self, embedding: EmbeddingConfig) -> Self {
        self.config.embedding = embedding;
        self
    }

    /// Set the per-call embedding timeout.
    pub fn embedding_timeout(mut self, timeout: Duration) -> Self {
        self.config.embedding.timeout = timeout;
        self
    }

    /// Set the embedding sub-batch size.
    pub fn embedding_batch_size(mut self, batch_size: usize) -> Self {
        self.config.embedding.batch_size = batch_size;
        self
    }

    /// Set the ingestion retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// See [`RagConfig::validate`].
    pub fn build(self) -> Result<RagConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serialize a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
