//! Retrieval core for knowledge bases.
//!
//! This crate provides:
//! - Character-based document chunking ([`FixedSizeChunker`], [`ParagraphChunker`])
//! - Embedding providers behind one trait, with timeout, retry and a
//!   concurrency cap ([`EmbeddingService`])
//! - An exact flat vector index with deterministic ordering ([`VectorIndex`])
//! - Atomic, checksummed persistence of the index and its chunk manifest
//! - A [`KnowledgeBase`] that ingests documents all-or-nothing and swaps
//!   whole snapshots, and a [`QueryEngine`] that returns filtered, ranked
//!   chunks with bounded context
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kb_rag::{Document, HashingEmbeddingProvider, KnowledgeBase, MetadataKey, QueryEngine, RagConfig};
//!
//! let kb = Arc::new(KnowledgeBase::new(
//!     RagConfig::default(),
//!     Arc::new(HashingEmbeddingProvider::default()),
//! )?);
//! kb.open(&[]).await?;
//! kb.ingest(&Document::new("faq.txt", text).with_metadata(MetadataKey::Type, "faq")).await?;
//!
//! let engine = QueryEngine::new(kb.clone());
//! let response = engine.query("can I pay in installments?", 3, None).await?;
//! println!("{}", response.context);
//! ```
//!
//! # Features
//!
//! - `openai`: [`openai::OpenAIEmbeddingProvider`] using `reqwest`
//! - `full`: everything

pub mod chunking;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod hashing;
pub mod index;
pub mod knowledge;
#[cfg(feature = "openai")]
pub mod openai;
pub mod persistence;
pub mod query;
pub mod retry;
pub mod session;

pub use chunking::{ChunkSpan, Chunker, FixedSizeChunker, ParagraphChunker, chunk_text};
pub use config::{EmbeddingBackend, EmbeddingConfig, RagConfig, RagConfigBuilder};
pub use document::{
    Chunk, Document, IngestionRecord, IngestionStatus, Metadata, MetadataFilter, MetadataKey,
    QueryResponse, ScoredChunk, parse_metadata,
};
pub use embedding::{EmbeddingProvider, EmbeddingService, provider_from_config};
pub use error::{RagError, Result};
pub use hashing::HashingEmbeddingProvider;
pub use index::{DistanceMetric, Neighbor, VectorIndex};
pub use knowledge::{FilterValidation, KnowledgeBase, Snapshot};
#[cfg(feature = "openai")]
pub use openai::OpenAIEmbeddingProvider;
pub use persistence::Manifest;
pub use query::{QueryEngine, format_context};
pub use retry::RetryPolicy;
pub use session::{GateDecision, HistoryReader, InputGate, SessionContext, SessionRetriever};
