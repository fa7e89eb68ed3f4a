//! Data types for documents, chunks, metadata, and query results.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// The closed set of metadata keys a chunk may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKey {
    /// Kind of content, e.g. `faq`.
    Type,
    /// Subject area, e.g. `renegotiation`.
    Category,
    /// Where the content came from, e.g. `manual`.
    Source,
}

impl MetadataKey {
    /// All declared keys, in declaration order.
    pub const ALL: [MetadataKey; 3] = [MetadataKey::Type, MetadataKey::Category, MetadataKey::Source];

    /// The wire name of this key.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKey::Type => "type",
            MetadataKey::Category => "category",
            MetadataKey::Source => "source",
        }
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataKey {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "type" => Ok(MetadataKey::Type),
            "category" => Ok(MetadataKey::Category),
            "source" => Ok(MetadataKey::Source),
            other => Err(RagError::ConfigError(format!("unknown metadata key '{other}'"))),
        }
    }
}

/// Typed metadata attached to a document and inherited by its chunks.
pub type Metadata = BTreeMap<MetadataKey, String>;

/// Parse a raw string map into [`Metadata`], rejecting undeclared keys.
///
/// # Errors
///
/// Returns [`RagError::ConfigError`] naming every unknown key.
pub fn parse_metadata<'a, I>(raw: I) -> crate::error::Result<Metadata>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut metadata = Metadata::new();
    let mut unknown = Vec::new();
    for (key, value) in raw {
        match key.parse::<MetadataKey>() {
            Ok(key) => {
                metadata.insert(key, value.to_string());
            }
            Err(_) => unknown.push(key.to_string()),
        }
    }
    if !unknown.is_empty() {
        unknown.sort();
        return Err(RagError::ConfigError(format!(
            "unknown metadata keys: {}",
            unknown.join(", ")
        )));
    }
    Ok(metadata)
}

/// A metadata filter: a chunk matches when every pair is present and equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(Metadata);

impl MetadataFilter {
    /// Create an empty filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required key/value pair.
    pub fn with(mut self, key: MetadataKey, value: impl Into<String>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    /// Whether the filter has no constraints.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of constraints.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The required value for `key`, if constrained.
    pub fn get(&self, key: MetadataKey) -> Option<&str> {
        self.0.get(&key).map(String::as_str)
    }

    /// Whether `metadata` satisfies every constraint.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.0.iter().all(|(key, value)| metadata.get(key) == Some(value))
    }
}

impl From<Metadata> for MetadataFilter {
    fn from(metadata: Metadata) -> Self {
        Self(metadata)
    }
}

/// A source document to ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique identifier for the document (typically its path).
    pub id: String,
    /// The full text content.
    pub text: String,
    /// Metadata inherited by every chunk of this document.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    /// Create a document without metadata.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into(), metadata: Metadata::new() }
    }

    /// Attach a metadata value.
    pub fn with_metadata(mut self, key: MetadataKey, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value.into());
        self
    }
}

/// An immutable segment of a [`Document`], the unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Stable identifier: `{source_document}#{chunk_index}`.
    pub id: String,
    /// The chunk text, at most `chunk_size` characters.
    pub text: String,
    /// The ID of the parent [`Document`].
    pub source_document: String,
    /// Start position within the source, in characters.
    pub offset: usize,
    /// Metadata inherited from the parent document.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Build the stable chunk identifier for a document position.
pub fn chunk_id(document_id: &str, chunk_index: usize) -> String {
    format!("{document_id}#{chunk_index}")
}

/// A retrieved chunk paired with its distance to the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    /// The chunk identifier.
    pub chunk_id: String,
    /// The chunk text.
    pub text: String,
    /// The document this chunk came from.
    pub source_document: String,
    /// Distance to the query (smaller is more relevant).
    pub score: f32,
}

/// The ranked evidence and formatted context returned by a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    /// Ranked results, ascending distance.
    pub results: Vec<ScoredChunk>,
    /// Numbered, delimited context bounded by the configured character budget.
    pub context: String,
}

/// Ingestion state of a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    /// Ingestion was requested and has not finished.
    Pending,
    /// The document's chunks are queryable.
    Ready,
    /// Ingestion failed; see the record message.
    Error,
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Ready => "ready",
            IngestionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Per-document ingestion status owned by the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    /// The document this record tracks.
    pub document_id: String,
    /// Current status.
    pub status: IngestionStatus,
    /// Diagnostic message for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Number of chunks made queryable by the last successful ingestion.
    pub chunk_count: usize,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl IngestionRecord {
    pub(crate) fn pending(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            status: IngestionStatus::Pending,
            message: None,
            chunk_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn ready(&mut self, chunk_count: usize) {
        self.status = IngestionStatus::Ready;
        self.message = None;
        self.chunk_count = chunk_count;
        self.updated_at = Utc::now();
    }

    pub(crate) fn failed(&mut self, message: impl Into<String>) {
        self.status = IngestionStatus::Error;
        self.message = Some(message.into());
        self.updated_at = Utc::now();
    }
}
