//! Document chunking strategies.
//!
//! This module provides [`chunk_text`], the fixed-window splitter every
//! strategy builds on, the [`Chunker`] trait, and two implementations:
//!
//! - [`FixedSizeChunker`]: overlapping windows of `chunk_size` characters
//! - [`ParagraphChunker`]: one chunk per blank-line separated paragraph,
//!   falling back to fixed windows for oversized paragraphs
//!
//! All sizes and offsets are measured in characters (Unicode scalar values),
//! never bytes, so multi-byte text is never split inside a character.

use crate::document::{Chunk, Document, chunk_id};
use crate::error::{RagError, Result};

/// A chunk candidate: its text and start position in the source, in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// The window text.
    pub text: String,
    /// Start position within the source, in characters.
    pub offset: usize,
}

/// Check that `0 <= overlap < chunk_size`.
///
/// # Errors
///
/// Returns [`RagError::ConfigError`] otherwise.
pub fn validate_window(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(RagError::ConfigError("chunk_size must be greater than zero".to_string()));
    }
    if overlap >= chunk_size {
        return Err(RagError::ConfigError(format!(
            "chunk_overlap ({overlap}) must be less than chunk_size ({chunk_size})"
        )));
    }
    Ok(())
}

/// Split `text` into windows of `chunk_size` characters, advancing by
/// `chunk_size - overlap` characters per step.
///
/// Text no longer than `chunk_size` (including empty text) yields exactly one
/// span equal to the full text. The final window may be shorter than
/// `chunk_size`; it is kept as is.
///
/// # Errors
///
/// Returns [`RagError::ConfigError`] unless `0 <= overlap < chunk_size`.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<ChunkSpan>> {
    validate_window(chunk_size, overlap)?;
    Ok(windows(text, chunk_size, overlap))
}

fn windows(text: &str, chunk_size: usize, overlap: usize) -> Vec<ChunkSpan> {
    // Byte position of every character start, plus the end of the text.
    let boundaries: Vec<usize> =
        text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len())).collect();
    let char_count = boundaries.len() - 1;

    if char_count <= chunk_size {
        return vec![ChunkSpan { text: text.to_string(), offset: 0 }];
    }

    let step = chunk_size - overlap;
    let mut spans = Vec::with_capacity(char_count.div_ceil(step));
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(char_count);
        spans.push(ChunkSpan {
            text: text[boundaries[start]..boundaries[end]].to_string(),
            offset: start,
        });
        if end == char_count {
            break;
        }
        start += step;
    }
    spans
}

/// A strategy for splitting documents into chunks.
///
/// Implementations produce [`Chunk`]s carrying the parent document's
/// metadata. Embeddings are computed later by the knowledge base.
pub trait Chunker: Send + Sync {
    /// Split a document into chunks, in source order.
    fn chunk(&self, document: &Document) -> Vec<Chunk>;

    /// The maximum chunk length in characters.
    fn chunk_size(&self) -> usize;
}

fn to_chunks(document: &Document, spans: impl IntoIterator<Item = ChunkSpan>) -> Vec<Chunk> {
    spans
        .into_iter()
        .enumerate()
        .map(|(i, span)| Chunk {
            id: chunk_id(&document.id, i),
            text: span.text,
            source_document: document.id.clone(),
            offset: span.offset,
            metadata: document.metadata.clone(),
        })
        .collect()
}

/// Splits text into fixed-size overlapping windows.
///
/// # Example
///
/// ```rust
/// use kb_rag::{Chunker, Document, FixedSizeChunker};
///
/// let chunker = FixedSizeChunker::new(1000, 100)?;
/// let chunks = chunker.chunk(&Document::new("faq.txt", "a".repeat(2500)));
/// assert_eq!(chunks.len(), 3);
/// # Ok::<(), kb_rag::RagError>(())
/// ```
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl FixedSizeChunker {
    /// Create a new `FixedSizeChunker`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] unless `0 <= chunk_overlap < chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        validate_window(chunk_size, chunk_overlap)?;
        Ok(Self { chunk_size, chunk_overlap })
    }
}

impl Chunker for FixedSizeChunker {
    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        to_chunks(document, windows(&document.text, self.chunk_size, self.chunk_overlap))
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Splits text on blank lines, keeping each paragraph as one chunk.
///
/// Whitespace-only paragraphs are skipped. A paragraph longer than
/// `chunk_size` is split into overlapping fixed windows. Offsets point at
/// the first non-whitespace character of each piece in the original text.
#[derive(Debug, Clone)]
pub struct ParagraphChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ParagraphChunker {
    /// Create a new `ParagraphChunker`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] unless `0 <= chunk_overlap < chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        validate_window(chunk_size, chunk_overlap)?;
        Ok(Self { chunk_size, chunk_overlap })
    }
}

/// Non-blank paragraphs with their character offsets.
fn paragraphs(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut char_start = 0;
    for piece in text.split("\n\n") {
        let trimmed_start = piece.trim_start();
        let trimmed = trimmed_start.trim_end();
        if !trimmed.is_empty() {
            let leading = &piece[..piece.len() - trimmed_start.len()];
            out.push((char_start + leading.chars().count(), trimmed));
        }
        char_start += piece.chars().count() + 2;
    }
    out
}

impl Chunker for ParagraphChunker {
    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let spans = paragraphs(&document.text).into_iter().flat_map(|(offset, paragraph)| {
            windows(paragraph, self.chunk_size, self.chunk_overlap)
                .into_iter()
                .map(move |span| ChunkSpan { text: span.text, offset: offset + span.offset })
        });
        to_chunks(document, spans)
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
