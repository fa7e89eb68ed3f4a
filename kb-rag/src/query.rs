//! Query engine: embed, search, filter, and format bounded context.

use std::sync::Arc;

use tracing::{error, info};

use crate::document::{MetadataFilter, QueryResponse, ScoredChunk};
use crate::error::{RagError, Result};
use crate::knowledge::KnowledgeBase;

/// Answers similarity queries against a [`KnowledgeBase`].
///
/// Each query reads a single snapshot from start to finish, so results are
/// consistent even while ingestion swaps in new snapshots.
#[derive(Clone)]
pub struct QueryEngine {
    knowledge: Arc<KnowledgeBase>,
}

impl QueryEngine {
    /// Create a query engine over `knowledge`.
    pub fn new(knowledge: Arc<KnowledgeBase>) -> Self {
        Self { knowledge }
    }

    /// The knowledge base being queried.
    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    /// The `top_k` closest chunks matching `filter`, with formatted context.
    ///
    /// Chunks rejected by the filter never take a result slot. No matching
    /// chunk yields an empty response, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidQuery`] for `top_k == 0` or blank text
    /// (before anything is embedded), and [`RagError::EmbeddingError`] if the
    /// query cannot be embedded in time.
    pub async fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<QueryResponse> {
        if top_k == 0 {
            return Err(RagError::InvalidQuery("top_k must be greater than zero".to_string()));
        }
        if text.trim().is_empty() {
            return Err(RagError::InvalidQuery("query text must not be empty".to_string()));
        }

        let snapshot = self.knowledge.snapshot().await;
        if snapshot.is_empty() {
            info!(result_count = 0, "query completed (empty index)");
            return Ok(QueryResponse::default());
        }

        let vector = self.knowledge.embedder().embed_query(text).await.map_err(|e| {
            error!(error = %e, "embedding failed during query");
            e
        })?;

        let chunks = &snapshot.manifest().chunks;
        let filter = filter.filter(|f| !f.is_empty());
        let hits = snapshot.index().search_filtered(&vector, top_k, |position| {
            filter.is_none_or(|f| f.matches(&chunks[position].metadata))
        })?;

        let results: Vec<ScoredChunk> = hits
            .into_iter()
            .map(|hit| {
                let chunk = &chunks[hit.position];
                ScoredChunk {
                    chunk_id: hit.id,
                    text: chunk.text.clone(),
                    source_document: chunk.source_document.clone(),
                    score: hit.distance,
                }
            })
            .collect();

        let context = format_context(&results, self.knowledge.config().max_context_chars);
        info!(result_count = results.len(), generation = snapshot.generation(), "query completed");
        Ok(QueryResponse { results, context })
    }

    /// [`query`](Self::query) with an untyped filter map.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidQuery`] naming any undeclared filter keys.
    pub async fn query_raw<I, K, V>(&self, text: &str, top_k: usize, raw_filter: I) -> Result<QueryResponse>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let validation = self.knowledge.validate_filters(raw_filter);
        if !validation.is_valid() {
            return Err(RagError::InvalidQuery(format!(
                "unknown filter keys: {}",
                validation.invalid_keys.join(", ")
            )));
        }
        self.query(text, top_k, Some(&validation.valid)).await
    }

    /// Formatted context for `text` using the configured `top_k` and no filter.
    ///
    /// # Errors
    ///
    /// As [`query`](Self::query).
    pub async fn context(&self, text: &str) -> Result<String> {
        let top_k = self.knowledge.config().top_k;
        Ok(self.query(text, top_k, None).await?.context)
    }
}

const SEPARATOR: &str = "\n\n";

/// Number and join chunks in rank order within `max_chars` characters.
///
/// A chunk whose block would overflow the budget is skipped whole; later,
/// smaller chunks may still fit. Numbers stay contiguous.
pub fn format_context(results: &[ScoredChunk], max_chars: usize) -> String {
    let mut context = String::new();
    let mut used = 0;
    let mut number = 0;

    for result in results {
        let block = format!("[{}] ({}) {}", number + 1, result.source_document, result.text);
        let separator = if context.is_empty() { 0 } else { SEPARATOR.len() };
        let cost = separator + block.chars().count();
        if used + cost > max_chars {
            continue;
        }
        if separator > 0 {
            context.push_str(SEPARATOR);
        }
        context.push_str(&block);
        used += cost;
        number += 1;
    }
    context
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::config::RagConfig;
    use crate::document::{Document, MetadataKey};
    use crate::hashing::HashingEmbeddingProvider;

    fn scored(id: &str, source: &str, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk_id: id.to_string(),
            text: text.to_string(),
            source_document: source.to_string(),
            score: 0.0,
        }
    }

    async fn engine(dir: &TempDir, max_context_chars: usize) -> QueryEngine {
        let config = RagConfig::builder()
            .max_context_chars(max_context_chars)
            .persistence_paths(dir.path().join("i.bin"), dir.path().join("m.json"))
            .build()
            .unwrap();
        let kb = KnowledgeBase::new(config, Arc::new(HashingEmbeddingProvider::default())).unwrap();
        kb.ingest_batch(&[
            Document::new("installments", "Pay in installments.")
                .with_metadata(MetadataKey::Category, "payment"),
            Document::new("creditor", "Contact the creditor first.")
                .with_metadata(MetadataKey::Category, "negotiation"),
            Document::new("regulator", "File a complaint with the regulator.")
                .with_metadata(MetadataKey::Category, "complaint"),
        ])
        .await;
        QueryEngine::new(Arc::new(kb))
    }

    #[tokio::test]
    async fn returns_top_k_ascending() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, 4000).await;

        let response = engine.query("can I pay in installments", 2, None).await.unwrap();
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].chunk_id, "installments#0");
        assert!(response.results[0].score <= response.results[1].score);
        assert!(response.context.starts_with("[1] (installments) Pay in installments."));
        assert!(response.context.contains("\n\n[2] "));
    }

    #[tokio::test]
    async fn filter_applies_before_truncation() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, 4000).await;
        let filter = MetadataFilter::new().with(MetadataKey::Category, "complaint");

        let response = engine.query("pay in installments", 1, Some(&filter)).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].source_document, "regulator");
    }

    #[tokio::test]
    async fn nothing_matching_is_an_empty_response() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, 4000).await;
        let filter = MetadataFilter::new().with(MetadataKey::Type, "manual");

        let response = engine.query("anything", 3, Some(&filter)).await.unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.context, "");
    }

    #[tokio::test]
    async fn invalid_queries_are_rejected() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, 4000).await;

        assert!(matches!(engine.query("x", 0, None).await, Err(RagError::InvalidQuery(_))));
        assert!(matches!(engine.query("  ", 3, None).await, Err(RagError::InvalidQuery(_))));

        let err = engine.query_raw("x", 3, [("type", "faq"), ("bogus", "1")]).await.unwrap_err();
        assert!(err.is_caller_error());
        assert!(err.to_string().contains("bogus"));
    }

    #[tokio::test]
    async fn raw_filter_with_declared_keys_is_applied() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir, 4000).await;

        let response =
            engine.query_raw("creditor", 3, [("category", "negotiation")]).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].chunk_id, "creditor#0");
    }

    #[tokio::test]
    async fn empty_knowledge_base_yields_empty_context() {
        let dir = tempdir().unwrap();
        let config = RagConfig::builder()
            .persistence_paths(dir.path().join("i.bin"), dir.path().join("m.json"))
            .build()
            .unwrap();
        let kb = KnowledgeBase::new(config, Arc::new(HashingEmbeddingProvider::default())).unwrap();
        let engine = QueryEngine::new(Arc::new(kb));

        assert_eq!(engine.context("hello").await.unwrap(), "");
    }

    #[test]
    fn overflowing_chunks_are_skipped_whole() {
        let results = vec![
            scored("a#0", "a", "short"),
            scored("b#0", "b", &"long ".repeat(20)),
            scored("c#0", "c", "tiny"),
        ];

        let context = format_context(&results, 40);
        assert_eq!(context, "[1] (a) short\n\n[2] (c) tiny");
        assert!(context.chars().count() <= 40);
    }

    #[test]
    fn budget_counts_characters() {
        let results = vec![scored("a#0", "a", "ééééé")];
        // "[1] (a) " is 8 characters, plus 5.
        assert_eq!(format_context(&results, 13), "[1] (a) ééééé");
        assert_eq!(format_context(&results, 12), "");
    }
}
