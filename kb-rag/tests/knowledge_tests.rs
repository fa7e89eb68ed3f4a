//! End-to-end ingestion and query scenarios.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kb_rag::{
    Document, HashingEmbeddingProvider, IngestionStatus, KnowledgeBase, MetadataKey, QueryEngine,
    RagConfig,
};
use tempfile::TempDir;

fn knowledge_base(dir: &TempDir, chunk_size: usize, overlap: usize) -> Arc<KnowledgeBase> {
    let config = RagConfig::builder()
        .chunk_size(chunk_size)
        .chunk_overlap(overlap)
        .persistence_paths(dir.path().join("kb_index.bin"), dir.path().join("kb_manifest.json"))
        .build()
        .unwrap();
    Arc::new(KnowledgeBase::new(config, Arc::new(HashingEmbeddingProvider::default())).unwrap())
}

#[tokio::test]
async fn long_document_is_split_at_expected_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let kb = knowledge_base(&dir, 1000, 100);
    let text: String = (0..2500).map(|i| char::from(b'a' + (i % 26) as u8)).collect();

    let record = kb.ingest(&Document::new("manual.txt", text.clone())).await.unwrap();
    assert_eq!(record.chunk_count, 3);

    let snapshot = kb.snapshot().await;
    let spans: Vec<(usize, usize)> = snapshot
        .manifest()
        .chunks
        .iter()
        .map(|c| (c.offset, c.offset + c.text.chars().count()))
        .collect();
    assert_eq!(spans, vec![(0, 1000), (900, 1900), (1800, 2500)]);
    assert_eq!(snapshot.manifest().chunks[2].text, text[1800..]);
}

#[tokio::test]
async fn three_chunk_index_returns_two_ranked_results() {
    let dir = tempfile::tempdir().unwrap();
    let kb = knowledge_base(&dir, 1000, 100);
    kb.ingest_batch(&[
        Document::new("a", "Pay in installments."),
        Document::new("b", "Contact the creditor first."),
        Document::new("c", "File a complaint with the regulator."),
    ])
    .await;

    let engine = QueryEngine::new(kb);
    let response = engine.query("Should I contact the creditor?", 2, None).await.unwrap();

    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].chunk_id, "b#0");
    assert!(response.results[0].score <= response.results[1].score);
    assert!(response.context.starts_with("[1] (b) Contact the creditor first."));
    assert!(!response.context.contains("[3]"));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let kb = knowledge_base(&dir, 1000, 100);
        kb.open(&[]).await.unwrap();
        kb.ingest(
            &Document::new("faq", "Pay in installments.")
                .with_metadata(MetadataKey::Type, "faq")
                .with_metadata(MetadataKey::Category, "renegotiation"),
        )
        .await
        .unwrap();
        kb.shutdown().await.unwrap();
    }

    let kb = knowledge_base(&dir, 1000, 100);
    kb.open(&[]).await.unwrap();
    assert_eq!(kb.status("faq").await.unwrap().status, IngestionStatus::Ready);

    let engine = QueryEngine::new(kb);
    let filter = HashMap::from([("category", "renegotiation")]);
    let response = engine.query_raw("installments", 5, &filter).await.unwrap();
    assert_eq!(response.results.len(), 1);
}

/// Chunk texts are tagged with their generation so a mixed read is visible.
fn generation_docs(tag: &str) -> Vec<Document> {
    (0..4)
        .map(|i| Document::new(format!("doc{i}"), format!("{tag} shared words number {i}")))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queries_during_rebuilds_see_one_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let kb = knowledge_base(&dir, 1000, 100);
    kb.rebuild(&generation_docs("alpha")).await;
    let engine = QueryEngine::new(kb.clone());

    let writer = tokio::spawn({
        let kb = kb.clone();
        async move {
            for round in 0..20 {
                let tag = if round % 2 == 0 { "beta" } else { "alpha" };
                kb.rebuild(&generation_docs(tag)).await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    });

    let mut readers = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let response = engine.query("shared words", 4, None).await.unwrap();
                assert_eq!(response.results.len(), 4);
                let tags: Vec<&str> = response
                    .results
                    .iter()
                    .map(|r| r.text.split_whitespace().next().unwrap_or_default())
                    .collect();
                assert!(tags.iter().all(|t| *t == tags[0]), "mixed snapshots: {tags:?}");
                for result in &response.results {
                    let number = result.chunk_id.trim_start_matches("doc").trim_end_matches("#0");
                    assert!(result.text.ends_with(number));
                    assert_eq!(result.source_document, format!("doc{number}"));
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}
