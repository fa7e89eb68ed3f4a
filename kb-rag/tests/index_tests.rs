//! Property tests for vector index search and persistence.

use kb_rag::document::Chunk;
use kb_rag::persistence::{self, Manifest};
use kb_rag::{DistanceMetric, Metadata, VectorIndex};
use proptest::prelude::*;

const DIM: usize = 8;

/// Generate an embedding of the given dimension.
fn arb_embedding(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-1.0f32..1.0f32, dim)
}

fn arb_metric() -> impl Strategy<Value = DistanceMetric> {
    prop_oneof![Just(DistanceMetric::SquaredL2), Just(DistanceMetric::Cosine)]
}

fn build(metric: DistanceMetric, vectors: &[Vec<f32>]) -> VectorIndex {
    let mut index = VectorIndex::new(metric);
    index
        .insert(vectors.iter().enumerate().map(|(i, v)| (format!("doc#{i}"), v.clone())))
        .unwrap();
    index
}

/// **Property: search is ordered and bounded**
/// *For any* set of vectors and query, `search` returns at most `top_k`
/// results (and at most the number of entries) with non-decreasing
/// distances; equal distances appear in insertion order.
mod prop_search_ordering {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn results_ascending_and_bounded_by_top_k(
            vectors in proptest::collection::vec(arb_embedding(DIM), 0..30),
            query in arb_embedding(DIM),
            top_k in 1usize..40,
            metric in arb_metric(),
        ) {
            let index = build(metric, &vectors);
            let results = index.search(&query, top_k).unwrap();

            prop_assert!(results.len() <= top_k);
            prop_assert_eq!(results.len(), top_k.min(vectors.len()));
            for pair in results.windows(2) {
                prop_assert!(pair[0].distance <= pair[1].distance);
                if pair[0].distance == pair[1].distance {
                    prop_assert!(pair[0].position < pair[1].position);
                }
            }
        }

        #[test]
        fn duplicates_tie_in_insertion_order(
            vector in arb_embedding(DIM),
            copies in 2usize..10,
            query in arb_embedding(DIM),
        ) {
            let index = build(DistanceMetric::SquaredL2, &vec![vector; copies]);
            let results = index.search(&query, copies).unwrap();
            let positions: Vec<usize> = results.iter().map(|r| r.position).collect();
            prop_assert_eq!(positions, (0..copies).collect::<Vec<_>>());
        }

        #[test]
        fn filtered_search_returns_best_eligible_entries(
            vectors in proptest::collection::vec(arb_embedding(DIM), 1..30),
            query in arb_embedding(DIM),
            top_k in 1usize..10,
        ) {
            let index = build(DistanceMetric::SquaredL2, &vectors);
            let filtered = index.search_filtered(&query, top_k, |p| p % 3 == 0).unwrap();

            // Same ranking as searching everything and discarding ineligible hits.
            let all = index.search(&query, vectors.len()).unwrap();
            let expected: Vec<usize> =
                all.iter().map(|n| n.position).filter(|p| p % 3 == 0).take(top_k).collect();
            let actual: Vec<usize> = filtered.iter().map(|n| n.position).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}

/// **Property: persistence round-trips search results**
/// *For any* index, loading what was saved yields identical ids and
/// distances for every query.
mod prop_persistence_round_trip {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn load_after_save_searches_identically(
            vectors in proptest::collection::vec(arb_embedding(DIM), 0..20),
            queries in proptest::collection::vec(arb_embedding(DIM), 1..5),
            metric in arb_metric(),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let (index_path, manifest_path) =
                (dir.path().join("kb_index.bin"), dir.path().join("kb_manifest.json"));

            let index = build(metric, &vectors);
            let manifest = Manifest {
                embedding_model: "test/model".to_string(),
                chunks: (0..vectors.len())
                    .map(|i| Chunk {
                        id: format!("doc#{i}"),
                        text: format!("chunk {i}"),
                        source_document: "doc".to_string(),
                        offset: i,
                        metadata: Metadata::new(),
                    })
                    .collect(),
            };

            persistence::save(&index, &manifest, &index_path, &manifest_path).unwrap();
            let (loaded, loaded_manifest) = persistence::load(&index_path, &manifest_path).unwrap();

            prop_assert_eq!(&loaded_manifest, &manifest);
            for query in &queries {
                prop_assert_eq!(loaded.search(query, 5).unwrap(), index.search(query, 5).unwrap());
            }
        }
    }
}
