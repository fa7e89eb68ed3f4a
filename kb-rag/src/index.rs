//! Exact nearest-neighbor index over fixed-dimension vectors.
//!
//! [`VectorIndex`] stores every vector in one contiguous `Vec<f32>` and
//! answers k-nearest-neighbor queries by scanning all entries with a bounded
//! max-heap. Results are fully deterministic: ascending distance, ties broken
//! by insertion order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// The distance function of an index. Fixed for the lifetime of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance over raw vectors.
    #[default]
    SquaredL2,
    /// `1 - cos(a, b)`. Vectors are L2-normalized on insertion and query.
    Cosine,
}

impl DistanceMetric {
    /// Stable on-disk tag.
    pub fn tag(self) -> u8 {
        match self {
            DistanceMetric::SquaredL2 => 0,
            DistanceMetric::Cosine => 1,
        }
    }

    /// Inverse of [`tag`](Self::tag).
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DistanceMetric::SquaredL2),
            1 => Some(DistanceMetric::Cosine),
            _ => None,
        }
    }

    /// Distance between two prepared vectors of equal length.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::SquaredL2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum(),
            DistanceMetric::Cosine => 1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        }
    }

    /// Bring a vector into the form this metric compares.
    fn prepare(self, vector: &mut [f32]) {
        if self == DistanceMetric::Cosine {
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                vector.iter_mut().for_each(|x| *x /= norm);
            }
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// The entry identifier.
    pub id: String,
    /// Insertion position of the entry.
    pub position: usize,
    /// Distance to the query (smaller is closer).
    pub distance: f32,
}

/// Heap entry ordered by `(distance, position)`.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    position: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then(self.position.cmp(&other.position))
    }
}

/// A flat vector index keyed by chunk id.
///
/// The first insertion fixes the dimension; later vectors of any other length
/// are rejected without modifying the index.
///
/// # Example
///
/// ```rust
/// use kb_rag::{DistanceMetric, VectorIndex};
///
/// let mut index = VectorIndex::new(DistanceMetric::SquaredL2);
/// index.insert(vec![("a".to_string(), vec![0.0, 0.0]), ("b".to_string(), vec![1.0, 1.0])])?;
/// let hits = index.search(&[0.9, 0.9], 1)?;
/// assert_eq!(hits[0].id, "b");
/// # Ok::<(), kb_rag::RagError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    metric: DistanceMetric,
    dimension: Option<usize>,
    ids: Vec<String>,
    data: Vec<f32>,
}

impl VectorIndex {
    /// Create an empty index using `metric`.
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric, dimension: None, ids: Vec::new(), data: Vec::new() }
    }

    /// Reassemble an index from already-prepared parts.
    ///
    /// `data` must hold `ids.len() * dimension` values.
    pub(crate) fn from_parts(
        metric: DistanceMetric,
        dimension: Option<usize>,
        ids: Vec<String>,
        data: Vec<f32>,
    ) -> Self {
        debug_assert_eq!(data.len(), ids.len() * dimension.unwrap_or(0));
        Self { metric, dimension, ids, data }
    }

    /// The distance metric.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// The established dimension, or `None` before the first insertion.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The id stored at `position`.
    pub fn id(&self, position: usize) -> Option<&str> {
        self.ids.get(position).map(String::as_str)
    }

    /// The (prepared) vector stored at `position`.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let dim = self.dimension?;
        self.data.get(position * dim..(position + 1) * dim)
    }

    pub(crate) fn ids(&self) -> &[String] {
        &self.ids
    }

    pub(crate) fn data(&self) -> &[f32] {
        &self.data
    }

    /// Append a batch of `(id, vector)` entries in order.
    ///
    /// The whole batch is validated before anything is appended.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::DimensionMismatch`] if any vector's length differs
    /// from the established dimension (or from the first vector of the batch
    /// when the index is empty), and [`RagError::ConfigError`] for empty vectors.
    pub fn insert<I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        let entries: Vec<(String, Vec<f32>)> = entries.into_iter().collect();
        let Some(first) = entries.first() else {
            return Ok(());
        };

        let dimension = self.dimension.unwrap_or(first.1.len());
        if dimension == 0 {
            return Err(RagError::ConfigError("vectors must have at least one dimension".into()));
        }
        if let Some((_, bad)) = entries.iter().find(|(_, v)| v.len() != dimension) {
            return Err(RagError::DimensionMismatch { expected: dimension, actual: bad.len() });
        }

        self.dimension = Some(dimension);
        self.ids.reserve(entries.len());
        self.data.reserve(entries.len() * dimension);
        for (id, mut vector) in entries {
            self.metric.prepare(&mut vector);
            self.ids.push(id);
            self.data.extend_from_slice(&vector);
        }
        Ok(())
    }

    /// A new index holding the entries whose position satisfies `keep`,
    /// in their original relative order.
    pub fn filtered<P>(&self, mut keep: P) -> VectorIndex
    where
        P: FnMut(usize) -> bool,
    {
        let mut out = VectorIndex {
            metric: self.metric,
            dimension: self.dimension,
            ids: Vec::new(),
            data: Vec::new(),
        };
        let Some(dim) = self.dimension else {
            return out;
        };
        for (position, id) in self.ids.iter().enumerate() {
            if keep(position) {
                out.ids.push(id.clone());
                out.data.extend_from_slice(&self.data[position * dim..(position + 1) * dim]);
            }
        }
        out
    }

    /// The `top_k` nearest entries to `query`, ascending by distance.
    ///
    /// # Errors
    ///
    /// See [`search_filtered`](Self::search_filtered).
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
        self.search_filtered(query, top_k, |_| true)
    }

    /// The `top_k` nearest entries among those whose position satisfies
    /// `keep`, ascending by distance, ties broken by insertion order.
    ///
    /// Rejected entries never occupy a result slot. An empty index yields an
    /// empty result.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidQuery`] if `top_k == 0` and
    /// [`RagError::DimensionMismatch`] if the query length differs from the
    /// index dimension.
    pub fn search_filtered<P>(&self, query: &[f32], top_k: usize, mut keep: P) -> Result<Vec<Neighbor>>
    where
        P: FnMut(usize) -> bool,
    {
        if top_k == 0 {
            return Err(RagError::InvalidQuery("top_k must be greater than zero".to_string()));
        }
        let Some(dim) = self.dimension else {
            return Ok(Vec::new());
        };
        if query.len() != dim {
            return Err(RagError::DimensionMismatch { expected: dim, actual: query.len() });
        }

        let mut prepared = query.to_vec();
        self.metric.prepare(&mut prepared);

        // Max-heap of the best `top_k` so far; the worst kept candidate is on top.
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(top_k.min(self.len()) + 1);
        for (position, vector) in self.data.chunks_exact(dim).enumerate() {
            if !keep(position) {
                continue;
            }
            let candidate =
                Candidate { distance: self.metric.distance(&prepared, vector), position };
            if heap.len() < top_k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor {
                id: self.ids[c.position].clone(),
                position: c.position,
                distance: c.distance,
            })
            .collect())
    }
}
