//! Knowledge base manager.
//!
//! [`KnowledgeBase`] turns documents into a queryable index. Ingestion runs
//! chunk → embed → stage → persist → swap:
//!
//! 1. The document is chunked and every chunk embedded before anything
//!    shared is touched, so a failed document leaves no partial chunks.
//! 2. Under the commit lock, a copy of the live snapshot is taken, the
//!    document's previous chunks are dropped from it and the new ones
//!    appended.
//! 3. The new snapshot is saved to disk, and only then is the live pointer
//!    replaced.
//!
//! Readers clone the live `Arc<Snapshot>` once and keep using it for the
//! whole query, so they never see an index paired with another generation's
//! manifest.
//!
//! Persisted state is read under the commit lock. A knowledge base that was
//! never [`open`](KnowledgeBase::open)ed loads it before its first
//! incremental commit, so it never writes over documents it has not seen.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::chunking::{Chunker, FixedSizeChunker};
use crate::config::RagConfig;
use crate::document::{
    Chunk, Document, IngestionRecord, IngestionStatus, Metadata, MetadataFilter, MetadataKey,
};
use crate::embedding::{EmbeddingProvider, EmbeddingService};
use crate::error::{RagError, Result};
use crate::index::VectorIndex;
use crate::persistence::{self, Manifest};

/// An immutable index/manifest pair. Entry `i` of the index is chunk `i` of
/// the manifest.
#[derive(Debug, Clone)]
pub struct Snapshot {
    index: VectorIndex,
    manifest: Manifest,
    generation: u64,
}

impl Snapshot {
    fn empty(config: &RagConfig, embedding_model: String) -> Self {
        Self {
            index: VectorIndex::new(config.distance_metric),
            manifest: Manifest::new(embedding_model),
            generation: 0,
        }
    }

    /// The vector index.
    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// The chunk manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The chunk stored at index position `position`.
    pub fn chunk(&self, position: usize) -> Option<&Chunk> {
        self.manifest.chunks.get(position)
    }

    /// Incremented by every committed change; 0 for a fresh or loaded snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the snapshot holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Outcome of [`KnowledgeBase::validate_filters`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterValidation {
    /// The pairs whose key is a declared metadata key.
    pub valid: MetadataFilter,
    /// Undeclared keys, sorted.
    pub invalid_keys: Vec<String>,
}

impl FilterValidation {
    /// Whether every key was declared.
    pub fn is_valid(&self) -> bool {
        self.invalid_keys.is_empty()
    }
}

/// A document whose chunks are embedded and ready to stage.
struct Prepared {
    document_id: String,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Base {
    Live,
    Empty,
}

/// What was found on disk.
enum Persisted {
    Missing,
    Adopted,
}

/// Explicitly owned knowledge base service.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use kb_rag::{Document, HashingEmbeddingProvider, KnowledgeBase, RagConfig};
///
/// let kb = KnowledgeBase::new(RagConfig::default(), Arc::new(HashingEmbeddingProvider::default()))?;
/// kb.open(&[]).await?;
/// kb.ingest(&Document::new("faq.txt", "Pay in installments.")).await?;
/// kb.shutdown().await?;
/// ```
pub struct KnowledgeBase {
    config: RagConfig,
    embedder: EmbeddingService,
    chunker: Arc<dyn Chunker>,
    live: RwLock<Arc<Snapshot>>,
    commit: Mutex<()>,
    records: RwLock<HashMap<String, IngestionRecord>>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl KnowledgeBase {
    /// Create an empty knowledge base chunking with a [`FixedSizeChunker`].
    ///
    /// Nothing is read from disk until [`open`](Self::open).
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `config` is invalid.
    pub fn new(config: RagConfig, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        config.validate()?;
        let chunker = Arc::new(FixedSizeChunker::new(config.chunk_size, config.chunk_overlap)?);
        let embedder = EmbeddingService::new(provider, &config);
        let live = Arc::new(Snapshot::empty(&config, embedder.model_id()));
        Ok(Self {
            config,
            embedder,
            chunker,
            live: RwLock::new(live),
            commit: Mutex::new(()),
            records: RwLock::new(HashMap::new()),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Replace the chunking strategy.
    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// The guarded embedding service.
    pub fn embedder(&self) -> &EmbeddingService {
        &self.embedder
    }

    /// The live snapshot. Hold on to it for the duration of a read.
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.live.read().await.clone()
    }

    /// Load persisted state, rebuilding from `sources` when it is unusable.
    ///
    /// - Neither file present: start empty, or build from `sources`.
    /// - Both present and consistent, built with the configured embedding
    ///   model, dimension and metric: adopt them and mark their documents
    ///   ready.
    /// - Otherwise: rebuild from `sources`.
    ///
    /// A rebuild that indexes none of `sources` commits nothing, so the
    /// files on disk are left as they were.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::IndexCorruption`] when the persisted state is
    /// unusable and `sources` is empty, and [`RagError::PipelineError`] when
    /// a rebuild from `sources` made no document ready.
    pub async fn open(&self, sources: &[Document]) -> Result<()> {
        let loaded = {
            let guard = self.commit.lock().await;
            self.load_persisted(&guard).await
        };

        match loaded {
            Ok(Persisted::Adopted) => Ok(()),
            Ok(Persisted::Missing) if sources.is_empty() => {
                info!(path = %self.config.index_path.display(), "no persisted index, starting empty");
                Ok(())
            }
            Ok(Persisted::Missing) => {
                info!(document_count = sources.len(), "no persisted index, building from sources");
                self.rebuild_from(sources).await
            }
            Err(e @ RagError::IndexCorruption { .. }) if !sources.is_empty() => {
                warn!(error = %e, document_count = sources.len(), "persisted index unusable, rebuilding");
                self.rebuild_from(sources).await
            }
            Err(e) => {
                error!(error = %e, "cannot open knowledge base");
                Err(e)
            }
        }
    }

    /// Rebuild at start-up; failing to index any source is fatal.
    async fn rebuild_from(&self, sources: &[Document]) -> Result<()> {
        let records = self.rebuild(sources).await;
        if records.iter().any(|r| r.status == IngestionStatus::Ready) {
            return Ok(());
        }
        let cause = records
            .iter()
            .find_map(|r| r.message.clone())
            .unwrap_or_else(|| "no document was indexed".to_string());
        let e = RagError::PipelineError(format!(
            "rebuild from {} source documents failed: {cause}",
            sources.len()
        ));
        error!(error = %e, "cannot open knowledge base");
        Err(e)
    }

    /// Adopt the persisted pair as the live snapshot. Requires the commit lock.
    async fn load_persisted(&self, _commit: &MutexGuard<'_, ()>) -> Result<Persisted> {
        let (index_path, manifest_path) =
            (self.config.index_path.clone(), self.config.manifest_path.clone());

        if !index_path.exists() && !manifest_path.exists() {
            self.opened.store(true, Ordering::Release);
            return Ok(Persisted::Missing);
        }

        let (index, manifest) = tokio::task::spawn_blocking(move || {
            persistence::load(&index_path, &manifest_path)
        })
        .await
        .map_err(|e| RagError::PipelineError(format!("load task failed: {e}")))??;
        let snapshot = self.check_compatible(index, manifest)?;

        let documents = count_by_document(&snapshot.manifest.chunks);
        {
            let mut records = self.records.write().await;
            for (document_id, chunk_count) in &documents {
                let mut record = IngestionRecord::pending(document_id.as_str());
                record.ready(*chunk_count);
                records.insert(document_id.clone(), record);
            }
        }
        info!(
            chunk_count = snapshot.len(),
            document_count = documents.len(),
            "loaded persisted index"
        );
        *self.live.write().await = Arc::new(snapshot);
        self.opened.store(true, Ordering::Release);
        Ok(Persisted::Adopted)
    }

    /// A loaded pair is only usable with the model, dimension and metric it
    /// was built with.
    fn check_compatible(&self, index: VectorIndex, manifest: Manifest) -> Result<Snapshot> {
        let model = self.embedder.model_id();
        if manifest.embedding_model != model {
            return Err(RagError::corruption(
                &self.config.manifest_path,
                format!(
                    "index was built with embedding model '{}', configured model is '{model}'",
                    manifest.embedding_model
                ),
            ));
        }
        let expected = self.embedder.provider().dimensions();
        if let Some(dimension) = index.dimension().filter(|d| *d != expected) {
            return Err(RagError::corruption(
                &self.config.index_path,
                format!("index holds {dimension}-dimensional vectors, provider produces {expected}"),
            ));
        }
        if index.metric() != self.config.distance_metric {
            return Err(RagError::corruption(
                &self.config.index_path,
                format!(
                    "index uses metric {:?}, configured metric is {:?}",
                    index.metric(),
                    self.config.distance_metric
                ),
            ));
        }
        Ok(Snapshot { index, manifest, generation: 0 })
    }

    /// Ingest one document, replacing any chunks it previously contributed.
    ///
    /// All-or-nothing: on failure the record is set to `error` and the
    /// queryable state is unchanged.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing stage.
    pub async fn ingest(&self, document: &Document) -> Result<IngestionRecord> {
        self.begin(&document.id).await;
        let prepared = match self.prepare(document).await {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.fail(&document.id, e).await),
        };

        let mut outcome = self.commit(vec![prepared], Base::Live).await;
        match outcome.pop() {
            Some((_, Ok(chunk_count))) => Ok(self.succeed(&document.id, chunk_count).await),
            Some((_, Err(e))) => Err(self.fail(&document.id, e).await),
            None => Err(self
                .fail(&document.id, RagError::PipelineError("commit produced no outcome".into()))
                .await),
        }
    }

    /// Read a UTF-8 file and ingest it with `metadata`. The document id is
    /// the path as given.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Io`] if the file cannot be read, otherwise as
    /// [`ingest`](Self::ingest).
    pub async fn ingest_file(
        &self,
        path: impl AsRef<Path>,
        metadata: Metadata,
    ) -> Result<IngestionRecord> {
        let path = path.as_ref();
        let document_id = path.display().to_string();
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let document = Document { id: document_id, text, metadata };
                self.ingest(&document).await
            }
            Err(e) => {
                self.begin(&document_id).await;
                Err(self.fail(&document_id, e.into()).await)
            }
        }
    }

    /// Read UTF-8 files and ingest them with `metadata` as one batch.
    ///
    /// A file that cannot be read gets an `error` record like any other
    /// failed document. Records are returned in input order.
    pub async fn ingest_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
        metadata: &Metadata,
    ) -> Vec<IngestionRecord> {
        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let document_id = path.display().to_string();
            match tokio::fs::read_to_string(path).await {
                Ok(text) => documents.push(Document { id: document_id, text, metadata: metadata.clone() }),
                Err(e) => {
                    self.begin(&document_id).await;
                    self.fail(&document_id, e.into()).await;
                }
            }
        }

        self.ingest_batch(&documents).await;
        let records = self.records.read().await;
        paths
            .iter()
            .filter_map(|p| records.get(&p.as_ref().display().to_string()).cloned())
            .collect()
    }

    /// Ingest many documents, embedding up to `ingest_concurrency` of them at
    /// once, and commit the successful ones as a single snapshot.
    ///
    /// A failing document never aborts the batch; its record carries the
    /// error. Records are returned in input order.
    pub async fn ingest_batch(&self, documents: &[Document]) -> Vec<IngestionRecord> {
        self.run_batch(documents, Base::Live).await
    }

    /// Build a fresh snapshot from `documents` alone and swap it in.
    ///
    /// Documents that fail are left out; their records carry the error. If
    /// every document fails, nothing is committed and the live snapshot
    /// stays. Once a rebuild commits, documents it left out have their
    /// records set to `error` with chunk count 0.
    pub async fn rebuild(&self, documents: &[Document]) -> Vec<IngestionRecord> {
        self.run_batch(documents, Base::Empty).await
    }

    async fn run_batch(&self, documents: &[Document], base: Base) -> Vec<IngestionRecord> {
        for document in documents {
            self.begin(&document.id).await;
        }

        let mut pending = Vec::with_capacity(documents.len());
        for document in documents {
            pending.push(async move { (document, self.prepare(document).await) });
        }
        let prepared: Vec<(&Document, Result<Prepared>)> = stream::iter(pending)
            .buffered(self.config.ingest_concurrency)
            .collect()
            .await;

        let mut ready = Vec::new();
        for (document, result) in prepared {
            match result {
                Ok(p) => ready.push(p),
                Err(e) => {
                    self.fail(&document.id, e).await;
                }
            }
        }

        // An empty rebuild only commits when it was asked for.
        if !ready.is_empty() || (base == Base::Empty && documents.is_empty()) {
            for (document_id, outcome) in self.commit(ready, base).await {
                match outcome {
                    Ok(chunk_count) => {
                        self.succeed(&document_id, chunk_count).await;
                    }
                    Err(e) => {
                        self.fail(&document_id, e).await;
                    }
                }
            }
            if base == Base::Empty {
                self.retire_unindexed().await;
            }
        } else if base == Base::Empty {
            warn!(document_count = documents.len(), "rebuild indexed no document, keeping live snapshot");
        }

        let records = self.records.read().await;
        documents.iter().filter_map(|d| records.get(&d.id).cloned()).collect()
    }

    /// Mark ready records whose document is absent from the live snapshot.
    async fn retire_unindexed(&self) {
        let live = self.documents().await;
        let mut records = self.records.write().await;
        for record in records.values_mut() {
            if record.status == IngestionStatus::Ready && !live.contains_key(&record.document_id) {
                debug!(document.id = %record.document_id, "document not included in rebuild");
                record.failed("not included in rebuild");
                record.chunk_count = 0;
            }
        }
    }

    /// Chunk and embed a document without touching shared state.
    async fn prepare(&self, document: &Document) -> Result<Prepared> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RagError::PipelineError("knowledge base is shut down".into()));
        }
        if document.text.trim().is_empty() {
            return Err(RagError::ConfigError(format!("document '{}' has no text", document.id)));
        }

        let chunks = self.chunker.chunk(document);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        debug!(document.id = %document.id, chunk_count = chunks.len(), "embedding chunks");
        let vectors = self.embedder.embed_documents(&texts).await?;

        Ok(Prepared { document_id: document.id.clone(), chunks, vectors })
    }

    /// Stage `batch` onto a copy of the base snapshot, persist it, and swap
    /// it in. Returns one outcome per staged or rejected document.
    async fn commit(&self, batch: Vec<Prepared>, base: Base) -> Vec<(String, Result<usize>)> {
        let guard = self.commit.lock().await;
        if base == Base::Live && !self.opened.load(Ordering::Acquire) {
            if let Err(e) = self.load_persisted(&guard).await {
                error!(error = %e, "cannot load persisted index before commit");
                let message = format!("knowledge base could not be opened: {e}");
                return batch
                    .into_iter()
                    .map(|p| (p.document_id, Err(RagError::PipelineError(message.clone()))))
                    .collect();
            }
        }
        let current = self.snapshot().await;

        let (mut index, mut chunks) = match base {
            Base::Live => (current.index.clone(), current.manifest.chunks.clone()),
            Base::Empty => (VectorIndex::new(self.config.distance_metric), Vec::new()),
        };

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut staged = Vec::with_capacity(batch.len());
        for prepared in batch {
            let document_id = prepared.document_id.clone();
            match stage(&mut index, &mut chunks, prepared) {
                Ok(chunk_count) => staged.push((document_id, chunk_count)),
                Err(e) => outcomes.push((document_id, Err(e))),
            }
        }
        if staged.is_empty() && base == Base::Live {
            return outcomes;
        }

        let snapshot = Arc::new(Snapshot {
            index,
            manifest: Manifest { embedding_model: self.embedder.model_id(), chunks },
            generation: current.generation + 1,
        });

        match self.persist(snapshot.clone()).await {
            Ok(()) => {
                info!(
                    generation = snapshot.generation,
                    chunk_count = snapshot.len(),
                    "committed snapshot"
                );
                *self.live.write().await = snapshot;
                self.opened.store(true, Ordering::Release);
                outcomes.extend(staged.into_iter().map(|(id, n)| (id, Ok(n))));
            }
            Err(e) => {
                error!(error = %e, "failed to persist snapshot");
                let message = format!("failed to persist index: {e}");
                outcomes.extend(
                    staged.into_iter().map(|(id, _)| (id, Err(RagError::PipelineError(message.clone())))),
                );
            }
        }
        outcomes
    }

    async fn persist(&self, snapshot: Arc<Snapshot>) -> Result<()> {
        let (index_path, manifest_path) =
            (self.config.index_path.clone(), self.config.manifest_path.clone());
        tokio::task::spawn_blocking(move || {
            persistence::save(&snapshot.index, &snapshot.manifest, &index_path, &manifest_path)
        })
        .await
        .map_err(|e| RagError::PipelineError(format!("persistence task failed: {e}")))?
    }

    async fn begin(&self, document_id: &str) {
        self.records
            .write()
            .await
            .insert(document_id.to_string(), IngestionRecord::pending(document_id));
    }

    async fn succeed(&self, document_id: &str, chunk_count: usize) -> IngestionRecord {
        info!(document.id = %document_id, chunk_count, "ingested document");
        let mut records = self.records.write().await;
        let record = records
            .entry(document_id.to_string())
            .or_insert_with(|| IngestionRecord::pending(document_id));
        record.ready(chunk_count);
        record.clone()
    }

    async fn fail(&self, document_id: &str, error: RagError) -> RagError {
        error!(document.id = %document_id, error = %error, "ingestion failed");
        let mut records = self.records.write().await;
        records
            .entry(document_id.to_string())
            .or_insert_with(|| IngestionRecord::pending(document_id))
            .failed(error.to_string());
        error
    }

    /// The ingestion record of `document_id`, if ingestion was ever requested.
    pub async fn status(&self, document_id: &str) -> Option<IngestionRecord> {
        self.records.read().await.get(document_id).cloned()
    }

    /// Every ingestion record, ordered by document id.
    pub async fn records(&self) -> Vec<IngestionRecord> {
        let mut records: Vec<IngestionRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        records
    }

    /// Chunk counts per document in the live snapshot.
    pub async fn documents(&self) -> BTreeMap<String, usize> {
        count_by_document(&self.snapshot().await.manifest.chunks)
    }

    /// Split a raw filter map into declared pairs and undeclared keys.
    ///
    /// Undeclared keys are reported, never dropped silently.
    pub fn validate_filters<I, K, V>(&self, raw: I) -> FilterValidation
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut validation = FilterValidation::default();
        for (key, value) in raw {
            match key.as_ref().parse::<MetadataKey>() {
                Ok(key) => {
                    validation.valid = std::mem::take(&mut validation.valid).with(key, value.as_ref())
                }
                Err(_) => validation.invalid_keys.push(key.as_ref().to_string()),
            }
        }
        validation.invalid_keys.sort();
        validation.invalid_keys.dedup();
        validation
    }

    /// Refuse further ingestion, wait for in-flight commits, and persist the
    /// live snapshot. A knowledge base that never loaded or committed
    /// anything leaves the files on disk alone.
    ///
    /// # Errors
    ///
    /// Returns the persistence error, if any.
    pub async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.embedder.close();
        let _guard = self.commit.lock().await;
        if !self.opened.load(Ordering::Acquire) {
            info!("knowledge base shut down before opening, nothing persisted");
            return Ok(());
        }
        let snapshot = self.snapshot().await;
        self.persist(snapshot.clone()).await?;
        info!(chunk_count = snapshot.len(), "knowledge base shut down");
        Ok(())
    }
}

/// Replace `prepared.document_id`'s chunks in the staged pair.
///
/// The staged pair is untouched on error.
fn stage(index: &mut VectorIndex, chunks: &mut Vec<Chunk>, prepared: Prepared) -> Result<usize> {
    let Prepared { document_id, chunks: new_chunks, vectors } = prepared;
    if new_chunks.len() != vectors.len() {
        return Err(RagError::PipelineError(format!(
            "{} chunks but {} vectors",
            new_chunks.len(),
            vectors.len()
        )));
    }
    if let (Some(expected), Some(vector)) = (index.dimension(), vectors.first()) {
        if vector.len() != expected {
            return Err(RagError::DimensionMismatch { expected, actual: vector.len() });
        }
    }

    let mut next = index.filtered(|p| chunks[p].source_document != document_id);
    next.insert(new_chunks.iter().map(|c| c.id.clone()).zip(vectors))?;

    chunks.retain(|c| c.source_document != document_id);
    let chunk_count = new_chunks.len();
    chunks.extend(new_chunks);
    *index = next;
    Ok(chunk_count)
}

fn count_by_document(chunks: &[Chunk]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for chunk in chunks {
        *counts.entry(chunk.source_document.clone()).or_insert(0) += 1;
    }
    counts
}
