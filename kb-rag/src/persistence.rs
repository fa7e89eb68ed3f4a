//! Durable storage for a [`VectorIndex`] and its chunk [`Manifest`].
//!
//! The index and the manifest are always written and read as a pair:
//!
//! - The index file is a small binary format (`KBVI` magic, format version,
//!   metric tag, dimension, entry count, ids, then little-endian `f32`s).
//! - The manifest is JSON carrying its own format tag and version, the
//!   embedding model, and the SHA-256 of the index file it belongs to.
//!
//! [`save`] writes each file to a temporary file in the destination
//! directory, syncs it, and renames it into place, so a loader never sees a
//! half-written file. Should a crash land between the two renames, the
//! checksum no longer matches and [`load`] reports corruption instead of
//! pairing a manifest with the wrong index.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::document::Chunk;
use crate::error::{RagError, Result};
use crate::index::{DistanceMetric, VectorIndex};

/// Magic bytes opening every index file.
pub const INDEX_MAGIC: &[u8; 4] = b"KBVI";
/// Current index file format version.
pub const INDEX_VERSION: u16 = 1;
/// Format tag written into every manifest.
pub const MANIFEST_FORMAT: &str = "kb-rag-manifest";
/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Ordered chunk records matching index entries 1:1 by position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Identity of the embedding model that produced the index vectors.
    pub embedding_model: String,
    /// Chunks in index order.
    pub chunks: Vec<Chunk>,
}

impl Manifest {
    /// Create an empty manifest for `embedding_model`.
    pub fn new(embedding_model: impl Into<String>) -> Self {
        Self { embedding_model: embedding_model.into(), chunks: Vec::new() }
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestFile {
    format: String,
    version: u32,
    metric: DistanceMetric,
    dimension: Option<usize>,
    index_checksum: String,
    embedding_model: String,
    chunks: Vec<Chunk>,
}

/// Persist `index` and `manifest` atomically.
///
/// Parent directories are created as needed.
///
/// # Errors
///
/// Returns [`RagError::PipelineError`] if the manifest does not describe the
/// index entry-for-entry, and [`RagError::Io`] on filesystem failures.
pub fn save(
    index: &VectorIndex,
    manifest: &Manifest,
    index_path: &Path,
    manifest_path: &Path,
) -> Result<()> {
    check_pairing(index, manifest)
        .map_err(|message| RagError::PipelineError(format!("refusing to save: {message}")))?;

    let index_bytes = encode_index(index);
    let file = ManifestFile {
        format: MANIFEST_FORMAT.to_string(),
        version: MANIFEST_VERSION,
        metric: index.metric(),
        dimension: index.dimension(),
        index_checksum: checksum(&index_bytes),
        embedding_model: manifest.embedding_model.clone(),
        chunks: manifest.chunks.clone(),
    };
    let manifest_bytes = serde_json::to_vec_pretty(&file)
        .map_err(|e| RagError::PipelineError(format!("cannot serialize manifest: {e}")))?;

    write_atomic(index_path, &index_bytes)?;
    write_atomic(manifest_path, &manifest_bytes)?;
    Ok(())
}

/// Load a previously saved index/manifest pair.
///
/// # Errors
///
/// Returns [`RagError::IndexCorruption`] if either file is missing,
/// truncated, of an unknown format, or inconsistent with the other.
pub fn load(index_path: &Path, manifest_path: &Path) -> Result<(VectorIndex, Manifest)> {
    let index_bytes = fs::read(index_path)
        .map_err(|e| RagError::corruption(index_path, format!("cannot read index: {e}")))?;
    let manifest_bytes = fs::read(manifest_path)
        .map_err(|e| RagError::corruption(manifest_path, format!("cannot read manifest: {e}")))?;

    let file: ManifestFile = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| RagError::corruption(manifest_path, format!("malformed manifest: {e}")))?;
    if file.format != MANIFEST_FORMAT {
        return Err(RagError::corruption(
            manifest_path,
            format!("unknown manifest format '{}'", file.format),
        ));
    }
    if file.version != MANIFEST_VERSION {
        return Err(RagError::corruption(
            manifest_path,
            format!("unsupported manifest version {}", file.version),
        ));
    }
    if file.index_checksum != checksum(&index_bytes) {
        return Err(RagError::corruption(manifest_path, "manifest does not belong to this index"));
    }

    let index = decode_index(&index_bytes)
        .map_err(|message| RagError::corruption(index_path, message))?;
    if file.metric != index.metric() || file.dimension != index.dimension() {
        return Err(RagError::corruption(
            manifest_path,
            "manifest metric or dimension disagrees with the index",
        ));
    }

    let manifest = Manifest { embedding_model: file.embedding_model, chunks: file.chunks };
    check_pairing(&index, &manifest).map_err(|message| RagError::corruption(manifest_path, message))?;
    Ok((index, manifest))
}

fn check_pairing(index: &VectorIndex, manifest: &Manifest) -> std::result::Result<(), String> {
    if index.len() != manifest.chunks.len() {
        return Err(format!(
            "index has {} entries but manifest has {} chunks",
            index.len(),
            manifest.chunks.len()
        ));
    }
    if let Some((position, chunk)) =
        manifest.chunks.iter().enumerate().find(|(i, c)| index.id(*i) != Some(c.id.as_str()))
    {
        return Err(format!("entry {position} is '{}' in the manifest but not in the index", chunk.id));
    }
    Ok(())
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn encode_index(index: &VectorIndex) -> Vec<u8> {
    let ids = index.ids();
    let data = index.data();
    let id_bytes: usize = ids.iter().map(|id| 4 + id.len()).sum();
    let mut out = Vec::with_capacity(20 + id_bytes + std::mem::size_of_val(data));

    out.extend_from_slice(INDEX_MAGIC);
    out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    out.push(index.metric().tag());
    out.push(0);
    out.extend_from_slice(&(index.dimension().unwrap_or(0) as u32).to_le_bytes());
    out.extend_from_slice(&(ids.len() as u64).to_le_bytes());
    for id in ids {
        out.extend_from_slice(&(id.len() as u32).to_le_bytes());
        out.extend_from_slice(id.as_bytes());
    }
    for value in data {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Bounds-checked little-endian reader.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len()).ok_or_else(
            || format!("truncated: needed {n} bytes at offset {}", self.pos),
        )?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> std::result::Result<u8, String> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> std::result::Result<u16, String> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

fn decode_index(bytes: &[u8]) -> std::result::Result<VectorIndex, String> {
    let mut reader = Reader { bytes, pos: 0 };

    if &reader.array::<4>()? != INDEX_MAGIC {
        return Err("not an index file (bad magic)".to_string());
    }
    let version = reader.u16()?;
    if version != INDEX_VERSION {
        return Err(format!("unsupported index version {version}"));
    }
    let tag = reader.u8()?;
    let metric = DistanceMetric::from_tag(tag).ok_or_else(|| format!("unknown metric tag {tag}"))?;
    reader.u8()?;
    let dimension = reader.u32()? as usize;
    let count = usize::try_from(reader.u64()?).map_err(|_| "entry count overflows".to_string())?;

    if dimension == 0 && count > 0 {
        return Err("entries recorded without a dimension".to_string());
    }
    // Every entry needs at least a 4-byte id length; reject absurd counts early.
    if count > bytes.len() / 4 {
        return Err(format!("truncated: {count} entries cannot fit in {} bytes", bytes.len()));
    }

    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.u32()? as usize;
        let raw = reader.take(len)?;
        let id = std::str::from_utf8(raw).map_err(|_| "id is not valid UTF-8".to_string())?;
        ids.push(id.to_string());
    }

    let values = count
        .checked_mul(dimension)
        .ok_or_else(|| "vector data size overflows".to_string())?;
    let raw = reader.take(values.checked_mul(4).ok_or_else(|| "vector data size overflows".to_string())?)?;
    let data: Vec<f32> = raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    if reader.pos != bytes.len() {
        return Err(format!("{} trailing bytes after vector data", bytes.len() - reader.pos));
    }

    let dimension = (dimension > 0).then_some(dimension);
    Ok(VectorIndex::from_parts(metric, dimension, ids, data))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::document::{Metadata, MetadataKey};

    fn chunk(id: &str, text: &str) -> Chunk {
        let mut metadata = Metadata::new();
        metadata.insert(MetadataKey::Type, "faq".to_string());
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            source_document: "faq.txt".to_string(),
            offset: 0,
            metadata,
        }
    }

    fn sample(metric: DistanceMetric) -> (VectorIndex, Manifest) {
        let mut index = VectorIndex::new(metric);
        index
            .insert(vec![
                ("faq.txt#0".to_string(), vec![0.1, 0.2, 0.3]),
                ("faq.txt#1".to_string(), vec![-1.0, 0.5, 2.0]),
                ("faq.txt#2".to_string(), vec![0.0, 0.0, 1.0]),
            ])
            .unwrap();
        let manifest = Manifest {
            embedding_model: "hashing/fnv1a-bow-v1".to_string(),
            chunks: vec![chunk("faq.txt#0", "a"), chunk("faq.txt#1", "b"), chunk("faq.txt#2", "c")],
        };
        (index, manifest)
    }

    #[test]
    fn save_then_load_preserves_search_results() {
        let dir = tempdir().unwrap();
        let (ip, mp) = (dir.path().join("kb_index.bin"), dir.path().join("kb_manifest.json"));

        for metric in [DistanceMetric::SquaredL2, DistanceMetric::Cosine] {
            let (index, manifest) = sample(metric);
            save(&index, &manifest, &ip, &mp).unwrap();
            let (loaded, loaded_manifest) = load(&ip, &mp).unwrap();

            assert_eq!(loaded, index);
            assert_eq!(loaded_manifest, manifest);
            for query in [[0.0, 0.0, 0.0], [1.0, -1.0, 0.5], [0.1, 0.2, 0.3]] {
                assert_eq!(loaded.search(&query, 3).unwrap(), index.search(&query, 3).unwrap());
            }
        }
    }

    #[test]
    fn empty_index_round_trips() {
        let dir = tempdir().unwrap();
        let (ip, mp) = (dir.path().join("i.bin"), dir.path().join("m.json"));
        let index = VectorIndex::new(DistanceMetric::SquaredL2);
        save(&index, &Manifest::new("m"), &ip, &mp).unwrap();

        let (loaded, manifest) = load(&ip, &mp).unwrap();
        assert!(loaded.is_empty());
        assert!(manifest.chunks.is_empty());
    }

    #[test]
    fn save_leaves_no_temporary_files_and_creates_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("data").join("kb");
        let (index, manifest) = sample(DistanceMetric::SquaredL2);
        save(&index, &manifest, &nested.join("i.bin"), &nested.join("m.json")).unwrap();

        let mut names: Vec<String> = fs::read_dir(&nested)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["i.bin", "m.json"]);
    }

    #[test]
    fn missing_files_are_corruption() {
        let dir = tempdir().unwrap();
        let (ip, mp) = (dir.path().join("i.bin"), dir.path().join("m.json"));
        assert!(matches!(load(&ip, &mp), Err(RagError::IndexCorruption { .. })));

        let (index, manifest) = sample(DistanceMetric::SquaredL2);
        save(&index, &manifest, &ip, &mp).unwrap();
        fs::remove_file(&mp).unwrap();
        assert!(matches!(load(&ip, &mp), Err(RagError::IndexCorruption { .. })));
    }

    #[test]
    fn truncated_index_is_corruption() {
        let bytes = encode_index(&sample(DistanceMetric::SquaredL2).0);
        for cut in [0, 3, 10, 25, bytes.len() - 1] {
            assert!(decode_index(&bytes[..cut]).is_err(), "cut at {cut} was accepted");
        }
        let mut extended = bytes.clone();
        extended.push(0);
        assert!(decode_index(&extended).unwrap_err().contains("trailing"));
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let mut bytes = encode_index(&sample(DistanceMetric::SquaredL2).0);
        bytes[0] = b'X';
        assert!(decode_index(&bytes).unwrap_err().contains("magic"));

        let mut bytes = encode_index(&sample(DistanceMetric::SquaredL2).0);
        bytes[4] = 9;
        assert!(decode_index(&bytes).unwrap_err().contains("version"));

        let dir = tempdir().unwrap();
        let (ip, mp) = (dir.path().join("i.bin"), dir.path().join("m.json"));
        let (index, manifest) = sample(DistanceMetric::SquaredL2);
        save(&index, &manifest, &ip, &mp).unwrap();
        let text = fs::read_to_string(&mp).unwrap().replace(MANIFEST_FORMAT, "something-else");
        fs::write(&mp, text).unwrap();
        let err = load(&ip, &mp).unwrap_err();
        assert!(err.to_string().contains("unknown manifest format"));
    }

    #[test]
    fn index_from_another_save_is_detected() {
        let dir = tempdir().unwrap();
        let (ip, mp) = (dir.path().join("i.bin"), dir.path().join("m.json"));
        let (index, manifest) = sample(DistanceMetric::SquaredL2);
        save(&index, &manifest, &ip, &mp).unwrap();

        // Simulate a crash after the index rename but before the manifest rename.
        let mut newer = index.clone();
        newer.insert(vec![("faq.txt#3".to_string(), vec![1.0, 1.0, 1.0])]).unwrap();
        fs::write(&ip, encode_index(&newer)).unwrap();

        let err = load(&ip, &mp).unwrap_err();
        assert!(err.to_string().contains("does not belong"));
    }

    #[test]
    fn manifest_chunk_count_must_match_index() {
        let dir = tempdir().unwrap();
        let (ip, mp) = (dir.path().join("i.bin"), dir.path().join("m.json"));
        let (index, manifest) = sample(DistanceMetric::SquaredL2);
        save(&index, &manifest, &ip, &mp).unwrap();

        let mut file: serde_json::Value = serde_json::from_slice(&fs::read(&mp).unwrap()).unwrap();
        file["chunks"].as_array_mut().unwrap().pop();
        fs::write(&mp, serde_json::to_vec(&file).unwrap()).unwrap();

        let err = load(&ip, &mp).unwrap_err();
        assert!(matches!(err, RagError::IndexCorruption { .. }));
        assert!(err.to_string().contains("3 entries but manifest has 2 chunks"));
    }

    #[test]
    fn save_refuses_mismatched_pairs() {
        let dir = tempdir().unwrap();
        let (index, mut manifest) = sample(DistanceMetric::SquaredL2);
        manifest.chunks.swap(0, 1);
        let err = save(&index, &manifest, &dir.path().join("i"), &dir.path().join("m")).unwrap_err();
        assert!(matches!(err, RagError::PipelineError(_)));
        assert!(!dir.path().join("i").exists());
    }
}
