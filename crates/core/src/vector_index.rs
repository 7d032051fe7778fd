//! Persisted flat (exact L2) vector index keyed by product id.
//!
//! On disk the index is two files in one directory: raw little-endian `f32`
//! rows and a JSON document store holding the dimension, a checksum of the
//! rows, and one entry per row. Both must exist and be non-empty.
//!
//! Every load-mutate-persist sequence runs under one async mutex, so the
//! ingestion pipeline and single-item adds cannot interleave their writes.

use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::models::IngestionOptions;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Product id of the placeholder row that keeps a fresh index non-empty.
pub const SENTINEL_PRODUCT_ID: i64 = -1;

const SENTINEL_TEXT: &str = "Initialize empty vector index";
const VECTORS_FILE: &str = "index.vectors";
const METADATA_FILE: &str = "index.meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub doc_id: Uuid,
    pub product_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexMetadata {
    dimensions: usize,
    checksum: String,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub product_id: i64,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

/// Maps a raw distance onto a 0..=100 similarity.
pub fn similarity_score(distance: f32) -> f64 {
    let distance = f64::from(distance);
    if !distance.is_finite() {
        return 0.0;
    }
    (100.0 / (1.0 + distance)).clamp(0.0, 100.0)
}

#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimensions: usize,
    vectors: Vec<f32>,
    entries: Vec<IndexEntry>,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn from_vectors(
        dimensions: usize,
        vectors: Vec<Vec<f32>>,
        product_ids: &[i64],
    ) -> Result<Self, IndexError> {
        let mut index = Self::new(dimensions);
        for (vector, product_id) in vectors.into_iter().zip(product_ids) {
            index.push(vector, *product_id)?;
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn push(&mut self, vector: Vec<f32>, product_id: i64) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                found: vector.len(),
            });
        }
        self.vectors.extend(vector);
        self.entries.push(IndexEntry {
            doc_id: Uuid::new_v4(),
            product_id,
        });
        Ok(())
    }

    /// Up to `k` nearest rows, nearest first; equal distances keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                found: query.len(),
            });
        }
        if self.dimensions == 0 {
            return Ok(Vec::new());
        }

        let mut scored = self
            .vectors
            .chunks_exact(self.dimensions)
            .zip(&self.entries)
            .map(|(row, entry)| Neighbor {
                product_id: entry.product_id,
                distance: squared_l2(row, query),
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| left.distance.total_cmp(&right.distance));
        scored.truncate(k);
        Ok(scored)
    }

    pub async fn save(&self, dir: &Path) -> Result<(), IndexError> {
        tokio::fs::create_dir_all(dir).await?;

        let bytes = vectors_to_bytes(&self.vectors);
        let metadata = IndexMetadata {
            dimensions: self.dimensions,
            checksum: checksum(&bytes),
            entries: self.entries.clone(),
        };

        write_atomically(&dir.join(VECTORS_FILE), &bytes).await?;
        write_atomically(&dir.join(METADATA_FILE), &serde_json::to_vec(&metadata)?).await?;
        Ok(())
    }

    pub async fn load(dir: &Path) -> Result<Self, IndexError> {
        let bytes = tokio::fs::read(dir.join(VECTORS_FILE)).await?;
        let raw_metadata = tokio::fs::read(dir.join(METADATA_FILE)).await?;
        Self::decode(dir, &bytes, &raw_metadata)
    }

    fn decode(dir: &Path, bytes: &[u8], raw_metadata: &[u8]) -> Result<Self, IndexError> {
        if bytes.is_empty() || raw_metadata.is_empty() {
            return Err(IndexError::Corrupt(format!(
                "zero-length index file in {}",
                dir.display()
            )));
        }

        let metadata: IndexMetadata = serde_json::from_slice(raw_metadata)?;
        if metadata.checksum != checksum(bytes) {
            return Err(IndexError::Corrupt(format!(
                "vector checksum mismatch in {}",
                dir.display()
            )));
        }

        let vectors = bytes_to_vectors(bytes);
        if vectors.len() != metadata.entries.len() * metadata.dimensions {
            return Err(IndexError::Corrupt(format!(
                "{} floats for {} entries of dimension {}",
                vectors.len(),
                metadata.entries.len(),
                metadata.dimensions
            )));
        }

        Ok(Self {
            dimensions: metadata.dimensions,
            vectors,
            entries: metadata.entries,
        })
    }
}

fn squared_l2(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right)
        .map(|(a, b)| {
            let delta = a - b;
            delta * delta
        })
        .sum()
}

fn vectors_to_bytes(vectors: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vectors.len() * 4);
    for value in vectors {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn bytes_to_vectors(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, bytes).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

async fn file_is_valid(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.len() > 0)
}

pub struct VectorIndexManager {
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    rebuild_seed_size: usize,
    state: Mutex<Option<FlatIndex>>,
}

impl VectorIndexManager {
    pub fn new(dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        let defaults = IngestionOptions::default();
        Self {
            dir: dir.into(),
            embedder,
            batch_size: defaults.index_batch_size,
            rebuild_seed_size: defaults.rebuild_seed_size,
            state: Mutex::new(None),
        }
    }

    pub fn with_options(mut self, options: &IngestionOptions) -> Self {
        self.batch_size = options.index_batch_size.max(1);
        self.rebuild_seed_size = options.rebuild_seed_size.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a sentinel-only index when none exists or a file is zero-length.
    pub async fn ensure_initialized(&self) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;
        self.ensure_initialized_locked(&mut state).await
    }

    async fn ensure_initialized_locked(
        &self,
        state: &mut Option<FlatIndex>,
    ) -> Result<(), IndexError> {
        let vectors_path = self.dir.join(VECTORS_FILE);
        let metadata_path = self.dir.join(METADATA_FILE);
        if file_is_valid(&vectors_path).await && file_is_valid(&metadata_path).await {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        for path in [&vectors_path, &metadata_path] {
            if tokio::fs::try_exists(path).await? {
                warn!(path = %path.display(), "removing empty vector index file");
                tokio::fs::remove_file(path).await?;
            }
        }

        let sentinel = self.embedder.embed(SENTINEL_TEXT).await?;
        let mut index = FlatIndex::new(self.embedder.dimensions());
        index.push(sentinel, SENTINEL_PRODUCT_ID)?;
        index.save(&self.dir).await?;
        *state = Some(index);

        info!(dir = %self.dir.display(), "initialized sentinel-only vector index");
        Ok(())
    }

    /// Embeds and appends `texts`, persisting after every sub-batch. On failure
    /// the index is rebuilt once from the pending texts; a failed rebuild is fatal.
    pub async fn add_batch(&self, texts: &[String], product_ids: &[i64]) -> Result<usize, IndexError> {
        if texts.len() != product_ids.len() {
            return Err(IndexError::LengthMismatch {
                texts: texts.len(),
                ids: product_ids.len(),
            });
        }
        if texts.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock().await;

        let attempt = match self.ensure_initialized_locked(&mut state).await {
            Ok(()) => self.append_batches(&mut state, texts, product_ids).await,
            Err(error) => Err(error),
        };

        let failure = match attempt {
            Ok(()) => {
                info!(added = texts.len(), "updated vector index");
                return Ok(texts.len());
            }
            Err(failure) => failure,
        };

        error!(error = %failure, "failed to update vector index, attempting rebuild");
        *state = None;

        match self.rebuild(&mut state, texts, product_ids).await {
            Ok(()) => {
                info!(added = texts.len(), "rebuilt vector index");
                Ok(texts.len())
            }
            Err(rebuild_error) => {
                error!(error = %rebuild_error, "failed to rebuild vector index");
                *state = None;
                Err(IndexError::RebuildFailed {
                    original: failure.to_string(),
                    source: Box::new(rebuild_error),
                })
            }
        }
    }

    pub async fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        let mut state = self.state.lock().await;
        let index = self.loaded(&mut state).await?;
        index.search(query_vector, k)
    }

    pub async fn len(&self) -> Result<usize, IndexError> {
        let mut state = self.state.lock().await;
        Ok(self.loaded(&mut state).await?.len())
    }

    async fn loaded<'a>(
        &self,
        state: &'a mut Option<FlatIndex>,
    ) -> Result<&'a mut FlatIndex, IndexError> {
        let index = match state.take() {
            Some(index) => index,
            None => FlatIndex::load(&self.dir).await?,
        };

        if index.dimensions() != self.embedder.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: self.embedder.dimensions(),
                found: index.dimensions(),
            });
        }

        Ok(state.insert(index))
    }

    async fn append_batches(
        &self,
        state: &mut Option<FlatIndex>,
        texts: &[String],
        product_ids: &[i64],
    ) -> Result<(), IndexError> {
        let index = self.loaded(state).await?;

        for (batch_no, (batch_texts, batch_ids)) in texts
            .chunks(self.batch_size)
            .zip(product_ids.chunks(self.batch_size))
            .enumerate()
        {
            info!(
                batch = batch_no + 1,
                size = batch_texts.len(),
                "adding vector index batch"
            );

            let vectors = self.embed_rows(batch_texts).await?;
            for (vector, product_id) in vectors.into_iter().zip(batch_ids) {
                index.push(vector, *product_id)?;
            }
            index.save(&self.dir).await?;
        }

        Ok(())
    }

    async fn rebuild(
        &self,
        state: &mut Option<FlatIndex>,
        texts: &[String],
        product_ids: &[i64],
    ) -> Result<(), IndexError> {
        let seed = self.rebuild_seed_size.min(texts.len());
        let seed_vectors = self.embed_rows(&texts[..seed]).await?;
        let index = FlatIndex::from_vectors(
            self.embedder.dimensions(),
            seed_vectors,
            &product_ids[..seed],
        )?;
        index.save(&self.dir).await?;
        *state = Some(index);

        self.append_batches(state, &texts[seed..], &product_ids[seed..])
            .await
    }

    /// One vector per text, or an error; never a silently shorter list.
    async fn embed_rows(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let vectors = self.embedder.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(IndexError::EmbeddingCountMismatch {
                texts: texts.len(),
                vectors: vectors.len(),
            });
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::EmbeddingError;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Fails the first `failures` texts containing "poison", then behaves.
    struct FlakyEmbedder {
        inner: CharacterNgramEmbedder,
        failures: AtomicUsize,
    }

    impl FlakyEmbedder {
        fn new(failures: usize) -> Self {
            Self {
                inner: CharacterNgramEmbedder::default(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn dimensions(&self) -> usize {
            self.inner.dimensions
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.contains("poison") {
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(EmbeddingError::Provider("out of memory".to_string()));
                }
            }
            Ok(self.inner.embed_sync(text))
        }
    }

    /// Returns one vector fewer than it was asked for.
    struct ShortEmbedder(CharacterNgramEmbedder);

    #[async_trait]
    impl Embedder for ShortEmbedder {
        fn dimensions(&self) -> usize {
            self.0.dimensions
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(self.0.embed_sync(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts
                .iter()
                .skip(1)
                .map(|text| self.0.embed_sync(text))
                .collect())
        }
    }

    fn texts(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn manager(dir: &Path, embedder: Arc<dyn Embedder>, batch_size: usize) -> VectorIndexManager {
        VectorIndexManager::new(dir, embedder).with_options(&IngestionOptions {
            index_batch_size: batch_size,
            rebuild_seed_size: 2,
            ..IngestionOptions::default()
        })
    }

    #[tokio::test]
    async fn initializes_sentinel_only_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index_dir = dir.path().join("index");
        let manager = manager(&index_dir, Arc::new(CharacterNgramEmbedder::default()), 50);

        manager.ensure_initialized().await?;

        assert!(file_is_valid(&index_dir.join(VECTORS_FILE)).await);
        assert!(file_is_valid(&index_dir.join(METADATA_FILE)).await);
        assert_eq!(manager.len().await?, 1);

        let query = CharacterNgramEmbedder::default().embed_sync("anything");
        let hits = manager.search(&query, 10).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].product_id, SENTINEL_PRODUCT_ID);
        Ok(())
    }

    #[tokio::test]
    async fn zero_byte_index_is_replaced_before_adding() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join(VECTORS_FILE), b"")?;
        fs::write(dir.path().join(METADATA_FILE), b"{}")?;

        let manager = manager(dir.path(), Arc::new(CharacterNgramEmbedder::default()), 50);
        manager.ensure_initialized().await?;
        assert_eq!(manager.len().await?, 1);

        let added = manager
            .add_batch(&texts(&["high voltage relay 24V"]), &[7])
            .await?;
        assert_eq!(added, 1);

        let reloaded = FlatIndex::load(dir.path()).await?;
        let ids = reloaded
            .entries()
            .iter()
            .map(|entry| entry.product_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![SENTINEL_PRODUCT_ID, 7]);
        Ok(())
    }

    #[tokio::test]
    async fn batches_are_persisted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let embedder: Arc<dyn Embedder> = Arc::new(CharacterNgramEmbedder::default());
        let manager = manager(dir.path(), embedder.clone(), 2);

        manager
            .add_batch(&texts(&["a relay", "b sensor", "c switch", "d fuse", "e diode"]), &[1, 2, 3, 4, 5])
            .await?;

        let reopened = VectorIndexManager::new(dir.path(), embedder);
        assert_eq!(reopened.len().await?, 6);
        Ok(())
    }

    #[tokio::test]
    async fn failed_batch_triggers_rebuild_from_pending_texts() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let manager = manager(dir.path(), Arc::new(FlakyEmbedder::new(1)), 2);
        manager.ensure_initialized().await?;

        let pending = texts(&["relay", "sensor", "poison pill", "fuse"]);
        let added = manager.add_batch(&pending, &[1, 2, 3, 4]).await?;
        assert_eq!(added, 4);

        let rebuilt = FlatIndex::load(dir.path()).await?;
        let ids = rebuilt
            .entries()
            .iter()
            .map(|entry| entry.product_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_rebuild_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let manager = manager(dir.path(), Arc::new(FlakyEmbedder::new(2)), 2);
        manager.ensure_initialized().await?;

        let result = manager
            .add_batch(&texts(&["relay", "poison pill"]), &[1, 2])
            .await;

        assert!(matches!(result, Err(IndexError::RebuildFailed { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn short_embedding_batch_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let manager = manager(
            dir.path(),
            Arc::new(ShortEmbedder(CharacterNgramEmbedder::default())),
            2,
        );

        let result = manager.add_batch(&texts(&["relay", "sensor"]), &[1, 2]).await;

        match result {
            Err(IndexError::RebuildFailed { source, .. }) => assert!(matches!(
                *source,
                IndexError::EmbeddingCountMismatch {
                    texts: 2,
                    vectors: 1
                }
            )),
            other => panic!("expected a failed rebuild, got {other:?}"),
        }
        assert_eq!(manager.len().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_inputs_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path(), Arc::new(CharacterNgramEmbedder::default()), 2);
        let result = manager.add_batch(&texts(&["a", "b"]), &[1]).await;
        assert!(matches!(result, Err(IndexError::LengthMismatch { texts: 2, ids: 1 })));
    }

    #[test]
    fn search_orders_by_distance_then_insertion() -> Result<(), IndexError> {
        let mut index = FlatIndex::new(2);
        index.push(vec![3.0, 0.0], 1)?;
        index.push(vec![1.0, 0.0], 2)?;
        index.push(vec![1.0, 0.0], 3)?;
        index.push(vec![0.0, 0.0], 4)?;

        let hits = index.search(&[0.0, 0.0], 3)?;
        let ids = hits.iter().map(|hit| hit.product_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![4, 2, 3]);
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[1].distance, 1.0);
        assert!(index.search(&[0.0], 1).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn tampered_vectors_are_detected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut index = FlatIndex::new(2);
        index.push(vec![1.0, 2.0], 9)?;
        index.save(dir.path()).await?;

        fs::write(dir.path().join(VECTORS_FILE), vectors_to_bytes(&[5.0, 5.0]))?;
        assert!(matches!(
            FlatIndex::load(dir.path()).await,
            Err(IndexError::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn similarity_is_bounded() {
        assert_eq!(similarity_score(0.0), 100.0);
        assert_eq!(similarity_score(1.0), 50.0);
        assert!(similarity_score(1.0e9) >= 0.0);
        assert_eq!(similarity_score(f32::NAN), 0.0);
        assert_eq!(similarity_score(-0.5), 100.0);
    }
}
