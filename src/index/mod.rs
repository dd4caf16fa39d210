//! Fixed-dimension vector index with approximate nearest-neighbor search.
//!
//! Two variants share one API: [`IndexKind::Flat`] scans every vector for
//! exact L2 ranking, [`IndexKind::Ivf`] clusters vectors at first add and
//! probes only the nearest clusters. Vector ids are assigned monotonically
//! per index instance and map to the metadata handed in alongside each
//! vector; snapshots round-trip both through [`VectorIndex::save`] and
//! [`VectorIndex::load_or_new`].

mod ivf;

use std::path::Path;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::instrument;

use crate::config::IndexDefaults;
use crate::types::{Metadata, Vector};
use ivf::{IvfState, l2_distance};

/// Index-assigned vector identifier. Monotonic per index instance.
pub type VectorId = usize;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by index operations.
///
/// Structural errors propagate to the caller; they indicate a programming
/// or configuration mistake, never a transient condition.
#[derive(Debug, Error, Diagnostic)]
pub enum IndexError {
    /// A vector's dimension does not match the index's configured one.
    #[error("dimension mismatch: index expects {expected}, got {got}")]
    #[diagnostic(
        code(carbonloom::index::dimension_mismatch),
        help("Each granularity level has its own embedding dimension; check which level this index serves.")
    )]
    DimensionMismatch { expected: usize, got: usize },

    /// The index variant does not support the requested operation.
    #[error("{operation} is not supported by {kind} indexes")]
    #[diagnostic(
        code(carbonloom::index::unsupported_operation),
        help("Flat indexes cannot remove vectors; use the clustered variant when deletion is needed.")
    )]
    UnsupportedOperation {
        operation: &'static str,
        kind: IndexKind,
    },

    /// Malformed input to a public method.
    #[error("invalid index input: {0}")]
    #[diagnostic(code(carbonloom::index::validation))]
    Validation(String),

    /// Snapshot I/O failed.
    #[error("index snapshot error: {0}")]
    #[diagnostic(code(carbonloom::index::snapshot))]
    Snapshot(#[from] std::io::Error),

    /// A snapshot file exists but does not parse.
    #[error("index snapshot is corrupt: {0}")]
    #[diagnostic(
        code(carbonloom::index::corrupt),
        help("Delete the snapshot file to rebuild the index from scratch.")
    )]
    Corrupt(#[from] serde_json::Error),
}

// ============================================================================
// Settings
// ============================================================================

/// Index variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact scan over every stored vector. No deletion support.
    Flat,
    /// Inverted-file clustering trained on the first added batch.
    Ivf,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKind::Flat => f.write_str("flat"),
            IndexKind::Ivf => f.write_str("ivf"),
        }
    }
}

/// Construction-time settings for one index.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IndexSettings {
    pub dimension: usize,
    pub kind: IndexKind,
    /// Target cluster count for the clustered variant.
    pub nlist: usize,
    /// Clusters probed per search unless overridden per call.
    pub nprobe: usize,
}

impl IndexSettings {
    /// Flat exact-search index of the given dimension.
    #[must_use]
    pub fn flat(dimension: usize) -> Self {
        let defaults = IndexDefaults::default();
        Self {
            dimension,
            kind: IndexKind::Flat,
            nlist: defaults.nlist,
            nprobe: defaults.nprobe,
        }
    }

    /// Clustered index of the given dimension with default calibration.
    #[must_use]
    pub fn ivf(dimension: usize) -> Self {
        Self {
            kind: IndexKind::Ivf,
            ..Self::flat(dimension)
        }
    }

    #[must_use]
    pub fn with_nlist(mut self, nlist: usize) -> Self {
        self.nlist = nlist.max(1);
        self
    }

    #[must_use]
    pub fn with_nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = nprobe.max(1);
        self
    }
}

// ============================================================================
// Search Output
// ============================================================================

/// Parallel result arrays from one search, ranked by ascending distance.
#[derive(Clone, Debug, Default)]
pub struct SearchMatches {
    pub distances: Vec<f32>,
    pub ids: Vec<VectorId>,
    pub metadata: Vec<Metadata>,
}

impl SearchMatches {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterates matches as `(distance, id, metadata)` tuples.
    pub fn iter(&self) -> impl Iterator<Item = (f32, VectorId, &Metadata)> {
        self.distances
            .iter()
            .copied()
            .zip(self.ids.iter().copied())
            .zip(self.metadata.iter())
            .map(|((distance, id), metadata)| (distance, id, metadata))
    }
}

// ============================================================================
// Index
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct IndexState {
    settings: IndexSettings,
    /// Slot per assigned id; removed vectors leave a `None` so ids are
    /// never reused.
    vectors: Vec<Option<Vector>>,
    metadata: FxHashMap<VectorId, Metadata>,
    ivf: Option<IvfState>,
}

/// A single-level vector index with interior locking.
///
/// Reads (search, stats, save) take a shared lock; structural writes
/// (add, remove) take the exclusive lock, giving the
/// single-writer-multiple-reader discipline the engine relies on.
///
/// # Examples
///
/// ```
/// use carbonloom::index::{IndexSettings, VectorIndex};
/// use carbonloom::types::Metadata;
/// use serde_json::json;
///
/// let index = VectorIndex::new(IndexSettings::flat(2));
/// let ids = index
///     .add(
///         &[vec![0.0, 1.0], vec![1.0, 0.0]],
///         &[
///             Metadata::new().with("doc_id", json!("a")),
///             Metadata::new().with("doc_id", json!("b")),
///         ],
///     )
///     .unwrap();
/// assert_eq!(ids, vec![0, 1]);
///
/// let matches = index.search(&[0.0, 0.9], 1, None).unwrap();
/// assert_eq!(matches.metadata[0].doc_id(), Some("a"));
/// ```
#[derive(Debug)]
pub struct VectorIndex {
    state: RwLock<IndexState>,
}

impl VectorIndex {
    #[must_use]
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            state: RwLock::new(IndexState {
                settings,
                vectors: Vec::new(),
                metadata: FxHashMap::default(),
                ivf: None,
            }),
        }
    }

    /// Adds a batch of vectors with their metadata, returning assigned ids.
    ///
    /// The clustered variant calibrates itself on the first call, using the
    /// incoming batch as the training sample.
    pub fn add(
        &self,
        vectors: &[Vector],
        metadata: &[Metadata],
    ) -> Result<Vec<VectorId>, IndexError> {
        if vectors.len() != metadata.len() {
            return Err(IndexError::Validation(format!(
                "{} vectors with {} metadata entries",
                vectors.len(),
                metadata.len()
            )));
        }
        if vectors.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.state.write();
        let expected = state.settings.dimension;
        for vector in vectors {
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }

        if state.settings.kind == IndexKind::Ivf && state.ivf.is_none() {
            let trained = IvfState::train(vectors, state.settings.nlist, expected);
            tracing::debug!(
                clusters = trained.cluster_count(),
                batch = vectors.len(),
                "trained clustered index on first add"
            );
            state.ivf = Some(trained);
        }

        let mut ids = Vec::with_capacity(vectors.len());
        for (vector, meta) in vectors.iter().zip(metadata.iter()) {
            let id = state.vectors.len();
            state.vectors.push(Some(vector.clone()));
            state.metadata.insert(id, meta.clone());
            if let Some(ivf) = state.ivf.as_mut() {
                ivf.assign(id, vector);
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Returns the `k` nearest stored vectors to `query` by L2 distance.
    ///
    /// `probe_width` overrides the configured probe count for this call
    /// only; the stored setting is untouched, so concurrent searches never
    /// observe each other's overrides. An empty or untrained index yields
    /// an empty result, never an error.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        probe_width: Option<usize>,
    ) -> Result<SearchMatches, IndexError> {
        let state = self.state.read();
        if query.len() != state.settings.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: state.settings.dimension,
                got: query.len(),
            });
        }
        if k == 0 {
            return Ok(SearchMatches::default());
        }

        let mut ranked: Vec<(f32, VectorId)> = match state.settings.kind {
            IndexKind::Flat => state
                .vectors
                .iter()
                .enumerate()
                .filter_map(|(id, slot)| {
                    slot.as_ref().map(|vector| (l2_distance(query, vector), id))
                })
                .collect(),
            IndexKind::Ivf => {
                let Some(ivf) = state.ivf.as_ref() else {
                    return Ok(SearchMatches::default());
                };
                let nprobe = probe_width.unwrap_or(state.settings.nprobe);
                ivf.probe(query, nprobe)
                    .into_iter()
                    .filter_map(|id| {
                        state.vectors[id]
                            .as_ref()
                            .map(|vector| (l2_distance(query, vector), id))
                    })
                    .collect()
            }
        };

        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked.truncate(k);

        let mut matches = SearchMatches::default();
        for (distance, id) in ranked {
            matches.distances.push(distance);
            matches.ids.push(id);
            matches
                .metadata
                .push(state.metadata.get(&id).cloned().unwrap_or_default());
        }
        Ok(matches)
    }

    /// Removes vectors by id. Unknown ids are ignored; the count of
    /// actually removed vectors is returned.
    ///
    /// Flat indexes fail with [`IndexError::UnsupportedOperation`].
    pub fn remove(&self, ids: &[VectorId]) -> Result<usize, IndexError> {
        let mut state = self.state.write();
        if state.settings.kind == IndexKind::Flat {
            return Err(IndexError::UnsupportedOperation {
                operation: "remove",
                kind: IndexKind::Flat,
            });
        }

        let mut removed = 0;
        for &id in ids {
            let slot_taken = state
                .vectors
                .get_mut(id)
                .map(|slot| slot.take().is_some())
                .unwrap_or(false);
            if slot_taken {
                state.metadata.remove(&id);
                if let Some(ivf) = state.ivf.as_mut() {
                    ivf.unassign(id);
                }
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Number of vectors currently stored.
    pub fn len(&self) -> usize {
        self.state
            .read()
            .vectors
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.state.read().settings.dimension
    }

    pub fn kind(&self) -> IndexKind {
        self.state.read().settings.kind
    }

    /// Configured probe width. Per-call overrides never change this.
    pub fn nprobe(&self) -> usize {
        self.state.read().settings.nprobe
    }

    /// Metadata of every live vector, in id order.
    pub fn metadata_snapshot(&self) -> Vec<Metadata> {
        let state = self.state.read();
        (0..state.vectors.len())
            .filter(|id| state.vectors[*id].is_some())
            .filter_map(|id| state.metadata.get(&id).cloned())
            .collect()
    }

    /// Writes a snapshot of the index and its metadata map.
    ///
    /// The snapshot is written to a temporary file and renamed into place,
    /// so a crash mid-save never leaves an unreadable file at `path`.
    #[instrument(skip(self, path), err)]
    pub async fn save(&self, path: &Path) -> Result<(), IndexError> {
        let bytes = {
            let state = self.state.read();
            serde_json::to_vec(&*state)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Restores an index from a snapshot written by [`VectorIndex::save`].
    #[instrument(skip(path), err)]
    pub async fn load(path: &Path) -> Result<Self, IndexError> {
        let bytes = fs::read(path).await?;
        let state: IndexState = serde_json::from_slice(&bytes)?;
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Loads a prior snapshot if one exists at `path`, otherwise starts
    /// empty with `settings`. A snapshot with a different dimension than
    /// requested is rejected rather than silently adopted.
    pub async fn load_or_new(path: &Path, settings: IndexSettings) -> Result<Self, IndexError> {
        if fs::try_exists(path).await? {
            let index = Self::load(path).await?;
            let loaded = index.dimension();
            if loaded != settings.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: settings.dimension,
                    got: loaded,
                });
            }
            Ok(index)
        } else {
            Ok(Self::new(settings))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(doc: &str) -> Metadata {
        Metadata::new().with("doc_id", json!(doc))
    }

    fn unit_vectors(n: usize, dim: usize) -> (Vec<Vector>, Vec<Metadata>) {
        let vectors: Vec<Vector> = (0..n)
            .map(|i| {
                let mut v = vec![0.0; dim];
                v[i % dim] = 1.0 + (i / dim) as f32;
                v
            })
            .collect();
        let metadata = (0..n).map(|i| meta(&format!("doc_{i}"))).collect();
        (vectors, metadata)
    }

    #[test]
    fn add_assigns_sequential_ids() {
        let index = VectorIndex::new(IndexSettings::flat(3));
        let (vectors, metadata) = unit_vectors(4, 3);
        let first = index.add(&vectors[..2], &metadata[..2]).unwrap();
        let second = index.add(&vectors[2..], &metadata[2..]).unwrap();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, vec![2, 3]);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn add_rejects_mismatched_lengths() {
        let index = VectorIndex::new(IndexSettings::flat(2));
        let err = index.add(&[vec![0.0, 1.0]], &[]).unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));
    }

    #[test]
    fn add_rejects_wrong_dimension() {
        let index = VectorIndex::new(IndexSettings::flat(2));
        let err = index.add(&[vec![0.0, 1.0, 2.0]], &[meta("a")]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                got: 3
            }
        ));
    }

    #[test]
    fn search_rejects_wrong_dimension() {
        let index = VectorIndex::new(IndexSettings::flat(2));
        let err = index.search(&[1.0], 3, None).unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
    }

    #[test]
    fn empty_index_returns_empty_matches() {
        let index = VectorIndex::new(IndexSettings::ivf(4));
        let matches = index.search(&[0.0; 4], 5, None).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn flat_search_ranks_by_distance() {
        let index = VectorIndex::new(IndexSettings::flat(2));
        index
            .add(
                &[vec![0.0, 1.0], vec![1.0, 0.0], vec![0.0, 0.8]],
                &[meta("up"), meta("right"), meta("near_up")],
            )
            .unwrap();

        let matches = index.search(&[0.0, 1.0], 2, None).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches.metadata[0].doc_id(), Some("up"));
        assert_eq!(matches.metadata[1].doc_id(), Some("near_up"));
        assert!(matches.distances[0] <= matches.distances[1]);
        assert!(matches.distances.iter().all(|d| *d >= 0.0));
    }

    #[test]
    fn ivf_trains_on_first_add_and_searches() {
        let index = VectorIndex::new(IndexSettings::ivf(2).with_nlist(2));
        index
            .add(
                &[
                    vec![0.0, 0.1],
                    vec![0.1, 0.0],
                    vec![9.9, 10.0],
                    vec![10.0, 9.9],
                ],
                &[meta("a"), meta("b"), meta("c"), meta("d")],
            )
            .unwrap();

        let matches = index.search(&[10.0, 10.0], 1, None).unwrap();
        assert_eq!(matches.len(), 1);
        let hit = matches.metadata[0].doc_id().unwrap();
        assert!(hit == "c" || hit == "d");
    }

    #[test]
    fn probe_width_override_leaves_setting_untouched() {
        let index = VectorIndex::new(IndexSettings::ivf(2).with_nlist(2).with_nprobe(2));
        let (vectors, metadata) = unit_vectors(6, 2);
        index.add(&vectors, &metadata).unwrap();

        index.search(&[1.0, 0.0], 3, Some(1)).unwrap();
        assert_eq!(index.nprobe(), 2);

        // Error path leaves the setting untouched as well.
        let _ = index.search(&[1.0], 3, Some(1)).unwrap_err();
        assert_eq!(index.nprobe(), 2);
    }

    #[test]
    fn flat_remove_is_unsupported() {
        let index = VectorIndex::new(IndexSettings::flat(2));
        index.add(&[vec![1.0, 0.0]], &[meta("a")]).unwrap();
        let err = index.remove(&[0]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::UnsupportedOperation {
                operation: "remove",
                kind: IndexKind::Flat,
            }
        ));
    }

    #[test]
    fn ivf_remove_drops_vectors_without_reusing_ids() {
        let index = VectorIndex::new(IndexSettings::ivf(2).with_nlist(2));
        let (vectors, metadata) = unit_vectors(4, 2);
        index.add(&vectors, &metadata).unwrap();

        assert_eq!(index.remove(&[1, 99]).unwrap(), 1);
        assert_eq!(index.len(), 3);

        let ids = index.add(&[vec![0.5, 0.5]], &[meta("late")]).unwrap();
        assert_eq!(ids, vec![4], "freed ids must not be reassigned");

        let matches = index.search(&[0.0, 1.0], 10, Some(10)).unwrap();
        assert!(!matches.ids.contains(&1));
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_search_behavior() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.index");

        let index = VectorIndex::new(IndexSettings::ivf(2).with_nlist(2));
        index
            .add(
                &[vec![0.0, 1.0], vec![1.0, 0.0], vec![5.0, 5.0]],
                &[meta("a"), meta("b"), meta("c")],
            )
            .unwrap();
        index.save(&path).await.unwrap();

        let restored = VectorIndex::load(&path).await.unwrap();
        assert_eq!(restored.len(), 3);

        let before = index.search(&[0.0, 1.0], 3, Some(2)).unwrap();
        let after = restored.search(&[0.0, 1.0], 3, Some(2)).unwrap();
        assert_eq!(before.ids, after.ids);
        assert_eq!(before.distances, after.distances);
    }

    #[tokio::test]
    async fn load_or_new_starts_empty_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.index");
        let index = VectorIndex::load_or_new(&path, IndexSettings::flat(3))
            .await
            .unwrap();
        assert!(index.is_empty());
        assert_eq!(index.dimension(), 3);
    }

    #[tokio::test]
    async fn load_or_new_rejects_dimension_drift() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift.index");

        let index = VectorIndex::new(IndexSettings::flat(2));
        index.add(&[vec![1.0, 0.0]], &[meta("a")]).unwrap();
        index.save(&path).await.unwrap();

        let err = VectorIndex::load_or_new(&path, IndexSettings::flat(4))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn save_never_leaves_a_partial_file_at_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atomic.index");

        let index = VectorIndex::new(IndexSettings::flat(2));
        index.add(&[vec![1.0, 0.0]], &[meta("a")]).unwrap();
        index.save(&path).await.unwrap();
        // A second save overwrites through the same temp-then-rename path.
        index.add(&[vec![0.0, 1.0]], &[meta("b")]).unwrap();
        index.save(&path).await.unwrap();

        let restored = VectorIndex::load(&path).await.unwrap();
        assert_eq!(restored.len(), 2);
        assert!(!path.with_extension("tmp").exists());
    }
}
