//! Multi-vector retrieval across granularity levels.
//!
//! One [`VectorIndex`] per level, each with its own embedding dimension
//! and a relative fusion weight. Per-level candidates are context-adjusted
//! first, then fused with either the weighted or the ensemble strategy
//! into a single stable ranking.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::index::{IndexError, IndexSettings, VectorIndex};
use crate::types::{Level, Metadata, QueryContext, RetrievedDocument, Vector};
use crate::util::generate_doc_id;

/// How much a full-relevance context match softens a candidate's distance.
/// Relevance never fully overrides raw similarity.
const CONTEXT_SOFTENING: f32 = 0.3;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Diagnostic)]
pub enum RetrieveError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),

    #[error("invalid retrieval input: {0}")]
    #[diagnostic(code(carbonloom::retriever::validation))]
    Validation(String),
}

// ============================================================================
// Fusion
// ============================================================================

/// Result-fusion strategy across levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Sum of per-level similarity multiplied by the level's weight.
    #[default]
    Weighted,
    /// Rank by (levels that surfaced the document, summed similarity);
    /// report the summed similarity averaged over those votes.
    Ensemble,
}

/// Per-level index sizes, reported through engine stats.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetrieverStats {
    pub index_sizes: FxHashMap<Level, usize>,
}

/// One indexed document as seen by lexical scoring.
#[derive(Clone, Debug)]
pub struct CorpusDocument {
    pub doc_id: String,
    pub text: String,
    pub metadata: Metadata,
}

struct RetrieverLevel {
    weight: f32,
    index: VectorIndex,
}

#[derive(Default)]
struct DocAccumulator {
    weighted_sum: f32,
    raw_sum: f32,
    votes: usize,
    best_similarity: f32,
    text: String,
    metadata: Metadata,
    level_scores: FxHashMap<Level, f32>,
}

// ============================================================================
// Retriever
// ============================================================================

/// Fuses nearest-neighbor results from the document, chunk, and semantic
/// indexes into one ranked document list.
///
/// Empty levels contribute nothing; when every level is empty the result
/// is an empty ranking, never an error.
pub struct MultiVectorRetriever {
    levels: FxHashMap<Level, RetrieverLevel>,
    candidate_factor: usize,
    snapshot_dir: Option<PathBuf>,
}

impl MultiVectorRetriever {
    /// Builds fresh clustered indexes from configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let mut levels = FxHashMap::default();
        for level in Level::ALL {
            let settings = config.levels.get(level);
            levels.insert(
                level,
                RetrieverLevel {
                    weight: settings.weight,
                    index: VectorIndex::new(
                        IndexSettings::ivf(settings.dimension)
                            .with_nlist(config.index.nlist)
                            .with_nprobe(config.index.nprobe),
                    ),
                },
            );
        }
        Self {
            levels,
            candidate_factor: config.retrieval.candidate_factor.max(1),
            snapshot_dir: config.data_dir.clone(),
        }
    }

    /// Like [`MultiVectorRetriever::new`], but restores any per-level
    /// snapshots found under the configured data directory.
    pub async fn open(config: &EngineConfig) -> Result<Self, RetrieveError> {
        let mut retriever = Self::new(config);
        if let Some(dir) = config.data_dir.clone() {
            for level in Level::ALL {
                let settings = config.levels.get(level);
                let index = VectorIndex::load_or_new(
                    &Self::snapshot_path(&dir, level),
                    IndexSettings::ivf(settings.dimension)
                        .with_nlist(config.index.nlist)
                        .with_nprobe(config.index.nprobe),
                )
                .await?;
                if let Some(entry) = retriever.levels.get_mut(&level) {
                    entry.index = index;
                }
            }
        }
        Ok(retriever)
    }

    /// Saves every level's index snapshot. No-op without a data directory.
    pub async fn persist(&self) -> Result<(), RetrieveError> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(());
        };
        for level in Level::ALL {
            if let Some(entry) = self.levels.get(&level) {
                entry.index.save(&Self::snapshot_path(dir, level)).await?;
            }
        }
        Ok(())
    }

    fn snapshot_path(dir: &Path, level: Level) -> PathBuf {
        dir.join(format!("{level}.index"))
    }

    /// Adds one document's per-level embeddings, tagging every vector with
    /// the owning `doc_id` and a derived `chunk_id`.
    ///
    /// A caller-supplied `doc_id` in `metadata` is reused; otherwise a
    /// fresh one is generated. Levels may carry different unit counts.
    pub fn add_documents(
        &self,
        chunks: &[String],
        embeddings: &FxHashMap<Level, Vec<Vector>>,
        metadata: &Metadata,
    ) -> Result<String, RetrieveError> {
        if embeddings.is_empty() {
            return Err(RetrieveError::Validation(
                "no embeddings provided for any level".to_string(),
            ));
        }

        let doc_id = metadata
            .doc_id()
            .map(str::to_string)
            .unwrap_or_else(generate_doc_id);

        for level in Level::ALL {
            let Some(vectors) = embeddings.get(&level) else {
                continue;
            };
            if vectors.is_empty() {
                continue;
            }
            let Some(entry) = self.levels.get(&level) else {
                continue;
            };

            let tagged: Vec<Metadata> = (0..vectors.len())
                .map(|position| {
                    let mut tagged = metadata.clone();
                    tagged.set(Metadata::DOC_ID, serde_json::json!(doc_id));
                    tagged.set(
                        Metadata::CHUNK_ID,
                        serde_json::json!(format!("{doc_id}_chunk_{position}")),
                    );
                    tagged.set("position", serde_json::json!(position));
                    tagged.set("level", serde_json::json!(level.as_str()));
                    if let Some(text) = chunks.get(position) {
                        tagged.set("text", serde_json::json!(text));
                    }
                    tagged
                })
                .collect();

            entry.index.add(vectors, &tagged)?;
        }

        tracing::debug!(doc_id = %doc_id, "added document vectors");
        Ok(doc_id)
    }

    /// Retrieves and fuses the top documents for per-level query vectors.
    ///
    /// Candidates are context-adjusted before fusion: with a non-empty
    /// context, zero-relevance candidates are dropped and the rest have
    /// their distance softened in proportion to relevance. Ties in the
    /// final ranking preserve first-seen order.
    pub fn retrieve(
        &self,
        query_vectors: &FxHashMap<Level, Vector>,
        query_text: &str,
        top_k: usize,
        strategy: FusionStrategy,
        context: Option<&QueryContext>,
    ) -> Result<Vec<RetrievedDocument>, RetrieveError> {
        let span = tracing::info_span!(
            "retrieve",
            query = query_text,
            top_k,
            strategy = ?strategy
        );
        let _guard = span.enter();

        if top_k == 0 {
            return Ok(Vec::new());
        }

        let filter_by_context = context.is_some_and(has_relevance_fields);
        let mut order: Vec<String> = Vec::new();
        let mut accumulators: FxHashMap<String, DocAccumulator> = FxHashMap::default();

        for level in Level::ALL {
            let Some(query) = query_vectors.get(&level) else {
                continue;
            };
            let Some(entry) = self.levels.get(&level) else {
                continue;
            };
            if entry.index.is_empty() {
                continue;
            }

            let fetched = entry
                .index
                .search(query, top_k * self.candidate_factor, None)?;

            // Context adjustment, then best-chunk-per-document reduction.
            let mut level_best: FxHashMap<String, (f32, usize)> = FxHashMap::default();
            let mut level_order: Vec<String> = Vec::new();
            let mut adjusted: Vec<(f32, usize)> = Vec::new();
            for (row, (distance, _id, meta)) in fetched.iter().enumerate() {
                let distance = match context {
                    Some(ctx) if filter_by_context => {
                        let relevance = context_relevance(ctx, meta);
                        if relevance == 0.0 {
                            continue;
                        }
                        distance * (1.0 - relevance * CONTEXT_SOFTENING)
                    }
                    _ => distance,
                };
                adjusted.push((distance, row));
            }
            if adjusted.is_empty() {
                continue;
            }

            let max_distance = adjusted.iter().map(|(d, _)| *d).fold(0.0f32, f32::max);
            for (distance, row) in adjusted {
                let similarity = if max_distance > 0.0 {
                    1.0 - distance / max_distance
                } else {
                    1.0
                };
                let Some(doc_id) = fetched.metadata[row].doc_id() else {
                    continue;
                };
                match level_best.get_mut(doc_id) {
                    Some(best) if best.0 >= similarity => {}
                    Some(best) => *best = (similarity, row),
                    None => {
                        level_best.insert(doc_id.to_string(), (similarity, row));
                        level_order.push(doc_id.to_string());
                    }
                }
            }

            for doc_id in level_order {
                let (similarity, row) = level_best[&doc_id];
                let weighted = similarity * entry.weight;
                let accumulator = accumulators.entry(doc_id.clone()).or_insert_with(|| {
                    order.push(doc_id.clone());
                    DocAccumulator::default()
                });
                accumulator.weighted_sum += weighted;
                accumulator.raw_sum += similarity;
                accumulator.votes += 1;
                accumulator.level_scores.insert(level, weighted);
                if similarity >= accumulator.best_similarity || accumulator.votes == 1 {
                    accumulator.best_similarity = similarity;
                    accumulator.text = fetched.metadata[row]
                        .str_field("text")
                        .unwrap_or_default()
                        .to_string();
                    accumulator.metadata = fetched.metadata[row].clone();
                }
            }
        }

        let mut results: Vec<RetrievedDocument> = order
            .into_iter()
            .filter_map(|doc_id| {
                let accumulator = accumulators.remove(&doc_id)?;
                let score = match strategy {
                    FusionStrategy::Weighted => accumulator.weighted_sum,
                    FusionStrategy::Ensemble => {
                        accumulator.raw_sum / accumulator.votes.max(1) as f32
                    }
                };
                Some(RetrievedDocument {
                    doc_id,
                    score,
                    votes: accumulator.votes,
                    text: accumulator.text,
                    metadata: accumulator.metadata,
                    level_scores: accumulator.level_scores,
                })
            })
            .collect();

        match strategy {
            FusionStrategy::Weighted => {
                results.sort_by(|a, b| b.score.total_cmp(&a.score));
            }
            FusionStrategy::Ensemble => {
                results.sort_by(|a, b| {
                    b.votes
                        .cmp(&a.votes)
                        .then_with(|| (b.score * b.votes as f32).total_cmp(&(a.score * a.votes as f32)))
                });
            }
        }
        results.truncate(top_k);
        tracing::debug!(results = results.len(), "fused retrieval results");
        Ok(results)
    }

    /// Current per-level index sizes.
    pub fn stats(&self) -> RetrieverStats {
        let mut index_sizes = FxHashMap::default();
        for (level, entry) in &self.levels {
            index_sizes.insert(*level, entry.index.len());
        }
        RetrieverStats { index_sizes }
    }

    /// Distinct indexed documents in first-insertion order, with text
    /// assembled from their chunk rows. Used by lexical reranking, which
    /// needs the raw corpus rather than nearest-neighbor candidates.
    pub fn documents(&self) -> Vec<CorpusDocument> {
        // Chunk rows carry the densest text; fall back to whichever level
        // has entries when the chunk index is empty.
        let rows = [Level::Chunk, Level::Document, Level::Semantic]
            .into_iter()
            .find_map(|level| {
                let entry = self.levels.get(&level)?;
                let snapshot = entry.index.metadata_snapshot();
                (!snapshot.is_empty()).then_some(snapshot)
            })
            .unwrap_or_default();

        let mut order: Vec<String> = Vec::new();
        let mut docs: FxHashMap<String, CorpusDocument> = FxHashMap::default();
        for meta in rows {
            let Some(doc_id) = meta.doc_id().map(str::to_string) else {
                continue;
            };
            let text = meta.str_field("text").unwrap_or_default();
            match docs.get_mut(&doc_id) {
                Some(doc) => {
                    if !text.is_empty() {
                        if !doc.text.is_empty() {
                            doc.text.push(' ');
                        }
                        doc.text.push_str(text);
                    }
                }
                None => {
                    order.push(doc_id.clone());
                    docs.insert(
                        doc_id.clone(),
                        CorpusDocument {
                            doc_id,
                            text: text.to_string(),
                            metadata: meta,
                        },
                    );
                }
            }
        }
        order.into_iter().filter_map(|id| docs.remove(&id)).collect()
    }
}

/// True when the context carries at least one field that participates in
/// relevance scoring. Extras ride along for callers but never filter.
fn has_relevance_fields(context: &QueryContext) -> bool {
    context.category.is_some() || context.year.is_some() || context.methodology.is_some()
}

/// Exact-match overlap between context fields and candidate metadata,
/// in [0, 1]: category 0.5; year 0.3 exact or 0.2 within two years;
/// methodology 0.2.
fn context_relevance(context: &QueryContext, metadata: &Metadata) -> f32 {
    let mut relevance = 0.0f32;
    if let Some(category) = &context.category {
        if metadata
            .category()
            .is_some_and(|candidate| candidate.eq_ignore_ascii_case(category))
        {
            relevance += 0.5;
        }
    }
    if let Some(year) = context.year {
        if let Some(candidate) = metadata.year() {
            if candidate == year {
                relevance += 0.3;
            } else if (candidate - year).abs() <= 2 {
                relevance += 0.2;
            }
        }
    }
    if let Some(methodology) = &context.methodology {
        let candidate = metadata
            .str_field("methodology")
            .or_else(|| metadata.str_field("calculation_method"));
        if candidate.is_some_and(|value| value.eq_ignore_ascii_case(methodology)) {
            relevance += 0.2;
        }
    }
    relevance.min(1.0)
}
