//! Hybrid search: semantic retrieval fused with lexical and metadata
//! signals.
//!
//! Each query is expanded into weighted variants, every variant is run
//! through the multi-vector retriever, and the best fused score per
//! document is combined with a keyword-coverage score and a metadata
//! affinity score under configurable signal weights.

pub mod expansion;
mod text;

pub use expansion::{ExpandedQuery, QueryExpander};

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use crate::config::SearchSettings;
use crate::embed::{cosine_similarity, EmbedError, Embedder};
use crate::retriever::{FusionStrategy, MultiVectorRetriever, RetrieveError};
use crate::types::{Level, MatchDetails, Metadata, QueryContext, SearchHit, Vector};

/// Metadata fields scored for affinity, with their importance weights.
const METADATA_FIELDS: &[(&str, f32)] = &[
    ("category", 1.0),
    ("emission_type", 0.8),
    ("calculation_method", 0.7),
];

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Diagnostic)]
pub enum SearchError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Embed(#[from] EmbedError),

    #[error("invalid search configuration: {0}")]
    #[diagnostic(
        code(carbonloom::search::validation),
        help("the semantic, keyword, and metadata weights must sum to 1")
    )]
    Validation(String),
}

/// Point-in-time hybrid-search statistics.
#[derive(Clone, Debug, Serialize)]
pub struct SearchStats {
    pub expansion_cache_len: usize,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub metadata_weight: f32,
}

// ============================================================================
// Engine
// ============================================================================

struct SemanticBest {
    score: f32,
    text: String,
    metadata: Metadata,
}

struct Candidate {
    doc_id: String,
    text: String,
    metadata: Metadata,
    semantic_score: f32,
    keyword_score: f32,
    matched_terms: Vec<String>,
}

/// Combines semantic, keyword, and metadata signals into one ranking.
pub struct HybridSearchEngine {
    embedder: Arc<dyn Embedder>,
    expander: QueryExpander,
    settings: SearchSettings,
}

impl HybridSearchEngine {
    /// Builds the engine, rejecting signal weights that do not sum to 1.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        settings: SearchSettings,
    ) -> Result<Self, SearchError> {
        if !settings.weights_are_normalized() {
            return Err(SearchError::Validation(format!(
                "signal weights sum to {}",
                settings.semantic_weight + settings.keyword_weight + settings.metadata_weight
            )));
        }
        let expander = QueryExpander::new(Arc::clone(&embedder), &settings);
        Ok(Self {
            embedder,
            expander,
            settings,
        })
    }

    /// Runs the full hybrid ranking for `query` over the retriever's
    /// corpus.
    ///
    /// Expansion and metadata-affinity failures degrade the ranking to
    /// the signals still available instead of failing the search; hits
    /// produced that way carry `match_details.degraded`. Failures in the
    /// semantic path itself propagate.
    #[instrument(skip(self, retriever, context), err)]
    pub async fn search(
        &self,
        query: &str,
        retriever: &MultiVectorRetriever,
        top_k: usize,
        context: Option<&QueryContext>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let (expanded, mut degraded) = match self.expander.expand(query, context).await {
            Ok(expanded) => (expanded, false),
            Err(error) => {
                tracing::warn!(
                    %error,
                    "query expansion failed, searching with the original query only"
                );
                (ExpandedQuery::single(query), true)
            }
        };

        let fetch = top_k * 2;

        // Semantic signal: the best fused score per document across all
        // variants, scaled by each variant's weight.
        let mut order: Vec<String> = Vec::new();
        let mut semantic: FxHashMap<String, SemanticBest> = FxHashMap::default();
        for variant in &expanded.variants {
            let query_vectors = self.embed_levels(&variant.text).await?;
            let results = retriever.retrieve(
                &query_vectors,
                &variant.text,
                fetch,
                FusionStrategy::Weighted,
                context,
            )?;
            for result in results {
                let score = result.score * variant.weight;
                match semantic.get_mut(&result.doc_id) {
                    Some(best) if best.score >= score => {}
                    Some(best) => {
                        best.score = score;
                        best.text = result.text;
                        best.metadata = result.metadata;
                    }
                    None => {
                        order.push(result.doc_id.clone());
                        semantic.insert(
                            result.doc_id,
                            SemanticBest {
                                score,
                                text: result.text,
                                metadata: result.metadata,
                            },
                        );
                    }
                }
            }
        }

        // Keyword signal over the whole indexed corpus.
        let terms = text::query_terms(query);
        let mut keyword_rank = Vec::new();
        for doc in retriever.documents() {
            let (score, matched) = text::keyword_score(&terms, &doc.text);
            if score > 0.0 {
                keyword_rank.push((doc, score, matched));
            }
        }
        keyword_rank.sort_by(|a, b| b.1.total_cmp(&a.1));
        keyword_rank.truncate(fetch);

        // Union of both signals, semantic-first for stable tie order.
        let mut by_id: FxHashMap<String, usize> = FxHashMap::default();
        let mut candidates: Vec<Candidate> = Vec::new();
        for doc_id in order {
            if let Some(best) = semantic.remove(&doc_id) {
                by_id.insert(doc_id.clone(), candidates.len());
                candidates.push(Candidate {
                    doc_id,
                    text: best.text,
                    metadata: best.metadata,
                    semantic_score: best.score,
                    keyword_score: 0.0,
                    matched_terms: Vec::new(),
                });
            }
        }
        for (doc, score, matched) in keyword_rank {
            match by_id.get(&doc.doc_id) {
                Some(&position) => {
                    candidates[position].keyword_score = score;
                    candidates[position].matched_terms = matched;
                }
                None => {
                    by_id.insert(doc.doc_id.clone(), candidates.len());
                    candidates.push(Candidate {
                        doc_id: doc.doc_id,
                        text: doc.text,
                        metadata: doc.metadata,
                        semantic_score: 0.0,
                        keyword_score: score,
                        matched_terms: matched,
                    });
                }
            }
        }

        // Metadata affinity, then the final weighted combination.
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let (metadata_score, metadata_fields) =
                match self.metadata_affinity(context, &candidate.metadata).await {
                    Ok(affinity) => affinity,
                    Err(error) => {
                        tracing::warn!(
                            %error,
                            doc_id = %candidate.doc_id,
                            "metadata scoring failed, continuing without that signal"
                        );
                        degraded = true;
                        (0.0, FxHashMap::default())
                    }
                };
            scored.push((candidate, metadata_score, metadata_fields));
        }

        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .map(|(candidate, metadata_score, metadata_fields)| {
                let final_score = self.settings.semantic_weight * candidate.semantic_score
                    + self.settings.keyword_weight * candidate.keyword_score
                    + self.settings.metadata_weight * metadata_score;
                SearchHit {
                    doc_id: candidate.doc_id,
                    text: candidate.text,
                    metadata: candidate.metadata,
                    final_score,
                    semantic_score: candidate.semantic_score,
                    keyword_score: candidate.keyword_score,
                    metadata_score,
                    match_details: MatchDetails {
                        variants: expanded.variants.clone(),
                        matched_terms: candidate.matched_terms,
                        metadata_fields,
                        degraded,
                    },
                }
            })
            .collect();

        hits.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        hits.truncate(top_k);
        tracing::debug!(hits = hits.len(), degraded, "hybrid search complete");
        Ok(hits)
    }

    pub fn stats(&self) -> SearchStats {
        SearchStats {
            expansion_cache_len: self.expander.cache_len(),
            semantic_weight: self.settings.semantic_weight,
            keyword_weight: self.settings.keyword_weight,
            metadata_weight: self.settings.metadata_weight,
        }
    }

    async fn embed_levels(&self, text: &str) -> Result<FxHashMap<Level, Vector>, EmbedError> {
        let batch = [text.to_string()];
        let mut by_level = self.embedder.embed_all_levels(&batch).await?;
        let mut vectors = FxHashMap::default();
        for level in Level::ALL {
            if let Some(mut batch_vectors) = by_level.remove(&level) {
                if let Some(vector) = batch_vectors.pop() {
                    vectors.insert(level, vector);
                }
            }
        }
        Ok(vectors)
    }

    /// Importance-weighted affinity between context fields and candidate
    /// metadata: 1.0 on exact match, embedding cosine on mismatch,
    /// averaged over the full field table. No context scores 0.
    async fn metadata_affinity(
        &self,
        context: Option<&QueryContext>,
        metadata: &Metadata,
    ) -> Result<(f32, FxHashMap<String, f32>), EmbedError> {
        let Some(context) = context else {
            return Ok((0.0, FxHashMap::default()));
        };

        let mut weighted = 0.0f32;
        let mut fields = FxHashMap::default();
        for (field, importance) in METADATA_FIELDS {
            let expected = match *field {
                "category" => context.category.clone(),
                "emission_type" => context
                    .extras
                    .get("emission_type")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                "calculation_method" => context.methodology.clone(),
                _ => None,
            };
            let (Some(expected), Some(actual)) = (expected, metadata.str_field(field)) else {
                continue;
            };
            let score = if expected.eq_ignore_ascii_case(actual) {
                1.0
            } else {
                let pair = [expected, actual.to_string()];
                let embedded = self.embedder.embed(&pair, Level::Chunk).await?;
                if embedded.len() != 2 {
                    return Err(EmbedError::OutputMismatch {
                        expected: 2,
                        got: embedded.len(),
                    });
                }
                cosine_similarity(&embedded[0], &embedded[1]).max(0.0)
            };
            weighted += importance * score;
            fields.insert((*field).to_string(), score);
        }

        let total: f32 = METADATA_FIELDS.iter().map(|(_, importance)| importance).sum();
        Ok((weighted / total, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::embed::HashEmbedder;
    use serde_json::json;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    fn engine() -> HybridSearchEngine {
        HybridSearchEngine::new(Arc::new(HashEmbedder::default()), SearchSettings::default())
            .unwrap()
    }

    async fn index_doc(
        retriever: &MultiVectorRetriever,
        embedder: &HashEmbedder,
        doc_id: &str,
        text: &str,
        category: &str,
    ) {
        let chunks = vec![text.to_string()];
        let embeddings = embedder.embed_all_levels(&chunks).await.unwrap();
        let metadata = Metadata::new()
            .with("doc_id", json!(doc_id))
            .with("category", json!(category));
        retriever
            .add_documents(&chunks, &embeddings, &metadata)
            .unwrap();
    }

    #[test]
    fn unnormalized_weights_are_rejected() {
        let settings = SearchSettings {
            semantic_weight: 0.9,
            ..SearchSettings::default()
        };
        let err = HybridSearchEngine::new(Arc::new(HashEmbedder::default()), settings)
            .err()
            .map(|e| matches!(e, SearchError::Validation(_)));
        assert_eq!(err, Some(true));
    }

    #[test]
    fn search_ranks_the_matching_document_first() {
        block_on(async {
            let embedder = HashEmbedder::default();
            let retriever = MultiVectorRetriever::new(&EngineConfig {
                data_dir: None,
                ..EngineConfig::default()
            });
            index_doc(
                &retriever,
                &embedder,
                "doc_transport",
                "freight transport emissions from road logistics",
                "transport",
            )
            .await;
            index_doc(
                &retriever,
                &embedder,
                "doc_waste",
                "landfill waste disposal volumes and recycling rates",
                "waste",
            )
            .await;

            let hits = engine()
                .search(
                    "freight transport emissions",
                    &retriever,
                    2,
                    None,
                )
                .await
                .unwrap();

            assert!(!hits.is_empty());
            assert_eq!(hits[0].doc_id, "doc_transport");
            assert!(hits[0].keyword_score > 0.0);
            assert!(!hits[0].match_details.degraded);
            assert!(!hits[0].match_details.matched_terms.is_empty());
        });
    }

    #[test]
    fn context_category_raises_metadata_score() {
        block_on(async {
            let embedder = HashEmbedder::default();
            let retriever = MultiVectorRetriever::new(&EngineConfig {
                data_dir: None,
                ..EngineConfig::default()
            });
            index_doc(
                &retriever,
                &embedder,
                "doc_transport",
                "fleet fuel combustion figures",
                "transport",
            )
            .await;

            let engine = engine();
            let context = QueryContext::new().with_category("transport");
            let hits = engine
                .search("fleet fuel figures", &retriever, 1, Some(&context))
                .await
                .unwrap();

            assert_eq!(hits.len(), 1);
            // category matched exactly: 1.0 * 1.0 / 2.5
            assert!((hits[0].metadata_score - 0.4).abs() < 1e-6);
            assert_eq!(hits[0].match_details.metadata_fields["category"], 1.0);
        });
    }

    #[test]
    fn zero_top_k_short_circuits() {
        block_on(async {
            let retriever = MultiVectorRetriever::new(&EngineConfig {
                data_dir: None,
                ..EngineConfig::default()
            });
            let hits = engine().search("anything", &retriever, 0, None).await.unwrap();
            assert!(hits.is_empty());
        });
    }

    #[test]
    fn empty_corpus_yields_no_hits() {
        block_on(async {
            let retriever = MultiVectorRetriever::new(&EngineConfig {
                data_dir: None,
                ..EngineConfig::default()
            });
            let hits = engine().search("emissions", &retriever, 3, None).await.unwrap();
            assert!(hits.is_empty());
        });
    }
}
