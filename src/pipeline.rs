//! End-to-end engine composition.
//!
//! [`Pipeline`] wires the splitter, embedder, retriever, hybrid search,
//! knowledge base, and expert router behind three calls:
//! [`process_document`](Pipeline::process_document),
//! [`process_query`](Pipeline::process_query), and
//! [`get_stats`](Pipeline::get_stats). Collaborators that can fail at
//! runtime (embedding, generation, the graph mirror) are injected as
//! trait objects so callers choose the backends and tests inject doubles.

use std::fmt::Write as _;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::instrument;
use unicode_segmentation::UnicodeSegmentation;

use crate::config::EngineConfig;
use crate::embed::Embedder;
use crate::error::EngineError;
use crate::generate::{GenerationParams, Generator};
use crate::kb::{GraphStore, IngestDisposition, KbStats, KnowledgeBase};
use crate::retriever::{MultiVectorRetriever, RetrieverStats};
use crate::router::{ExpertContext, ExpertResponse, ExpertRouter, RouterStats};
use crate::search::{HybridSearchEngine, SearchStats};
use crate::types::{AgentResult, Level, Metadata, QueryAnswer, QueryContext, SearchHit};

/// Passages quoted into the synthesis prompt.
const PROMPT_PASSAGES: usize = 3;

// ============================================================================
// Splitting
// ============================================================================

/// Splits raw text into the three granularity views.
///
/// Document and chunk views are fixed word windows; the semantic view is
/// sentence units. Whitespace runs are collapsed in the window views, so
/// the same text always yields the same units.
#[derive(Clone, Copy, Debug)]
pub struct DocumentSplitter {
    document_window: usize,
    chunk_window: usize,
}

impl Default for DocumentSplitter {
    fn default() -> Self {
        Self {
            document_window: 1000,
            chunk_window: 300,
        }
    }
}

impl DocumentSplitter {
    /// Builds a splitter with explicit window sizes, each clamped to at
    /// least one word.
    #[must_use]
    pub fn new(document_window: usize, chunk_window: usize) -> Self {
        Self {
            document_window: document_window.max(1),
            chunk_window: chunk_window.max(1),
        }
    }

    /// Produces every level's units for `text`. Empty or whitespace-only
    /// text yields empty views.
    #[must_use]
    pub fn split(&self, text: &str) -> SplitDocument {
        let mut levels = FxHashMap::default();
        levels.insert(Level::Document, word_windows(text, self.document_window));
        levels.insert(Level::Chunk, word_windows(text, self.chunk_window));
        levels.insert(Level::Semantic, sentence_units(text));
        SplitDocument { levels }
    }
}

/// Per-level text units for one document.
#[derive(Clone, Debug, Default)]
pub struct SplitDocument {
    levels: FxHashMap<Level, Vec<String>>,
}

impl SplitDocument {
    /// Units produced for `level`.
    pub fn units(&self, level: Level) -> &[String] {
        self.levels.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Unit counts per level.
    pub fn counts(&self) -> FxHashMap<Level, usize> {
        self.levels
            .iter()
            .map(|(level, units)| (*level, units.len()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.values().all(Vec::is_empty)
    }
}

fn word_windows(text: &str, window: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words.chunks(window).map(|words| words.join(" ")).collect()
}

fn sentence_units(text: &str) -> Vec<String> {
    text.unicode_sentences()
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one [`Pipeline::process_document`] call.
#[derive(Clone, Debug, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub disposition: IngestDisposition,
    /// Version the document is at after the call.
    pub version_id: i64,
    /// Vectors added to each level's index by this call. Empty when the
    /// content was already stored.
    pub units_indexed: FxHashMap<Level, usize>,
}

/// Aggregated engine statistics, serializable for dashboards and logs.
///
/// Graph-mirror reachability travels inside [`KbStats`].
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub retriever: RetrieverStats,
    pub search: SearchStats,
    pub kb: KbStats,
    pub router: RouterStats,
}

// ============================================================================
// Pipeline
// ============================================================================

/// The assembled engine.
///
/// Construction fails fast on invalid configuration or an unreachable
/// store; after that, per-request failures of optional collaborators
/// degrade the response instead of erroring (see [`AgentResult`]).
pub struct Pipeline {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    splitter: DocumentSplitter,
    retriever: MultiVectorRetriever,
    search: HybridSearchEngine,
    router: ExpertRouter,
    kb: KnowledgeBase,
    top_k: usize,
}

impl Pipeline {
    /// Opens the pipeline: restores index snapshots under the configured
    /// data directory, opens (or creates) the knowledge base, and builds
    /// the search engine and router from `config`.
    pub async fn open(
        config: &EngineConfig,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        graph: Arc<dyn GraphStore>,
    ) -> Result<Self, EngineError> {
        let retriever = MultiVectorRetriever::open(config).await?;
        let search = HybridSearchEngine::new(Arc::clone(&embedder), config.search.clone())?;
        let router = ExpertRouter::new(&config.router);
        let kb = KnowledgeBase::open(&config.kb, graph).await?;
        Ok(Self {
            embedder,
            generator,
            splitter: DocumentSplitter::default(),
            retriever,
            search,
            router,
            kb,
            top_k: config.retrieval.top_k,
        })
    }

    /// Replaces the default splitter.
    #[must_use]
    pub fn with_splitter(mut self, splitter: DocumentSplitter) -> Self {
        self.splitter = splitter;
        self
    }

    /// Replaces the default router, e.g. to register extra experts.
    #[must_use]
    pub fn with_router(mut self, router: ExpertRouter) -> Self {
        self.router = router;
        self
    }

    /// The underlying knowledge base, for document-level calls
    /// (`get_document`, `list_documents`, `update_document`,
    /// `delete_document`).
    pub fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }

    pub fn retriever(&self) -> &MultiVectorRetriever {
        &self.retriever
    }

    pub fn router(&self) -> &ExpertRouter {
        &self.router
    }

    /// Ingests one document end to end: store in the knowledge base,
    /// split into per-level units, embed each level, and index the
    /// vectors.
    ///
    /// Byte-identical resubmission short-circuits after the store lookup;
    /// nothing is re-embedded and the report carries no indexed units. A
    /// store or index failure propagates, ingest is never silently lossy.
    #[instrument(skip(self, content, metadata), err)]
    pub async fn process_document(
        &self,
        content: &str,
        metadata: &Metadata,
    ) -> Result<IngestReport, EngineError> {
        let split = self.splitter.split(content);
        let receipt = self
            .kb
            .add_document(content, split.units(Level::Chunk), metadata)
            .await?;

        if receipt.disposition == IngestDisposition::Unchanged {
            return Ok(IngestReport {
                doc_id: receipt.doc_id,
                disposition: receipt.disposition,
                version_id: receipt.version_id,
                units_indexed: FxHashMap::default(),
            });
        }

        // All levels share the doc id the store settled on, including the
        // near-duplicate case where ingest landed on an existing document.
        let mut tagged = metadata.clone();
        tagged.set(Metadata::DOC_ID, serde_json::json!(receipt.doc_id));

        let mut units_indexed = FxHashMap::default();
        for level in Level::ALL {
            let units = split.units(level);
            if units.is_empty() {
                continue;
            }
            let vectors = self.embedder.embed(units, level).await?;
            let mut by_level = FxHashMap::default();
            by_level.insert(level, vectors);
            self.retriever.add_documents(units, &by_level, &tagged)?;
            units_indexed.insert(level, units.len());
        }
        self.retriever.persist().await?;

        tracing::info!(
            doc_id = %receipt.doc_id,
            version_id = receipt.version_id,
            vectors = units_indexed.values().sum::<usize>(),
            "document ingested"
        );
        Ok(IngestReport {
            doc_id: receipt.doc_id,
            disposition: receipt.disposition,
            version_id: receipt.version_id,
            units_indexed,
        })
    }

    /// Answers a query end to end: hybrid search, expert routing and
    /// execution, then synthesis through the generation seam.
    ///
    /// Retrieval finding nothing yields [`AgentResult::NoContent`]. A
    /// generation failure yields [`AgentResult::Degraded`] carrying the
    /// answer assembled from expert output. Search failures propagate.
    #[instrument(skip(self, context), err)]
    pub async fn process_query(
        &self,
        query: &str,
        context: &QueryContext,
    ) -> Result<AgentResult, EngineError> {
        let hits = self
            .search
            .search(query, &self.retriever, self.top_k, Some(context))
            .await?;
        if hits.is_empty() {
            tracing::info!("no relevant content found");
            return Ok(AgentResult::NoContent);
        }

        let route = self.router.prepare(query, context);
        let ctx = ExpertContext::new(query, context.clone(), hits.clone());
        let responses = self.router.execute(&route.plan, ctx).await;

        // Stage order keeps the answer's provenance deterministic; the
        // response map itself is unordered.
        let sections: Vec<&ExpertResponse> = route
            .plan
            .stages
            .iter()
            .flatten()
            .filter_map(|expert_id| responses.get(expert_id))
            .collect();

        let confidence = mean_confidence(&sections);
        let sources = source_doc_ids(&hits);
        let expert_ids: Vec<String> = sections
            .iter()
            .map(|response| response.expert_id.clone())
            .collect();

        let prompt = synthesis_prompt(query, &hits, &sections);
        match self
            .generator
            .generate(&prompt, &GenerationParams::default())
            .await
        {
            Ok(content) => Ok(AgentResult::Answer(QueryAnswer {
                content,
                confidence,
                sources,
                expert_ids,
            })),
            Err(error) => {
                tracing::warn!(%error, "generation failed, assembling answer from expert output");
                Ok(AgentResult::Degraded {
                    answer: QueryAnswer {
                        content: assembled_answer(&sections),
                        confidence,
                        sources,
                        expert_ids,
                    },
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Point-in-time statistics across every component.
    pub async fn get_stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            retriever: self.retriever.stats(),
            search: self.search.stats(),
            kb: self.kb.stats().await?,
            router: self.router.stats(),
        })
    }
}

fn mean_confidence(sections: &[&ExpertResponse]) -> f32 {
    if sections.is_empty() {
        return 0.0;
    }
    let sum: f32 = sections.iter().map(|response| response.confidence).sum();
    sum / sections.len() as f32
}

fn source_doc_ids(hits: &[SearchHit]) -> Vec<String> {
    let mut seen = FxHashSet::default();
    hits.iter()
        .filter(|hit| seen.insert(hit.doc_id.clone()))
        .map(|hit| hit.doc_id.clone())
        .collect()
}

fn synthesis_prompt(query: &str, hits: &[SearchHit], sections: &[&ExpertResponse]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Answer the question using the analysis below.");
    let _ = writeln!(prompt, "Question: {query}");
    for hit in hits.iter().take(PROMPT_PASSAGES) {
        if !hit.text.is_empty() {
            let _ = writeln!(prompt, "Passage [{}]: {}", hit.doc_id, hit.text);
        }
    }
    for response in sections {
        let _ = writeln!(prompt, "{}: {}", response.expert_id, response.content);
    }
    prompt
}

fn assembled_answer(sections: &[&ExpertResponse]) -> String {
    sections
        .iter()
        .map(|response| format!("{}: {}", response.expert_id, response.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::generate::{GenerateError, TemplateGenerator};
    use crate::kb::MemoryGraphStore;
    use async_trait::async_trait;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.data_dir = None;
        config.kb.db_path = None;
        config.levels.document.dimension = 32;
        config.levels.chunk.dimension = 32;
        config.levels.semantic.dimension = 32;
        config
    }

    async fn open_pipeline(generator: Arc<dyn Generator>) -> Pipeline {
        let config = test_config();
        let embedder = Arc::new(HashEmbedder::from_levels(&config.levels));
        Pipeline::open(&config, embedder, generator, Arc::new(MemoryGraphStore::new()))
            .await
            .unwrap()
    }

    struct OfflineGenerator;

    #[async_trait]
    impl Generator for OfflineGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String, GenerateError> {
            Err(GenerateError::Unavailable {
                provider: "offline",
                message: "connection refused".into(),
            })
        }
    }

    #[test]
    fn word_windows_pack_words_in_order() {
        let windows = word_windows("one two three four five six seven", 3);
        assert_eq!(windows, vec!["one two three", "four five six", "seven"]);
    }

    #[test]
    fn word_windows_collapse_whitespace_runs() {
        let windows = word_windows("spend   based\n\nmethod", 10);
        assert_eq!(windows, vec!["spend based method"]);
    }

    #[test]
    fn sentence_units_split_on_boundaries() {
        let units = sentence_units("Emissions rose. Fleet data was incomplete! Why?");
        assert_eq!(
            units,
            vec!["Emissions rose.", "Fleet data was incomplete!", "Why?"]
        );
    }

    #[test]
    fn empty_text_splits_to_empty_views() {
        let split = DocumentSplitter::default().split("   \n ");
        assert!(split.is_empty());
        assert!(split.units(Level::Chunk).is_empty());
    }

    #[test]
    fn splitter_produces_all_three_views() {
        let text = "Scope 3 transport emissions rose last year. Rail freight fell.";
        let split = DocumentSplitter::new(5, 3).split(text);
        assert_eq!(split.units(Level::Semantic).len(), 2);
        assert!(split.units(Level::Document).len() < split.units(Level::Chunk).len());
        let counts = split.counts();
        assert_eq!(counts[&Level::Semantic], 2);
    }

    #[tokio::test]
    async fn ingest_then_query_answers_with_sources() {
        let pipeline = open_pipeline(Arc::new(TemplateGenerator)).await;
        let metadata = Metadata::new()
            .with("category", serde_json::json!("transportation"))
            .with("source", serde_json::json!("fleet report"));
        let report = pipeline
            .process_document(
                "Scope 3 transport emissions reached 1200 tonnes in 2023. \
                 Rail freight emissions fell to 300 tonnes.",
                &metadata,
            )
            .await
            .unwrap();
        assert_eq!(report.disposition, IngestDisposition::Created);
        assert!(report.units_indexed[&Level::Semantic] >= 2);

        let result = pipeline
            .process_query("scope 3 transport emissions", &QueryContext::new())
            .await
            .unwrap();
        let AgentResult::Answer(answer) = result else {
            panic!("expected a synthesized answer, got {result:?}");
        };
        assert!(!answer.content.is_empty());
        assert_eq!(answer.sources, vec![report.doc_id]);
        assert!(answer.expert_ids.contains(&"scope3".to_string()));
        assert!(answer.confidence > 0.0);
    }

    #[tokio::test]
    async fn identical_resubmission_indexes_nothing() {
        let pipeline = open_pipeline(Arc::new(TemplateGenerator)).await;
        let metadata = Metadata::new();
        let content = "Purchased goods account for most upstream emissions.";
        let first = pipeline.process_document(content, &metadata).await.unwrap();
        let second = pipeline.process_document(content, &metadata).await.unwrap();

        assert_eq!(second.doc_id, first.doc_id);
        assert_eq!(second.disposition, IngestDisposition::Unchanged);
        assert!(second.units_indexed.is_empty());

        let sizes = pipeline.retriever().stats().index_sizes;
        assert_eq!(sizes[&Level::Semantic], 1);
    }

    #[tokio::test]
    async fn query_over_empty_engine_is_no_content() {
        let pipeline = open_pipeline(Arc::new(TemplateGenerator)).await;
        let result = pipeline
            .process_query("waste emissions", &QueryContext::new())
            .await
            .unwrap();
        assert!(result.is_no_content());
    }

    #[tokio::test]
    async fn generator_failure_degrades_with_expert_answer() {
        let pipeline = open_pipeline(Arc::new(OfflineGenerator)).await;
        pipeline
            .process_document(
                "Business travel emissions were 90 tonnes in 2022 and 140 tonnes in 2023.",
                &Metadata::new(),
            )
            .await
            .unwrap();

        let result = pipeline
            .process_query("business travel emissions", &QueryContext::new())
            .await
            .unwrap();
        let AgentResult::Degraded { answer, reason } = result else {
            panic!("expected a degraded answer, got {result:?}");
        };
        assert!(answer.content.contains("scope3"));
        assert!(reason.contains("offline"));
    }

    #[tokio::test]
    async fn stats_aggregate_all_components() {
        let pipeline = open_pipeline(Arc::new(TemplateGenerator)).await;
        pipeline
            .process_document(
                "Employee commuting emissions are estimated using the distance method.",
                &Metadata::new(),
            )
            .await
            .unwrap();

        let stats = pipeline.get_stats().await.unwrap();
        assert_eq!(stats.kb.counts.documents, 1);
        assert!(stats.retriever.index_sizes.values().any(|size| *size > 0));
        assert!(stats.kb.graph.reachable);
        let encoded = serde_json::to_value(&stats).unwrap();
        assert!(encoded.get("router").is_some());
    }
}
