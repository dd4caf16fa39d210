#![allow(dead_code)]

use std::sync::Arc;

use carbonloom::config::{EngineConfig, KbSettings};
use carbonloom::embed::HashEmbedder;
use carbonloom::generate::{Generator, TemplateGenerator};
use carbonloom::kb::{GraphStore, KnowledgeBase, MemoryGraphStore};
use carbonloom::pipeline::Pipeline;
use carbonloom::types::Metadata;

pub const TRANSPORT_DOC: &str =
    "Scope 3 transportation emissions reached 1200 tonnes CO2e in 2023. \
     Road freight contributed 900 tonnes and rail freight 300 tonnes. \
     The fuel-based method was applied across the whole fleet.";

pub const WASTE_DOC: &str =
    "Waste disposal emissions totalled 75 tonnes CO2e in 2023. \
     Landfill waste dominates the category. \
     Treatment-specific factors were used for incineration.";

pub const TRAVEL_DOC: &str =
    "Business travel emissions were 90 tonnes CO2e in 2022 and 140 tonnes in 2023. \
     Air travel drives the increase. \
     Estimates use the distance-based method.";

/// Engine configuration with small embedding spaces and no persistence,
/// so every test binary runs hermetically.
pub fn small_config() -> EngineConfig {
    let mut config = EngineConfig::new();
    config.data_dir = None;
    config.kb.db_path = None;
    config.levels.document.dimension = 32;
    config.levels.chunk.dimension = 32;
    config.levels.semantic.dimension = 32;
    config
}

pub async fn open_pipeline() -> Pipeline {
    open_pipeline_with(Arc::new(TemplateGenerator), Arc::new(MemoryGraphStore::new())).await
}

pub async fn open_pipeline_with(
    generator: Arc<dyn Generator>,
    graph: Arc<dyn GraphStore>,
) -> Pipeline {
    let config = small_config();
    let embedder = Arc::new(HashEmbedder::from_levels(&config.levels));
    Pipeline::open(&config, embedder, generator, graph)
        .await
        .expect("open pipeline")
}

pub async fn memory_kb() -> KnowledgeBase {
    memory_kb_with(Arc::new(MemoryGraphStore::new())).await
}

pub async fn memory_kb_with(graph: Arc<dyn GraphStore>) -> KnowledgeBase {
    let settings = KbSettings {
        db_path: None,
        dedup_threshold: 0.9,
    };
    KnowledgeBase::open(&settings, graph)
        .await
        .expect("open in-memory knowledge base")
}

pub fn doc_metadata(category: &str, source: &str) -> Metadata {
    Metadata::new()
        .with("category", serde_json::json!(category))
        .with("source", serde_json::json!(source))
}

/// Naive chunking for store-level tests that bypass the pipeline splitter.
pub fn sentence_chunks(content: &str) -> Vec<String> {
    content
        .split_inclusive('.')
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(str::to_string)
        .collect()
}
