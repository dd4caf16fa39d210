//! Engine configuration.
//!
//! Plain data with builder-style setters. Paths can also come from the
//! environment (`CARBONLOOM_DB_PATH`, `CARBONLOOM_DATA_DIR`, loaded through
//! `dotenvy`); an explicit setter always wins over the environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Level;

/// Top-level configuration for the engine and its components.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub index: IndexDefaults,
    pub levels: LevelDefaults,
    pub search: SearchSettings,
    pub retrieval: RetrievalSettings,
    pub kb: KbSettings,
    pub router: RouterSettings,
    /// Directory for vector-index snapshots. `None` disables persistence.
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            index: IndexDefaults::default(),
            levels: LevelDefaults::default(),
            search: SearchSettings::default(),
            retrieval: RetrievalSettings::default(),
            kb: KbSettings::default(),
            router: RouterSettings::default(),
            data_dir: resolve_env_path("CARBONLOOM_DATA_DIR"),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kb.db_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_search(mut self, search: SearchSettings) -> Self {
        self.search = search;
        self
    }

    #[must_use]
    pub fn with_retrieval(mut self, retrieval: RetrievalSettings) -> Self {
        self.retrieval = retrieval;
        self
    }

    #[must_use]
    pub fn with_router(mut self, router: RouterSettings) -> Self {
        self.router = router;
        self
    }

    #[must_use]
    pub fn with_kb(mut self, kb: KbSettings) -> Self {
        self.kb = kb;
        self
    }
}

/// Clustered-index calibration knobs shared by all levels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexDefaults {
    /// Target cluster count. Capped by the size of the training batch.
    pub nlist: usize,
    /// Clusters probed per search unless the caller overrides per call.
    pub nprobe: usize,
}

impl Default for IndexDefaults {
    fn default() -> Self {
        Self {
            nlist: 100,
            nprobe: 10,
        }
    }
}

/// Embedding dimension and fusion weight for one granularity level.
///
/// Weights are relative; they are not required to sum to 1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelSettings {
    pub dimension: usize,
    pub weight: f32,
}

/// Per-level settings for the three granularity levels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LevelDefaults {
    pub document: LevelSettings,
    pub chunk: LevelSettings,
    pub semantic: LevelSettings,
}

impl Default for LevelDefaults {
    fn default() -> Self {
        Self {
            document: LevelSettings {
                dimension: 768,
                weight: 0.3,
            },
            chunk: LevelSettings {
                dimension: 384,
                weight: 0.5,
            },
            semantic: LevelSettings {
                dimension: 768,
                weight: 0.2,
            },
        }
    }
}

impl LevelDefaults {
    pub fn get(&self, level: Level) -> LevelSettings {
        match level {
            Level::Document => self.document,
            Level::Chunk => self.chunk,
            Level::Semantic => self.semantic,
        }
    }
}

/// Hybrid-search signal weights and expansion limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Weight of the fused semantic score. The three weights must sum to 1.
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub metadata_weight: f32,
    /// Maximum expansion variants searched per query, original included.
    pub max_expansions: usize,
    /// Capacity of the per-process expansion cache.
    pub expansion_cache_capacity: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            semantic_weight: 0.6,
            keyword_weight: 0.2,
            metadata_weight: 0.2,
            max_expansions: 8,
            expansion_cache_capacity: 256,
        }
    }
}

impl SearchSettings {
    /// True when the three signal weights sum to 1 (within float tolerance).
    pub fn weights_are_normalized(&self) -> bool {
        let sum = self.semantic_weight + self.keyword_weight + self.metadata_weight;
        (sum - 1.0).abs() < 1e-4
    }
}

/// Retrieval fan-out knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Results returned to the caller.
    pub top_k: usize,
    /// Per-level over-fetch factor before fusion.
    pub candidate_factor: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            candidate_factor: 2,
        }
    }
}

/// Knowledge-base storage and deduplication settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KbSettings {
    /// SQLite database path. `None` opens an in-memory database.
    pub db_path: Option<PathBuf>,
    /// Similarity at or above which an ingest is routed to an update of
    /// the matching document instead of creating a new one.
    pub dedup_threshold: f32,
}

impl Default for KbSettings {
    fn default() -> Self {
        Self {
            db_path: resolve_env_path("CARBONLOOM_DB_PATH"),
            dedup_threshold: 0.9,
        }
    }
}

/// Expert-routing limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Maximum experts executed in one stage.
    pub max_concurrent_experts: usize,
    /// Assignments below this confidence are dropped.
    pub min_confidence: f32,
    /// Experts tried, in order, when an assigned expert fails.
    pub fallback_chain: Vec<String>,
    /// Capacity of the per-request route cache.
    pub route_cache_capacity: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_concurrent_experts: 3,
            min_confidence: 0.4,
            fallback_chain: vec![
                "scope3".to_string(),
                "data_insight".to_string(),
                "reasoning".to_string(),
            ],
            route_cache_capacity: 64,
        }
    }
}

fn resolve_env_path(var: &str) -> Option<PathBuf> {
    dotenvy::dotenv().ok();
    std::env::var(var).ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_are_normalized() {
        assert!(SearchSettings::default().weights_are_normalized());
    }

    #[test]
    fn skewed_weights_are_rejected() {
        let settings = SearchSettings {
            semantic_weight: 0.9,
            ..SearchSettings::default()
        };
        assert!(!settings.weights_are_normalized());
    }

    #[test]
    fn level_defaults_match_their_accessor() {
        let levels = LevelDefaults::default();
        assert_eq!(levels.get(Level::Chunk).dimension, 384);
        assert_eq!(levels.get(Level::Document).dimension, 768);
        assert!((levels.get(Level::Semantic).weight - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn builder_setters_override_defaults() {
        let config = EngineConfig::new()
            .with_data_dir("/tmp/loom")
            .with_db_path("/tmp/loom/kb.db");
        assert_eq!(config.data_dir.as_deref(), Some(std::path::Path::new("/tmp/loom")));
        assert!(config.kb.db_path.is_some());
    }
}
