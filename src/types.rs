//! Shared data model for the retrieval-and-orchestration engine.
//!
//! Everything here is plain data: granularity levels, metadata maps, typed
//! query context, ranked results, and the tagged answer type returned to
//! callers. Component-specific types (index snapshots, store rows, expert
//! responses) live with their components.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An embedding vector. Dimensions are fixed per granularity level.
pub type Vector = Vec<f32>;

// ============================================================================
// Granularity Levels
// ============================================================================

/// One of the independently-indexed views of a document.
///
/// Each level has its own embedding space and its own vector index:
/// whole-document windows, paragraph-sized chunks, and fine-grained
/// semantic units (sentences).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Document,
    Chunk,
    Semantic,
}

impl Level {
    /// All levels in their canonical processing order.
    pub const ALL: [Level; 3] = [Level::Document, Level::Chunk, Level::Semantic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Document => "document",
            Level::Chunk => "chunk",
            Level::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Free-form metadata attached to documents, chunks, and vector entries.
///
/// A thin wrapper over a JSON-valued map with typed accessors for the keys
/// the engine itself interprets (`category`, `doc_id`, `year`, ...). All
/// other keys pass through untouched.
///
/// # Examples
///
/// ```
/// use carbonloom::types::Metadata;
/// use serde_json::json;
///
/// let meta = Metadata::new()
///     .with("category", json!("transport"))
///     .with("year", json!(2024));
///
/// assert_eq!(meta.category(), Some("transport"));
/// assert_eq!(meta.year(), Some(2024));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(FxHashMap<String, Value>);

impl Metadata {
    /// Metadata key holding the owning document's id.
    pub const DOC_ID: &'static str = "doc_id";
    /// Metadata key holding a chunk's id.
    pub const CHUNK_ID: &'static str = "chunk_id";
    /// Metadata key holding the emission category.
    pub const CATEGORY: &'static str = "category";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the value under `key` if it is a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.str_field(Self::DOC_ID)
    }

    pub fn chunk_id(&self) -> Option<&str> {
        self.str_field(Self::CHUNK_ID)
    }

    pub fn category(&self) -> Option<&str> {
        self.str_field(Self::CATEGORY)
    }

    /// Returns the `year` field, accepting either a JSON number or a
    /// numeric string.
    pub fn year(&self) -> Option<i64> {
        match self.0.get("year") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Query Context
// ============================================================================

/// Typed per-query context used for context-adjusted retrieval and routing.
///
/// Replaces the ad hoc dictionaries the caller used to thread through the
/// stack: the fields the engine actually interprets are explicit, anything
/// else rides along in `extras`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    pub category: Option<String>,
    pub year: Option<i64>,
    pub methodology: Option<String>,
    #[serde(default)]
    pub extras: FxHashMap<String, Value>,
}

impl QueryContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn with_year(mut self, year: i64) -> Self {
        self.year = Some(year);
        self
    }

    #[must_use]
    pub fn with_methodology(mut self, methodology: impl Into<String>) -> Self {
        self.methodology = Some(methodology.into());
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// True when no field is set; an empty context disables both
    /// context-adjusted filtering and metadata affinity scoring.
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.year.is_none()
            && self.methodology.is_none()
            && self.extras.is_empty()
    }
}

// ============================================================================
// Retrieval Results
// ============================================================================

/// A fused retrieval result for one document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub doc_id: String,
    /// Fused score. Weighted strategy: sum of per-level weighted
    /// similarities. Ensemble strategy: summed similarity averaged over
    /// votes.
    pub score: f32,
    /// Number of levels that surfaced this document.
    pub votes: usize,
    /// Text of the best-matching chunk seen for this document.
    pub text: String,
    pub metadata: Metadata,
    /// Per-level weighted similarity contributions.
    pub level_scores: FxHashMap<Level, f32>,
}

/// One hybrid-search result with its full score breakdown.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub text: String,
    pub metadata: Metadata,
    /// `semantic*ws + keyword*wk + metadata*wm` with configured weights.
    pub final_score: f32,
    pub semantic_score: f32,
    pub keyword_score: f32,
    pub metadata_score: f32,
    /// Explainability payload. Never feeds back into ranking.
    pub match_details: MatchDetails,
}

/// How a hit was matched, kept for audit and debugging output.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MatchDetails {
    /// Expansion variants that were searched, with their normalized weights.
    pub variants: Vec<WeightedVariant>,
    /// Query terms found in the document text.
    pub matched_terms: Vec<String>,
    /// Per-field metadata affinity scores.
    pub metadata_fields: FxHashMap<String, f32>,
    /// Set when a partial-signal failure forced semantic-only ranking.
    pub degraded: bool,
}

/// A query-expansion variant and its weight (normalized to sum to 1 across
/// all variants of one expansion).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedVariant {
    pub text: String,
    pub weight: f32,
}

// ============================================================================
// Answers
// ============================================================================

/// Final outcome of a query, tagged by how it was produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentResult {
    /// Full pipeline completed: retrieval, expert analysis, synthesis.
    Answer(QueryAnswer),
    /// Analysis completed but a collaborator was unavailable; the answer
    /// was assembled from expert output without final synthesis.
    Degraded { answer: QueryAnswer, reason: String },
    /// Retrieval produced nothing relevant. Not an error.
    NoContent,
}

impl AgentResult {
    pub fn is_no_content(&self) -> bool {
        matches!(self, AgentResult::NoContent)
    }
}

/// A synthesized answer with its provenance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub content: String,
    /// Mean confidence across contributing experts, in [0, 1].
    pub confidence: f32,
    /// Document ids of the passages that grounded the answer.
    pub sources: Vec<String>,
    /// Experts whose responses fed the answer.
    pub expert_ids: Vec<String>,
}

// ============================================================================
// Relationships
// ============================================================================

/// Kind of a mirrored relationship edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BelongsToCategory,
    UsesMethodology,
    Custom(String),
}

impl RelationKind {
    pub fn as_str(&self) -> &str {
        match self {
            RelationKind::BelongsToCategory => "belongs_to_category",
            RelationKind::UsesMethodology => "uses_methodology",
            RelationKind::Custom(kind) => kind,
        }
    }
}

impl From<&str> for RelationKind {
    fn from(value: &str) -> Self {
        match value {
            "belongs_to_category" => RelationKind::BelongsToCategory,
            "uses_methodology" => RelationKind::UsesMethodology,
            other => RelationKind::Custom(other.to_string()),
        }
    }
}

/// A derived edge mirrored into the optional graph store.
///
/// Never authoritative: the knowledge base owns the data, the graph mirror
/// is a best-effort index over it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    pub kind: RelationKind,
    pub properties: Value,
}

impl Relationship {
    #[must_use]
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        kind: RelationKind,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            kind,
            properties: Value::Object(Default::default()),
        }
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }
}

// ============================================================================
// Health
// ============================================================================

/// Reachability of the optional graph mirror, surfaced through stats.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphHealth {
    pub reachable: bool,
    /// Last failure detail when unreachable.
    pub detail: Option<String>,
}

impl GraphHealth {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            detail: None,
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            detail: Some(detail.into()),
        }
    }
}
