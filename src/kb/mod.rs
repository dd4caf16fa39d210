//! Authoritative document store with versioning, deduplication, and a
//! best-effort relationship mirror.
//!
//! SQLite (through `tokio-rusqlite`) is the source of truth for document
//! content, chunk decompositions, and version history. The graph mirror
//! is a derived index: a failed mirror write never fails the
//! authoritative write, it only flips the reported [`GraphHealth`].

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

use crate::config::KbSettings;
use crate::types::{GraphHealth, Metadata, Relationship};
use crate::util::generate_doc_id;

pub mod graph;
mod store;

pub use graph::{GraphError, GraphStore, MemoryGraphStore, extract_relationships};
pub use store::{DocumentSummary, KbCounts};

use store::DocumentStore;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Diagnostic)]
pub enum KbError {
    #[error("document {doc_id} not found{}", .version_id.map(|v| format!(" at version {v}")).unwrap_or_default())]
    #[diagnostic(
        code(carbonloom::kb::not_found),
        help("list_documents() shows the ids currently stored")
    )]
    NotFound {
        doc_id: String,
        version_id: Option<i64>,
    },

    #[error("knowledge base storage failed: {0}")]
    #[diagnostic(code(carbonloom::kb::storage))]
    Storage(String),

    #[error("invalid knowledge base input: {0}")]
    #[diagnostic(code(carbonloom::kb::validation))]
    Validation(String),
}

// ============================================================================
// Versioning
// ============================================================================

/// How a version row came to be.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Creation,
    Update,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Creation => "creation",
            ChangeKind::Update => "update",
        }
    }
}

impl From<&str> for ChangeKind {
    fn from(value: &str) -> Self {
        match value {
            "update" => ChangeKind::Update,
            _ => ChangeKind::Creation,
        }
    }
}

/// One append-only entry in a document's history.
///
/// Ids are assigned by the store and strictly increase per knowledge
/// base instance; a deleted document's ids are never reused.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Version {
    pub version_id: i64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub change_kind: ChangeKind,
    /// Content length change in bytes relative to the previous version.
    /// Zero for the creation entry.
    pub size_delta: i64,
    /// Metadata as supplied with the write that produced this version.
    pub metadata: Metadata,
}

/// A stored document with its current chunk set and full history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub content: String,
    /// Chunk texts in position order, belonging to the current version.
    pub chunks: Vec<String>,
    pub metadata: Metadata,
    /// The version this view reflects. Equals the newest history entry
    /// unless a historical version was requested.
    pub current_version: Version,
    pub version_history: Vec<Version>,
}

// ============================================================================
// Deduplication
// ============================================================================

/// Scores how alike two document bodies are, in `[0, 1]`.
///
/// Used by the near-duplicate check during ingest. Implementations must
/// be pure; no I/O happens on this path.
pub trait SimilarityCheck: Send + Sync {
    fn similarity(&self, left: &str, right: &str) -> f32;
}

/// Word-set Jaccard overlap, the default near-duplicate check.
#[derive(Clone, Copy, Debug, Default)]
pub struct JaccardSimilarity;

impl SimilarityCheck for JaccardSimilarity {
    fn similarity(&self, left: &str, right: &str) -> f32 {
        let left: FxHashSet<String> = left.split_whitespace().map(str::to_lowercase).collect();
        let right: FxHashSet<String> = right.split_whitespace().map(str::to_lowercase).collect();
        if left.is_empty() && right.is_empty() {
            return 1.0;
        }
        if left.is_empty() || right.is_empty() {
            return 0.0;
        }
        let shared = left.intersection(&right).count();
        let union = left.len() + right.len() - shared;
        shared as f32 / union as f32
    }
}

// ============================================================================
// Ingest receipts
// ============================================================================

/// How an ingest call was resolved.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestDisposition {
    /// A new document was created.
    Created,
    /// Content landed as a new version of an existing document.
    Updated,
    /// Byte-identical content was already stored; nothing changed.
    Unchanged,
}

/// Outcome of [`KnowledgeBase::add_document`] or
/// [`KnowledgeBase::update_document`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub doc_id: String,
    pub disposition: IngestDisposition,
    /// Version the document is at after the call.
    pub version_id: i64,
}

// ============================================================================
// Knowledge base
// ============================================================================

/// Snapshot of store sizes plus graph mirror reachability.
#[derive(Clone, Debug, Serialize)]
pub struct KbStats {
    pub counts: KbCounts,
    pub graph: GraphHealth,
}

/// Versioned, deduplicated document store.
///
/// Writes go to SQLite first; the graph mirror is updated afterwards and
/// only best-effort. All methods take `&self`, the store serializes
/// structural writes internally.
pub struct KnowledgeBase {
    store: DocumentStore,
    graph: Arc<dyn GraphStore>,
    similarity: Arc<dyn SimilarityCheck>,
    dedup_threshold: f32,
    graph_health: Mutex<GraphHealth>,
}

impl KnowledgeBase {
    /// Opens the database at `settings.db_path`, or an in-memory one when
    /// no path is configured, and creates the schema if missing.
    pub async fn open(settings: &KbSettings, graph: Arc<dyn GraphStore>) -> Result<Self, KbError> {
        let store = match &settings.db_path {
            Some(path) => DocumentStore::open(path).await?,
            None => DocumentStore::open_in_memory().await?,
        };
        Ok(Self {
            store,
            graph,
            similarity: Arc::new(JaccardSimilarity),
            dedup_threshold: settings.dedup_threshold,
            graph_health: Mutex::new(GraphHealth::reachable()),
        })
    }

    /// Replaces the near-duplicate check used during ingest.
    #[must_use]
    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityCheck>) -> Self {
        self.similarity = similarity;
        self
    }

    /// Ingests a document.
    ///
    /// Byte-identical content is an idempotent no-op returning the
    /// existing id. Content similar to a stored document at or above the
    /// dedup threshold is routed to [`Self::update_document`] for that
    /// id. Otherwise a new document is created at version 1, with
    /// `doc_id` taken from `metadata` when supplied.
    #[instrument(skip(self, content, chunks, metadata), err)]
    pub async fn add_document(
        &self,
        content: &str,
        chunks: &[String],
        metadata: &Metadata,
    ) -> Result<IngestReceipt, KbError> {
        if content.trim().is_empty() {
            return Err(KbError::Validation(
                "document content must not be empty".into(),
            ));
        }
        let hash = content_hash(content);

        if let Some((doc_id, version_id)) = self.store.find_by_hash(&hash).await? {
            tracing::debug!(doc_id = %doc_id, "identical content already stored");
            return Ok(IngestReceipt {
                doc_id,
                disposition: IngestDisposition::Unchanged,
                version_id,
            });
        }

        if let Some(near_id) = self.find_near_duplicate(content).await? {
            tracing::info!(doc_id = %near_id, "near-duplicate detected, routing to update");
            return self.update_document(&near_id, content, chunks, metadata).await;
        }

        let doc_id = metadata
            .doc_id()
            .map(str::to_string)
            .unwrap_or_else(generate_doc_id);
        let relationships = extract_relationships(&doc_id, content, metadata);
        let version_id = self
            .store
            .insert_document(&doc_id, content, &hash, metadata, chunks, &relationships)
            .await?;
        self.mirror_document(&doc_id, metadata, &relationships, false)
            .await;

        tracing::info!(doc_id = %doc_id, version_id, "document created");
        Ok(IngestReceipt {
            doc_id,
            disposition: IngestDisposition::Created,
            version_id,
        })
    }

    /// Appends a new version of an existing document.
    ///
    /// A hash-identical update is a no-op returning the current version.
    /// Otherwise the chunk set is replaced atomically along with the new
    /// version row.
    #[instrument(skip(self, content, chunks, metadata), err)]
    pub async fn update_document(
        &self,
        doc_id: &str,
        content: &str,
        chunks: &[String],
        metadata: &Metadata,
    ) -> Result<IngestReceipt, KbError> {
        if content.trim().is_empty() {
            return Err(KbError::Validation(
                "document content must not be empty".into(),
            ));
        }
        let Some((old_content, old_hash, current_version)) =
            self.store.document_content(doc_id).await?
        else {
            return Err(KbError::NotFound {
                doc_id: doc_id.to_string(),
                version_id: None,
            });
        };

        let hash = content_hash(content);
        if hash == old_hash {
            tracing::debug!(doc_id = %doc_id, "content unchanged, keeping current version");
            return Ok(IngestReceipt {
                doc_id: doc_id.to_string(),
                disposition: IngestDisposition::Unchanged,
                version_id: current_version,
            });
        }

        let size_delta = content.len() as i64 - old_content.len() as i64;
        let relationships = extract_relationships(doc_id, content, metadata);
        let version_id = self
            .store
            .apply_update(
                doc_id,
                content,
                &hash,
                metadata,
                chunks,
                &relationships,
                size_delta,
            )
            .await?;
        self.mirror_document(doc_id, metadata, &relationships, true)
            .await;

        tracing::info!(doc_id = %doc_id, version_id, size_delta, "document updated");
        Ok(IngestReceipt {
            doc_id: doc_id.to_string(),
            disposition: IngestDisposition::Updated,
            version_id,
        })
    }

    /// Fetches a document, optionally viewed at a historical version.
    ///
    /// Content and chunks are always the currently stored ones; a
    /// historical request surfaces that version's hash, descriptor, and
    /// metadata snapshot through `current_version`.
    pub async fn get_document(
        &self,
        doc_id: &str,
        version_id: Option<i64>,
    ) -> Result<Document, KbError> {
        let Some(document) = self.store.get_document(doc_id).await? else {
            return Err(KbError::NotFound {
                doc_id: doc_id.to_string(),
                version_id: None,
            });
        };
        let Some(requested) = version_id else {
            return Ok(document);
        };
        let Some(version) = document
            .version_history
            .iter()
            .find(|version| version.version_id == requested)
            .cloned()
        else {
            return Err(KbError::NotFound {
                doc_id: doc_id.to_string(),
                version_id: Some(requested),
            });
        };
        Ok(Document {
            current_version: version,
            ..document
        })
    }

    /// Removes a document with its versions, chunks, and relationship
    /// edges. Returns `false` when no such document existed.
    #[instrument(skip(self), err)]
    pub async fn delete_document(&self, doc_id: &str) -> Result<bool, KbError> {
        let removed = self.store.delete_document(doc_id).await?;
        if removed {
            match self.graph.delete_node(doc_id).await {
                Ok(()) => *self.graph_health.lock() = GraphHealth::reachable(),
                Err(err) => {
                    tracing::warn!(doc_id = %doc_id, error = %err, "graph mirror delete failed");
                    *self.graph_health.lock() = GraphHealth::unreachable(err.to_string());
                }
            }
            tracing::info!(doc_id = %doc_id, "document deleted");
        }
        Ok(removed)
    }

    /// Identity rows for every stored document, in insertion order.
    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>, KbError> {
        self.store.list_documents().await
    }

    pub async fn stats(&self) -> Result<KbStats, KbError> {
        let counts = self.store.counts().await?;
        Ok(KbStats {
            counts,
            graph: self.graph_health(),
        })
    }

    /// Reachability observed on the most recent graph mirror write.
    pub fn graph_health(&self) -> GraphHealth {
        self.graph_health.lock().clone()
    }

    /// Most similar stored document at or above the dedup threshold.
    async fn find_near_duplicate(&self, content: &str) -> Result<Option<String>, KbError> {
        let mut best: Option<(String, f32)> = None;
        for (doc_id, stored) in self.store.all_contents().await? {
            let score = self.similarity.similarity(content, &stored);
            if score >= self.dedup_threshold
                && best.as_ref().is_none_or(|(_, top)| score > *top)
            {
                best = Some((doc_id, score));
            }
        }
        Ok(best.map(|(doc_id, _)| doc_id))
    }

    async fn mirror_document(
        &self,
        doc_id: &str,
        metadata: &Metadata,
        relationships: &[Relationship],
        replace_edges: bool,
    ) {
        match self
            .try_mirror(doc_id, metadata, relationships, replace_edges)
            .await
        {
            Ok(()) => *self.graph_health.lock() = GraphHealth::reachable(),
            Err(err) => {
                tracing::warn!(
                    doc_id = %doc_id,
                    error = %err,
                    "graph mirror write failed, continuing in degraded mode"
                );
                *self.graph_health.lock() = GraphHealth::unreachable(err.to_string());
            }
        }
    }

    async fn try_mirror(
        &self,
        doc_id: &str,
        metadata: &Metadata,
        relationships: &[Relationship],
        replace_edges: bool,
    ) -> Result<(), GraphError> {
        self.graph
            .upsert_node(
                doc_id,
                serde_json::json!({"type": "document", "metadata": metadata}),
            )
            .await?;
        if replace_edges {
            self.graph.delete_edges(doc_id).await?;
        }
        for relationship in relationships {
            self.graph.upsert_edge(relationship).await?;
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256 of the content bytes.
fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
