//! Optional graph mirror for document relationships.
//!
//! The knowledge base is the source of truth; the graph store is a
//! derived index that may be absent or unreachable. Every mirror
//! operation is best-effort from the caller's point of view.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{Metadata, RelationKind, Relationship};

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("graph backend unavailable: {message}")]
    #[diagnostic(
        code(carbonloom::kb::graph_unavailable),
        help("the knowledge base keeps working in degraded mode without relationship insights")
    )]
    Unavailable { message: String },
}

/// Driver seam for the relationship mirror.
///
/// Implementations are free to be remote (a graph database) or local;
/// all failures surface as [`GraphError::Unavailable`].
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_node(&self, node_id: &str, properties: Value) -> Result<(), GraphError>;

    async fn upsert_edge(&self, relationship: &Relationship) -> Result<(), GraphError>;

    /// Removes a node and every edge incident to it.
    async fn delete_node(&self, node_id: &str) -> Result<(), GraphError>;

    /// Removes all edges whose source is `node_id`, keeping the node.
    async fn delete_edges(&self, node_id: &str) -> Result<(), GraphError>;

    /// Edges incident to `node_id`, in insertion order.
    async fn query_subgraph(&self, node_id: &str) -> Result<Vec<Relationship>, GraphError>;
}

/// Derives mirror relationships from document metadata.
///
/// Category membership and methodology usage are the two edge kinds the
/// engine understands; content-derived extraction is a deliberate
/// extension point and currently contributes nothing.
pub fn extract_relationships(
    doc_id: &str,
    _content: &str,
    metadata: &Metadata,
) -> Vec<Relationship> {
    let mut relationships = Vec::new();
    if let Some(category) = metadata.category() {
        relationships.push(
            Relationship::new(
                doc_id,
                format!("category_{category}"),
                RelationKind::BelongsToCategory,
            )
            .with_properties(json!({ "confidence": 1.0 })),
        );
    }
    if let Some(methodology) = metadata.str_field("methodology") {
        relationships.push(
            Relationship::new(
                doc_id,
                format!("methodology_{methodology}"),
                RelationKind::UsesMethodology,
            )
            .with_properties(json!({ "confidence": 1.0 })),
        );
    }
    relationships
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct GraphInner {
    nodes: FxHashMap<String, Value>,
    edges: Vec<Relationship>,
}

/// Process-local graph store. The default mirror target when no external
/// graph backend is configured.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: RwLock<GraphInner>,
}

impl MemoryGraphStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edges.len()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_node(&self, node_id: &str, properties: Value) -> Result<(), GraphError> {
        self.inner
            .write()
            .nodes
            .insert(node_id.to_string(), properties);
        Ok(())
    }

    async fn upsert_edge(&self, relationship: &Relationship) -> Result<(), GraphError> {
        let mut inner = self.inner.write();
        let existing = inner.edges.iter_mut().find(|edge| {
            edge.source_id == relationship.source_id
                && edge.target_id == relationship.target_id
                && edge.kind == relationship.kind
        });
        match existing {
            Some(edge) => edge.properties = relationship.properties.clone(),
            None => inner.edges.push(relationship.clone()),
        }
        Ok(())
    }

    async fn delete_node(&self, node_id: &str) -> Result<(), GraphError> {
        let mut inner = self.inner.write();
        inner.nodes.remove(node_id);
        inner
            .edges
            .retain(|edge| edge.source_id != node_id && edge.target_id != node_id);
        Ok(())
    }

    async fn delete_edges(&self, node_id: &str) -> Result<(), GraphError> {
        self.inner
            .write()
            .edges
            .retain(|edge| edge.source_id != node_id);
        Ok(())
    }

    async fn query_subgraph(&self, node_id: &str) -> Result<Vec<Relationship>, GraphError> {
        Ok(self
            .inner
            .read()
            .edges
            .iter()
            .filter(|edge| edge.source_id == node_id || edge.target_id == node_id)
            .cloned()
            .collect())
    }
}
