#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use carbonloom::embed::{EmbedError, Embedder};
use carbonloom::generate::{GenerateError, GenerationParams, Generator};
use carbonloom::kb::{GraphError, GraphStore};
use carbonloom::router::{Expert, ExpertContext, ExpertError, ExpertResponse};
use carbonloom::types::{Level, Relationship, Vector};

/// Graph store whose every call fails, toggleable back to healthy.
///
/// Mirrors a graph backend dropping off the network mid-session.
#[derive(Default)]
pub struct FlakyGraphStore {
    down: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        let store = Self::default();
        store.set_down(true);
        store
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), GraphError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(GraphError::Unavailable {
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for FlakyGraphStore {
    async fn upsert_node(&self, _node_id: &str, _properties: Value) -> Result<(), GraphError> {
        self.check()
    }

    async fn upsert_edge(&self, _relationship: &Relationship) -> Result<(), GraphError> {
        self.check()
    }

    async fn delete_node(&self, _node_id: &str) -> Result<(), GraphError> {
        self.check()
    }

    async fn delete_edges(&self, _node_id: &str) -> Result<(), GraphError> {
        self.check()
    }

    async fn query_subgraph(&self, _node_id: &str) -> Result<Vec<Relationship>, GraphError> {
        self.check().map(|()| Vec::new())
    }
}

/// Generator that always reports the backend down.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineGenerator;

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

/// Expert that fails every call under a configurable id, so fallback
/// behavior can be observed for any slot.
pub struct FailingExpert {
    pub id: &'static str,
}

#[async_trait]
impl Expert for FailingExpert {
    fn id(&self) -> &'static str {
        self.id
    }

    async fn analyze(&self, _ctx: &ExpertContext) -> Result<ExpertResponse, ExpertError> {
        Err(ExpertError::Unavailable {
            expert_id: self.id,
            message: "simulated outage".into(),
        })
    }
}

/// Embedder whose backend is permanently unreachable.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn dimension(&self, _level: Level) -> usize {
        8
    }

    async fn embed(&self, _texts: &[String], _level: Level) -> Result<Vec<Vector>, EmbedError> {
        Err(EmbedError::Unavailable {
            provider: "offline-embedder",
            message: "connection refused".into(),
        })
    }
}
