//! Knowledge store contract
//!
//! The persistence layer behind the virtual-store hydration path is an
//! external collaborator; the core depends only on this trait. Backends
//! are plugins, so methods return `anyhow::Result`.

use crate::kernel::types::Value;
use async_trait::async_trait;
use std::collections::HashMap;

/// A persisted fact with provenance metadata
#[derive(Debug, Clone)]
pub struct StoredFact {
    /// Predicate symbol
    pub predicate: String,
    /// Argument values
    pub args: Vec<Value>,
    /// Category assigned at storage time (episodic, semantic, …)
    pub fact_type: String,
    /// Importance weight in [0, 1]
    pub importance: f64,
}

/// A typed link between two stored entities
#[derive(Debug, Clone)]
pub struct KnowledgeLink {
    /// Source node key
    pub from: String,
    /// Target node key
    pub to: String,
    /// Link kind
    pub kind: String,
}

/// Aggregate statistics over stored shard traces
#[derive(Debug, Clone, Default)]
pub struct TraceStats {
    /// Traces per shard type
    pub by_shard_type: HashMap<String, u64>,
    /// Total stored traces
    pub total: u64,
}

/// The persistence layer contract
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Persist one fact
    async fn store_fact(
        &self,
        predicate: &str,
        args: &[Value],
        fact_type: &str,
        importance: f64,
    ) -> anyhow::Result<()>;

    /// Load every fact of a predicate
    async fn load_facts(&self, predicate: &str) -> anyhow::Result<Vec<StoredFact>>;

    /// Load every fact of a category
    async fn load_all_facts(&self, fact_type: &str) -> anyhow::Result<Vec<StoredFact>>;

    /// Persist a link
    async fn store_link(&self, link: KnowledgeLink) -> anyhow::Result<()>;

    /// Links touching a node
    async fn query_links(&self, node: &str) -> anyhow::Result<Vec<KnowledgeLink>>;

    /// Most recently activated fact keys
    async fn get_recent_activations(&self, limit: usize) -> anyhow::Result<Vec<String>>;

    /// Semantic recall over stored content
    async fn vector_recall(&self, query: &str, k: usize) -> anyhow::Result<Vec<StoredFact>>;

    /// Session event history
    async fn get_session_history(&self, session_id: &str) -> anyhow::Result<Vec<String>>;

    /// Stored traces for one shard
    async fn get_shard_traces(&self, shard_id: &str) -> anyhow::Result<Vec<String>>;

    /// Aggregate trace statistics
    async fn get_trace_stats(&self) -> anyhow::Result<TraceStats>;
}
