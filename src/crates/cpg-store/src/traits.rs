//! Store port traits
//!
//! The engine persists nothing itself; it talks to these three ports. The
//! contract that matters for correctness is on [`InstanceStore::save`]:
//! compare-and-swap on the instance version, so two concurrent steps of the
//! same instance can never both commit. Trace appends must preserve total
//! order within an instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cpg_core::graph::ProcessGraph;
use cpg_core::instance::ProcessInstance;
use cpg_core::trace::{DecisionTrace, TraceType};

use crate::error::Result;

/// Read access to graph templates, write access for authoring tools
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Fetch a graph by id and version; `None` selects the latest
    /// published version
    async fn get(&self, graph_id: &str, version: Option<u32>) -> Result<ProcessGraph>;

    /// Store a graph template under `(graph_id, version)`
    async fn put(&self, graph: ProcessGraph) -> Result<()>;

    /// All stored `(graph_id, version)` pairs
    async fn list(&self) -> Result<Vec<(String, u32)>>;
}

/// Instance persistence with optimistic concurrency
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Load an instance by id
    async fn load(&self, instance_id: &str) -> Result<ProcessInstance>;

    /// Save an instance, comparing `instance.version` against the stored
    /// version
    ///
    /// On match the instance is stored with the version incremented and the
    /// new version returned; on mismatch
    /// [`StoreError::VersionConflict`](crate::error::StoreError::VersionConflict)
    /// is returned and nothing is written. A version of 0 inserts a new
    /// instance.
    async fn save(&self, instance: &ProcessInstance) -> Result<u64>;

    /// Remove an instance
    async fn remove(&self, instance_id: &str) -> Result<()>;

    /// Ids of all stored instances
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// Append-only decision trace store
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Append a trace; implementations must preserve per-instance total
    /// order
    async fn append(&self, trace: DecisionTrace) -> Result<()>;

    /// Fetch a trace by id
    async fn get(&self, trace_id: &str) -> Result<DecisionTrace>;

    /// All traces of an instance, ordered by `(timestamp, trace_id)`
    async fn for_instance(&self, instance_id: &str) -> Result<Vec<DecisionTrace>>;

    /// Traces of an instance with the given type, ordered
    async fn for_instance_of_type(
        &self,
        instance_id: &str,
        trace_type: TraceType,
    ) -> Result<Vec<DecisionTrace>>;

    /// Traces of an instance within `[from, to)`, ordered
    async fn for_instance_in_range(
        &self,
        instance_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DecisionTrace>>;

    /// Most recent trace of an instance
    async fn latest_for_instance(&self, instance_id: &str) -> Result<Option<DecisionTrace>>;

    /// Delete all traces older than the cutoff; returns the deleted count
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
