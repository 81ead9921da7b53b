//! In-memory reference store implementations
//!
//! Concurrent-map stores for single-process deployments and tests. The
//! instance store serializes per-instance mutation through `DashMap` entry
//! locks, which is what makes its compare-and-swap atomic; the trace store
//! keeps one append-ordered vector per instance, which preserves the
//! per-instance total order the port requires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use cpg_core::graph::{GraphStatus, ProcessGraph};
use cpg_core::instance::ProcessInstance;
use cpg_core::trace::{DecisionTrace, TraceType};

use crate::error::{Result, StoreError};
use crate::traits::{GraphStore, InstanceStore, TraceStore};

/// In-memory graph template store
#[derive(Clone, Default)]
pub struct InMemoryGraphStore {
    graphs: Arc<DashMap<String, BTreeMap<u32, ProcessGraph>>>,
}

impl InMemoryGraphStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored templates across all versions
    pub fn graph_count(&self) -> usize {
        self.graphs.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get(&self, graph_id: &str, version: Option<u32>) -> Result<ProcessGraph> {
        let versions = self
            .graphs
            .get(graph_id)
            .ok_or_else(|| StoreError::graph_not_found(graph_id, version))?;

        match version {
            Some(v) => versions
                .get(&v)
                .cloned()
                .ok_or_else(|| StoreError::graph_not_found(graph_id, Some(v))),
            None => versions
                .values()
                .rev()
                .find(|g| g.status == GraphStatus::Published)
                .cloned()
                .ok_or_else(|| StoreError::graph_not_found(graph_id, None)),
        }
    }

    async fn put(&self, graph: ProcessGraph) -> Result<()> {
        self.graphs
            .entry(graph.graph_id.clone())
            .or_default()
            .insert(graph.version, graph);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, u32)>> {
        let mut entries: Vec<(String, u32)> = self
            .graphs
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .keys()
                    .map(|v| (entry.key().clone(), *v))
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort();
        Ok(entries)
    }
}

/// In-memory instance store with optimistic concurrency
#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    instances: Arc<DashMap<String, ProcessInstance>>,
}

impl InMemoryInstanceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn load(&self, instance_id: &str) -> Result<ProcessInstance> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))
    }

    async fn save(&self, instance: &ProcessInstance) -> Result<u64> {
        use dashmap::mapref::entry::Entry;

        // the entry lock serializes concurrent saves of the same instance
        match self.instances.entry(instance.instance_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get();
                if stored.version != instance.version {
                    return Err(StoreError::VersionConflict {
                        instance_id: instance.instance_id.clone(),
                        expected: instance.version,
                        actual: stored.version,
                    });
                }
                let mut updated = instance.clone();
                updated.version += 1;
                let new_version = updated.version;
                occupied.insert(updated);
                Ok(new_version)
            }
            Entry::Vacant(vacant) => {
                if instance.version != 0 {
                    return Err(StoreError::InstanceNotFound(instance.instance_id.clone()));
                }
                let mut inserted = instance.clone();
                inserted.version = 1;
                vacant.insert(inserted);
                Ok(1)
            }
        }
    }

    async fn remove(&self, instance_id: &str) -> Result<()> {
        self.instances
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-memory decision trace store
#[derive(Clone, Default)]
pub struct InMemoryTraceStore {
    by_instance: Arc<DashMap<String, Vec<DecisionTrace>>>,
    index: Arc<RwLock<BTreeMap<String, String>>>,
}

impl InMemoryTraceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored trace count
    pub fn trace_count(&self) -> usize {
        self.by_instance.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl TraceStore for InMemoryTraceStore {
    async fn append(&self, trace: DecisionTrace) -> Result<()> {
        self.index
            .write()
            .insert(trace.trace_id.clone(), trace.instance_id.clone());
        self.by_instance
            .entry(trace.instance_id.clone())
            .or_default()
            .push(trace);
        Ok(())
    }

    async fn get(&self, trace_id: &str) -> Result<DecisionTrace> {
        let instance_id = self
            .index
            .read()
            .get(trace_id)
            .cloned()
            .ok_or_else(|| StoreError::TraceNotFound(trace_id.to_string()))?;
        self.by_instance
            .get(&instance_id)
            .and_then(|traces| traces.iter().find(|t| t.trace_id == trace_id).cloned())
            .ok_or_else(|| StoreError::TraceNotFound(trace_id.to_string()))
    }

    async fn for_instance(&self, instance_id: &str) -> Result<Vec<DecisionTrace>> {
        Ok(self
            .by_instance
            .get(instance_id)
            .map(|traces| traces.clone())
            .unwrap_or_default())
    }

    async fn for_instance_of_type(
        &self,
        instance_id: &str,
        trace_type: TraceType,
    ) -> Result<Vec<DecisionTrace>> {
        Ok(self
            .for_instance(instance_id)
            .await?
            .into_iter()
            .filter(|t| t.trace_type == trace_type)
            .collect())
    }

    async fn for_instance_in_range(
        &self,
        instance_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DecisionTrace>> {
        Ok(self
            .for_instance(instance_id)
            .await?
            .into_iter()
            .filter(|t| t.timestamp >= from && t.timestamp < to)
            .collect())
    }

    async fn latest_for_instance(&self, instance_id: &str) -> Result<Option<DecisionTrace>> {
        Ok(self
            .by_instance
            .get(instance_id)
            .and_then(|traces| traces.last().cloned()))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        let mut index = self.index.write();
        for mut entry in self.by_instance.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|t| {
                let keep = t.timestamp >= cutoff;
                if !keep {
                    index.remove(&t.trace_id);
                }
                keep
            });
            removed += before - entry.value().len();
        }
        debug!(removed, "pruned traces");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpg_core::context::ExecutionContext;
    use cpg_core::edge::Edge;
    use cpg_core::node::{ActionSpec, Node};

    fn graph(id: &str, version: u32, status: GraphStatus) -> ProcessGraph {
        ProcessGraph::builder(id)
            .version(version)
            .status(status)
            .node(Node::new("a", ActionSpec::wait()))
            .node(Node::new("t", ActionSpec::wait()))
            .edge(Edge::new("e", "a", "t"))
            .entry("a")
            .terminal("t")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn graph_store_resolves_latest_published() {
        let store = InMemoryGraphStore::new();
        store.put(graph("g", 1, GraphStatus::Published)).await.unwrap();
        store.put(graph("g", 2, GraphStatus::Published)).await.unwrap();
        store.put(graph("g", 3, GraphStatus::Draft)).await.unwrap();

        assert_eq!(store.get("g", None).await.unwrap().version, 2);
        assert_eq!(store.get("g", Some(1)).await.unwrap().version, 1);
        assert!(store.get("g", Some(9)).await.is_err());
        assert!(store.get("missing", None).await.is_err());
        assert_eq!(store.graph_count(), 3);
    }

    #[tokio::test]
    async fn instance_save_is_compare_and_swap() {
        let store = InMemoryInstanceStore::new();
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());

        let v1 = store.save(&instance).await.unwrap();
        assert_eq!(v1, 1);
        instance.version = v1;

        let v2 = store.save(&instance).await.unwrap();
        assert_eq!(v2, 2);

        // stale writer with the old version loses
        let err = store.save(&instance).await.unwrap_err();
        match err {
            StoreError::VersionConflict { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn saving_unknown_instance_with_nonzero_version_fails() {
        let store = InMemoryInstanceStore::new();
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        instance.version = 5;
        assert!(matches!(
            store.save(&instance).await,
            Err(StoreError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn instance_load_and_remove() {
        let store = InMemoryInstanceStore::new();
        let instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        let id = instance.instance_id.clone();
        store.save(&instance).await.unwrap();

        assert_eq!(store.load(&id).await.unwrap().graph_id, "g");
        assert_eq!(store.list_ids().await.unwrap(), vec![id.clone()]);

        store.remove(&id).await.unwrap();
        assert!(store.load(&id).await.is_err());
    }

    #[tokio::test]
    async fn trace_store_preserves_append_order() {
        let store = InMemoryTraceStore::new();
        for trace_type in [TraceType::Navigation, TraceType::Execution, TraceType::Terminal] {
            store
                .append(DecisionTrace::new("inst", trace_type))
                .await
                .unwrap();
        }

        let traces = store.for_instance("inst").await.unwrap();
        assert_eq!(traces.len(), 3);
        assert_eq!(traces[0].trace_type, TraceType::Navigation);
        assert_eq!(traces[2].trace_type, TraceType::Terminal);

        let latest = store.latest_for_instance("inst").await.unwrap().unwrap();
        assert_eq!(latest.trace_type, TraceType::Terminal);

        let executions = store
            .for_instance_of_type("inst", TraceType::Execution)
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn trace_lookup_by_id_and_range() {
        let store = InMemoryTraceStore::new();
        let trace = DecisionTrace::new("inst", TraceType::Wait);
        let trace_id = trace.trace_id.clone();
        let stamp = trace.timestamp;
        store.append(trace).await.unwrap();

        assert_eq!(store.get(&trace_id).await.unwrap().trace_id, trace_id);
        assert!(store.get("missing").await.is_err());

        let hits = store
            .for_instance_in_range("inst", stamp, stamp + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let misses = store
            .for_instance_in_range("inst", stamp + chrono::Duration::seconds(1), stamp + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_old_traces_and_index_entries() {
        let store = InMemoryTraceStore::new();
        let trace = DecisionTrace::new("inst", TraceType::Wait);
        let trace_id = trace.trace_id.clone();
        store.append(trace).await.unwrap();

        let removed = store.prune_before(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.trace_count(), 0);
        assert!(store.get(&trace_id).await.is_err());
    }
}
