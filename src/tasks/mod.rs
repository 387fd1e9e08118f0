//! Task graph work units and results
//!
//! Heterogeneous work (builds, deploys, tests, one-shot tasks, provider
//! resolution, publish/delete flows) is expressed as [`TaskNode`]s: a tagged
//! kind, a version for memoization, dependency keys and a `process` closure.
//! The scheduler in [`scheduler`] executes batches of these under a
//! concurrency cap.

pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::process::CancelToken;

pub use scheduler::{GraphResult, TaskGraph};

/// Node kinds, declared in dispatch-priority order: when several nodes are
/// ready at once, lower kinds are picked first (names break ties).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Build,
    ResolveProvider,
    Deploy,
    Task,
    Test,
    Publish,
    Delete,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::ResolveProvider => "resolve-provider",
            Self::Deploy => "deploy",
            Self::Task => "task",
            Self::Test => "test",
            Self::Publish => "publish",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type NodeFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
pub type NodeProcess = Arc<dyn Fn(DependencyResults, CancelToken) -> NodeFuture + Send + Sync>;

/// One unit of work in the task graph
#[derive(Clone)]
pub struct TaskNode {
    pub kind: NodeKind,
    pub name: String,
    /// Participates in memoization; same (kind, name, version) = cache hit
    pub version: String,
    /// Keys of nodes that must complete first
    pub dependencies: Vec<String>,
    /// Disables the result cache for this node
    pub force: bool,
    /// Applied to the node's `process`; exceeding it fails with a timeout
    pub timeout: Option<Duration>,
    pub process: NodeProcess,
}

impl TaskNode {
    pub fn key(&self) -> String {
        node_key(self.kind, &self.name)
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("key", &self.key())
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("force", &self.force)
            .finish()
    }
}

pub fn node_key(kind: NodeKind, name: &str) -> String {
    format!("{}.{}", kind.as_str(), name)
}

/// Terminal node states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Complete,
    Failed,
    Skipped,
    Cancelled,
}

/// Outcome of one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResult {
    pub kind: NodeKind,
    pub name: String,
    pub key: String,
    pub version: String,
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Key of the failed dependency when status is `Skipped`
    pub dependency_failed: Option<String>,
    /// True when the result came from the result cache
    pub cached: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeResult {
    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Complete
    }
}

/// Immutable snapshot of dependency results handed to a node's `process`
#[derive(Debug, Clone, Default)]
pub struct DependencyResults {
    results: BTreeMap<String, NodeResult>,
}

impl DependencyResults {
    pub fn new(results: BTreeMap<String, NodeResult>) -> Self {
        Self { results }
    }

    pub fn get(&self, key: &str) -> Option<&NodeResult> {
        self.results.get(key)
    }

    pub fn output_of(&self, kind: NodeKind, name: &str) -> Option<&Value> {
        self.results
            .get(&node_key(kind, name))
            .and_then(|r| r.output.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeResult)> {
        self.results.iter()
    }
}

/// Process-wide memoization of node results by `(kind, name, version)`.
///
/// Owned by the coordinator; invalidation happens when module versions are
/// recomputed (or explicitly, e.g. from a file watcher).
#[derive(Default)]
pub struct ResultCache {
    entries: HashMap<(NodeKind, String, String), NodeResult>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: NodeKind, name: &str, version: &str) -> Option<&NodeResult> {
        self.entries
            .get(&(kind, name.to_string(), version.to_string()))
    }

    pub fn insert(&mut self, result: NodeResult) {
        self.entries.insert(
            (result.kind, result.name.clone(), result.version.clone()),
            result,
        );
    }

    /// Drop every cached result for a named target, across kinds and
    /// versions. Used when a module's sources or dependency versions change.
    pub fn invalidate(&mut self, name: &str) {
        self.entries.retain(|(_, n, _), _| n != name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(kind: NodeKind, name: &str, version: &str) -> NodeResult {
        NodeResult {
            kind,
            name: name.to_string(),
            key: node_key(kind, name),
            version: version.to_string(),
            status: NodeStatus::Complete,
            output: Some(json!({"ok": true})),
            error: None,
            dependency_failed: None,
            cached: false,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn kind_priority_matches_dispatch_order() {
        let mut kinds = vec![
            NodeKind::Test,
            NodeKind::Build,
            NodeKind::Task,
            NodeKind::Deploy,
            NodeKind::ResolveProvider,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                NodeKind::Build,
                NodeKind::ResolveProvider,
                NodeKind::Deploy,
                NodeKind::Task,
                NodeKind::Test,
            ]
        );
    }

    #[test]
    fn cache_hits_by_exact_version() {
        let mut cache = ResultCache::new();
        cache.insert(result(NodeKind::Build, "api", "v-1111111111"));
        assert!(cache.get(NodeKind::Build, "api", "v-1111111111").is_some());
        assert!(cache.get(NodeKind::Build, "api", "v-2222222222").is_none());
        assert!(cache.get(NodeKind::Test, "api", "v-1111111111").is_none());
    }

    #[test]
    fn invalidate_drops_all_versions_and_kinds_for_a_name() {
        let mut cache = ResultCache::new();
        cache.insert(result(NodeKind::Build, "api", "v-1111111111"));
        cache.insert(result(NodeKind::Build, "api", "v-2222222222"));
        cache.insert(result(NodeKind::Test, "api.unit", "v-3333333333"));
        cache.insert(result(NodeKind::Build, "web", "v-4444444444"));
        cache.invalidate("api");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(NodeKind::Build, "web", "v-4444444444").is_some());
    }
}
