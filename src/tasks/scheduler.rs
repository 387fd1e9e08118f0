//! The task graph scheduler
//!
//! A single-threaded coordinator owns all graph state; node `process`
//! closures are dispatched onto the runtime for concurrent execution, capped
//! at the configured limit. Results are memoized by `(kind, name, version)`
//! in the shared result cache. A failed node skips its transitive dependents;
//! the scheduler keeps going until no further progress is possible and then
//! reports the aggregate.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DependencyResults, NodeResult, NodeStatus, ResultCache, TaskNode};
use crate::error::{GardenError, GardenResult};
use crate::process::CancelToken;

#[derive(Debug, Clone, PartialEq)]
enum NodeState {
    Pending,
    InProgress,
    Terminal(NodeResult),
}

/// Aggregate outcome of one scheduler run
#[derive(Debug, Clone)]
pub struct GraphResult {
    pub results: BTreeMap<String, NodeResult>,
}

impl GraphResult {
    pub fn succeeded(&self) -> bool {
        self.results.values().all(NodeResult::succeeded)
    }

    pub fn failed(&self) -> Vec<&NodeResult> {
        self.results
            .values()
            .filter(|r| r.status == NodeStatus::Failed)
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&NodeResult> {
        self.results.get(key)
    }

    /// One-line-per-node summary for error reporting
    pub fn summary(&self) -> String {
        self.results
            .values()
            .map(|r| {
                let detail = match r.status {
                    NodeStatus::Failed => r.error.clone().unwrap_or_default(),
                    NodeStatus::Skipped => format!(
                        "dependency {} failed",
                        r.dependency_failed.clone().unwrap_or_default()
                    ),
                    _ => String::new(),
                };
                if detail.is_empty() {
                    format!("{}: {:?}", r.key, r.status)
                } else {
                    format!("{}: {:?} ({})", r.key, r.status, detail)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Executes batches of task nodes
pub struct TaskGraph {
    concurrency: usize,
    cache: Arc<Mutex<ResultCache>>,
    cancel: CancelToken,
}

impl TaskGraph {
    pub fn new(concurrency: usize, cache: Arc<Mutex<ResultCache>>, cancel: CancelToken) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cache,
            cancel,
        }
    }

    /// Run all nodes to a terminal state. Node failures do not fail the call;
    /// they are reported in the [`GraphResult`]. An `Err` is only returned
    /// for malformed graphs (duplicate keys, missing dependencies).
    pub async fn process(&self, batch: Vec<TaskNode>) -> GardenResult<GraphResult> {
        let mut nodes: BTreeMap<String, TaskNode> = BTreeMap::new();
        for node in batch {
            let key = node.key();
            if nodes.insert(key.clone(), node).is_some() {
                return Err(GardenError::internal(format!(
                    "duplicate task node key '{}'",
                    key
                )));
            }
        }
        for node in nodes.values() {
            for dep in &node.dependencies {
                if !nodes.contains_key(dep) {
                    return Err(GardenError::internal(format!(
                        "node '{}' depends on '{}', which is not part of the batch",
                        node.key(),
                        dep
                    )));
                }
            }
        }

        let batch = Uuid::new_v4();
        info!(batch = %batch, nodes = nodes.len(), "processing task graph");

        let mut states: BTreeMap<String, NodeState> = nodes
            .keys()
            .map(|k| (k.clone(), NodeState::Pending))
            .collect();
        let mut running: JoinSet<(String, anyhow::Result<serde_json::Value>)> = JoinSet::new();
        let mut in_flight = 0usize;

        loop {
            if !self.cancel.is_cancelled() {
                // Cache hits complete nodes without going in flight, which can
                // unlock further ready nodes; keep going until nothing moves
                loop {
                    self.propagate_skips(&nodes, &mut states);
                    let (dispatched, completed_from_cache) =
                        self.dispatch_ready(&nodes, &mut states, &mut running, in_flight);
                    in_flight += dispatched;
                    if dispatched == 0 && completed_from_cache == 0 {
                        break;
                    }
                }
            } else {
                // No new dispatches after cancellation; in-flight nodes drain
                for (key, state) in states.iter_mut() {
                    if *state == NodeState::Pending {
                        let node = &nodes[key];
                        *state = NodeState::Terminal(terminal(
                            node,
                            NodeStatus::Cancelled,
                            None,
                            Some("cancelled before starting".to_string()),
                        ));
                    }
                }
            }

            if in_flight == 0 {
                let all_terminal = states
                    .values()
                    .all(|s| matches!(s, NodeState::Terminal(_)));
                if all_terminal {
                    break;
                }
                if self.cancel.is_cancelled() {
                    continue;
                }
                return Err(GardenError::internal(
                    "scheduler stalled: no nodes in flight and none ready",
                ));
            }

            match running.join_next().await {
                None => in_flight = 0,
                Some(joined) => {
                    in_flight -= 1;
                    let (key, outcome) = match joined {
                        Ok(pair) => pair,
                        Err(join_error) => {
                            warn!(error = %join_error, "task node panicked");
                            continue;
                        }
                    };
                    let node = &nodes[&key];
                    let result = match outcome {
                        Ok(output) => {
                            let result =
                                terminal(node, NodeStatus::Complete, Some(output), None);
                            self.cache.lock().unwrap().insert(result.clone());
                            result
                        }
                        Err(error) => {
                            debug!(node = %key, error = %error, "task node failed");
                            terminal(node, NodeStatus::Failed, None, Some(error.to_string()))
                        }
                    };
                    states.insert(key, NodeState::Terminal(result));
                }
            }
        }

        let results = states
            .into_iter()
            .map(|(key, state)| match state {
                NodeState::Terminal(result) => (key, result),
                _ => unreachable!("non-terminal state after scheduler loop"),
            })
            .collect();
        Ok(GraphResult { results })
    }

    /// Mark every pending node with a failed/skipped/cancelled dependency as
    /// skipped, repeating until settled (skips cascade).
    fn propagate_skips(
        &self,
        nodes: &BTreeMap<String, TaskNode>,
        states: &mut BTreeMap<String, NodeState>,
    ) {
        loop {
            let mut skipped: Vec<(String, String)> = Vec::new();
            for (key, state) in states.iter() {
                if *state != NodeState::Pending {
                    continue;
                }
                let node = &nodes[key];
                let failed_dep = node.dependencies.iter().find(|dep| {
                    matches!(
                        states.get(*dep),
                        Some(NodeState::Terminal(result)) if !result.succeeded()
                    )
                });
                if let Some(dep) = failed_dep {
                    skipped.push((key.clone(), dep.clone()));
                }
            }
            if skipped.is_empty() {
                return;
            }
            for (key, dep) in skipped {
                let node = &nodes[&key];
                let mut result = terminal(node, NodeStatus::Skipped, None, None);
                result.dependency_failed = Some(dep);
                states.insert(key, NodeState::Terminal(result));
            }
        }
    }

    /// Dispatch ready nodes up to the concurrency limit, deterministic order
    /// by (kind priority, name). Returns (put in flight, completed from cache).
    fn dispatch_ready(
        &self,
        nodes: &BTreeMap<String, TaskNode>,
        states: &mut BTreeMap<String, NodeState>,
        running: &mut JoinSet<(String, anyhow::Result<serde_json::Value>)>,
        in_flight: usize,
    ) -> (usize, usize) {
        let mut ready: Vec<&TaskNode> = states
            .iter()
            .filter(|(_, state)| **state == NodeState::Pending)
            .map(|(key, _)| &nodes[key])
            .filter(|node| {
                node.dependencies.iter().all(|dep| {
                    matches!(
                        states.get(dep),
                        Some(NodeState::Terminal(result)) if result.succeeded()
                    )
                })
            })
            .collect();
        ready.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));

        let slots = self.concurrency.saturating_sub(in_flight);
        let mut dispatched = 0;
        let mut completed_from_cache = 0;

        for node in ready.into_iter().take(slots) {
            let key = node.key();

            // Memoization: an unforced node with a cached result completes
            // immediately without invoking its process
            if !node.force {
                let cached = self
                    .cache
                    .lock()
                    .unwrap()
                    .get(node.kind, &node.name, &node.version)
                    .cloned();
                if let Some(hit) = cached {
                    debug!(node = %key, version = %node.version, "result cache hit");
                    let mut result = hit;
                    result.cached = true;
                    states.insert(key, NodeState::Terminal(result));
                    completed_from_cache += 1;
                    continue;
                }
            }

            debug!(node = %key, "dispatching");
            let dependency_results = DependencyResults::new(
                node.dependencies
                    .iter()
                    .filter_map(|dep| match states.get(dep) {
                        Some(NodeState::Terminal(result)) => Some((dep.clone(), result.clone())),
                        _ => None,
                    })
                    .collect(),
            );
            let process = node.process.clone();
            let cancel = self.cancel.clone();
            let timeout = node.timeout;
            let spawn_key = key.clone();
            running.spawn(async move {
                let work = process(dependency_results, cancel);
                let outcome = match timeout {
                    None => work.await,
                    Some(limit) => run_with_timeout(work, limit).await,
                };
                (spawn_key, outcome)
            });
            states.insert(key, NodeState::InProgress);
            dispatched += 1;
        }
        (dispatched, completed_from_cache)
    }
}

async fn run_with_timeout(
    work: super::NodeFuture,
    limit: Duration,
) -> anyhow::Result<serde_json::Value> {
    match tokio::time::timeout(limit, work).await {
        Ok(outcome) => outcome,
        Err(_) => Err(GardenError::Timeout {
            message: "node exceeded its timeout".to_string(),
            seconds: limit.as_secs(),
        }
        .into()),
    }
}

fn terminal(
    node: &TaskNode,
    status: NodeStatus,
    output: Option<serde_json::Value>,
    error: Option<String>,
) -> NodeResult {
    NodeResult {
        kind: node.kind,
        name: node.name.clone(),
        key: node.key(),
        version: node.version.clone(),
        status,
        output,
        error,
        dependency_failed: None,
        cached: false,
        started_at: Some(Utc::now()),
        completed_at: Some(Utc::now()),
    }
}
