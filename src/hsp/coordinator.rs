//! The Project Coordinator: turns a user query into a subtask DAG, schedules
//! it topologically against a capacity cap, substitutes dependency outputs
//! into downstream parameters, dispatches each subtask over the bus, and
//! integrates the results.
//!
//! The fan-out mechanics mirror this codebase's `Orchestration::execute_parallel`:
//! push `tokio::spawn` handles into a `Vec`, then await them back. Here the
//! set of tasks eligible to spawn in a given round is whatever the DAG's
//! topological frontier allows, rather than "every agent at once".

use crate::hsp::bus::BusConnector;
use crate::hsp::config::OrchestratorConfig;
use crate::hsp::error::CoordinatorError;
use crate::hsp::envelope::Envelope;
use crate::hsp::gateway::{LlmGateway, ProjectPlan, SubtaskSpec};
use crate::hsp::lifecycle::AgentLifecycleManager;
use crate::hsp::messages::{dependency_ref_name, CapabilityFilter, ErrorDetails, TaskRequest, TaskResult};
use crate::hsp::registry::ServiceRegistry;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Maximum number of subtasks dispatched concurrently within one project.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;
/// Budget for a single subtask's request/response round trip.
pub const DEFAULT_SUBTASK_DEADLINE: Duration = Duration::from_secs(30);

/// Whether a project aborts on the first subtask failure, or presses on and
/// reports partial results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Strict,
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubtaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Never dispatched because a dependency failed or was itself cancelled.
    /// Terminal, like `Succeeded`/`Failed`.
    Cancelled,
}

#[derive(Debug)]
struct SubtaskNode {
    spec: SubtaskSpec,
    state: SubtaskState,
}

/// Per-project bookkeeping: node states plus the parameter-resolved output
/// of every subtask that has completed, so later stages can substitute them.
#[derive(Debug)]
struct ProjectExecutionState {
    nodes: HashMap<String, SubtaskNode>,
    outputs: HashMap<String, serde_json::Value>,
}

impl ProjectExecutionState {
    fn from_plan(plan: &ProjectPlan) -> Result<Self, CoordinatorError> {
        let mut nodes = HashMap::new();
        for spec in &plan.subtasks {
            if nodes.contains_key(&spec.name) {
                return Err(CoordinatorError::DuplicateSubtaskName {
                    name: spec.name.clone(),
                });
            }
            nodes.insert(
                spec.name.clone(),
                SubtaskNode {
                    spec: spec.clone(),
                    state: SubtaskState::Pending,
                },
            );
        }
        for node in nodes.values() {
            for dep in &node.spec.depends_on {
                if !nodes.contains_key(dep) {
                    return Err(CoordinatorError::UnknownDependency {
                        subtask: node.spec.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        detect_cycle(&nodes)?;
        Ok(Self {
            nodes,
            outputs: HashMap::new(),
        })
    }

    /// Transition every `Pending` subtask whose dependency chain hits a
    /// `Failed` or `Cancelled` node to `Cancelled`, recording a rejected
    /// result for each. Runs to a fixed point so cancellation propagates
    /// transitively down the DAG in one call.
    fn cascade_cancel(&mut self, results: &mut HashMap<String, TaskResult>) {
        loop {
            let newly_cancelled: Vec<String> = self
                .nodes
                .iter()
                .filter(|(_, node)| node.state == SubtaskState::Pending)
                .filter(|(_, node)| {
                    node.spec.depends_on.iter().any(|dep| {
                        matches!(
                            self.nodes.get(dep).map(|d| &d.state),
                            Some(SubtaskState::Failed) | Some(SubtaskState::Cancelled)
                        )
                    })
                })
                .map(|(name, _)| name.clone())
                .collect();

            if newly_cancelled.is_empty() {
                break;
            }
            for name in &newly_cancelled {
                self.nodes.get_mut(name).unwrap().state = SubtaskState::Cancelled;
                results.insert(
                    name.clone(),
                    TaskResult::rejected(
                        Uuid::new_v4().to_string(),
                        name.clone(),
                        "coordinator".to_string(),
                        ErrorDetails::new(
                            "UPSTREAM_DEPENDENCY_FAILED",
                            format!("cancelled: a dependency of {} failed", name),
                        ),
                    ),
                );
            }
        }
    }

    /// Subtasks whose dependencies have all succeeded and that haven't
    /// started yet.
    fn ready_frontier(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.state == SubtaskState::Pending)
            .filter(|n| {
                n.spec
                    .depends_on
                    .iter()
                    .all(|dep| matches!(self.nodes.get(dep), Some(d) if d.state == SubtaskState::Succeeded))
            })
            .map(|n| n.spec.name.clone())
            .collect()
    }

    fn running_count(&self) -> usize {
        self.nodes.values().filter(|n| n.state == SubtaskState::Running).count()
    }

    fn is_complete(&self) -> bool {
        self.nodes.values().all(|n| {
            matches!(
                n.state,
                SubtaskState::Succeeded | SubtaskState::Failed | SubtaskState::Cancelled
            )
        })
    }

    fn has_failures(&self) -> bool {
        self.nodes.values().any(|n| n.state == SubtaskState::Failed)
    }
}

fn detect_cycle(nodes: &HashMap<String, SubtaskNode>) -> Result<(), CoordinatorError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        name: &'a str,
        nodes: &'a HashMap<String, SubtaskNode>,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> Result<(), CoordinatorError> {
        if stack.contains(name) {
            return Err(CoordinatorError::CyclicDependency {
                subtask: name.to_string(),
            });
        }
        if visited.contains(name) {
            return Ok(());
        }
        visited.insert(name);
        stack.insert(name);
        if let Some(node) = nodes.get(name) {
            for dep in &node.spec.depends_on {
                visit(dep, nodes, visited, stack)?;
            }
        }
        stack.remove(name);
        Ok(())
    }

    for name in nodes.keys() {
        visit(name, nodes, &mut visited, &mut stack)?;
    }
    Ok(())
}

/// Replace every `<output_of_subtask:name>` string parameter with the
/// structured (not stringified) output of the named upstream subtask.
fn substitute_parameters(
    spec: &SubtaskSpec,
    outputs: &HashMap<String, serde_json::Value>,
) -> Result<HashMap<String, serde_json::Value>, CoordinatorError> {
    let mut resolved = HashMap::with_capacity(spec.parameters.len());
    for (key, value) in &spec.parameters {
        let resolved_value = match value.as_str().and_then(dependency_ref_name) {
            Some(dep_name) => outputs.get(dep_name).cloned().ok_or_else(|| {
                CoordinatorError::ParameterSubstitutionFailed {
                    subtask: spec.name.clone(),
                    reference: dep_name.to_string(),
                }
            })?,
            None => value.clone(),
        };
        resolved.insert(key.clone(), resolved_value);
    }
    Ok(resolved)
}

/// Orchestrates one user query end to end: decompose, schedule, dispatch,
/// integrate.
pub struct ProjectCoordinator {
    gateway: Arc<dyn LlmGateway>,
    registry: Arc<ServiceRegistry>,
    lifecycle: Arc<AgentLifecycleManager>,
    bus: Arc<BusConnector>,
    max_in_flight: usize,
    subtask_deadline: Duration,
    failure_policy: FailurePolicy,
}

/// The final outcome of running a project: the integrated answer (if the
/// failure policy allowed integration) plus every subtask's raw result.
pub struct ProjectOutcome {
    pub answer: Option<String>,
    pub subtask_results: HashMap<String, TaskResult>,
}

impl ProjectCoordinator {
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        registry: Arc<ServiceRegistry>,
        lifecycle: Arc<AgentLifecycleManager>,
        bus: Arc<BusConnector>,
    ) -> Self {
        Self {
            gateway,
            registry,
            lifecycle,
            bus,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            subtask_deadline: DEFAULT_SUBTASK_DEADLINE,
            failure_policy: FailurePolicy::Strict,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Apply the relevant fields of an [`OrchestratorConfig`] to this coordinator.
    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.max_in_flight = config.max_in_flight_subtasks;
        self.subtask_deadline = config.subtask_deadline;
        self.failure_policy = config.failure_policy;
        self
    }

    /// Run a query to completion: decompose into a DAG, schedule and
    /// dispatch every subtask, then integrate. Under [`FailurePolicy::Strict`]
    /// the first subtask failure aborts the project (no integration runs);
    /// under [`FailurePolicy::BestEffort`] the project runs to completion
    /// and integrates whatever results succeeded.
    pub async fn handle_project(&self, query: &str) -> Result<ProjectOutcome, CoordinatorError> {
        let plan = self
            .gateway
            .decompose(query)
            .await
            .map_err(CoordinatorError::PlanningFailed)?;

        let mut state = ProjectExecutionState::from_plan(&plan)?;
        let mut results: HashMap<String, TaskResult> = HashMap::new();

        loop {
            state.cascade_cancel(&mut results);

            if state.is_complete() {
                break;
            }
            if self.failure_policy == FailurePolicy::Strict && state.has_failures() {
                break;
            }

            let frontier = state.ready_frontier();
            let capacity = self.max_in_flight.saturating_sub(state.running_count());
            let batch: Vec<String> = frontier.into_iter().take(capacity).collect();

            if batch.is_empty() {
                if state.running_count() == 0 {
                    // Nothing ready and nothing in flight: either done, or blocked
                    // on a failed dependency under best-effort policy.
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for name in &batch {
                state.nodes.get_mut(name).unwrap().state = SubtaskState::Running;
                let spec = state.nodes[name].spec.clone();
                let params = match substitute_parameters(&spec, &state.outputs) {
                    Ok(p) => p,
                    Err(e) => {
                        state.nodes.get_mut(name).unwrap().state = SubtaskState::Failed;
                        warn!("subtask {} parameter substitution failed: {}", name, e);
                        continue;
                    }
                };
                let lifecycle = self.lifecycle.clone();
                let bus = self.bus.clone();
                let deadline = self.subtask_deadline;
                let subtask_name = name.clone();
                handles.push((
                    subtask_name.clone(),
                    tokio::spawn(dispatch_subtask(lifecycle, bus, spec, params, deadline)),
                ));
            }

            for (name, handle) in handles {
                let result = match handle.await {
                    Ok(Ok(task_result)) => task_result,
                    Ok(Err(e)) => {
                        warn!("subtask {} failed: {}", name, e);
                        state.nodes.get_mut(&name).unwrap().state = SubtaskState::Failed;
                        results.insert(name.clone(), failed_task_result(&name, &e.to_string()));
                        continue;
                    }
                    Err(join_err) => {
                        warn!("subtask {} panicked: {}", name, join_err);
                        state.nodes.get_mut(&name).unwrap().state = SubtaskState::Failed;
                        results.insert(name.clone(), failed_task_result(&name, &join_err.to_string()));
                        continue;
                    }
                };

                if result.is_success() {
                    state.nodes.get_mut(&name).unwrap().state = SubtaskState::Succeeded;
                    if let Some(payload) = result.payload.clone() {
                        state.outputs.insert(name.clone(), payload);
                    }
                } else {
                    state.nodes.get_mut(&name).unwrap().state = SubtaskState::Failed;
                }
                results.insert(name, result);
            }
        }

        if self.failure_policy == FailurePolicy::Strict && state.has_failures() {
            return Ok(ProjectOutcome {
                answer: None,
                subtask_results: results,
            });
        }

        info!("integrating {} subtask results for query", results.len());
        let answer = self.gateway.integrate(query, &state.outputs).await.ok();

        Ok(ProjectOutcome {
            answer,
            subtask_results: results,
        })
    }
}

async fn dispatch_subtask(
    lifecycle: Arc<AgentLifecycleManager>,
    bus: Arc<BusConnector>,
    spec: SubtaskSpec,
    parameters: HashMap<String, serde_json::Value>,
    deadline: Duration,
) -> Result<TaskResult, CoordinatorError> {
    let target_agent_id = lifecycle
        .ensure_running(&spec.capability_name)
        .await
        .map_err(|e| CoordinatorError::SubtaskFailed {
            subtask: spec.name.clone(),
            reason: e.to_string(),
        })?;

    let request = TaskRequest::new(
        Uuid::new_v4().to_string(),
        bus.agent_id().to_string(),
        CapabilityFilter::Name(spec.capability_name.clone()),
        bus.agent_id().to_string(),
    )
    .with_parameters(parameters);

    let envelope = Envelope::request(
        bus.agent_id().to_string(),
        format!("hsp/tasks/{}", target_agent_id),
        "task-request/1.0",
        serde_json::to_value(&request).unwrap(),
    );

    let response = bus
        .request(envelope, deadline)
        .await
        .map_err(|e| CoordinatorError::SubtaskFailed {
            subtask: spec.name.clone(),
            reason: e.to_string(),
        })?;

    serde_json::from_value(response.payload).map_err(|e| CoordinatorError::SubtaskFailed {
        subtask: spec.name.clone(),
        reason: e.to_string(),
    })
}

fn failed_task_result(subtask_name: &str, reason: &str) -> TaskResult {
    TaskResult::failure(
        Uuid::new_v4().to_string(),
        subtask_name.to_string(),
        "coordinator".to_string(),
        crate::hsp::messages::ErrorDetails::new("SUBTASK_FAILED", reason),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: &[&str]) -> SubtaskSpec {
        SubtaskSpec {
            name: name.to_string(),
            capability_name: name.to_string(),
            parameters: HashMap::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn detects_no_cycle_in_a_linear_chain() {
        let plan = ProjectPlan {
            subtasks: vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["b"])],
        };
        assert!(ProjectExecutionState::from_plan(&plan).is_ok());
    }

    #[test]
    fn detects_a_cycle() {
        let plan = ProjectPlan {
            subtasks: vec![spec("a", &["b"]), spec("b", &["a"])],
        };
        let err = ProjectExecutionState::from_plan(&plan).unwrap_err();
        assert!(matches!(err, CoordinatorError::CyclicDependency { .. }));
    }

    #[test]
    fn rejects_a_plan_with_a_duplicate_subtask_name() {
        let plan = ProjectPlan {
            subtasks: vec![spec("a", &[]), spec("a", &[])],
        };
        let err = ProjectExecutionState::from_plan(&plan).unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateSubtaskName { name } if name == "a"));
    }

    #[test]
    fn rejects_a_plan_with_an_unknown_dependency() {
        let plan = ProjectPlan {
            subtasks: vec![spec("a", &["ghost"])],
        };
        let err = ProjectExecutionState::from_plan(&plan).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::UnknownDependency { subtask, dependency }
                if subtask == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn ready_frontier_starts_with_leaf_dependencies_only() {
        let plan = ProjectPlan {
            subtasks: vec![spec("a", &[]), spec("b", &["a"])],
        };
        let state = ProjectExecutionState::from_plan(&plan).unwrap();
        assert_eq!(state.ready_frontier(), vec!["a".to_string()]);
    }

    #[test]
    fn substitute_parameters_resolves_dependency_reference() {
        let mut s = spec("b", &["a"]);
        s.parameters
            .insert("input".to_string(), serde_json::json!("<output_of_subtask:a>"));
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), serde_json::json!({"value": 42}));
        let resolved = substitute_parameters(&s, &outputs).unwrap();
        assert_eq!(resolved["input"], serde_json::json!({"value": 42}));
    }

    #[test]
    fn substitute_parameters_fails_on_unresolved_reference() {
        let mut s = spec("b", &["a"]);
        s.parameters
            .insert("input".to_string(), serde_json::json!("<output_of_subtask:missing>"));
        let err = substitute_parameters(&s, &HashMap::new()).unwrap_err();
        assert!(matches!(err, CoordinatorError::ParameterSubstitutionFailed { .. }));
    }

    #[test]
    fn cascade_cancel_propagates_through_a_chain_of_dependents() {
        let plan = ProjectPlan {
            subtasks: vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["b"])],
        };
        let mut state = ProjectExecutionState::from_plan(&plan).unwrap();
        state.nodes.get_mut("a").unwrap().state = SubtaskState::Failed;

        let mut results = HashMap::new();
        state.cascade_cancel(&mut results);

        assert_eq!(state.nodes["b"].state, SubtaskState::Cancelled);
        assert_eq!(state.nodes["c"].state, SubtaskState::Cancelled);
        assert!(!results["b"].is_success());
        assert!(!results["c"].is_success());
    }
}
