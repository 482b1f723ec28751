//! Execution plans and their outcome reports.
//!
//! An `ExecutionPlan` is produced by arbitration for one request and owned
//! by it for the request's lifetime. Steps are laid out in groups; members
//! of a group have no edges between them and may run concurrently.

use crate::core::dag::StepDAG;
use crate::core::task::{FailureCause, Requirement, StepStatus, Task, TaskId};
use crate::core::worker::WorkerId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Topology used to order step dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Sequential,
    Parallel,
    Pipeline,
    Hierarchical,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Sequential => write!(f, "sequential"),
            Strategy::Parallel => write!(f, "parallel"),
            Strategy::Pipeline => write!(f, "pipeline"),
            Strategy::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

/// What a step does within its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    /// The only step of a plan.
    Solo,
    /// One stage of a sequential, parallel, or pipeline plan.
    Stage,
    /// A specialist step supervised by the lead.
    Subordinate,
    /// The coordinator step that receives every subordinate's output.
    Lead,
}

/// One worker assignment within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub worker_id: WorkerId,
    pub required: Vec<Requirement>,
    pub depends_on: Vec<TaskId>,
    /// Steps that must finish first because they hold the same worker.
    /// Ordering only: their output is not passed on and their failure
    /// does not fail this step.
    #[serde(default)]
    pub after: Vec<TaskId>,
    pub role: StepRole,
    pub timeout: Duration,
    /// Score of the assigned worker at arbitration time.
    pub match_score: f64,
}

impl PlanStep {
    pub fn ordered_after(mut self, step: Option<TaskId>) -> Self {
        if let Some(id) = step.filter(|id| !self.after.contains(id) && !self.depends_on.contains(id)) {
            self.after.push(id);
        }
        self
    }
}

/// Steps that may run concurrently.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepGroup {
    pub steps: Vec<PlanStep>,
}

/// Output of arbitration for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub task: Task,
    pub strategy: Strategy,
    pub groups: Vec<StepGroup>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// Lay out steps into dependency groups.
    ///
    /// # Errors
    /// Returns a validation error if a step names an unknown dependency,
    /// step ids repeat, or the dependency graph has a cycle.
    pub fn build(task: Task, strategy: Strategy, steps: Vec<PlanStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::Validation("a plan needs at least one step".to_string()));
        }

        let mut dag = StepDAG::new();
        for step in &steps {
            if dag.contains(&step.task_id) {
                return Err(Error::Validation(format!(
                    "step {} appears twice in the plan",
                    step.task_id.short()
                )));
            }
            dag.add_step(step.task_id);
        }
        for step in &steps {
            for dep in step.depends_on.iter().chain(&step.after) {
                dag.add_dependency(dep, &step.task_id)?;
            }
        }

        let mut by_id: HashMap<TaskId, PlanStep> =
            steps.into_iter().map(|s| (s.task_id, s)).collect();
        let groups = dag
            .layers()?
            .into_iter()
            .map(|layer| StepGroup {
                steps: layer.iter().filter_map(|id| by_id.remove(id)).collect(),
            })
            .collect();

        Ok(Self {
            task,
            strategy,
            groups,
            created_at: Utc::now(),
        })
    }

    /// All steps in dispatch order.
    pub fn steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.groups.iter().flat_map(|g| g.steps.iter())
    }

    pub fn step(&self, id: &TaskId) -> Option<&PlanStep> {
        self.steps().find(|s| &s.task_id == id)
    }

    pub fn step_count(&self) -> usize {
        self.steps().count()
    }

    /// The supervising step of a hierarchical plan.
    pub fn lead(&self) -> Option<&PlanStep> {
        self.steps().find(|s| s.role == StepRole::Lead)
    }

    /// Distinct workers named by the plan, in dispatch order.
    pub fn workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = Vec::new();
        for step in self.steps() {
            if !workers.contains(&step.worker_id) {
                workers.push(step.worker_id.clone());
            }
        }
        workers
    }
}

/// Terminal outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub task_id: TaskId,
    pub name: String,
    /// The worker that produced the terminal state.
    pub worker_id: WorkerId,
    pub status: StepStatus,
    /// Dispatches across every worker tried.
    pub attempts: u32,
    pub workers_tried: Vec<WorkerId>,
    pub output: Option<String>,
    pub duration: Duration,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.status.is_success()
    }

    /// The execution error this outcome surfaces, if it did not succeed.
    pub fn error(&self) -> Option<Error> {
        let StepStatus::Failed { cause } = &self.status else {
            return None;
        };
        Some(match cause {
            FailureCause::Cancelled => Error::Cancelled,
            FailureCause::TimedOut(timeout) => Error::StepTimedOut {
                step: self.name.clone(),
                worker: self.worker_id.clone(),
                timeout: *timeout,
            },
            other => Error::StepFailed {
                step: self.name.clone(),
                worker: self.worker_id.clone(),
                cause: other.to_string(),
            },
        })
    }
}

/// Every step's outcome for one executed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub task_id: TaskId,
    pub strategy: Strategy,
    pub outcomes: Vec<StepOutcome>,
    /// Output of the final step for chained and supervised plans.
    pub final_output: Option<String>,
    pub elapsed: Duration,
}

impl PlanReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(StepOutcome::succeeded)
    }

    pub fn outcome(&self, id: &TaskId) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| &o.task_id == id)
    }

    pub fn failed_steps(&self) -> Vec<&StepOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded()).collect()
    }

    /// Errors of the failed steps, in plan order.
    pub fn errors(&self) -> Vec<Error> {
        self.outcomes.iter().filter_map(StepOutcome::error).collect()
    }

    /// One entry per failed step: name, worker, and last-known cause.
    pub fn failure_summary(&self) -> String {
        self.errors()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}
