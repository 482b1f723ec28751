//! Task data model for arbitration and execution.
//!
//! Tasks are the units of arbitrable work. A task names the competencies
//! it needs and may be split into subtasks, which the arbitration engine
//! turns into plan steps. Step lifecycles are tracked with `StepStatus`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task or subtask.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Request priority. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// A required competency and its weight. Weights are not normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub competency: String,
    pub weight: f64,
}

impl Requirement {
    pub fn new(competency: &str, weight: f64) -> Self {
        Self {
            competency: competency.to_string(),
            weight,
        }
    }
}

/// Competency names of a requirement set, in declaration order.
pub fn competency_names(required: &[Requirement]) -> Vec<String> {
    required.iter().map(|r| r.competency.clone()).collect()
}

fn validate_requirements(owner: &str, required: &[Requirement]) -> Result<()> {
    if required.is_empty() {
        return Err(Error::Validation(format!(
            "{} declares no required competencies",
            owner
        )));
    }
    if let Some(bad) = required.iter().find(|r| r.weight < 0.0 || !r.weight.is_finite()) {
        return Err(Error::Validation(format!(
            "{} has invalid weight {} for '{}'",
            owner, bad.weight, bad.competency
        )));
    }
    let total: f64 = required.iter().map(|r| r.weight).sum();
    if total <= 0.0 {
        return Err(Error::Validation(format!(
            "{} has a total requirement weight of zero",
            owner
        )));
    }
    Ok(())
}

/// One independently assignable part of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub required: Vec<Requirement>,
    /// Sibling subtask whose output is this subtask's required input.
    pub consumes: Option<TaskId>,
    /// Per-step timeout override.
    pub timeout: Option<Duration>,
}

impl SubTask {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            required: Vec::new(),
            consumes: None,
            timeout: None,
        }
    }

    pub fn require(mut self, competency: &str, weight: f64) -> Self {
        self.required.push(Requirement::new(competency, weight));
        self
    }

    pub fn consuming(mut self, producer: TaskId) -> Self {
        self.consumes = Some(producer);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// True if this subtask shares any competency with `other`.
    pub fn overlaps(&self, other: &SubTask) -> bool {
        self.required
            .iter()
            .any(|a| other.required.iter().any(|b| a.competency == b.competency))
    }
}

/// A unit of arbitrable work.
///
/// Immutable once dispatched; execution state lives in the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Raw request text.
    pub description: String,
    pub required: Vec<Requirement>,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub depends_on: HashSet<TaskId>,
    /// Independent or chained parts of the task.
    pub subtasks: Vec<SubTask>,
    /// Competencies of a coordinator that supervises the subtasks.
    pub supervisor: Option<Vec<Requirement>>,
    /// Task-level default step timeout.
    pub step_timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task with the given description and no requirements.
    pub fn new(description: &str) -> Self {
        Self {
            id: TaskId::new(),
            description: description.to_string(),
            required: Vec::new(),
            priority: Priority::default(),
            deadline: None,
            depends_on: HashSet::new(),
            subtasks: Vec::new(),
            supervisor: None,
            step_timeout: None,
            created_at: Utc::now(),
        }
    }

    pub fn require(mut self, competency: &str, weight: f64) -> Self {
        self.required.push(Requirement::new(competency, weight));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_subtask(mut self, subtask: SubTask) -> Self {
        self.subtasks.push(subtask);
        self
    }

    pub fn supervised_by(mut self, required: Vec<Requirement>) -> Self {
        self.supervisor = Some(required);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, other: TaskId) -> Self {
        self.depends_on.insert(other);
        self
    }

    /// Check that the task can be scored.
    ///
    /// Without subtasks the task itself must carry requirements; with
    /// subtasks each subtask must, and `consumes` must name a sibling.
    pub fn validate(&self) -> Result<()> {
        if self.subtasks.is_empty() {
            validate_requirements(&format!("task {}", self.id.short()), &self.required)?;
        } else {
            let ids: HashSet<TaskId> = self.subtasks.iter().map(|s| s.id).collect();
            for sub in &self.subtasks {
                validate_requirements(&format!("subtask '{}'", sub.name), &sub.required)?;
                if let Some(producer) = sub.consumes {
                    if producer == sub.id || !ids.contains(&producer) {
                        return Err(Error::Validation(format!(
                            "subtask '{}' consumes unknown step {}",
                            sub.name,
                            producer.short()
                        )));
                    }
                }
            }
        }
        if let Some(supervisor) = &self.supervisor {
            validate_requirements("supervisor", supervisor)?;
            if self.subtasks.is_empty() {
                return Err(Error::Validation(
                    "a supervised task needs at least one subtask".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Why a step ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureCause {
    /// The worker returned an error.
    Worker(String),
    /// The last attempt exceeded its timeout.
    TimedOut(Duration),
    /// The plan was cancelled before or during the step.
    Cancelled,
    /// The plan deadline passed before the step could be dispatched.
    DeadlineExceeded,
    /// A step this one depends on did not succeed.
    DependencyFailed(TaskId),
    /// Neither the assigned worker nor any backup could take the step.
    NoViableWorker(String),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Worker(msg) => write!(f, "{}", msg),
            FailureCause::TimedOut(d) => write!(f, "timed out after {:?}", d),
            FailureCause::Cancelled => write!(f, "cancelled"),
            FailureCause::DeadlineExceeded => write!(f, "plan deadline exceeded"),
            FailureCause::DependencyFailed(id) => write!(f, "dependency {} failed", id.short()),
            FailureCause::NoViableWorker(msg) => write!(f, "no viable worker: {}", msg),
        }
    }
}

/// Step status in its lifecycle.
///
/// `pending → dispatched → running → {succeeded, failed, timed_out}
/// → (retrying → dispatched)* → terminal(succeeded | failed)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum StepStatus {
    #[default]
    Pending,
    Dispatched,
    Running,
    Succeeded,
    Failed {
        cause: FailureCause,
    },
    TimedOut,
    Retrying,
}

impl StepStatus {
    fn name(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Dispatched => "dispatched",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed { .. } => "failed",
            StepStatus::TimedOut => "timed_out",
            StepStatus::Retrying => "retrying",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }

    /// Check if a transition to `target` is valid from this status.
    pub fn can_transition(&self, target: &StepStatus) -> bool {
        matches!(
            (self, target),
            (StepStatus::Pending, StepStatus::Dispatched)
                | (StepStatus::Pending, StepStatus::Failed { .. })
                | (StepStatus::Dispatched, StepStatus::Running)
                | (StepStatus::Dispatched, StepStatus::Failed { .. })
                | (StepStatus::Running, StepStatus::Succeeded)
                | (StepStatus::Running, StepStatus::Failed { .. })
                | (StepStatus::Running, StepStatus::TimedOut)
                | (StepStatus::Failed { .. }, StepStatus::Retrying)
                | (StepStatus::TimedOut, StepStatus::Retrying)
                | (StepStatus::TimedOut, StepStatus::Failed { .. })
                | (StepStatus::Retrying, StepStatus::Dispatched)
                | (StepStatus::Retrying, StepStatus::Failed { .. })
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Failed { cause } => write!(f, "failed: {}", cause),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Status plus transition history for one step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepState {
    status: StepStatus,
    history: Vec<(String, DateTime<Utc>)>,
}

impl StepState {
    pub fn new() -> Self {
        Self {
            status: StepStatus::Pending,
            history: vec![(StepStatus::Pending.name().to_string(), Utc::now())],
        }
    }

    pub fn status(&self) -> &StepStatus {
        &self.status
    }

    /// Names of every status visited, in order.
    pub fn history(&self) -> Vec<&str> {
        self.history.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Move to `target`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, target: StepStatus) -> Result<()> {
        if !self.status.can_transition(&target) {
            return Err(Error::InvalidStepTransition {
                from: self.status.name().to_string(),
                to: target.name().to_string(),
            });
        }
        self.history.push((target.name().to_string(), Utc::now()));
        self.status = target;
        Ok(())
    }
}
