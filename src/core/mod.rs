//! Core domain models for swarm routing.
//!
//! This module contains the fundamental data structures used throughout
//! the routing engine: workers, tasks, and execution plans with their
//! step DAG.

pub mod dag;
pub mod plan;
pub mod task;
pub mod worker;

pub use dag::StepDAG;
pub use plan::{ExecutionPlan, PlanReport, PlanStep, StepGroup, StepOutcome, StepRole, Strategy};
pub use task::{
    FailureCause, Priority, Requirement, StepState, StepStatus, SubTask, Task, TaskId,
};
pub use worker::{
    Circuit, CircuitState, Worker, WorkerDescriptor, WorkerId, WorkerStatus,
};
