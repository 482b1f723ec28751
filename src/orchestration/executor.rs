//! Worker execution interface.
//!
//! Workers are opaque executors behind a uniform `execute(request) -> output`
//! contract. Implementations must be safe to call concurrently for distinct
//! steps and should honor the timeout carried by the request; the
//! coordinator drops the future when the timeout expires either way.

use crate::core::plan::StepRole;
use crate::core::task::{Priority, Requirement, TaskId};
use crate::core::worker::WorkerId;
use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

/// Output of an upstream step handed to a dependent step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInput {
    pub from: TaskId,
    pub worker_id: WorkerId,
    pub output: String,
}

/// Everything a worker receives for one dispatch of a step.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub step_id: TaskId,
    pub name: String,
    pub description: String,
    pub role: StepRole,
    pub required: Vec<Requirement>,
    /// Outputs of the steps this one depends on, in declaration order.
    pub inputs: Vec<StepInput>,
    /// 1-based dispatch count on the current worker.
    pub attempt: u32,
    pub timeout: Duration,
    pub priority: Priority,
}

/// The worker execution contract.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Run one step and return its output.
    async fn execute(&self, request: StepRequest) -> Result<String>;
}

type ExecFn = dyn Fn(StepRequest) -> BoxFuture<'static, Result<String>> + Send + Sync;

/// Adapts a closure returning a boxed future into a `WorkerExecutor`.
///
/// # Example
///
/// ```
/// use futures::FutureExt;
/// use swarm_router::orchestration::FnExecutor;
///
/// let executor = FnExecutor::new(|request| {
///     async move { Ok(format!("done: {}", request.name)) }.boxed()
/// });
/// # let _ = executor;
/// ```
pub struct FnExecutor {
    func: Box<ExecFn>,
}

impl FnExecutor {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(StepRequest) -> BoxFuture<'static, Result<String>> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl WorkerExecutor for FnExecutor {
    async fn execute(&self, request: StepRequest) -> Result<String> {
        (self.func)(request).await
    }
}
