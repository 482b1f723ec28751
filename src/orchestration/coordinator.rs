//! Execution coordinator for arbitrated plans.
//!
//! The `ExecutionCoordinator` drives an `ExecutionPlan` group by group.
//! Every step in a group is dispatched concurrently and the group is joined
//! before the next one starts; a step whose dependency did not succeed is
//! failed without being dispatched. The coordinator is the only writer of
//! step state.
//!
//! Each dispatch holds a `LoadLease` on its worker for exactly as long as
//! the worker runs. Failed and timed-out attempts are retried with
//! exponential backoff, then the step moves to the primary worker's
//! backups in order.

use crate::core::plan::{ExecutionPlan, PlanReport, PlanStep, StepOutcome, Strategy};
use crate::core::task::{FailureCause, StepState, StepStatus, TaskId};
use crate::core::worker::{CircuitState, WorkerId};
use crate::error::{Error, Result};
use crate::orchestration::arbiter::ArbitrationEngine;
use crate::orchestration::executor::{StepInput, StepRequest};
use crate::orchestration::health::HealthMonitor;
use crate::orchestration::metrics::MetricsCollector;
use crate::orchestration::registry::{CapabilityRegistry, LoadLease};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default dispatch attempts per worker.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;

/// Default growth factor between retries.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default ceiling on a single retry delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Dispatches per worker, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given 1-based failed attempt: `base × multiplier^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// No retries: every failure goes straight to the backups.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Events emitted by the coordinator for step lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    StepDispatched {
        step: TaskId,
        worker_id: WorkerId,
        attempt: u32,
    },
    StepSucceeded {
        step: TaskId,
        worker_id: WorkerId,
    },
    StepFailed {
        step: TaskId,
        worker_id: WorkerId,
        cause: String,
    },
    StepRetrying {
        step: TaskId,
        worker_id: WorkerId,
        attempt: u32,
        delay: Duration,
    },
    /// The step moved from a failing or unavailable worker to a backup.
    StepRedistributed {
        step: TaskId,
        from: WorkerId,
        to: WorkerId,
    },
    PlanFinished {
        task_id: TaskId,
        succeeded: bool,
    },
}

/// How a run of attempts on one worker ended.
enum WorkerRun {
    Succeeded(String),
    /// Cancellation or the plan deadline; no further workers are tried.
    Stopped(FailureCause),
    /// The worker could not or did not complete the step.
    GaveUp { reason: String },
}

enum Attempt {
    Completed(String),
    Errored(String),
    TimedOut,
    Cancelled,
}

/// Per-step bookkeeping carried across workers.
struct StepRun<'a> {
    step: &'a PlanStep,
    state: StepState,
    inputs: Vec<StepInput>,
    attempts: u32,
    tried: Vec<WorkerId>,
}

/// Drives execution plans against registered workers.
///
/// # Example
///
/// ```ignore
/// let coordinator = ExecutionCoordinator::new(registry, arbiter, health, metrics, RetryPolicy::default());
/// let report = coordinator.execute(&plan).await?;
/// ```
pub struct ExecutionCoordinator {
    registry: Arc<CapabilityRegistry>,
    arbiter: Arc<ArbitrationEngine>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
    retry: RetryPolicy,
    event_tx: Option<mpsc::Sender<CoordinatorEvent>>,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        arbiter: Arc<ArbitrationEngine>,
        health: Arc<HealthMonitor>,
        metrics: Arc<MetricsCollector>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            arbiter,
            health,
            metrics,
            retry,
            event_tx: None,
        }
    }

    /// Emit step lifecycle events on `event_tx`.
    pub fn with_events(mut self, event_tx: mpsc::Sender<CoordinatorEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `plan` to completion.
    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<PlanReport> {
        self.execute_with_cancellation(plan, CancellationToken::new())
            .await
    }

    /// Run `plan`, stopping when `cancel` fires.
    ///
    /// Cancellation drops in-flight worker calls and fails every step not
    /// yet dispatched with cause `cancelled`. Succeeded steps are kept.
    ///
    /// # Errors
    /// `PlanFailed` carrying every step's outcome if any step failed.
    pub async fn execute_with_cancellation(
        &self,
        plan: &ExecutionPlan,
        cancel: CancellationToken,
    ) -> Result<PlanReport> {
        let started = Instant::now();
        let deadline = plan.task.deadline.map(|at| {
            let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            started + remaining
        });
        info!(
            task = %plan.task.id.short(),
            strategy = %plan.strategy,
            groups = plan.groups.len(),
            "executing plan"
        );

        let mut done: HashMap<TaskId, StepOutcome> = HashMap::new();
        let mut order: Vec<TaskId> = Vec::new();
        for group in &plan.groups {
            let finished = join_all(
                group
                    .steps
                    .iter()
                    .map(|step| self.run_step(plan, step, &done, &cancel, deadline)),
            )
            .await;
            for outcome in finished {
                order.push(outcome.task_id);
                done.insert(outcome.task_id, outcome);
            }
        }

        let outcomes: Vec<StepOutcome> = order.iter().filter_map(|id| done.remove(id)).collect();
        let final_output = match plan.strategy {
            Strategy::Parallel => None,
            _ => outcomes
                .last()
                .filter(|o| o.succeeded())
                .and_then(|o| o.output.clone()),
        };
        let report = PlanReport {
            task_id: plan.task.id,
            strategy: plan.strategy,
            outcomes,
            final_output,
            elapsed: started.elapsed(),
        };

        let succeeded = report.succeeded();
        self.emit(CoordinatorEvent::PlanFinished {
            task_id: plan.task.id,
            succeeded,
        });
        if succeeded {
            info!(task = %plan.task.id.short(), elapsed = ?report.elapsed, "plan succeeded");
            Ok(report)
        } else {
            warn!(task = %plan.task.id.short(), failures = %report.failure_summary(), "plan failed");
            Err(Error::PlanFailed {
                report: Box::new(report),
            })
        }
    }

    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        step: &PlanStep,
        done: &HashMap<TaskId, StepOutcome>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> StepOutcome {
        let started = Instant::now();
        let mut run = StepRun {
            step,
            state: StepState::new(),
            inputs: Vec::new(),
            attempts: 0,
            tried: Vec::new(),
        };

        // Undispatched steps take the plan's stop cause, not their dependency's.
        let stopped = if cancel.is_cancelled() {
            Some(FailureCause::Cancelled)
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            Some(FailureCause::DeadlineExceeded)
        } else {
            None
        };
        if let Some(cause) = stopped {
            debug!(step = %step.name, cause = %cause, "step not dispatched");
            self.fail(&mut run, &step.worker_id, cause);
            return self.outcome(run, &step.worker_id, None, started);
        }

        for dep in &step.depends_on {
            match done.get(dep) {
                Some(outcome) if outcome.succeeded() => run.inputs.push(StepInput {
                    from: *dep,
                    worker_id: outcome.worker_id.clone(),
                    output: outcome.output.clone().unwrap_or_default(),
                }),
                _ => {
                    debug!(step = %step.name, dependency = %dep.short(), "dependency did not succeed");
                    self.fail(&mut run, &step.worker_id, FailureCause::DependencyFailed(*dep));
                    return self.outcome(run, &step.worker_id, None, started);
                }
            }
        }

        let mut worker = step.worker_id.clone();
        loop {
            run.tried.push(worker.clone());
            match self.run_on_worker(plan, &mut run, &worker, cancel, deadline).await {
                WorkerRun::Succeeded(output) => {
                    return self.outcome(run, &worker, Some(output), started);
                }
                WorkerRun::Stopped(cause) => {
                    self.fail(&mut run, &worker, cause);
                    return self.outcome(run, &worker, None, started);
                }
                WorkerRun::GaveUp { reason } => {
                    match self.arbiter.backup_for(&step.worker_id, &step.required, &run.tried) {
                        Some(backup) => {
                            info!(step = %step.name, from = %worker, to = %backup, reason = %reason, "redistributing step");
                            self.emit(CoordinatorEvent::StepRedistributed {
                                step: step.task_id,
                                from: worker.clone(),
                                to: backup.clone(),
                            });
                            worker = backup;
                        }
                        None => {
                            // Keep the last worker error or timeout if there was one.
                            if !matches!(
                                run.state.status(),
                                StepStatus::Failed { .. } | StepStatus::TimedOut
                            ) {
                                self.fail(&mut run, &worker, FailureCause::NoViableWorker(reason));
                            }
                            return self.outcome(run, &worker, None, started);
                        }
                    }
                }
            }
        }
    }

    /// Up to `max_attempts` dispatches of the step on one worker.
    async fn run_on_worker(
        &self,
        plan: &ExecutionPlan,
        run: &mut StepRun<'_>,
        worker: &WorkerId,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> WorkerRun {
        let step = run.step;
        let mut last_failure = String::new();

        for attempt in 1..=self.retry.max_attempts {
            if cancel.is_cancelled() {
                return WorkerRun::Stopped(FailureCause::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return WorkerRun::Stopped(FailureCause::DeadlineExceeded);
            }
            if !self.health.is_selectable(worker).unwrap_or(false) {
                return WorkerRun::GaveUp {
                    reason: format!("circuit of {} is not accepting work", worker),
                };
            }
            let lease = match LoadLease::acquire(&self.registry, worker) {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    return WorkerRun::GaveUp {
                        reason: format!("{} has no free capacity", worker),
                    }
                }
                Err(e) => return WorkerRun::GaveUp { reason: e.to_string() },
            };
            let Some(executor) = self.registry.executor(worker) else {
                return WorkerRun::GaveUp {
                    reason: format!("{} was deregistered", worker),
                };
            };

            self.begin_dispatch(&mut run.state);
            run.attempts += 1;
            self.emit(CoordinatorEvent::StepDispatched {
                step: step.task_id,
                worker_id: worker.clone(),
                attempt,
            });
            debug!(step = %step.name, worker = %worker, attempt, "dispatching step");
            self.transition(&mut run.state, StepStatus::Running);
            self.metrics.record_start(worker, step.task_id);

            let request = StepRequest {
                step_id: step.task_id,
                name: step.name.clone(),
                description: step.description.clone(),
                role: step.role,
                required: step.required.clone(),
                inputs: run.inputs.clone(),
                attempt,
                timeout: step.timeout,
                priority: plan.task.priority,
            };
            let dispatched = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Attempt::Cancelled,
                r = tokio::time::timeout(step.timeout, executor.execute(request)) => match r {
                    Ok(Ok(output)) => Attempt::Completed(output),
                    Ok(Err(e)) => Attempt::Errored(e.to_string()),
                    Err(_) => Attempt::TimedOut,
                },
            };
            lease.release();
            let elapsed = dispatched.elapsed();

            match result {
                Attempt::Completed(output) => {
                    self.report(worker, step.task_id, true, elapsed);
                    self.transition(&mut run.state, StepStatus::Succeeded);
                    self.emit(CoordinatorEvent::StepSucceeded {
                        step: step.task_id,
                        worker_id: worker.clone(),
                    });
                    debug!(step = %step.name, worker = %worker, ?elapsed, "step succeeded");
                    return WorkerRun::Succeeded(output);
                }
                Attempt::Cancelled => {
                    self.metrics.record_abandoned(worker, step.task_id);
                    return WorkerRun::Stopped(FailureCause::Cancelled);
                }
                Attempt::Errored(message) => {
                    self.report(worker, step.task_id, false, elapsed);
                    warn!(step = %step.name, worker = %worker, attempt, error = %message, "step failed");
                    self.transition(
                        &mut run.state,
                        StepStatus::Failed {
                            cause: FailureCause::Worker(message.clone()),
                        },
                    );
                    last_failure = message;
                }
                Attempt::TimedOut => {
                    self.report(worker, step.task_id, false, elapsed);
                    warn!(step = %step.name, worker = %worker, attempt, timeout = ?step.timeout, "step timed out");
                    self.transition(&mut run.state, StepStatus::TimedOut);
                    last_failure = format!("timed out after {:?}", step.timeout);
                }
            }
            self.emit(CoordinatorEvent::StepFailed {
                step: step.task_id,
                worker_id: worker.clone(),
                cause: last_failure.clone(),
            });

            if attempt == self.retry.max_attempts {
                break;
            }
            if self.health.circuit_state(worker).ok() == Some(CircuitState::Open) {
                return WorkerRun::GaveUp {
                    reason: format!("circuit of {} opened", worker),
                };
            }
            let delay = self.retry.delay_for(attempt);
            self.transition(&mut run.state, StepStatus::Retrying);
            self.emit(CoordinatorEvent::StepRetrying {
                step: step.task_id,
                worker_id: worker.clone(),
                attempt: attempt + 1,
                delay,
            });
            debug!(step = %step.name, worker = %worker, ?delay, "backing off before retry");
            tokio::select! {
                _ = cancel.cancelled() => return WorkerRun::Stopped(FailureCause::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        WorkerRun::GaveUp {
            reason: format!("{} exhausted {} attempts: {}", worker, self.retry.max_attempts, last_failure),
        }
    }

    fn begin_dispatch(&self, state: &mut StepState) {
        if matches!(state.status(), StepStatus::Failed { .. } | StepStatus::TimedOut) {
            self.transition(state, StepStatus::Retrying);
        }
        self.transition(state, StepStatus::Dispatched);
    }

    /// Move the step to a terminal failure with `cause`.
    fn fail(&self, run: &mut StepRun<'_>, worker: &WorkerId, cause: FailureCause) {
        let failed_with = match run.state.status() {
            StepStatus::Failed { cause: current } => Some(*current == cause),
            _ => None,
        };
        match failed_with {
            Some(true) => return,
            Some(false) => self.transition(&mut run.state, StepStatus::Retrying),
            None => {}
        }
        let message = cause.to_string();
        self.transition(&mut run.state, StepStatus::Failed { cause });
        self.emit(CoordinatorEvent::StepFailed {
            step: run.step.task_id,
            worker_id: worker.clone(),
            cause: message,
        });
    }

    fn transition(&self, state: &mut StepState, target: StepStatus) {
        if let Err(e) = state.transition(target) {
            warn!(error = %e, "step state transition rejected");
        }
    }

    fn outcome(
        &self,
        mut run: StepRun<'_>,
        worker: &WorkerId,
        output: Option<String>,
        started: Instant,
    ) -> StepOutcome {
        if *run.state.status() == StepStatus::TimedOut {
            let timeout = run.step.timeout;
            self.transition(
                &mut run.state,
                StepStatus::Failed {
                    cause: FailureCause::TimedOut(timeout),
                },
            );
        }
        StepOutcome {
            task_id: run.step.task_id,
            name: run.step.name.clone(),
            worker_id: worker.clone(),
            status: run.state.status().clone(),
            attempts: run.attempts,
            workers_tried: run.tried,
            output,
            duration: started.elapsed(),
        }
    }

    /// Record an attempt's end in metrics and health, exactly once.
    fn report(&self, worker: &WorkerId, step: TaskId, success: bool, elapsed: Duration) {
        let counted = self.metrics.record_end(worker, step, success, elapsed);
        if counted && !self.metrics.forwards_to_health() {
            if let Err(e) = self.health.record_outcome(worker, success) {
                debug!(worker = %worker, error = %e, "outcome not recorded");
            }
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "coordinator event dropped");
            }
        }
    }
}
