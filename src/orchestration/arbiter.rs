//! Arbitration: turning a task into an execution plan.
//!
//! The `ArbitrationEngine` scores workers against a task's required
//! competencies, ranks the survivors, picks a strategy from the task's
//! shape, and lays out plan steps with their dependency edges.
//!
//! Ranking order is fixed: match score descending, then current load
//! ascending, then worker id ascending. With the load-aware tie-break
//! enabled, observed success rate and mean duration are consulted between
//! load and id.

use crate::core::plan::{ExecutionPlan, PlanStep, StepRole, Strategy};
use crate::core::task::{competency_names, Requirement, SubTask, Task, TaskId};
use crate::core::worker::{Worker, WorkerId, WorkerStatus};
use crate::error::{Error, Result};
use crate::orchestration::health::HealthMonitor;
use crate::orchestration::metrics::MetricsCollector;
use crate::orchestration::registry::{CapabilityRegistry, DEFAULT_MIN_MATCH_SCORE};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default per-step timeout when neither task nor subtask sets one.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Configuration for arbitration.
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// Minimum match score for a worker to be a candidate.
    pub min_match_score: f64,
    /// Break load ties with observed success rate and duration.
    pub load_aware_tie_break: bool,
    pub default_step_timeout: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            min_match_score: DEFAULT_MIN_MATCH_SCORE,
            load_aware_tie_break: false,
            default_step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
        }
    }
}

/// A worker that survived matching and filtering, with its ranking inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub worker_id: WorkerId,
    pub match_score: f64,
    pub current_load: u32,
    pub max_concurrent: u32,
}

/// Chooses workers and builds plans.
pub struct ArbitrationEngine {
    registry: Arc<CapabilityRegistry>,
    health: Arc<HealthMonitor>,
    metrics: Option<Arc<MetricsCollector>>,
    config: ArbiterConfig,
}

/// Per-arbitration view of the registry plus the load this plan has
/// already promised to concurrently running steps.
struct Pool {
    workers: Vec<Worker>,
    planned: HashMap<WorkerId, u32>,
    /// Steps of this plan assigned to each worker, in assignment order.
    holders: HashMap<WorkerId, Vec<TaskId>>,
}

impl Pool {
    fn reserve(&mut self, id: &WorkerId, step: TaskId) {
        *self.planned.entry(id.clone()).or_insert(0) += 1;
        self.holders.entry(id.clone()).or_default().push(step);
    }

    fn last_holder(&self, id: &WorkerId) -> Option<TaskId> {
        self.holders.get(id).and_then(|steps| steps.last().copied())
    }

    fn free_slots(&self, candidate: &Candidate) -> u32 {
        let planned = self.planned.get(&candidate.worker_id).copied().unwrap_or(0);
        candidate
            .max_concurrent
            .saturating_sub(candidate.current_load)
            .saturating_sub(planned)
    }
}

impl ArbitrationEngine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        health: Arc<HealthMonitor>,
        config: ArbiterConfig,
    ) -> Self {
        Self {
            registry,
            health,
            metrics: None,
            config,
        }
    }

    /// Use `metrics` for the load-aware tie-break.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// Ranked candidates for a requirement set, from a fresh registry snapshot.
    pub fn rank(&self, required: &[Requirement]) -> Vec<Candidate> {
        self.health.refresh();
        let workers = self.registry.snapshot();
        self.candidates(&workers, required)
    }

    /// Match, filter, and rank `workers` against `required`.
    fn candidates(&self, workers: &[Worker], required: &[Requirement]) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = workers
            .iter()
            .filter(|w| self.is_candidate(w))
            .filter_map(|w| {
                let score = w.match_score(required);
                (score >= self.config.min_match_score).then(|| Candidate {
                    worker_id: w.id.clone(),
                    match_score: score,
                    current_load: w.current_load,
                    max_concurrent: w.max_concurrent,
                })
            })
            .collect();
        candidates.sort_by(|a, b| self.compare(a, b));
        debug!(
            competencies = ?competency_names(required),
            candidates = ?candidates.iter().map(|c| (c.worker_id.as_str(), c.match_score)).collect::<Vec<_>>(),
            "ranked candidates"
        );
        candidates
    }

    /// Availability, circuit, and capacity filters.
    fn is_candidate(&self, worker: &Worker) -> bool {
        worker.status != WorkerStatus::Unavailable && self.health.admits(worker) && worker.has_capacity()
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        b.match_score
            .total_cmp(&a.match_score)
            .then(a.current_load.cmp(&b.current_load))
            .then_with(|| self.observed_order(a, b))
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    }

    fn observed_order(&self, a: &Candidate, b: &Candidate) -> Ordering {
        let Some(metrics) = self.metrics.as_ref().filter(|_| self.config.load_aware_tie_break) else {
            return Ordering::Equal;
        };
        let sa = metrics.snapshot(&a.worker_id);
        let sb = metrics.snapshot(&b.worker_id);
        sb.success_rate
            .total_cmp(&sa.success_rate)
            .then(sa.avg_duration.cmp(&sb.avg_duration))
    }

    /// Whether `worker_id` could take a step needing `required` right now.
    pub fn is_eligible(&self, worker_id: &WorkerId, required: &[Requirement]) -> bool {
        // Moves an expired open circuit to half-open before checking.
        if !self.health.is_selectable(worker_id).unwrap_or(false) {
            return false;
        }
        self.registry.get(worker_id).is_some_and(|w| {
            w.status != WorkerStatus::Unavailable
                && w.has_capacity()
                && w.match_score(required) >= self.config.min_match_score
        })
    }

    /// First backup of `primary`, in order, that could take the step and
    /// has not been tried yet.
    pub fn backup_for(
        &self,
        primary: &WorkerId,
        required: &[Requirement],
        tried: &[WorkerId],
    ) -> Option<WorkerId> {
        let backups = self.registry.get(primary)?.backups;
        backups
            .into_iter()
            .filter(|b| !tried.contains(b))
            .find(|b| self.is_eligible(b, required))
    }

    /// Strategy implied by the task's shape.
    pub fn select_strategy(task: &Task) -> Strategy {
        let subtasks = &task.subtasks;
        if task.supervisor.is_some() {
            return Strategy::Hierarchical;
        }
        if subtasks.len() < 2 {
            return Strategy::Sequential;
        }
        let chained = subtasks
            .windows(2)
            .all(|pair| pair[1].consumes == Some(pair[0].id));
        if chained {
            return Strategy::Pipeline;
        }
        let independent = subtasks.iter().all(|s| s.consumes.is_none())
            && subtasks
                .iter()
                .enumerate()
                .all(|(i, a)| subtasks[i + 1..].iter().all(|b| !a.overlaps(b)));
        if independent {
            return Strategy::Parallel;
        }
        Strategy::Sequential
    }

    /// Build an execution plan for `task`.
    ///
    /// # Errors
    /// `Validation` for malformed tasks; `NoEligibleWorker` naming the
    /// competencies no available worker can cover.
    pub fn arbitrate(&self, task: &Task) -> Result<ExecutionPlan> {
        task.validate()?;
        self.health.refresh();
        let mut pool = Pool {
            workers: self.registry.snapshot(),
            planned: HashMap::new(),
            holders: HashMap::new(),
        };

        let (strategy, steps) = if task.subtasks.is_empty() {
            self.plan_single(task, &mut pool)?
        } else {
            let strategy = Self::select_strategy(task);
            (strategy, self.plan_subtasks(task, strategy, &mut pool)?)
        };

        let plan = ExecutionPlan::build(task.clone(), strategy, steps)?;
        info!(
            task = %task.id.short(),
            strategy = %plan.strategy,
            steps = plan.step_count(),
            workers = ?plan.workers().iter().map(WorkerId::as_str).collect::<Vec<_>>(),
            "plan built"
        );
        Ok(plan)
    }

    /// A task without subtasks: one worker if one covers everything,
    /// otherwise a lead plus one subordinate per remaining competency.
    fn plan_single(&self, task: &Task, pool: &mut Pool) -> Result<(Strategy, Vec<PlanStep>)> {
        let candidates = self.candidates(&pool.workers, &task.required);
        let min = self.config.min_match_score;
        let single = candidates.iter().find(|c| {
            task.required.len() == 1
                || pool
                    .workers
                    .iter()
                    .any(|w| w.id == c.worker_id && w.satisfies_each(&task.required, min))
        });
        if let Some(best) = single {
            let step = self.step(
                task.id,
                &step_name(&task.required),
                &task.description,
                best,
                task.required.clone(),
                Vec::new(),
                StepRole::Solo,
                self.timeout_for(task, None),
            );
            return Ok((Strategy::Sequential, vec![step]));
        }
        if task.required.len() == 1 {
            return Err(Error::NoEligibleWorker {
                unmet: competency_names(&task.required),
            });
        }
        debug!(task = %task.id.short(), "no single worker covers every competency, decomposing");
        self.decompose(task, pool).map(|steps| (Strategy::Hierarchical, steps))
    }

    fn decompose(&self, task: &Task, pool: &mut Pool) -> Result<Vec<PlanStep>> {
        let lead_index = task
            .required
            .iter()
            .enumerate()
            .fold(0, |best, (i, r)| if r.weight > task.required[best].weight { i } else { best });
        let timeout = self.timeout_for(task, None);

        let mut unmet = Vec::new();
        let mut subordinates = Vec::new();
        for (i, req) in task.required.iter().enumerate() {
            if i == lead_index {
                continue;
            }
            let required = vec![req.clone()];
            let id = TaskId::new();
            match self.pick(&required, pool, Some(id)) {
                Some(Pick { candidate, after }) => subordinates.push(
                    self.step(
                        id,
                        &req.competency,
                        &task.description,
                        &candidate,
                        required,
                        Vec::new(),
                        StepRole::Subordinate,
                        timeout,
                    )
                    .ordered_after(after),
                ),
                None => unmet.push(req.competency.clone()),
            }
        }

        let lead_req = vec![task.required[lead_index].clone()];
        let lead_name = lead_req[0].competency.clone();
        let lead = self.pick(&lead_req, pool, None);
        if lead.is_none() {
            unmet.insert(0, lead_name.clone());
        }
        let Some(Pick { candidate: lead, .. }) = lead.filter(|_| unmet.is_empty()) else {
            return Err(Error::NoEligibleWorker { unmet });
        };

        let depends_on = subordinates.iter().map(|s| s.task_id).collect();
        let mut steps = subordinates;
        steps.push(self.step(
            TaskId::new(),
            &lead_name,
            &task.description,
            &lead,
            lead_req,
            depends_on,
            StepRole::Lead,
            timeout,
        ));
        Ok(steps)
    }

    fn plan_subtasks(&self, task: &Task, strategy: Strategy, pool: &mut Pool) -> Result<Vec<PlanStep>> {
        let concurrent = matches!(strategy, Strategy::Parallel | Strategy::Hierarchical);
        let role = if strategy == Strategy::Hierarchical {
            StepRole::Subordinate
        } else {
            StepRole::Stage
        };

        let mut unmet: Vec<String> = Vec::new();
        let mut steps: Vec<PlanStep> = Vec::new();
        for (i, sub) in task.subtasks.iter().enumerate() {
            let slot = concurrent.then_some(sub.id);
            let Some(Pick { candidate, after }) = self.pick(&sub.required, pool, slot) else {
                for name in competency_names(&sub.required) {
                    if !unmet.contains(&name) {
                        unmet.push(name);
                    }
                }
                continue;
            };
            let depends_on = Self::edges_for(strategy, task, i, sub);
            steps.push(self.step(
                sub.id,
                &sub.name,
                &sub.description,
                &candidate,
                sub.required.clone(),
                depends_on,
                role,
                self.timeout_for(task, Some(sub)),
            )
            .ordered_after(after));
        }

        if let Some(supervisor) = &task.supervisor {
            match self.pick(supervisor, pool, None) {
                Some(Pick { candidate: lead, .. }) if unmet.is_empty() => {
                    let depends_on = steps.iter().map(|s| s.task_id).collect();
                    steps.push(self.step(
                        TaskId::new(),
                        "lead",
                        &task.description,
                        &lead,
                        supervisor.clone(),
                        depends_on,
                        StepRole::Lead,
                        self.timeout_for(task, None),
                    ));
                }
                Some(_) => {}
                None => unmet.extend(competency_names(supervisor)),
            }
        }

        if !unmet.is_empty() {
            return Err(Error::NoEligibleWorker { unmet });
        }
        Ok(steps)
    }

    fn edges_for(strategy: Strategy, task: &Task, index: usize, sub: &SubTask) -> Vec<TaskId> {
        let previous = index.checked_sub(1).map(|p| task.subtasks[p].id);
        match strategy {
            Strategy::Sequential | Strategy::Pipeline => {
                let mut edges: Vec<TaskId> = previous.into_iter().collect();
                if let Some(producer) = sub.consumes.filter(|p| !edges.contains(p)) {
                    edges.push(producer);
                }
                edges
            }
            Strategy::Parallel | Strategy::Hierarchical => sub.consumes.into_iter().collect(),
        }
    }

    /// Top candidate for `required`.
    ///
    /// `concurrent` carries the id of a step that will run alongside others.
    /// Such a step prefers workers with capacity left after this plan's own
    /// reservations; if none has any, it goes to the top candidate and is
    /// ordered after that worker's previous step in the plan.
    fn pick(&self, required: &[Requirement], pool: &mut Pool, concurrent: Option<TaskId>) -> Option<Pick> {
        let candidates = self.candidates(&pool.workers, required);
        let Some(step) = concurrent else {
            return candidates.into_iter().next().map(|candidate| Pick {
                candidate,
                after: None,
            });
        };
        let pick = match candidates.iter().find(|c| pool.free_slots(c) > 0) {
            Some(free) => Pick {
                candidate: free.clone(),
                after: None,
            },
            None => {
                let candidate = candidates.first()?.clone();
                let after = pool.last_holder(&candidate.worker_id);
                debug!(worker = %candidate.worker_id, "worker saturated by this plan, serialising step");
                Pick { candidate, after }
            }
        };
        pool.reserve(&pick.candidate.worker_id, step);
        Some(pick)
    }

    fn timeout_for(&self, task: &Task, sub: Option<&SubTask>) -> Duration {
        sub.and_then(|s| s.timeout)
            .or(task.step_timeout)
            .unwrap_or(self.config.default_step_timeout)
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        task_id: TaskId,
        name: &str,
        description: &str,
        candidate: &Candidate,
        required: Vec<Requirement>,
        depends_on: Vec<TaskId>,
        role: StepRole,
        timeout: Duration,
    ) -> PlanStep {
        PlanStep {
            task_id,
            name: name.to_string(),
            description: description.to_string(),
            worker_id: candidate.worker_id.clone(),
            required,
            depends_on,
            after: Vec::new(),
            role,
            timeout,
            match_score: candidate.match_score,
        }
    }
}

/// A chosen worker and, when it is saturated, the step to wait for.
struct Pick {
    candidate: Candidate,
    after: Option<TaskId>,
}

fn step_name(required: &[Requirement]) -> String {
    competency_names(required).join("+")
}
