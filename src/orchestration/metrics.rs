//! Per-worker execution metrics.
//!
//! Series are append-only counters keyed by worker. Consumers only ever
//! get `MetricsSnapshot` copies.

use crate::core::task::TaskId;
use crate::core::worker::WorkerId;
use crate::orchestration::health::HealthMonitor;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Ended executions remembered per worker for duplicate-end detection.
pub const CLOSED_RETENTION: usize = 1024;

#[derive(Debug, Default)]
struct WorkerSeries {
    completed: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
    in_flight: HashMap<TaskId, Instant>,
    /// Executions already ended since their last start, with their close sequence.
    closed: HashMap<TaskId, u64>,
    /// Close order, oldest first. Entries whose sequence no longer matches
    /// `closed` were reopened and are skipped on eviction.
    closed_order: VecDeque<(TaskId, u64)>,
    closed_seq: u64,
}

impl WorkerSeries {
    fn close(&mut self, task_id: TaskId) {
        self.closed_seq += 1;
        self.closed.insert(task_id, self.closed_seq);
        self.closed_order.push_back((task_id, self.closed_seq));
        while self.closed.len() > CLOSED_RETENTION {
            let Some((oldest, seq)) = self.closed_order.pop_front() else {
                break;
            };
            if self.closed.get(&oldest) == Some(&seq) {
                self.closed.remove(&oldest);
            }
        }
        // Reopened executions leave stale entries behind.
        if self.closed_order.len() > CLOSED_RETENTION * 2 {
            let closed = &self.closed;
            self.closed_order
                .retain(|(id, seq)| closed.get(id) == Some(seq));
        }
    }
}

/// Point-in-time copy of one worker's series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub worker_id: WorkerId,
    pub tasks_completed: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_duration: Duration,
    pub success_rate: f64,
    pub error_rate: f64,
    pub in_flight: usize,
}

impl MetricsSnapshot {
    fn empty(worker_id: &WorkerId) -> Self {
        Self {
            worker_id: worker_id.clone(),
            tasks_completed: 0,
            successes: 0,
            failures: 0,
            avg_duration: Duration::ZERO,
            success_rate: 0.0,
            error_rate: 0.0,
            in_flight: 0,
        }
    }
}

/// Collects start/end records per worker.
///
/// When a `HealthMonitor` is attached, every counted `record_end` is also
/// reported to it, so a run of failed ends opens the worker's circuit.
#[derive(Default)]
pub struct MetricsCollector {
    series: DashMap<WorkerId, WorkerSeries>,
    health: Option<Arc<HealthMonitor>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward counted outcomes to `health`.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn forwards_to_health(&self) -> bool {
        self.health.is_some()
    }

    /// Mark the start of an execution of `task_id` on `worker_id`.
    pub fn record_start(&self, worker_id: &WorkerId, task_id: TaskId) {
        let mut series = self.series.entry(worker_id.clone()).or_default();
        series.closed.remove(&task_id);
        series.in_flight.insert(task_id, Instant::now());
    }

    /// Record the end of an execution.
    ///
    /// Returns false, counting nothing, if this execution was already ended.
    pub fn record_end(
        &self,
        worker_id: &WorkerId,
        task_id: TaskId,
        success: bool,
        duration: Duration,
    ) -> bool {
        {
            let mut series = self.series.entry(worker_id.clone()).or_default();
            let started = series.in_flight.remove(&task_id).is_some();
            if !started && series.closed.contains_key(&task_id) {
                debug!(worker = %worker_id, task = %task_id.short(), "duplicate end ignored");
                return false;
            }
            series.close(task_id);
            series.completed += 1;
            if success {
                series.successes += 1;
            } else {
                series.failures += 1;
            }
            series.total_duration += duration;
        }

        if let Some(health) = &self.health {
            if let Err(e) = health.record_outcome(worker_id, success) {
                warn!(worker = %worker_id, error = %e, "could not report outcome to health monitor");
            }
        }
        true
    }

    /// Drop an in-flight execution without counting it, e.g. on cancellation.
    pub fn record_abandoned(&self, worker_id: &WorkerId, task_id: TaskId) {
        if let Some(mut series) = self.series.get_mut(worker_id) {
            series.in_flight.remove(&task_id);
        }
    }

    pub fn snapshot(&self, worker_id: &WorkerId) -> MetricsSnapshot {
        let Some(series) = self.series.get(worker_id) else {
            return MetricsSnapshot::empty(worker_id);
        };
        let (success_rate, error_rate, avg_duration) = if series.completed == 0 {
            (0.0, 0.0, Duration::ZERO)
        } else {
            let n = series.completed as f64;
            (
                series.successes as f64 / n,
                series.failures as f64 / n,
                series.total_duration.div_f64(n),
            )
        };
        MetricsSnapshot {
            worker_id: worker_id.clone(),
            tasks_completed: series.completed,
            successes: series.successes,
            failures: series.failures,
            avg_duration,
            success_rate,
            error_rate,
            in_flight: series.in_flight.len(),
        }
    }
}
