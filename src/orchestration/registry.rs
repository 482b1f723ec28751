//! Capability registry for worker descriptors.
//!
//! The `CapabilityRegistry` is the single ownership boundary for worker
//! records. Every mutation runs under the exclusive slot of that worker's
//! id, so concurrent requests never observe a partially-applied load
//! change. Reads return cloned snapshots and may be momentarily stale;
//! capacity is re-checked at dispatch time through `try_acquire`.

use crate::core::task::Requirement;
use crate::core::worker::{
    validate_competencies, Circuit, Worker, WorkerDescriptor, WorkerId, WorkerStatus,
};
use crate::error::{Error, Result};
use crate::orchestration::executor::WorkerExecutor;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default minimum match score for a worker to count as a candidate.
pub const DEFAULT_MIN_MATCH_SCORE: f64 = 0.5;

struct Slot {
    worker: Worker,
    executor: Arc<dyn WorkerExecutor>,
}

/// Registry of workers, their competencies, load, and health state.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use futures::FutureExt;
/// use swarm_router::core::WorkerDescriptor;
/// use swarm_router::orchestration::{CapabilityRegistry, FnExecutor};
///
/// let registry = CapabilityRegistry::default();
/// let executor = Arc::new(FnExecutor::new(|_| async { Ok(String::new()) }.boxed()));
/// registry
///     .register(WorkerDescriptor::new("tester").with_competency("testing", 0.9), executor)
///     .unwrap();
/// assert_eq!(registry.len(), 1);
/// ```
pub struct CapabilityRegistry {
    slots: DashMap<WorkerId, Slot>,
    min_match_score: f64,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_MATCH_SCORE)
    }
}

impl CapabilityRegistry {
    pub fn new(min_match_score: f64) -> Self {
        Self {
            slots: DashMap::new(),
            min_match_score,
        }
    }

    pub fn min_match_score(&self) -> f64 {
        self.min_match_score
    }

    /// Add a worker.
    ///
    /// # Errors
    /// Returns `DuplicateWorker` if the id is taken, or a validation error
    /// for a malformed descriptor.
    pub fn register(
        &self,
        descriptor: WorkerDescriptor,
        executor: Arc<dyn WorkerExecutor>,
    ) -> Result<()> {
        descriptor.validate()?;
        match self.slots.entry(descriptor.id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateWorker(descriptor.id)),
            Entry::Vacant(vacant) => {
                info!(
                    worker = %descriptor.id,
                    competencies = ?descriptor.competencies,
                    max_concurrent = descriptor.max_concurrent,
                    "registered worker"
                );
                vacant.insert(Slot {
                    worker: Worker::from_descriptor(descriptor),
                    executor,
                });
                Ok(())
            }
        }
    }

    /// Remove a worker, returning its last record.
    pub fn deregister(&self, id: &WorkerId) -> Result<Worker> {
        let (_, slot) = self
            .slots
            .remove(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))?;
        if slot.worker.current_load > 0 {
            warn!(worker = %id, load = slot.worker.current_load, "deregistered worker with tasks in flight");
        } else {
            info!(worker = %id, "deregistered worker");
        }
        Ok(slot.worker)
    }

    /// Replace a worker's static competency vector.
    pub fn update_competencies(&self, id: &WorkerId, competencies: BTreeMap<String, f64>) -> Result<()> {
        validate_competencies(id, &competencies)?;
        self.with_worker_mut(id, |worker| {
            worker.competencies = competencies;
        })
    }

    /// Replace a worker's ordered backup list.
    pub fn set_backups(&self, id: &WorkerId, backups: Vec<WorkerId>) -> Result<()> {
        if backups.contains(id) {
            return Err(Error::Validation(format!("worker {} lists itself as a backup", id)));
        }
        self.with_worker_mut(id, |worker| {
            worker.backups = backups;
        })
    }

    /// Every available worker whose match score meets the minimum threshold.
    ///
    /// Unsorted; ranking is arbitration's job.
    pub fn find(&self, required: &[Requirement]) -> Vec<Worker> {
        self.slots
            .iter()
            .filter(|slot| slot.worker.status != WorkerStatus::Unavailable)
            .filter(|slot| slot.worker.match_score(required) >= self.min_match_score)
            .map(|slot| slot.worker.clone())
            .collect()
    }

    /// Apply a signed change to a worker's load.
    ///
    /// Returns the new load. Fails without changing anything if the result
    /// would be negative or exceed `max_concurrent`.
    pub fn update_load(&self, id: &WorkerId, delta: i64) -> Result<u32> {
        let mut slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))?;
        let worker = &mut slot.worker;
        let next = i64::from(worker.current_load) + delta;
        if next < 0 {
            return Err(Error::Validation(format!(
                "load of {} cannot drop below zero",
                id
            )));
        }
        if next > i64::from(worker.max_concurrent) {
            return Err(Error::CapacityExceeded {
                id: id.clone(),
                max: worker.max_concurrent,
            });
        }
        worker.current_load = next as u32;
        worker.refresh_status();
        debug!(worker = %id, load = worker.current_load, "load updated");
        Ok(worker.current_load)
    }

    /// Take one unit of capacity if the worker has any and its circuit admits it.
    ///
    /// Check and increment happen under the same exclusive slot, so a
    /// half-open worker never takes two trial dispatches.
    pub fn try_acquire(&self, id: &WorkerId) -> Result<bool> {
        let mut slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))?;
        let worker = &mut slot.worker;
        if worker.status == WorkerStatus::Unavailable
            || !worker.has_capacity()
            || !worker.circuit.admits(worker.current_load)
        {
            return Ok(false);
        }
        worker.current_load += 1;
        worker.refresh_status();
        Ok(true)
    }

    /// Return one unit of capacity. Returns the new load.
    pub fn release(&self, id: &WorkerId) -> Result<u32> {
        let mut slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))?;
        let worker = &mut slot.worker;
        if worker.current_load == 0 {
            warn!(worker = %id, "release on idle worker ignored");
        }
        worker.current_load = worker.current_load.saturating_sub(1);
        worker.refresh_status();
        Ok(worker.current_load)
    }

    /// Set a worker's status.
    ///
    /// Leaving `Unavailable` re-derives the status from the current load.
    pub fn set_status(&self, id: &WorkerId, status: WorkerStatus) -> Result<()> {
        self.with_worker_mut(id, |worker| {
            let was_unavailable = worker.status == WorkerStatus::Unavailable;
            worker.status = status;
            if was_unavailable && status != WorkerStatus::Unavailable {
                worker.refresh_status();
            }
            debug!(worker = %id, status = %worker.status, "status updated");
        })
    }

    /// Apply a circuit transition under the worker's exclusive slot.
    pub(crate) fn update_circuit<R>(
        &self,
        id: &WorkerId,
        f: impl FnOnce(&mut Circuit, u32) -> R,
    ) -> Result<R> {
        let mut slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))?;
        let load = slot.worker.current_load;
        Ok(f(&mut slot.worker.circuit, load))
    }

    fn with_worker_mut<R>(&self, id: &WorkerId, f: impl FnOnce(&mut Worker) -> R) -> Result<R> {
        let mut slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))?;
        Ok(f(&mut slot.worker))
    }

    pub fn get(&self, id: &WorkerId) -> Option<Worker> {
        self.slots.get(id).map(|slot| slot.worker.clone())
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn executor(&self, id: &WorkerId) -> Option<Arc<dyn WorkerExecutor>> {
        self.slots.get(id).map(|slot| Arc::clone(&slot.executor))
    }

    /// Copies of every worker, ordered by id.
    pub fn snapshot(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.slots.iter().map(|slot| slot.worker.clone()).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One unit of a worker's capacity held for a dispatched step.
///
/// Released exactly once: explicitly through `release`, or on drop.
pub struct LoadLease {
    registry: Arc<CapabilityRegistry>,
    worker_id: WorkerId,
    released: AtomicBool,
}

impl LoadLease {
    /// Acquire capacity on `worker_id`, or `None` if it has none left.
    pub fn acquire(registry: &Arc<CapabilityRegistry>, worker_id: &WorkerId) -> Result<Option<Self>> {
        if !registry.try_acquire(worker_id)? {
            return Ok(None);
        }
        Ok(Some(Self {
            registry: Arc::clone(registry),
            worker_id: worker_id.clone(),
            released: AtomicBool::new(false),
        }))
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Give the capacity back. Returns false if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.registry.release(&self.worker_id) {
            // The worker was deregistered while the step ran.
            debug!(worker = %self.worker_id, error = %e, "lease release skipped");
        }
        true
    }
}

impl Drop for LoadLease {
    fn drop(&mut self) {
        self.release();
    }
}
