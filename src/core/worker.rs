//! Worker data model for the capability registry.
//!
//! A worker is an opaque executor described by its competency vector,
//! concurrency capacity, and ordered backup list. The dynamic fields
//! (load, status, circuit) are owned by the registry and only mutated
//! through its atomic operations.

use crate::core::task::Requirement;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Default number of concurrent tasks a worker accepts.
pub const DEFAULT_MAX_CONCURRENT: u32 = 1;

/// Unique identifier for a registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Availability of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Running at least one task with spare capacity.
    Active,
    /// No tasks in flight.
    #[default]
    Idle,
    /// Running at full capacity.
    Busy,
    /// Explicitly taken out of rotation.
    Unavailable,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Circuit breaker position for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker bookkeeping for one worker.
///
/// Transitions are driven by the health monitor; see
/// `orchestration::health::CircuitBreakerConfig`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Circuit {
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Monotonic instant the circuit last (re)opened. Drives the reset timeout.
    #[serde(skip)]
    pub opened_at: Option<Instant>,
}

impl Circuit {
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Whether a worker at `current_load` may take another dispatch.
    ///
    /// A half-open circuit admits a single trial dispatch at a time.
    pub fn admits(&self, current_load: u32) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => current_load == 0,
            CircuitState::Open => false,
        }
    }
}

/// Static description of a worker, as supplied by bootstrap code.
///
/// This is the only write path into a worker's static fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    /// Capability name to strength in [0, 1].
    #[serde(default)]
    pub competencies: BTreeMap<String, f64>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Workers to prefer, in order, when this one is unavailable.
    #[serde(default)]
    pub backups: Vec<WorkerId>,
}

fn default_max_concurrent() -> u32 {
    DEFAULT_MAX_CONCURRENT
}

impl WorkerDescriptor {
    pub fn new(id: impl Into<WorkerId>) -> Self {
        Self {
            id: id.into(),
            competencies: BTreeMap::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            backups: Vec::new(),
        }
    }

    pub fn with_competency(mut self, name: &str, level: f64) -> Self {
        self.competencies.insert(name.to_string(), level);
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_backup(mut self, backup: impl Into<WorkerId>) -> Self {
        self.backups.push(backup.into());
        self
    }

    /// Reject empty ids, zero capacity, and competency levels outside [0, 1].
    pub fn validate(&self) -> Result<()> {
        if self.id.0.trim().is_empty() {
            return Err(Error::Validation("worker id must not be empty".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Validation(format!(
                "worker {} must accept at least one concurrent task",
                self.id
            )));
        }
        validate_competencies(&self.id, &self.competencies)?;
        if self.backups.contains(&self.id) {
            return Err(Error::Validation(format!(
                "worker {} lists itself as a backup",
                self.id
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_competencies(id: &WorkerId, competencies: &BTreeMap<String, f64>) -> Result<()> {
    for (name, level) in competencies {
        if !(0.0..=1.0).contains(level) {
            return Err(Error::Validation(format!(
                "worker {} competency '{}' must be within [0, 1], got {}",
                id, name, level
            )));
        }
    }
    Ok(())
}

/// A registered worker: static descriptor plus the registry-owned dynamic state.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: WorkerId,
    pub competencies: BTreeMap<String, f64>,
    pub max_concurrent: u32,
    /// In-flight task count, 0 <= current_load <= max_concurrent.
    pub current_load: u32,
    pub status: WorkerStatus,
    pub backups: Vec<WorkerId>,
    pub circuit: Circuit,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn from_descriptor(descriptor: WorkerDescriptor) -> Self {
        Self {
            id: descriptor.id,
            competencies: descriptor.competencies,
            max_concurrent: descriptor.max_concurrent,
            current_load: 0,
            status: WorkerStatus::Idle,
            backups: descriptor.backups,
            circuit: Circuit::default(),
            registered_at: Utc::now(),
        }
    }

    /// Strength for a competency, 0.0 when the worker lacks it.
    pub fn competency(&self, name: &str) -> f64 {
        self.competencies.get(name).copied().unwrap_or(0.0)
    }

    /// Weighted average of this worker's levels over the requirements.
    pub fn match_score(&self, required: &[Requirement]) -> f64 {
        match_score(&self.competencies, required)
    }

    /// True if every individual requirement is met at or above `min`.
    pub fn satisfies_each(&self, required: &[Requirement], min: f64) -> bool {
        required.iter().all(|r| self.competency(&r.competency) >= min)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent
    }

    pub fn available_slots(&self) -> u32 {
        self.max_concurrent.saturating_sub(self.current_load)
    }

    /// Re-derive status from load. An unavailable worker stays unavailable.
    pub fn refresh_status(&mut self) {
        if self.status == WorkerStatus::Unavailable {
            return;
        }
        self.status = if self.current_load == 0 {
            WorkerStatus::Idle
        } else if self.current_load >= self.max_concurrent {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Active
        };
    }
}

/// `Σ(weight × level) / Σ(weight)` over the requirements.
///
/// Returns 0.0 when there are no requirements or the total weight is not positive.
pub fn match_score(competencies: &BTreeMap<String, f64>, required: &[Requirement]) -> f64 {
    let total_weight: f64 = required.iter().map(|r| r.weight).sum();
    if required.is_empty() || total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = required
        .iter()
        .map(|r| r.weight * competencies.get(&r.competency).copied().unwrap_or(0.0))
        .sum();
    weighted / total_weight
}
