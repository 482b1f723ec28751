//! Health monitoring and circuit breaking for workers.
//!
//! The `HealthMonitor` observes per-worker step outcomes and drives each
//! worker's circuit through its state machine:
//!
//! ```text
//! closed --(failures >= threshold)--> open --(reset timeout)--> half-open
//! half-open --(success)--> closed
//! half-open --(failure)--> open (timeout clock restarts)
//! ```
//!
//! A worker whose circuit is open is never selectable. While half-open a
//! worker takes a single trial dispatch at a time.

use crate::core::worker::{Circuit, CircuitState, Worker, WorkerId, WorkerStatus};
use crate::error::Result;
use crate::orchestration::registry::CapabilityRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default consecutive failures before a circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open circuit waits before allowing a trial dispatch.
pub const DEFAULT_RESET_TIMEOUT_SECS: u64 = 60;

/// Configuration for circuit breaking.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before moving to half-open.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with the specified failure threshold.
    pub fn with_failure_threshold(threshold: u32) -> Self {
        Self {
            failure_threshold: threshold,
            ..Default::default()
        }
    }

    /// Create a config with the specified reset timeout.
    pub fn with_reset_timeout(reset_timeout: Duration) -> Self {
        Self {
            reset_timeout,
            ..Default::default()
        }
    }

    /// Apply a success. Returns the new state if it changed.
    pub fn on_success(&self, circuit: &mut Circuit) -> Option<CircuitState> {
        circuit.failure_count = 0;
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Closed;
                circuit.opened_at = None;
                Some(CircuitState::Closed)
            }
            // A dispatch started before the circuit opened may still report in.
            CircuitState::Closed | CircuitState::Open => None,
        }
    }

    /// Apply a failure observed at `now`. Returns the new state if it changed.
    pub fn on_failure(&self, circuit: &mut Circuit, now: Instant) -> Option<CircuitState> {
        circuit.failure_count = circuit.failure_count.saturating_add(1);
        circuit.last_failure_time = Some(Utc::now());
        match circuit.state {
            CircuitState::Closed if circuit.failure_count >= self.failure_threshold => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                Some(CircuitState::Open)
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    /// Move an open circuit to half-open once the reset timeout has elapsed.
    pub fn poll(&self, circuit: &mut Circuit, now: Instant) -> Option<CircuitState> {
        if circuit.state != CircuitState::Open {
            return None;
        }
        let elapsed = circuit
            .opened_at
            .map(|opened| now.saturating_duration_since(opened) >= self.reset_timeout)
            .unwrap_or(true);
        if elapsed {
            circuit.state = CircuitState::HalfOpen;
            return Some(CircuitState::HalfOpen);
        }
        None
    }

    /// Whether a circuit in this position admits a new dispatch.
    pub fn admits(&self, circuit: &Circuit, current_load: u32) -> bool {
        circuit.admits(current_load)
    }
}

/// Events emitted by the health monitor on circuit transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// A worker's circuit opened after repeated failures.
    CircuitOpened {
        worker_id: WorkerId,
        failures: u32,
    },
    /// The reset timeout elapsed; the worker may take one trial dispatch.
    CircuitHalfOpened { worker_id: WorkerId },
    /// A trial dispatch succeeded and the worker is back in rotation.
    CircuitClosed { worker_id: WorkerId },
}

/// Read-only health view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub circuit: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub current_load: u32,
    pub max_concurrent: u32,
}

impl From<&Worker> for WorkerHealth {
    fn from(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id.clone(),
            status: worker.status,
            circuit: worker.circuit.state,
            failure_count: worker.circuit.failure_count,
            last_failure_time: worker.circuit.last_failure_time,
            current_load: worker.current_load,
            max_concurrent: worker.max_concurrent,
        }
    }
}

/// Health and circuit-breaker monitor.
///
/// Circuit state lives on the worker records in the registry and every
/// transition is applied under that worker's exclusive slot.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use swarm_router::orchestration::{CapabilityRegistry, CircuitBreakerConfig, HealthMonitor};
///
/// let registry = Arc::new(CapabilityRegistry::default());
/// let monitor = HealthMonitor::new(CircuitBreakerConfig::default(), registry);
/// monitor.record_failure(&"tester".into())?;
/// ```
pub struct HealthMonitor {
    config: CircuitBreakerConfig,
    registry: Arc<CapabilityRegistry>,
    event_tx: Option<mpsc::Sender<HealthEvent>>,
}

impl HealthMonitor {
    pub fn new(config: CircuitBreakerConfig, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            config,
            registry,
            event_tx: None,
        }
    }

    /// Emit circuit transitions on `event_tx`.
    pub fn with_events(mut self, event_tx: mpsc::Sender<HealthEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Record a successful step. Resets the failure count; closes a half-open circuit.
    pub fn record_success(&self, id: &WorkerId) -> Result<CircuitState> {
        let (state, changed) = self.registry.update_circuit(id, |circuit, _| {
            let changed = self.config.on_success(circuit);
            (circuit.state, changed)
        })?;
        if changed == Some(CircuitState::Closed) {
            info!(worker = %id, "circuit closed after successful trial dispatch");
            self.emit(HealthEvent::CircuitClosed {
                worker_id: id.clone(),
            });
        }
        Ok(state)
    }

    /// Record a failed or timed-out step.
    pub fn record_failure(&self, id: &WorkerId) -> Result<CircuitState> {
        let now = Instant::now();
        let (state, failures, changed) = self.registry.update_circuit(id, |circuit, _| {
            let changed = self.config.on_failure(circuit, now);
            (circuit.state, circuit.failure_count, changed)
        })?;
        debug!(worker = %id, failures, circuit = %state, "failure recorded");
        if changed == Some(CircuitState::Open) {
            warn!(worker = %id, failures, "circuit opened");
            self.emit(HealthEvent::CircuitOpened {
                worker_id: id.clone(),
                failures,
            });
        }
        Ok(state)
    }

    pub fn record_outcome(&self, id: &WorkerId, success: bool) -> Result<CircuitState> {
        if success {
            self.record_success(id)
        } else {
            self.record_failure(id)
        }
    }

    /// Promote every open circuit whose reset timeout elapsed to half-open.
    ///
    /// Returns the workers that moved.
    pub fn refresh(&self) -> Vec<WorkerId> {
        let open: Vec<WorkerId> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|w| w.circuit.is_open())
            .map(|w| w.id)
            .collect();
        open.into_iter()
            .filter(|id| self.poll(id).ok().flatten().is_some())
            .collect()
    }

    fn poll(&self, id: &WorkerId) -> Result<Option<CircuitState>> {
        let now = Instant::now();
        let changed = self
            .registry
            .update_circuit(id, |circuit, _| self.config.poll(circuit, now))?;
        if changed == Some(CircuitState::HalfOpen) {
            info!(worker = %id, "circuit half-open, allowing one trial dispatch");
            self.emit(HealthEvent::CircuitHalfOpened {
                worker_id: id.clone(),
            });
        }
        Ok(changed)
    }

    /// Whether `id` may take a new dispatch right now.
    pub fn is_selectable(&self, id: &WorkerId) -> Result<bool> {
        self.poll(id)?;
        self.registry
            .update_circuit(id, |circuit, load| self.config.admits(circuit, load))
    }

    /// Whether a worker snapshot admits a dispatch, without mutating anything.
    pub fn admits(&self, worker: &Worker) -> bool {
        self.config.admits(&worker.circuit, worker.current_load)
    }

    pub fn circuit_state(&self, id: &WorkerId) -> Result<CircuitState> {
        self.registry.update_circuit(id, |circuit, _| circuit.state)
    }

    /// Health view of every worker, ordered by id.
    pub fn report(&self) -> Vec<WorkerHealth> {
        self.registry.snapshot().iter().map(WorkerHealth::from).collect()
    }

    fn emit(&self, event: HealthEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "health event dropped");
            }
        }
    }
}
