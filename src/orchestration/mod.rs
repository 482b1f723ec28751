//! Orchestration layer for the swarm routing engine.
//!
//! Requests flow classifier -> arbiter -> coordinator. The registry holds
//! worker records and executors; the health monitor and metrics collector
//! observe every dispatch and feed back into arbitration.

pub mod arbiter;
pub mod classifier;
pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod understanding;

pub use arbiter::{ArbiterConfig, ArbitrationEngine, Candidate};
pub use classifier::{
    Classification, ClassificationSource, Entity, EntityPattern, Intent, IntentClassifier,
    IntentPattern, StagePattern, TextUnderstanding,
};
pub use coordinator::{CoordinatorEvent, ExecutionCoordinator, RetryPolicy};
pub use engine::{ObservabilitySnapshot, Request, Response, SwarmEngine, SwarmEngineBuilder, WorkerView};
pub use executor::{FnExecutor, StepInput, StepRequest, WorkerExecutor};
pub use health::{CircuitBreakerConfig, HealthEvent, HealthMonitor, WorkerHealth};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use registry::{CapabilityRegistry, LoadLease};
pub use understanding::CommandUnderstanding;
