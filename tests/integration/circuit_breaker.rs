//! Circuit breaker tests.
//!
//! These tests verify that repeated failures take a worker out of
//! rotation, that work moves to backups, and that the worker returns
//! after the reset timeout and a successful trial dispatch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use swarm_router::core::task::{Requirement, TaskId};
use swarm_router::core::worker::{CircuitState, WorkerId};
use swarm_router::orchestration::{CoordinatorEvent, HealthEvent, Request, SwarmEngine, WorkerExecutor};
use swarm_router::Error;

use crate::fixtures::{engine_with, fast_config, worker, FailTimes, Succeed};

fn testing() -> Vec<Requirement> {
    vec![Requirement::new("testing", 1.0)]
}

/// Test: Five failed executions exclude the worker until reset
/// Given a worker and the default threshold of 5
/// When 5 failed executions are recorded
/// Then arbitration no longer considers it
/// And after the 60s reset timeout and one success it is selectable again
#[tokio::test(start_paused = true)]
async fn test_failures_exclude_then_recover() {
    let engine = engine_with(
        fast_config(),
        vec![(worker("flaky", "testing", 0.9, 2), Succeed::new("flaky") as Arc<dyn WorkerExecutor>)],
    );
    let id = WorkerId::from("flaky");

    for _ in 0..4 {
        engine.metrics().record_end(&id, TaskId::new(), false, Duration::from_millis(5));
    }
    assert_eq!(engine.health().circuit_state(&id).unwrap(), CircuitState::Closed);
    assert_eq!(engine.arbiter().rank(&testing()).len(), 1);

    engine.metrics().record_end(&id, TaskId::new(), false, Duration::from_millis(5));
    assert_eq!(engine.health().circuit_state(&id).unwrap(), CircuitState::Open);
    assert!(engine.arbiter().rank(&testing()).is_empty());
    let err = engine.handle(Request::new("write unit tests")).await.unwrap_err();
    assert!(matches!(err, Error::NoEligibleWorker { .. }));

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(engine.arbiter().rank(&testing()).is_empty());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(engine.arbiter().rank(&testing()).len(), 1);
    assert_eq!(engine.health().circuit_state(&id).unwrap(), CircuitState::HalfOpen);

    let response = engine.handle(Request::new("write unit tests")).await.unwrap();
    assert_eq!(response.output(), Some("flaky:testing"));
    assert_eq!(engine.health().circuit_state(&id).unwrap(), CircuitState::Closed);

    let snapshot = engine.observe();
    let view = snapshot.worker(&id).unwrap();
    assert_eq!(view.health.failure_count, 0);
    assert_eq!(view.metrics.failures, 5);
    assert_eq!(view.metrics.successes, 1);
}

/// Test: An opened circuit hands the step to a backup
/// Given a primary that always fails, a threshold of 2, and a backup
/// When a request routes to the primary
/// Then its circuit opens after two failures and the backup finishes the step
#[tokio::test(start_paused = true)]
async fn test_open_circuit_redistributes_to_backup() {
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 2;
    let (health_tx, mut health_rx) = mpsc::channel(16);
    let (coord_tx, mut coord_rx) = mpsc::channel(64);
    let engine = SwarmEngine::builder(config)
        .health_events(health_tx)
        .coordinator_events(coord_tx)
        .build()
        .unwrap();

    let primary = FailTimes::always();
    let backup = Succeed::new("backup");
    engine
        .register(worker("backup", "testing", 0.6, 1), backup.clone())
        .unwrap();
    engine
        .register(
            worker("primary", "testing", 0.95, 1).with_backup("backup"),
            primary.clone(),
        )
        .unwrap();

    let response = engine.handle(Request::new("write unit tests")).await.unwrap();

    assert_eq!(response.plan.workers(), vec![WorkerId::from("primary")]);
    assert_eq!(response.output(), Some("backup:testing"));
    assert_eq!(primary.calls(), 2);
    assert_eq!(backup.calls(), 1);

    let outcome = &response.report.outcomes[0];
    assert_eq!(outcome.worker_id.as_str(), "backup");
    assert_eq!(
        outcome.workers_tried,
        vec![WorkerId::from("primary"), WorkerId::from("backup")]
    );

    assert_eq!(
        health_rx.try_recv().unwrap(),
        HealthEvent::CircuitOpened {
            worker_id: WorkerId::from("primary"),
            failures: 2,
        }
    );
    let mut redistributed = false;
    while let Ok(event) = coord_rx.try_recv() {
        if let CoordinatorEvent::StepRedistributed { from, to, .. } = event {
            assert_eq!(from.as_str(), "primary");
            assert_eq!(to.as_str(), "backup");
            redistributed = true;
        }
    }
    assert!(redistributed);
}

/// Test: Without a backup the last worker error is kept
/// Given a single worker that always fails and a threshold of 2
/// When a request routes to it
/// Then the plan fails after two dispatches with the worker's error
#[tokio::test(start_paused = true)]
async fn test_open_circuit_without_backup_fails_step() {
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 2;
    let primary = FailTimes::always();
    let engine = engine_with(
        config,
        vec![(worker("solo", "testing", 0.9, 1), primary.clone() as Arc<dyn WorkerExecutor>)],
    );

    let err = engine.handle(Request::new("write unit tests")).await.unwrap_err();
    let Error::PlanFailed { report } = err else {
        panic!("expected PlanFailed");
    };
    assert_eq!(primary.calls(), 2);
    assert_eq!(report.outcomes[0].attempts, 2);
    assert!(report.failure_summary().contains("failed on call 2"));
}
