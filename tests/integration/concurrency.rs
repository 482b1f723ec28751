//! Concurrency invariant tests.
//!
//! These tests verify that concurrent requests never push a worker past
//! its capacity and that an open circuit stops further dispatches.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use swarm_router::core::worker::{CircuitState, WorkerId};
use swarm_router::orchestration::{Request, WorkerExecutor};
use swarm_router::Error;

use crate::fixtures::{engine_with, fast_config, worker, FailTimes, Sleepy};

/// Test: Capacity holds across spawned requests
/// Given one worker with capacity 3
/// When 12 requests run on a multi-threaded runtime
/// Then no more than 3 executions ever overlap
/// And every lease is returned
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_oversubscription_across_threads() {
    let sleepy = Sleepy::new(Duration::from_millis(20));
    let engine = Arc::new(engine_with(
        fast_config(),
        vec![(worker("w", "testing", 0.9, 3), sleepy.clone() as Arc<dyn WorkerExecutor>)],
    ));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.handle(Request::new("write unit tests")).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(Error::NoEligibleWorker { .. }) | Err(Error::PlanFailed { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert!(succeeded >= 1);
    assert!(sleepy.peak() <= 3, "peak concurrency was {}", sleepy.peak());
    let w = engine.registry().get(&WorkerId::from("w")).unwrap();
    assert_eq!(w.current_load, 0);
}

/// Test: Requests beyond capacity are turned away, not queued over it
/// Given one worker with capacity 2
/// When 5 requests are polled together
/// Then exactly 2 run and the rest find no eligible worker
#[tokio::test(start_paused = true)]
async fn test_saturated_worker_turns_requests_away() {
    let sleepy = Sleepy::new(Duration::from_secs(1));
    let engine = engine_with(
        fast_config(),
        vec![(worker("w", "testing", 0.9, 2), sleepy.clone() as Arc<dyn WorkerExecutor>)],
    );

    let results = join_all((0..5).map(|_| engine.handle(Request::new("write unit tests")))).await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 2);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, Error::NoEligibleWorker { .. })));
    assert_eq!(sleepy.peak(), 2);
}

/// Test: No dispatch after the circuit opens
/// Given a worker that always fails, a threshold of 3, and no retries
/// When 10 requests arrive one after another
/// Then the worker is called exactly 3 times and the rest are rejected at arbitration
#[tokio::test]
async fn test_open_circuit_stops_dispatch() {
    let mut config = fast_config();
    config.execution.max_attempts = 1;
    config.circuit_breaker.failure_threshold = 3;
    let failing = FailTimes::always();
    let engine = engine_with(
        config,
        vec![(worker("w", "testing", 0.9, 4), failing.clone() as Arc<dyn WorkerExecutor>)],
    );

    let mut rejected = 0;
    for _ in 0..10 {
        match engine.handle(Request::new("write unit tests")).await {
            Err(Error::PlanFailed { .. }) => {}
            Err(Error::NoEligibleWorker { .. }) => rejected += 1,
            other => panic!("unexpected result: {other:?}"),
        }
    }

    assert_eq!(failing.calls(), 3);
    assert_eq!(rejected, 7);
    assert_eq!(
        engine.health().circuit_state(&WorkerId::from("w")).unwrap(),
        CircuitState::Open
    );
}
