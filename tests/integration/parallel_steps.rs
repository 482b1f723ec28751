//! Parallel strategy tests.
//!
//! These tests verify that independent steps run side by side and that
//! each step's outcome is reported on its own.

use std::sync::Arc;
use std::time::Duration;

use swarm_router::core::plan::Strategy;
use swarm_router::core::task::{FailureCause, StepStatus};
use swarm_router::orchestration::{Request, WorkerExecutor};
use swarm_router::Error;

use crate::fixtures::{engine_with, fast_config, worker, FailTimes, Sleepy, Succeed};

/// Test: One failed step does not mask the others
/// Given an audit with security, performance, and dependency stages
/// And the security worker always fails
/// When the request is handled
/// Then the plan fails, security is reported failed, and the other two succeeded
#[tokio::test]
async fn test_parallel_outcomes_reported_independently() {
    let security = FailTimes::always();
    let engine = engine_with(
        fast_config(),
        vec![
            (worker("sec", "security", 0.9, 1), security.clone() as Arc<dyn WorkerExecutor>),
            (worker("perf", "performance", 0.9, 1), Succeed::new("perf") as Arc<dyn WorkerExecutor>),
            (worker("deps", "dependencies", 0.9, 1), Succeed::new("deps") as Arc<dyn WorkerExecutor>),
        ],
    );

    let err = engine
        .handle(Request::new("Audit the payments service"))
        .await
        .unwrap_err();
    assert_eq!(err.stage(), "execution");
    let Error::PlanFailed { report } = err else {
        panic!("expected PlanFailed");
    };

    assert_eq!(report.strategy, Strategy::Parallel);
    assert_eq!(report.outcomes.len(), 3);
    assert!(report.final_output.is_none());

    let failed = report.failed_steps();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].worker_id.as_str(), "sec");
    assert_eq!(failed[0].attempts, 3);
    assert!(matches!(
        &failed[0].status,
        StepStatus::Failed { cause: FailureCause::Worker(_) }
    ));
    assert_eq!(security.calls(), 3);

    let succeeded: Vec<&str> = report
        .outcomes
        .iter()
        .filter(|o| o.succeeded())
        .map(|o| o.worker_id.as_str())
        .collect();
    assert_eq!(succeeded.len(), 2);
    assert!(succeeded.contains(&"perf"));
    assert!(succeeded.contains(&"deps"));
}

/// Test: Independent steps overlap in time
/// Given three audit stages that each take one second
/// When the request is handled
/// Then the whole plan takes about one second, not three
#[tokio::test(start_paused = true)]
async fn test_parallel_steps_overlap() {
    let roster = ["security", "performance", "dependencies"];
    let engine = engine_with(
        fast_config(),
        roster
            .iter()
            .map(|c| {
                (
                    worker(c, c, 0.9, 1),
                    Sleepy::new(Duration::from_secs(1)) as Arc<dyn WorkerExecutor>,
                )
            })
            .collect(),
    );

    let response = engine.handle(Request::new("run an audit")).await.unwrap();

    assert_eq!(response.plan.strategy, Strategy::Parallel);
    assert!(response.report.succeeded());
    assert!(response.report.elapsed < Duration::from_secs(2));
    assert_eq!(response.plan.groups.len(), 1);
}
