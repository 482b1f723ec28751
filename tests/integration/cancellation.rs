//! Cancellation and deadline tests.
//!
//! These tests verify that a stopped plan reports its stop cause on every
//! step that never ran, rather than blaming the step before it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use swarm_router::core::task::{FailureCause, StepStatus};
use swarm_router::core::worker::WorkerId;
use swarm_router::orchestration::{Request, SwarmEngine, WorkerExecutor};
use swarm_router::Error;

use crate::fixtures::{engine_with, fast_config, worker, Sleepy};

const STAGES: [(&str, &str); 5] = [
    ("spec", "specification"),
    ("planner", "planning"),
    ("coder", "coding"),
    ("tester", "testing"),
    ("reviewer", "review"),
];

fn feature_engine(delay: Duration) -> SwarmEngine {
    engine_with(
        fast_config(),
        STAGES
            .iter()
            .map(|(id, c)| (worker(id, c, 0.9, 1), Sleepy::new(delay) as Arc<dyn WorkerExecutor>))
            .collect(),
    )
}

fn causes(err: Error) -> Vec<StepStatus> {
    let Error::PlanFailed { report } = err else {
        panic!("expected PlanFailed, got {err:?}");
    };
    report.outcomes.into_iter().map(|o| o.status).collect()
}

/// Test: Cancelling during the first stage stops the whole pipeline
/// Given a five stage feature pipeline whose stages each take 10s
/// When the request is cancelled 1s into the first stage
/// Then the first stage and all four later stages are cancelled
/// And every worker's load is back to zero
#[tokio::test(start_paused = true)]
async fn test_cancel_mid_first_stage_cancels_every_stage() {
    let engine = feature_engine(Duration::from_secs(10));
    let cancel = CancellationToken::new();

    let (result, _) = tokio::join!(
        engine.handle_with_cancellation(Request::new("Build a new feature for invoice export"), cancel.clone()),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    );

    let cancelled = StepStatus::Failed {
        cause: FailureCause::Cancelled,
    };
    let statuses = causes(result.unwrap_err());
    assert_eq!(statuses.len(), 5);
    assert!(statuses.iter().all(|s| *s == cancelled), "statuses: {statuses:?}");

    for (id, _) in STAGES {
        let w = engine.registry().get(&WorkerId::from(id)).unwrap();
        assert_eq!(w.current_load, 0);
    }
}

/// Test: A request already cancelled never dispatches
/// Given a cancelled token
/// When a feature request is handled with it
/// Then every stage is cancelled without a worker call
#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_dispatches_nothing() {
    let engine = feature_engine(Duration::from_secs(10));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine
        .handle_with_cancellation(Request::new("Build a new feature for invoice export"), cancel)
        .await
        .unwrap_err();
    let Error::PlanFailed { report } = &err else {
        panic!("expected PlanFailed, got {err:?}");
    };
    assert!(report.outcomes.iter().all(|o| o.attempts == 0));
    assert!(report.errors().iter().all(|e| matches!(e, Error::Cancelled)));
}

/// Test: Stages after a passed deadline report the deadline
/// Given a five stage pipeline whose stages each take 2s
/// And a deadline 3s away
/// When the request is handled
/// Then the first two stages succeed
/// And the last three fail with the deadline, not a dependency
#[tokio::test(start_paused = true)]
async fn test_deadline_fails_remaining_stages() {
    let engine = feature_engine(Duration::from_secs(2));
    let request = Request::new("Build a new feature for invoice export")
        .with_deadline(Utc::now() + chrono::Duration::seconds(3));

    let statuses = causes(engine.handle(request).await.unwrap_err());

    assert_eq!(statuses[0], StepStatus::Succeeded);
    assert_eq!(statuses[1], StepStatus::Succeeded);
    let expired = StepStatus::Failed {
        cause: FailureCause::DeadlineExceeded,
    };
    assert_eq!(&statuses[2..], &[expired.clone(), expired.clone(), expired]);
}
