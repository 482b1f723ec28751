//! Hierarchical coordination tests.
//!
//! These tests verify that supervised and decomposed requests run their
//! subordinates first and hand every subordinate output to the lead.

use std::sync::Arc;

use swarm_router::core::plan::{StepRole, Strategy};
use swarm_router::orchestration::{Request, WorkerExecutor};

use crate::fixtures::{engine_with, fast_config, worker, Recorder};

/// Test: A full stack request is supervised by a coordinator
/// Given one worker each for coding, ui, testing, and coordination
/// When "coordinate the full stack" is handled
/// Then the three subordinates run before the lead
/// And the lead receives all three outputs as inputs
#[tokio::test]
async fn test_full_stack_request_feeds_lead() {
    let coder = Recorder::new("coder");
    let designer = Recorder::new("designer");
    let tester = Recorder::new("tester");
    let lead = Recorder::new("lead");
    let engine = engine_with(
        fast_config(),
        vec![
            (worker("coder", "coding", 0.9, 1), coder.clone() as Arc<dyn WorkerExecutor>),
            (worker("designer", "ui", 0.9, 1), designer.clone() as Arc<dyn WorkerExecutor>),
            (worker("tester", "testing", 0.9, 1), tester.clone() as Arc<dyn WorkerExecutor>),
            (worker("lead", "coordination", 0.9, 1), lead.clone() as Arc<dyn WorkerExecutor>),
        ],
    );

    let response = engine
        .handle(Request::new("Coordinate the full stack for the checkout flow"))
        .await
        .unwrap();

    assert_eq!(response.classification.intent.name, "coordinate");
    assert_eq!(response.plan.strategy, Strategy::Hierarchical);
    assert_eq!(response.plan.groups.len(), 2);
    assert_eq!(response.plan.groups[0].steps.len(), 3);

    let requests = lead.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].role, StepRole::Lead);
    let inputs: Vec<&str> = requests[0].inputs.iter().map(|i| i.output.as_str()).collect();
    assert_eq!(inputs, vec!["coder:backend", "designer:frontend", "tester:verify"]);
    assert_eq!(response.output(), Some("lead:lead"));

    for subordinate in [&coder, &designer, &tester] {
        let seen = subordinate.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].role, StepRole::Subordinate);
        assert!(seen[0].inputs.is_empty());
    }
}

/// Test: A request no single worker covers is decomposed
/// Given a diagnostics worker and a separate coding worker
/// When "debug the crash" is handled
/// Then the coding subordinate runs first
/// And the diagnostics lead receives its output
#[tokio::test]
async fn test_uncovered_request_is_decomposed() {
    let diag = Recorder::new("diag");
    let coder = Recorder::new("coder");
    let engine = engine_with(
        fast_config(),
        vec![
            (worker("diag", "diagnostics", 0.9, 1), diag.clone() as Arc<dyn WorkerExecutor>),
            (worker("coder", "coding", 0.9, 1), coder.clone() as Arc<dyn WorkerExecutor>),
        ],
    );

    let response = engine
        .handle(Request::new("Debug the crash in the payment worker"))
        .await
        .unwrap();

    assert_eq!(response.classification.intent.name, "diagnose");
    assert_eq!(response.plan.strategy, Strategy::Hierarchical);
    let roles: Vec<StepRole> = response.plan.steps().map(|s| s.role).collect();
    assert_eq!(roles, vec![StepRole::Subordinate, StepRole::Lead]);

    let lead = diag.requests();
    assert_eq!(lead.len(), 1);
    assert_eq!(lead[0].name, "diagnostics");
    assert_eq!(lead[0].inputs.len(), 1);
    assert_eq!(lead[0].inputs[0].output, "coder:coding");
    assert_eq!(response.output(), Some("diag:diagnostics"));
}
