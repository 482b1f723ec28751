//! End-to-end routing tests.
//!
//! Free text goes in; the tests check which worker ran, what came out,
//! and which stage rejected the request when nothing could run.

use async_trait::async_trait;
use std::sync::Arc;

use swarm_router::core::plan::Strategy;
use swarm_router::core::task::Requirement;
use swarm_router::core::worker::WorkerId;
use swarm_router::orchestration::{
    ClassificationSource, Request, SwarmEngine, TextUnderstanding, WorkerExecutor,
};
use swarm_router::{Error, Result};

use crate::fixtures::{engine_with, fast_config, worker, Succeed};

/// Understanding backend with a canned answer.
struct Canned(&'static str);

#[async_trait]
impl TextUnderstanding for Canned {
    async fn understand(&self, _text: &str) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Test: Best-matching worker wins
/// Given workers A (testing 0.9) and B (testing 0.4)
/// When "write unit tests for the billing module" is handled
/// Then the plan assigns A and A's output is returned
#[tokio::test]
async fn test_write_tests_routes_to_strongest_worker() {
    let a = Succeed::new("A");
    let b = Succeed::new("B");
    let engine = engine_with(
        fast_config(),
        vec![
            (worker("A", "testing", 0.9, 2), a.clone() as Arc<dyn WorkerExecutor>),
            (worker("B", "testing", 0.4, 2), b.clone() as Arc<dyn WorkerExecutor>),
        ],
    );

    let response = engine
        .handle(Request::new("Write unit tests for the billing module"))
        .await
        .unwrap();

    assert_eq!(response.classification.intent.name, "write-tests");
    assert_eq!(response.plan.strategy, Strategy::Sequential);
    assert_eq!(response.plan.workers(), vec![WorkerId::from("A")]);
    assert_eq!(response.output(), Some("A:testing"));
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 0);

    let entity = response.classification.entity("artifact").unwrap();
    assert_eq!(entity.value, "module");
}

/// Test: Understanding fallback drives routing
/// Given no pattern matches and the backend answers
///   {"intent": "qa-sweep", "confidence": 0.9, "competencies": {"testing": 1.0}}
/// When the request is handled
/// Then the task requires testing at weight 1.0 and the tester runs it
#[tokio::test]
async fn test_understanding_answer_round_trips_to_worker() {
    let mut engine = SwarmEngine::builder(fast_config())
        .understanding(Arc::new(Canned(
            r#"Sure! {"intent": "qa-sweep", "confidence": 0.9, "competencies": {"testing": 1.0}}"#,
        )))
        .build()
        .unwrap();
    engine
        .register(worker("tester", "testing", 0.8, 1), Succeed::new("tester"))
        .unwrap();

    let response = engine
        .handle(Request::new("make sure checkout still behaves"))
        .await
        .unwrap();

    let intent = &response.classification.intent;
    assert_eq!(response.classification.source, ClassificationSource::Understanding);
    assert_eq!(intent.name, "qa-sweep");
    assert_eq!(intent.confidence, 0.9);
    assert_eq!(intent.required, vec![Requirement::new("testing", 1.0)]);
    assert_eq!(response.output(), Some("tester:testing"));

    // Same text through the deterministic path alone is rejected.
    engine = SwarmEngine::new(fast_config()).unwrap();
    let err = engine.classify("make sure checkout still behaves").await.unwrap_err();
    assert!(matches!(err, Error::LowConfidence { .. }));
}

/// Test: Low-confidence answers are rejected before arbitration
/// Given the backend answers with confidence 0.4
/// When the request is handled
/// Then a classification-stage LowConfidence error is returned and no worker runs
#[tokio::test]
async fn test_low_confidence_rejected_at_classification() {
    let tester = Succeed::new("tester");
    let engine = SwarmEngine::builder(fast_config())
        .understanding(Arc::new(Canned(
            r#"{"intent": {"name": "qa-sweep", "confidence": 0.4}, "competencies": {"testing": 1.0}}"#,
        )))
        .build()
        .unwrap();
    engine
        .register(worker("tester", "testing", 0.9, 1), tester.clone())
        .unwrap();

    let err = engine.handle(Request::new("hmm")).await.unwrap_err();
    assert_eq!(err.stage(), "classification");
    match err {
        Error::LowConfidence { best, .. } => assert_eq!(best.as_deref(), Some("qa-sweep")),
        other => panic!("expected LowConfidence, got {other:?}"),
    }
    assert_eq!(tester.calls(), 0);
}

/// Test: Unmet competencies are named
/// Given only a documentation worker
/// When a deployment request arrives
/// Then arbitration fails naming devops
#[tokio::test]
async fn test_no_eligible_worker_names_competency() {
    let engine = engine_with(
        fast_config(),
        vec![(worker("docs", "documentation", 0.9, 1), Succeed::new("docs") as Arc<dyn WorkerExecutor>)],
    );

    let err = engine
        .handle(Request::new("deploy the api to staging"))
        .await
        .unwrap_err();
    match err {
        Error::NoEligibleWorker { unmet } => assert_eq!(unmet, vec!["devops".to_string()]),
        other => panic!("expected NoEligibleWorker, got {other:?}"),
    }
}

/// Test: Staged intent runs as a pipeline
/// Given one worker per stage of a feature build
/// When "build a new feature" is handled
/// Then every stage runs in order and the review output is final
#[tokio::test]
async fn test_feature_request_runs_pipeline() {
    let roster = [
        ("spec", "specification"),
        ("planner", "planning"),
        ("coder", "coding"),
        ("tester", "testing"),
        ("reviewer", "review"),
    ];
    let engine = engine_with(
        fast_config(),
        roster
            .iter()
            .map(|(id, c)| (worker(id, c, 0.9, 1), Succeed::new(id) as Arc<dyn WorkerExecutor>))
            .collect(),
    );

    let response = engine
        .handle(Request::new("Build a new feature for invoice export"))
        .await
        .unwrap();

    assert_eq!(response.plan.strategy, Strategy::Pipeline);
    let ran: Vec<&str> = response
        .report
        .outcomes
        .iter()
        .map(|o| o.worker_id.as_str())
        .collect();
    assert_eq!(ran, vec!["spec", "planner", "coder", "tester", "reviewer"]);
    assert_eq!(response.output(), Some("reviewer:review"));
}
