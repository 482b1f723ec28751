//! Request/response facade over the routing pipeline.
//!
//! `SwarmEngine` wires classification, arbitration, and execution around
//! one shared registry: request text goes in, and either the terminal
//! plan report or a typed error naming the failing stage comes out.

use crate::config::{ClassifierSection, Config};
use crate::core::plan::{ExecutionPlan, PlanReport};
use crate::core::task::{Priority, SubTask, Task};
use crate::core::worker::{Worker, WorkerDescriptor, WorkerId};
use crate::error::Result;
use crate::orchestration::arbiter::ArbitrationEngine;
use crate::orchestration::classifier::{
    builtin_entities, builtin_intents, Classification, IntentClassifier, TextUnderstanding,
};
use crate::orchestration::coordinator::{CoordinatorEvent, ExecutionCoordinator};
use crate::orchestration::executor::WorkerExecutor;
use crate::orchestration::health::{HealthEvent, HealthMonitor, WorkerHealth};
use crate::orchestration::metrics::{MetricsCollector, MetricsSnapshot};
use crate::orchestration::registry::CapabilityRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A free-form work request.
#[derive(Debug, Clone)]
pub struct Request {
    pub text: String,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            priority: Priority::default(),
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Terminal result of a handled request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub classification: Classification,
    pub plan: ExecutionPlan,
    pub report: PlanReport,
}

impl Response {
    pub fn output(&self) -> Option<&str> {
        self.report.final_output.as_deref()
    }
}

/// Read-only view of one worker for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub health: WorkerHealth,
    pub metrics: MetricsSnapshot,
}

/// Copy of every worker's load, circuit, and metrics at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilitySnapshot {
    pub taken_at: DateTime<Utc>,
    pub workers: Vec<WorkerView>,
}

impl ObservabilitySnapshot {
    pub fn worker(&self, id: &WorkerId) -> Option<&WorkerView> {
        self.workers.iter().find(|w| &w.health.worker_id == id)
    }
}

/// Turn a classification into an arbitrable task.
///
/// Intent stages become subtasks, chained where a stage consumes its
/// predecessor; a supervisor becomes the task's lead requirement.
pub fn task_from_classification(
    text: &str,
    classification: &Classification,
    priority: Priority,
    deadline: Option<DateTime<Utc>>,
) -> Task {
    let intent = &classification.intent;
    let mut task = Task::new(text).with_priority(priority);
    task.deadline = deadline;

    if intent.stages.is_empty() {
        task.required = intent.required.clone();
        return task;
    }

    let mut previous = None;
    for stage in &intent.stages {
        let mut sub = stage
            .competencies
            .iter()
            .fold(SubTask::new(&stage.name, text), |s, (c, w)| s.require(c, *w));
        if stage.consumes_previous {
            if let Some(producer) = previous {
                sub = sub.consuming(producer);
            }
        }
        previous = Some(sub.id);
        task = task.with_subtask(sub);
    }
    if let Some(supervisor) = &intent.supervisor {
        task = task.supervised_by(supervisor.clone());
    }
    task
}

fn build_classifier(section: &ClassifierSection) -> Result<IntentClassifier> {
    let mut intents = section.intents.clone();
    let mut entities = section.entities.clone();
    if section.use_builtin_patterns {
        let custom: Vec<String> = intents.iter().map(|i| i.name.clone()).collect();
        intents.extend(builtin_intents().into_iter().filter(|i| !custom.contains(&i.name)));
        entities.extend(builtin_entities());
    }
    IntentClassifier::new(section.min_confidence, intents, entities)
}

/// Builder for `SwarmEngine`.
pub struct SwarmEngineBuilder {
    config: Config,
    understanding: Option<Arc<dyn TextUnderstanding>>,
    health_tx: Option<mpsc::Sender<HealthEvent>>,
    coordinator_tx: Option<mpsc::Sender<CoordinatorEvent>>,
}

impl SwarmEngineBuilder {
    /// Fallback for requests no pattern recognises.
    pub fn understanding(mut self, understanding: Arc<dyn TextUnderstanding>) -> Self {
        self.understanding = Some(understanding);
        self
    }

    pub fn health_events(mut self, tx: mpsc::Sender<HealthEvent>) -> Self {
        self.health_tx = Some(tx);
        self
    }

    pub fn coordinator_events(mut self, tx: mpsc::Sender<CoordinatorEvent>) -> Self {
        self.coordinator_tx = Some(tx);
        self
    }

    /// Build with an empty registry.
    pub fn build(self) -> Result<SwarmEngine> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(CapabilityRegistry::new(config.arbitration.min_match_score));
        let mut health = HealthMonitor::new(config.circuit_breaker_config(), Arc::clone(&registry));
        if let Some(tx) = self.health_tx {
            health = health.with_events(tx);
        }
        let health = Arc::new(health);
        let metrics = Arc::new(MetricsCollector::new().with_health(Arc::clone(&health)));
        let arbiter = Arc::new(
            ArbitrationEngine::new(
                Arc::clone(&registry),
                Arc::clone(&health),
                config.arbiter_config(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let mut coordinator = ExecutionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&arbiter),
            Arc::clone(&health),
            Arc::clone(&metrics),
            config.retry_policy(),
        );
        if let Some(tx) = self.coordinator_tx {
            coordinator = coordinator.with_events(tx);
        }
        let mut classifier = build_classifier(&config.classifier)?;
        if let Some(understanding) = self.understanding {
            classifier = classifier.with_understanding(understanding);
        }

        Ok(SwarmEngine {
            registry,
            health,
            metrics,
            arbiter,
            coordinator,
            classifier,
        })
    }

    /// Build and register every configured worker with an executor from `factory`.
    pub fn build_with_workers<F>(self, mut factory: F) -> Result<SwarmEngine>
    where
        F: FnMut(&WorkerDescriptor) -> Arc<dyn WorkerExecutor>,
    {
        let workers = self.config.workers.clone();
        let engine = self.build()?;
        for descriptor in workers {
            let executor = factory(&descriptor);
            engine.register(descriptor, executor)?;
        }
        Ok(engine)
    }
}

/// The routing engine: classifier, arbitration, and execution over one registry.
///
/// # Example
///
/// ```ignore
/// use swarm_router::config::Config;
/// use swarm_router::orchestration::{Request, SwarmEngine};
///
/// let engine = SwarmEngine::from_config(&Config::load()?, |descriptor| make_executor(descriptor))?;
/// let response = engine.handle(Request::new("write unit tests for the billing module")).await?;
/// println!("{}", response.output().unwrap_or_default());
/// ```
pub struct SwarmEngine {
    registry: Arc<CapabilityRegistry>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
    arbiter: Arc<ArbitrationEngine>,
    coordinator: ExecutionCoordinator,
    classifier: IntentClassifier,
}

impl SwarmEngine {
    pub fn builder(config: Config) -> SwarmEngineBuilder {
        SwarmEngineBuilder {
            config,
            understanding: None,
            health_tx: None,
            coordinator_tx: None,
        }
    }

    /// Engine with an empty registry.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Engine with the configured workers registered.
    pub fn from_config<F>(config: &Config, factory: F) -> Result<Self>
    where
        F: FnMut(&WorkerDescriptor) -> Arc<dyn WorkerExecutor>,
    {
        Self::builder(config.clone()).build_with_workers(factory)
    }

    pub fn register(&self, descriptor: WorkerDescriptor, executor: Arc<dyn WorkerExecutor>) -> Result<()> {
        self.registry.register(descriptor, executor)
    }

    pub fn deregister(&self, id: &WorkerId) -> Result<Worker> {
        self.registry.deregister(id)
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn arbiter(&self) -> &Arc<ArbitrationEngine> {
        &self.arbiter
    }

    pub fn classifier(&self) -> &IntentClassifier {
        &self.classifier
    }

    pub async fn classify(&self, text: &str) -> Result<Classification> {
        self.classifier.classify(text).await
    }

    /// Classify and arbitrate without executing.
    pub async fn plan(&self, request: &Request) -> Result<(Classification, ExecutionPlan)> {
        let classification = self.classify(&request.text).await?;
        let task = task_from_classification(
            &request.text,
            &classification,
            request.priority,
            request.deadline,
        );
        let plan = self.arbiter.arbitrate(&task)?;
        Ok((classification, plan))
    }

    /// Classify, arbitrate, and execute one request.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        self.handle_with_cancellation(request, CancellationToken::new())
            .await
    }

    pub async fn handle_with_cancellation(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response> {
        let (classification, plan) = match self.plan(&request).await {
            Ok(planned) => planned,
            Err(e) => {
                warn!(stage = e.stage(), error = %e, "request rejected");
                return Err(e);
            }
        };
        info!(
            intent = %classification.intent.name,
            strategy = %plan.strategy,
            priority = %request.priority,
            "request planned"
        );
        let report = self
            .coordinator
            .execute_with_cancellation(&plan, cancel)
            .await?;
        Ok(Response {
            classification,
            plan,
            report,
        })
    }

    /// Read-only snapshot of every worker.
    pub fn observe(&self) -> ObservabilitySnapshot {
        let workers = self
            .health
            .report()
            .into_iter()
            .map(|health| WorkerView {
                metrics: self.metrics.snapshot(&health.worker_id),
                health,
            })
            .collect();
        ObservabilitySnapshot {
            taken_at: Utc::now(),
            workers,
        }
    }
}
