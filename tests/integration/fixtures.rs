//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted executors (succeed, fail N times, sleep, record requests)
//! - Engines with a fixed worker roster

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use swarm_router::config::Config;
use swarm_router::core::worker::WorkerDescriptor;
use swarm_router::orchestration::{StepRequest, SwarmEngine, WorkerExecutor};
use swarm_router::{Error, Result};

/// Answers every step with `<worker>:<step name>`.
pub struct Succeed {
    pub worker: String,
    pub calls: AtomicU32,
}

impl Succeed {
    pub fn new(worker: &str) -> Arc<Self> {
        Arc::new(Self {
            worker: worker.to_string(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerExecutor for Succeed {
    async fn execute(&self, request: StepRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}:{}", self.worker, request.name))
    }
}

/// Answers like `Succeed` and keeps every request it received.
pub struct Recorder {
    worker: String,
    seen: Mutex<Vec<StepRequest>>,
}

impl Recorder {
    pub fn new(worker: &str) -> Arc<Self> {
        Arc::new(Self {
            worker: worker.to_string(),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<StepRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerExecutor for Recorder {
    async fn execute(&self, request: StepRequest) -> Result<String> {
        let output = format!("{}:{}", self.worker, request.name);
        self.seen.lock().unwrap().push(request);
        Ok(output)
    }
}

/// Fails the first `failures` calls, then succeeds.
pub struct FailTimes {
    failures: u32,
    calls: AtomicU32,
}

impl FailTimes {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    /// Never succeeds.
    pub fn always() -> Arc<Self> {
        Self::new(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerExecutor for FailTimes {
    async fn execute(&self, request: StepRequest) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(Error::Worker(format!("{} failed on call {}", request.name, call + 1)));
        }
        Ok(format!("{} recovered", request.name))
    }
}

/// Sleeps, tracking how many calls overlap.
pub struct Sleepy {
    delay: Duration,
    current: AtomicU32,
    peak: AtomicU32,
}

impl Sleepy {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            current: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        })
    }

    /// Highest number of calls seen in flight at once.
    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerExecutor for Sleepy {
    async fn execute(&self, request: StepRequest) -> Result<String> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("{} slept", request.name))
    }
}

/// A worker descriptor with one competency.
pub fn worker(id: &str, competency: &str, level: f64, max_concurrent: u32) -> WorkerDescriptor {
    WorkerDescriptor::new(id)
        .with_competency(competency, level)
        .with_max_concurrent(max_concurrent)
}

/// Config with retries made immediate.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.execution.base_delay_ms = 1;
    config.execution.max_delay_ms = 10;
    config
}

/// Engine over the given roster.
pub fn engine_with(config: Config, roster: Vec<(WorkerDescriptor, Arc<dyn WorkerExecutor>)>) -> SwarmEngine {
    let engine = SwarmEngine::new(config).expect("valid config");
    for (descriptor, executor) in roster {
        engine.register(descriptor, executor).expect("register worker");
    }
    engine
}
