use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::worker::WorkerDescriptor;
use crate::orchestration::arbiter::{ArbiterConfig, DEFAULT_STEP_TIMEOUT_SECS};
use crate::orchestration::classifier::{EntityPattern, IntentPattern, DEFAULT_MIN_CONFIDENCE};
use crate::orchestration::coordinator::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY_MS,
};
use crate::orchestration::health::{
    CircuitBreakerConfig, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT_SECS,
};
use crate::orchestration::registry::DEFAULT_MIN_MATCH_SCORE;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationSection {
    pub min_match_score: f64,
    pub load_aware_tie_break: bool,
}

impl Default for ArbitrationSection {
    fn default() -> Self {
        Self {
            min_match_score: DEFAULT_MIN_MATCH_SCORE,
            load_aware_tie_break: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub min_confidence: f64,
    pub use_builtin_patterns: bool,
    /// Checked before the built-in table; a same-named entry replaces the built-in.
    pub intents: Vec<IntentPattern>,
    pub entities: Vec<EntityPattern>,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            use_builtin_patterns: true,
            intents: Vec::new(),
            entities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub step_timeout_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_secs: DEFAULT_RESET_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub arbitration: ArbitrationSection,
    #[serde(default)]
    pub classifier: ClassifierSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub workers: Vec<WorkerDescriptor>,
}

impl Config {
    pub fn swarm_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".swarm"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join("swarm.toml"))
    }

    /// Load `~/.swarm/swarm.toml`, or defaults if it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let config = Self::from_toml_str(&fs::read_to_string(path)?)?;
        debug!(
            workers = config.workers.len(),
            intents = config.classifier.intents.len(),
            "config loaded"
        );
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn validate(&self) -> Result<()> {
        unit_interval("arbitration.min_match_score", self.arbitration.min_match_score)?;
        unit_interval("classifier.min_confidence", self.classifier.min_confidence)?;

        let exec = &self.execution;
        if exec.max_attempts == 0 {
            return Err(invalid("execution.max_attempts must be at least 1"));
        }
        if !exec.backoff_multiplier.is_finite() || exec.backoff_multiplier < 1.0 {
            return Err(invalid("execution.backoff_multiplier must be at least 1.0"));
        }
        if exec.max_delay_ms < exec.base_delay_ms {
            return Err(invalid("execution.max_delay_ms must not be below base_delay_ms"));
        }
        if exec.step_timeout_secs == 0 {
            return Err(invalid("execution.step_timeout_secs must be positive"));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be at least 1"));
        }

        for worker in &self.workers {
            worker.validate()?;
        }
        for worker in &self.workers {
            if let Some(missing) = worker
                .backups
                .iter()
                .find(|b| !self.workers.iter().any(|w| &w.id == *b))
            {
                return Err(Error::Validation(format!(
                    "worker {} lists unknown backup {}",
                    worker.id, missing
                )));
            }
        }
        for (i, worker) in self.workers.iter().enumerate() {
            if self.workers[..i].iter().any(|w| w.id == worker.id) {
                return Err(Error::DuplicateWorker(worker.id.clone()));
            }
        }
        Ok(())
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            min_match_score: self.arbitration.min_match_score,
            load_aware_tie_break: self.arbitration.load_aware_tie_break,
            default_step_timeout: Duration::from_secs(self.execution.step_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.execution.max_attempts,
            base_delay: Duration::from_millis(self.execution.base_delay_ms),
            multiplier: self.execution.backoff_multiplier,
            max_delay: Duration::from_millis(self.execution.max_delay_ms),
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_breaker.reset_timeout_secs),
        }
    }
}

fn invalid(message: &str) -> Error {
    Error::Validation(message.to_string())
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Validation(format!("{} must be within [0, 1], got {}", name, value)))
    }
}
