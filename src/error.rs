use thiserror::Error;

use crate::core::plan::PlanReport;
use crate::core::worker::WorkerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No intent cleared the minimum confidence of {min:.2} (best: {best:?})")]
    LowConfidence { min: f64, best: Option<String> },

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("No eligible worker for competencies: {}", unmet.join(", "))]
    NoEligibleWorker { unmet: Vec<String> },

    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Worker {id} is at capacity (max: {max})")]
    CapacityExceeded { id: WorkerId, max: u32 },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Step {step} failed on {worker}: {cause}")]
    StepFailed {
        step: String,
        worker: WorkerId,
        cause: String,
    },

    #[error("Step {step} timed out on {worker} after {timeout:?}")]
    StepTimedOut {
        step: String,
        worker: WorkerId,
        timeout: std::time::Duration,
    },

    #[error("Invalid step transition from {from} to {to}")]
    InvalidStepTransition { from: String, to: String },

    #[error("Plan failed: {}", report.failure_summary())]
    PlanFailed { report: Box<PlanReport> },

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::LowConfidence { .. } | Error::Classification(_) => "classification",
            Error::NoEligibleWorker { .. } => "arbitration",
            Error::UnknownWorker(_)
            | Error::DuplicateWorker(_)
            | Error::CapacityExceeded { .. } => "registry",
            Error::Worker(_)
            | Error::StepFailed { .. }
            | Error::StepTimedOut { .. }
            | Error::InvalidStepTransition { .. }
            | Error::PlanFailed { .. }
            | Error::Cancelled => "execution",
            Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::NoHomeDir
            | Error::Validation(_) => "configuration",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
