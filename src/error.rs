use thiserror::Error;

use crate::fsm::InvalidTransition;
use crate::processor::{Message, State};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid transition: {message} is not accepted in state {state}")]
    InvalidTransition { state: State, message: Message },

    #[error("No job loaded.")]
    NoJob,

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Part resolution failed: {0}")]
    PartResolution(String),

    #[error("Resource resolution failed: {0}")]
    ResourceResolution(String),

    #[error("Feeder error: {0}")]
    Feeder(String),

    #[error("Pick error: {0}")]
    Pick(String),

    #[error("Alignment error: {0}")]
    Alignment(String),

    #[error("Fiducial error: {0}")]
    Fiducial(String),

    #[error("Place error: {0}")]
    Place(String),

    #[error("Motion error: {0}")]
    Motion(String),

    #[error("Nozzle tip change error: {0}")]
    NozzleTipChange(String),

    #[error("Machine interlock tripped: {0}")]
    Interlock(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<InvalidTransition<State, Message>> for JobError {
    fn from(e: InvalidTransition<State, Message>) -> Self {
        JobError::InvalidTransition {
            state: e.state,
            message: e.message,
        }
    }
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            JobError::NoJob => ErrorKind::NoJob,
            JobError::InvalidJob(_) => ErrorKind::InvalidJob,
            JobError::PartResolution(_) => ErrorKind::PartResolution,
            JobError::ResourceResolution(_) => ErrorKind::ResourceResolution,
            JobError::Feeder(_) => ErrorKind::Feeder,
            JobError::Pick(_) => ErrorKind::Pick,
            JobError::Alignment(_) => ErrorKind::Alignment,
            JobError::Fiducial(_) => ErrorKind::Fiducial,
            JobError::Place(_) => ErrorKind::Place,
            JobError::Motion(_) => ErrorKind::Motion,
            JobError::NozzleTipChange(_) => ErrorKind::NozzleTipChange,
            JobError::Interlock(_) => ErrorKind::Interlock,
            JobError::Worker(_) => ErrorKind::Worker,
            JobError::Config(_) | JobError::Io(_) | JobError::Json(_) | JobError::Toml(_) => {
                ErrorKind::Config
            }
        }
    }
}

/// Classifies a job error for telemetry and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// The driving code sent a message the current state does not accept.
    InvalidTransition,
    NoJob,
    /// The job failed pre-flight validation.
    InvalidJob,
    PartResolution,
    ResourceResolution,
    Feeder,
    Pick,
    Alignment,
    Fiducial,
    Place,
    Motion,
    NozzleTipChange,
    /// The machine was changed outside the job processor.
    Interlock,
    Worker,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::NoJob => "NoJob",
            ErrorKind::InvalidJob => "InvalidJob",
            ErrorKind::PartResolution => "PartResolution",
            ErrorKind::ResourceResolution => "ResourceResolution",
            ErrorKind::Feeder => "Feeder",
            ErrorKind::Pick => "Pick",
            ErrorKind::Alignment => "Alignment",
            ErrorKind::Fiducial => "Fiducial",
            ErrorKind::Place => "Place",
            ErrorKind::Motion => "Motion",
            ErrorKind::NozzleTipChange => "NozzleTipChange",
            ErrorKind::Interlock => "Interlock",
            ErrorKind::Worker => "Worker",
            ErrorKind::Config => "Config",
        };
        write!(f, "{name}")
    }
}
