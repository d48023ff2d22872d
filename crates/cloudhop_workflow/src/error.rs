use cloudhop_services::ServiceError;
use cloudhop_transfer::TransferError;
use thiserror::Error;

use crate::wait::WaitError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("image checksum mismatch: expected {expected}, destination reports {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("flavor {0} does not exist on the destination cloud")]
    FlavorNotFound(String),
    #[error("no destination network matches {0}")]
    NetworkNotFound(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("no migration request is loaded")]
    MissingRequest,
    #[error("destination instance has not been created yet")]
    MissingInstance,
    #[error("no image has been prepared for the instance")]
    MissingImage,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid workflow state: {0}")]
    InvalidState(String),
    #[error("checkpoint could not be recorded: {0}")]
    Checkpoint(String),
    #[error("step {step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<WorkflowError>,
    },
}

impl WorkflowError {
    /// The fault underneath any step context.
    pub fn root(&self) -> &WorkflowError {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the innermost failing step, when known.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::Step { step, source } => source.failed_step().or(Some(step.as_str())),
            _ => None,
        }
    }
}
