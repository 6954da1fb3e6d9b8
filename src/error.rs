use thiserror::Error;
use uuid::Uuid;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("Duplicate claim id: {0}")]
    DuplicateClaim(String),

    #[error("Claim not found: {0}")]
    ClaimNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("No handler for job {0}")]
    HandlerNotFound(JobId),

    #[error("Negotiation session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Malformed negotiation header: {0}")]
    MalformedHeader(String),

    #[error("Pool {pool:?} is beyond the flock level of submitter {submitter}")]
    FlockRefused { submitter: String, pool: String },

    #[error("Invalid reassign request: {0}")]
    InvalidReassign(String),

    #[error("Recycle refused: {0}")]
    RecycleRefused(String),

    #[error("Job {job} is {status}, cannot {action}")]
    InvalidJobState {
        job: JobId,
        status: crate::job::JobStatus,
        action: &'static str,
    },

    #[error("Job queue at capacity")]
    QueueFull,

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Scheduler core unavailable")]
    CoreUnavailable,

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedError {
    /// Protocol violations are reported to the remote caller; everything else
    /// is recovered locally.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SchedError::DuplicateClaim(_)
                | SchedError::MalformedHeader(_)
                | SchedError::InvalidReassign(_)
                | SchedError::FlockRefused { .. }
                | SchedError::RecycleRefused(_)
        )
    }
}

impl From<SchedError> for tonic::Status {
    fn from(err: SchedError) -> Self {
        let message = err.to_string();
        match err {
            SchedError::MalformedHeader(_) | SchedError::DuplicateClaim(_) => {
                tonic::Status::invalid_argument(message)
            }
            SchedError::InvalidReassign(_)
            | SchedError::RecycleRefused(_)
            | SchedError::FlockRefused { .. }
            | SchedError::InvalidJobState { .. } => tonic::Status::failed_precondition(message),
            SchedError::JobNotFound(_)
            | SchedError::ClaimNotFound(_)
            | SchedError::HandlerNotFound(_)
            | SchedError::SessionNotFound(_) => tonic::Status::not_found(message),
            SchedError::QueueFull => tonic::Status::resource_exhausted(message),
            SchedError::ShuttingDown | SchedError::CoreUnavailable => {
                tonic::Status::unavailable(message)
            }
            SchedError::GrpcError(status) => status,
            _ => tonic::Status::internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedError>;
