use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::ad::Ad;
use crate::claim::ClaimId;
use crate::error::Result;
use crate::job::{Job, JobId};
use crate::negotiator::{MatchmakerMessage, NegotiationHeader, ScheddMessage};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests carried from a [`SchedulerHandle`](crate::core::SchedulerHandle)
/// into the core's event loop.
#[derive(Debug)]
pub enum Command {
    BeginNegotiation {
        header: NegotiationHeader,
        reply: Reply<Uuid>,
    },
    NegotiationMessage {
        session: Uuid,
        message: MatchmakerMessage,
        reply: Reply<SessionStep>,
    },
    AbortNegotiation {
        session: Uuid,
    },
    ReleaseClaim {
        claim_id: ClaimId,
        reply: Reply<bool>,
    },
    ReassignSlot {
        beneficiary: JobId,
        victims: Vec<JobId>,
        reply: Reply<()>,
    },
    RecycleHandler {
        previous: JobId,
        exit_code: i32,
        reply: Reply<Option<RecycledJob>>,
    },
    AckRecycle {
        job_id: JobId,
        reply: Reply<()>,
    },
    SubmitJob {
        job: Box<Job>,
        reply: Reply<JobId>,
    },
    HoldJob {
        job_id: JobId,
        reason: String,
        reply: Reply<()>,
    },
    RemoveJob {
        job_id: JobId,
        reply: Reply<()>,
    },
    PurgeJob {
        job_id: JobId,
        reply: Reply<()>,
    },
    Status {
        reply: Reply<StatusReport>,
    },
}

/// Messages to send back to the matchmaker after one inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStep {
    pub replies: Vec<ScheddMessage>,
    /// The session is over; nothing further will be accepted for it.
    pub ended: bool,
}

/// The job a recycled handler should run next.
#[derive(Debug, Clone, PartialEq)]
pub struct RecycledJob {
    pub job_id: JobId,
    pub job_ad: Ad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Vacate handlers and keep their claims for a later reconnect.
    Graceful,
    /// Kill handlers outright.
    Fast,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub claims_limbo: usize,
    pub claims_claimed: usize,
    pub claims_active: usize,
    pub handlers_queued: usize,
    pub handlers_running: usize,
    pub jobs_idle: usize,
    pub jobs_running: usize,
    pub jobs_held: usize,
    pub jobs_completed: usize,
    pub negotiation_sessions: usize,
    pub negotiation_round: u64,
    pub max_jobs_to_offer: usize,
}
