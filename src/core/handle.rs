use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::claim::ClaimId;
use crate::core::{Command, RecycledJob, SessionStep, StatusReport};
use crate::error::{Result, SchedError};
use crate::job::{Job, JobId};
use crate::negotiator::{MatchmakerMessage, NegotiationHeader};

/// Cloneable front door to a running [`SchedulerCore`](crate::core::SchedulerCore).
///
/// Commands are queued on a bounded channel. A full channel is reported as
/// [`SchedError::QueueFull`] straight away rather than waiting; a core that
/// has stopped is reported as [`SchedError::CoreUnavailable`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.try_send(build(reply_tx)).map_err(|e| match e {
            TrySendError::Full(_) => SchedError::QueueFull,
            TrySendError::Closed(_) => SchedError::CoreUnavailable,
        })?;
        reply_rx.await.map_err(|_| SchedError::CoreUnavailable)?
    }

    pub async fn begin_negotiation(&self, header: NegotiationHeader) -> Result<Uuid> {
        self.call(|reply| Command::BeginNegotiation { header, reply })
            .await
    }

    pub async fn negotiation_message(
        &self,
        session: Uuid,
        message: MatchmakerMessage,
    ) -> Result<SessionStep> {
        self.call(|reply| Command::NegotiationMessage {
            session,
            message,
            reply,
        })
        .await
    }

    /// Drop a session whose stream went away. Best effort.
    pub fn abort_negotiation(&self, session: Uuid) {
        if self
            .tx
            .try_send(Command::AbortNegotiation { session })
            .is_err()
        {
            tracing::warn!(session = %session, "Could not deliver negotiation abort");
        }
    }

    pub async fn release_claim(&self, claim_id: ClaimId) -> Result<bool> {
        self.call(|reply| Command::ReleaseClaim { claim_id, reply })
            .await
    }

    pub async fn reassign_slot(&self, beneficiary: JobId, victims: Vec<JobId>) -> Result<()> {
        self.call(|reply| Command::ReassignSlot {
            beneficiary,
            victims,
            reply,
        })
        .await
    }

    pub async fn recycle_handler(
        &self,
        previous: JobId,
        exit_code: i32,
    ) -> Result<Option<RecycledJob>> {
        self.call(|reply| Command::RecycleHandler {
            previous,
            exit_code,
            reply,
        })
        .await
    }

    pub async fn ack_recycle(&self, job_id: JobId) -> Result<()> {
        self.call(|reply| Command::AckRecycle { job_id, reply })
            .await
    }

    pub async fn submit_job(&self, job: Job) -> Result<JobId> {
        self.call(|reply| Command::SubmitJob {
            job: Box::new(job),
            reply,
        })
        .await
    }

    pub async fn hold_job(&self, job_id: JobId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.call(|reply| Command::HoldJob {
            job_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn remove_job(&self, job_id: JobId) -> Result<()> {
        self.call(|reply| Command::RemoveJob { job_id, reply })
            .await
    }

    pub async fn purge_job(&self, job_id: JobId) -> Result<()> {
        self.call(|reply| Command::PurgeJob { job_id, reply })
            .await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.call(|reply| Command::Status { reply }).await
    }
}
