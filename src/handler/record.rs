use std::fmt;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::admission::AdmissionTicket;
use crate::claim::ClaimId;
use crate::job::{JobId, Universe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Queued,
    Spawning,
    Running,
    Exited,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerState::Queued => write!(f, "queued"),
            HandlerState::Spawning => write!(f, "spawning"),
            HandlerState::Running => write!(f, "running"),
            HandlerState::Exited => write!(f, "exited"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerFlags {
    /// The scheduler asked the handler to vacate.
    pub preempted: bool,
    /// A vacate has been decided but not yet delivered.
    pub preempt_pending: bool,
    /// Re-attaching to a job left running by a previous scheduler instance.
    pub is_reconnect: bool,
    /// Exit bookkeeping already ran; the OS exit only needs to be reaped.
    pub exit_already_handled: bool,
    /// Leave the claim attributes on the job so a later instance can
    /// reconnect.
    pub keep_claim_attributes: bool,
}

/// Control messages delivered to a running handler process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerSignal {
    /// Ask the handler to wind down and hand the job back.
    Vacate,
    /// Kill the process outright.
    Kill,
}

/// A recycle offer waiting for the handler's acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRecycle {
    pub job_id: JobId,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct HandlerRecord {
    pub id: HandlerId,
    /// 0 until the process has been spawned.
    pub pid: u32,
    pub job_id: JobId,
    /// `None` while the claim is being torn down underneath the handler.
    pub claim: Option<ClaimId>,
    pub universe: Universe,
    pub state: HandlerState,
    pub flags: HandlerFlags,
    pub ticket: Option<AdmissionTicket>,
    pub control: Option<mpsc::UnboundedSender<HandlerSignal>>,
    pub pending_recycle: Option<PendingRecycle>,
    pub enqueued_at: Instant,
    pub started_at: Option<Instant>,
}

impl HandlerRecord {
    pub fn new(job_id: JobId, claim: ClaimId, universe: Universe) -> Self {
        Self {
            id: HandlerId(0),
            pid: 0,
            job_id,
            claim: Some(claim),
            universe,
            state: HandlerState::Queued,
            flags: HandlerFlags::default(),
            ticket: None,
            control: None,
            pending_recycle: None,
            enqueued_at: Instant::now(),
            started_at: None,
        }
    }

    pub fn reconnect(mut self) -> Self {
        self.flags.is_reconnect = true;
        self
    }

    /// Enter `Exited`. Returns false if the record had already exited.
    pub fn mark_exited(&mut self) -> bool {
        if self.state == HandlerState::Exited {
            return false;
        }
        self.state = HandlerState::Exited;
        self.ticket = None;
        self.control = None;
        true
    }

    /// Deliver a control signal if the process is up. Returns whether a
    /// process was there to receive it.
    pub fn signal(&self, signal: HandlerSignal) -> bool {
        match &self.control {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionControl;

    #[test]
    fn exited_is_entered_once() {
        let mut record = HandlerRecord::new(JobId::new(1, 0), ClaimId::new("c"), Universe::Vanilla);
        assert_eq!(record.state, HandlerState::Queued);
        assert!(record.mark_exited());
        assert!(!record.mark_exited());
    }

    #[test]
    fn exit_returns_admission_ticket() {
        let admission = AdmissionControl::new(1);
        let mut record = HandlerRecord::new(JobId::new(1, 0), ClaimId::new("c"), Universe::Vanilla);
        record.ticket = admission.try_acquire();
        assert_eq!(admission.available(), 0);
        record.mark_exited();
        assert_eq!(admission.available(), 1);
    }

    #[test]
    fn signal_without_process_is_not_delivered() {
        let record = HandlerRecord::new(JobId::new(1, 0), ClaimId::new("c"), Universe::Vanilla);
        assert!(!record.signal(HandlerSignal::Vacate));
    }
}
