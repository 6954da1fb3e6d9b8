use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::ad::{attr, expand_macros, Ad};
use crate::admission::AdmissionTicket;
use crate::claim::{ClaimId, ClaimState};
use crate::core::{RecycledJob, SchedulerCore};
use crate::error::{Result, SchedError};
use crate::handler::{
    HandlerEvent, HandlerExit, HandlerId, HandlerRecord, HandlerSignal, HandlerState,
    LaunchRequest, PendingRecycle,
};
use crate::job::{JobId, JobStatus, PersistedClaim, Universe};
use crate::reconcile::{classify, ClaimAction, ExitClass, ExitContext, Reconciliation};

/// Exit classes after which a claim may take another job.
fn permits_reuse(class: ExitClass) -> bool {
    matches!(
        class,
        ExitClass::Completed
            | ExitClass::Requeue
            | ExitClass::NotStarted
            | ExitClass::Hold
            | ExitClass::Remove
    )
}

impl SchedulerCore {
    /// Queue a handler for `job_id` on `claim_id`.
    pub(super) fn start_handler(&mut self, claim_id: &ClaimId, job_id: JobId) {
        let universe = self
            .store
            .get(job_id)
            .map_or(Universe::Vanilla, |job| job.universe);
        let id = self
            .handlers
            .insert(HandlerRecord::new(job_id, claim_id.clone(), universe));
        if let Some(claim) = self.registry.get_mut(claim_id) {
            claim.handler = Some(id);
        }
        self.dispatch.enqueue(id);
        tracing::debug!(handler = %id, job_id = %job_id, claim = %claim_id, "Handler queued");
    }

    /// Launch queued handlers while admission and the throttle allow.
    pub(super) fn drain_dispatch(&mut self) {
        if self.shutdown.is_some() {
            return;
        }
        let now = Instant::now();
        loop {
            let Some(id) = self.dispatch.front() else {
                break;
            };
            if let Err(reason) = self.check_launch(id) {
                self.dispatch.remove(id);
                self.abandon_launch(id, &reason);
                continue;
            }
            let Some(ticket) = self.admission.try_acquire() else {
                break;
            };
            let Some(id) = self.dispatch.pop_ready(now) else {
                break;
            };
            self.launch(id, ticket);
        }
    }

    fn check_launch(&self, id: HandlerId) -> std::result::Result<(), String> {
        let record = self.handlers.get(id).ok_or("handler record missing")?;
        let claim = record
            .claim
            .as_ref()
            .and_then(|claim_id| self.registry.get(claim_id))
            .ok_or("claim went away")?;
        if claim.owner_closing {
            return Err("resource owner is closing the claim".to_string());
        }
        let job = self.store.get(record.job_id).ok_or("job left the queue")?;
        let now = Utc::now();
        if record.flags.is_reconnect {
            if job.status != JobStatus::Running {
                return Err(format!("job is {}", job.status));
            }
            let lease_valid = job
                .claim
                .as_ref()
                .is_some_and(|persisted| persisted.lease_expires_at > now);
            if !lease_valid {
                return Err("job lease expired".to_string());
            }
        } else if !job.is_runnable(now, self.round) {
            return Err(format!("job is {} and not runnable", job.status));
        }
        Ok(())
    }

    fn abandon_launch(&mut self, id: HandlerId, reason: &str) {
        let Some(mut record) = self.handlers.remove(id) else {
            return;
        };
        record.mark_exited();
        tracing::info!(handler = %id, job_id = %record.job_id, reason, "Launch abandoned");
        let Some(claim_id) = record.claim else {
            return;
        };
        match self.registry.get_mut(&claim_id) {
            Some(claim) => claim.handler = None,
            None => return,
        }
        if record.flags.is_reconnect {
            if let Some(job) = self.store.get_mut(record.job_id) {
                if job.status == JobStatus::Running {
                    job.set_status(JobStatus::Idle);
                    job.idle_reason = Some(format!("reconnect abandoned: {reason}"));
                    job.claim = None;
                }
            }
            self.registry.discard(&claim_id);
            self.commit();
        } else {
            self.registry.rebind(&claim_id, JobId::UNBOUND);
            self.seek_new_job(&claim_id);
        }
    }

    /// Mark `job_id` as running on `claim_id` with a fresh lease and return
    /// the expanded attributes its handler receives.
    fn bind_job_to_claim(
        &mut self,
        claim_id: &ClaimId,
        job_id: JobId,
        count_start: bool,
    ) -> Option<Ad> {
        let lease = self.lease_deadline();
        let claim = self.registry.get_mut(claim_id)?;
        claim.lease_expires_at = Some(lease);
        let persisted = PersistedClaim {
            claim_id: claim.id.as_secret_str().to_string(),
            peer: claim.peer.clone(),
            pool: claim.pool.clone(),
            match_ad: claim.match_ad.clone(),
            lease_expires_at: lease,
        };
        let resource_ad = claim.effective_ad();
        let peer = claim.peer.clone();

        let job = self.store.get_mut(job_id)?;
        if count_start {
            job.set_status(JobStatus::Running);
            job.num_starts += 1;
            job.idle_reason = None;
        }
        job.claim = Some(persisted);
        let mut job_ad = expand_macros(&job.full_ad(), &resource_ad);
        job_ad.insert(attr::REMOTE_HOST, peer);
        Some(job_ad)
    }

    fn launch(&mut self, id: HandlerId, ticket: AdmissionTicket) {
        let now = Instant::now();
        let Some(record) = self.handlers.get(id) else {
            return;
        };
        let job_id = record.job_id;
        let reconnect = record.flags.is_reconnect;
        let Some(claim_id) = record.claim.clone() else {
            return;
        };
        let delay_hint = self
            .store
            .get(job_id)
            .and_then(|job| job.ad.get_f64(attr::NEXT_JOB_START_DELAY));
        let Some(job_ad) = self.bind_job_to_claim(&claim_id, job_id, !reconnect) else {
            return;
        };
        self.registry.set_state(&claim_id, ClaimState::Active);

        if let Some(secs) = delay_hint.filter(|s| s.is_finite() && *s > 0.0) {
            let cap = self.config.throttle.max_next_job_start_delay().as_secs_f64();
            self.dispatch
                .set_delay_floor(now, Duration::from_secs_f64(secs.min(cap)));
        }

        let control = self.launcher.launch(LaunchRequest {
            handler: id,
            job_id,
            claim_id: claim_id.clone(),
            reconnect,
            job_ad,
        });
        if let Some(record) = self.handlers.get_mut(id) {
            record.state = HandlerState::Spawning;
            record.ticket = Some(ticket);
            record.control = Some(control);
            record.started_at = Some(now);
        }
        tracing::info!(handler = %id, job_id = %job_id, claim = %claim_id, reconnect, "Launching job handler");
        self.commit();
    }

    pub(super) fn on_handler_event(&mut self, event: HandlerEvent) {
        match event {
            HandlerEvent::Started { handler, pid } => {
                self.handlers.set_pid(handler, pid);
                if let Some(record) = self.handlers.get_mut(handler) {
                    if record.state == HandlerState::Spawning {
                        record.state = HandlerState::Running;
                    }
                }
                tracing::debug!(handler = %handler, pid, "Job handler running");
            }
            HandlerEvent::SpawnFailed { handler, error } => self.on_spawn_failed(handler, &error),
            HandlerEvent::Exited { handler, exit, .. } => self.on_handler_exit(handler, exit),
        }
    }

    fn on_spawn_failed(&mut self, id: HandlerId, error: &str) {
        let Some(mut record) = self.handlers.remove(id) else {
            return;
        };
        record.mark_exited();
        tracing::error!(handler = %id, job_id = %record.job_id, error, "Job handler failed to start");
        if record.flags.exit_already_handled {
            return;
        }
        if let Some(job) = self.store.get_mut(record.job_id) {
            if job.status == JobStatus::Running {
                job.set_status(JobStatus::Idle);
                job.idle_reason = Some(format!("job handler failed to start: {error}"));
                job.claim = None;
            }
        }
        if let Some(claim_id) = record.claim {
            if let Some(claim) = self.registry.get_mut(&claim_id) {
                claim.handler = None;
            }
            self.release_claim_now(&claim_id);
        }
        self.commit();
    }

    fn on_handler_exit(&mut self, id: HandlerId, exit: HandlerExit) {
        let Some(record) = self.handlers.get_mut(id) else {
            tracing::debug!(handler = %id, "Exit from unknown handler");
            return;
        };
        if !record.mark_exited() {
            return;
        }
        if record.flags.exit_already_handled {
            self.handlers.remove(id);
            tracing::debug!(handler = %id, "Reaped handler whose exit was already handled");
            return;
        }
        let job_id = record.job_id;
        let flags = record.flags;
        let class = classify(exit, flags, record.universe);
        let claim_id = record.claim.clone();

        let claim = claim_id.as_ref().and_then(|cid| self.registry.get(cid));
        let ctx = ExitContext {
            class,
            exit_code: exit.code,
            num_exceptions: claim.map_or(0, |c| c.num_exceptions),
            owner_closing: claim.is_some_and(|c| c.owner_closing),
            keep_claim_attributes: flags.keep_claim_attributes,
            round: self.round,
        };
        let reassign_to = claim.and_then(|c| c.reassign_to);

        let outcome = self
            .reconciler
            .reconcile(self.store.get_mut(job_id), ctx, Utc::now());
        self.handlers.remove(id);
        tracing::info!(
            handler = %id,
            job_id = %job_id,
            code = ?exit.code,
            signal = ?exit.signal,
            class = %class,
            status = ?outcome.job_status,
            action = ?outcome.claim_action,
            "Job handler exited"
        );

        if let Some(claim_id) = claim_id {
            self.settle_claim(&claim_id, &outcome, reassign_to);
        }
        self.commit();
    }

    /// Apply the claim half of a reconciled exit.
    fn settle_claim(
        &mut self,
        claim_id: &ClaimId,
        outcome: &Reconciliation,
        reassign_to: Option<JobId>,
    ) {
        let Some(claim) = self.registry.get_mut(claim_id) else {
            return;
        };
        claim.handler = None;
        claim.num_exceptions = outcome.num_exceptions;

        match outcome.claim_action {
            ClaimAction::ReleaseWithoutRpc | ClaimAction::KeepForReconnect => {
                self.registry.discard(claim_id);
            }
            _ if self.shutdown.is_some() => self.release_claim_now(claim_id),
            action => {
                if let Some(beneficiary) = reassign_to {
                    if self.hand_over(claim_id, beneficiary) {
                        return;
                    }
                }
                if action == ClaimAction::Release {
                    self.release_claim_now(claim_id);
                } else {
                    self.registry.set_state(claim_id, ClaimState::Claimed);
                    self.registry.rebind(claim_id, JobId::UNBOUND);
                    self.seek_new_job(claim_id);
                }
            }
        }
    }

    /// Take a queued handler off the dispatch queue before it ever ran.
    /// Returns the claim it was bound to.
    pub(super) fn cancel_queued_handler(&mut self, id: HandlerId) -> Option<ClaimId> {
        self.dispatch.remove(id);
        let mut record = self.handlers.remove(id)?;
        record.mark_exited();
        let claim_id = record.claim?;
        if let Some(claim) = self.registry.get_mut(&claim_id) {
            claim.handler = None;
        }
        tracing::debug!(handler = %id, job_id = %record.job_id, "Queued handler canceled");
        Some(claim_id)
    }

    pub(super) fn vacate_handler(&mut self, id: HandlerId, signal: HandlerSignal) {
        let Some(record) = self.handlers.get_mut(id) else {
            return;
        };
        record.flags.preempted = true;
        let delivered = record.signal(signal);
        record.flags.preempt_pending = !delivered;
        tracing::info!(handler = %id, job_id = %record.job_id, signal = ?signal, delivered, "Vacating job handler");
    }

    /// The handler that ran `previous` wants another job on the same claim.
    ///
    /// `previous` is reconciled with `exit_code` first. If the claim can
    /// take another job and one fits, the handler is rebound to it and must
    /// acknowledge within the recycle timeout.
    pub fn recycle_handler(
        &mut self,
        previous: JobId,
        exit_code: i32,
    ) -> Result<Option<RecycledJob>> {
        let record = self
            .handlers
            .find_by_job(previous)
            .ok_or(SchedError::HandlerNotFound(previous))?;
        let refuse = |reason: String| Err(SchedError::RecycleRefused(reason));
        if self.shutdown.is_some() {
            return refuse("scheduler is shutting down".to_string());
        }
        if !record.universe.supports_reuse() {
            return refuse(format!("{} universe does not reuse handlers", record.universe));
        }
        if !matches!(record.state, HandlerState::Spawning | HandlerState::Running) {
            return refuse(format!("handler is {}", record.state));
        }
        if record.flags.preempted {
            return refuse("handler is being vacated".to_string());
        }
        if record.pending_recycle.is_some() {
            return refuse("a recycled job is awaiting acknowledgment".to_string());
        }
        let hid = record.id;
        let flags = record.flags;
        let universe = record.universe;
        let Some(claim) = record.claim.as_ref().and_then(|id| self.registry.get(id)) else {
            return refuse("handler holds no claim".to_string());
        };
        if claim.state != ClaimState::Active {
            return refuse(format!("claim is {}", claim.state));
        }
        if claim.reassign_to.is_some() {
            return refuse("claim is promised to another job".to_string());
        }
        let claim_id = claim.id.clone();
        let ctx = ExitContext {
            class: classify(
                HandlerExit {
                    code: Some(exit_code),
                    signal: None,
                },
                flags,
                universe,
            ),
            exit_code: Some(exit_code),
            num_exceptions: claim.num_exceptions,
            owner_closing: claim.owner_closing,
            keep_claim_attributes: false,
            round: self.round,
        };
        let lease_valid = claim.lease_expires_at.map_or(true, |l| l > Utc::now());
        let (user, pool, resource_ad, rank) = (
            claim.user.clone(),
            claim.pool.clone(),
            claim.effective_ad(),
            claim.current_rank,
        );

        let outcome = self
            .reconciler
            .reconcile(self.store.get_mut(previous), ctx, Utc::now());
        if let Some(claim) = self.registry.get_mut(&claim_id) {
            claim.num_exceptions = outcome.num_exceptions;
        }
        tracing::info!(
            handler = %hid,
            job_id = %previous,
            code = exit_code,
            class = %outcome.class,
            status = ?outcome.job_status,
            "Recycling handler reconciled previous job"
        );

        let reusable = permits_reuse(outcome.class)
            && outcome.claim_action != ClaimAction::ReleaseWithoutRpc
            && lease_valid;
        let next = if reusable {
            self.find_runnable_job(&user, &pool, &resource_ad, Some(rank))
        } else {
            None
        };
        let recycled = match next {
            Some(next) => self.rebind_recycled(hid, &claim_id, next),
            None => {
                self.detach_handler(hid, &claim_id, outcome.claim_action, outcome.class);
                None
            }
        };
        self.commit();
        Ok(recycled)
    }

    fn rebind_recycled(
        &mut self,
        hid: HandlerId,
        claim_id: &ClaimId,
        next: JobId,
    ) -> Option<RecycledJob> {
        self.registry.rebind(claim_id, next);
        self.handlers.rebind(hid, next);
        let universe = self.store.get(next).map(|job| job.universe);
        let deadline = Instant::now() + self.config.recycle_ack_timeout();
        if let Some(record) = self.handlers.get_mut(hid) {
            record.pending_recycle = Some(PendingRecycle {
                job_id: next,
                deadline,
            });
            if let Some(universe) = universe {
                record.universe = universe;
            }
        }
        let job_ad = self.bind_job_to_claim(claim_id, next, true)?;
        tracing::info!(handler = %hid, job_id = %next, claim = %claim_id, "Handler recycled onto next job");
        Some(RecycledJob {
            job_id: next,
            job_ad,
        })
    }

    /// Cut a recycling handler loose from its claim. The process is left to
    /// exit on its own; only its reaping remains.
    fn detach_handler(
        &mut self,
        hid: HandlerId,
        claim_id: &ClaimId,
        action: ClaimAction,
        class: ExitClass,
    ) {
        if let Some(record) = self.handlers.get_mut(hid) {
            record.flags.exit_already_handled = true;
            record.claim = None;
            record.pending_recycle = None;
        }
        self.handlers.rebind(hid, JobId::UNBOUND);
        if let Some(claim) = self.registry.get_mut(claim_id) {
            claim.handler = None;
        }
        match action {
            ClaimAction::ReleaseWithoutRpc => {
                self.registry.discard(claim_id);
            }
            _ if permits_reuse(class) && self.shutdown.is_none() => {
                self.registry.set_state(claim_id, ClaimState::Claimed);
                self.registry.rebind(claim_id, JobId::UNBOUND);
                tracing::info!(claim = %claim_id, "No job to recycle onto, claim left idle");
            }
            _ => self.release_claim_now(claim_id),
        }
    }

    pub fn ack_recycle(&mut self, job_id: JobId) -> Result<()> {
        let record = self
            .handlers
            .find_by_job(job_id)
            .ok_or(SchedError::HandlerNotFound(job_id))?;
        let hid = record.id;
        if !record
            .pending_recycle
            .is_some_and(|pending| pending.job_id == job_id)
        {
            return Err(SchedError::RecycleRefused(format!(
                "no recycled job {job_id} awaiting acknowledgment"
            )));
        }
        if let Some(record) = self.handlers.get_mut(hid) {
            record.pending_recycle = None;
        }
        tracing::debug!(handler = %hid, job_id = %job_id, "Recycled job acknowledged");
        Ok(())
    }

    /// Take back recycled jobs whose handlers never acknowledged them.
    pub(super) fn expire_recycle_offers(&mut self, now: Instant) {
        let expired: Vec<(HandlerId, JobId, Option<ClaimId>)> = self
            .handlers
            .iter()
            .filter_map(|record| {
                record
                    .pending_recycle
                    .filter(|pending| pending.deadline <= now)
                    .map(|pending| (record.id, pending.job_id, record.claim.clone()))
            })
            .collect();
        for (hid, job_id, claim_id) in expired {
            tracing::warn!(handler = %hid, job_id = %job_id, "Recycled job was never acknowledged");
            if let Some(job) = self.store.get_mut(job_id) {
                if job.status == JobStatus::Running {
                    job.set_status(JobStatus::Idle);
                    job.idle_reason =
                        Some("job handler did not acknowledge the recycled job".to_string());
                    job.claim = None;
                }
            }
            self.vacate_handler(hid, HandlerSignal::Vacate);
            if let Some(claim_id) = claim_id {
                self.detach_handler(hid, &claim_id, ClaimAction::SeekNewJob, ExitClass::NotStarted);
            }
        }
    }
}
