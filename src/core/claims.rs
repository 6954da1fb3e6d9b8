use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Instant;

use crate::acquirer::{ClaimEvent, Leftover, Resolution};
use crate::ad::{attr, Ad};
use crate::claim::{Claim, ClaimId, ClaimState};
use crate::core::SchedulerCore;
use crate::error::{Result, SchedError};
use crate::handler::{HandlerSignal, HandlerState};
use crate::job::{Job, JobId, JobStatus};

impl SchedulerCore {
    pub(super) fn on_claim_event(&mut self, event: ClaimEvent) {
        let resolution = self.acquirer.on_claim_result(&mut self.registry, event);
        match resolution {
            Resolution::Granted {
                claim_id,
                job_id,
                leftovers,
            } => {
                let parent = self
                    .registry
                    .get(&claim_id)
                    .map(|c| (c.peer.clone(), c.user.clone(), c.pool.clone(), c.owner_closing));
                let Some((peer, user, pool, owner_closing)) = parent else {
                    return;
                };
                if self.shutdown.is_some() || owner_closing {
                    self.release_claim_now(&claim_id);
                } else {
                    self.attach_job(&claim_id, job_id);
                }
                for leftover in leftovers {
                    if self.shutdown.is_some() {
                        tracing::info!(claim = %leftover.claim_id, "Ignoring leftover resource during shutdown");
                        continue;
                    }
                    self.claim_leftover(&peer, &user, &pool, leftover);
                }
            }
            Resolution::Dropped { job_id, reason } => {
                tracing::debug!(job_id = %job_id, reason = %reason, "Job returned to the runnable pool");
            }
            Resolution::Stale => {}
        }
    }

    /// Put a freshly claimed resource to work on its job, or on another one
    /// if that job is no longer runnable.
    fn attach_job(&mut self, claim_id: &ClaimId, job_id: JobId) {
        let runnable = self
            .store
            .get(job_id)
            .is_some_and(|job| job.is_runnable(Utc::now(), self.round));
        if runnable {
            self.start_handler(claim_id, job_id);
        } else {
            tracing::info!(claim = %claim_id, job_id = %job_id, "Matched job no longer runnable");
            self.registry.rebind(claim_id, JobId::UNBOUND);
            self.seek_new_job(claim_id);
        }
    }

    /// A sub-resource carved out next to a granted claim gets its own
    /// acquisition, for whichever job of the same submitter fits it.
    fn claim_leftover(&mut self, peer: &str, user: &str, pool: &str, leftover: Leftover) {
        let Some(job_id) = self.find_runnable_job(user, pool, &leftover.match_ad, None) else {
            tracing::info!(claim = %leftover.claim_id, peer, "No runnable job for leftover resource");
            return;
        };
        let Some(job) = self.store.get(job_id) else {
            return;
        };
        let job_ad = job.full_ad();
        let claim = Claim::new(leftover.claim_id, peer, job_id, leftover.match_ad, user, pool)
            .with_pslot(true);
        if let Err(e) = self
            .acquirer
            .request_claim(&mut self.registry, claim, &job_ad)
        {
            tracing::warn!(job_id = %job_id, error = %e, "Could not claim leftover resource");
        }
    }

    /// Give an idle claim the best runnable job it can take.
    pub(super) fn seek_new_job(&mut self, claim_id: &ClaimId) {
        if self.shutdown.is_some() {
            self.release_claim_now(claim_id);
            return;
        }
        let Some(claim) = self.registry.get(claim_id) else {
            return;
        };
        if claim.owner_closing {
            self.registry.remove(claim_id);
            return;
        }
        let found = self.find_runnable_job(&claim.user, &claim.pool, &claim.effective_ad(), None);
        match found {
            Some(job_id) => {
                tracing::info!(claim = %claim_id, job_id = %job_id, "Claim picked up another job");
                self.registry.rebind(claim_id, job_id);
                self.start_handler(claim_id, job_id);
            }
            None => {
                tracing::debug!(claim = %claim_id, "No runnable job for claim, leaving it idle");
            }
        }
    }

    /// Highest-priority runnable job of `owner` that is free, may run in
    /// `pool` and whose requirements accept `resource_ad`. With `min_rank`,
    /// the resource must rank the job at least that high.
    pub(super) fn find_runnable_job(
        &self,
        owner: &str,
        pool: &str,
        resource_ad: &Ad,
        min_rank: Option<f64>,
    ) -> Option<JobId> {
        let now = Utc::now();
        self.store
            .jobs()
            .filter(|job| {
                job.owner == owner
                    && job.is_runnable(now, self.round)
                    && job.allows_pool(pool)
                    && !self.is_matched(job.id)
                    && self.requirements_met(job, resource_ad)
                    && min_rank.map_or(true, |min| self.resource_rank(resource_ad, job) >= min)
            })
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
            .map(|job| job.id)
    }

    fn requirements_met(&self, job: &Job, resource_ad: &Ad) -> bool {
        match job.ad.get_str(attr::REQUIREMENTS) {
            None => true,
            Some(expr) => self.evaluator.eval_bool(expr, &job.full_ad(), resource_ad) == Some(true),
        }
    }

    fn resource_rank(&self, resource_ad: &Ad, job: &Job) -> f64 {
        match resource_ad.get_str(attr::RANK) {
            Some(expr) => self
                .evaluator
                .eval_number(expr, resource_ad, &job.full_ad())
                .unwrap_or(0.0),
            None => resource_ad.get_f64(attr::RANK).unwrap_or(0.0),
        }
    }

    /// Unregister a claim, sending a release RPC unless it never left
    /// `Limbo` or its owner is already closing it.
    pub(super) fn release_claim_now(&mut self, claim_id: &ClaimId) {
        if let Some(claim) = self.registry.get_mut(claim_id) {
            if claim.state != ClaimState::Limbo {
                claim.needs_release = true;
            }
        }
        self.registry.remove(claim_id);
    }

    /// The resource owner revoked `claim_id`. Returns whether the claim was
    /// known.
    ///
    /// A running handler is vacated and the claim goes away once it exits,
    /// without a release RPC. A pending acquisition is canceled.
    pub fn release_claim(&mut self, claim_id: &ClaimId) -> Result<bool> {
        let Some(claim) = self.registry.get_mut(claim_id) else {
            tracing::debug!(claim = %claim_id, "Release for unknown claim");
            return Ok(false);
        };
        claim.owner_closing = true;
        let state = claim.state;
        let handler = claim.handler;
        tracing::info!(claim = %claim_id, state = %state, "Resource owner released claim");

        if state == ClaimState::Limbo {
            if !self.acquirer.cancel(claim_id) {
                self.registry.discard(claim_id);
            }
            return Ok(true);
        }
        match handler {
            Some(hid) => {
                let queued = self
                    .handlers
                    .get(hid)
                    .is_some_and(|h| h.state == HandlerState::Queued);
                if queued {
                    self.cancel_queued_handler(hid);
                    self.registry.remove(claim_id);
                } else {
                    self.vacate_handler(hid, HandlerSignal::Vacate);
                }
            }
            None => {
                self.registry.remove(claim_id);
            }
        }
        Ok(true)
    }

    /// Vacate `victims` and hand the first victim's claim to `beneficiary`
    /// once it is free.
    ///
    /// Everything is checked before anything changes: a rejected request
    /// leaves every claim and handler as it was.
    pub fn reassign_slot(&mut self, beneficiary: JobId, victims: &[JobId]) -> Result<()> {
        if victims.is_empty() {
            return Err(SchedError::InvalidReassign("no victims named".to_string()));
        }
        let job = self
            .store
            .get(beneficiary)
            .ok_or(SchedError::JobNotFound(beneficiary))?;
        if job.status != JobStatus::Idle {
            return Err(SchedError::InvalidReassign(format!(
                "beneficiary {beneficiary} is {}, not idle",
                job.status
            )));
        }
        if self.is_matched(beneficiary) {
            return Err(SchedError::InvalidReassign(format!(
                "beneficiary {beneficiary} is already matched"
            )));
        }
        let owner = job.owner.clone();

        let mut seen = HashSet::new();
        let mut plan = Vec::new();
        for &victim in victims.iter().filter(|v| seen.insert(**v)) {
            if victim == beneficiary {
                return Err(SchedError::InvalidReassign(format!(
                    "job {victim} cannot be its own victim"
                )));
            }
            let job = self
                .store
                .get(victim)
                .ok_or(SchedError::JobNotFound(victim))?;
            if job.status != JobStatus::Running {
                return Err(SchedError::InvalidReassign(format!(
                    "victim {victim} is {}, not running",
                    job.status
                )));
            }
            if job.owner != owner {
                return Err(SchedError::InvalidReassign(format!(
                    "victim {victim} belongs to {}, not {owner}",
                    job.owner
                )));
            }
            let record = self
                .handlers
                .find_by_job(victim)
                .filter(|r| matches!(r.state, HandlerState::Spawning | HandlerState::Running))
                .ok_or_else(|| {
                    SchedError::InvalidReassign(format!("victim {victim} has no running handler"))
                })?;
            if record.flags.preempted {
                return Err(SchedError::InvalidReassign(format!(
                    "victim {victim} is already being vacated"
                )));
            }
            let claim = record
                .claim
                .as_ref()
                .and_then(|id| self.registry.get(id))
                .filter(|c| c.state == ClaimState::Active)
                .ok_or_else(|| {
                    SchedError::InvalidReassign(format!("victim {victim} holds no active claim"))
                })?;
            if claim.reassign_to.is_some() {
                return Err(SchedError::InvalidReassign(format!(
                    "claim of victim {victim} is already promised to another job"
                )));
            }
            plan.push((record.id, claim.id.clone()));
        }

        if let Some((_, claim_id)) = plan.first() {
            if let Some(claim) = self.registry.get_mut(claim_id) {
                claim.reassign_to = Some(beneficiary);
            }
        }
        for (hid, _) in &plan {
            self.vacate_handler(*hid, HandlerSignal::Vacate);
        }
        tracing::info!(beneficiary = %beneficiary, victims = plan.len(), "Slot reassignment started");
        Ok(())
    }

    /// Move a claim whose handler just exited onto the job it was promised
    /// to. Returns false if that job can no longer take it.
    pub(super) fn hand_over(&mut self, claim_id: &ClaimId, beneficiary: JobId) -> bool {
        if let Some(claim) = self.registry.get_mut(claim_id) {
            claim.reassign_to = None;
        }
        let available = self
            .store
            .get(beneficiary)
            .is_some_and(|job| job.status == JobStatus::Idle)
            && self.registry.find_by_job(beneficiary).is_none()
            && self.handlers.find_by_job(beneficiary).is_none();
        if !available {
            tracing::info!(claim = %claim_id, beneficiary = %beneficiary, "Reassign beneficiary no longer idle");
            return false;
        }
        self.registry.set_state(claim_id, ClaimState::Claimed);
        self.registry.rebind(claim_id, beneficiary);
        tracing::info!(claim = %claim_id, beneficiary = %beneficiary, "Claim handed to reassign beneficiary");
        self.start_handler(claim_id, beneficiary);
        true
    }

    pub(super) fn expire_limbo_claims(&mut self, now: Instant) {
        let timeout = self.config.request_claim_timeout();
        let expired = self.acquirer.expire_limbo(&self.registry, now, timeout);
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Canceled claim requests past their deadline");
        }
    }

    /// Offer idle claims another job; release the ones idle for too long.
    pub(super) fn sweep_idle_claims(&mut self, now: Instant) {
        let idle: Vec<ClaimId> = self
            .registry
            .iter()
            .filter(|c| c.is_idle())
            .map(|c| c.id.clone())
            .collect();
        let timeout = self.config.claim_idle_timeout();
        for claim_id in idle {
            self.seek_new_job(&claim_id);
            let expired = self.registry.get(&claim_id).is_some_and(|c| {
                c.is_idle() && now.saturating_duration_since(c.entered_state_at) >= timeout
            });
            if expired {
                tracing::info!(claim = %claim_id, "Releasing idle claim");
                self.release_claim_now(&claim_id);
            }
        }
    }

    pub(super) fn lease_deadline(&self) -> DateTime<Utc> {
        let lease = ChronoDuration::from_std(self.config.job_lease_duration())
            .unwrap_or_else(|_| ChronoDuration::days(365));
        Utc::now() + lease
    }

    /// Extend the lease of every active claim, on the claim and on the job.
    pub(super) fn refresh_leases(&mut self) {
        let expires = self.lease_deadline();
        let active: Vec<(ClaimId, JobId)> = self
            .registry
            .iter()
            .filter(|c| c.state == ClaimState::Active)
            .map(|c| (c.id.clone(), c.job_id))
            .collect();
        for (claim_id, job_id) in active {
            if let Some(claim) = self.registry.get_mut(&claim_id) {
                claim.lease_expires_at = Some(expires);
            }
            if let Some(persisted) = self
                .store
                .get_mut(job_id)
                .and_then(|job| job.claim.as_mut())
            {
                persisted.lease_expires_at = expires;
            }
        }
    }
}
