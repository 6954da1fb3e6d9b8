use chrono::Utc;
use uuid::Uuid;

use crate::ad::{attr, Ad};
use crate::claim::Claim;
use crate::core::{SchedulerCore, SessionStep};
use crate::error::{Result, SchedError};
use crate::job::{Job, JobId};
use crate::negotiator::{
    build_clusters, MatchOffer, MatchmakerMessage, NegotiationHeader, NegotiatorAction,
    ResourceNegotiator,
};

impl SchedulerCore {
    /// Open a negotiation session for the submitter named in `header`.
    ///
    /// A header that fails validation, or names a pool the submitter has not
    /// flocked to yet, is refused before anything is changed.
    pub fn begin_negotiation(&mut self, header: NegotiationHeader) -> Result<Uuid> {
        if self.shutdown.is_some() {
            return Err(SchedError::ShuttingDown);
        }
        header.validate()?;
        if !self.flock.allows(&header.submitter, &header.pool) {
            return Err(SchedError::FlockRefused {
                submitter: header.submitter.clone(),
                pool: header.pool.clone(),
            });
        }

        if header.pool.is_empty() {
            self.flock.finish_round(&header.submitter);
            self.round += 1;
        }

        let significant = if header.significant_attributes.is_empty() {
            self.config.significant_attributes.clone()
        } else {
            header.significant_attributes.clone()
        };
        let now = Utc::now();
        let eligible: Vec<&Job> = self
            .store
            .jobs()
            .filter(|job| {
                job.owner == header.owner()
                    && job.is_runnable(now, self.round)
                    && job.allows_pool(&header.pool)
                    && header.admits_priority(job.priority)
                    && !self.is_matched(job.id)
                    && self.meets_pool_constraint(&header, job)
            })
            .collect();
        let clusters = build_clusters(eligible, &mut self.autoclusters, &significant);

        let negotiator = ResourceNegotiator::new(header, clusters)?;
        let session = negotiator.id();
        tracing::info!(
            session = %session,
            submitter = %negotiator.header().submitter,
            pool = %negotiator.header().pool,
            round = self.round,
            jobs = negotiator.remaining_jobs(),
            "Negotiation started"
        );
        self.sessions.insert(session, negotiator);
        Ok(session)
    }

    /// Feed one matchmaker message into a session.
    pub fn negotiation_message(
        &mut self,
        session: Uuid,
        message: MatchmakerMessage,
    ) -> Result<SessionStep> {
        let mut negotiator = self
            .sessions
            .remove(&session)
            .ok_or(SchedError::SessionNotFound(session))?;

        let actions = negotiator.resume(message, &*self);
        let mut step = SessionStep::default();
        let mut violation = None;
        for action in actions {
            match action {
                NegotiatorAction::Send(reply) => step.replies.push(reply),
                NegotiatorAction::Claim { job_id, offer } => {
                    match self.claim_match(job_id, offer, negotiator.header()) {
                        Ok(true) => negotiator.confirm_match(job_id),
                        Ok(false) => {
                            negotiator.forget_job(job_id);
                        }
                        Err(e) => {
                            violation.get_or_insert(e);
                        }
                    }
                }
                NegotiatorAction::End(outcome) => {
                    self.flock
                        .record_session(&outcome.submitter, outcome.summary.satisfied);
                    step.ended = true;
                }
            }
        }

        if !negotiator.is_ended() {
            self.sessions.insert(session, negotiator);
        }
        match violation {
            Some(e) => Err(e),
            None => Ok(step),
        }
    }

    pub fn abort_negotiation(&mut self, session: Uuid) {
        if let Some(mut negotiator) = self.sessions.remove(&session) {
            negotiator.abort();
            tracing::info!(session = %session, submitter = %negotiator.header().submitter, "Negotiation aborted");
        }
    }

    /// Start acquiring `offer` for `job_id`. Returns false when the job
    /// vanished before it could be claimed.
    fn claim_match(
        &mut self,
        job_id: JobId,
        offer: MatchOffer,
        header: &NegotiationHeader,
    ) -> Result<bool> {
        let Some(job) = self.store.get(job_id) else {
            tracing::debug!(job_id = %job_id, "Matched job vanished before claiming");
            return Ok(false);
        };
        let mut job_ad = job.full_ad();
        if !header.submitter_tag.is_empty() {
            job_ad.insert(attr::SUBMITTER_TAG, header.submitter_tag.clone());
        }
        let pslot = offer
            .match_ad
            .get_bool(attr::PARTITIONABLE_SLOT)
            .unwrap_or(false);
        let claim = Claim::new(
            offer.claim_id,
            offer.peer,
            job_id,
            offer.match_ad,
            job.owner.clone(),
            header.pool.clone(),
        )
        .with_pslot(pslot);
        self.acquirer
            .request_claim(&mut self.registry, claim, &job_ad)?;
        Ok(true)
    }

    fn meets_pool_constraint(&self, header: &NegotiationHeader, job: &Job) -> bool {
        match header.pool_constraint.as_deref() {
            None => true,
            Some(expr) => {
                self.evaluator
                    .eval_bool(expr, &job.full_ad(), &Ad::new())
                    == Some(true)
            }
        }
    }
}
