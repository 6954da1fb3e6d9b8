use std::collections::HashMap;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::job::JobId;
use crate::negotiator::{
    MatchOffer, MatchmakerMessage, NegotiationHeader, NegotiationSummary, RequestAd,
    ResourceRequestCluster, ScheddMessage,
};

/// Whether a job may take an offered match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Accept,
    /// This job cannot take it; try the next one in the cluster.
    Skip,
    /// Nothing more can be started this round.
    SkipAll,
}

/// What the negotiator needs from the scheduler while a session runs.
pub trait NegotiationContext {
    fn max_jobs_to_offer(&self) -> usize;

    fn skip_job(&self, job_id: JobId, offer: &MatchOffer) -> SkipDecision;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationOutcome {
    pub session: Uuid,
    pub submitter: String,
    pub pool: String,
    pub summary: NegotiationSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorAction {
    Send(ScheddMessage),
    /// Acquire `offer` for `job_id`. The caller reports back through
    /// [`ResourceNegotiator::confirm_match`] or
    /// [`ResourceNegotiator::forget_job`].
    Claim { job_id: JobId, offer: MatchOffer },
    End(NegotiationOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    /// Waiting for the matchmaker's next command.
    Command,
    Ended,
}

/// This scheduler's half of one negotiation session.
///
/// The session is driven entirely through [`ResourceNegotiator::resume`]:
/// each matchmaker message yields the actions the caller has to carry out,
/// in order.
#[derive(Debug)]
pub struct ResourceNegotiator {
    id: Uuid,
    header: NegotiationHeader,
    clusters: Vec<ResourceRequestCluster>,
    next_cluster: usize,
    offered: HashMap<u64, usize>,
    matched: u32,
    rejected: u32,
    stop_offering: bool,
    state: WaitState,
    started_at: Instant,
}

impl ResourceNegotiator {
    pub fn new(header: NegotiationHeader, clusters: Vec<ResourceRequestCluster>) -> Result<Self> {
        header.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            header,
            clusters,
            next_cluster: 0,
            offered: HashMap::new(),
            matched: 0,
            rejected: 0,
            stop_offering: false,
            state: WaitState::Command,
            started_at: Instant::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn header(&self) -> &NegotiationHeader {
        &self.header
    }

    pub fn is_ended(&self) -> bool {
        self.state == WaitState::Ended
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Jobs still waiting in this session's clusters.
    pub fn remaining_jobs(&self) -> usize {
        self.clusters.iter().map(ResourceRequestCluster::len).sum()
    }

    pub fn resume(
        &mut self,
        message: MatchmakerMessage,
        ctx: &dyn NegotiationContext,
    ) -> Vec<NegotiatorAction> {
        if self.state == WaitState::Ended {
            tracing::debug!(session = %self.id, "Message after end of negotiation ignored");
            return Vec::new();
        }
        match message {
            MatchmakerMessage::SendJobInfo => vec![NegotiatorAction::Send(self.next_request(ctx))],
            MatchmakerMessage::Match(offer) => self.on_match(offer, ctx),
            MatchmakerMessage::Reject { request_id, reason } => {
                self.rejected += 1;
                tracing::debug!(session = %self.id, request_id, reason = %reason, "Request rejected");
                Vec::new()
            }
            MatchmakerMessage::EndNegotiate => {
                let outcome = self.finish();
                vec![
                    NegotiatorAction::Send(ScheddMessage::Summary(outcome.summary)),
                    NegotiatorAction::End(outcome),
                ]
            }
        }
    }

    /// End the session without a summary, e.g. when the stream broke.
    pub fn abort(&mut self) {
        self.state = WaitState::Ended;
    }

    fn next_request(&mut self, ctx: &dyn NegotiationContext) -> ScheddMessage {
        let limit = ctx.max_jobs_to_offer();
        if limit == 0 && !self.stop_offering {
            tracing::info!(session = %self.id, submitter = %self.header.submitter, "Job start limit reached, no more offers");
            self.stop_offering = true;
        }
        if self.stop_offering {
            return ScheddMessage::NoMoreJobs;
        }
        let Some(idx) = (self.next_cluster..self.clusters.len()).find(|i| !self.clusters[*i].is_empty())
        else {
            self.next_cluster = self.clusters.len();
            return ScheddMessage::NoMoreJobs;
        };
        self.next_cluster = idx + 1;
        let request_id = idx as u64 + 1;
        self.offered.insert(request_id, idx);
        let cluster = &self.clusters[idx];
        tracing::debug!(
            session = %self.id,
            request_id,
            autocluster = cluster.autocluster_id,
            jobs = cluster.len(),
            "Offering resource request"
        );
        ScheddMessage::Request(RequestAd {
            request_id,
            autocluster_id: cluster.autocluster_id,
            count: cluster.len().min(limit),
            ad: cluster.ad.clone(),
        })
    }

    fn on_match(&mut self, offer: MatchOffer, ctx: &dyn NegotiationContext) -> Vec<NegotiatorAction> {
        let Some(&idx) = self.offered.get(&offer.request_id) else {
            tracing::warn!(session = %self.id, request_id = offer.request_id, "Match for unknown request");
            return Vec::new();
        };
        if self.stop_offering || ctx.max_jobs_to_offer() == 0 {
            self.stop_offering = true;
            tracing::debug!(session = %self.id, claim = %offer.claim_id, "Match declined, job start limit reached");
            return Vec::new();
        }

        let candidates = self.clusters[idx].jobs.clone();
        for job_id in candidates {
            match ctx.skip_job(job_id, &offer) {
                SkipDecision::Accept => {
                    tracing::debug!(
                        session = %self.id,
                        job_id = %job_id,
                        claim = %offer.claim_id,
                        "Match accepted, claiming"
                    );
                    return vec![NegotiatorAction::Claim { job_id, offer }];
                }
                SkipDecision::Skip => {
                    self.clusters[idx].remove(job_id);
                }
                SkipDecision::SkipAll => {
                    tracing::info!(session = %self.id, job_id = %job_id, "Offering stopped for this round");
                    self.stop_offering = true;
                    return Vec::new();
                }
            }
        }
        tracing::debug!(session = %self.id, request_id = offer.request_id, "No job left to take match");
        Vec::new()
    }

    /// The claim for `job_id` is on its way: count the match and stop
    /// offering the job in this session.
    pub fn confirm_match(&mut self, job_id: JobId) {
        if self.forget_job(job_id) {
            self.matched += 1;
            tracing::info!(session = %self.id, job_id = %job_id, "Matched job");
        }
    }

    /// Take a job out of this session without counting a match.
    pub fn forget_job(&mut self, job_id: JobId) -> bool {
        self.clusters.iter_mut().any(|cluster| cluster.remove(job_id))
    }

    fn finish(&mut self) -> NegotiationOutcome {
        self.state = WaitState::Ended;
        let satisfied = self.stop_offering || (self.rejected == 0 && self.remaining_jobs() == 0);
        let summary = NegotiationSummary {
            matched: self.matched,
            rejected: self.rejected,
            satisfied,
        };
        tracing::info!(
            session = %self.id,
            submitter = %self.header.submitter,
            pool = %self.header.pool,
            matched = summary.matched,
            rejected = summary.rejected,
            satisfied,
            "Negotiation ended"
        );
        NegotiationOutcome {
            session: self.id,
            submitter: self.header.submitter.clone(),
            pool: self.header.pool.clone(),
            summary,
        }
    }
}
