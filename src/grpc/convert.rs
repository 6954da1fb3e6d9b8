//! Conversions between wire messages and scheduler types. Ads travel as
//! JSON strings.

use tonic::Status;

use crate::acquirer::{ClaimReply, ClaimRequest, Leftover};
use crate::ad::Ad;
use crate::claim::ClaimId;
use crate::core::StatusReport;
use crate::job::{Job, JobId, Universe};
use crate::negotiator::{MatchOffer, MatchmakerMessage, NegotiationHeader, RequestAd, ScheddMessage};
use crate::proto;
use crate::proto::negotiator_message::Kind as InboundKind;
use crate::proto::schedd_message::Kind as OutboundKind;

pub fn parse_ad(json: &str, field: &str) -> Result<Ad, Status> {
    Ad::from_json(json).map_err(|e| Status::invalid_argument(format!("{field}: {e}")))
}

pub fn job_id_from_proto(msg: Option<proto::JobIdMsg>, field: &str) -> Result<JobId, Status> {
    let msg = msg.ok_or_else(|| Status::invalid_argument(format!("{field} is required")))?;
    let id = JobId::new(msg.cluster, msg.proc);
    if id.is_unbound() {
        return Err(Status::invalid_argument(format!("{field}: invalid job id {id}")));
    }
    Ok(id)
}

impl From<JobId> for proto::JobIdMsg {
    fn from(id: JobId) -> Self {
        Self {
            cluster: id.cluster,
            proc: id.proc,
        }
    }
}

impl From<proto::NegotiationHeader> for NegotiationHeader {
    fn from(header: proto::NegotiationHeader) -> Self {
        Self {
            submitter: header.submitter,
            significant_attributes: header.significant_attributes,
            submitter_tag: header.submitter_tag,
            job_priority_range: header.job_priority_range.map(|r| (r.min, r.max)),
            pool_constraint: header.pool_constraint,
            pool: header.pool,
        }
    }
}

impl From<NegotiationHeader> for proto::NegotiationHeader {
    fn from(header: NegotiationHeader) -> Self {
        Self {
            submitter: header.submitter,
            significant_attributes: header.significant_attributes,
            submitter_tag: header.submitter_tag,
            job_priority_range: header
                .job_priority_range
                .map(|(min, max)| proto::PriorityRange { min, max }),
            pool_constraint: header.pool_constraint,
            pool: header.pool,
        }
    }
}

/// The opening message of a negotiation stream must be a header.
pub fn header_from_proto(msg: proto::NegotiatorMessage) -> Result<NegotiationHeader, Status> {
    match msg.kind {
        Some(InboundKind::Header(header)) => Ok(header.into()),
        _ => Err(Status::invalid_argument(
            "negotiation must open with a header",
        )),
    }
}

pub fn matchmaker_message_from_proto(
    msg: proto::NegotiatorMessage,
) -> Result<MatchmakerMessage, Status> {
    match msg.kind {
        Some(InboundKind::SendJobInfo(_)) => Ok(MatchmakerMessage::SendJobInfo),
        Some(InboundKind::Offer(offer)) => {
            if offer.claim_id.is_empty() {
                return Err(Status::invalid_argument("match offer without claim id"));
            }
            Ok(MatchmakerMessage::Match(MatchOffer {
                request_id: offer.request_id,
                claim_id: ClaimId::new(offer.claim_id),
                peer: offer.peer,
                match_ad: parse_ad(&offer.match_ad_json, "match_ad_json")?,
            }))
        }
        Some(InboundKind::Reject(reject)) => Ok(MatchmakerMessage::Reject {
            request_id: reject.request_id,
            reason: reject.reason,
        }),
        Some(InboundKind::End(_)) => Ok(MatchmakerMessage::EndNegotiate),
        Some(InboundKind::Header(_)) => Err(Status::invalid_argument(
            "header sent twice in one session",
        )),
        None => Err(Status::invalid_argument("empty negotiation message")),
    }
}

impl From<MatchmakerMessage> for proto::NegotiatorMessage {
    fn from(msg: MatchmakerMessage) -> Self {
        let kind = match msg {
            MatchmakerMessage::SendJobInfo => InboundKind::SendJobInfo(proto::SendJobInfo {}),
            MatchmakerMessage::Match(offer) => InboundKind::Offer(proto::MatchOffer {
                request_id: offer.request_id,
                claim_id: offer.claim_id.as_secret_str().to_string(),
                peer: offer.peer,
                match_ad_json: offer.match_ad.to_json(),
            }),
            MatchmakerMessage::Reject { request_id, reason } => {
                InboundKind::Reject(proto::RejectRequest { request_id, reason })
            }
            MatchmakerMessage::EndNegotiate => InboundKind::End(proto::EndNegotiate {}),
        };
        Self { kind: Some(kind) }
    }
}

impl From<ScheddMessage> for proto::ScheddMessage {
    fn from(msg: ScheddMessage) -> Self {
        let kind = match msg {
            ScheddMessage::Request(request) => OutboundKind::Request(request.into()),
            ScheddMessage::NoMoreJobs => OutboundKind::NoMoreJobs(proto::NoMoreJobs {}),
            ScheddMessage::Summary(summary) => OutboundKind::Summary(proto::NegotiationSummary {
                matched: summary.matched,
                rejected: summary.rejected,
                satisfied: summary.satisfied,
            }),
        };
        Self { kind: Some(kind) }
    }
}

impl From<RequestAd> for proto::ResourceRequest {
    fn from(request: RequestAd) -> Self {
        Self {
            request_id: request.request_id,
            autocluster_id: request.autocluster_id,
            count: u32::try_from(request.count).unwrap_or(u32::MAX),
            ad_json: request.ad.to_json(),
        }
    }
}

impl From<ClaimRequest> for proto::RequestClaimRequest {
    fn from(request: ClaimRequest) -> Self {
        Self {
            claim_id: request.claim_id.as_secret_str().to_string(),
            job_ad_json: request.job_ad.to_json(),
            schedd_address: request.schedd_address,
            schedd_name: request.schedd_name,
            alive_interval_secs: request.alive_interval.as_secs(),
            deadline_secs: request.deadline.as_secs(),
            claim_partitionable: request.claim_pslot,
        }
    }
}

pub fn claim_reply_from_proto(reply: proto::RequestClaimResponse) -> Result<ClaimReply, Status> {
    let leftovers = reply
        .leftovers
        .into_iter()
        .map(|leftover| {
            Ok(Leftover {
                claim_id: ClaimId::new(leftover.claim_id),
                match_ad: parse_ad(&leftover.match_ad_json, "leftovers.match_ad_json")?,
            })
        })
        .collect::<Result<Vec<_>, Status>>()?;
    Ok(ClaimReply {
        accepted: reply.accepted,
        final_claim_id: reply
            .final_claim_id
            .filter(|id| !id.is_empty())
            .map(ClaimId::new),
        leftovers,
        reason: reply.reason,
    })
}

/// Build an unsubmitted job from a submit request. The queue assigns the id.
pub fn job_from_submit(req: proto::SubmitJobRequest) -> Result<Job, Status> {
    if req.owner.trim().is_empty() {
        return Err(Status::invalid_argument("owner cannot be empty"));
    }
    let universe: Universe = req.universe.parse().map_err(Status::invalid_argument)?;
    let mut job = Job::new(JobId::UNBOUND, req.owner, universe)
        .with_ad(parse_ad(&req.ad_json, "ad_json")?)
        .with_priority(req.priority);
    if !req.allowed_pools.is_empty() {
        job = job.with_allowed_pools(req.allowed_pools);
    }
    Ok(job)
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl From<StatusReport> for proto::GetStatusResponse {
    fn from(report: StatusReport) -> Self {
        Self {
            claims_limbo: count(report.claims_limbo),
            claims_claimed: count(report.claims_claimed),
            claims_active: count(report.claims_active),
            handlers_queued: count(report.handlers_queued),
            handlers_running: count(report.handlers_running),
            jobs_idle: count(report.jobs_idle),
            jobs_running: count(report.jobs_running),
            jobs_held: count(report.jobs_held),
            jobs_completed: count(report.jobs_completed),
            negotiation_sessions: count(report.negotiation_sessions),
            negotiation_round: report.negotiation_round,
            max_jobs_to_offer: count(report.max_jobs_to_offer),
        }
    }
}
