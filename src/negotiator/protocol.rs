use crate::ad::Ad;
use crate::claim::ClaimId;
use crate::error::{Result, SchedError};

/// First message of a negotiation session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NegotiationHeader {
    /// `owner` or `owner@domain`.
    pub submitter: String,
    pub significant_attributes: Vec<String>,
    pub submitter_tag: String,
    /// Inclusive `(min, max)` job priority window.
    pub job_priority_range: Option<(i32, i32)>,
    /// Policy expression each offered job must satisfy.
    pub pool_constraint: Option<String>,
    /// Pool of the matchmaker; empty for the home pool.
    pub pool: String,
}

impl NegotiationHeader {
    pub fn new(submitter: impl Into<String>) -> Self {
        Self {
            submitter: submitter.into(),
            ..Default::default()
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.submitter.trim().is_empty() {
            return Err(SchedError::MalformedHeader("missing submitter".to_string()));
        }
        if let Some((min, max)) = self.job_priority_range {
            if min > max {
                return Err(SchedError::MalformedHeader(format!(
                    "empty job priority range {min}..{max}"
                )));
            }
        }
        if self
            .pool_constraint
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
        {
            return Err(SchedError::MalformedHeader(
                "blank pool constraint".to_string(),
            ));
        }
        Ok(())
    }

    /// The job owner this submitter negotiates for.
    pub fn owner(&self) -> &str {
        match self.submitter.split_once('@') {
            Some((owner, _)) => owner,
            None => &self.submitter,
        }
    }

    pub fn admits_priority(&self, priority: i32) -> bool {
        self.job_priority_range
            .map_or(true, |(min, max)| (min..=max).contains(&priority))
    }
}

/// A resource offered back against one of our requests.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOffer {
    pub request_id: u64,
    pub claim_id: ClaimId,
    pub peer: String,
    pub match_ad: Ad,
}

/// Messages from the matchmaker once the header has been accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchmakerMessage {
    SendJobInfo,
    Match(MatchOffer),
    Reject { request_id: u64, reason: String },
    EndNegotiate,
}

/// One resource-request cluster, as offered to the matchmaker.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestAd {
    pub request_id: u64,
    pub autocluster_id: u64,
    /// Number of jobs the matchmaker may match against this request.
    pub count: usize,
    pub ad: Ad,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationSummary {
    pub matched: u32,
    pub rejected: u32,
    pub satisfied: bool,
}

/// Messages this scheduler sends during a session.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheddMessage {
    Request(RequestAd),
    /// Nothing (more) to offer; the session stays open.
    NoMoreJobs,
    Summary(NegotiationSummary),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_requires_submitter() {
        assert!(matches!(
            NegotiationHeader::default().validate(),
            Err(SchedError::MalformedHeader(_))
        ));
        assert!(NegotiationHeader::new("alice@site").validate().is_ok());
    }

    #[test]
    fn header_rejects_inverted_priority_range() {
        let mut header = NegotiationHeader::new("alice");
        header.job_priority_range = Some((5, 1));
        assert!(header.validate().is_err());
        header.job_priority_range = Some((1, 5));
        assert!(header.validate().is_ok());
        assert!(header.admits_priority(3));
        assert!(!header.admits_priority(6));
    }

    #[test]
    fn owner_strips_domain() {
        assert_eq!(NegotiationHeader::new("alice@site.org").owner(), "alice");
        assert_eq!(NegotiationHeader::new("bob").owner(), "bob");
    }
}
