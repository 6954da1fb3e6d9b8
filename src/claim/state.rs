use std::fmt;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::ad::{attr, Ad};
use crate::handler::HandlerId;
use crate::job::JobId;

const SESSION_SEPARATOR: &str = "##";

/// Capability string identifying a claim.
///
/// Everything after the first `##` is a session key used for authenticated
/// follow-up RPCs. `Display` and `Debug` only show the public part.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimId(String);

impl ClaimId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Full capability string, session key included. Only for the wire.
    pub fn as_secret_str(&self) -> &str {
        &self.0
    }

    pub fn public_part(&self) -> &str {
        match self.0.split_once(SESSION_SEPARATOR) {
            Some((public, _)) => public,
            None => &self.0,
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        self.0
            .split_once(SESSION_SEPARATOR)
            .map(|(_, key)| key)
            .filter(|key| !key.is_empty())
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.public_part())
    }
}

impl fmt::Debug for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimId({:?})", self.public_part())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimState {
    /// Claim-request RPC outstanding.
    Limbo,
    /// Granted and idle.
    Claimed,
    /// A handler is running on it.
    Active,
}

impl ClaimState {
    pub(crate) fn can_transition_to(self, next: ClaimState) -> bool {
        use ClaimState::*;
        matches!(
            (self, next),
            (Limbo, Claimed) | (Claimed, Active) | (Active, Claimed)
        ) || self == next
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimState::Limbo => write!(f, "limbo"),
            ClaimState::Claimed => write!(f, "claimed"),
            ClaimState::Active => write!(f, "active"),
        }
    }
}

/// One outstanding grant of a remote resource.
#[derive(Debug, Clone)]
pub struct Claim {
    pub id: ClaimId,
    /// Address of the resource owner.
    pub peer: String,
    /// Flock pool the claim came from; empty for the home pool.
    pub pool: String,
    pub match_ad: Ad,
    pub user: String,
    /// Request a partitionable sub-resource instead of the whole slot.
    pub claim_pslot: bool,
    pub state: ClaimState,
    pub entered_state_at: Instant,
    pub job_id: JobId,
    pub handler: Option<HandlerId>,
    pub needs_release: bool,
    pub num_exceptions: u32,
    pub current_rank: f64,
    /// Attributes accumulated on the claim after the match, kept across an
    /// id replacement.
    pub added_attrs: Ad,
    /// Idle job this claim is earmarked for by a reassign-slot request.
    pub reassign_to: Option<JobId>,
    /// The owner revoked the claim; tearing it down sends no release RPC.
    pub owner_closing: bool,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Claim {
    pub fn new(
        id: ClaimId,
        peer: impl Into<String>,
        job_id: JobId,
        match_ad: Ad,
        user: impl Into<String>,
        pool: impl Into<String>,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            pool: pool.into(),
            match_ad,
            user: user.into(),
            claim_pslot: false,
            state: ClaimState::Limbo,
            entered_state_at: Instant::now(),
            job_id,
            handler: None,
            needs_release: false,
            num_exceptions: 0,
            current_rank: 0.0,
            added_attrs: Ad::new(),
            reassign_to: None,
            owner_closing: false,
            lease_expires_at: None,
        }
    }

    pub fn with_pslot(mut self, claim_pslot: bool) -> Self {
        self.claim_pslot = claim_pslot;
        self
    }

    pub(crate) fn initial_rank(match_ad: &Ad) -> f64 {
        match_ad
            .get_f64(attr::CURRENT_RANK)
            .or_else(|| match_ad.get_f64(attr::RANK))
            .unwrap_or(0.0)
    }

    /// Bound to neither a job nor a handler.
    pub fn is_idle(&self) -> bool {
        self.state == ClaimState::Claimed && self.job_id.is_unbound() && self.handler.is_none()
    }

    /// Match ad plus attributes added since the match.
    pub fn effective_ad(&self) -> Ad {
        let mut ad = self.match_ad.clone();
        ad.merge(&self.added_attrs);
        ad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_hides_session_key() {
        let id = ClaimId::new("<10.0.0.5:9620>#1700000000#7##s3cr3t");
        assert_eq!(id.to_string(), "<10.0.0.5:9620>#1700000000#7");
        assert_eq!(id.session_key(), Some("s3cr3t"));
        assert!(!format!("{id:?}").contains("s3cr3t"));
        assert!(id.as_secret_str().ends_with("##s3cr3t"));
    }

    #[test]
    fn claim_without_session_key() {
        let id = ClaimId::new("slot1@host");
        assert_eq!(id.public_part(), "slot1@host");
        assert_eq!(id.session_key(), None);
    }

    #[test]
    fn state_transitions_are_ordered() {
        use ClaimState::*;
        assert!(Limbo.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Active));
        assert!(Active.can_transition_to(Claimed));
        assert!(!Limbo.can_transition_to(Active));
        assert!(!Claimed.can_transition_to(Limbo));
    }

    #[test]
    fn initial_rank_prefers_current_rank() {
        let ad = Ad::new().with("CurrentRank", 7.5).with("Rank", 2);
        assert_eq!(Claim::initial_rank(&ad), 7.5);
        assert_eq!(Claim::initial_rank(&Ad::new().with("Rank", 2)), 2.0);
        assert_eq!(Claim::initial_rank(&Ad::new()), 0.0);
    }
}
