use std::time::Duration;

use crate::ad::Ad;
use crate::claim::ClaimId;
use crate::error::Result;

/// Opportunistic-claim request sent to a resource owner.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub claim_id: ClaimId,
    pub peer: String,
    /// Job attributes with `$$()` macros already resolved.
    pub job_ad: Ad,
    pub schedd_address: String,
    pub schedd_name: String,
    pub alive_interval: Duration,
    pub deadline: Duration,
    pub claim_pslot: bool,
}

/// A sub-resource the owner carved out alongside the granted one.
#[derive(Debug, Clone, PartialEq)]
pub struct Leftover {
    pub claim_id: ClaimId,
    pub match_ad: Ad,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimReply {
    pub accepted: bool,
    /// Set when the owner granted a different id than the one requested.
    pub final_claim_id: Option<ClaimId>,
    pub leftovers: Vec<Leftover>,
    pub reason: String,
}

impl ClaimReply {
    pub fn granted() -> Self {
        Self {
            accepted: true,
            ..Default::default()
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            ..Default::default()
        }
    }
}

/// The remote side of a claim: whoever owns the resource.
#[tonic::async_trait]
pub trait ResourceOwner: Send + Sync + 'static {
    async fn request_claim(&self, request: ClaimRequest) -> Result<ClaimReply>;

    async fn release_claim(&self, peer: &str, claim_id: &ClaimId) -> Result<()>;
}
