//! The scheduler's side of the negotiation protocol.

mod cluster;
mod flock;
mod protocol;
mod session;

pub use cluster::{build_clusters, AutoclusterIndex, ResourceRequestCluster};
pub use flock::FlockLevels;
pub use protocol::{
    MatchOffer, MatchmakerMessage, NegotiationHeader, NegotiationSummary, RequestAd,
    ScheddMessage,
};
pub use session::{
    NegotiationContext, NegotiationOutcome, NegotiatorAction, ResourceNegotiator, SkipDecision,
};
