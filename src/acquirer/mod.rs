mod contact;
mod owner;

pub use contact::{ClaimAcquirer, ClaimEvent, ClaimOutcome, Resolution};
pub use owner::{ClaimReply, ClaimRequest, Leftover, ResourceOwner};
