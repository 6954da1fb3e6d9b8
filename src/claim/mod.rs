mod registry;
mod state;

pub use registry::{ClaimRegistry, ReleaseRequest};
pub use state::{Claim, ClaimId, ClaimState};
