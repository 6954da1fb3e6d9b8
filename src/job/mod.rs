mod id;
mod record;
mod store;

pub use id::{JobId, ParseJobIdError};
pub use record::{ExitPolicy, Job, JobStatus, PersistedClaim, Universe};
pub use store::{JobQueue, JobStore};
