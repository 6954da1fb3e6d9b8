mod dispatch;
mod launcher;
mod record;
mod table;

pub use dispatch::DispatchQueue;
pub use launcher::{
    HandlerEvent, HandlerExit, JobHandlerLauncher, LaunchRequest, ENV_CLAIM_ID, ENV_JOB_ID,
    ENV_SCHEDD_ADDRESS,
};
pub use record::{
    HandlerFlags, HandlerId, HandlerRecord, HandlerSignal, HandlerState, PendingRecycle,
};
pub use table::HandlerTable;
