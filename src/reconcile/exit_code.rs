//! Handler exit codes and their classification.

use std::fmt;

use crate::handler::{HandlerExit, HandlerFlags};
use crate::job::Universe;

pub const EXCEPTION: i32 = 4;
pub const EXITED: i32 = 100;
pub const CHECKPOINTED: i32 = 101;
pub const KILLED: i32 = 102;
pub const COREDUMPED: i32 = 103;
pub const NO_MEMORY: i32 = 105;
pub const SHOULD_REQUEUE: i32 = 107;
pub const NOT_STARTED: i32 = 108;
pub const EXEC_FAILED: i32 = 110;
pub const SHOULD_HOLD: i32 = 112;
pub const SHOULD_REMOVE: i32 = 113;
pub const EXITED_AND_CLAIM_CLOSING: i32 = 115;
pub const RECONNECT_FAILED: i32 = 116;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Completed,
    /// Evicted, checkpointed or asked to requeue.
    Requeue,
    NotStarted,
    Hold,
    Remove,
    /// Out of memory or the executable could not run.
    ResourceExhaustion,
    /// Job finished and the owner will not take the claim back.
    ClaimClosing,
    ReconnectFailed,
    Exception,
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitClass::Completed => "completed",
            ExitClass::Requeue => "requeue",
            ExitClass::NotStarted => "not-started",
            ExitClass::Hold => "hold",
            ExitClass::Remove => "remove",
            ExitClass::ResourceExhaustion => "resource-exhaustion",
            ExitClass::ClaimClosing => "claim-closing",
            ExitClass::ReconnectFailed => "reconnect-failed",
            ExitClass::Exception => "exception",
        };
        f.write_str(name)
    }
}

pub fn classify(exit: HandlerExit, flags: HandlerFlags, universe: Universe) -> ExitClass {
    let policy = universe.exit_policy();
    if exit.signal.is_some() {
        return if flags.preempted || policy.requeue_on_signal {
            ExitClass::Requeue
        } else {
            ExitClass::Exception
        };
    }
    match exit.code {
        Some(EXITED) | Some(COREDUMPED) => ExitClass::Completed,
        Some(CHECKPOINTED) | Some(KILLED) | Some(SHOULD_REQUEUE) => ExitClass::Requeue,
        Some(NOT_STARTED) => ExitClass::NotStarted,
        Some(EXEC_FAILED) if policy.hold_on_exec_failure => ExitClass::Hold,
        Some(EXEC_FAILED) | Some(NO_MEMORY) => ExitClass::ResourceExhaustion,
        Some(SHOULD_HOLD) => ExitClass::Hold,
        Some(SHOULD_REMOVE) => ExitClass::Remove,
        Some(EXITED_AND_CLAIM_CLOSING) => ExitClass::ClaimClosing,
        Some(RECONNECT_FAILED) => ExitClass::ReconnectFailed,
        // A vacated handler that exits with something unexpected is still a
        // requeue: we asked it to go.
        _ if flags.preempted => ExitClass::Requeue,
        _ => ExitClass::Exception,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(c: i32) -> HandlerExit {
        HandlerExit {
            code: Some(c),
            signal: None,
        }
    }

    fn signal(s: i32) -> HandlerExit {
        HandlerExit {
            code: None,
            signal: Some(s),
        }
    }

    #[test]
    fn taxonomy() {
        let f = HandlerFlags::default();
        let v = Universe::Vanilla;
        assert_eq!(classify(code(EXITED), f, v), ExitClass::Completed);
        assert_eq!(classify(code(SHOULD_REQUEUE), f, v), ExitClass::Requeue);
        assert_eq!(classify(code(CHECKPOINTED), f, v), ExitClass::Requeue);
        assert_eq!(classify(code(NOT_STARTED), f, v), ExitClass::NotStarted);
        assert_eq!(classify(code(SHOULD_HOLD), f, v), ExitClass::Hold);
        assert_eq!(classify(code(SHOULD_REMOVE), f, v), ExitClass::Remove);
        assert_eq!(classify(code(NO_MEMORY), f, v), ExitClass::ResourceExhaustion);
        assert_eq!(classify(code(EXEC_FAILED), f, v), ExitClass::ResourceExhaustion);
        assert_eq!(
            classify(code(EXITED_AND_CLAIM_CLOSING), f, v),
            ExitClass::ClaimClosing
        );
        assert_eq!(classify(code(RECONNECT_FAILED), f, v), ExitClass::ReconnectFailed);
        assert_eq!(classify(code(EXCEPTION), f, v), ExitClass::Exception);
        assert_eq!(classify(code(0), f, v), ExitClass::Exception);
    }

    #[test]
    fn exec_failure_holds_where_universe_says_so() {
        let f = HandlerFlags::default();
        assert_eq!(
            classify(code(EXEC_FAILED), f, Universe::Container),
            ExitClass::Hold
        );
    }

    #[test]
    fn signals_depend_on_who_sent_them() {
        let mut f = HandlerFlags::default();
        assert_eq!(classify(signal(9), f, Universe::Vanilla), ExitClass::Exception);
        assert_eq!(classify(signal(9), f, Universe::Parallel), ExitClass::Requeue);
        f.preempted = true;
        assert_eq!(classify(signal(15), f, Universe::Vanilla), ExitClass::Requeue);
        assert_eq!(classify(code(1), f, Universe::Vanilla), ExitClass::Requeue);
    }
}
