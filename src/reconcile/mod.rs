pub mod exit_code;
mod reconciler;

pub use exit_code::{classify, ExitClass};
pub use reconciler::{ClaimAction, ExitContext, ExitReconciler, Reconciliation};
