use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide gate on concurrently running job handlers.
///
/// Every started handler holds an [`AdmissionTicket`]; dropping the ticket
/// gives the slot back, so spawn failures, crashes and shutdown all balance
/// the counter without explicit bookkeeping.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    limit: usize,
    in_use: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct AdmissionTicket {
    in_use: Arc<AtomicUsize>,
}

impl AdmissionControl {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn try_acquire(&self) -> Option<AdmissionTicket> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()
            .map(|_| AdmissionTicket {
                in_use: self.in_use.clone(),
            })
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_use())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}
