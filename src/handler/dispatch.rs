use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ThrottleConfig;
use crate::handler::HandlerId;

/// FIFO of handlers waiting to be launched, drained at a throttled rate.
///
/// The throttle keeps the start times of the last `job_start_count`
/// launches; another launch is allowed once the oldest of them is at least
/// `job_start_delay` old. A delay floor set from a job's
/// `NextJobStartDelay` hint can push the next launch further out but never
/// pull it in.
#[derive(Debug)]
pub struct DispatchQueue {
    queue: VecDeque<HandlerId>,
    recent_starts: VecDeque<Instant>,
    floor_until: Option<Instant>,
    config: ThrottleConfig,
}

impl DispatchQueue {
    pub fn new(mut config: ThrottleConfig) -> Self {
        config.job_start_count = config.job_start_count.max(1);
        Self {
            queue: VecDeque::new(),
            recent_starts: VecDeque::with_capacity(config.job_start_count),
            floor_until: None,
            config,
        }
    }

    pub fn enqueue(&mut self, id: HandlerId) {
        self.queue.push_back(id);
    }

    /// Drop a queued entry without launching it.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        match self.queue.iter().position(|queued| *queued == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.queue.contains(&id)
    }

    /// The entry that will launch next, throttle permitting.
    pub fn front(&self) -> Option<HandlerId> {
        self.queue.front().copied()
    }

    /// How long the head of the queue still has to wait.
    pub fn throttle(&self, now: Instant) -> Duration {
        self.ready_at()
            .map_or(Duration::ZERO, |ready| ready.saturating_duration_since(now))
    }

    /// When the next launch may happen, or `None` with nothing queued.
    pub fn next_launch_at(&self, now: Instant) -> Option<Instant> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.ready_at().map_or(now, |ready| ready.max(now)))
        }
    }

    /// Pop the head of the queue if the throttle allows a launch now, and
    /// count it as started.
    pub fn pop_ready(&mut self, now: Instant) -> Option<HandlerId> {
        if self.queue.is_empty() || self.ready_at().is_some_and(|ready| ready > now) {
            return None;
        }
        let id = self.queue.pop_front()?;
        if self.recent_starts.len() == self.config.job_start_count {
            self.recent_starts.pop_front();
        }
        self.recent_starts.push_back(now);
        Some(id)
    }

    /// Lengthen the pause before the next launch to at least `hint` from
    /// `now`, capped at the configured maximum.
    pub fn set_delay_floor(&mut self, now: Instant, hint: Duration) {
        let hint = hint.min(self.config.max_next_job_start_delay());
        let until = now + hint;
        if self.floor_until.map_or(true, |current| until > current) {
            tracing::debug!(delay_ms = hint.as_millis() as u64, "Next job start delayed");
            self.floor_until = Some(until);
        }
    }

    fn ready_at(&self) -> Option<Instant> {
        let window_ready = if self.recent_starts.len() < self.config.job_start_count {
            None
        } else {
            self.recent_starts
                .front()
                .map(|oldest| *oldest + self.config.job_start_delay())
        };
        match (window_ready, self.floor_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
