use std::collections::HashMap;

use crate::config::FlockConfig;

#[derive(Debug, Clone, Copy)]
struct SubmitterFlock {
    level: usize,
    round_open: bool,
    satisfied: bool,
}

/// Per-submitter flock levels.
///
/// The home pool is always allowed. At level `n` the first `n` configured
/// pools are allowed as well. The level moves one step at the end of each
/// negotiation round: outward if any session of the round left the submitter
/// unsatisfied, inward if all were satisfied and the level is above the
/// configured minimum.
#[derive(Debug)]
pub struct FlockLevels {
    pools: Vec<String>,
    min_level: usize,
    submitters: HashMap<String, SubmitterFlock>,
}

impl FlockLevels {
    pub fn new(config: &FlockConfig) -> Self {
        Self {
            pools: config.pools.clone(),
            min_level: config.min_level.min(config.pools.len()),
            submitters: HashMap::new(),
        }
    }

    pub fn level(&self, submitter: &str) -> usize {
        self.submitters
            .get(submitter)
            .map_or(self.min_level, |s| s.level)
    }

    pub fn allows(&self, submitter: &str, pool: &str) -> bool {
        if pool.is_empty() {
            return true;
        }
        match self.pools.iter().position(|p| p == pool) {
            Some(idx) => idx < self.level(submitter),
            None => false,
        }
    }

    /// Fold one session's result into the submitter's current round.
    pub fn record_session(&mut self, submitter: &str, satisfied: bool) {
        let entry = self.entry(submitter);
        entry.round_open = true;
        entry.satisfied &= satisfied;
    }

    /// Close the submitter's round and adjust its level. Returns
    /// `(old, new)` when the level changed.
    pub fn finish_round(&mut self, submitter: &str) -> Option<(usize, usize)> {
        let max_level = self.pools.len();
        let min_level = self.min_level;
        let entry = self.entry(submitter);
        if !entry.round_open {
            return None;
        }
        let old = entry.level;
        if !entry.satisfied && entry.level < max_level {
            entry.level += 1;
        } else if entry.satisfied && entry.level > min_level {
            entry.level -= 1;
        }
        entry.round_open = false;
        entry.satisfied = true;
        let new = entry.level;
        if old != new {
            tracing::info!(submitter, old, new, "Flock level changed");
            Some((old, new))
        } else {
            None
        }
    }

    fn entry(&mut self, submitter: &str) -> &mut SubmitterFlock {
        let min_level = self.min_level;
        self.submitters
            .entry(submitter.to_string())
            .or_insert(SubmitterFlock {
                level: min_level,
                round_open: false,
                satisfied: true,
            })
    }
}
