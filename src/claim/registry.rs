use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::claim::{Claim, ClaimId, ClaimState};
use crate::job::JobId;

/// Best-effort release of a claim at its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub claim_id: ClaimId,
    pub peer: String,
}

/// Owns every live claim, indexed by claim id and by bound job id.
///
/// Release RPCs are not issued from here: removing a claim that needs
/// releasing posts a [`ReleaseRequest`] on the release channel and the core
/// fires the RPC from its event loop.
#[derive(Debug)]
pub struct ClaimRegistry {
    claims: HashMap<ClaimId, Claim>,
    by_job: HashMap<JobId, ClaimId>,
    /// Open authorization holes per peer, one per registered claim.
    peer_holes: HashMap<String, usize>,
    release_tx: mpsc::UnboundedSender<ReleaseRequest>,
}

impl ClaimRegistry {
    pub fn new(release_tx: mpsc::UnboundedSender<ReleaseRequest>) -> Self {
        Self {
            claims: HashMap::new(),
            by_job: HashMap::new(),
            peer_holes: HashMap::new(),
            release_tx,
        }
    }

    /// Register a new claim.
    ///
    /// A duplicate id leaves the registry untouched and hands back the
    /// claim already registered under it.
    pub fn add(&mut self, mut claim: Claim) -> Result<&mut Claim, &Claim> {
        match self.claims.entry(claim.id.clone()) {
            Entry::Occupied(existing) => Err(&*existing.into_mut()),
            Entry::Vacant(slot) => {
                claim.current_rank = Claim::initial_rank(&claim.match_ad);
                claim.entered_state_at = Instant::now();
                if !claim.job_id.is_unbound() {
                    self.by_job.insert(claim.job_id, claim.id.clone());
                }
                *self.peer_holes.entry(claim.peer.clone()).or_default() += 1;
                tracing::debug!(claim = %claim.id, peer = %claim.peer, job_id = %claim.job_id, "Claim registered");
                Ok(slot.insert(claim))
            }
        }
    }

    /// Unregister a claim. Removing an unknown claim is a no-op, so a
    /// release is attempted at most once per claim.
    pub fn remove(&mut self, id: &ClaimId) -> Option<Claim> {
        let claim = self.claims.remove(id)?;
        if !claim.job_id.is_unbound() && self.by_job.get(&claim.job_id) == Some(&claim.id) {
            self.by_job.remove(&claim.job_id);
        }
        if let Some(holes) = self.peer_holes.get_mut(&claim.peer) {
            *holes = holes.saturating_sub(1);
            if *holes == 0 {
                self.peer_holes.remove(&claim.peer);
            }
        }
        if claim.needs_release && !claim.owner_closing {
            tracing::info!(claim = %claim.id, peer = %claim.peer, "Releasing claim");
            let request = ReleaseRequest {
                claim_id: claim.id.clone(),
                peer: claim.peer.clone(),
            };
            if self.release_tx.send(request).is_err() {
                tracing::warn!(claim = %claim.id, "Release channel closed, claim not released");
            }
        } else {
            tracing::info!(claim = %claim.id, state = %claim.state, "Dropping claim without release");
        }
        Some(claim)
    }

    /// Unregister without a release RPC, whatever the claim's flags say.
    pub fn discard(&mut self, id: &ClaimId) -> Option<Claim> {
        if let Some(claim) = self.claims.get_mut(id) {
            claim.needs_release = false;
        }
        self.remove(id)
    }

    pub fn get(&self, id: &ClaimId) -> Option<&Claim> {
        self.claims.get(id)
    }

    pub fn get_mut(&mut self, id: &ClaimId) -> Option<&mut Claim> {
        self.claims.get_mut(id)
    }

    pub fn contains(&self, id: &ClaimId) -> bool {
        self.claims.contains_key(id)
    }

    pub fn find_by_job(&self, job_id: JobId) -> Option<&Claim> {
        self.by_job.get(&job_id).and_then(|id| self.claims.get(id))
    }

    /// Move the job index entry of a claim. No-op if the job is unchanged.
    pub fn rebind(&mut self, id: &ClaimId, job_id: JobId) {
        let Some(claim) = self.claims.get_mut(id) else {
            return;
        };
        if claim.job_id == job_id {
            return;
        }
        let previous = std::mem::replace(&mut claim.job_id, job_id);
        if !previous.is_unbound() && self.by_job.get(&previous) == Some(id) {
            self.by_job.remove(&previous);
        }
        if !job_id.is_unbound() {
            debug_assert!(
                self.by_job.get(&job_id).map_or(true, |other| other == id),
                "job {job_id} bound to two claims"
            );
            self.by_job.insert(job_id, id.clone());
        }
        tracing::debug!(claim = %id, from = %previous, to = %job_id, "Claim rebound");
    }

    /// Record a state change. Entering `Active` raises `needs_release`.
    pub fn set_state(&mut self, id: &ClaimId, state: ClaimState) {
        let Some(claim) = self.claims.get_mut(id) else {
            return;
        };
        debug_assert!(
            claim.state.can_transition_to(state),
            "illegal claim transition {} -> {}",
            claim.state,
            state
        );
        if claim.state != state {
            tracing::debug!(claim = %id, from = %claim.state, to = %state, "Claim state change");
        }
        claim.state = state;
        claim.entered_state_at = Instant::now();
        if state == ClaimState::Active {
            claim.needs_release = true;
        }
    }

    /// Re-key a claim under the final id granted by its owner. Added
    /// attributes and job binding travel with it.
    pub fn replace_id(&mut self, old: &ClaimId, new: ClaimId) -> Result<(), ClaimId> {
        if old == &new {
            return Ok(());
        }
        if self.claims.contains_key(&new) {
            return Err(new);
        }
        let Some(mut claim) = self.claims.remove(old) else {
            return Err(old.clone());
        };
        tracing::debug!(from = %old, to = %new, "Claim id replaced");
        claim.id = new.clone();
        if !claim.job_id.is_unbound() {
            self.by_job.insert(claim.job_id, new.clone());
        }
        self.claims.insert(new, claim);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Claim> {
        self.claims.values()
    }

    pub fn ids(&self) -> Vec<ClaimId> {
        self.claims.keys().cloned().collect()
    }

    pub fn count_in_state(&self, state: ClaimState) -> usize {
        self.claims.values().filter(|c| c.state == state).count()
    }

    pub fn peer_holes(&self, peer: &str) -> usize {
        self.peer_holes.get(peer).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
