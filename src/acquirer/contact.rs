use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::acquirer::{ClaimReply, ClaimRequest, Leftover, ResourceOwner};
use crate::ad::{expand_macros, Ad};
use crate::claim::{Claim, ClaimId, ClaimRegistry, ClaimState, ReleaseRequest};
use crate::error::{Result, SchedError};
use crate::job::JobId;

/// Result of one claim-request RPC.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Granted(ClaimReply),
    Refused(String),
    Failed(String),
    Canceled,
}

/// Posted to the core when a contact finishes, whatever the outcome.
#[derive(Debug, Clone)]
pub struct ClaimEvent {
    pub claim_id: ClaimId,
    pub outcome: ClaimOutcome,
}

/// What the core has to do after a contact completed.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The claim is now `Claimed` under `claim_id`.
    Granted {
        claim_id: ClaimId,
        job_id: JobId,
        leftovers: Vec<Leftover>,
    },
    /// The claim was unregistered; its job stays runnable.
    Dropped { job_id: JobId, reason: String },
    /// The claim had already left the registry.
    Stale,
}

enum Contact {
    Waiting(ClaimRequest),
    InFlight(CancellationToken),
}

/// Turns matches into claims with asynchronous claim-request RPCs.
///
/// Contacts beyond `max_pending` wait in FIFO order until an in-flight one
/// completes. Every contact, canceled ones included, ends in exactly one
/// [`ClaimEvent`].
pub struct ClaimAcquirer {
    owner: Arc<dyn ResourceOwner>,
    events: mpsc::UnboundedSender<ClaimEvent>,
    contacts: HashMap<ClaimId, Contact>,
    waiting: VecDeque<ClaimId>,
    in_flight: usize,
    max_pending: usize,
    releases: Vec<JoinHandle<()>>,
    schedd_name: String,
    schedd_address: String,
    alive_interval: Duration,
    deadline: Duration,
}

impl ClaimAcquirer {
    pub fn new(
        owner: Arc<dyn ResourceOwner>,
        events: mpsc::UnboundedSender<ClaimEvent>,
        max_pending: usize,
        schedd_name: impl Into<String>,
        schedd_address: impl Into<String>,
        alive_interval: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            owner,
            events,
            contacts: HashMap::new(),
            waiting: VecDeque::new(),
            in_flight: 0,
            max_pending,
            releases: Vec::new(),
            schedd_name: schedd_name.into(),
            schedd_address: schedd_address.into(),
            alive_interval,
            deadline,
        }
    }

    /// Register `claim` in `Limbo` and queue the claim-request RPC.
    pub fn request_claim(
        &mut self,
        registry: &mut ClaimRegistry,
        claim: Claim,
        job_ad: &Ad,
    ) -> Result<()> {
        let request = ClaimRequest {
            claim_id: claim.id.clone(),
            peer: claim.peer.clone(),
            job_ad: expand_macros(job_ad, &claim.match_ad),
            schedd_address: self.schedd_address.clone(),
            schedd_name: self.schedd_name.clone(),
            alive_interval: self.alive_interval,
            deadline: self.deadline,
            claim_pslot: claim.claim_pslot,
        };
        let job_id = claim.job_id;
        if let Err(existing) = registry.add(claim) {
            tracing::warn!(claim = %existing.id, job_id = %job_id, "Duplicate claim id from matchmaker");
            return Err(SchedError::DuplicateClaim(existing.id.to_string()));
        }
        tracing::info!(claim = %request.claim_id, peer = %request.peer, job_id = %job_id, "Requesting claim");
        self.waiting.push_back(request.claim_id.clone());
        self.contacts
            .insert(request.claim_id.clone(), Contact::Waiting(request));
        self.drain();
        Ok(())
    }

    fn drain(&mut self) {
        while self.max_pending == 0 || self.in_flight < self.max_pending {
            let Some(id) = self.waiting.pop_front() else {
                break;
            };
            let Some(Contact::Waiting(request)) = self.contacts.remove(&id) else {
                continue;
            };
            let token = CancellationToken::new();
            self.contacts.insert(id, Contact::InFlight(token.clone()));
            self.in_flight += 1;
            self.spawn_contact(request, token);
        }
    }

    fn spawn_contact(&self, request: ClaimRequest, token: CancellationToken) {
        let owner = self.owner.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let claim_id = request.claim_id.clone();
            let outcome = tokio::select! {
                _ = token.cancelled() => ClaimOutcome::Canceled,
                reply = owner.request_claim(request) => match reply {
                    Ok(reply) if reply.accepted => ClaimOutcome::Granted(reply),
                    Ok(reply) => ClaimOutcome::Refused(reply.reason),
                    Err(e) => ClaimOutcome::Failed(e.to_string()),
                },
            };
            let _ = events.send(ClaimEvent { claim_id, outcome });
        });
    }

    /// Cancel an outstanding contact. Its completion event still fires,
    /// carrying [`ClaimOutcome::Canceled`].
    pub fn cancel(&mut self, id: &ClaimId) -> bool {
        match self.contacts.get(id) {
            Some(Contact::InFlight(token)) => {
                token.cancel();
                true
            }
            Some(Contact::Waiting(_)) => {
                self.contacts.remove(id);
                self.waiting.retain(|queued| queued != id);
                let _ = self.events.send(ClaimEvent {
                    claim_id: id.clone(),
                    outcome: ClaimOutcome::Canceled,
                });
                true
            }
            None => false,
        }
    }

    /// Cancel every contact whose claim has sat in `Limbo` for `timeout`.
    pub fn expire_limbo(
        &mut self,
        registry: &ClaimRegistry,
        now: Instant,
        timeout: Duration,
    ) -> Vec<ClaimId> {
        let expired: Vec<ClaimId> = registry
            .iter()
            .filter(|c| c.state == ClaimState::Limbo)
            .filter(|c| now.saturating_duration_since(c.entered_state_at) >= timeout)
            .map(|c| c.id.clone())
            .collect();
        for id in &expired {
            tracing::warn!(claim = %id, "Claim request timed out");
            self.cancel(id);
        }
        expired
    }

    /// Apply a finished contact to the registry.
    pub fn on_claim_result(
        &mut self,
        registry: &mut ClaimRegistry,
        event: ClaimEvent,
    ) -> Resolution {
        if let Some(Contact::InFlight(_)) = self.contacts.remove(&event.claim_id) {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        self.waiting.retain(|queued| queued != &event.claim_id);
        let resolution = self.resolve(registry, event);
        self.drain();
        resolution
    }

    fn resolve(&mut self, registry: &mut ClaimRegistry, event: ClaimEvent) -> Resolution {
        let ClaimEvent { claim_id, outcome } = event;
        let Some(claim) = registry.get(&claim_id) else {
            return Resolution::Stale;
        };
        let job_id = claim.job_id;
        debug_assert_eq!(claim.state, ClaimState::Limbo);

        let reply = match outcome {
            ClaimOutcome::Granted(reply) => reply,
            ClaimOutcome::Refused(reason) => {
                tracing::info!(claim = %claim_id, job_id = %job_id, reason = %reason, "Claim refused");
                registry.discard(&claim_id);
                return Resolution::Dropped { job_id, reason };
            }
            ClaimOutcome::Failed(reason) => {
                tracing::warn!(claim = %claim_id, job_id = %job_id, error = %reason, "Claim request failed");
                registry.discard(&claim_id);
                return Resolution::Dropped { job_id, reason };
            }
            ClaimOutcome::Canceled => {
                tracing::info!(claim = %claim_id, job_id = %job_id, "Claim request canceled");
                registry.discard(&claim_id);
                return Resolution::Dropped {
                    job_id,
                    reason: "claim request canceled".to_string(),
                };
            }
        };

        registry.set_state(&claim_id, ClaimState::Claimed);
        let mut final_id = claim_id.clone();
        if let Some(granted) = reply.final_claim_id.filter(|id| id != &claim_id) {
            match registry.replace_id(&claim_id, granted.clone()) {
                Ok(()) => final_id = granted,
                Err(conflict) => {
                    tracing::warn!(claim = %claim_id, conflict = %conflict, "Owner granted an id already in use");
                }
            }
        }
        tracing::info!(claim = %final_id, job_id = %job_id, leftovers = reply.leftovers.len(), "Claim granted");
        Resolution::Granted {
            claim_id: final_id,
            job_id,
            leftovers: reply.leftovers,
        }
    }

    /// Fire-and-forget release RPC.
    pub fn send_release(&mut self, request: ReleaseRequest) {
        self.releases.retain(|task| !task.is_finished());
        let owner = self.owner.clone();
        self.releases.push(tokio::spawn(async move {
            if let Err(e) = owner.release_claim(&request.peer, &request.claim_id).await {
                tracing::warn!(claim = %request.claim_id, peer = %request.peer, error = %e, "Release claim failed");
            }
        }));
    }

    /// Wait up to `timeout` for release RPCs still on the wire.
    pub async fn finish_releases(&mut self, timeout: Duration) {
        let pending: Vec<JoinHandle<()>> = self.releases.drain(..).collect();
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        let all = async {
            for task in pending {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(timeout, all).await.is_err() {
            tracing::warn!(count, "Gave up waiting for claim releases");
        }
    }

    pub fn is_pending(&self, id: &ClaimId) -> bool {
        self.contacts.contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}
