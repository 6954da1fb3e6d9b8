//! The scheduler core.
//!
//! [`SchedulerCore`] exclusively owns the claim registry, the handler table
//! and the dispatch queue. Everything that takes wall-clock time (claim
//! RPCs, handler processes, release RPCs) runs in spawned tasks that post
//! their completion back over a channel, so core state is only ever touched
//! from [`SchedulerCore::step`].

mod claims;
mod dispatch;
mod event;
mod handle;
mod lifecycle;
mod negotiation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::acquirer::{ClaimAcquirer, ClaimEvent, ResourceOwner};
use crate::admission::AdmissionControl;
use crate::claim::{ClaimRegistry, ClaimState, ReleaseRequest};
use crate::config::SchedulerConfig;
use crate::handler::{
    DispatchQueue, HandlerEvent, HandlerState, HandlerTable, JobHandlerLauncher,
};
use crate::job::{Job, JobId, JobStatus, JobStore};
use crate::negotiator::{
    AutoclusterIndex, FlockLevels, MatchOffer, NegotiationContext, ResourceNegotiator, SkipDecision,
};
use crate::policy::Evaluator;
use crate::reconcile::ExitReconciler;
use crate::shutdown::ShutdownSignal;

pub use event::{Command, RecycledJob, SessionStep, ShutdownMode, StatusReport};
pub use handle::SchedulerHandle;

const COMMAND_QUEUE_DEPTH: usize = 1024;
const RELEASE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SchedulerCore {
    config: SchedulerConfig,
    store: Box<dyn JobStore>,
    evaluator: Arc<dyn Evaluator>,
    registry: ClaimRegistry,
    handlers: HandlerTable,
    dispatch: DispatchQueue,
    acquirer: ClaimAcquirer,
    launcher: JobHandlerLauncher,
    reconciler: ExitReconciler,
    admission: AdmissionControl,
    flock: FlockLevels,
    autoclusters: AutoclusterIndex,
    sessions: HashMap<Uuid, ResourceNegotiator>,
    /// Incremented at the start of every home-pool negotiation.
    round: u64,
    commands: mpsc::Receiver<Command>,
    claim_events: mpsc::UnboundedReceiver<ClaimEvent>,
    handler_events: mpsc::UnboundedReceiver<HandlerEvent>,
    releases: mpsc::UnboundedReceiver<ReleaseRequest>,
    shutdown: Option<ShutdownMode>,
    signal: ShutdownSignal,
    next_tick: Instant,
}

impl SchedulerCore {
    pub fn new(
        config: SchedulerConfig,
        store: Box<dyn JobStore>,
        evaluator: Arc<dyn Evaluator>,
        owner: Arc<dyn ResourceOwner>,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (claim_tx, claim_events) = mpsc::unbounded_channel();
        let (handler_tx, handler_events) = mpsc::unbounded_channel();
        let (release_tx, releases) = mpsc::unbounded_channel();

        let address = config.listen_addr.to_string();
        let acquirer = ClaimAcquirer::new(
            owner,
            claim_tx,
            config.max_pending_contacts,
            config.name.clone(),
            address.clone(),
            config.alive_interval(),
            config.request_claim_timeout(),
        );
        let launcher = JobHandlerLauncher::new(config.handler.clone(), address, handler_tx);
        let reconciler = ExitReconciler::new(
            config.max_exceptions,
            config.cooldown_expr.clone(),
            evaluator.clone(),
        );

        let core = Self {
            registry: ClaimRegistry::new(release_tx),
            handlers: HandlerTable::new(),
            dispatch: DispatchQueue::new(config.throttle.clone()),
            acquirer,
            launcher,
            reconciler,
            admission: AdmissionControl::new(config.max_jobs_running),
            flock: FlockLevels::new(&config.flock),
            autoclusters: AutoclusterIndex::new(),
            sessions: HashMap::new(),
            round: 0,
            commands,
            claim_events,
            handler_events,
            releases,
            shutdown: None,
            signal: ShutdownSignal::new(),
            next_tick: Instant::now() + config.tick_interval(),
            store,
            evaluator,
            config,
        };
        (core, SchedulerHandle::new(command_tx))
    }

    /// Watch `signal` instead of the core's private shutdown signal.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClaimRegistry {
        &self.registry
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn dispatch_queue(&self) -> &DispatchQueue {
        &self.dispatch
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn flock(&self) -> &FlockLevels {
        &self.flock
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.store.get(id)
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn shutdown_mode(&self) -> Option<ShutdownMode> {
        self.shutdown
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run the event loop until shutdown completes.
    pub async fn run(mut self) {
        tracing::info!(name = %self.config.name, addr = %self.config.listen_addr, "Scheduler core started");
        while self.step().await {}
        self.drain_releases().await;
        tracing::info!("Scheduler core stopped");
    }

    /// Wait, bounded, for release RPCs still in flight once the loop stops.
    pub async fn drain_releases(&mut self) {
        self.acquirer.finish_releases(RELEASE_DRAIN_TIMEOUT).await;
    }

    /// Wait for and handle one event. Returns false once a shutdown has
    /// finished draining handlers.
    pub async fn step(&mut self) -> bool {
        let launch_at = if self.shutdown.is_none() && self.admission.available() > 0 {
            self.dispatch.next_launch_at(Instant::now())
        } else {
            None
        };
        let fast_pending = self.shutdown != Some(ShutdownMode::Fast);

        tokio::select! {
            Some(command) = self.commands.recv() => self.handle_command(command),
            Some(event) = self.claim_events.recv() => self.on_claim_event(event),
            Some(event) = self.handler_events.recv() => self.on_handler_event(event),
            _ = tokio::time::sleep_until(self.next_tick) => self.tick(),
            _ = tokio::time::sleep_until(launch_at.unwrap_or(self.next_tick)), if launch_at.is_some() => {}
            _ = self.signal.graceful().cancelled(), if self.shutdown.is_none() => {
                self.begin_shutdown(ShutdownMode::Graceful);
            }
            _ = self.signal.fast().cancelled(), if fast_pending => {
                self.begin_shutdown(ShutdownMode::Fast);
            }
        }

        self.flush_releases();
        self.drain_dispatch();
        !(self.shutdown.is_some() && self.handlers.is_empty())
    }

    /// Step until `done` holds or `timeout` passes. Returns whether `done`
    /// held.
    pub async fn pump_until(
        &mut self,
        mut done: impl FnMut(&Self) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            match tokio::time::timeout_at(deadline, self.step()).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return done(self),
            }
        }
        true
    }

    /// Step for `duration`, whatever happens.
    pub async fn pump_for(&mut self, duration: Duration) {
        self.pump_until(|_| false, duration).await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::BeginNegotiation { header, reply } => {
                let _ = reply.send(self.begin_negotiation(header));
            }
            Command::NegotiationMessage {
                session,
                message,
                reply,
            } => {
                let _ = reply.send(self.negotiation_message(session, message));
            }
            Command::AbortNegotiation { session } => self.abort_negotiation(session),
            Command::ReleaseClaim { claim_id, reply } => {
                let _ = reply.send(self.release_claim(&claim_id));
            }
            Command::ReassignSlot {
                beneficiary,
                victims,
                reply,
            } => {
                let _ = reply.send(self.reassign_slot(beneficiary, &victims));
            }
            Command::RecycleHandler {
                previous,
                exit_code,
                reply,
            } => {
                let _ = reply.send(self.recycle_handler(previous, exit_code));
            }
            Command::AckRecycle { job_id, reply } => {
                let _ = reply.send(self.ack_recycle(job_id));
            }
            Command::SubmitJob { job, reply } => {
                let _ = reply.send(self.submit_job(*job));
            }
            Command::HoldJob {
                job_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.hold_job(job_id, reason));
            }
            Command::RemoveJob { job_id, reply } => {
                let _ = reply.send(self.remove_job(job_id));
            }
            Command::PurgeJob { job_id, reply } => {
                let _ = reply.send(self.purge_job(job_id));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        self.expire_limbo_claims(now);
        self.expire_recycle_offers(now);
        self.sweep_idle_claims(now);
        self.refresh_leases();
        self.commit();
        self.next_tick = now + self.config.tick_interval();
    }

    fn flush_releases(&mut self) {
        while let Ok(request) = self.releases.try_recv() {
            self.acquirer.send_release(request);
        }
    }

    pub(crate) fn commit(&mut self) {
        if let Err(e) = self.store.commit() {
            tracing::error!(error = %e, "Failed to commit job queue");
        }
    }

    pub fn status(&self) -> StatusReport {
        let count = |status: JobStatus| self.store.jobs().filter(|j| j.status == status).count();
        StatusReport {
            claims_limbo: self.registry.count_in_state(ClaimState::Limbo),
            claims_claimed: self.registry.count_in_state(ClaimState::Claimed),
            claims_active: self.registry.count_in_state(ClaimState::Active),
            handlers_queued: self.handlers.count_in_state(HandlerState::Queued),
            handlers_running: self.handlers.count_in_state(HandlerState::Spawning)
                + self.handlers.count_in_state(HandlerState::Running),
            jobs_idle: count(JobStatus::Idle),
            jobs_running: count(JobStatus::Running),
            jobs_held: count(JobStatus::Held),
            jobs_completed: count(JobStatus::Completed),
            negotiation_sessions: self.sessions.len(),
            negotiation_round: self.round,
            max_jobs_to_offer: self.max_jobs_to_offer(),
        }
    }

    /// Cross-check the claim and handler tables.
    pub fn check_invariants(&self) -> Result<(), String> {
        for claim in self.registry.iter() {
            if let Some(hid) = claim.handler {
                let record = self
                    .handlers
                    .get(hid)
                    .ok_or_else(|| format!("claim {} points at missing handler {hid}", claim.id))?;
                if record.claim.as_ref() != Some(&claim.id) {
                    return Err(format!(
                        "handler {hid} does not point back at claim {}",
                        claim.id
                    ));
                }
            }
            if claim.state == ClaimState::Active {
                if claim.handler.is_none() {
                    return Err(format!("active claim {} has no handler", claim.id));
                }
                if !claim.needs_release {
                    return Err(format!("active claim {} not marked for release", claim.id));
                }
            }
            if !claim.job_id.is_unbound() {
                let indexed = self.registry.find_by_job(claim.job_id).map(|c| &c.id);
                if indexed != Some(&claim.id) {
                    return Err(format!(
                        "job {} of claim {} is indexed to another claim",
                        claim.job_id, claim.id
                    ));
                }
            }
        }
        for record in self.handlers.iter() {
            if let Some(claim_id) = &record.claim {
                let claim = self.registry.get(claim_id).ok_or_else(|| {
                    format!("handler {} points at missing claim {claim_id}", record.id)
                })?;
                if claim.handler != Some(record.id) {
                    return Err(format!(
                        "claim {claim_id} does not point back at handler {}",
                        record.id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Bound to a claim, owned by a handler, or earmarked by a reassign.
    fn is_matched(&self, job_id: JobId) -> bool {
        self.registry.find_by_job(job_id).is_some()
            || self.handlers.find_by_job(job_id).is_some()
            || self.registry.iter().any(|c| c.reassign_to == Some(job_id))
    }
}

impl NegotiationContext for SchedulerCore {
    fn max_jobs_to_offer(&self) -> usize {
        if self.shutdown.is_some() {
            return 0;
        }
        let pending = self.registry.len() - self.registry.count_in_state(ClaimState::Active);
        self.admission.available().saturating_sub(pending)
    }

    fn skip_job(&self, job_id: JobId, _offer: &MatchOffer) -> SkipDecision {
        if self.max_jobs_to_offer() == 0 {
            return SkipDecision::SkipAll;
        }
        match self.store.get(job_id) {
            Some(job) if job.is_runnable(Utc::now(), self.round) && !self.is_matched(job_id) => {
                SkipDecision::Accept
            }
            _ => SkipDecision::Skip,
        }
    }
}
