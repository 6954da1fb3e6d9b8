use chrono::Utc;

use crate::claim::{Claim, ClaimId, ClaimState};
use crate::core::{SchedulerCore, ShutdownMode};
use crate::error::{Result, SchedError};
use crate::handler::{HandlerRecord, HandlerSignal, HandlerState};
use crate::job::{Job, JobId, JobStatus};

impl SchedulerCore {
    /// Re-attach to jobs a previous instance left running.
    ///
    /// A job whose persisted lease is still valid gets its claim back and a
    /// reconnect handler queued; the others go back to idle without
    /// contacting their resource owner. Returns the number of reconnects.
    pub fn recover(&mut self) -> usize {
        let now = Utc::now();
        let running: Vec<JobId> = self
            .store
            .jobs()
            .filter(|job| job.status == JobStatus::Running)
            .map(|job| job.id)
            .collect();

        let mut reconnecting = 0;
        for job_id in running {
            let Some(job) = self.store.get_mut(job_id) else {
                continue;
            };
            let persisted = match job.claim.clone() {
                Some(persisted) if persisted.lease_expires_at > now => persisted,
                Some(_) => {
                    job.set_status(JobStatus::Idle);
                    job.idle_reason = Some("job lease expired while the scheduler was down".to_string());
                    job.claim = None;
                    tracing::info!(job_id = %job_id, "Lease expired, job returned to idle");
                    continue;
                }
                None => {
                    job.set_status(JobStatus::Idle);
                    job.idle_reason = Some("scheduler restarted before the job started".to_string());
                    continue;
                }
            };
            let owner = job.owner.clone();
            let universe = job.universe;

            let claim_id = ClaimId::new(persisted.claim_id);
            let claim = Claim::new(
                claim_id.clone(),
                persisted.peer,
                job_id,
                persisted.match_ad,
                owner,
                persisted.pool,
            );
            match self.registry.add(claim) {
                Ok(claim) => claim.lease_expires_at = Some(persisted.lease_expires_at),
                Err(existing) => {
                    tracing::warn!(claim = %existing.id, job_id = %job_id, "Persisted claim id already registered");
                    if let Some(job) = self.store.get_mut(job_id) {
                        job.set_status(JobStatus::Idle);
                        job.idle_reason = Some("persisted claim conflicts with another job".to_string());
                        job.claim = None;
                    }
                    continue;
                }
            }
            self.registry.set_state(&claim_id, ClaimState::Claimed);
            let hid = self
                .handlers
                .insert(HandlerRecord::new(job_id, claim_id.clone(), universe).reconnect());
            if let Some(claim) = self.registry.get_mut(&claim_id) {
                claim.handler = Some(hid);
            }
            self.dispatch.enqueue(hid);
            reconnecting += 1;
            tracing::info!(job_id = %job_id, claim = %claim_id, "Reconnecting to running job");
        }
        self.commit();
        tracing::info!(jobs = self.store.jobs().count(), reconnecting, "Job queue recovered");
        reconnecting
    }

    pub fn submit_job(&mut self, job: Job) -> Result<JobId> {
        if self.shutdown.is_some() {
            return Err(SchedError::ShuttingDown);
        }
        let owner = job.owner.clone();
        let id = self.store.submit(job)?;
        self.store.commit()?;
        tracing::info!(job_id = %id, owner = %owner, "Job submitted");
        Ok(id)
    }

    pub fn hold_job(&mut self, job_id: JobId, reason: String) -> Result<()> {
        let job = self
            .store
            .get_mut(job_id)
            .ok_or(SchedError::JobNotFound(job_id))?;
        match job.status {
            JobStatus::Held => return Ok(()),
            JobStatus::Completed | JobStatus::Removed => {
                return Err(SchedError::InvalidJobState {
                    job: job_id,
                    status: job.status,
                    action: "hold",
                })
            }
            JobStatus::Idle | JobStatus::Running => {}
        }
        job.set_status(JobStatus::Held);
        tracing::info!(job_id = %job_id, reason = %reason, "Job held");
        job.hold_reason = Some(reason);
        self.withdraw_job(job_id);
        self.commit();
        Ok(())
    }

    pub fn remove_job(&mut self, job_id: JobId) -> Result<()> {
        let job = self
            .store
            .get_mut(job_id)
            .ok_or(SchedError::JobNotFound(job_id))?;
        match job.status {
            JobStatus::Removed => return Ok(()),
            JobStatus::Completed => {
                return Err(SchedError::InvalidJobState {
                    job: job_id,
                    status: job.status,
                    action: "remove",
                })
            }
            JobStatus::Idle | JobStatus::Running | JobStatus::Held => {}
        }
        job.set_status(JobStatus::Removed);
        tracing::info!(job_id = %job_id, "Job removed");
        self.withdraw_job(job_id);
        self.commit();
        Ok(())
    }

    /// Drop a removed job from the queue without waiting for its handler.
    /// A handler still winding down finds no job when it exits; its claim
    /// is torn down and nothing is written back.
    pub fn purge_job(&mut self, job_id: JobId) -> Result<()> {
        let job = self.store.get(job_id).ok_or(SchedError::JobNotFound(job_id))?;
        if job.status != JobStatus::Removed {
            return Err(SchedError::InvalidJobState {
                job: job_id,
                status: job.status,
                action: "purge",
            });
        }
        self.store.delete(job_id);
        tracing::info!(job_id = %job_id, "Job purged from the queue");
        self.commit();
        Ok(())
    }

    /// Pull a job that stopped being runnable off whatever it holds.
    fn withdraw_job(&mut self, job_id: JobId) {
        if let Some(record) = self.handlers.find_by_job(job_id) {
            let (hid, state) = (record.id, record.state);
            match state {
                HandlerState::Queued => {
                    if let Some(job) = self.store.get_mut(job_id) {
                        job.claim = None;
                    }
                    if let Some(claim_id) = self.cancel_queued_handler(hid) {
                        self.registry.set_state(&claim_id, ClaimState::Claimed);
                        self.registry.rebind(&claim_id, JobId::UNBOUND);
                        self.seek_new_job(&claim_id);
                    }
                }
                HandlerState::Spawning | HandlerState::Running => {
                    self.vacate_handler(hid, HandlerSignal::Vacate);
                }
                HandlerState::Exited => {}
            }
            return;
        }
        let Some(claim) = self.registry.find_by_job(job_id) else {
            return;
        };
        let (claim_id, state) = (claim.id.clone(), claim.state);
        if state == ClaimState::Limbo {
            self.acquirer.cancel(&claim_id);
        } else {
            self.registry.rebind(&claim_id, JobId::UNBOUND);
            self.seek_new_job(&claim_id);
        }
    }

    /// Stop negotiating and launching, and wind down running handlers.
    ///
    /// A graceful shutdown asks handlers to vacate; a fast one kills them.
    /// Either way their jobs keep the claim attributes needed to reconnect
    /// after a restart. A fast request escalates a graceful shutdown already
    /// under way.
    pub(super) fn begin_shutdown(&mut self, mode: ShutdownMode) {
        let escalating = self.shutdown == Some(ShutdownMode::Graceful) && mode == ShutdownMode::Fast;
        if self.shutdown.is_some() && !escalating {
            return;
        }
        self.shutdown = Some(mode);
        match mode {
            ShutdownMode::Graceful => tracing::info!(
                handlers = self.handlers.len(),
                claims = self.registry.len(),
                "Graceful shutdown started"
            ),
            ShutdownMode::Fast => tracing::warn!(
                handlers = self.handlers.len(),
                claims = self.registry.len(),
                "Fast shutdown started"
            ),
        }

        if !escalating {
            for session in self.sessions.keys().copied().collect::<Vec<_>>() {
                self.abort_negotiation(session);
            }
            let limbo: Vec<ClaimId> = self
                .registry
                .iter()
                .filter(|c| c.state == ClaimState::Limbo)
                .map(|c| c.id.clone())
                .collect();
            for claim_id in limbo {
                self.acquirer.cancel(&claim_id);
            }

            let queued: Vec<_> = self
                .handlers
                .iter()
                .filter(|r| r.state == HandlerState::Queued)
                .map(|r| (r.id, r.flags.is_reconnect))
                .collect();
            for (hid, reconnect) in queued {
                let Some(claim_id) = self.cancel_queued_handler(hid) else {
                    continue;
                };
                if reconnect {
                    self.registry.discard(&claim_id);
                } else {
                    self.release_claim_now(&claim_id);
                }
            }
        }

        let signal = match mode {
            ShutdownMode::Graceful => HandlerSignal::Vacate,
            ShutdownMode::Fast => HandlerSignal::Kill,
        };
        for hid in self.handlers.ids() {
            let Some(record) = self.handlers.get_mut(hid) else {
                continue;
            };
            if matches!(record.state, HandlerState::Spawning | HandlerState::Running) {
                record.flags.keep_claim_attributes = true;
                self.vacate_handler(hid, signal);
            }
        }

        let idle: Vec<ClaimId> = self
            .registry
            .iter()
            .filter(|c| c.state == ClaimState::Claimed && c.handler.is_none())
            .map(|c| c.id.clone())
            .collect();
        for claim_id in idle {
            self.release_claim_now(&claim_id);
        }
        self.commit();
    }
}
