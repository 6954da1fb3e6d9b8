use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::job::{Job, JobStatus};
use crate::policy::Evaluator;
use crate::reconcile::ExitClass;

/// Upper bound on a job's cooldown (30 days).
pub const MAX_COOLDOWN_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// What happens to the claim once a handler's exit has been reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAction {
    Release,
    /// Tear down without a release RPC; the owner is already closing it.
    ReleaseWithoutRpc,
    /// Keep the claim and look for another job to run on it.
    SeekNewJob,
    /// Forget the claim locally but leave it on the job for reconnection.
    KeepForReconnect,
}

/// Inputs describing the handler and claim at exit time.
#[derive(Debug, Clone, Copy)]
pub struct ExitContext {
    pub class: ExitClass,
    pub exit_code: Option<i32>,
    /// The claim's exception count before this exit.
    pub num_exceptions: u32,
    pub owner_closing: bool,
    pub keep_claim_attributes: bool,
    /// Current negotiation round.
    pub round: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub class: ExitClass,
    /// Status written to the job; `None` when the job was not touched.
    pub job_status: Option<JobStatus>,
    pub claim_action: ClaimAction,
    pub num_exceptions: u32,
}

/// Maps a classified handler exit to a job transition and a claim action.
pub struct ExitReconciler {
    max_exceptions: u32,
    cooldown_expr: Option<String>,
    evaluator: Arc<dyn Evaluator>,
}

impl ExitReconciler {
    pub fn new(
        max_exceptions: u32,
        cooldown_expr: Option<String>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            max_exceptions,
            cooldown_expr,
            evaluator,
        }
    }

    pub fn reconcile(
        &self,
        job: Option<&mut Job>,
        ctx: ExitContext,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let mut num_exceptions = ctx.num_exceptions;

        if ctx.keep_claim_attributes {
            return Reconciliation {
                class: ctx.class,
                job_status: None,
                claim_action: ClaimAction::KeepForReconnect,
                num_exceptions,
            };
        }

        let (job_status, action) = match job {
            // Removed underneath us: tear the claim down, write nothing.
            None => (None, ClaimAction::Release),
            Some(job) => {
                let (status, action) = self.transition(job, &ctx, &mut num_exceptions, now);
                job.claim = None;
                (Some(status), action)
            }
        };

        let claim_action = if ctx.owner_closing || ctx.class == ExitClass::ClaimClosing {
            ClaimAction::ReleaseWithoutRpc
        } else {
            action
        };

        Reconciliation {
            class: ctx.class,
            job_status,
            claim_action,
            num_exceptions,
        }
    }

    fn transition(
        &self,
        job: &mut Job,
        ctx: &ExitContext,
        num_exceptions: &mut u32,
        now: DateTime<Utc>,
    ) -> (JobStatus, ClaimAction) {
        // A hold or remove issued by a user while the handler ran stands.
        if matches!(job.status, JobStatus::Held | JobStatus::Removed) {
            return (job.status, ClaimAction::Release);
        }
        job.exit_code = ctx.exit_code;

        match ctx.class {
            ExitClass::Completed | ExitClass::ClaimClosing => {
                job.set_status(JobStatus::Completed);
                (JobStatus::Completed, ClaimAction::Release)
            }
            ExitClass::Requeue | ExitClass::NotStarted => {
                job.set_status(JobStatus::Idle);
                let until = self
                    .cooldown(job)
                    .and_then(|delay| Some((delay, now.checked_add_signed(delay)?)));
                match until {
                    Some((delay, until)) => {
                        let secs = delay.num_milliseconds() as f64 / 1000.0;
                        job.cooldown_until = Some(until);
                        job.idle_reason = Some(format!("cooling down for {secs}s"));
                        tracing::info!(job_id = %job.id, secs, "Job cooling down before redispatch");
                        (JobStatus::Idle, ClaimAction::SeekNewJob)
                    }
                    None => (JobStatus::Idle, ClaimAction::Release),
                }
            }
            ExitClass::Hold => {
                job.set_status(JobStatus::Held);
                job.hold_reason = Some(match ctx.exit_code {
                    Some(code) => format!("job handler requested hold (exit code {code})"),
                    None => "job handler requested hold".to_string(),
                });
                (JobStatus::Held, ClaimAction::Release)
            }
            ExitClass::Remove => {
                job.set_status(JobStatus::Removed);
                (JobStatus::Removed, ClaimAction::Release)
            }
            ExitClass::ResourceExhaustion => {
                job.set_status(JobStatus::Idle);
                job.suppressed_until_round = Some(ctx.round + 1);
                job.idle_reason = Some("insufficient resources to start job".to_string());
                (JobStatus::Idle, ClaimAction::Release)
            }
            ExitClass::ReconnectFailed => {
                job.set_status(JobStatus::Idle);
                job.idle_reason = Some("reconnect to running job failed".to_string());
                (JobStatus::Idle, ClaimAction::Release)
            }
            ExitClass::Exception => {
                *num_exceptions += 1;
                job.set_status(JobStatus::Idle);
                if *num_exceptions > self.max_exceptions {
                    job.idle_reason = Some(format!(
                        "job handler failed {} times on this claim",
                        *num_exceptions
                    ));
                    tracing::warn!(job_id = %job.id, exceptions = *num_exceptions, "Exception limit exceeded, releasing claim");
                    (JobStatus::Idle, ClaimAction::Release)
                } else {
                    job.idle_reason = Some("job handler exception".to_string());
                    (JobStatus::Idle, ClaimAction::SeekNewJob)
                }
            }
        }
    }

    /// Cooldown yielded by the configured expression, at millisecond
    /// precision and capped at [`MAX_COOLDOWN_SECS`]. Non-positive or
    /// non-numeric results mean no cooldown.
    fn cooldown(&self, job: &Job) -> Option<ChronoDuration> {
        let expr = self.cooldown_expr.as_deref()?;
        let secs = self
            .evaluator
            .eval_number(expr, &job.full_ad(), &crate::ad::Ad::new())?;
        if secs.is_nan() || secs <= 0.0 {
            return None;
        }
        let millis = (secs.min(MAX_COOLDOWN_SECS) * 1000.0).ceil() as i64;
        ChronoDuration::try_milliseconds(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, PersistedClaim, Universe};
    use crate::policy::SimpleEvaluator;

    fn reconciler(cooldown: Option<&str>) -> ExitReconciler {
        ExitReconciler::new(2, cooldown.map(str::to_string), Arc::new(SimpleEvaluator))
    }

    fn running_job() -> Job {
        let mut job = Job::new(JobId::new(10, 0), "alice", Universe::Vanilla);
        job.set_status(JobStatus::Running);
        job.claim = Some(PersistedClaim {
            claim_id: "c1".to_string(),
            peer: "10.0.0.5:9620".to_string(),
            pool: String::new(),
            match_ad: Default::default(),
            lease_expires_at: Utc::now(),
        });
        job
    }

    fn ctx(class: ExitClass) -> ExitContext {
        ExitContext {
            class,
            exit_code: Some(100),
            num_exceptions: 0,
            owner_closing: false,
            keep_claim_attributes: false,
            round: 7,
        }
    }

    #[test]
    fn completion_releases_claim() {
        let mut job = running_job();
        let r = reconciler(None).reconcile(Some(&mut job), ctx(ExitClass::Completed), Utc::now());
        assert_eq!(r.job_status, Some(JobStatus::Completed));
        assert_eq!(r.claim_action, ClaimAction::Release);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(100));
        assert!(job.claim.is_none());
    }

    #[test]
    fn requeue_without_cooldown_releases() {
        let mut job = running_job();
        let r = reconciler(None).reconcile(Some(&mut job), ctx(ExitClass::Requeue), Utc::now());
        assert_eq!(job.status, JobStatus::Idle);
        assert_eq!(r.claim_action, ClaimAction::Release);
        assert!(job.cooldown_until.is_none());
    }

    #[test]
    fn requeue_with_cooldown_defers_job_and_keeps_claim() {
        let mut job = running_job();
        job.ad.insert("Backoff", 90);
        let now = Utc::now();
        let r = reconciler(Some("MY.Backoff")).reconcile(Some(&mut job), ctx(ExitClass::NotStarted), now);
        assert_eq!(r.claim_action, ClaimAction::SeekNewJob);
        assert_eq!(job.cooldown_until, Some(now + ChronoDuration::seconds(90)));
        assert!(!job.is_runnable(now, 0));
    }

    #[test]
    fn zero_cooldown_is_no_cooldown() {
        let mut job = running_job();
        let r = reconciler(Some("0")).reconcile(Some(&mut job), ctx(ExitClass::Requeue), Utc::now());
        assert_eq!(r.claim_action, ClaimAction::Release);
    }

    #[test]
    fn sub_second_cooldown_is_honoured() {
        let mut job = running_job();
        let now = Utc::now();
        let r = reconciler(Some("0.25")).reconcile(Some(&mut job), ctx(ExitClass::Requeue), now);
        assert_eq!(r.claim_action, ClaimAction::SeekNewJob);
        assert_eq!(job.cooldown_until, Some(now + ChronoDuration::milliseconds(250)));
    }

    #[test]
    fn huge_cooldown_is_capped() {
        let mut job = running_job();
        job.ad.insert("Backoff", 1e13);
        let now = Utc::now();
        let r = reconciler(Some("MY.Backoff")).reconcile(Some(&mut job), ctx(ExitClass::Requeue), now);
        assert_eq!(r.claim_action, ClaimAction::SeekNewJob);
        assert_eq!(
            job.cooldown_until,
            Some(now + ChronoDuration::seconds(MAX_COOLDOWN_SECS as i64))
        );
    }

    #[test]
    fn cooldown_past_the_calendar_is_dropped() {
        let mut job = running_job();
        job.ad.insert("Backoff", 60);
        let r = reconciler(Some("MY.Backoff")).reconcile(
            Some(&mut job),
            ctx(ExitClass::Requeue),
            DateTime::<Utc>::MAX_UTC,
        );
        assert_eq!(r.claim_action, ClaimAction::Release);
        assert!(job.cooldown_until.is_none());
    }

    #[test]
    fn hold_records_reason() {
        let mut job = running_job();
        let mut c = ctx(ExitClass::Hold);
        c.exit_code = Some(112);
        reconciler(None).reconcile(Some(&mut job), c, Utc::now());
        assert_eq!(job.status, JobStatus::Held);
        assert!(job.hold_reason.as_deref().unwrap().contains("112"));
    }

    #[test]
    fn resource_exhaustion_suppresses_this_round() {
        let mut job = running_job();
        reconciler(None).reconcile(Some(&mut job), ctx(ExitClass::ResourceExhaustion), Utc::now());
        assert_eq!(job.status, JobStatus::Idle);
        assert!(!job.is_runnable(Utc::now(), 7));
        assert!(job.is_runnable(Utc::now(), 8));
    }

    #[test]
    fn exceptions_seek_new_job_until_limit() {
        let rec = reconciler(None);
        let mut job = running_job();
        let mut c = ctx(ExitClass::Exception);
        c.num_exceptions = 1;
        let r = rec.reconcile(Some(&mut job), c, Utc::now());
        assert_eq!(r.num_exceptions, 2);
        assert_eq!(r.claim_action, ClaimAction::SeekNewJob);

        let mut job = running_job();
        c.num_exceptions = 2;
        let r = rec.reconcile(Some(&mut job), c, Utc::now());
        assert_eq!(r.num_exceptions, 3);
        assert_eq!(r.claim_action, ClaimAction::Release);
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.idle_reason.is_some());
    }

    #[test]
    fn vanished_job_is_not_written() {
        let r = reconciler(None).reconcile(None, ctx(ExitClass::Completed), Utc::now());
        assert_eq!(r.job_status, None);
        assert_eq!(r.claim_action, ClaimAction::Release);
    }

    #[test]
    fn user_hold_wins_over_exit_class() {
        let mut job = running_job();
        job.set_status(JobStatus::Held);
        let r = reconciler(None).reconcile(Some(&mut job), ctx(ExitClass::Completed), Utc::now());
        assert_eq!(r.job_status, Some(JobStatus::Held));
        assert_eq!(job.status, JobStatus::Held);
        assert_eq!(r.claim_action, ClaimAction::Release);
    }

    #[test]
    fn claim_closing_never_sends_release_rpc() {
        let mut job = running_job();
        let r = reconciler(None).reconcile(Some(&mut job), ctx(ExitClass::ClaimClosing), Utc::now());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(r.claim_action, ClaimAction::ReleaseWithoutRpc);
    }

    #[test]
    fn owner_revocation_with_should_remove() {
        let mut job = running_job();
        let mut c = ctx(ExitClass::Remove);
        c.owner_closing = true;
        let r = reconciler(None).reconcile(Some(&mut job), c, Utc::now());
        assert_eq!(job.status, JobStatus::Removed);
        assert_eq!(r.claim_action, ClaimAction::ReleaseWithoutRpc);
    }

    #[test]
    fn graceful_shutdown_keeps_job_running() {
        let mut job = running_job();
        let mut c = ctx(ExitClass::Requeue);
        c.keep_claim_attributes = true;
        let r = reconciler(None).reconcile(Some(&mut job), c, Utc::now());
        assert_eq!(r.claim_action, ClaimAction::KeepForReconnect);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.claim.is_some());
    }
}
