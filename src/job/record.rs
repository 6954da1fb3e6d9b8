use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ad::{attr, Ad};
use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Idle,
    Running,
    Held,
    Removed,
    Completed,
}

impl JobStatus {
    /// Held, removed and completed jobs have left the runnable population.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Held | JobStatus::Removed | JobStatus::Completed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Idle => write!(f, "idle"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Held => write!(f, "held"),
            JobStatus::Removed => write!(f, "removed"),
            JobStatus::Completed => write!(f, "completed"),
        }
    }
}

/// How a handler treats an abnormal outcome for a universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPolicy {
    /// The job's executable could not be started: hold instead of retrying.
    pub hold_on_exec_failure: bool,
    /// A handler killed by a signal the scheduler did not send goes back to
    /// idle instead of counting as an exception.
    pub requeue_on_signal: bool,
}

/// Execution mode of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Universe {
    Vanilla,
    Java,
    Container,
    Parallel,
}

impl Universe {
    /// Whether a running handler may be recycled onto another job without
    /// exiting.
    pub fn supports_reuse(self) -> bool {
        match self {
            Universe::Vanilla | Universe::Java | Universe::Container => true,
            Universe::Parallel => false,
        }
    }

    /// Whether jobs of this universe may be folded into a shared
    /// autocluster request. Parallel jobs are always offered on their own.
    pub fn can_share_queue_slot(self) -> bool {
        !matches!(self, Universe::Parallel)
    }

    pub fn exit_policy(self) -> ExitPolicy {
        match self {
            Universe::Vanilla | Universe::Java => ExitPolicy {
                hold_on_exec_failure: false,
                requeue_on_signal: false,
            },
            Universe::Container => ExitPolicy {
                hold_on_exec_failure: true,
                requeue_on_signal: false,
            },
            Universe::Parallel => ExitPolicy {
                hold_on_exec_failure: true,
                requeue_on_signal: true,
            },
        }
    }
}

impl fmt::Display for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Universe::Vanilla => write!(f, "vanilla"),
            Universe::Java => write!(f, "java"),
            Universe::Container => write!(f, "container"),
            Universe::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for Universe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "vanilla" => Ok(Universe::Vanilla),
            "java" => Ok(Universe::Java),
            "container" | "docker" => Ok(Universe::Container),
            "parallel" => Ok(Universe::Parallel),
            other => Err(format!("unknown universe: {other}")),
        }
    }
}

/// Claim attributes persisted on a running job so a restarted scheduler can
/// reconnect to its handler's resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedClaim {
    pub claim_id: String,
    pub peer: String,
    pub pool: String,
    pub match_ad: Ad,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub status: JobStatus,
    pub universe: Universe,
    pub priority: i32,
    pub ad: Ad,
    /// Pools this job may flock to. `None` allows every pool.
    pub allowed_pools: Option<Vec<String>>,
    pub hold_reason: Option<String>,
    /// Why the job is idle after having been dispatched.
    pub idle_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub num_starts: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Negotiation round before which the job is not offered again.
    pub suppressed_until_round: Option<u64>,
    pub claim: Option<PersistedClaim>,
    pub submitted_at: DateTime<Utc>,
    pub entered_status_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, owner: impl Into<String>, universe: Universe) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner: owner.into(),
            status: JobStatus::Idle,
            universe,
            priority: 0,
            ad: Ad::new(),
            allowed_pools: None,
            hold_reason: None,
            idle_reason: None,
            exit_code: None,
            num_starts: 0,
            cooldown_until: None,
            suppressed_until_round: None,
            claim: None,
            submitted_at: now,
            entered_status_at: now,
            completed_at: None,
        }
    }

    pub fn with_ad(mut self, ad: Ad) -> Self {
        self.ad = ad;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_allowed_pools(mut self, pools: Vec<String>) -> Self {
        self.allowed_pools = Some(pools);
        self
    }

    pub fn set_status(&mut self, status: JobStatus) {
        if self.status != status {
            self.status = status;
            self.entered_status_at = Utc::now();
        }
        if status == JobStatus::Completed {
            self.completed_at = Some(self.entered_status_at);
        }
    }

    pub fn allows_pool(&self, pool: &str) -> bool {
        if pool.is_empty() {
            return true;
        }
        match &self.allowed_pools {
            Some(pools) => pools.iter().any(|p| p == pool),
            None => true,
        }
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn is_suppressed(&self, round: u64) -> bool {
        self.suppressed_until_round.is_some_and(|r| round < r)
    }

    /// Idle, not cooling down and not suppressed for `round`.
    pub fn is_runnable(&self, now: DateTime<Utc>, round: u64) -> bool {
        self.status == JobStatus::Idle && !self.is_cooling_down(now) && !self.is_suppressed(round)
    }

    /// The job's attributes plus its identity, as seen by policy expressions
    /// and handlers.
    pub fn full_ad(&self) -> Ad {
        let mut ad = self.ad.clone();
        ad.insert(attr::CLUSTER_ID, self.id.cluster);
        ad.insert(attr::PROC_ID, self.id.proc);
        ad.insert(attr::OWNER, self.owner.clone());
        ad.insert(attr::JOB_UNIVERSE, self.universe.to_string());
        ad.insert(attr::JOB_PRIO, self.priority);
        ad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_job_is_idle_and_runnable() {
        let job = Job::new(JobId::new(1, 0), "alice", Universe::Vanilla);
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.is_runnable(Utc::now(), 0));
        assert!(job.claim.is_none());
    }

    #[test]
    fn cooldown_and_suppression_block_runnability() {
        let now = Utc::now();
        let mut job = Job::new(JobId::new(1, 0), "alice", Universe::Vanilla);
        job.cooldown_until = Some(now + Duration::seconds(30));
        assert!(!job.is_runnable(now, 0));
        assert!(job.is_runnable(now + Duration::seconds(31), 0));

        job.cooldown_until = None;
        job.suppressed_until_round = Some(4);
        assert!(!job.is_runnable(now, 3));
        assert!(job.is_runnable(now, 4));
    }

    #[test]
    fn pool_policy() {
        let job = Job::new(JobId::new(1, 0), "alice", Universe::Vanilla)
            .with_allowed_pools(vec!["cm.east".to_string()]);
        assert!(job.allows_pool(""));
        assert!(job.allows_pool("cm.east"));
        assert!(!job.allows_pool("cm.west"));
    }

    #[test]
    fn completed_status_records_completion_time() {
        let mut job = Job::new(JobId::new(1, 0), "alice", Universe::Vanilla);
        job.set_status(JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn universe_capabilities() {
        assert!(Universe::Vanilla.supports_reuse());
        assert!(!Universe::Parallel.supports_reuse());
        assert!(!Universe::Parallel.can_share_queue_slot());
        assert!(Universe::Container.exit_policy().hold_on_exec_failure);
        assert_eq!("docker".parse::<Universe>().unwrap(), Universe::Container);
        assert!("grid".parse::<Universe>().is_err());
    }

    #[test]
    fn full_ad_carries_identity() {
        let job = Job::new(JobId::new(7, 2), "bob", Universe::Java).with_priority(3);
        let ad = job.full_ad();
        assert_eq!(ad.get_i64(attr::CLUSTER_ID), Some(7));
        assert_eq!(ad.get_i64(attr::PROC_ID), Some(2));
        assert_eq!(ad.get_str(attr::OWNER), Some("bob"));
        assert_eq!(ad.get_str(attr::JOB_UNIVERSE), Some("java"));
        assert_eq!(ad.get_i64(attr::JOB_PRIO), Some(3));
    }
}
