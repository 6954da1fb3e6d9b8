use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Job-handler launch throttle.
///
/// At most `job_start_count` handlers are started inside any window of
/// `job_start_delay_ms`. A per-job `NextJobStartDelay` hint may lengthen the
/// pause after a launch, capped at `max_next_job_start_delay_ms`.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub job_start_count: usize,
    pub job_start_delay_ms: u64,
    pub max_next_job_start_delay_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            job_start_count: 1,
            job_start_delay_ms: 0,
            max_next_job_start_delay_ms: 600_000,
        }
    }
}

impl ThrottleConfig {
    pub fn job_start_delay(&self) -> Duration {
        Duration::from_millis(self.job_start_delay_ms)
    }

    pub fn max_next_job_start_delay(&self) -> Duration {
        Duration::from_millis(self.max_next_job_start_delay_ms)
    }
}

/// Flocking configuration.
///
/// `pools` lists remote pools in the order they are flocked to. Level 0 is
/// the home pool only; level N additionally admits the first N pools.
#[derive(Debug, Clone, Default)]
pub struct FlockConfig {
    pub pools: Vec<String>,
    pub min_level: usize,
}

/// Where job handlers come from and where they get their scratch space.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Executable spawned once per dispatched job.
    pub program: PathBuf,
    /// Per-job working directories are created below this path.
    pub spool_dir: PathBuf,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/libexec/schedd-lite/job-handler"),
            spool_dir: std::env::temp_dir().join("schedd-lite").join("spool"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name this daemon advertises to resource owners.
    pub name: String,
    pub listen_addr: SocketAddr,
    pub tick_interval_ms: u64,
    /// Admission-control ceiling on concurrently running handlers.
    pub max_jobs_running: usize,
    /// Cap on in-flight claim requests; 0 means unbounded.
    pub max_pending_contacts: usize,
    pub request_claim_timeout_ms: u64,
    pub alive_interval_secs: u64,
    pub max_exceptions: u32,
    pub claim_idle_timeout_ms: u64,
    pub recycle_ack_timeout_ms: u64,
    pub job_lease_duration_secs: u64,
    /// Policy expression evaluated over a job after a requeue-class exit;
    /// a positive result is the cooldown in seconds.
    pub cooldown_expr: Option<String>,
    /// Attributes used for autocluster signatures when the matchmaker does
    /// not send its own list.
    pub significant_attributes: Vec<String>,
    pub throttle: ThrottleConfig,
    pub flock: FlockConfig,
    pub handler: HandlerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "schedd-lite".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9618)),
            tick_interval_ms: 1_000,
            max_jobs_running: 10_000,
            max_pending_contacts: 0,
            request_claim_timeout_ms: 30 * 60 * 1_000,
            alive_interval_secs: 300,
            max_exceptions: 5,
            claim_idle_timeout_ms: 60_000,
            recycle_ack_timeout_ms: 30_000,
            job_lease_duration_secs: 40 * 60,
            cooldown_expr: None,
            significant_attributes: vec![
                "RequestCpus".to_string(),
                "RequestMemory".to_string(),
                "RequestDisk".to_string(),
                "Requirements".to_string(),
            ],
            throttle: ThrottleConfig::default(),
            flock: FlockConfig::default(),
            handler: HandlerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_flock_pool(mut self, pool: impl Into<String>) -> Self {
        self.flock.pools.push(pool.into());
        self
    }

    pub fn with_handler_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.handler.program = program.into();
        self
    }

    pub fn with_spool_dir(mut self, spool_dir: impl Into<PathBuf>) -> Self {
        self.handler.spool_dir = spool_dir.into();
        self
    }

    pub fn with_throttle(mut self, job_start_count: usize, job_start_delay_ms: u64) -> Self {
        self.throttle.job_start_count = job_start_count.max(1);
        self.throttle.job_start_delay_ms = job_start_delay_ms;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_claim_timeout(&self) -> Duration {
        Duration::from_millis(self.request_claim_timeout_ms)
    }

    pub fn claim_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_idle_timeout_ms)
    }

    pub fn recycle_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.recycle_ack_timeout_ms)
    }

    pub fn job_lease_duration(&self) -> Duration {
        Duration::from_secs(self.job_lease_duration_secs)
    }

    pub fn alive_interval(&self) -> Duration {
        Duration::from_secs(self.alive_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_config_default() {
        let cfg = ThrottleConfig::default();
        assert_eq!(cfg.job_start_count, 1);
        assert_eq!(cfg.job_start_delay(), Duration::ZERO);
        assert_eq!(cfg.max_next_job_start_delay(), Duration::from_secs(600));
    }

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.name, "schedd-lite");
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9618");
        assert_eq!(cfg.max_pending_contacts, 0);
        assert_eq!(cfg.max_exceptions, 5);
        assert_eq!(cfg.request_claim_timeout(), Duration::from_secs(1800));
        assert!(cfg.flock.pools.is_empty());
        assert!(cfg.cooldown_expr.is_none());
    }

    #[test]
    fn scheduler_config_new() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = SchedulerConfig::new("submit-1", addr);
        assert_eq!(cfg.name, "submit-1");
        assert_eq!(cfg.listen_addr, addr);
    }

    #[test]
    fn with_flock_pool_preserves_order() {
        let cfg = SchedulerConfig::default()
            .with_flock_pool("cm.east")
            .with_flock_pool("cm.west");
        assert_eq!(cfg.flock.pools, vec!["cm.east", "cm.west"]);
    }

    #[test]
    fn with_throttle_clamps_zero_count() {
        let cfg = SchedulerConfig::default().with_throttle(0, 250);
        assert_eq!(cfg.throttle.job_start_count, 1);
        assert_eq!(cfg.throttle.job_start_delay(), Duration::from_millis(250));
    }
}
