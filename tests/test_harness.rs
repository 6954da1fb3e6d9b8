//! Test harness for scheduler-core integration tests.
//!
//! Provides a scripted resource owner, throwaway job-handler scripts and a
//! helper that drives a whole negotiation session against a core.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schedd_lite::acquirer::{ClaimReply, ClaimRequest, Leftover, ResourceOwner};
use schedd_lite::ad::Ad;
use schedd_lite::claim::ClaimId;
use schedd_lite::config::SchedulerConfig;
use schedd_lite::core::{SchedulerCore, SchedulerHandle, SessionStep};
use schedd_lite::error::Result;
use schedd_lite::job::{Job, JobId, JobQueue, JobStore, Universe};
use schedd_lite::negotiator::{MatchOffer, MatchmakerMessage, NegotiationHeader, ScheddMessage};
use schedd_lite::policy::SimpleEvaluator;

pub const PEER: &str = "127.0.0.1:9620";

/// How the fake owner answers claim requests.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum OwnerMode {
    Grant,
    /// Grant, handing out these leftovers once.
    GrantWithLeftovers(Vec<Leftover>),
    Refuse(String),
    /// Never answer.
    Hang,
}

/// Resource owner that records every request and release it sees.
pub struct FakeOwner {
    mode: Mutex<OwnerMode>,
    requests: Mutex<Vec<ClaimRequest>>,
    releases: Mutex<Vec<ClaimId>>,
}

#[allow(dead_code)]
impl FakeOwner {
    pub fn new(mode: OwnerMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            requests: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: OwnerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn requests(&self) -> Vec<ClaimRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<ClaimId> {
        self.releases.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl ResourceOwner for FakeOwner {
    async fn request_claim(&self, request: ClaimRequest) -> Result<ClaimReply> {
        self.requests.lock().unwrap().push(request);
        let mode = {
            let mut mode = self.mode.lock().unwrap();
            match &*mode {
                OwnerMode::GrantWithLeftovers(_) => std::mem::replace(&mut *mode, OwnerMode::Grant),
                other => other.clone(),
            }
        };
        match mode {
            OwnerMode::Grant => Ok(ClaimReply::granted()),
            OwnerMode::GrantWithLeftovers(leftovers) => Ok(ClaimReply {
                leftovers,
                ..ClaimReply::granted()
            }),
            OwnerMode::Refuse(reason) => Ok(ClaimReply::refused(reason)),
            OwnerMode::Hang => std::future::pending().await,
        }
    }

    async fn release_claim(&self, _peer: &str, claim_id: &ClaimId) -> Result<()> {
        self.releases.lock().unwrap().push(claim_id.clone());
        Ok(())
    }
}

/// Write an executable `/bin/sh` script to `dir/name`.
pub fn handler_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Script body that runs until vacated, then exits with the "killed" code.
#[allow(dead_code)]
pub const RUN_UNTIL_VACATED: &str =
    "trap 'kill $pid 2>/dev/null; exit 102' TERM\nsleep 30 &\npid=$!\nwait $pid\nexit 100";

/// Config with a short tick and unthrottled dispatch.
pub fn test_config(dir: &Path, program: PathBuf) -> SchedulerConfig {
    let mut config = SchedulerConfig::new("test-schedd", "127.0.0.1:9618".parse().unwrap())
        .with_handler_program(program)
        .with_spool_dir(dir.join("spool"))
        .with_throttle(100, 0);
    config.tick_interval_ms = 50;
    config
}

pub fn job(cluster: i32, proc: i32, owner: &str) -> Job {
    Job::new(JobId::new(cluster, proc), owner, Universe::Vanilla)
        .with_ad(Ad::new().with("RequestCpus", 1))
}

pub fn build_core(
    config: SchedulerConfig,
    jobs: Vec<Job>,
    owner: Arc<FakeOwner>,
) -> (SchedulerCore, SchedulerHandle) {
    build_core_with_store(config, queue_of(jobs), owner)
}

pub fn build_core_with_store(
    config: SchedulerConfig,
    store: JobQueue,
    owner: Arc<FakeOwner>,
) -> (SchedulerCore, SchedulerHandle) {
    SchedulerCore::new(config, Box::new(store), Arc::new(SimpleEvaluator), owner)
}

pub fn queue_of(jobs: Vec<Job>) -> JobQueue {
    let mut queue = JobQueue::new();
    for job in jobs {
        queue.submit(job).unwrap();
    }
    queue
}

pub fn offer(request_id: u64, claim: &str) -> MatchmakerMessage {
    MatchmakerMessage::Match(MatchOffer {
        request_id,
        claim_id: ClaimId::new(claim),
        peer: PEER.to_string(),
        match_ad: Ad::new().with("Name", claim).with("Memory", 2048),
    })
}

/// Run a whole home-pool session for `submitter`, matching one offered
/// resource per claim name in order. Returns the final step.
pub fn negotiate(core: &mut SchedulerCore, submitter: &str, claims: &[&str]) -> SessionStep {
    let session = core
        .begin_negotiation(NegotiationHeader::new(submitter))
        .unwrap();

    let mut requests = Vec::new();
    loop {
        let step = core
            .negotiation_message(session, MatchmakerMessage::SendJobInfo)
            .unwrap();
        match step.replies.first() {
            Some(ScheddMessage::Request(request)) => requests.push((request.request_id, request.count)),
            _ => break,
        }
    }

    let mut slots = requests
        .iter()
        .flat_map(|(id, count)| std::iter::repeat(*id).take(*count));
    for claim in claims {
        let request_id = slots.next().expect("more claims than offered jobs");
        core.negotiation_message(session, offer(request_id, claim))
            .unwrap();
    }

    core.negotiation_message(session, MatchmakerMessage::EndNegotiate)
        .unwrap()
}

/// Step `core` until `done` holds, failing the test after ten seconds.
pub async fn pump_until(core: &mut SchedulerCore, what: &str, done: impl FnMut(&SchedulerCore) -> bool) {
    assert!(
        core.pump_until(done, Duration::from_secs(10)).await,
        "timed out waiting for {what}"
    );
}
