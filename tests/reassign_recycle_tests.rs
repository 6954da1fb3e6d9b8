mod test_harness;

use std::time::Duration;

use schedd_lite::ad::Ad;
use schedd_lite::claim::{ClaimId, ClaimState};
use schedd_lite::error::SchedError;
use schedd_lite::handler::HandlerState;
use schedd_lite::job::{Job, JobId, JobStatus, Universe};
use test_harness::{
    build_core, handler_script, job, negotiate, pump_until, test_config, FakeOwner, OwnerMode,
    PEER, RUN_UNTIL_VACATED,
};

/// Handler script: job 10.0 runs until vacated, anything else completes.
fn first_job_lingers() -> String {
    format!("[ \"$SCHEDD_JOB_ID\" = \"10.0\" ] || exit 100\n{RUN_UNTIL_VACATED}")
}

/// A reassign naming a victim that is not running is rejected and leaves
/// every claim as it was.
#[tokio::test]
async fn test_reassign_rejects_victim_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", RUN_UNTIL_VACATED);
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice"), job(10, 1, "alice"), job(11, 0, "alice")],
        FakeOwner::new(OwnerMode::Grant),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "handler to run", |c| {
        c.status().handlers_running == 1
    })
    .await;

    let err = core
        .reassign_slot(JobId::new(11, 0), &[JobId::new(10, 0), JobId::new(10, 1)])
        .unwrap_err();
    assert!(matches!(err, SchedError::InvalidReassign(_)), "{err}");

    let claim = core.registry().get(&ClaimId::new("c1")).unwrap();
    assert_eq!(claim.state, ClaimState::Active);
    assert_eq!(claim.job_id, JobId::new(10, 0));
    assert!(claim.reassign_to.is_none());
    let record = core.handlers().find_by_job(JobId::new(10, 0)).unwrap();
    assert!(!record.flags.preempted);

    core.shutdown_signal().request_graceful();
    pump_until(&mut core, "handlers to wind down", |c| c.handlers().is_empty()).await;
}

/// Malformed reassign requests are rejected up front.
#[tokio::test]
async fn test_reassign_rejects_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", RUN_UNTIL_VACATED);
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice"), job(11, 0, "alice"), job(12, 0, "bob")],
        FakeOwner::new(OwnerMode::Grant),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "handler to run", |c| {
        c.status().handlers_running == 1
    })
    .await;

    assert!(matches!(
        core.reassign_slot(JobId::new(11, 0), &[]),
        Err(SchedError::InvalidReassign(_))
    ));
    assert!(matches!(
        core.reassign_slot(JobId::new(99, 0), &[JobId::new(10, 0)]),
        Err(SchedError::JobNotFound(_))
    ));
    // The running job is not idle, so it cannot benefit.
    assert!(matches!(
        core.reassign_slot(JobId::new(10, 0), &[JobId::new(10, 0)]),
        Err(SchedError::InvalidReassign(_))
    ));
    // Another owner's job cannot take alice's slot.
    assert!(matches!(
        core.reassign_slot(JobId::new(12, 0), &[JobId::new(10, 0)]),
        Err(SchedError::InvalidReassign(_))
    ));
    assert!(core
        .registry()
        .iter()
        .all(|claim| claim.reassign_to.is_none()));

    core.shutdown_signal().request_graceful();
    pump_until(&mut core, "handlers to wind down", |c| c.handlers().is_empty()).await;
}

/// The victim is vacated and its claim goes straight to the beneficiary,
/// without a release in between.
#[tokio::test]
async fn test_reassign_hands_claim_to_beneficiary() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", &first_job_lingers());
    let owner = FakeOwner::new(OwnerMode::Grant);
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice"), job(11, 0, "alice")],
        owner.clone(),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "victim to run", |c| {
        c.status().handlers_running == 1
    })
    .await;

    core.reassign_slot(JobId::new(11, 0), &[JobId::new(10, 0)])
        .unwrap();
    assert_eq!(
        core.registry().get(&ClaimId::new("c1")).unwrap().reassign_to,
        Some(JobId::new(11, 0))
    );
    // Earmarked: a second request for the same beneficiary is refused.
    assert!(core
        .reassign_slot(JobId::new(11, 0), &[JobId::new(10, 0)])
        .is_err());

    pump_until(&mut core, "beneficiary to complete", |c| {
        c.job(JobId::new(11, 0)).unwrap().status == JobStatus::Completed
    })
    .await;
    pump_until(&mut core, "release", |_| !owner.released().is_empty()).await;

    let victim = core.job(JobId::new(10, 0)).unwrap();
    assert_eq!(victim.status, JobStatus::Idle);
    assert!(victim.claim.is_none());
    assert_eq!(owner.released(), vec![ClaimId::new("c1")]);
    assert_eq!(owner.requests().len(), 1);
}

/// A recycling handler is rebound to the next runnable job on its claim
/// and must acknowledge it.
#[tokio::test]
async fn test_recycle_rebinds_handler_to_next_job() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", RUN_UNTIL_VACATED);
    let owner = FakeOwner::new(OwnerMode::Grant);
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice"), job(10, 1, "alice")],
        owner.clone(),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "handler to run", |c| {
        c.status().handlers_running == 1
    })
    .await;

    let next = core
        .recycle_handler(JobId::new(10, 0), 100)
        .unwrap()
        .expect("a job to recycle onto");
    assert_eq!(next.job_id, JobId::new(10, 1));
    assert_eq!(next.job_ad.get_str("RemoteHost"), Some(PEER));

    assert_eq!(
        core.job(JobId::new(10, 0)).unwrap().status,
        JobStatus::Completed
    );
    let recycled = core.job(JobId::new(10, 1)).unwrap();
    assert_eq!(recycled.status, JobStatus::Running);
    assert_eq!(recycled.num_starts, 1);
    assert!(recycled.claim.is_some());

    let claim = core.registry().get(&ClaimId::new("c1")).unwrap();
    assert_eq!(claim.job_id, JobId::new(10, 1));
    assert_eq!(claim.state, ClaimState::Active);
    let record = core.handlers().find_by_job(JobId::new(10, 1)).unwrap();
    assert!(record.pending_recycle.is_some());
    assert!(core.check_invariants().is_ok());

    core.ack_recycle(JobId::new(10, 1)).unwrap();
    assert!(core
        .handlers()
        .find_by_job(JobId::new(10, 1))
        .unwrap()
        .pending_recycle
        .is_none());
    assert!(matches!(
        core.ack_recycle(JobId::new(10, 1)),
        Err(SchedError::RecycleRefused(_))
    ));
    assert!(owner.released().is_empty());

    core.shutdown_signal().request_graceful();
    pump_until(&mut core, "handlers to wind down", |c| c.handlers().is_empty()).await;
}

/// With no job the resource would accept, recycling reconciles the previous
/// job and leaves the claim idle instead of dropping it.
#[tokio::test]
async fn test_recycle_without_candidate_keeps_claim() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", RUN_UNTIL_VACATED);
    let owner = FakeOwner::new(OwnerMode::Grant);
    let picky = job(10, 1, "alice").with_ad(
        Ad::new()
            .with("RequestCpus", 1)
            .with("Requirements", "TARGET.Memory >= 4096"),
    );
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice"), picky],
        owner.clone(),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "handler to run", |c| {
        c.status().handlers_running == 1
    })
    .await;

    let next = core.recycle_handler(JobId::new(10, 0), 100).unwrap();
    assert!(next.is_none());

    assert_eq!(
        core.job(JobId::new(10, 0)).unwrap().status,
        JobStatus::Completed
    );
    let claim = core.registry().get(&ClaimId::new("c1")).unwrap();
    assert_eq!(claim.state, ClaimState::Claimed);
    assert!(claim.job_id.is_unbound());
    assert!(claim.handler.is_none());

    core.pump_for(Duration::from_millis(200)).await;
    assert!(core.registry().contains(&ClaimId::new("c1")));
    assert_eq!(core.job(JobId::new(10, 1)).unwrap().status, JobStatus::Idle);
    assert!(owner.released().is_empty());
    assert!(core.check_invariants().is_ok());

    core.shutdown_signal().request_graceful();
    pump_until(&mut core, "handlers to wind down", |c| c.handlers().is_empty()).await;
}

/// An expired lease fails re-validation: no job is handed over, yet the
/// claim survives.
#[tokio::test]
async fn test_recycle_with_expired_lease_keeps_claim() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", RUN_UNTIL_VACATED);
    let mut config = test_config(dir.path(), program);
    config.job_lease_duration_secs = 0;
    let owner = FakeOwner::new(OwnerMode::Grant);
    let (mut core, _handle) = build_core(
        config,
        vec![job(10, 0, "alice"), job(10, 1, "alice")],
        owner.clone(),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "handler to run", |c| {
        c.status().handlers_running == 1
    })
    .await;

    assert!(core.recycle_handler(JobId::new(10, 0), 100).unwrap().is_none());
    let claim = core.registry().get(&ClaimId::new("c1")).unwrap();
    assert_eq!(claim.state, ClaimState::Claimed);
    assert_eq!(core.job(JobId::new(10, 1)).unwrap().status, JobStatus::Idle);
    assert!(owner.released().is_empty());

    core.shutdown_signal().request_fast();
    pump_until(&mut core, "handlers to wind down", |c| c.handlers().is_empty()).await;
}

/// A recycled job the handler never acknowledges is taken back and run
/// again through the normal dispatch path.
#[tokio::test]
async fn test_unacknowledged_recycle_is_redispatched() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", &first_job_lingers());
    let mut config = test_config(dir.path(), program);
    config.recycle_ack_timeout_ms = 200;
    let (mut core, _handle) = build_core(
        config,
        vec![job(10, 0, "alice"), job(10, 1, "alice")],
        FakeOwner::new(OwnerMode::Grant),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "handler to run", |c| {
        c.status().handlers_running == 1
    })
    .await;

    let next = core.recycle_handler(JobId::new(10, 0), 100).unwrap();
    assert_eq!(next.map(|n| n.job_id), Some(JobId::new(10, 1)));

    pump_until(&mut core, "redispatched job to complete", |c| {
        c.job(JobId::new(10, 1)).unwrap().status == JobStatus::Completed
    })
    .await;
    assert_eq!(core.job(JobId::new(10, 1)).unwrap().num_starts, 2);
    pump_until(&mut core, "old handler reaped", |c| c.handlers().is_empty()).await;
}

/// Recycling is refused for universes that cannot reuse a handler, and for
/// jobs no handler is running.
#[tokio::test]
async fn test_recycle_refusals() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", RUN_UNTIL_VACATED);
    let parallel = Job::new(JobId::new(10, 0), "alice", Universe::Parallel)
        .with_ad(Ad::new().with("RequestCpus", 1));
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![parallel, job(10, 1, "alice")],
        FakeOwner::new(OwnerMode::Grant),
    );

    assert!(matches!(
        core.recycle_handler(JobId::new(10, 1), 100),
        Err(SchedError::HandlerNotFound(_))
    ));

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "handler to run", |c| {
        c.handlers()
            .iter()
            .any(|h| h.job_id == JobId::new(10, 0) && h.state == HandlerState::Running)
    })
    .await;

    assert!(matches!(
        core.recycle_handler(JobId::new(10, 0), 100),
        Err(SchedError::RecycleRefused(_))
    ));
    assert_eq!(
        core.job(JobId::new(10, 0)).unwrap().status,
        JobStatus::Running
    );

    core.shutdown_signal().request_graceful();
    pump_until(&mut core, "handlers to wind down", |c| c.handlers().is_empty()).await;
}
