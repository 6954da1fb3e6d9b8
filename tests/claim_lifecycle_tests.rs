mod test_harness;

use std::time::Duration;

use schedd_lite::acquirer::Leftover;
use schedd_lite::ad::Ad;
use schedd_lite::claim::{ClaimId, ClaimState};
use schedd_lite::job::{JobId, JobStatus};
use test_harness::{
    build_core, handler_script, job, negotiate, pump_until, test_config, FakeOwner, OwnerMode,
    RUN_UNTIL_VACATED,
};

/// A claim request that outlives its deadline is dropped locally: nothing is
/// released at the owner and the job can be matched again.
#[tokio::test]
async fn test_claim_request_timeout_drops_claim_without_release() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", "exit 100");
    let mut config = test_config(dir.path(), program);
    config.request_claim_timeout_ms = 200;
    let owner = FakeOwner::new(OwnerMode::Hang);
    let (mut core, _handle) = build_core(config, vec![job(10, 0, "alice")], owner.clone());

    negotiate(&mut core, "alice", &["c1"]);
    assert_eq!(core.registry().count_in_state(ClaimState::Limbo), 1);

    pump_until(&mut core, "limbo claim to expire", |c| c.registry().is_empty()).await;
    core.pump_for(Duration::from_millis(100)).await;

    assert!(owner.released().is_empty(), "expired claim must not be released");
    let job = core.job(JobId::new(10, 0)).unwrap();
    assert_eq!(job.status, JobStatus::Idle);
    assert_eq!(job.num_starts, 0);

    // Back in the runnable pool: the next session offers it again.
    let step = negotiate(&mut core, "alice", &["c2"]);
    assert!(step.ended);
    assert!(core.registry().contains(&ClaimId::new("c2")));
}

/// A refused claim leaves the job idle and untouched.
#[tokio::test]
async fn test_refused_claim_leaves_job_runnable() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", "exit 100");
    let owner = FakeOwner::new(OwnerMode::Refuse("slot busy".to_string()));
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice")],
        owner.clone(),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "refusal", |c| c.registry().is_empty()).await;

    assert_eq!(owner.requests().len(), 1);
    assert!(owner.released().is_empty());
    let job = core.job(JobId::new(10, 0)).unwrap();
    assert_eq!(job.status, JobStatus::Idle);
    assert!(job.claim.is_none());
    assert!(core.handlers().is_empty());
}

/// The claim request carries the scheduler identity and the job ad with
/// the match ad's macros resolved.
#[tokio::test]
async fn test_claim_request_carries_expanded_job_ad() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", "exit 100");
    let owner = FakeOwner::new(OwnerMode::Hang);
    let mut submitted = job(10, 0, "alice");
    submitted.ad.insert("Slot", "$$(Name)");
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![submitted],
        owner.clone(),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "claim request on the wire", |_| {
        !owner.requests().is_empty()
    })
    .await;

    let request = &owner.requests()[0];
    assert_eq!(request.claim_id, ClaimId::new("c1"));
    assert_eq!(request.peer, test_harness::PEER);
    assert_eq!(request.schedd_name, "test-schedd");
    assert_eq!(request.job_ad.get_str("Slot"), Some("c1"));
    assert!(!request.claim_pslot);
}

/// When the owner revokes the claim of a running job, the handler is
/// vacated and the claim torn down without a release RPC.
#[tokio::test]
async fn test_owner_revocation_vacates_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", RUN_UNTIL_VACATED);
    let owner = FakeOwner::new(OwnerMode::Grant);
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice")],
        owner.clone(),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "handler to run", |c| {
        c.status().handlers_running == 1 && c.handlers().iter().all(|h| h.pid != 0)
    })
    .await;

    assert!(core.release_claim(&ClaimId::new("c1")).unwrap());
    pump_until(&mut core, "claim teardown", |c| {
        c.registry().is_empty() && c.handlers().is_empty()
    })
    .await;
    core.pump_for(Duration::from_millis(100)).await;

    assert!(owner.released().is_empty(), "owner-closed claim must not be released");
    let job = core.job(JobId::new(10, 0)).unwrap();
    assert_eq!(job.status, JobStatus::Idle);
    assert!(job.claim.is_none());
    assert_eq!(job.num_starts, 1);
}

/// Releasing an unknown claim is not an error.
#[tokio::test]
async fn test_release_of_unknown_claim_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", "exit 100");
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice")],
        FakeOwner::new(OwnerMode::Hang),
    );

    assert!(!core.release_claim(&ClaimId::new("nope")).unwrap());
    assert_eq!(core.job(JobId::new(10, 0)).unwrap().status, JobStatus::Idle);
}

/// A leftover sub-resource handed back with a grant is claimed for another
/// job of the same submitter, as a partitionable-slot request.
#[tokio::test]
async fn test_leftover_resource_claimed_for_next_job() {
    let dir = tempfile::tempdir().unwrap();
    let program = handler_script(dir.path(), "handler.sh", "exit 100");
    let owner = FakeOwner::new(OwnerMode::GrantWithLeftovers(vec![Leftover {
        claim_id: ClaimId::new("c1-left"),
        match_ad: Ad::new().with("Name", "c1-left").with("Memory", 1024),
    }]));
    let (mut core, _handle) = build_core(
        test_config(dir.path(), program),
        vec![job(10, 0, "alice"), job(10, 1, "alice")],
        owner.clone(),
    );

    negotiate(&mut core, "alice", &["c1"]);
    pump_until(&mut core, "both jobs to complete", |c| {
        c.status().jobs_completed == 2
    })
    .await;

    let requests = owner.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].claim_id, ClaimId::new("c1-left"));
    assert!(requests[1].claim_pslot);
    assert_eq!(requests[1].peer, test_harness::PEER);

    pump_until(&mut core, "both releases", |_| owner.released().len() == 2).await;
    assert!(core.check_invariants().is_ok());
}
