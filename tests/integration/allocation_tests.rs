//! Pool claim races and waiting-time policy.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use lab_orchestrator::compute::ComputeBackend;
use lab_orchestrator::models::instance::{HealthChecks, InstanceState};
use lab_orchestrator::models::pool::PoolStatus;
use lab_orchestrator::models::session::{ProvisioningStage, Session, SessionStatus};
use lab_orchestrator::orchestrator::allocator::{
    AllocationPolicy, ClaimOutcome, PoolAllocator, CAPACITY_EXHAUSTED,
};
use lab_orchestrator::persistence::db::Database;
use lab_orchestrator::persistence::pool_repo::PoolRepo;

use super::test_helpers::{in_state, register_pool, running, test_db, FakeCompute};

fn allocator(db: &Arc<Database>, compute: &Arc<FakeCompute>) -> PoolAllocator {
    let compute: Arc<dyn ComputeBackend> = compute.clone();
    PoolAllocator::new(Arc::clone(db), compute)
}

#[tokio::test]
async fn concurrent_claims_assign_instance_once() {
    let db = test_db().await;
    let compute = FakeCompute::new();
    register_pool(&db, &["i-100"]).await;
    compute.set(running("i-100", "10.0.1.5", HealthChecks::passing()));
    let allocator = allocator(&db, &compute);

    let mut handles = Vec::new();
    for n in 0..8 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            let mut session = Session::new(format!("student-{n}"), Duration::hours(4));
            let outcome = allocator
                .try_claim(&mut session, Utc::now())
                .await
                .expect("claim attempt");
            (outcome, session)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (outcome, session) = handle.await.expect("task");
        match outcome {
            ClaimOutcome::Claimed(id) => {
                assert_eq!(id, "i-100");
                assert_eq!(session.instance_id.as_deref(), Some("i-100"));
                winners.push(session.session_id);
            }
            ClaimOutcome::Contended(_) | ClaimOutcome::NoneAvailable => {
                assert!(session.instance_id.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1, "exactly one session may hold the instance");

    let stored = PoolRepo::new(Arc::clone(&db))
        .get("i-100")
        .await
        .expect("pool entry");
    assert_eq!(stored.status, PoolStatus::Assigned);
    assert_eq!(stored.session_id.as_deref(), Some(winners[0].as_str()));
}

#[tokio::test]
async fn claim_copies_live_instance_details() {
    let db = test_db().await;
    let compute = FakeCompute::new();
    register_pool(&db, &["i-100"]).await;
    compute.set(running("i-100", "10.0.1.5", HealthChecks::initializing()));

    let mut session = Session::new("student-1".into(), Duration::hours(4));
    let outcome = allocator(&db, &compute)
        .try_claim(&mut session, Utc::now())
        .await
        .expect("claim");

    assert_eq!(outcome, ClaimOutcome::Claimed("i-100".into()));
    assert_eq!(session.instance_ip.as_deref(), Some("10.0.1.5"));
    assert_eq!(session.instance_state, Some(InstanceState::Running));
    assert_eq!(session.health_checks, Some(HealthChecks::initializing()));
}

#[tokio::test]
async fn stopped_candidate_is_not_claimed() {
    let db = test_db().await;
    let compute = FakeCompute::new();
    register_pool(&db, &["i-100"]).await;
    compute.set(in_state("i-100", InstanceState::Stopped));

    let mut session = Session::new("student-1".into(), Duration::hours(4));
    let outcome = allocator(&db, &compute)
        .try_claim(&mut session, Utc::now())
        .await
        .expect("claim");

    assert_eq!(outcome, ClaimOutcome::NotRunning("i-100".into()));
    assert!(session.instance_id.is_none());
    let stored = PoolRepo::new(Arc::clone(&db)).get("i-100").await.expect("get");
    assert_eq!(stored.status, PoolStatus::Available);
}

#[tokio::test]
async fn unknown_candidate_is_not_claimed() {
    let db = test_db().await;
    let compute = FakeCompute::new();
    register_pool(&db, &["i-ghost"]).await;

    let mut session = Session::new("student-1".into(), Duration::hours(4));
    let outcome = allocator(&db, &compute)
        .try_claim(&mut session, Utc::now())
        .await
        .expect("claim");
    assert_eq!(outcome, ClaimOutcome::NotRunning("i-ghost".into()));
}

#[tokio::test]
async fn empty_pool_reports_none_available() {
    let db = test_db().await;
    let compute = FakeCompute::new();

    let mut session = Session::new("student-1".into(), Duration::hours(4));
    let outcome = allocator(&db, &compute)
        .try_claim(&mut session, Utc::now())
        .await
        .expect("claim");

    assert_eq!(outcome, ClaimOutcome::NoneAvailable);
    assert!(!outcome.is_claimed());
    assert_eq!(compute.describes(), 0);
}

#[tokio::test]
async fn assigned_session_is_left_alone() {
    let db = test_db().await;
    let compute = FakeCompute::new();

    let mut session = Session::new("student-1".into(), Duration::hours(4));
    session.instance_id = Some("i-100".into());
    let outcome = allocator(&db, &compute)
        .try_claim(&mut session, Utc::now())
        .await
        .expect("claim");
    assert_eq!(outcome, ClaimOutcome::AlreadyAssigned);
    assert!(outcome.is_claimed());
}

#[tokio::test]
async fn release_only_frees_own_claim() {
    let db = test_db().await;
    let compute = FakeCompute::new();
    register_pool(&db, &["i-100"]).await;
    compute.set(running("i-100", "10.0.1.5", HealthChecks::passing()));
    let allocator = allocator(&db, &compute);

    let mut session = Session::new("student-1".into(), Duration::hours(4));
    allocator
        .try_claim(&mut session, Utc::now())
        .await
        .expect("claim");

    assert!(!allocator.release("i-100", "sess-someone-else").await);
    assert!(allocator.release("i-100", &session.session_id).await);
    assert!(!allocator.release("i-100", &session.session_id).await);
}

fn policy() -> AllocationPolicy {
    AllocationPolicy {
        warning: StdDuration::from_secs(240),
        fatal: StdDuration::from_secs(300),
    }
}

#[test]
fn policy_marks_waiting_sessions() {
    let mut session = Session::new("student-1".into(), Duration::hours(4));
    let created = session.created_at;

    policy().apply(&mut session, created + Duration::seconds(30));
    assert_eq!(session.status, SessionStatus::Provisioning);
    assert_eq!(
        session.provisioning_stage,
        Some(ProvisioningStage::WaitingForCapacity)
    );

    policy().apply(&mut session, created + Duration::seconds(241));
    assert_eq!(session.status, SessionStatus::Provisioning);
    assert_eq!(
        session.provisioning_stage,
        Some(ProvisioningStage::CapacityWarning)
    );
}

#[test]
fn policy_fails_sessions_past_fatal_threshold() {
    let mut session = Session::new("student-1".into(), Duration::hours(4));
    let created = session.created_at;

    policy().apply(&mut session, created + Duration::seconds(301));
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.error.as_deref(), Some(CAPACITY_EXHAUSTED));
}
