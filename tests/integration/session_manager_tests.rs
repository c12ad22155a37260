//! Pooled session operations through the manager.

use std::sync::Arc;

use lab_orchestrator::compute::ComputeBackend;
use lab_orchestrator::models::instance::HealthChecks;
use lab_orchestrator::models::pool::PoolStatus;
use lab_orchestrator::models::session::SessionStatus;
use lab_orchestrator::orchestrator::session_manager::{
    CreateSessionRequest, SessionManager, REASON_USER_REQUESTED,
};
use lab_orchestrator::orchestrator::stage::Stage;
use lab_orchestrator::persistence::db::Database;
use lab_orchestrator::persistence::pool_repo::PoolRepo;
use lab_orchestrator::provisioner::ConnectionProvisioner;
use lab_orchestrator::AppError;

use super::test_helpers::{register_pool, running, test_config, test_db, FakeCompute, FakeProvisioner};

struct Harness {
    db: Arc<Database>,
    compute: Arc<FakeCompute>,
    manager: SessionManager,
}

async fn harness(pool: &[&str]) -> Harness {
    let db = test_db().await;
    let compute = FakeCompute::new();
    register_pool(&db, pool).await;
    for (n, id) in pool.iter().enumerate() {
        compute.set(running(id, &format!("10.0.1.{}", n + 5), HealthChecks::passing()));
    }

    let backend: Arc<dyn ComputeBackend> = compute.clone();
    let provisioner: Arc<dyn ConnectionProvisioner> = FakeProvisioner::new();
    let manager = SessionManager::new(
        Arc::new(test_config()),
        Arc::clone(&db),
        backend,
        provisioner,
    );
    Harness {
        db,
        compute,
        manager,
    }
}

fn request(student: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        student_id: student.into(),
        student_name: Some("Ada".into()),
        course_id: Some("sec-201".into()),
        lab_id: Some("recon".into()),
    }
}

#[tokio::test]
async fn create_claims_and_provisions() {
    let h = harness(&["i-100"]).await;

    let created = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");

    assert!(!created.existing);
    let view = created.session;
    assert_eq!(view.session.status, SessionStatus::Ready);
    assert_eq!(view.session.course_id.as_deref(), Some("sec-201"));
    assert_eq!(view.stage, Stage::Ready);
    assert_eq!(view.progress, 100);
    assert!(view.time_remaining > 0);
}

#[tokio::test]
async fn second_create_returns_existing_session() {
    let h = harness(&["i-100", "i-101"]).await;

    let first = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");
    let second = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create again");

    assert!(second.existing);
    assert_eq!(second.session.session.session_id, first.session.session.session_id);

    let available = PoolRepo::new(Arc::clone(&h.db))
        .list_by_status(PoolStatus::Available)
        .await
        .expect("pool");
    assert_eq!(available.len(), 1, "only one instance claimed");
}

#[tokio::test]
async fn create_without_capacity_keeps_waiting() {
    let h = harness(&[]).await;

    let created = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");
    assert_eq!(created.session.session.status, SessionStatus::Provisioning);
    assert_eq!(created.session.stage, Stage::FindingInstance);
    assert_eq!(created.session.progress, 10);
}

#[tokio::test]
async fn create_requires_student_id() {
    let h = harness(&[]).await;
    let err = h
        .manager
        .create_session(CreateSessionRequest {
            student_id: "  ".into(),
            ..CreateSessionRequest::default()
        })
        .await
        .expect_err("blank student");
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let h = harness(&[]).await;
    let err = h
        .manager
        .get_session("sess-missing")
        .await
        .expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn terminate_checks_ownership() {
    let h = harness(&["i-100"]).await;
    let created = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");
    let id = created.session.session.session_id;

    let err = h
        .manager
        .terminate_session(&id, "student-2", None)
        .await
        .expect_err("foreign caller");
    assert!(matches!(err, AppError::Forbidden(_)));

    let view = h.manager.get_session(&id).await.expect("still there");
    assert_eq!(view.session.status, SessionStatus::Ready);
}

#[tokio::test]
async fn terminate_releases_instance_and_is_idempotent() {
    let h = harness(&["i-100"]).await;
    let created = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");
    let id = created.session.session.session_id;

    let ended = h
        .manager
        .terminate_session(&id, "student-1", None)
        .await
        .expect("terminate");
    assert_eq!(ended.session.status, SessionStatus::Terminated);
    assert_eq!(
        ended.session.termination_reason.as_deref(),
        Some(REASON_USER_REQUESTED)
    );

    let pool = PoolRepo::new(Arc::clone(&h.db))
        .get("i-100")
        .await
        .expect("pool");
    assert_eq!(pool.status, PoolStatus::Available);

    let again = h
        .manager
        .terminate_session(&id, "student-1", Some("lab_complete"))
        .await
        .expect("terminate again");
    assert_eq!(again.session.status, SessionStatus::Terminated);
    assert_eq!(
        again.session.termination_reason.as_deref(),
        Some(REASON_USER_REQUESTED)
    );
    assert_eq!(h.compute.terminations(), 0, "pool instances are never terminated");
}

#[tokio::test]
async fn terminate_records_given_reason() {
    let h = harness(&[]).await;
    let created = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");

    let ended = h
        .manager
        .terminate_session(&created.session.session.session_id, "student-1", Some("lab_complete"))
        .await
        .expect("terminate");
    assert_eq!(ended.session.termination_reason.as_deref(), Some("lab_complete"));
}

#[tokio::test]
async fn heartbeat_activates_ready_session() {
    let h = harness(&["i-100"]).await;
    let created = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");
    let id = created.session.session.session_id;

    let view = h.manager.heartbeat(&id, "student-1").await.expect("heartbeat");
    assert_eq!(view.session.status, SessionStatus::Active);

    let view = h.manager.heartbeat(&id, "student-1").await.expect("heartbeat");
    assert_eq!(view.session.status, SessionStatus::Active);

    let err = h
        .manager
        .heartbeat(&id, "student-2")
        .await
        .expect_err("foreign caller");
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn heartbeat_on_ended_session_is_rejected() {
    let h = harness(&["i-100"]).await;
    let created = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");
    let id = created.session.session.session_id;
    h.manager
        .terminate_session(&id, "student-1", None)
        .await
        .expect("terminate");

    let err = h
        .manager
        .heartbeat(&id, "student-1")
        .await
        .expect_err("ended");
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn listing_splits_active_and_history() {
    let h = harness(&["i-100"]).await;

    let first = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");
    let first_id = first.session.session.session_id;
    h.manager
        .terminate_session(&first_id, "student-1", None)
        .await
        .expect("terminate");
    let second = h
        .manager
        .create_session(request("student-1"))
        .await
        .expect("create");
    let second_id = second.session.session.session_id;

    let listing = h
        .manager
        .list_student_sessions("student-1")
        .await
        .expect("list");

    assert_eq!(listing.student_id, "student-1");
    assert_eq!(listing.total_sessions, 2);
    assert_eq!(listing.active_sessions.len(), 1);
    assert_eq!(listing.active_sessions[0].session.session_id, second_id);
    let ids: Vec<&str> = listing
        .sessions
        .iter()
        .map(|v| v.session.session_id.as_str())
        .collect();
    assert_eq!(ids, vec![second_id.as_str(), first_id.as_str()]);
}

#[tokio::test]
async fn listing_unknown_student_is_empty() {
    let h = harness(&[]).await;
    let listing = h
        .manager
        .list_student_sessions("nobody")
        .await
        .expect("list");
    assert_eq!(listing.total_sessions, 0);
    assert!(listing.sessions.is_empty());
    assert!(listing.active_sessions.is_empty());
}
