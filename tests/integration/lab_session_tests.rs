//! Template-backed lab session launch, polling and teardown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};

use lab_orchestrator::compute::ComputeBackend;
use lab_orchestrator::config::GlobalConfig;
use lab_orchestrator::models::instance::{CheckStatus, HealthChecks, InstanceState};
use lab_orchestrator::models::lab_session::{LabSession, LabSessionStatus};
use lab_orchestrator::models::template::LabTemplate;
use lab_orchestrator::orchestrator::lab_manager::{CreateLabRequest, LabManager};
use lab_orchestrator::persistence::db::Database;
use lab_orchestrator::persistence::lab_session_repo::{LabInsert, LabSessionRepo};
use lab_orchestrator::AppError;

use super::test_helpers::{
    in_state, running, seed_template, template, test_config, test_db, FakeCompute,
};

struct Harness {
    db: Arc<Database>,
    compute: Arc<FakeCompute>,
    labs: LabManager,
}

async fn harness_with(config: GlobalConfig) -> Harness {
    let db = test_db().await;
    let compute = FakeCompute::new();
    seed_template(&db, &template("web-101", "web")).await;
    seed_template(&db, &template("net-201", "network")).await;

    let backend: Arc<dyn ComputeBackend> = compute.clone();
    let labs = LabManager::new(Arc::new(config), Arc::clone(&db), backend);
    Harness { db, compute, labs }
}

async fn harness() -> Harness {
    harness_with(test_config()).await
}

fn launching(template: &LabTemplate) -> LabSession {
    LabSession::launching("user-1".into(), template, None, "lynkbox".into(), Duration::hours(2))
}

fn request(user: &str, template_id: &str) -> CreateLabRequest {
    CreateLabRequest {
        user_id: user.into(),
        template_id: template_id.into(),
        course_id: Some("sec-201".into()),
        connection_method: "lynkbox".into(),
        check_only: false,
    }
}

#[tokio::test]
async fn create_launches_tagged_instance() {
    let h = harness().await;

    let created = h.labs.create(request("user-1", "web-101")).await.expect("create");
    assert!(!created.existing);
    let view = created.session.expect("session returned");
    assert_eq!(view.session.status, LabSessionStatus::Launching);
    assert_eq!(view.session.instance_id.as_deref(), Some("i-lab-0"));
    assert_eq!(view.session.instance_type.as_deref(), Some("t3.micro"));
    assert_eq!(view.progress, 20);

    let launch = h
        .compute
        .last_launch
        .lock()
        .expect("lock")
        .clone()
        .expect("launch request");
    assert_eq!(launch.image_id, "ami-0abc");
    assert_eq!(launch.name, format!("cyberlab-lab-{}", view.session.session_id));
    assert!(launch
        .tags
        .contains(&("UserId".to_owned(), "user-1".to_owned())));
    assert!(launch
        .tags
        .contains(&("TemplateId".to_owned(), "web-101".to_owned())));

    let stored = LabSessionRepo::new(Arc::clone(&h.db))
        .get_by_id(&view.session.session_id)
        .await
        .expect("stored");
    assert_eq!(stored.instance_id.as_deref(), Some("i-lab-0"));
}

#[tokio::test]
async fn duplicate_create_returns_existing_without_launch() {
    let h = harness().await;

    let first = h.labs.create(request("user-1", "web-101")).await.expect("create");
    let second = h.labs.create(request("user-1", "web-101")).await.expect("again");

    assert!(second.existing);
    assert_eq!(
        second.session.expect("existing").session.session_id,
        first.session.expect("first").session.session_id
    );
    assert_eq!(h.compute.launches(), 1);
}

#[tokio::test]
async fn concurrent_creates_launch_once() {
    let h = harness().await;

    let (a, b) = tokio::join!(
        h.labs.create(request("user-1", "web-101")),
        h.labs.create(request("user-1", "web-101"))
    );
    let (a, b) = (a.expect("create a"), b.expect("create b"));

    assert_ne!(a.existing, b.existing, "exactly one create launches");
    assert_eq!(
        a.session.expect("a").session.session_id,
        b.session.expect("b").session.session_id
    );
    assert_eq!(h.compute.launches(), 1);
    let active = LabSessionRepo::new(Arc::clone(&h.db))
        .list_active_by_user("user-1")
        .await
        .expect("active");
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn concurrent_creates_respect_user_limit() {
    let h = harness().await;

    let (a, b) = tokio::join!(
        h.labs.create(request("user-1", "web-101")),
        h.labs.create(request("user-1", "net-201"))
    );
    let refused = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(AppError::Capacity(_))))
        .count();

    assert_eq!(refused, 1);
    assert_eq!(h.compute.launches(), 1);
}

#[tokio::test]
async fn guarded_insert_reports_existing_and_capacity() {
    let h = harness().await;
    let repo = LabSessionRepo::new(Arc::clone(&h.db));
    let web = template("web-101", "web");

    let first = launching(&web);
    assert!(matches!(
        repo.insert_guarded(&first, 2).await.expect("insert"),
        LabInsert::Inserted(_)
    ));
    match repo.insert_guarded(&launching(&web), 2).await.expect("duplicate") {
        LabInsert::Existing(existing) => assert_eq!(existing.session_id, first.session_id),
        other => panic!("expected existing, got {other:?}"),
    }
    assert!(matches!(
        repo.insert_guarded(&launching(&template("net-201", "network")), 1)
            .await
            .expect("over limit"),
        LabInsert::AtCapacity
    ));
}

#[tokio::test]
async fn existing_launching_session_reports_elapsed_progress() {
    let h = harness().await;
    let mut session = launching(&template("web-101", "web"));
    session.created_at = Utc::now() - Duration::seconds(30);
    LabSessionRepo::new(Arc::clone(&h.db))
        .insert_guarded(&session, 1)
        .await
        .expect("seed");

    let created = h.labs.create(request("user-1", "web-101")).await.expect("create");
    assert!(created.existing);
    let progress = created.session.expect("existing").progress;
    assert!((55..=57).contains(&progress), "progress was {progress}");
}

#[tokio::test]
async fn check_only_never_launches() {
    let h = harness().await;

    let mut probe = request("user-1", "web-101");
    probe.check_only = true;
    let result = h.labs.create(probe.clone()).await.expect("probe");
    assert!(!result.existing);
    assert!(result.session.is_none());
    assert_eq!(h.compute.launches(), 0);

    h.labs.create(request("user-1", "web-101")).await.expect("create");
    let result = h.labs.create(probe).await.expect("probe");
    assert!(result.existing);
    assert_eq!(h.compute.launches(), 1);
}

#[tokio::test]
async fn per_user_limit_is_enforced() {
    let h = harness().await;

    h.labs.create(request("user-1", "web-101")).await.expect("create");
    let err = h
        .labs
        .create(request("user-1", "net-201"))
        .await
        .expect_err("over limit");
    assert!(matches!(err, AppError::Capacity(msg) if msg.contains("maximum of 1")));
    assert_eq!(h.compute.launches(), 1);

    h.labs
        .create(request("user-2", "net-201"))
        .await
        .expect("other users unaffected");
}

#[tokio::test]
async fn higher_limit_allows_parallel_templates() {
    let mut config = test_config();
    config.labs.max_active_sessions = 2;
    let h = harness_with(config).await;

    h.labs.create(request("user-1", "web-101")).await.expect("first");
    h.labs.create(request("user-1", "net-201")).await.expect("second");
    assert_eq!(h.compute.launches(), 2);
}

#[tokio::test]
async fn failed_launch_leaves_error_record() {
    let h = harness().await;
    h.compute.fail_launch.store(true, Ordering::SeqCst);

    let created = h.labs.create(request("user-1", "web-101")).await.expect("create");
    let view = created.session.expect("error record returned");
    assert_eq!(view.session.status, LabSessionStatus::Error);
    assert!(view
        .session
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("Failed to launch lab instance")));

    let stored = LabSessionRepo::new(Arc::clone(&h.db))
        .get_by_id(&view.session.session_id)
        .await
        .expect("record kept");
    assert_eq!(stored.status, LabSessionStatus::Error);

    h.compute.fail_launch.store(false, Ordering::SeqCst);
    h.labs
        .create(request("user-1", "web-101"))
        .await
        .expect("error record does not count against the limit");
}

#[tokio::test]
async fn missing_or_inactive_template_is_not_found() {
    let h = harness().await;

    let err = h
        .labs
        .create(request("user-1", "nope"))
        .await
        .expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));

    let mut retired = template("old-1", "web");
    retired.active = false;
    seed_template(&h.db, &retired).await;
    let err = h
        .labs
        .create(request("user-1", "old-1"))
        .await
        .expect_err("inactive");
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(h.compute.launches(), 0);
}

#[tokio::test]
async fn template_without_image_is_error_record() {
    let h = harness().await;
    let mut bare = template("bare-1", "web");
    bare.image_id = None;
    seed_template(&h.db, &bare).await;

    let created = h.labs.create(request("user-1", "bare-1")).await.expect("create");
    let view = created.session.expect("session");
    assert_eq!(view.session.status, LabSessionStatus::Error);
    assert_eq!(h.compute.launches(), 0);
}

#[tokio::test]
async fn create_requires_identifiers() {
    let h = harness().await;
    let err = h
        .labs
        .create(request("", "web-101"))
        .await
        .expect_err("blank user");
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn status_requires_both_health_checks() {
    let h = harness().await;
    let created = h.labs.create(request("user-1", "web-101")).await.expect("create");
    let id = created.session.expect("session").session.session_id;

    let booting = h.labs.status(&id).await.expect("status");
    assert_eq!(booting.session.status, LabSessionStatus::Launching);
    assert!((20..=90).contains(&booting.progress));

    let partial_health = HealthChecks {
        system_status: CheckStatus::Ok,
        instance_status: CheckStatus::Initializing,
    };
    h.compute.set(running("i-lab-0", "10.1.0.9", partial_health));
    let partial = h.labs.status(&id).await.expect("status");
    assert_eq!(partial.session.status, LabSessionStatus::Launching);
    assert_eq!(partial.session.target_ip.as_deref(), Some("10.1.0.9"));
    assert_eq!(partial.progress, 85);
    assert!(partial.message.contains("(1/2)"));

    h.compute.set(running("i-lab-0", "10.1.0.9", HealthChecks::passing()));
    let ready = h.labs.status(&id).await.expect("status");
    assert_eq!(ready.session.status, LabSessionStatus::Running);
    assert_eq!(ready.progress, 100);

    let describes = h.compute.describes();
    let settled = h.labs.status(&id).await.expect("status");
    assert_eq!(settled.session.status, LabSessionStatus::Running);
    assert_eq!(h.compute.describes(), describes, "settled sessions skip the backend");
}

#[tokio::test]
async fn status_flags_vanished_instance() {
    let h = harness().await;
    let created = h.labs.create(request("user-1", "web-101")).await.expect("create");
    let id = created.session.expect("session").session.session_id;

    h.compute.forget("i-lab-0");
    let view = h.labs.status(&id).await.expect("status");
    assert_eq!(view.session.status, LabSessionStatus::Error);
    assert_eq!(view.session.error.as_deref(), Some("Instance not found"));
}

#[tokio::test]
async fn status_maps_stopped_instance_to_terminated() {
    let h = harness().await;
    let created = h.labs.create(request("user-1", "web-101")).await.expect("create");
    let id = created.session.expect("session").session.session_id;

    h.compute.set(in_state("i-lab-0", InstanceState::Stopped));
    let view = h.labs.status(&id).await.expect("status");
    assert_eq!(view.session.status, LabSessionStatus::Terminated);
    assert!(view.session.terminated_at.is_some());
}

#[tokio::test]
async fn terminate_is_owner_only_and_idempotent() {
    let h = harness().await;
    let created = h.labs.create(request("user-1", "web-101")).await.expect("create");
    let id = created.session.expect("session").session.session_id;

    let err = h
        .labs
        .terminate(&id, "user-2")
        .await
        .expect_err("foreign caller");
    assert!(matches!(err, AppError::Forbidden(_)));
    assert_eq!(h.compute.terminations(), 0);

    let first = h.labs.terminate(&id, "user-1").await.expect("terminate");
    assert_eq!(first.status, LabSessionStatus::Terminated);
    assert!(first.instance_terminated);
    assert!(!first.already_terminated);

    let second = h.labs.terminate(&id, "user-1").await.expect("again");
    assert!(second.already_terminated);
    assert_eq!(h.compute.terminations(), 1);
}

#[tokio::test]
async fn terminate_error_record_without_instance() {
    let h = harness().await;
    h.compute.fail_launch.store(true, Ordering::SeqCst);
    let created = h.labs.create(request("user-1", "web-101")).await.expect("create");
    let id = created.session.expect("session").session.session_id;

    let result = h.labs.terminate(&id, "user-1").await.expect("terminate");
    assert_eq!(result.status, LabSessionStatus::Terminated);
    assert!(!result.instance_terminated);
    assert_eq!(h.compute.terminations(), 0);
}

#[tokio::test]
async fn templates_filter_by_category() {
    let h = harness().await;

    let all = h.labs.list_templates(None, None).await.expect("list");
    assert_eq!(all.len(), 2);

    let web = h
        .labs
        .list_templates(Some("vm"), Some("web"))
        .await
        .expect("list");
    assert_eq!(web.len(), 1);
    assert_eq!(web[0].template_id, "web-101");

    let docker = h.labs.list_templates(Some("docker"), None).await.expect("list");
    assert!(docker.is_empty());
}
