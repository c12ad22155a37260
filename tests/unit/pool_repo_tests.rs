use std::sync::Arc;

use chrono::Utc;

use lab_orchestrator::models::pool::{PoolInstance, PoolStatus};
use lab_orchestrator::persistence::db;
use lab_orchestrator::persistence::pool_repo::PoolRepo;

async fn repo() -> PoolRepo {
    let database = db::connect_memory().await.expect("db");
    PoolRepo::new(Arc::new(database))
}

#[tokio::test]
async fn register_is_idempotent() {
    let repo = repo().await;
    let instance = PoolInstance::available("i-100".into());

    assert!(repo.register(&instance).await.expect("register"));
    assert!(!repo.register(&instance).await.expect("duplicate register"));

    let all = repo.list_all().await.expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, PoolStatus::Available);
}

#[tokio::test]
async fn claim_is_compare_and_swap() {
    let repo = repo().await;
    repo.register(&PoolInstance::available("i-100".into()))
        .await
        .expect("register");

    let now = Utc::now();
    assert!(repo
        .claim("i-100", "sess-a", "student-a", now)
        .await
        .expect("first claim"));
    assert!(!repo
        .claim("i-100", "sess-b", "student-b", now)
        .await
        .expect("second claim"));

    let stored = repo.get("i-100").await.expect("get");
    assert_eq!(stored.status, PoolStatus::Assigned);
    assert_eq!(stored.session_id.as_deref(), Some("sess-a"));
    assert_eq!(stored.student_id.as_deref(), Some("student-a"));
    assert!(stored.assigned_at.is_some());
}

#[tokio::test]
async fn release_requires_current_holder() {
    let repo = repo().await;
    repo.register(&PoolInstance::available("i-100".into()))
        .await
        .expect("register");
    repo.claim("i-100", "sess-a", "student-a", Utc::now())
        .await
        .expect("claim");

    assert!(!repo.release("i-100", "sess-b").await.expect("foreign release"));
    assert_eq!(
        repo.get("i-100").await.expect("get").status,
        PoolStatus::Assigned
    );

    assert!(repo.release("i-100", "sess-a").await.expect("owner release"));
    let stored = repo.get("i-100").await.expect("get");
    assert_eq!(stored.status, PoolStatus::Available);
    assert!(stored.session_id.is_none());
    assert!(stored.assigned_at.is_none());
}

#[tokio::test]
async fn force_release_ignores_holder() {
    let repo = repo().await;
    repo.register(&PoolInstance::available("i-100".into()))
        .await
        .expect("register");
    repo.claim("i-100", "sess-a", "student-a", Utc::now())
        .await
        .expect("claim");

    assert!(repo.force_release("i-100").await.expect("force release"));
    assert_eq!(
        repo.list_by_status(PoolStatus::Available)
            .await
            .expect("list")
            .len(),
        1
    );
    assert!(!repo.force_release("i-missing").await.expect("unknown id"));
}

#[tokio::test]
async fn list_by_status_orders_by_instance_id() {
    let repo = repo().await;
    for id in ["i-300", "i-100", "i-200"] {
        repo.register(&PoolInstance::available(id.into()))
            .await
            .expect("register");
    }
    repo.claim("i-200", "sess-a", "student-a", Utc::now())
        .await
        .expect("claim");

    let available: Vec<String> = repo
        .list_by_status(PoolStatus::Available)
        .await
        .expect("list")
        .into_iter()
        .map(|p| p.instance_id)
        .collect();
    assert_eq!(available, vec!["i-100", "i-300"]);
}

#[tokio::test]
async fn get_unknown_instance_is_not_found() {
    let repo = repo().await;
    let err = repo.get("i-missing").await.expect_err("missing");
    assert!(matches!(err, lab_orchestrator::AppError::NotFound(_)));
}
