//! Postgres-backed repository tests. Run with a database available:
//! `DATABASE_URL=postgres://... cargo test -p spektra-db -- --ignored`.

use assert_matches::assert_matches;
use serde_json::json;
use spektra_core::job::{CheckpointSelector, Hyperparams, JobParameters, TrainParams};
use spektra_core::telemetry::LogEntry;
use spektra_db::models::job::{JobListQuery, NewJob};
use spektra_db::models::status::JobStatus;
use spektra_db::repositories::JobRepo;
use sqlx::PgPool;
use uuid::Uuid;

fn new_train_job(project_id: Uuid) -> NewJob {
    let params = TrainParams::new("yolo11s.pt", Hyperparams::default(), CheckpointSelector::Scratch, None)
        .unwrap();
    NewJob::new(project_id, JobParameters::Train(params))
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_bootstrap_seeds_statuses(pool: PgPool) {
    spektra_db::health_check(&pool).await.unwrap();
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_statuses")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 5);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_two_phase_create(pool: PgPool) {
    let input = new_train_job(Uuid::new_v4());
    let job = JobRepo::create(&pool, &input).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.task_handle, None);
    assert_eq!(job.channel_name, format!("job_logs:{}", job.id));
    assert_matches!(job.parameters.0, JobParameters::Train(_));

    let patched = JobRepo::claim_task(&pool, job.id, job.channel_name.as_str(), "task-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patched.task_handle.as_deref(), Some("task-1"));

    let second = JobRepo::claim_task(&pool, job.id, job.channel_name.as_str(), "task-2")
        .await
        .unwrap();
    assert!(second.is_none());
    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.task_handle.as_deref(), Some("task-1"));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_terminal_status_is_sticky(pool: PgPool) {
    let job = JobRepo::create(&pool, &new_train_job(Uuid::new_v4())).await.unwrap();
    JobRepo::mark_running(&pool, job.id).await.unwrap().unwrap();
    assert!(JobRepo::mark_running(&pool, job.id).await.unwrap().is_none());

    let cancelled = JobRepo::cancel(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    assert!(JobRepo::cancel(&pool, job.id).await.unwrap().is_none());
    assert!(!JobRepo::fail(&pool, job.id).await.unwrap());
    assert!(!JobRepo::complete(&pool, job.id, Some("models/x.pt"), &json!({})).await.unwrap());
    assert!(JobRepo::mark_running(&pool, job.id).await.unwrap().is_none());

    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert_eq!(stored.artifact_path, None);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_completion_and_model_lookup(pool: PgPool) {
    let project = Uuid::new_v4();
    assert_eq!(JobRepo::latest_artifact(&pool, project).await.unwrap(), None);

    let job = JobRepo::create(&pool, &new_train_job(project)).await.unwrap();
    JobRepo::merge_metrics(&pool, project, job.id, &json!({ "_notes": "baseline" }))
        .await
        .unwrap()
        .unwrap();
    JobRepo::mark_running(&pool, job.id).await.unwrap();
    assert!(JobRepo::complete(&pool, job.id, Some("models/a.pt"), &json!({ "mAP50": 0.5 }))
        .await
        .unwrap());
    JobRepo::store_logs(&pool, job.id, &[LogEntry::now("done")]).await.unwrap();

    assert_eq!(
        JobRepo::latest_artifact(&pool, project).await.unwrap().as_deref(),
        Some("models/a.pt")
    );
    let stored = JobRepo::find_by_artifact(&pool, "models/a.pt").await.unwrap().unwrap();
    assert_eq!(stored.id, job.id);
    assert_eq!(stored.metrics["_notes"], "baseline");
    assert_eq!(stored.metrics["mAP50"], 0.5);
    assert_eq!(stored.logs.0.len(), 1);

    let models = JobRepo::list_trained_models(&pool, project).await.unwrap();
    assert_eq!(models.len(), 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_list_filters(pool: PgPool) {
    let project = Uuid::new_v4();
    let a = JobRepo::create(&pool, &new_train_job(project)).await.unwrap();
    JobRepo::create(&pool, &new_train_job(Uuid::new_v4())).await.unwrap();
    JobRepo::mark_running(&pool, a.id).await.unwrap();

    let query = JobListQuery {
        project_id: Some(project),
        status: Some(JobStatus::Running),
        ..Default::default()
    };
    let jobs = JobRepo::list(&pool, &query).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, a.id);
}
