//! Postgres broker against a live database.
//! Run with `DATABASE_URL=postgres://... cargo test -p spektra-queue -- --ignored`.

use std::time::Duration;

use futures::StreamExt;
use spektra_core::job::{Hyperparams, JobParameters, TrainParams};
use spektra_queue::{PgTaskBroker, QueueName, Revocation, TaskBroker, TaskHandle, TaskMessage};
use sqlx::PgPool;
use uuid::Uuid;

const LEASE: Duration = Duration::from_secs(30);

fn train_message() -> (QueueName, TaskMessage) {
    let params =
        TrainParams::new("yolo11n.pt", Hyperparams::default(), Default::default(), None).unwrap();
    TaskMessage::for_job(Uuid::new_v4(), Uuid::new_v4(), JobParameters::Train(params))
}

#[sqlx::test(migrations = "../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_claim_is_exclusive(pool: PgPool) {
    let broker = PgTaskBroker::new(pool);
    let (queue, message) = train_message();
    let handle = broker.enqueue(&queue, &message).await.unwrap();
    let queues = [queue];

    let claimed = broker.dequeue(&queues, "w1", LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.handle, handle);
    assert_eq!(claimed.message, message);
    assert!(broker.dequeue(&queues, "w2", LEASE).await.unwrap().is_none());

    assert!(broker.renew_lease(handle, "w1", LEASE).await.unwrap());
    assert!(!broker.renew_lease(handle, "w2", LEASE).await.unwrap());
    broker.ack(handle).await.unwrap();
    assert!(!broker.renew_lease(handle, "w1", LEASE).await.unwrap());
}

#[sqlx::test(migrations = "../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_expired_lease_is_reclaimed(pool: PgPool) {
    let broker = PgTaskBroker::new(pool);
    let (queue, message) = train_message();
    let handle = broker.enqueue(&queue, &message).await.unwrap();
    let queues = [queue];

    broker
        .dequeue(&queues, "w1", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let again = broker.dequeue(&queues, "w2", LEASE).await.unwrap().unwrap();
    assert_eq!(again.handle, handle);
    assert_eq!(again.attempts, 2);
}

#[sqlx::test(migrations = "../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_revocation_blocks_delivery_and_notifies(pool: PgPool) {
    let broker = PgTaskBroker::new(pool);
    let mut revocations = broker.revocations().await.unwrap();
    let (queue, message) = train_message();
    let handle = broker.enqueue(&queue, &message).await.unwrap();

    broker.revoke(handle, true).await.unwrap();
    assert!(broker.is_revoked(handle).await.unwrap());
    assert!(broker.dequeue(&[queue], "w1", LEASE).await.unwrap().is_none());

    let notice = tokio::time::timeout(Duration::from_secs(5), revocations.next())
        .await
        .unwrap();
    assert_eq!(notice, Some(Revocation { handle, terminate: true }));
}

#[sqlx::test(migrations = "../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_job_handle_enqueues_once(pool: PgPool) {
    let broker = PgTaskBroker::new(pool);
    let (queue, message) = train_message();
    let handle = TaskHandle::for_job(message.payload.job_id);

    assert!(broker.enqueue_as(handle, &queue, &message).await.unwrap());
    assert!(!broker.enqueue_as(handle, &queue, &message).await.unwrap());

    let queues = [queue];
    let claimed = broker.dequeue(&queues, "w1", LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.handle, handle);
    assert!(broker.dequeue(&queues, "w1", LEASE).await.unwrap().is_none());
}
