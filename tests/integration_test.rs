use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

use detect_pipeline::{
    config::AppConfig,
    db::{self, queries},
    models::detection::{Detection, DetectionResult},
    models::job::JobBody,
    services::{
        queue::{JobQueue, RedisJobQueue},
        results::{PgResultStore, ResultStore},
        storage::{BlobStore, S3BlobStore, StorageError},
    },
};

// Infrastructure tests. These require running PostgreSQL, Redis and an
// S3-compatible store configured via environment variables.
// Run with: cargo test --test integration_test -- --ignored

fn test_config() -> AppConfig {
    AppConfig::from_env().expect("Failed to load config")
}

/// Redis queue: lease, redelivery after the visibility timeout, idempotent
/// delete and dead-lettering.
#[tokio::test]
#[ignore]
async fn test_redis_queue_lease_cycle() {
    let config = test_config();
    let name = format!("test:{}", Uuid::new_v4().simple());
    let queue = RedisJobQueue::new(&config.redis_url, &name, Duration::from_secs(2))
        .expect("Failed to initialize queue");
    queue.health_check().await.expect("Redis unreachable");

    let body = JobBody::new("images/cat.jpg", "42").to_json().unwrap();
    let id = queue.publish(&body).await.expect("Failed to publish");
    assert_eq!(queue.depth().await.unwrap(), 1);

    let first = queue.receive(1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, id);
    assert_eq!(first[0].body, body);
    assert_eq!(first[0].receive_count, 1);

    // Leased: hidden until the lease runs out.
    assert!(queue.receive(1, Duration::from_secs(1)).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_secs(2)).await;

    let second = queue.receive(1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].receive_count, 2);

    queue.delete(&second[0].ack_token).await.expect("Failed to delete");
    queue.delete(&second[0].ack_token).await.expect("Second delete must be a no-op");
    queue.delete(&first[0].ack_token).await.expect("Stale token delete must be a no-op");
    assert_eq!(queue.depth().await.unwrap(), 0);

    let poison = queue.publish("not json").await.unwrap();
    let received = queue.receive(1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(received[0].id, poison);
    queue
        .dead_letter(&received[0], "malformed job body")
        .await
        .expect("Failed to dead-letter");
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(queue.receive(1, Duration::from_secs(1)).await.unwrap().is_empty());
}

/// PostgreSQL result store: repeated upserts keep one row per job.
#[tokio::test]
#[ignore]
async fn test_postgres_upsert_is_idempotent() {
    let config = test_config();
    let pool = db::init_pool(&config.database_url, 2)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");
    let store = PgResultStore::new(pool.clone());
    store.health_check().await.expect("Database unreachable");

    let job_id = Uuid::new_v4().to_string();
    let result = DetectionResult {
        job_id: job_id.clone(),
        original_image_path: "images/cat.jpg".into(),
        annotated_image_path: "predictions/cat.jpg".into(),
        detections: vec![Detection {
            class_name: "person".into(),
            cx: 0.5,
            cy: 0.5,
            width: 0.2,
            height: 0.3,
        }],
        completed_at: Utc::now(),
    };

    assert_eq!(store.get(&job_id).await.unwrap(), None);

    store.upsert(&result).await.expect("First upsert failed");
    store.upsert(&result).await.expect("Second upsert failed");

    let stored = store.get(&job_id).await.unwrap().expect("Result not found");
    assert_eq!(stored.detections, result.detections);
    assert_eq!(stored.annotated_image_path, result.annotated_image_path);
    assert_eq!(queries::write_count(&pool, &job_id).await.unwrap(), Some(2));

    let empty_id = Uuid::new_v4().to_string();
    store
        .upsert(&DetectionResult {
            job_id: empty_id.clone(),
            detections: vec![],
            ..result
        })
        .await
        .unwrap();
    let empty = store.get(&empty_id).await.unwrap().expect("Empty result not found");
    assert!(empty.detections.is_empty());
}

/// S3 blob store: put, get and not-found.
#[tokio::test]
#[ignore]
async fn test_s3_blob_roundtrip() {
    let config = test_config();
    let blobs = S3BlobStore::new(
        &config.s3_bucket,
        &config.s3_region,
        config.s3_endpoint.as_deref(),
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize S3 client");

    let key = format!("test/{}.png", Uuid::new_v4());
    blobs
        .put(&key, b"not really a png", "image/png")
        .await
        .expect("Upload failed");
    let downloaded = blobs.get(&key).await.expect("Download failed");
    assert_eq!(downloaded, b"not really a png");

    let missing = blobs.get(&format!("test/{}.png", Uuid::new_v4())).await;
    assert!(matches!(missing, Err(StorageError::NotFound(_))));
}
