//! Fakes and a wired-up in-memory pipeline for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use detect_pipeline::models::detection::DetectionResult;
use detect_pipeline::models::taxonomy::Taxonomy;
use detect_pipeline::services::detector::{
    DetectionEngine, DetectionError, DetectionOutput, DetectionRequest,
};
use detect_pipeline::services::ingest::IngestionGateway;
use detect_pipeline::services::messaging::{
    FetchedPhoto, Messenger, MessagingError, OutgoingPhoto, PhotoSource,
};
use detect_pipeline::services::queue::InMemoryJobQueue;
use detect_pipeline::services::results::{InMemoryResultStore, ResultStore, ResultStoreError};
use detect_pipeline::services::retry::RetryPolicy;
use detect_pipeline::services::storage::{BlobStore, InMemoryBlobStore, StorageError};
use detect_pipeline::worker::{DetectionWorker, WorkerContext, WorkerSettings};

pub const CLASSES: [&str; 4] = ["person", "bicycle", "car", "dog"];

/// A one-pixel PNG; format sniffing only looks at its signature.
pub const PNG_PIXEL: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

pub fn taxonomy() -> Taxonomy {
    Taxonomy::new(CLASSES.iter().map(|c| c.to_string()).collect())
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

/// Detector stand-in: copies the source as the "annotated" image and writes
/// the configured label file, if any.
pub struct FakeEngine {
    labels: Option<String>,
    fail: bool,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeEngine {
    pub fn with_labels(labels: &str) -> Self {
        Self {
            labels: Some(labels.to_string()),
            fail: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn without_labels() -> Self {
        Self {
            labels: None,
            fail: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            labels: None,
            fail: true,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before touching any files, like a slow model would.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionEngine for FakeEngine {
    async fn detect(&self, request: &DetectionRequest) -> Result<DetectionOutput, DetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(DetectionError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "CUDA out of memory".to_string(),
            });
        }

        let spawn_error = |source: std::io::Error| DetectionError::Spawn {
            program: "fake".to_string(),
            source,
        };
        let run_dir = request.run_dir();
        tokio::fs::create_dir_all(run_dir.join("labels"))
            .await
            .map_err(spawn_error)?;
        if let Some(annotated) = request.annotated_image_path() {
            tokio::fs::copy(&request.source, annotated)
                .await
                .map_err(spawn_error)?;
        }
        if let (Some(labels), Some(path)) = (&self.labels, request.labels_path()) {
            tokio::fs::write(path, labels).await.map_err(spawn_error)?;
        }

        DetectionOutput::locate(request).await
    }
}

/// Result store whose writes can be switched off.
#[derive(Default)]
pub struct FlakyResultStore {
    inner: InMemoryResultStore,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl FlakyResultStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl ResultStore for FlakyResultStore {
    async fn upsert(&self, result: &DetectionResult) -> Result<(), ResultStoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ResultStoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.upsert(result).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<DetectionResult>, ResultStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ResultStoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.get(job_id).await
    }
}

/// Messenger that records every message instead of sending it.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(String, String)>>,
    photos: Mutex<Vec<(String, OutgoingPhoto)>>,
    failing: AtomicBool,
}

impl RecordingMessenger {
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn photos(&self) -> Vec<(String, OutgoingPhoto)> {
        self.photos.lock().unwrap().clone()
    }

    fn refuse(&self, method: &str) -> Result<(), MessagingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MessagingError::Api {
                method: method.to_string(),
                description: "Forbidden: bot was blocked by the user".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), MessagingError> {
        self.refuse("sendMessage")?;
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_photo(&self, chat_id: &str, photo: OutgoingPhoto) -> Result<(), MessagingError> {
        self.refuse("sendPhoto")?;
        self.photos.lock().unwrap().push((chat_id.to_string(), photo));
        Ok(())
    }
}

/// Photo source serving a fixed set of files.
#[derive(Default)]
pub struct StaticPhotoSource {
    photos: HashMap<String, FetchedPhoto>,
}

impl StaticPhotoSource {
    pub fn with_photo(mut self, file_id: &str, file_name: Option<&str>, bytes: &[u8]) -> Self {
        self.photos.insert(
            file_id.to_string(),
            FetchedPhoto {
                file_name: file_name.map(str::to_string),
                bytes: bytes.to_vec(),
            },
        );
        self
    }
}

#[async_trait]
impl PhotoSource for StaticPhotoSource {
    async fn fetch(&self, file_id: &str) -> Result<FetchedPhoto, MessagingError> {
        self.photos
            .get(file_id)
            .cloned()
            .ok_or_else(|| MessagingError::Api {
                method: "getFile".to_string(),
                description: "Bad Request: invalid file_id".to_string(),
            })
    }
}

/// Blob store that is always down.
pub struct UnavailableBlobStore;

#[async_trait]
impl BlobStore for UnavailableBlobStore {
    async fn put(&self, key: &str, _data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        Err(StorageError::Status {
            key: key.to_string(),
            code: 503,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Status {
            key: key.to_string(),
            code: 503,
        })
    }
}

/// A worker wired to in-memory infrastructure and a scratch directory.
pub struct TestPipeline {
    pub queue: Arc<InMemoryJobQueue>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub engine: Arc<FakeEngine>,
    pub worker: DetectionWorker,
    pub scratch: TempDir,
}

pub const VISIBILITY_TIMEOUT: Duration = Duration::from_millis(200);

pub fn pipeline(engine: FakeEngine, results: Arc<dyn ResultStore>) -> TestPipeline {
    pipeline_with_messenger(engine, results, None)
}

/// Like [`pipeline`], with finished results sent through `messenger`.
pub fn pipeline_with_messenger(
    engine: FakeEngine,
    results: Arc<dyn ResultStore>,
    messenger: Option<Arc<dyn Messenger>>,
) -> TestPipeline {
    let queue = Arc::new(InMemoryJobQueue::new(VISIBILITY_TIMEOUT));
    let blobs = Arc::new(InMemoryBlobStore::new());
    let engine = Arc::new(engine);
    let scratch = tempfile::tempdir().unwrap();

    let worker = worker(
        queue.clone(),
        blobs.clone(),
        results,
        engine.clone(),
        messenger,
        &scratch,
    );

    TestPipeline {
        queue,
        blobs,
        engine,
        worker,
        scratch,
    }
}

/// Another worker over the same queue, blobs and scratch directory as `p`.
pub fn second_worker(
    p: &TestPipeline,
    engine: Arc<FakeEngine>,
    results: Arc<dyn ResultStore>,
) -> DetectionWorker {
    worker(p.queue.clone(), p.blobs.clone(), results, engine, None, &p.scratch)
}

fn worker(
    queue: Arc<InMemoryJobQueue>,
    blobs: Arc<InMemoryBlobStore>,
    results: Arc<dyn ResultStore>,
    engine: Arc<FakeEngine>,
    messenger: Option<Arc<dyn Messenger>>,
    scratch: &TempDir,
) -> DetectionWorker {
    DetectionWorker::new(WorkerContext {
        queue,
        blobs,
        results,
        engine,
        taxonomy: Arc::new(taxonomy()),
        messenger,
        settings: WorkerSettings {
            scratch_dir: scratch.path().to_path_buf(),
            receive_wait: Duration::from_millis(50),
            max_receive_count: 3,
            retry: fast_retry(),
            error_backoff: Duration::from_millis(10),
        },
    })
}

/// Gateway over the given stores, acknowledging into `messenger`.
pub fn gateway(
    blobs: Arc<dyn BlobStore>,
    queue: Arc<InMemoryJobQueue>,
    source: StaticPhotoSource,
    messenger: Arc<RecordingMessenger>,
    scratch: &TempDir,
) -> IngestionGateway {
    IngestionGateway::new(
        blobs,
        queue,
        Arc::new(source),
        messenger,
        scratch.path(),
        fast_retry(),
    )
}
