//! Detection worker: the sequential queue consumer.
//!
//! Each iteration carries one job through
//! `Received → Fetched → Detected → Persisted → Committed`. The queue message
//! is deleted only after the result has been upserted; any failure before
//! that leaves the message leased, so it comes back after the visibility
//! timeout unless the failure is permanent and the job is dead-lettered.
//! Once committed, the annotated image and a summary go back to the chat
//! that submitted the job, if the worker has a messenger.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{Display, IntoStaticStr};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::models::detection::DetectionResult;
use crate::models::job::{JobDescriptor, JobParseError, JobStage};
use crate::models::taxonomy::Taxonomy;
use crate::services::detector::{DetectionEngine, DetectionError, DetectionRequest};
use crate::services::labels::{self, LabelError};
use crate::services::messaging::{Messenger, OutgoingPhoto};
use crate::services::notifier::format_summary;
use crate::services::queue::{JobQueue, QueueError, ReceivedMessage};
use crate::services::results::{ResultStore, ResultStoreError};
use crate::services::retry::{with_backoff, RetryPolicy};
use crate::services::storage::{BlobStore, StorageError};

const PREDICTIONS_PREFIX: &str = "predictions/";

/// Tunables for the consumer loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Root of the local scratch area. Every delivery works in its own
    /// `<root>/jobs/<job_id>-<delivery>` directory.
    pub scratch_dir: PathBuf,
    /// Long-poll duration of each receive.
    pub receive_wait: Duration,
    /// Deliveries after which a message is dead-lettered unprocessed.
    pub max_receive_count: u32,
    /// Backoff for transient queue, blob and result-store calls.
    pub retry: RetryPolicy,
    /// Pause after the queue itself fails, before polling again.
    pub error_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("detect-pipeline"),
            receive_wait: Duration::from_secs(5),
            max_receive_count: 5,
            retry: RetryPolicy::default(),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Everything a worker needs, handed over at construction.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub results: Arc<dyn ResultStore>,
    pub engine: Arc<dyn DetectionEngine>,
    pub taxonomy: Arc<Taxonomy>,
    /// Where finished results are sent; `None` leaves them to be looked up.
    pub messenger: Option<Arc<dyn Messenger>>,
    pub settings: WorkerSettings,
}

/// Failure classes, each with a fixed disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    TransientIo,
    Data,
    DetectionEngine,
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the message leased; the queue redelivers it.
    Retry,
    /// Retrying cannot help; move the message to the dead-letter list.
    DeadLetter,
}

impl FailureKind {
    pub fn disposition(self) -> Disposition {
        match self {
            FailureKind::TransientIo | FailureKind::Persistence => Disposition::Retry,
            FailureKind::Data | FailureKind::DetectionEngine => Disposition::DeadLetter,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("malformed job body: {0}")]
    Malformed(#[from] JobParseError),

    #[error("image key {0:?} has no file name")]
    InvalidImageKey(String),

    #[error("failed to fetch image: {0}")]
    Fetch(#[source] StorageError),

    #[error("scratch storage error: {0}")]
    Scratch(#[from] std::io::Error),

    #[error("detection failed: {0}")]
    Engine(#[from] DetectionError),

    #[error("unreadable detector labels: {0}")]
    Labels(#[from] LabelError),

    #[error("failed to upload annotated image: {0}")]
    Upload(#[source] StorageError),

    #[error("failed to persist result: {0}")]
    Persist(#[source] ResultStoreError),
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Malformed(_) | JobError::InvalidImageKey(_) => FailureKind::Data,
            // Jobs are published after their upload; a missing blob stays missing.
            JobError::Fetch(StorageError::NotFound(_)) => FailureKind::Data,
            JobError::Fetch(_) | JobError::Scratch(_) | JobError::Upload(_) => {
                FailureKind::TransientIo
            }
            JobError::Engine(_) | JobError::Labels(_) => FailureKind::DetectionEngine,
            JobError::Persist(_) => FailureKind::Persistence,
        }
    }
}

/// How one received message was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// Result persisted and message deleted.
    Committed { job_id: String, detections: usize },
    /// Result persisted but the delete failed; redelivery will upsert again.
    PersistedUncommitted { job_id: String },
    /// Message moved to the dead-letter list.
    DeadLettered { job_id: String, kind: Option<FailureKind> },
    /// Message left leased for redelivery.
    Released { job_id: String, kind: FailureKind },
}

pub struct DetectionWorker {
    ctx: WorkerContext,
}

impl DetectionWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Poll and process jobs until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts a pending receive but never a job in progress.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Worker ready, starting job processing loop");

        while !shutdown.is_cancelled() {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.ctx.queue.receive(1, self.ctx.settings.receive_wait) => received,
            };

            match received {
                Ok(messages) if messages.is_empty() => {
                    tracing::trace!("No jobs available");
                }
                Ok(messages) => {
                    for message in messages {
                        self.handle(message).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive from job queue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.settings.error_backoff) => {}
                    }
                }
            }
        }

        tracing::info!("Worker stopped");
    }

    /// Receive at most one message and settle it. Returns `None` when the
    /// queue had nothing within the receive wait.
    pub async fn run_once(&self) -> Result<Option<IterationOutcome>, QueueError> {
        let mut messages = self
            .ctx
            .queue
            .receive(1, self.ctx.settings.receive_wait)
            .await?;
        match messages.pop() {
            Some(message) => Ok(Some(self.handle(message).await)),
            None => Ok(None),
        }
    }

    /// Settle one received message. Never fails: every outcome is logged and
    /// reported, and the loop moves on.
    pub async fn handle(&self, message: ReceivedMessage) -> IterationOutcome {
        let span = tracing::info_span!("job", job_id = %message.id, receive_count = message.receive_count);
        self.settle(message).instrument(span).await
    }

    async fn settle(&self, message: ReceivedMessage) -> IterationOutcome {
        let job_id = message.id.clone();

        if message.receive_count > self.ctx.settings.max_receive_count {
            let reason = format!(
                "gave up after {} deliveries (limit {})",
                message.receive_count, self.ctx.settings.max_receive_count
            );
            tracing::warn!(job_id = %job_id, receive_count = message.receive_count, "Receive limit exceeded");
            return self.dead_letter(&message, None, &reason).await;
        }

        let start = Instant::now();
        let workdir = self.delivery_dir(&job_id);
        let processed = self.process(&message, &workdir).await;
        self.cleanup(&job_id, &workdir).await;

        match processed {
            Ok((chat_id, result)) => {
                let outcome = self.commit(&message, &result, start).await;
                if matches!(outcome, IterationOutcome::Committed { .. }) {
                    self.deliver(&chat_id, &result).await;
                }
                outcome
            }
            Err(e) => {
                let kind = e.kind();
                let kind_label: &'static str = kind.into();
                metrics::counter!("detection_jobs_failed_total", "kind" => kind_label).increment(1);

                match kind.disposition() {
                    Disposition::DeadLetter => {
                        tracing::error!(job_id = %job_id, kind = %kind, error = %e, "Job failed permanently");
                        self.dead_letter(&message, Some(kind), &e.to_string()).await
                    }
                    Disposition::Retry => {
                        tracing::warn!(
                            job_id = %job_id,
                            kind = %kind,
                            error = %e,
                            "Job failed, leaving message for redelivery"
                        );
                        IterationOutcome::Released { job_id, kind }
                    }
                }
            }
        }
    }

    /// Returns the submitting chat alongside the persisted result.
    async fn process(
        &self,
        message: &ReceivedMessage,
        workdir: &Path,
    ) -> Result<(String, DetectionResult), JobError> {
        let settings = &self.ctx.settings;
        let job = JobDescriptor::parse(&message.id, &message.body, message.enqueued_at)?;
        tracing::info!(
            job_id = %job.job_id,
            image_key = %job.image_key,
            chat_id = %job.chat_id,
            stage = %JobStage::Received,
            "Processing detection job"
        );

        let file_name = job
            .image_file_name()
            .ok_or_else(|| JobError::InvalidImageKey(job.image_key.clone()))?
            .to_string();
        let local_image = workdir.join(&file_name);

        let blobs = &self.ctx.blobs;
        let image_key = job.image_key.as_str();
        let bytes = with_backoff(&settings.retry, "image download", move || blobs.get(image_key))
            .await
            .map_err(JobError::Fetch)?;
        tokio::fs::create_dir_all(workdir).await?;
        tokio::fs::write(&local_image, &bytes).await?;
        tracing::info!(job_id = %job.job_id, stage = %JobStage::Fetched, path = %local_image.display(), "Image downloaded");

        let request = DetectionRequest {
            source: local_image,
            output_dir: workdir.join("predict"),
            run_name: job.job_id.clone(),
        };
        let detect_start = Instant::now();
        let output = self.ctx.engine.detect(&request).await?;
        let detections = labels::read_labels(output.labels_file.as_deref(), &self.ctx.taxonomy).await?;
        metrics::histogram!("detection_engine_seconds").record(detect_start.elapsed().as_secs_f64());
        tracing::info!(
            job_id = %job.job_id,
            stage = %JobStage::Detected,
            detections = detections.len(),
            "Detection complete"
        );

        let annotated_key = format!("{PREDICTIONS_PREFIX}{file_name}");
        let annotated_path = output.annotated_image.as_path();
        let key = annotated_key.as_str();
        with_backoff(&settings.retry, "annotated upload", move || blobs.put_file(key, annotated_path))
            .await
            .map_err(JobError::Upload)?;

        let result = DetectionResult {
            job_id: job.job_id.clone(),
            original_image_path: job.image_key.clone(),
            annotated_image_path: annotated_key,
            detections,
            completed_at: Utc::now(),
        };
        let results = &self.ctx.results;
        let pending = &result;
        with_backoff(&settings.retry, "result upsert", move || results.upsert(pending))
            .await
            .map_err(JobError::Persist)?;
        tracing::info!(job_id = %job.job_id, stage = %JobStage::Persisted, "Result stored");

        Ok((job.chat_id, result))
    }

    async fn commit(
        &self,
        message: &ReceivedMessage,
        result: &DetectionResult,
        start: Instant,
    ) -> IterationOutcome {
        let queue = &self.ctx.queue;
        let ack_token = message.ack_token.as_str();
        let deleted = with_backoff(&self.ctx.settings.retry, "message delete", move || {
            queue.delete(ack_token)
        })
        .await;

        match deleted {
            Ok(()) => {
                metrics::counter!("detection_jobs_completed_total").increment(1);
                metrics::histogram!("detection_processing_seconds")
                    .record(start.elapsed().as_secs_f64());
                tracing::info!(
                    job_id = %result.job_id,
                    stage = %JobStage::Committed,
                    detections = result.detections.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
                IterationOutcome::Committed {
                    job_id: result.job_id.clone(),
                    detections: result.detections.len(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %result.job_id,
                    error = %e,
                    "Result stored but message delete failed; job will be redelivered"
                );
                IterationOutcome::PersistedUncommitted {
                    job_id: result.job_id.clone(),
                }
            }
        }
    }

    /// Send the annotated image, captioned with the summary, to the chat.
    /// The job is already committed, so failures here are only logged.
    async fn deliver(&self, chat_id: &str, result: &DetectionResult) {
        let Some(messenger) = &self.ctx.messenger else {
            return;
        };

        let blobs = &self.ctx.blobs;
        let key = result.annotated_image_path.as_str();
        let bytes = match with_backoff(&self.ctx.settings.retry, "annotated download", move || {
            blobs.get(key)
        })
        .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(job_id = %result.job_id, key, error = %e, "Could not load annotated image for delivery");
                return;
            }
        };

        let photo = OutgoingPhoto {
            file_name: key.rsplit('/').next().unwrap_or(key).to_string(),
            bytes,
            caption: Some(format_summary(result)),
        };
        match messenger.send_photo(chat_id, photo).await {
            Ok(()) => tracing::info!(job_id = %result.job_id, chat_id, "Sent annotated image to chat"),
            Err(e) => {
                tracing::warn!(job_id = %result.job_id, chat_id, error = %e, "Failed to send annotated image")
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        kind: Option<FailureKind>,
        reason: &str,
    ) -> IterationOutcome {
        let queue = &self.ctx.queue;
        let dead_lettered = with_backoff(&self.ctx.settings.retry, "dead letter", move || {
            queue.dead_letter(message, reason)
        })
        .await;

        match dead_lettered {
            Ok(()) => {
                metrics::counter!("detection_jobs_dead_lettered_total").increment(1);
                tracing::warn!(job_id = %message.id, reason, "Job moved to dead-letter list");
                IterationOutcome::DeadLettered {
                    job_id: message.id.clone(),
                    kind,
                }
            }
            Err(e) => {
                tracing::error!(job_id = %message.id, error = %e, "Failed to dead-letter job");
                IterationOutcome::Released {
                    job_id: message.id.clone(),
                    kind: kind.unwrap_or(FailureKind::TransientIo),
                }
            }
        }
    }

    /// Concurrent deliveries of one job never share a directory.
    fn delivery_dir(&self, job_id: &str) -> PathBuf {
        self.ctx
            .settings
            .scratch_dir
            .join("jobs")
            .join(format!("{job_id}-{}", Uuid::new_v4().simple()))
    }

    async fn cleanup(&self, job_id: &str, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id, path = %dir.display(), error = %e, "Failed to clean job scratch dir");
            }
        }
    }
}
