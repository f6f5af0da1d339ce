use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::JobBody;
use crate::services::messaging::{FetchedPhoto, Messenger, MessagingError, PhotoSource};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::retry::{with_backoff, RetryPolicy};
use crate::services::storage::{BlobStore, StorageError};

/// Extensions the detector accepts as-is; anything else gets `.jpg` appended.
pub const SUPPORTED_IMAGE_EXTENSIONS: [&str; 9] =
    ["bmp", "dng", "jpeg", "jpg", "mpo", "png", "tif", "tiff", "webp"];

const IMAGE_PREFIX: &str = "images/";

pub const PROCESSING_TEXT: &str =
    "Your image is being processed. Please wait while the results are prepared.";

/// Chat acknowledgement sent once a job is on the queue. The prediction id
/// is what `POST /results` takes to look the result up again.
pub fn processing_text(job_id: &str) -> String {
    format!("{PROCESSING_TEXT}\nPrediction id: {job_id}")
}

/// A photo attachment as referenced by the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_id: String,
    pub chat_id: String,
    pub caption: Option<String>,
}

/// A job that made it onto the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedJob {
    pub job_id: String,
    pub image_key: String,
    pub chat_id: String,
}

/// Blob key for an incoming photo: `images/<caption>`, falling back to the
/// platform file name and then a generated name. Unsupported or missing
/// extensions get `.jpg` appended.
pub fn normalize_image_key(caption: Option<&str>, file_name: Option<&str>) -> String {
    let base = [caption, file_name]
        .into_iter()
        .flatten()
        .map(|name| name.trim().replace(['/', '\\'], "_"))
        .find(|name| !name.is_empty() && name.chars().any(|c| c != '.' && c != '_'))
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let supported = base
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str()));

    if supported {
        format!("{IMAGE_PREFIX}{base}")
    } else {
        format!("{IMAGE_PREFIX}{base}.jpg")
    }
}

/// Turns incoming photos into a stored blob plus a published job.
///
/// The job is published only after the upload has succeeded, so no queued
/// job ever points at a missing blob.
pub struct IngestionGateway {
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn JobQueue>,
    source: Arc<dyn PhotoSource>,
    messenger: Arc<dyn Messenger>,
    scratch_dir: PathBuf,
    retry: RetryPolicy,
}

impl IngestionGateway {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn JobQueue>,
        source: Arc<dyn PhotoSource>,
        messenger: Arc<dyn Messenger>,
        scratch_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            blobs,
            queue,
            source,
            messenger,
            scratch_dir: scratch_dir.into(),
            retry,
        }
    }

    /// Fetch the attachment from the chat platform, then store and publish it.
    pub async fn ingest(&self, attachment: &Attachment) -> Result<PublishedJob, IngestError> {
        let photo = self
            .source
            .fetch(&attachment.file_id)
            .await
            .map_err(IngestError::Fetch)?;
        tracing::info!(
            chat_id = %attachment.chat_id,
            file_id = %attachment.file_id,
            size = photo.bytes.len(),
            "Fetched photo from chat"
        );
        self.ingest_fetched(&attachment.chat_id, attachment.caption.as_deref(), photo)
            .await
    }

    /// Store and publish a photo whose bytes are already in hand.
    pub async fn ingest_fetched(
        &self,
        chat_id: &str,
        caption: Option<&str>,
        photo: FetchedPhoto,
    ) -> Result<PublishedJob, IngestError> {
        if photo.bytes.is_empty() {
            return Err(IngestError::EmptyAttachment);
        }
        if chat_id.trim().is_empty() {
            return Err(IngestError::MissingChatId);
        }

        let image_key = normalize_image_key(caption, photo.file_name.as_deref());
        let request_dir = self.scratch_dir.join("ingest").join(Uuid::new_v4().to_string());

        let published = self
            .store_and_publish(&request_dir, &image_key, chat_id, &photo.bytes)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&request_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %request_dir.display(), error = %e, "Failed to clean ingest scratch dir");
            }
        }

        let job = published?;
        metrics::counter!("detection_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.job_id,
            image_key = %job.image_key,
            chat_id = %job.chat_id,
            "Published detection job"
        );

        let ack = processing_text(&job.job_id);
        if let Err(e) = self.messenger.send_text(&job.chat_id, &ack).await {
            tracing::warn!(job_id = %job.job_id, chat_id = %job.chat_id, error = %e, "Failed to acknowledge job in chat");
        }
        Ok(job)
    }

    async fn store_and_publish(
        &self,
        request_dir: &Path,
        image_key: &str,
        chat_id: &str,
        bytes: &[u8],
    ) -> Result<PublishedJob, IngestError> {
        let file_name = image_key.trim_start_matches(IMAGE_PREFIX);
        let local_path = request_dir.join(file_name);
        tokio::fs::create_dir_all(request_dir)
            .await
            .map_err(IngestError::Scratch)?;
        tokio::fs::write(&local_path, bytes)
            .await
            .map_err(IngestError::Scratch)?;

        let blobs = &self.blobs;
        let local = local_path.as_path();
        with_backoff(&self.retry, "blob upload", move || blobs.put_file(image_key, local))
            .await
            .map_err(IngestError::Upload)?;
        tracing::info!(image_key, "Uploaded photo to blob store");

        let body = JobBody::new(image_key, chat_id)
            .to_json()
            .map_err(IngestError::Encode)?;
        let queue = &self.queue;
        let body = body.as_str();
        let job_id = with_backoff(&self.retry, "job publish", move || queue.publish(body))
            .await
            .map_err(IngestError::Publish)?;

        Ok(PublishedJob {
            job_id,
            image_key: image_key.to_string(),
            chat_id: chat_id.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("attachment is empty")]
    EmptyAttachment,

    #[error("chat id is missing")]
    MissingChatId,

    #[error("failed to fetch photo: {0}")]
    Fetch(#[source] MessagingError),

    #[error("scratch storage error: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("failed to upload photo: {0}")]
    Upload(#[source] StorageError),

    #[error("failed to encode job: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to publish job: {0}")]
    Publish(#[source] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_without_extension_gets_jpg() {
        assert_eq!(normalize_image_key(Some("vacation"), None), "images/vacation.jpg");
    }

    #[test]
    fn supported_extension_is_kept() {
        assert_eq!(normalize_image_key(Some("shot.png"), None), "images/shot.png");
        assert_eq!(normalize_image_key(Some("scan.TIFF"), None), "images/scan.TIFF");
    }

    #[test]
    fn unsupported_extension_gets_jpg() {
        assert_eq!(normalize_image_key(Some("notes.txt"), None), "images/notes.txt.jpg");
    }

    #[test]
    fn falls_back_to_platform_file_name() {
        assert_eq!(normalize_image_key(None, Some("file_12.jpg")), "images/file_12.jpg");
        assert_eq!(normalize_image_key(Some("   "), Some("file_12.jpg")), "images/file_12.jpg");
    }

    #[test]
    fn generates_name_when_nothing_usable() {
        let key = normalize_image_key(None, None);
        assert!(key.starts_with("images/"));
        assert!(key.ends_with(".jpg"));
        assert_eq!(key.len(), "images/".len() + 32 + ".jpg".len());
    }

    #[test]
    fn path_separators_cannot_escape_prefix() {
        assert_eq!(normalize_image_key(Some("../etc/passwd"), None), "images/.._etc_passwd.jpg");
        assert_eq!(normalize_image_key(Some("/"), Some("a.png")), "images/a.png");
    }
}
