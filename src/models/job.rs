use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Deserializer, Serialize};
use strum::Display;

/// Stage a job has reached inside a single worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobStage {
    Received,
    Fetched,
    Detected,
    Persisted,
    Committed,
}

/// Job payload as it travels through the queue: `{"img_name": .., "chat_id": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct JobBody {
    #[serde(rename = "img_name")]
    #[garde(length(min = 1, max = 1024))]
    pub image_key: String,

    /// Chat platforms hand out numeric ids; both numbers and strings are accepted.
    #[serde(deserialize_with = "chat_id_from_any")]
    #[garde(length(min = 1, max = 64))]
    pub chat_id: String,
}

impl JobBody {
    pub fn new(image_key: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            image_key: image_key.into(),
            chat_id: chat_id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A unit of detection work, reconstructed from a received queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Queue-assigned message id, reused as the prediction id.
    pub job_id: String,
    pub image_key: String,
    pub chat_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Parse and validate a raw message body.
    pub fn parse(
        job_id: &str,
        body: &str,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Self, JobParseError> {
        let payload: JobBody = serde_json::from_str(body).map_err(JobParseError::Json)?;
        payload.validate().map_err(JobParseError::Invalid)?;

        Ok(Self {
            job_id: job_id.to_string(),
            image_key: payload.image_key,
            chat_id: payload.chat_id,
            enqueued_at,
        })
    }

    /// Final path component of the image key, e.g. `cat.jpg` for `images/cat.jpg`.
    pub fn image_file_name(&self) -> Option<&str> {
        self.image_key
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobParseError {
    #[error("job body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("job body failed validation: {0}")]
    Invalid(garde::Report),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChatIdRepr {
    Text(String),
    Number(i64),
}

fn chat_id_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ChatIdRepr::deserialize(deserializer)? {
        ChatIdRepr::Text(text) => text,
        ChatIdRepr::Number(number) => number.to_string(),
    })
}
