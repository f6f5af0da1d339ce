use serde::{Deserialize, Serialize};

/// Response after submitting an image for detection.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub image_key: String,
    pub status: String,
    pub message: String,
}

/// Query string of `POST /results`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultQuery {
    pub prediction_id: String,
    pub chat_id: String,
}

/// Response of `POST /results`.
#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub prediction_id: String,
    pub delivered: bool,
    pub available: bool,
}
