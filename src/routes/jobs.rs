use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::{NotifyResponse, ResultQuery, SubmitResponse};
use crate::models::detection::DetectionResult;
use crate::services::ingest::IngestError;
use crate::services::messaging::FetchedPhoto;
use crate::services::notifier::Notification;

fn ingest_status(error: &IngestError) -> StatusCode {
    match error {
        IngestError::EmptyAttachment | IngestError::MissingChatId => StatusCode::BAD_REQUEST,
        IngestError::Fetch(_) | IngestError::Upload(_) | IngestError::Publish(_) => {
            StatusCode::BAD_GATEWAY
        }
        IngestError::Scratch(_) | IngestError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /api/v1/jobs: Upload an image for detection.
///
/// Fields: `image` (file), `chat_id`, optional `caption`.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let mut photo: Option<FetchedPhoto> = None;
    let mut chat_id: Option<String> = None;
    let mut caption: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                let file_name = field.file_name().map(str::to_string);
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;

                // Validate image format using the `image` crate
                image::guess_format(&data).map_err(|_| StatusCode::UNSUPPORTED_MEDIA_TYPE)?;

                photo = Some(FetchedPhoto {
                    file_name,
                    bytes: data.to_vec(),
                });
            }
            Some("chat_id") => {
                chat_id = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            Some("caption") => {
                let text = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                caption = Some(text).filter(|c| !c.trim().is_empty());
            }
            _ => {}
        }
    }

    let photo = photo.ok_or(StatusCode::BAD_REQUEST)?;
    let chat_id = chat_id.ok_or(StatusCode::BAD_REQUEST)?;

    let job = state
        .gateway
        .ingest_fetched(&chat_id, caption.as_deref(), photo)
        .await
        .map_err(|e| {
            tracing::error!(chat_id = %chat_id, error = %e, "Failed to submit detection job");
            ingest_status(&e)
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.job_id,
            image_key: job.image_key,
            status: "queued".to_string(),
            message: "Image submitted for detection".to_string(),
        }),
    ))
}

/// GET /api/v1/results/{job_id}: Result summary of a finished job.
pub async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<DetectionResult>, StatusCode> {
    match state.results.get(&job_id).await {
        Ok(Some(result)) => Ok(Json(result)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Result lookup failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// POST /results?predictionId=&chatId=: Send a finished prediction to a chat.
pub async fn notify_result(
    State(state): State<AppState>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<NotifyResponse>, StatusCode> {
    let notification = state
        .notifier
        .notify(&query.prediction_id, &query.chat_id)
        .await
        .map_err(|e| {
            tracing::error!(
                prediction_id = %query.prediction_id,
                chat_id = %query.chat_id,
                error = %e,
                "Failed to send prediction results"
            );
            StatusCode::BAD_GATEWAY
        })?;

    Ok(Json(NotifyResponse {
        prediction_id: query.prediction_id,
        delivered: true,
        available: matches!(notification, Notification::Delivered { .. }),
    }))
}
