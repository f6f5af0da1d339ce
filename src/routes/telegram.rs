use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::services::ingest::Attachment;

pub const GREETING_TEXT: &str =
    "I perform object detection on images you send me. To interact with me, simply attach an image.";

pub const FAILURE_TEXT: &str = "Sorry, your image could not be submitted. Please try again.";

/// The subset of a Telegram `Update` the bot reacts to.
#[derive(Debug, Deserialize)]
pub struct Update {
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
    pub document: Option<Document>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub thumbnail: Option<PhotoSize>,
}

impl Message {
    /// The image carried by this message: the largest photo size, an image
    /// document, or a document's thumbnail, in that order.
    pub fn attachment(&self) -> Option<Attachment> {
        let file_id = self
            .photo
            .last()
            .map(|p| p.file_id.as_str())
            .or_else(|| {
                self.document.as_ref().and_then(|doc| {
                    let is_image = doc
                        .mime_type
                        .as_deref()
                        .is_some_and(|mime| mime.starts_with("image/"));
                    if is_image {
                        Some(doc.file_id.as_str())
                    } else {
                        doc.thumbnail.as_ref().map(|t| t.file_id.as_str())
                    }
                })
            })?;

        Some(Attachment {
            file_id: file_id.to_string(),
            chat_id: self.chat.id.to_string(),
            caption: self.caption.clone().filter(|c| !c.trim().is_empty()),
        })
    }
}

/// POST /telegram/{token}: Telegram webhook.
///
/// The token is checked before the body is looked at, so an unknown token
/// is a 404 whatever it sends. Once it matches the answer is always 200;
/// Telegram would otherwise redeliver the update. Failures are reported to
/// the chat instead.
pub async fn webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> Result<&'static str, StatusCode> {
    if state.telegram_token.as_deref() != Some(token.as_str()) {
        return Err(StatusCode::NOT_FOUND);
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring unparseable webhook update");
            return Ok("Ok");
        }
    };
    let Some(message) = update.message else {
        return Ok("Ok");
    };
    let chat_id = message.chat.id.to_string();
    tracing::info!(chat_id = %chat_id, "Incoming message");

    let reply = match message.attachment() {
        Some(attachment) => match state.gateway.ingest(&attachment).await {
            Ok(_) => None,
            Err(e) => {
                tracing::error!(chat_id = %chat_id, error = %e, "Failed to ingest photo");
                Some(FAILURE_TEXT)
            }
        },
        None => Some(GREETING_TEXT),
    };

    if let Some(text) = reply {
        if let Err(e) = state.messenger.send_text(&chat_id, text).await {
            tracing::warn!(chat_id = %chat_id, error = %e, "Failed to reply in chat");
        }
    }

    Ok("Ok")
}
