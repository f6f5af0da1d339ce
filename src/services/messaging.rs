use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Sends replies into a chat.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), MessagingError>;

    async fn send_photo(&self, chat_id: &str, photo: OutgoingPhoto) -> Result<(), MessagingError>;
}

/// An image to upload into a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPhoto {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
}

/// Raw photo bytes pulled from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPhoto {
    /// Final path component the platform reported for the file, if any.
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

/// Downloads attachments referenced by a platform file id.
#[async_trait]
pub trait PhotoSource: Send + Sync {
    async fn fetch(&self, file_id: &str) -> Result<FetchedPhoto, MessagingError>;
}

/// Telegram Bot API client.
pub struct TelegramClient {
    http: Client,
    api_url: String,
    token: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

impl TelegramClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_url, self.token, file_path)
    }
}

fn unwrap_response<T>(method: &str, response: ApiResponse<T>) -> Result<T, MessagingError> {
    match (response.ok, response.result) {
        (true, Some(result)) => Ok(result),
        _ => Err(MessagingError::Api {
            method: method.to_string(),
            description: response
                .description
                .unwrap_or_else(|| "no description".to_string()),
        }),
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), MessagingError> {
        let response: ApiResponse<serde_json::Value> = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&SendMessageRequest { chat_id, text })
            .send()
            .await
            .map_err(MessagingError::Http)?
            .json()
            .await
            .map_err(MessagingError::Http)?;

        unwrap_response("sendMessage", response)?;
        Ok(())
    }

    async fn send_photo(&self, chat_id: &str, photo: OutgoingPhoto) -> Result<(), MessagingError> {
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", Part::bytes(photo.bytes).file_name(photo.file_name));
        if let Some(caption) = photo.caption {
            form = form.text("caption", caption);
        }

        let response: ApiResponse<serde_json::Value> = self
            .http
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .map_err(MessagingError::Http)?
            .json()
            .await
            .map_err(MessagingError::Http)?;

        unwrap_response("sendPhoto", response)?;
        Ok(())
    }
}

#[async_trait]
impl PhotoSource for TelegramClient {
    async fn fetch(&self, file_id: &str) -> Result<FetchedPhoto, MessagingError> {
        let response: ApiResponse<TelegramFile> = self
            .http
            .get(self.method_url("getFile"))
            .query(&[("file_id", file_id)])
            .send()
            .await
            .map_err(MessagingError::Http)?
            .json()
            .await
            .map_err(MessagingError::Http)?;

        let file_path = unwrap_response("getFile", response)?
            .file_path
            .ok_or_else(|| MessagingError::Api {
                method: "getFile".to_string(),
                description: format!("file {file_id} has no downloadable path"),
            })?;

        let bytes = self
            .http
            .get(self.file_url(&file_path))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(MessagingError::Http)?
            .bytes()
            .await
            .map_err(MessagingError::Http)?;

        Ok(FetchedPhoto {
            file_name: file_path.rsplit('/').next().map(str::to_string),
            bytes: bytes.to_vec(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram {method} failed: {description}")]
    Api { method: String, description: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_bot_api_urls() {
        let client = TelegramClient::new("https://api.telegram.org/", "123:abc");
        assert_eq!(
            client.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
        assert_eq!(
            client.file_url("photos/file_1.jpg"),
            "https://api.telegram.org/file/bot123:abc/photos/file_1.jpg"
        );
    }

    #[test]
    fn api_error_carries_description() {
        let response: ApiResponse<TelegramFile> = serde_json::from_str(
            r#"{"ok": false, "error_code": 400, "description": "Bad Request: invalid file_id"}"#,
        )
        .unwrap();
        let err = unwrap_response("getFile", response).err().unwrap();
        assert_eq!(err.to_string(), "Telegram getFile failed: Bad Request: invalid file_id");
    }
}
