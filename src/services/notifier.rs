use std::fmt::Write;
use std::sync::Arc;

use crate::models::detection::DetectionResult;
use crate::services::messaging::{Messenger, MessagingError};
use crate::services::results::ResultStore;

/// Reply sent when a prediction id has no stored result.
pub const NOT_AVAILABLE_TEXT: &str =
    "Prediction results are not available yet, or the prediction id is invalid.";

pub const NO_OBJECTS_TEXT: &str = "No objects detected.";

/// What the notifier ended up telling the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Delivered { detections: usize },
    NotAvailable,
}

/// Human-readable summary of a result: per-class counts in first-seen order.
pub fn format_summary(result: &DetectionResult) -> String {
    if result.detections.is_empty() {
        return NO_OBJECTS_TEXT.to_string();
    }

    let mut text = String::from("Detected objects:");
    for (class_name, count) in result.class_counts() {
        let _ = write!(text, "\n{class_name}: {count}");
    }
    text
}

/// Looks up a finished prediction and reports it to a chat.
pub struct ResultNotifier {
    results: Arc<dyn ResultStore>,
    messenger: Arc<dyn Messenger>,
}

impl ResultNotifier {
    pub fn new(results: Arc<dyn ResultStore>, messenger: Arc<dyn Messenger>) -> Self {
        Self { results, messenger }
    }

    /// A failing result store is reported to the user as "not available";
    /// only a failed send is an error.
    pub async fn notify(&self, job_id: &str, chat_id: &str) -> Result<Notification, MessagingError> {
        let result = match self.results.get(job_id).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Result lookup failed, reporting as unavailable");
                None
            }
        };

        let (text, notification) = match &result {
            Some(result) => (
                format_summary(result),
                Notification::Delivered {
                    detections: result.detections.len(),
                },
            ),
            None => (NOT_AVAILABLE_TEXT.to_string(), Notification::NotAvailable),
        };

        self.messenger.send_text(chat_id, &text).await?;
        tracing::info!(job_id, chat_id, ?notification, "Sent prediction results");
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detection::Detection;
    use chrono::Utc;

    fn result(classes: &[&str]) -> DetectionResult {
        DetectionResult {
            job_id: "job-1".into(),
            original_image_path: "images/cat.jpg".into(),
            annotated_image_path: "predictions/cat.jpg".into(),
            detections: classes
                .iter()
                .map(|class_name| Detection {
                    class_name: class_name.to_string(),
                    cx: 0.5,
                    cy: 0.5,
                    width: 0.1,
                    height: 0.1,
                })
                .collect(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn summary_counts_classes() {
        assert_eq!(
            format_summary(&result(&["person", "dog", "person"])),
            "Detected objects:\nperson: 2\ndog: 1"
        );
    }

    #[test]
    fn empty_result_says_nothing_found() {
        assert_eq!(format_summary(&result(&[])), NO_OBJECTS_TEXT);
    }
}
