use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One detected object; box center and size are normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub cx: f64,
    pub cy: f64,
    pub width: f64,
    pub height: f64,
}

/// Outcome of one fully processed job, keyed by `job_id`.
///
/// Serializes to the prediction summary shape:
/// `{"prediction_id", "original_img_path", "predicted_img_path", "labels", "time"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(rename = "prediction_id")]
    pub job_id: String,

    /// Blob key of the image the user submitted.
    #[serde(rename = "original_img_path")]
    pub original_image_path: String,

    /// Blob key of the annotated image.
    #[serde(rename = "predicted_img_path")]
    pub annotated_image_path: String,

    #[serde(rename = "labels")]
    pub detections: Vec<Detection>,

    #[serde(rename = "time", with = "epoch_seconds")]
    pub completed_at: DateTime<Utc>,
}

impl DetectionResult {
    /// Per-class counts, in order of first appearance.
    pub fn class_counts(&self) -> Vec<(&str, usize)> {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for detection in &self.detections {
            match counts
                .iter_mut()
                .find(|(name, _)| *name == detection.class_name)
            {
                Some((_, count)) => *count += 1,
                None => counts.push((detection.class_name.as_str(), 1)),
            }
        }
        counts
    }
}

/// Fractional unix seconds, the way the summary's `time` field is written.
mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
            .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {seconds}")))
    }
}
