use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::retry::RetryPolicy;
use crate::worker::WorkerSettings;

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8443"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// Prometheus listener of the worker process
    #[serde(default = "default_worker_metrics_addr")]
    #[garde(length(min = 1))]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string for the result store
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Redis connection string for the job queue
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Key prefix of the job queue in Redis
    #[serde(default = "default_queue_name")]
    #[garde(length(min = 1))]
    pub queue_name: String,

    /// Image bucket name
    #[garde(length(min = 1))]
    pub s3_bucket: String,

    /// Custom S3-compatible endpoint (R2, MinIO). Plain AWS when unset.
    #[garde(skip)]
    pub s3_endpoint: Option<String>,

    #[serde(default = "default_s3_region")]
    #[garde(length(min = 1))]
    pub s3_region: String,

    #[garde(length(min = 1))]
    pub s3_access_key: String,

    #[garde(length(min = 1))]
    pub s3_secret_key: String,

    /// Telegram bot token. Required by the server, unused by the worker.
    #[garde(length(min = 1))]
    pub telegram_token: Option<String>,

    #[serde(default = "default_telegram_api_url")]
    #[garde(length(min = 1))]
    pub telegram_api_url: String,

    /// Root of local scratch storage shared by concurrent requests and jobs
    #[serde(default = "default_scratch_dir")]
    #[garde(skip)]
    pub scratch_dir: PathBuf,

    /// Detector command line, e.g. "python yolov5/detect.py"
    #[serde(default = "default_detector_command")]
    #[garde(length(min = 1))]
    pub detector_command: String,

    #[serde(default = "default_detector_weights")]
    #[garde(length(min = 1))]
    pub detector_weights: String,

    /// Dataset description handed to the detector
    #[serde(default = "default_detector_data")]
    #[garde(skip)]
    pub detector_data: PathBuf,

    /// Class names, one per line or a JSON array
    #[serde(default = "default_taxonomy_path")]
    #[garde(skip)]
    pub taxonomy_path: PathBuf,

    /// Lease length of a received job; must exceed worst-case detection time
    #[serde(default = "default_visibility_timeout_secs")]
    #[garde(range(min = 1), custom(longer_than_receive_wait(&self.receive_wait_secs)))]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_receive_wait_secs")]
    #[garde(range(min = 1, max = 20))]
    pub receive_wait_secs: u64,

    #[serde(default = "default_max_receive_count")]
    #[garde(range(min = 1))]
    pub max_receive_count: u32,

    #[serde(default = "default_retry_max_attempts")]
    #[garde(range(min = 1, max = 10))]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    #[garde(range(max = 60_000))]
    pub retry_base_delay_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_queue_name() -> String {
    "detect:jobs".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("detect-pipeline")
}

fn default_detector_command() -> String {
    "python detect.py".to_string()
}

fn default_detector_weights() -> String {
    "yolov5s.pt".to_string()
}

fn default_detector_data() -> PathBuf {
    PathBuf::from("data/coco128.yaml")
}

fn default_taxonomy_path() -> PathBuf {
    PathBuf::from("data/coco128.names")
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_receive_wait_secs() -> u64 {
    5
}

fn default_max_receive_count() -> u32 {
    5
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn longer_than_receive_wait(receive_wait_secs: &u64) -> impl FnOnce(&u64, &()) -> garde::Result + '_ {
    move |visibility_timeout_secs, _| {
        if visibility_timeout_secs <= receive_wait_secs {
            return Err(garde::Error::new(
                "visibility timeout must be longer than the receive wait",
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_secs(10),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            scratch_dir: self.scratch_dir.clone(),
            receive_wait: Duration::from_secs(self.receive_wait_secs),
            max_receive_count: self.max_receive_count,
            retry: self.retry_policy(),
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
