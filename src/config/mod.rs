use std::str::FromStr;

use serde::Deserialize;

use crate::services::queue::QueueName;

/// Signed image URLs must outlive a day of queue backlog.
pub const MIN_SIGNED_URL_TTL_SECS: u64 = 60 * 60 * 24;

/// Longest expiry S3 presigning accepts (7 days).
pub const MAX_SIGNED_URL_TTL_SECS: u64 = 60 * 60 * 24 * 7;

/// Hard cap on images accepted in one submission.
pub const MAX_IMAGES_PER_REQUEST: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the task queues
    pub redis_url: String,

    /// Bucket holding uploaded images and model artifacts
    pub s3_bucket: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// S3 access key ID
    pub s3_access_key: String,

    /// S3 secret access key
    pub s3_secret_key: String,

    /// HMAC secret used to verify bearer tokens issued by the auth service
    pub jwt_secret: String,

    /// Local directory model artifacts are fetched into
    #[serde(default = "default_model_dir")]
    pub model_dir: String,

    /// Directory for uploads waiting to be ingested. Must be shared between
    /// the API server and ingest workers.
    #[serde(default = "default_upload_tmp_dir")]
    pub upload_tmp_dir: String,

    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,

    #[serde(default = "default_max_images_per_request")]
    pub max_images_per_request: usize,

    /// Number of decoded predictions kept from the primary model
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_ort_intra_threads")]
    pub ort_intra_threads: usize,

    /// Blocking receive timeout for worker queue polls
    #[serde(default = "default_queue_poll_timeout_secs")]
    pub queue_poll_timeout_secs: u64,

    /// Queues this worker process drains (comma separated: "ingest,analyze")
    #[serde(default = "default_worker_queues")]
    pub worker_queues: Vec<String>,

    /// Timeout for downloading a job's image from its signed URL
    #[serde(default = "default_image_fetch_timeout_secs")]
    pub image_fetch_timeout_secs: u64,

    /// Prometheus listener of worker processes
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_model_dir() -> String {
    "models".to_string()
}

fn default_upload_tmp_dir() -> String {
    "/tmp/pic-analyzer/uploads".to_string()
}

fn default_signed_url_ttl_secs() -> u64 {
    MIN_SIGNED_URL_TTL_SECS
}

fn default_max_images_per_request() -> usize {
    MAX_IMAGES_PER_REQUEST
}

fn default_top_k() -> usize {
    30
}

fn default_ort_intra_threads() -> usize {
    4
}

fn default_queue_poll_timeout_secs() -> u64 {
    5
}

fn default_worker_queues() -> Vec<String> {
    vec!["ingest".to_string(), "analyze".to_string()]
}

fn default_image_fetch_timeout_secs() -> u64 {
    30
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SIGNED_URL_TTL_SECS..=MAX_SIGNED_URL_TTL_SECS).contains(&self.signed_url_ttl_secs) {
            return Err(ConfigError::Invalid(format!(
                "SIGNED_URL_TTL_SECS must be between {} and {} (got {})",
                MIN_SIGNED_URL_TTL_SECS, MAX_SIGNED_URL_TTL_SECS, self.signed_url_ttl_secs
            )));
        }
        if self.max_images_per_request == 0 || self.max_images_per_request > MAX_IMAGES_PER_REQUEST {
            return Err(ConfigError::Invalid(format!(
                "MAX_IMAGES_PER_REQUEST must be between 1 and {}",
                MAX_IMAGES_PER_REQUEST
            )));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Invalid("TOP_K must be positive".to_string()));
        }
        self.queues()?;
        Ok(())
    }

    /// Parsed `worker_queues`, in configured order.
    pub fn queues(&self) -> Result<Vec<QueueName>, ConfigError> {
        if self.worker_queues.is_empty() {
            return Err(ConfigError::Invalid(
                "WORKER_QUEUES must name at least one queue".to_string(),
            ));
        }
        self.worker_queues
            .iter()
            .map(|name| {
                QueueName::from_str(name.trim()).map_err(|_| {
                    ConfigError::Invalid(format!("unknown queue {:?} in WORKER_QUEUES", name))
                })
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
