use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

use crate::services::artifacts::ArtifactSource;

/// Object storage holding uploaded images and model artifacts.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Time-limited GET URL for `key`.
    async fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// S3-compatible storage client (AWS, R2, MinIO).
pub struct S3Storage {
    bucket: Box<Bucket>,
}

impl S3Storage {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

/// The client is built without fail-on-err, so non-2xx responses come back
/// as data and are turned into errors here.
fn check_status(operation: &'static str, key: &str, status: u16) -> Result<(), StorageError> {
    if (200..300).contains(&status) {
        Ok(())
    } else if status == 404 {
        Err(StorageError::NotFound(key.to_string()))
    } else {
        Err(StorageError::Status {
            operation,
            key: key.to_string(),
            status,
        })
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        check_status("put", key, response.status_code())?;
        tracing::debug!(key = %key, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_status("get", key, response.status_code())?;
        Ok(response.bytes().to_vec())
    }

    async fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        let expiry = u32::try_from(ttl_secs)
            .map_err(|_| StorageError::Config(format!("signed URL TTL {} is too large", ttl_secs)))?;
        let url = self.bucket.presign_get(key, expiry, None).await?;
        Ok(url)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        check_status("delete", key, response.status_code())?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactSource for S3Storage {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.get(key).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("S3 {operation} of {key} returned status {status}")]
    Status {
        operation: &'static str,
        key: String,
        status: u16,
    },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
