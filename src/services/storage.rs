use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Binary object storage addressed by key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Upload a local file, deriving the content type from `key`.
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let data = tokio::fs::read(path).await.map_err(|source| StorageError::Local {
            path: path.display().to_string(),
            source,
        })?;
        self.put(key, &data, content_type_for(key)).await
    }
}

/// MIME type for an image key, falling back to `application/octet-stream`.
pub fn content_type_for(key: &str) -> &'static str {
    image::ImageFormat::from_path(key)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

/// S3-compatible object storage client.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
}

impl S3BlobStore {
    /// `endpoint` selects a custom S3-compatible service (R2, MinIO); without
    /// it `region` names an AWS region.
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region
                .parse()
                .map_err(|e| StorageError::Config(format!("invalid region {region}: {e}")))?,
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let mut bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        if endpoint.is_some() {
            bucket.set_path_style();
        }

        Ok(Self { bucket })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(key, response.status_code())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        check_status(key, response.status_code())?;
        Ok(response.to_vec())
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        code => Err(StorageError::Status {
            key: key.to_string(),
            code,
        }),
    }
}

/// Process-local blob store for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.read().get(key).map(|(_, content_type)| content_type.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, (Vec<u8>, String)>> {
        self.objects.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.read()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object {key} returned HTTP {code}")]
    Status { key: String, code: u16 },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Local file {path} unreadable: {source}")]
    Local {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type_for("images/cat.jpg"), "image/jpeg");
        assert_eq!(content_type_for("predictions/shot.png"), "image/png");
        assert_eq!(content_type_for("images/raw.bin"), "application/octet-stream");
    }

    #[tokio::test]
    async fn put_file_uploads_local_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.jpg");
        tokio::fs::write(&path, b"jpeg bytes").await.unwrap();

        let store = InMemoryBlobStore::new();
        store.put_file("images/cat.jpg", &path).await.unwrap();

        assert_eq!(store.get("images/cat.jpg").await.unwrap(), b"jpeg bytes");
        assert_eq!(store.content_type("images/cat.jpg").as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.get("images/none.jpg").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn status_codes_map_to_errors() {
        assert!(check_status("k", 200).is_ok());
        assert!(matches!(check_status("k", 404), Err(StorageError::NotFound(_))));
        assert!(matches!(
            check_status("k", 503),
            Err(StorageError::Status { code: 503, .. })
        ));
    }
}
