use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors reported by an object store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store request failed: {0}")]
    Backend(String),
}

/// Object-store key of a project's template archive
pub fn archive_key(project_id: i64) -> String {
    project_id.to_string()
}

/// Object-store key of a project's uploaded context blob
pub fn context_key(project_id: i64) -> String {
    format!("{}_context.json", project_id)
}

/// Binary blob storage addressed by key inside one fixed bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a whole object
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Write a whole object, replacing any previous content
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;
}

/// S3-compatible object store (AWS S3 or MinIO)
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new S3 client bound to the configured bucket
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(format!("get {}: {}", key, e))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("read {}: {}", key, e)))?
            .into_bytes();

        debug!(key = %key, size_bytes = data.len(), "Object downloaded");

        Ok(data)
    }

    #[instrument(skip(self, data), fields(bucket = %self.bucket, size_bytes = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let length = data.len() as i64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(length)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("put {}: {}", key, e)))?;

        debug!(key = %key, "Object uploaded");
        Ok(())
    }
}

/// In-memory object store for tests and local runs
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?;

        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?;

        objects.insert(key.to_string(), data);
        Ok(())
    }
}
