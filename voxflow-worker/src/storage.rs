//! # Object Store Module
//!
//! Persistence for transcription artifacts on any S3-compatible service
//! (MinIO in the default deployment). The [`ObjectStore`] trait is the seam
//! the activities work against; [`S3ObjectStore`] is the production
//! implementation and [`MemoryObjectStore`] backs tests and local
//! development without a running MinIO.
//!
//! Stored inputs and results are addressed with `store://{key}` URLs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Scheme prefix for object-store paths.
pub const STORE_URL_SCHEME: &str = "store://";

/// `store://{key}` for a stored object.
pub fn store_url(key: &str) -> String {
    format!("{STORE_URL_SCHEME}{key}")
}

/// Extract the key from a `store://` URL, if it is one.
pub fn parse_store_url(url: &str) -> Option<&str> {
    url.strip_prefix(STORE_URL_SCHEME).filter(|key| !key.is_empty())
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("object store error: {0}")]
    Backend(String),
}

/// One listed object.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// The blob-store seam used by the storage activities.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable endpoint for health reporting.
    fn endpoint(&self) -> String;

    fn bucket(&self) -> &str;

    /// Create the bucket when missing; succeed when it already exists.
    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn list(&self, prefix: &str, max_results: usize) -> Result<Vec<ObjectInfo>, StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}

/// S3/MinIO-backed store.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    endpoint: String,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client against an S3-compatible endpoint with static
    /// credentials. Path-style addressing keeps MinIO happy.
    pub async fn connect(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        bucket: &str,
        region: &str,
    ) -> Self {
        let credentials =
            aws_credential_types::Credentials::from_keys(access_key, secret_key, None);
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .credentials_provider(credentials)
            .endpoint_url(endpoint)
            .load()
            .await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            endpoint: endpoint.to_string(),
            bucket: bucket.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, "created object-store bucket");
                Ok(())
            }
            Err(err) => {
                let service_err = err.as_service_error();
                let already_there = service_err
                    .map(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists())
                    .unwrap_or(false);
                if already_there {
                    Ok(())
                } else {
                    Err(StorageError::Backend(format!("create_bucket failed: {err}")))
                }
            }
        }
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes));
        for (k, v) in metadata {
            request = request.metadata(k, v);
        }
        request
            .send()
            .await
            .map_err(|err| StorageError::Backend(format!("put_object {key} failed: {err}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    StorageError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    StorageError::Backend(format!("get_object {key} failed: {err}"))
                }
            })?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Backend(format!("reading {key} failed: {err}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn list(&self, prefix: &str, max_results: usize) -> Result<Vec<ObjectInfo>, StorageError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(max_results.min(i32::MAX as usize) as i32)
            .send()
            .await
            .map_err(|err| StorageError::Backend(format!("list_objects failed: {err}")))?;

        Ok(output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectInfo {
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                })
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| StorageError::Backend(format!("head_bucket failed: {err}")))?;
        Ok(())
    }
}

/// In-memory store used by tests and local development.
#[derive(Default)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: tokio::sync::RwLock<HashMap<String, StoredObject>>,
}

struct StoredObject {
    bytes: Vec<u8>,
    metadata: HashMap<String, String>,
    stored_at: DateTime<Utc>,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Metadata recorded for `key`, for assertions in tests.
    pub async fn metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.metadata.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn endpoint(&self) -> String {
        "memory://localhost".to_string()
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                metadata,
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list(&self, prefix: &str, max_results: usize) -> Result<Vec<ObjectInfo>, StorageError> {
        let objects = self.objects.read().await;
        let mut listed: Vec<ObjectInfo> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.bytes.len() as u64,
                last_modified: Some(object.stored_at),
            })
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        listed.truncate(max_results);
        Ok(listed)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
