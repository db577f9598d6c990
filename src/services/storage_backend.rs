//! Abstract object storage backend.
//!
//! Every backend implements [`StorageBackend`]. A backend performs exactly one
//! remote operation per call and never retries on its own; retry policy lives
//! in [`crate::services::object_store::ObjectStore`] and provisioning policy in
//! [`crate::services::provisioner::StorageProvisioner`].

use crate::models::bucket::{Bucket, BucketConfig};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    ObjectAlreadyExists { bucket: String, key: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object of {size} bytes exceeds the bucket limit of {limit} bytes")]
    ObjectTooLarge { size: u64, limit: u64 },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("storage backend responded with {status}: {message}")]
    Status { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A single all-or-nothing object write.
#[derive(Debug, Clone)]
pub struct PutObject<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub data: Bytes,
    pub content_type: &'a str,

    /// Overwrite an existing object with the same key instead of failing.
    pub upsert: bool,
}

/// Result of a successful object write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub etag: Option<String>,
}

/// Object payload opened for streaming out.
pub struct ObjectBody {
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

/// Async object storage contract.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Short name used in logs and readiness output.
    fn name(&self) -> &'static str;

    async fn list_buckets(&self) -> BackendResult<Vec<Bucket>>;

    /// Create a bucket. Fails with [`BackendError::BucketAlreadyExists`] when
    /// the name is taken, including when another caller won a race.
    async fn create_bucket(&self, config: &BucketConfig) -> BackendResult<()>;

    /// Re-apply configuration to an existing bucket. Idempotent.
    async fn update_bucket(&self, config: &BucketConfig) -> BackendResult<()>;

    /// Allow anonymous reads of every object in `bucket`.
    async fn attach_public_policy(&self, bucket: &str) -> BackendResult<()>;

    async fn put_object(&self, request: PutObject<'_>) -> BackendResult<StoredObject>;

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectBody>;

    /// Deterministic public URL of `key` inside `bucket`.
    fn public_url(&self, bucket: &str, key: &str) -> String;
}

/// Heuristic used by HTTP backends: does an error payload describe a
/// resource that already exists?
pub(crate) fn looks_like_conflict(status: u16, message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    status == 409
        || lowered.contains("already exists")
        || lowered.contains("duplicate")
        || lowered.contains("\"409\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_detection_matches_known_shapes() {
        assert!(looks_like_conflict(409, ""));
        assert!(looks_like_conflict(
            400,
            r#"{"statusCode":"409","error":"Duplicate","message":"The resource already exists"}"#
        ));
        assert!(!looks_like_conflict(500, "internal error"));
        assert!(!looks_like_conflict(404, "Bucket not found"));
    }
}
