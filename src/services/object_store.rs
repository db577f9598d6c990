//! Object writes with a fixed, bounded retry budget.

use crate::services::storage_backend::{BackendError, PutObject, StorageBackend, StoredObject};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

/// Fixed-delay retry budget for object writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to upload file to storage after {attempts} attempts: {last_error}")]
pub struct ObjectWriteError {
    pub attempts: u32,
    #[source]
    pub last_error: BackendError,
}

impl ObjectWriteError {
    /// The key was already taken before any write of this call landed.
    pub fn is_key_collision(&self) -> bool {
        self.attempts == 1 && matches!(self.last_error, BackendError::ObjectAlreadyExists { .. })
    }
}

#[derive(Clone)]
pub struct ObjectStore {
    backend: Arc<dyn StorageBackend>,
    bucket: String,
    retry: RetryPolicy,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn StorageBackend>, bucket: impl Into<String>) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Public URL of `key`, computed without touching the backend.
    pub fn public_url(&self, key: &str) -> String {
        self.backend.public_url(&self.bucket, key)
    }

    /// Write `data` under `key`, retrying on any failure.
    ///
    /// The first attempt refuses to overwrite; later attempts set the upsert
    /// flag so an earlier attempt that landed server-side does not block the
    /// retry. Returns on the first success.
    ///
    /// A first attempt that finds the key taken is not retried: that object
    /// belongs to another upload and must not be overwritten.
    pub async fn put_with_retry(
        &self,
        data: Bytes,
        key: &str,
        content_type: &str,
    ) -> Result<StoredObject, ObjectWriteError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let request = PutObject {
                bucket: &self.bucket,
                key,
                data: data.clone(),
                content_type,
                upsert: attempt > 1,
            };

            match self.backend.put_object(request).await {
                Ok(stored) => {
                    info!(attempt, %key, bytes = stored.size_bytes, "object write succeeded");
                    return Ok(stored);
                }
                Err(err @ BackendError::ObjectAlreadyExists { .. }) if attempt == 1 => {
                    warn!(%key, "object key already taken; not overwriting");
                    return Err(ObjectWriteError {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                Err(err) if attempt < max_attempts => {
                    warn!(attempt, %key, error = %err, "object write failed; retrying");
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) => {
                    warn!(attempt, %key, error = %err, "object write failed; giving up");
                    return Err(ObjectWriteError {
                        attempts: attempt,
                        last_error: err,
                    });
                }
            }
        }
    }
}
