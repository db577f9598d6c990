//! Idempotent provisioning of the papers bucket.
//!
//! `ensure_bucket` may be called by every in-flight upload at once. No lock is
//! taken: a lost creation race surfaces as "already exists" from the backend
//! and is treated as success.

use crate::{
    models::bucket::BucketConfig,
    services::storage_backend::{BackendError, StorageBackend},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to create storage bucket `{bucket}`: {source}")]
    Create {
        bucket: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to update bucket configuration for `{bucket}`: {source}")]
    Update {
        bucket: String,
        #[source]
        source: BackendError,
    },
}

/// What `ensure_bucket` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The bucket already existed; its configuration was re-applied.
    Updated,
    /// This call created the bucket.
    Created,
    /// Another caller created the bucket between our listing and our create.
    CreatedConcurrently,
}

#[derive(Clone)]
pub struct StorageProvisioner {
    backend: Arc<dyn StorageBackend>,
    config: BucketConfig,
}

impl StorageProvisioner {
    pub fn new(backend: Arc<dyn StorageBackend>, config: BucketConfig) -> Self {
        Self { backend, config }
    }

    pub fn bucket_name(&self) -> &str {
        &self.config.name
    }

    /// Make sure the bucket exists with the desired configuration.
    ///
    /// A failed listing is not fatal: the create call that follows is itself
    /// idempotent, so it doubles as the existence check.
    pub async fn ensure_bucket(&self) -> Result<ProvisionOutcome, ProvisionError> {
        let bucket = &self.config.name;

        let exists = match self.backend.list_buckets().await {
            Ok(buckets) => buckets.iter().any(|b| &b.name == bucket),
            Err(err) => {
                warn!(%bucket, error = %err, "listing buckets failed; attempting create");
                false
            }
        };
        debug!(%bucket, exists, "bucket lookup complete");

        if exists {
            return self.update().await;
        }

        match self.backend.create_bucket(&self.config).await {
            Ok(()) => {
                info!(%bucket, "created storage bucket");
                if let Err(err) = self.backend.attach_public_policy(bucket).await {
                    warn!(%bucket, error = %err, "could not attach public policy to bucket");
                }
                Ok(ProvisionOutcome::Created)
            }
            Err(BackendError::BucketAlreadyExists(_)) => {
                debug!(%bucket, "bucket created by a concurrent caller");
                Ok(ProvisionOutcome::CreatedConcurrently)
            }
            Err(source) => Err(ProvisionError::Create {
                bucket: bucket.clone(),
                source,
            }),
        }
    }

    async fn update(&self) -> Result<ProvisionOutcome, ProvisionError> {
        self.backend
            .update_bucket(&self.config)
            .await
            .map_err(|source| ProvisionError::Update {
                bucket: self.config.name.clone(),
                source,
            })?;
        debug!(bucket = %self.config.name, "bucket configuration re-applied");
        Ok(ProvisionOutcome::Updated)
    }
}
