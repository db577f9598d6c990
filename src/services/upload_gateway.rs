//! src/services/upload_gateway.rs
//!
//! UploadGateway: orchestrates a verified paper upload once the caller is
//! authorized and the form is parsed:
//!
//! 1. validate the referenced subject / subcategory,
//! 2. provision the bucket (idempotent),
//! 3. write the object with bounded retry under a fresh key,
//! 4. compute the public URL,
//! 5. record the paper.
//!
//! The object write always precedes the record. Object storage and the
//! metadata store are not wrapped in one transaction; a record failure after
//! a successful write is reported with the object's URL attached.

use crate::{
    models::paper::{NewPaper, Paper, object_key},
    services::{
        identity_service::{Caller, IdentityService},
        metadata_service::{MetadataError, MetadataStore},
        object_store::{ObjectStore, ObjectWriteError},
        provisioner::{ProvisionError, StorageProvisioner},
    },
};
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

/// Fresh keys tried when a generated key is already taken.
const MAX_KEY_ATTEMPTS: u32 = 3;

/// Size ceilings applied while parsing an upload form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_file_size: u64,
    pub max_field_size: u64,
}

impl UploadLimits {
    /// Request body ceiling: both budgets plus room for multipart framing.
    pub fn body_limit(&self) -> usize {
        (self.max_file_size + self.max_field_size + 1024 * 1024) as usize
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            max_field_size: 10 * 1024 * 1024,
        }
    }
}

/// A parsed, well-formed upload form.
#[derive(Debug, Clone)]
pub struct PaperUpload {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
    pub subject_id: String,
    pub sub_category_id: Option<String>,
    pub year: i32,
    pub topic: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Subject not found")]
    SubjectNotFound(String),
    #[error("Subcategory not found")]
    SubCategoryNotFound(String),
    #[error("Failed to look up referenced records: {0}")]
    Lookup(#[source] MetadataError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    ObjectWrite(#[from] ObjectWriteError),
    #[error("Failed to create paper record in database: {source}")]
    MetadataPersist {
        file_url: String,
        #[source]
        source: MetadataError,
    },
}

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct UploadGateway {
    pub metadata: MetadataStore,
    pub identity: IdentityService,
    pub provisioner: StorageProvisioner,
    pub objects: ObjectStore,
    pub limits: UploadLimits,
}

impl UploadGateway {
    pub async fn store_paper(
        &self,
        caller: &Caller,
        upload: PaperUpload,
    ) -> Result<Paper, GatewayError> {
        self.metadata
            .find_subject(&upload.subject_id)
            .await
            .map_err(GatewayError::Lookup)?
            .ok_or_else(|| GatewayError::SubjectNotFound(upload.subject_id.clone()))?;

        if let Some(sub_category_id) = &upload.sub_category_id {
            self.metadata
                .find_sub_category(&upload.subject_id, sub_category_id)
                .await
                .map_err(GatewayError::Lookup)?
                .ok_or_else(|| GatewayError::SubCategoryNotFound(sub_category_id.clone()))?;
        }

        let outcome = self.provisioner.ensure_bucket().await?;
        info!(bucket = %self.provisioner.bucket_name(), ?outcome, "bucket ready");

        let mut issued_at = Utc::now();
        let mut key_attempt = 1;
        let stored = loop {
            let key = object_key(&upload.file_name, issued_at);
            info!(
                %key,
                size = upload.data.len(),
                content_type = %upload.content_type,
                original_name = %upload.file_name,
                "uploading file to storage"
            );
            match self
                .objects
                .put_with_retry(upload.data.clone(), &key, &upload.content_type)
                .await
            {
                Ok(stored) => break stored,
                Err(err) if err.is_key_collision() && key_attempt < MAX_KEY_ATTEMPTS => {
                    warn!(%key, "object key taken by another upload; issuing a new key");
                    key_attempt += 1;
                    // Keys embed the millisecond, so the next one must be later.
                    issued_at = Utc::now().max(issued_at + TimeDelta::milliseconds(1));
                }
                Err(err) => return Err(err.into()),
            }
        };

        let file_url = self.objects.public_url(&stored.key);

        let paper = self
            .metadata
            .create_paper(NewPaper {
                year: upload.year,
                topic: upload.topic,
                file_url: file_url.clone(),
                subject_id: upload.subject_id,
                sub_category_id: upload.sub_category_id,
                user_id: caller.user_id,
            })
            .await
            .map_err(|source| {
                error!(%file_url, error = %source, "object stored but paper record failed");
                GatewayError::MetadataPersist {
                    file_url: file_url.clone(),
                    source,
                }
            })?;

        info!(paper_id = %paper.id, %file_url, "paper recorded");
        Ok(paper)
    }
}
