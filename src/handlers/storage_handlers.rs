//! Storage endpoints: explicit bucket provisioning and public object reads.

use crate::{
    errors::AppError,
    services::{
        provisioner::ProvisionOutcome, storage_backend::BackendError,
        upload_gateway::UploadGateway,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitStorageResponse {
    pub success: bool,
    pub message: &'static str,
    pub bucket_name: String,
}

/// `POST /storage/init`: admin-only bucket provisioning.
///
/// 201 when this call created the bucket, 200 when its configuration was
/// re-applied.
pub async fn init_storage(
    State(gateway): State<UploadGateway>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let caller = gateway.identity.authenticate(&headers).await?;
    gateway.identity.require_admin(&caller).await?;

    let outcome = gateway.provisioner.ensure_bucket().await?;
    let (status, message) = match outcome {
        ProvisionOutcome::Created => (StatusCode::CREATED, "Bucket created successfully"),
        ProvisionOutcome::Updated | ProvisionOutcome::CreatedConcurrently => (
            StatusCode::OK,
            "Bucket configuration updated successfully",
        ),
    };

    Ok((
        status,
        Json(InitStorageResponse {
            success: true,
            message,
            bucket_name: gateway.provisioner.bucket_name().to_string(),
        }),
    ))
}

/// `GET /storage/v1/object/public/{bucket}/{*key}`: stream a stored paper.
///
/// Only the papers bucket is exposed.
pub async fn get_public_object(
    State(gateway): State<UploadGateway>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    if bucket != gateway.objects.bucket() {
        return Err(AppError::not_found("Object not found"));
    }

    let object = gateway
        .objects
        .backend()
        .get_object(&bucket, &key)
        .await
        .map_err(|err| match err {
            BackendError::ObjectNotFound { .. }
            | BackendError::BucketNotFound(_)
            | BackendError::InvalidObjectKey
            | BackendError::InvalidBucketName { .. } => AppError::not_found("Object not found"),
            other => AppError::internal("Failed to read object").with_details(other.to_string()),
        })?;

    let mut response = Response::new(Body::from_stream(object.stream));
    let headers = response.headers_mut();
    let content_type = object
        .content_type
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(size) = object.size_bytes {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=3600"));
    Ok(response)
}
