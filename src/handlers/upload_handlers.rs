//! `POST /upload`: authenticated, size-bounded multipart paper upload.
//!
//! The handler owns authentication, authorization and form parsing; the
//! storage/metadata sequence is delegated to `UploadGateway`.

use crate::{
    errors::AppError,
    models::paper::{Paper, parse_year},
    services::upload_gateway::{PaperUpload, UploadGateway, UploadLimits},
};
use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{Field, MultipartError, MultipartRejection},
    },
    http::{HeaderMap, StatusCode},
};
use bytes::BytesMut;
use chrono::{Datelike, Utc};
use serde::Serialize;
use tracing::{debug, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/pdf";

#[derive(Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub paper: Paper,
}

pub async fn upload_paper(
    State(gateway): State<UploadGateway>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let caller = gateway.identity.authenticate(&headers).await?;
    gateway.identity.require_admin(&caller).await?;

    let multipart = multipart.map_err(|rejection| {
        AppError::bad_request("Invalid multipart form data").with_details(rejection.body_text())
    })?;
    let upload = parse_upload_form(multipart, gateway.limits, Utc::now().year()).await?;

    let paper = gateway.store_paper(&caller, upload).await?;
    Ok(Json(UploadResponse {
        success: true,
        paper,
    }))
}

/// Read the form fields, enforcing the file budget on the `file` part and a
/// shared budget on every other part.
pub async fn parse_upload_form(
    mut multipart: Multipart,
    limits: UploadLimits,
    current_year: i32,
) -> Result<PaperUpload, AppError> {
    let mut file = None;
    let mut subject_id = None;
    let mut sub_category_id = None;
    let mut year = None;
    let mut topic = None;
    let mut field_bytes: u64 = 0;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let content_type = field
                .content_type()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string();
            let data = read_bounded(field, limits.max_file_size, 0, "File").await?;
            debug!(%file_name, size = data.len(), "received file part");
            file = Some((file_name, content_type, data));
            continue;
        }

        let data = read_bounded(field, limits.max_field_size, field_bytes, "Form data").await?;
        field_bytes += data.len() as u64;
        let value = String::from_utf8(data.to_vec())
            .map_err(|_| AppError::bad_request(format!("Field `{}` is not valid UTF-8", name)))?;
        let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());

        match name.as_str() {
            "subjectId" => subject_id = value,
            "subCategoryId" => sub_category_id = value,
            "year" => year = value,
            "topic" => topic = value,
            other => debug!(field = other, "ignoring unknown form field"),
        }
    }

    let (Some((file_name, content_type, data)), Some(subject_id), Some(year)) =
        (file, subject_id, year)
    else {
        return Err(AppError::bad_request("Missing required fields"));
    };
    let year = parse_year(&year, current_year)
        .map_err(|err| AppError::bad_request("Invalid year").with_details(err.to_string()))?;

    Ok(PaperUpload {
        file_name,
        content_type,
        data: data.freeze(),
        subject_id,
        sub_category_id,
        year,
        topic,
    })
}

/// Buffer a field while `already + len` stays within `limit`.
async fn read_bounded(
    mut field: Field<'_>,
    limit: u64,
    already: u64,
    what: &str,
) -> Result<BytesMut, AppError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if already + (buf.len() + chunk.len()) as u64 > limit {
            warn!(limit, "{} exceeded size limit", what);
            return Err(AppError::payload_too_large(format!(
                "{} exceeds the maximum size of {} bytes",
                what, limit
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::payload_too_large("Request body too large").with_details(err.body_text())
    } else {
        AppError::bad_request("Error parsing form data").with_details(err.body_text())
    }
}
