use crate::services::{
    identity_service::IdentityError, provisioner::ProvisionError, upload_gateway::GatewayError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::{error::Error as _, fmt};
use tracing::error;

/// A handler error rendered as a JSON body.
///
/// `file_url` is only set when an object was stored but could not be
/// recorded, so the caller can reconcile it.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<String>,
    pub file_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error: &'a str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_url: Option<&'a str>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            details: None,
            file_url: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_file_url(mut self, file_url: impl Into<String>) -> Self {
        self.file_url = Some(file_url.into());
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            status: self.status.as_u16(),
            details: self.details.as_deref(),
            file_url: self.file_url.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::MissingCredentials | IdentityError::InvalidSession => {
                AppError::new(StatusCode::UNAUTHORIZED, "Unauthorized")
            }
            IdentityError::NotAdmin => {
                AppError::new(StatusCode::FORBIDDEN, "Forbidden: Admin access required")
            }
            IdentityError::Store(source) => {
                error!(error = %source, "identity lookup failed");
                AppError::internal("Internal server error").with_details(source.to_string())
            }
        }
    }
}

impl From<ProvisionError> for AppError {
    fn from(err: ProvisionError) -> Self {
        let message = match &err {
            ProvisionError::Create { .. } => "Failed to create storage bucket",
            ProvisionError::Update { .. } => "Failed to update bucket configuration",
        };
        let details = err
            .source()
            .map(ToString::to_string)
            .unwrap_or_else(|| err.to_string());
        AppError::internal(message).with_details(details)
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::SubjectNotFound(_) => AppError::not_found("Subject not found"),
            GatewayError::SubCategoryNotFound(_) => AppError::not_found("Subcategory not found"),
            GatewayError::Lookup(source) => {
                AppError::internal("Internal server error").with_details(source.to_string())
            }
            GatewayError::Provision(source) => source.into(),
            GatewayError::ObjectWrite(source) => {
                AppError::internal("Failed to upload file to storage")
                    .with_details(source.last_error.to_string())
            }
            GatewayError::MetadataPersist { file_url, source } => {
                AppError::internal("Failed to create paper record in database")
                    .with_details(source.to_string())
                    .with_file_url(file_url)
            }
        }
    }
}
