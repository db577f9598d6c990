//! Response middleware shared by all routes.

use crate::errors::AppError;
use axum::{
    body::{Body, to_bytes},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use tracing::debug;

/// Largest error body read back when rewriting a non-JSON error.
const MAX_ERROR_BODY: usize = 16 * 1024;

/// Mark API responses as uncacheable.
pub async fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

/// Rewrite plain-text error responses (extractor rejections, 405s, body
/// limit hits) into the JSON error body.
pub async fn json_errors(response: Response) -> Response {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) || is_json(&response) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let details = to_bytes(body, MAX_ERROR_BODY)
        .await
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
        .filter(|text| !text.is_empty());
    debug!(%status, ?details, "rewriting non-JSON error response");

    let message = status.canonical_reason().unwrap_or("Request failed");
    let mut error = AppError::new(status, message);
    if let Some(details) = details {
        error = error.with_details(details);
    }

    let mut rewritten = error.into_response();
    for (name, value) in parts.headers.iter() {
        if name != header::CONTENT_TYPE && name != header::CONTENT_LENGTH {
            rewritten.headers_mut().insert(name.clone(), value.clone());
        }
    }
    rewritten
}

pub async fn not_found() -> AppError {
    AppError::not_found("Not found")
}

fn is_json(response: &Response<Body>) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}
