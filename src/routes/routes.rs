//! Defines the HTTP surface of the paper vault.
//!
//! ## Structure
//! - **Upload pipeline** (no-store caching headers)
//!   - `POST /upload`        — authenticated admin paper upload (multipart)
//!   - `POST /storage/init`  — explicit bucket provisioning
//!   - `GET  /admin/check`   — admin status of the caller
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Public objects**
//!   - `GET /storage/v1/object/public/{bucket}/{*key}` — stream a stored paper
//!
//! Every error response, including ones produced by axum itself, is rendered
//! as the JSON error body.

use crate::{
    handlers::{
        admin_handlers::check_admin,
        health_handlers::{healthz, readyz},
        storage_handlers::{get_public_object, init_storage},
        upload_handlers::upload_paper,
    },
    routes::middleware::{json_errors, no_store, not_found},
    services::upload_gateway::UploadGateway,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::map_response,
    routing::{get, post},
};

/// Build the router. `body_limit` caps the size of an upload request body.
pub fn routes(body_limit: usize) -> Router<UploadGateway> {
    Router::new()
        .route(
            "/upload",
            post(upload_paper).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/storage/init", post(init_storage))
        .route("/admin/check", get(check_admin))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(map_response(no_store))
        .route(
            "/storage/v1/object/public/{bucket}/{*key}",
            get(get_public_object),
        )
        .fallback(not_found)
        .layer(map_response(json_errors))
}
