//! `GET /admin/check`: admin status of the calling identity.

use crate::{
    errors::AppError,
    services::{identity_service::AdminStatus, upload_gateway::UploadGateway},
};
use axum::{Json, extract::State, http::HeaderMap};

pub async fn check_admin(
    State(gateway): State<UploadGateway>,
    headers: HeaderMap,
) -> Result<Json<AdminStatus>, AppError> {
    let caller = gateway.identity.authenticate(&headers).await?;
    Ok(Json(gateway.identity.admin_status(&caller).await))
}
