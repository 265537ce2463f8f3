use axum::{Json, extract::State};
use axum_extra::extract::WithRejection;

use sketch_types::api::{VerifyAdminKeyRequest, VerifyAdminKeyResponse};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

pub async fn verify_admin_key(
    State(hub): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<VerifyAdminKeyRequest>, ApiError>,
) -> ApiResult<Json<VerifyAdminKeyResponse>> {
    let valid = hub.admin_keys.verify(&req.key).await?;
    Ok(Json(VerifyAdminKeyResponse { valid }))
}
