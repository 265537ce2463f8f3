use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use sketch_types::SketchError;

use crate::AppState;
use crate::error::ApiError;

pub const SERVICE_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Reject requests without the shared service credential.
pub async fn require_service_key(
    State(hub): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = req
        .headers()
        .get(SERVICE_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = hub.credential.verify(presented) {
        warn!("Rejected {} {}: bad service key", req.method(), req.uri().path());
        return Err(e.into());
    }
    Ok(next.run(req).await)
}

/// Extractor for handlers that also need the admin key.
pub struct RequireAdmin;

impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, hub: &AppState) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if hub.admin_keys.verify(presented).await? {
            Ok(Self)
        } else {
            warn!("Rejected {} {}: bad admin key", parts.method, parts.uri.path());
            Err(SketchError::forbidden("admin key required").into())
        }
    }
}
