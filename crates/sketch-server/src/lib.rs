pub mod config;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use sketch_api::error::ApiError;
use sketch_api::middleware::SERVICE_KEY_HEADER;
use sketch_gateway::{Hub, handle_connection};

/// HTTP API plus the WebSocket endpoint, with CORS and request tracing.
pub fn app(hub: Hub) -> Router {
    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(hub.clone());

    sketch_api::router(hub)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct WsAuth {
    token: Option<String>,
}

/// Check the service key before upgrading. Browsers cannot set headers on a
/// WebSocket handshake, so `?token=` is accepted as well.
async fn ws_upgrade(
    State(hub): State<Hub>,
    Query(auth): Query<WsAuth>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let presented = headers
        .get(SERVICE_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(auth.token.as_deref());
    if let Err(e) = hub.credential.verify(presented) {
        warn!("Rejected WebSocket upgrade: bad service key");
        return ApiError::from(e).into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(socket, hub))
        .into_response()
}
