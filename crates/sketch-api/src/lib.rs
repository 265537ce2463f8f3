//! HTTP endpoints for rooms, session recovery, co-owners, teams and health.

pub mod admin;
pub mod error;
pub mod health;
pub mod middleware;
pub mod rooms;
pub mod teams;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

pub type AppState = sketch_gateway::Hub;

/// All `/api` routes. Everything except health requires the service key.
pub fn router(hub: AppState) -> Router {
    let protected = Router::new()
        .route("/api/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route("/api/rooms/{room_id}", get(rooms::get_room))
        .route("/api/rooms/{room_id}/users", get(rooms::room_users))
        .route("/api/rooms/{room_id}/status", put(rooms::update_status))
        .route("/api/rooms/{room_id}/recover", post(rooms::recover_session))
        .route("/api/rooms/{room_id}/co-owners", post(rooms::add_co_owner))
        .route(
            "/api/rooms/{room_id}/co-owners/{user_id}",
            delete(rooms::remove_co_owner),
        )
        .route("/api/teams", get(teams::list_teams).post(teams::create_team))
        .route("/api/teams/{team_id}", delete(teams::delete_team))
        .route("/api/admin/verify", post(admin::verify_admin_key))
        .route_layer(axum::middleware::from_fn_with_state(
            hub.clone(),
            middleware::require_service_key,
        ))
        .with_state(hub.clone());

    let public = Router::new()
        .route("/api/health", get(health::health))
        .with_state(hub);

    Router::new().merge(public).merge(protected)
}
