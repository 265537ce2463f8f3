use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use axum_extra::extract::WithRejection;
use uuid::Uuid;

use sketch_types::api::{
    AddCoOwnerRequest, CoOwnersResponse, CreateRoomRequest, CreateRoomResponse,
    RecoverSessionRequest, RecoverSessionResponse, RemoveCoOwnerQuery, RoomDetails, RoomSummary,
    UpdateRoomStatusRequest,
};
use sketch_types::models::Member;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

type RoomPath = WithRejection<Path<Uuid>, ApiError>;

/// The only response that carries the room's secret key.
pub async fn create_room(
    State(hub): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<CreateRoomRequest>, ApiError>,
) -> ApiResult<(StatusCode, Json<CreateRoomResponse>)> {
    let room = hub.rooms.create_room(req).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn list_rooms(State(hub): State<AppState>) -> ApiResult<Json<Vec<RoomSummary>>> {
    Ok(Json(hub.rooms.list_rooms().await?))
}

pub async fn get_room(
    State(hub): State<AppState>,
    WithRejection(Path(room_id), _): RoomPath,
) -> ApiResult<Json<RoomDetails>> {
    Ok(Json(hub.rooms.get_room(room_id).await?))
}

/// Every participant with a derived status.
pub async fn room_users(
    State(hub): State<AppState>,
    WithRejection(Path(room_id), _): RoomPath,
) -> ApiResult<Json<Vec<Member>>> {
    Ok(Json(hub.rooms.members(room_id).await?))
}

pub async fn update_status(
    State(hub): State<AppState>,
    WithRejection(Path(room_id), _): RoomPath,
    WithRejection(Json(req), _): WithRejection<Json<UpdateRoomStatusRequest>, ApiError>,
) -> ApiResult<Json<RoomDetails>> {
    let room = hub
        .rooms
        .set_room_status(room_id, req.user_id, req.active)
        .await?;
    Ok(Json(room))
}

pub async fn recover_session(
    State(hub): State<AppState>,
    WithRejection(Path(room_id), _): RoomPath,
    WithRejection(Json(req), _): WithRejection<Json<RecoverSessionRequest>, ApiError>,
) -> ApiResult<Json<RecoverSessionResponse>> {
    let session = hub.recovery.recover(room_id, &req.recovery_key).await?;
    Ok(Json(RecoverSessionResponse {
        user_id: session.user_id,
        username: session.username,
        is_owner: session.is_owner,
        is_co_owner: session.is_co_owner,
    }))
}

pub async fn add_co_owner(
    State(hub): State<AppState>,
    WithRejection(Path(room_id), _): RoomPath,
    WithRejection(Json(req), _): WithRejection<Json<AddCoOwnerRequest>, ApiError>,
) -> ApiResult<Json<CoOwnersResponse>> {
    let co_owners = hub
        .rooms
        .add_co_owner(room_id, req.requester_id, req.user_id)
        .await?;
    Ok(Json(CoOwnersResponse { co_owners }))
}

pub async fn remove_co_owner(
    State(hub): State<AppState>,
    WithRejection(Path((room_id, user_id)), _): WithRejection<Path<(Uuid, Uuid)>, ApiError>,
    WithRejection(Query(query), _): WithRejection<Query<RemoveCoOwnerQuery>, ApiError>,
) -> ApiResult<Json<CoOwnersResponse>> {
    let co_owners = hub
        .rooms
        .remove_co_owner(room_id, query.requester_id, user_id)
        .await?;
    Ok(Json(CoOwnersResponse { co_owners }))
}
