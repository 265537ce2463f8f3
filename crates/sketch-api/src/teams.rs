use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use axum_extra::extract::WithRejection;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use sketch_db::models::TeamRow;
use sketch_db::to_millis;
use sketch_gateway::store::blocking;
use sketch_types::SketchError;
use sketch_types::api::CreateTeamRequest;
use sketch_types::models::Team;

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireAdmin;

const MAX_TEAM_NAME_LEN: usize = 64;

pub async fn list_teams(State(hub): State<AppState>) -> ApiResult<Json<Vec<Team>>> {
    let teams = blocking(&hub.db, |db| {
        db.list_teams()?.into_iter().map(TeamRow::into_team).collect()
    })
    .await?;
    Ok(Json(teams))
}

pub async fn create_team(
    State(hub): State<AppState>,
    _admin: RequireAdmin,
    WithRejection(Json(req), _): WithRejection<Json<CreateTeamRequest>, ApiError>,
) -> ApiResult<(StatusCode, Json<Team>)> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(SketchError::validation("team name is required").into());
    }
    if name.chars().count() > MAX_TEAM_NAME_LEN {
        return Err(SketchError::validation("team name is too long").into());
    }

    let team = Team {
        id: Uuid::new_v4(),
        name,
        description: req.description.trim().to_string(),
    };
    let (id, team_name, description) = (team.id.to_string(), team.name.clone(), team.description.clone());
    let created = blocking(&hub.db, move |db| {
        db.create_team(&id, &team_name, &description, to_millis(Utc::now()))
    })
    .await?;
    if !created {
        return Err(SketchError::conflict("a team with that name already exists").into());
    }

    info!("Team {} ({}) created", team.name, team.id);
    Ok((StatusCode::CREATED, Json(team)))
}

/// Participants of a deleted team keep their membership with no team.
pub async fn delete_team(
    State(hub): State<AppState>,
    _admin: RequireAdmin,
    WithRejection(Path(team_id), _): WithRejection<Path<Uuid>, ApiError>,
) -> ApiResult<StatusCode> {
    let id = team_id.to_string();
    let deleted = blocking(&hub.db, move |db| db.delete_team(&id)).await?;
    if !deleted {
        return Err(SketchError::not_found("team not found").into());
    }
    info!("Team {} deleted", team_id);
    Ok(StatusCode::NO_CONTENT)
}
