use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};

use super::{json_body, AppState};
use crate::auth::AuthUser;
use crate::dataset::DiscoveryItem;
use crate::error::{ApiError, ApiResult};
use crate::model::WorkflowExecution;

/// Trigger a discovery run for the given input.
pub async fn start(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<DiscoveryItem>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<WorkflowExecution>)> {
    let input = json_body(body)?;
    let execution = state.workflows.start(&user.username, &input).await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowExecution>> {
    state
        .workflows
        .status(&id)
        .await?
        .filter(|e| e.created_by == user.username)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No workflow execution found with id {id}")))
}
