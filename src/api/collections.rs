use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use super::{json_body, AppState};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};

/// Publish a STAC Collection straight into the catalog.
pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let collection = json_body(body)?;
    let result = state.validator.validate_collection(&collection);
    if let Some(detail) = result.summary() {
        return Err(ApiError::Unprocessable {
            detail,
            reasons: result.reasons,
            body: None,
        });
    }
    state.catalog.upsert_collection(&collection).await?;
    info!(
        collection_id = collection["id"].as_str().unwrap_or_default(),
        user = %user.username,
        "collection published"
    );
    Ok((StatusCode::CREATED, Json(collection)))
}

pub async fn show(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .catalog
        .get_collection(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Collection {id} not found")))
}

pub async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.catalog.delete_collection(&id).await? {
        return Err(ApiError::NotFound(format!("Collection {id} not found")));
    }
    info!(collection_id = %id, user = %user.username, "collection deleted");
    Ok(Json(json!({ "message": format!("Successfully deleted collection: {id}.") })))
}
