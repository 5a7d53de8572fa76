use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{json_body, AppState};
use crate::auth::AuthUser;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::model::{Status, Submission};
use crate::tracker::{CancelOutcome, SubmissionView};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Serialize, Deserialize)]
struct Cursor {
    seq: i64,
}

fn encode_cursor(seq: i64) -> String {
    URL_SAFE_NO_PAD.encode(json!({ "seq": seq }).to_string())
}

fn decode_cursor(raw: &str) -> Option<i64> {
    let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
    serde_json::from_slice::<Cursor>(&bytes).ok().map(|c| c.seq)
}

/// Submit a STAC Item. Validated before the response: passing items come
/// back `queued` with 201, failing ones `validation_failed` with 422.
pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmissionView>)> {
    let item = json_body(body)?;
    let view = state.tracker.submit(&user.username, item).await?;
    if view.submission.status == Status::ValidationFailed {
        let detail = view.submission.message.clone().unwrap_or_default();
        let body = serde_json::to_value(&view).map_err(anyhow::Error::from)?;
        return Err(ApiError::Unprocessable {
            detail,
            reasons: Vec::new(),
            body: Some(body),
        });
    }
    Ok((StatusCode::CREATED, Json(view)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub next: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub items: Vec<Submission>,
    pub next: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ListResponse>> {
    let status = params
        .status
        .as_deref()
        .map(|s| Status::parse_state(s).ok_or_else(|| ApiError::BadRequest(format!("unknown status {s}"))))
        .transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!("limit must be between 1 and {MAX_LIMIT}")));
    }
    let after = params
        .next
        .as_deref()
        .map(|raw| decode_cursor(raw).ok_or_else(|| ApiError::BadRequest("invalid next cursor".into())))
        .transpose()?;

    // One extra row tells whether another page exists.
    let mut items = db::list_submissions(&state.pool, &user.username, status, after, limit + 1).await?;
    let next = if items.len() as i64 > limit {
        items.truncate(limit as usize);
        items.last().map(|s| encode_cursor(s.seq))
    } else {
        None
    };
    Ok(Json(ListResponse { items, next }))
}

/// Submissions are only visible to the user who made them.
async fn owned(state: &AppState, user: &AuthUser, id: &str) -> ApiResult<SubmissionView> {
    state
        .tracker
        .view(id)
        .await?
        .filter(|v| v.submission.created_by == user.username)
        .ok_or_else(|| ApiError::NotFound(format!("No ingestion found with id {id}")))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<SubmissionView>> {
    owned(&state, &user, &id).await.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub message: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> ApiResult<Json<SubmissionView>> {
    let update = json_body(body)?;
    owned(&state, &user, &id).await?;
    db::update_message(&state.pool, &id, update.message.as_deref(), Utc::now()).await?;
    owned(&state, &user, &id).await.map(Json)
}

pub async fn cancel(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<SubmissionView>> {
    owned(&state, &user, &id).await?;
    match state.tracker.cancel(&id).await? {
        CancelOutcome::Cancelled => owned(&state, &user, &id).await.map(Json),
        CancelOutcome::NotFound => Err(ApiError::NotFound(format!("No ingestion found with id {id}"))),
        CancelOutcome::Refused(status) => Err(ApiError::Conflict(format!(
            "Unable to cancel ingestion in status {status}; only queued ingestions can be cancelled"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips_and_rejects_garbage() {
        let raw = encode_cursor(42);
        assert!(!raw.contains('='));
        assert_eq!(decode_cursor(&raw), Some(42));
        assert_eq!(decode_cursor("not-base64!"), None);
        assert_eq!(decode_cursor(&URL_SAFE_NO_PAD.encode("[]")), None);
    }
}
