use axum::{
    extract::{rejection::FormRejection, State},
    Form, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::auth::{self, AuthUser, IssuedToken};
use crate::error::{ApiError, ApiResult};

pub async fn health() -> Json<Value> {
    Json(json!({ "message": "Hello from STAC Ingestor", "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub username: String,
    pub password: String,
}

pub async fn token(
    State(state): State<AppState>,
    form: Result<Form<TokenForm>, FormRejection>,
) -> ApiResult<Json<IssuedToken>> {
    let Form(form) = form.map_err(|rejection| ApiError::unprocessable(rejection.body_text()))?;
    auth::issue_token(&state.pool, &state.cfg.auth, &form.username, &form.password)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::Unauthorized("Incorrect username or password".into()))
}

pub async fn who_am_i(user: AuthUser) -> Json<AuthUser> {
    Json(user)
}
