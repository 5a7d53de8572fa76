use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{json_body, AppState};
use crate::auth::AuthUser;
use crate::dataset::DatasetDefinition;
use crate::error::{ApiError, ApiResult};
use crate::workflow::WorkflowError;

fn parse_definition(body: Result<Json<Value>, JsonRejection>) -> ApiResult<DatasetDefinition> {
    let raw = json_body(body)?;
    let def: DatasetDefinition = serde_json::from_value(raw)
        .map_err(|e| ApiError::unprocessable(format!("Invalid dataset definition: {e}")))?;
    let problems = def.check();
    if !problems.is_empty() {
        return Err(ApiError::unprocessable(problems.join("; ")));
    }
    Ok(def)
}

/// Check a dataset definition, including that every sample file is a COG.
pub async fn validate(
    State(state): State<AppState>,
    _user: AuthUser,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let def = parse_definition(body)?;
    let urls = def
        .sample_files
        .iter()
        .map(|s| def.sample_url(s))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ApiError::unprocessable)?;
    let checks = urls.iter().map(|url| state.probe.check_cog(url));
    let failures: Vec<String> = join_all(checks)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();
    if !failures.is_empty() {
        return Err(ApiError::unprocessable(failures.join("; ")));
    }
    Ok(Json(json!({
        "message": format!(
            "Dataset metadata is valid and ready to be published - {}",
            def.collection
        )
    })))
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub workflows_ids: Vec<String>,
}

/// Publish the dataset's collection and start one discovery run per
/// discovery item.
pub async fn publish(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<PublishResponse>> {
    let def = parse_definition(body)?;
    let collection = def.to_collection();
    let result = state.validator.validate_collection(&collection);
    if let Some(detail) = result.summary() {
        return Err(ApiError::Unprocessable {
            detail,
            reasons: result.reasons,
            body: None,
        });
    }
    state.catalog.upsert_collection(&collection).await?;
    info!(collection_id = %def.collection, user = %user.username, "dataset collection published");

    let mut message = format!("Successfully published collection: {}.", def.collection);
    let mut workflows_ids = Vec::new();
    if !state.workflows.is_configured() {
        warn!(collection_id = %def.collection, "no workflow orchestrator configured; discovery not started");
        return Ok(Json(PublishResponse {
            message,
            workflows_ids,
        }));
    }
    for input in def.discovery_inputs() {
        match state.workflows.start(&user.username, &input).await {
            Ok(execution) => workflows_ids.push(execution.id),
            Err(WorkflowError::Upstream(e)) => {
                return Err(ApiError::Upstream(format!(
                    "Published collection {} but failed to start discovery: {e}",
                    def.collection
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }
    if !workflows_ids.is_empty() {
        message.push_str(&format!(" {} workflows initiated.", workflows_ids.len()));
    }
    Ok(Json(PublishResponse {
        message,
        workflows_ids,
    }))
}
