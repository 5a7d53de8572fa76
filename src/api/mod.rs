//! HTTP surface of the ingestor.

use axum::{
    body::Body,
    extract::rejection::JsonRejection,
    http::{HeaderName, Request, StatusCode},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::db::Pool;
use crate::error::{ApiError, ApiResult};
use crate::probe::AssetProbe;
use crate::queue::QueueHandle;
use crate::tracker::Tracker;
use crate::validator::Validator;
use crate::workflow::{WorkflowDispatcher, WorkflowRunner};

mod collections;
mod dataset;
mod ingestions;
mod session;
mod workflows;

pub const CORRELATION_ID: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub cfg: Arc<Config>,
    pub catalog: Arc<dyn CatalogStore>,
    pub probe: Arc<dyn AssetProbe>,
    pub validator: Validator,
    pub tracker: Tracker,
    pub workflows: WorkflowRunner,
}

impl AppState {
    pub fn new(
        pool: Pool,
        cfg: Config,
        catalog: Arc<dyn CatalogStore>,
        probe: Arc<dyn AssetProbe>,
        dispatcher: Option<Arc<dyn WorkflowDispatcher>>,
        queue: QueueHandle,
    ) -> Self {
        let validator = Validator::new(
            Arc::clone(&catalog),
            Arc::clone(&probe),
            cfg.validation.check_assets,
        );
        let tracker = Tracker::new(pool.clone(), validator.clone(), queue);
        let workflows = WorkflowRunner::new(pool.clone(), dispatcher);
        Self {
            pool,
            cfg: Arc::new(cfg),
            catalog,
            probe,
            validator,
            tracker,
            workflows,
        }
    }
}

/// Unwrap a JSON body, turning axum's plain-text rejection into the
/// `{"detail": ...}` shape every other error uses.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::unprocessable(rejection.body_text())),
    }
}

pub fn router(state: AppState) -> Router {
    let correlation = HeaderName::from_static(CORRELATION_ID);
    let timeout = Duration::from_secs(state.cfg.app.request_timeout_seconds);

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(correlation.clone(), MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                let correlation_id = req
                    .headers()
                    .get(CORRELATION_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "request",
                    method = %req.method(),
                    uri = %req.uri(),
                    correlation_id = %correlation_id,
                )
            }),
        )
        .layer(PropagateRequestIdLayer::new(correlation))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout));

    Router::new()
        .route("/", get(session::health))
        .route("/token", post(session::token))
        .route("/auth/me", get(session::who_am_i))
        .route("/ingestions", post(ingestions::create).get(ingestions::list))
        .route(
            "/ingestions/{id}",
            get(ingestions::show)
                .patch(ingestions::update)
                .delete(ingestions::cancel),
        )
        .route("/collections", post(collections::create))
        .route(
            "/collections/{id}",
            get(collections::show).delete(collections::remove),
        )
        .route("/dataset/validate", post(dataset::validate))
        .route("/dataset/publish", post(dataset::publish))
        .route("/workflow-executions", post(workflows::start))
        .route("/workflow-executions/{id}", get(workflows::show))
        .layer(middleware)
        .with_state(state)
}
