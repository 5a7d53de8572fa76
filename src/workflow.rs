//! Discovery workflow runs on an external orchestrator (Airflow REST API).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config;
use crate::dataset::DiscoveryItem;
use crate::db::{self, Pool};
use crate::model::{WorkflowExecution, WorkflowStatus};

#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    /// Start a run named `run_id` with `conf` as its input.
    async fn trigger(&self, run_id: &str, conf: &Value) -> Result<()>;

    /// Current status of a run.
    async fn status(&self, run_id: &str) -> Result<WorkflowStatus>;
}

/// Orchestrator run state mapped onto the execution statuses clients see.
pub fn map_airflow_state(state: &str) -> Option<WorkflowStatus> {
    match state {
        "queued" => Some(WorkflowStatus::Queued),
        "running" | "restarting" | "up_for_retry" => Some(WorkflowStatus::Started),
        "success" => Some(WorkflowStatus::Succeeded),
        "failed" => Some(WorkflowStatus::Failed),
        _ => None,
    }
}

#[derive(Clone)]
pub struct AirflowClient {
    http: Client,
    api_url: Url,
    dag_id: String,
    token: Option<String>,
}

impl fmt::Debug for AirflowClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AirflowClient")
            .field("api_url", &self.api_url)
            .field("dag_id", &self.dag_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct DagRunResp {
    state: String,
}

impl AirflowClient {
    /// `None` when no orchestrator is configured.
    pub fn from_config(cfg: &config::Workflows) -> Result<Option<Self>> {
        let Some(api_url) = cfg.api_url.as_deref() else {
            return Ok(None);
        };
        let http = Client::builder()
            .user_agent(concat!("stac-ingestor/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build orchestrator client")?;
        let api_url = Url::parse(&format!("{}/", api_url.trim_end_matches('/')))
            .context("invalid workflows.api_url")?;
        Ok(Some(Self {
            http,
            api_url,
            dag_id: cfg.dag_id.clone(),
            token: cfg.token.clone(),
        }))
    }

    fn runs_url(&self, run_id: Option<&str>) -> Result<Url> {
        let mut path = format!("api/v1/dags/{}/dagRuns", self.dag_id);
        if let Some(id) = run_id {
            path.push('/');
            path.push_str(id);
        }
        self.api_url.join(&path).context("invalid orchestrator url")
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl WorkflowDispatcher for AirflowClient {
    #[instrument(skip_all, fields(run_id = %run_id))]
    async fn trigger(&self, run_id: &str, conf: &Value) -> Result<()> {
        let url = self.runs_url(None)?;
        let resp = self
            .authorized(self.http.post(url))
            .json(&json!({ "dag_run_id": run_id, "conf": conf }))
            .send()
            .await
            .context("orchestrator unreachable")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("failed to trigger workflow: {} {}", status.as_u16(), body));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    async fn status(&self, run_id: &str) -> Result<WorkflowStatus> {
        let url = self.runs_url(Some(run_id))?;
        let resp = self
            .authorized(self.http.get(url))
            .send()
            .await
            .context("orchestrator unreachable")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("failed to read workflow {run_id}: {} {}", status.as_u16(), body));
        }
        let run: DagRunResp = resp.json().await.context("unexpected orchestrator response")?;
        map_airflow_state(&run.state).ok_or_else(|| anyhow!("unknown workflow state {}", run.state))
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow orchestrator not configured")]
    NotConfigured,
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Starts discovery runs and keeps their recorded status current.
#[derive(Clone)]
pub struct WorkflowRunner {
    pool: Pool,
    dispatcher: Option<Arc<dyn WorkflowDispatcher>>,
}

impl WorkflowRunner {
    pub fn new(pool: Pool, dispatcher: Option<Arc<dyn WorkflowDispatcher>>) -> Self {
        Self { pool, dispatcher }
    }

    pub fn is_configured(&self) -> bool {
        self.dispatcher.is_some()
    }

    #[instrument(skip_all, fields(created_by = %created_by))]
    pub async fn start(&self, created_by: &str, input: &DiscoveryItem) -> Result<WorkflowExecution, WorkflowError> {
        let dispatcher = self.dispatcher.as_ref().ok_or(WorkflowError::NotConfigured)?;
        let id = Uuid::new_v4().to_string();
        let conf = serde_json::to_value(input).context("discovery input is not serializable")?;
        db::insert_workflow_execution(
            &self.pool,
            &id,
            input.collection.as_deref(),
            &conf,
            WorkflowStatus::Queued,
            created_by,
            Utc::now(),
        )
        .await?;

        if let Err(err) = dispatcher.trigger(&id, &conf).await {
            let message = format!("{err:#}");
            db::update_workflow_status(&self.pool, &id, WorkflowStatus::Failed, Some(&message), Utc::now())
                .await?;
            warn!(workflow_id = %id, error = %message, "workflow trigger failed");
            return Err(WorkflowError::Upstream(message));
        }
        db::update_workflow_status(&self.pool, &id, WorkflowStatus::Started, None, Utc::now()).await?;
        info!(workflow_id = %id, collection = ?input.collection, "workflow started");
        self.fetch(&id)
            .await?
            .ok_or_else(|| WorkflowError::Internal(anyhow!("workflow {id} vanished after trigger")))
    }

    async fn fetch(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        db::fetch_workflow_execution(&self.pool, id).await
    }

    /// Recorded execution, refreshed from the orchestrator while it is not
    /// terminal. An unreachable orchestrator leaves the recorded status.
    #[instrument(skip_all, fields(workflow_id = %id))]
    pub async fn status(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        let Some(execution) = self.fetch(id).await? else {
            return Ok(None);
        };
        let Some(dispatcher) = &self.dispatcher else {
            return Ok(Some(execution));
        };
        if execution.status.is_terminal() {
            return Ok(Some(execution));
        }
        match dispatcher.status(id).await {
            Ok(current) if current != execution.status => {
                db::update_workflow_status(&self.pool, id, current, None, Utc::now()).await?;
                self.fetch(id).await
            }
            Ok(_) => Ok(Some(execution)),
            Err(err) => {
                warn!(?err, "could not refresh workflow status");
                Ok(Some(execution))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedDispatcher {
        fail_trigger: bool,
        state: Mutex<Option<WorkflowStatus>>,
        triggered: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl WorkflowDispatcher for ScriptedDispatcher {
        async fn trigger(&self, run_id: &str, conf: &Value) -> Result<()> {
            if self.fail_trigger {
                return Err(anyhow!("503 unavailable"));
            }
            self.triggered
                .lock()
                .unwrap()
                .push((run_id.to_string(), conf.clone()));
            Ok(())
        }

        async fn status(&self, _run_id: &str) -> Result<WorkflowStatus> {
            self.state
                .lock()
                .unwrap()
                .ok_or_else(|| anyhow!("no such run"))
        }
    }

    fn input() -> DiscoveryItem {
        serde_json::from_value(json!({
            "bucket": "veda-data-store-staging",
            "prefix": "nightlights/",
            "collection": "nightlights"
        }))
        .unwrap()
    }

    #[test]
    fn airflow_states_map() {
        assert_eq!(map_airflow_state("success"), Some(WorkflowStatus::Succeeded));
        assert_eq!(map_airflow_state("running"), Some(WorkflowStatus::Started));
        assert_eq!(map_airflow_state("queued"), Some(WorkflowStatus::Queued));
        assert_eq!(map_airflow_state("failed"), Some(WorkflowStatus::Failed));
        assert_eq!(map_airflow_state("exploded"), None);
    }

    #[tokio::test]
    async fn start_then_refresh_until_terminal() {
        let pool = db::memory_pool().await.unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let runner = WorkflowRunner::new(pool, Some(dispatcher.clone() as Arc<dyn WorkflowDispatcher>));

        let exec = runner.start("alice", &input()).await.unwrap();
        assert_eq!(exec.status, WorkflowStatus::Started);
        assert_eq!(exec.collection_id.as_deref(), Some("nightlights"));
        {
            let triggered = dispatcher.triggered.lock().unwrap();
            assert_eq!(triggered[0].0, exec.id);
            assert_eq!(triggered[0].1["bucket"], "veda-data-store-staging");
        }

        // Orchestrator unreachable: recorded status stands.
        let same = runner.status(&exec.id).await.unwrap().unwrap();
        assert_eq!(same.status, WorkflowStatus::Started);

        *dispatcher.state.lock().unwrap() = Some(WorkflowStatus::Succeeded);
        let done = runner.status(&exec.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Succeeded);

        // Terminal runs are not polled again.
        *dispatcher.state.lock().unwrap() = Some(WorkflowStatus::Failed);
        let still = runner.status(&exec.id).await.unwrap().unwrap();
        assert_eq!(still.status, WorkflowStatus::Succeeded);
        assert!(runner.status("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_trigger_is_recorded() {
        let pool = db::memory_pool().await.unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher {
            fail_trigger: true,
            ..Default::default()
        });
        let runner = WorkflowRunner::new(pool, Some(dispatcher as Arc<dyn WorkflowDispatcher>));
        let err = runner.start("alice", &input()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Upstream(_)));
    }

    #[tokio::test]
    async fn unconfigured_runner_refuses() {
        let pool = db::memory_pool().await.unwrap();
        let runner = WorkflowRunner::new(pool, None);
        assert!(!runner.is_configured());
        assert!(matches!(
            runner.start("alice", &input()).await,
            Err(WorkflowError::NotConfigured)
        ));
    }
}
