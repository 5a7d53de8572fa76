//! Per-submission lifecycle: receive, validate, queue or reject, cancel,
//! and the pollable view of where a submission stands.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, NewSubmission, Pool};
use crate::model::{Status, StatusEvent, Submission, ValidationResult};
use crate::queue::QueueHandle;
use crate::validator::Validator;

/// A submission together with its validation outcome and full history.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionView {
    #[serde(flatten)]
    pub submission: Submission,
    pub validation: Option<ValidationResult>,
    pub history: Vec<StatusEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// Not cancellable from its current state.
    Refused(Status),
}

#[derive(Clone)]
pub struct Tracker {
    pool: Pool,
    validator: Validator,
    queue: QueueHandle,
}

impl Tracker {
    pub fn new(pool: Pool, validator: Validator, queue: QueueHandle) -> Self {
        Self {
            pool,
            validator,
            queue,
        }
    }

    /// Record an item, validate it and either queue it for publishing or
    /// settle it as `validation_failed`.
    #[instrument(skip_all, fields(created_by = %created_by))]
    pub async fn submit(&self, created_by: &str, item: Value) -> Result<SubmissionView> {
        let id = Uuid::new_v4().to_string();
        let item_id = item.get("id").and_then(Value::as_str);
        let collection_id = item.get("collection").and_then(Value::as_str);
        db::insert_submission(
            &self.pool,
            &NewSubmission {
                id: &id,
                item_id,
                collection_id,
                payload: &item,
                created_by,
            },
            Utc::now(),
        )
        .await?;

        db::transition_submission(&self.pool, &id, Status::Received, Status::Validating, None, Utc::now())
            .await?;

        let result = match self.validator.validate_item(&item).await {
            Ok(result) => result,
            Err(e) => {
                let detail = format!("validation could not complete: {e:#}");
                db::transition_submission(
                    &self.pool,
                    &id,
                    Status::Validating,
                    Status::ValidationFailed,
                    Some(&detail),
                    Utc::now(),
                )
                .await?;
                return Err(e);
            }
        };
        self.settle_validation(&id, &result).await?;
        self.view(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("submission {id} vanished after validation"))
    }

    async fn settle_validation(&self, id: &str, result: &ValidationResult) -> Result<()> {
        let now = Utc::now();
        db::record_validation(&self.pool, id, result, now).await?;
        if result.passed {
            db::transition_submission(&self.pool, id, Status::Validating, Status::Queued, None, now).await?;
            info!(submission_id = %id, "submission queued");
            self.queue.notify();
        } else {
            let summary = result.summary();
            db::transition_submission(
                &self.pool,
                id,
                Status::Validating,
                Status::ValidationFailed,
                summary.as_deref(),
                now,
            )
            .await?;
            warn!(submission_id = %id, reasons = result.reasons.len(), "submission failed validation");
        }
        Ok(())
    }

    pub async fn view(&self, id: &str) -> Result<Option<SubmissionView>> {
        let Some(submission) = db::fetch_submission(&self.pool, id).await? else {
            return Ok(None);
        };
        let validation = db::fetch_validation(&self.pool, id).await?;
        let history = db::fetch_history(&self.pool, id).await?;
        Ok(Some(SubmissionView {
            submission,
            validation,
            history,
        }))
    }

    /// Cancel a queued submission. Anything already publishing or settled
    /// is refused.
    #[instrument(skip_all, fields(submission_id = %id))]
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let Some(sub) = db::fetch_submission(&self.pool, id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if !sub.status.can_transition_to(Status::Cancelled) {
            return Ok(CancelOutcome::Refused(sub.status));
        }
        let moved = db::transition_submission(
            &self.pool,
            id,
            Status::Queued,
            Status::Cancelled,
            Some("cancelled by client"),
            Utc::now(),
        )
        .await?;
        if moved {
            return Ok(CancelOutcome::Cancelled);
        }
        // Lost the race against the batch worker.
        let current = db::fetch_submission(&self.pool, id)
            .await?
            .map(|s| s.status)
            .unwrap_or(Status::Publishing);
        Ok(CancelOutcome::Refused(current))
    }
}
