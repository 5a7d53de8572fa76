//! Batch queue: seals queued submissions into per-collection batches and
//! writes each batch to the catalog in one transaction.
//!
//! Delivery is at-least-once. A batch claimed by a worker that dies stays
//! `dispatching` until [`BatchQueue::recover`] runs at the next start; the
//! catalog skips items it already holds.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, instrument, warn};

use crate::catalog::CatalogStore;
use crate::config;
use crate::db::{self, Pool};
use crate::model::{BatchJob, Status};

/// Wakes the batch worker when something was queued.
#[derive(Debug, Clone, Default)]
pub struct QueueHandle {
    wake: Arc<Notify>,
}

impl QueueHandle {
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// A handle with no worker listening.
    pub fn detached() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub max_items: usize,
    pub max_wait: ChronoDuration,
    pub poll_interval: Duration,
    pub max_attempts: i32,
    pub max_backoff_secs: i64,
}

impl BatchPolicy {
    pub fn from_config(cfg: &config::Batch) -> Self {
        Self {
            max_items: cfg.max_items,
            max_wait: ChronoDuration::milliseconds(cfg.max_wait_ms as i64),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            max_attempts: cfg.max_attempts,
            max_backoff_secs: cfg.max_backoff_seconds as i64,
        }
    }

    /// Size threshold reached, or the oldest waiting submission has waited
    /// long enough.
    pub fn should_flush(&self, pending: i64, oldest: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        pending > 0 && (pending >= self.max_items as i64 || now - oldest >= self.max_wait)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Batches sealed this tick.
    pub sealed: usize,
    /// Submissions that reached `published`.
    pub published: usize,
    /// Submissions that reached `publish_failed`.
    pub failed: usize,
    /// Batches put back for another attempt.
    pub retried: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Published(usize),
    Failed(usize),
    Retried,
    Skipped,
}

#[derive(Clone)]
pub struct BatchQueue {
    pool: Pool,
    catalog: Arc<dyn CatalogStore>,
    policy: BatchPolicy,
    handle: QueueHandle,
}

impl BatchQueue {
    pub fn new(pool: Pool, catalog: Arc<dyn CatalogStore>, policy: BatchPolicy) -> Self {
        Self {
            pool,
            catalog,
            policy,
            handle: QueueHandle::default(),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Put batches abandoned mid-dispatch back in line.
    #[instrument(skip_all)]
    pub async fn recover(&self) -> Result<u64> {
        let requeued = db::requeue_inflight_batches(&self.pool).await?;
        if requeued > 0 {
            warn!(requeued, "re-dispatching batches left in flight");
        }
        Ok(requeued)
    }

    /// Worker loop. Runs until the task is dropped.
    ///
    /// Each collection's head batch is written on its own task, so a slow
    /// catalog write holds back only its own collection. Sealing and the
    /// dispatch of other collections go on while it is pending.
    pub async fn run(self) {
        info!(
            max_items = self.policy.max_items,
            max_wait_ms = self.policy.max_wait.num_milliseconds(),
            "batch worker started"
        );
        let mut inflight: JoinSet<(String, Result<DispatchOutcome>)> = JoinSet::new();
        let mut busy: HashSet<String> = HashSet::new();
        loop {
            while let Some(done) = inflight.try_join_next() {
                self.settle(done, &mut busy);
            }
            if let Err(err) = self.launch_due(&mut inflight, &mut busy).await {
                error!(?err, "batch worker error");
            }
            tokio::select! {
                _ = self.handle.wake.notified() => {}
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
                Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                    self.settle(done, &mut busy);
                }
            }
        }
    }

    /// Seal what is ready and spawn a dispatch for every due collection
    /// that has no write in flight.
    async fn launch_due(
        &self,
        inflight: &mut JoinSet<(String, Result<DispatchOutcome>)>,
        busy: &mut HashSet<String>,
    ) -> Result<()> {
        let now = Utc::now();
        self.seal_ready(now).await?;
        for batch in db::due_batches(&self.pool, now).await? {
            if !busy.insert(batch.collection_id.clone()) {
                continue;
            }
            let queue = self.clone();
            inflight.spawn(async move {
                let collection_id = batch.collection_id.clone();
                let outcome = queue.dispatch(batch, now).await;
                (collection_id, outcome)
            });
        }
        Ok(())
    }

    fn settle(
        &self,
        done: Result<(String, Result<DispatchOutcome>), JoinError>,
        busy: &mut HashSet<String>,
    ) {
        match done {
            Ok((collection_id, outcome)) => {
                busy.remove(&collection_id);
                if let Err(err) = outcome {
                    error!(?err, %collection_id, "batch dispatch error");
                }
            }
            // A panicked task leaves its batch `dispatching` until the next
            // `recover`, so its collection stays parked too.
            Err(err) => error!(?err, "batch dispatch task failed"),
        }
    }

    /// One pass: seal whatever crossed a threshold, then dispatch the head
    /// batch of every collection that is due.
    #[instrument(skip_all)]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport {
            sealed: self.seal_ready(now).await?,
            ..Default::default()
        };
        let due = db::due_batches(&self.pool, now).await?;
        let outcomes = join_all(due.into_iter().map(|batch| self.dispatch(batch, now))).await;
        for outcome in outcomes {
            match outcome? {
                DispatchOutcome::Published(n) => report.published += n,
                DispatchOutcome::Failed(n) => report.failed += n,
                DispatchOutcome::Retried => report.retried += 1,
                DispatchOutcome::Skipped => {}
            }
        }
        if !report.is_idle() {
            info!(
                sealed = report.sealed,
                published = report.published,
                failed = report.failed,
                retried = report.retried,
                "batch tick"
            );
        }
        Ok(report)
    }

    /// Seal batches for every collection over a threshold. A backlog larger
    /// than `max_items` becomes several batches; a partial batch is sealed
    /// only once its oldest submission has waited `max_wait`.
    async fn seal_ready(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut sealed = 0;
        loop {
            let ready: Vec<_> = db::queued_backlog(&self.pool)
                .await?
                .into_iter()
                .filter(|b| self.policy.should_flush(b.pending, b.oldest_queued_at, now))
                .collect();
            let mut sealed_this_round = 0;
            for backlog in ready {
                let limit = self.policy.max_items.max(1) as i64;
                if let Some(batch_id) = db::seal_batch(&self.pool, &backlog.collection_id, limit, now).await? {
                    info!(batch_id, collection_id = %backlog.collection_id, "batch sealed");
                    sealed_this_round += 1;
                }
            }
            if sealed_this_round == 0 {
                return Ok(sealed);
            }
            sealed += sealed_this_round;
        }
    }

    #[instrument(skip_all, fields(batch_id = batch.id, collection_id = %batch.collection_id, attempt = batch.attempt))]
    async fn dispatch(&self, batch: BatchJob, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        if !db::claim_batch(&self.pool, batch.id).await? {
            return Ok(DispatchOutcome::Skipped);
        }
        let members = db::batch_members(&self.pool, batch.id).await?;
        let items: Vec<Value> = members.into_iter().map(|m| m.item).collect();

        match self.catalog.insert_items(&batch.collection_id, &items).await {
            Ok(inserted) => {
                let detail = format!("batch {}", batch.id);
                let settled =
                    db::complete_batch(&self.pool, batch.id, Status::Published, Some(&detail), now).await?;
                info!(items = items.len(), inserted, "batch published");
                Ok(DispatchOutcome::Published(settled.len()))
            }
            Err(err) => {
                let message = format!("{err:#}");
                if batch.attempt + 1 >= self.policy.max_attempts {
                    let settled = db::complete_batch(
                        &self.pool,
                        batch.id,
                        Status::PublishFailed,
                        Some(&message),
                        now,
                    )
                    .await?;
                    error!(error = %message, "batch failed permanently");
                    Ok(DispatchOutcome::Failed(settled.len()))
                } else {
                    let due_at = db::backoff_batch(
                        &self.pool,
                        batch.id,
                        batch.attempt,
                        &message,
                        self.policy.max_backoff_secs,
                        now,
                    )
                    .await?;
                    warn!(error = %message, %due_at, "batch write failed; backoff");
                    Ok(DispatchOutcome::Retried)
                }
            }
        }
    }

    /// Seal and dispatch until nothing is queued or due, ignoring the time
    /// threshold. Batches still backing off are left in place.
    pub async fn drain(&self) -> Result<TickReport> {
        let flush_all = BatchQueue {
            policy: BatchPolicy {
                max_wait: ChronoDuration::zero(),
                ..self.policy.clone()
            },
            ..self.clone()
        };
        let mut total = TickReport::default();
        loop {
            let report = flush_all.tick(Utc::now()).await?;
            if report.is_idle() {
                return Ok(total);
            }
            total.sealed += report.sealed;
            total.published += report.published;
            total.failed += report.failed;
            total.retried += report.retried;
        }
    }
}
