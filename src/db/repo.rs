use super::model::{BatchMember, NewSubmission, QueueBacklog, TokenRecord};
use crate::model::{
    BatchJob, BatchState, Status, StatusEvent, Submission, ValidationResult, WorkflowExecution,
    WorkflowStatus,
};
use anyhow::{anyhow, ensure, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with stricter durability.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory pool; every connection of a `:memory:` pool
/// would otherwise see its own empty database.
pub async fn memory_pool() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// tokens

#[instrument(skip_all)]
pub async fn insert_token(
    pool: &Pool,
    token: &str,
    username: &str,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO tokens (token, username, issued_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(token)
        .bind(username)
        .bind(issued_at)
        .bind(expires_at)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn find_token(pool: &Pool, token: &str, now: DateTime<Utc>) -> Result<Option<TokenRecord>> {
    let row = sqlx::query(
        "SELECT username, expires_at FROM tokens WHERE token = ? AND julianday(expires_at) > julianday(?)",
    )
    .bind(token)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(TokenRecord {
        username: row.try_get("username")?,
        expires_at: row.try_get("expires_at")?,
    }))
}

#[instrument(skip_all)]
pub async fn purge_expired_tokens(pool: &Pool, now: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM tokens WHERE julianday(expires_at) <= julianday(?)")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// submissions and their status history

const SUBMISSION_COLUMNS: &str = "seq, id, item_id, collection_id, payload, status, message, created_by, created_at, updated_at";

fn submission_from_row(row: &SqliteRow) -> Result<Submission> {
    let status_str: String = row.try_get("status")?;
    let status = Status::parse_state(&status_str)
        .ok_or_else(|| anyhow!("submission has unknown status {}", status_str))?;
    let payload: String = row.try_get("payload")?;
    Ok(Submission {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        item_id: row.try_get("item_id")?,
        collection_id: row.try_get("collection_id")?,
        status,
        message: row.try_get("message")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        item: serde_json::from_str(&payload).context("stored payload is not JSON")?,
    })
}

/// Record a new submission in `received` state. Returns its sequence number.
#[instrument(skip_all)]
pub async fn insert_submission(pool: &Pool, new: &NewSubmission<'_>, now: DateTime<Utc>) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let payload = serde_json::to_string(new.payload)?;
    let seq: i64 = sqlx::query(
        "INSERT INTO submissions (id, item_id, collection_id, payload, status, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING seq",
    )
    .bind(new.id)
    .bind(new.item_id)
    .bind(new.collection_id)
    .bind(payload)
    .bind(Status::Received.as_str())
    .bind(new.created_by)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?
    .get("seq");
    append_event_tx(&mut tx, new.id, Status::Received, None, now).await?;
    tx.commit().await?;
    Ok(seq)
}

async fn append_event_tx(
    tx: &mut Transaction<'_, Sqlite>,
    submission_id: &str,
    status: Status,
    detail: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO status_events (submission_id, status, detail, at) VALUES (?, ?, ?, ?)")
        .bind(submission_id)
        .bind(status.as_str())
        .bind(detail)
        .bind(at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Compare-and-set on the stored status. Returns false when the submission
/// is no longer in `from` (another writer moved it first).
async fn transition_tx(
    tx: &mut Transaction<'_, Sqlite>,
    submission_id: &str,
    from: Status,
    to: Status,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    ensure!(
        from.can_transition_to(to),
        "illegal transition {} -> {} for submission {}",
        from,
        to,
        submission_id
    );
    let message = match to {
        Status::ValidationFailed | Status::PublishFailed => detail,
        _ => None,
    };
    let res = sqlx::query(
        "UPDATE submissions SET status = ?, updated_at = ?, message = COALESCE(?, message), \
         queued_at = CASE WHEN ? = 'queued' THEN ? ELSE queued_at END \
         WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(message)
    .bind(to.as_str())
    .bind(now)
    .bind(submission_id)
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?;
    if res.rows_affected() != 1 {
        return Ok(false);
    }
    append_event_tx(tx, submission_id, to, detail, now).await?;
    Ok(true)
}

#[instrument(skip_all, fields(submission_id, from = %from, to = %to))]
pub async fn transition_submission(
    pool: &Pool,
    submission_id: &str,
    from: Status,
    to: Status,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let moved = transition_tx(&mut tx, submission_id, from, to, detail, now).await?;
    tx.commit().await?;
    Ok(moved)
}

#[instrument(skip_all)]
pub async fn record_validation(
    pool: &Pool,
    submission_id: &str,
    result: &ValidationResult,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO validation_results (submission_id, passed, reasons, validated_at) VALUES (?, ?, ?, ?)",
    )
    .bind(submission_id)
    .bind(result.passed)
    .bind(serde_json::to_string(&result.reasons)?)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_validation(pool: &Pool, submission_id: &str) -> Result<Option<ValidationResult>> {
    let row = sqlx::query("SELECT passed, reasons FROM validation_results WHERE submission_id = ?")
        .bind(submission_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let reasons: String = row.try_get("reasons")?;
    Ok(Some(ValidationResult {
        passed: row.try_get("passed")?,
        reasons: serde_json::from_str(&reasons).context("stored reasons are not JSON")?,
    }))
}

#[instrument(skip_all)]
pub async fn fetch_submission(pool: &Pool, submission_id: &str) -> Result<Option<Submission>> {
    let row = sqlx::query(&format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?"))
        .bind(submission_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(submission_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn fetch_history(pool: &Pool, submission_id: &str) -> Result<Vec<StatusEvent>> {
    let rows = sqlx::query(
        "SELECT status, detail, at FROM status_events WHERE submission_id = ? ORDER BY id ASC",
    )
    .bind(submission_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let status: String = row.try_get("status")?;
            Ok(StatusEvent {
                status: Status::parse_state(&status)
                    .ok_or_else(|| anyhow!("status event has unknown status {}", status))?,
                detail: row.try_get("detail")?,
                at: row.try_get("at")?,
            })
        })
        .collect()
}

/// Keyset page of a user's submissions ordered by insertion.
#[instrument(skip_all)]
pub async fn list_submissions(
    pool: &Pool,
    created_by: &str,
    status: Option<Status>,
    after_seq: Option<i64>,
    limit: i64,
) -> Result<Vec<Submission>> {
    let status = status.map(|s| s.as_str());
    let rows = sqlx::query(&format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions \
         WHERE created_by = ? AND (? IS NULL OR status = ?) AND seq > ? \
         ORDER BY seq ASC LIMIT ?"
    ))
    .bind(created_by)
    .bind(status)
    .bind(status)
    .bind(after_seq.unwrap_or(0))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(submission_from_row).collect()
}

#[instrument(skip_all)]
pub async fn update_message(
    pool: &Pool,
    submission_id: &str,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE submissions SET message = ?, updated_at = ? WHERE id = ?")
        .bind(message)
        .bind(now)
        .bind(submission_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_by_status(pool: &Pool, status: Status) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM submissions WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// batch queue

#[instrument(skip_all)]
pub async fn queued_backlog(pool: &Pool) -> Result<Vec<QueueBacklog>> {
    let rows = sqlx::query(
        "SELECT s.collection_id AS collection_id, COUNT(*) AS pending, \
                (SELECT s2.queued_at FROM submissions s2 \
                 WHERE s2.status = 'queued' AND s2.collection_id = s.collection_id \
                 ORDER BY julianday(s2.queued_at) ASC LIMIT 1) AS oldest_queued_at \
         FROM submissions s \
         WHERE s.status = 'queued' AND s.collection_id IS NOT NULL \
         GROUP BY s.collection_id \
         ORDER BY MIN(s.seq) ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(QueueBacklog {
                collection_id: row.try_get("collection_id")?,
                pending: row.try_get("pending")?,
                oldest_queued_at: row.try_get("oldest_queued_at")?,
            })
        })
        .collect()
}

/// Move up to `max_items` queued submissions of `collection_id` (oldest
/// first) into a new pending batch. Returns `None` when nothing was queued.
#[instrument(skip_all, fields(collection_id))]
pub async fn seal_batch(
    pool: &Pool,
    collection_id: &str,
    max_items: i64,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM submissions WHERE status = 'queued' AND collection_id = ? ORDER BY seq ASC LIMIT ?",
    )
    .bind(collection_id)
    .bind(max_items)
    .fetch_all(&mut *tx)
    .await?;
    if ids.is_empty() {
        return Ok(None);
    }

    let batch_id: i64 = sqlx::query(
        "INSERT INTO batches (collection_id, state, attempt, due_at, created_at) VALUES (?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(collection_id)
    .bind(BatchState::Pending.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?
    .get("id");

    let detail = format!("batch {batch_id}");
    let mut position: i64 = 0;
    for id in ids {
        if !transition_tx(&mut tx, &id, Status::Queued, Status::Publishing, Some(&detail), now).await? {
            continue;
        }
        sqlx::query("UPDATE submissions SET batch_id = ? WHERE id = ?")
            .bind(batch_id)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO batch_members (batch_id, position, submission_id) VALUES (?, ?, ?)")
            .bind(batch_id)
            .bind(position)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        position += 1;
    }
    if position == 0 {
        return Ok(None);
    }
    tx.commit().await?;
    Ok(Some(batch_id))
}

fn batch_from_row(row: &SqliteRow) -> Result<BatchJob> {
    let state: String = row.try_get("state")?;
    Ok(BatchJob {
        id: row.try_get("id")?,
        collection_id: row.try_get("collection_id")?,
        state: BatchState::parse_state(&state)
            .ok_or_else(|| anyhow!("batch has unknown state {}", state))?,
        attempt: row.try_get("attempt")?,
        due_at: row.try_get("due_at")?,
        last_error: row.try_get("last_error")?,
    })
}

/// The oldest batch of each collection, when it is pending and due. A
/// collection whose head batch is dispatching or backing off yields nothing,
/// which keeps batches of one collection from overtaking each other.
#[instrument(skip_all)]
pub async fn due_batches(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<BatchJob>> {
    let rows = sqlx::query(
        "SELECT b.id, b.collection_id, b.state, b.attempt, b.due_at, b.last_error FROM batches b \
         WHERE b.state = 'pending' AND julianday(b.due_at) <= julianday(?) \
           AND b.id = (SELECT MIN(b2.id) FROM batches b2 WHERE b2.collection_id = b.collection_id) \
         ORDER BY b.id ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    rows.iter().map(batch_from_row).collect()
}

#[instrument(skip_all)]
pub async fn claim_batch(pool: &Pool, batch_id: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE batches SET state = ? WHERE id = ? AND state = ?")
        .bind(BatchState::Dispatching.as_str())
        .bind(batch_id)
        .bind(BatchState::Pending.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn batch_members(pool: &Pool, batch_id: i64) -> Result<Vec<BatchMember>> {
    let rows = sqlx::query(
        "SELECT m.submission_id, s.payload FROM batch_members m \
         JOIN submissions s ON s.id = m.submission_id \
         WHERE m.batch_id = ? ORDER BY m.position ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let payload: String = row.try_get("payload")?;
            Ok(BatchMember {
                submission_id: row.try_get("submission_id")?,
                item: serde_json::from_str::<Value>(&payload).context("stored payload is not JSON")?,
            })
        })
        .collect()
}

/// Settle every member of a batch as `published` or `publish_failed` and
/// drop the batch. Returns the ids that moved.
#[instrument(skip_all, fields(batch_id, outcome = %outcome))]
pub async fn complete_batch(
    pool: &Pool,
    batch_id: i64,
    outcome: Status,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    ensure!(
        matches!(outcome, Status::Published | Status::PublishFailed),
        "batch outcome must be terminal, got {}",
        outcome
    );
    let mut tx = pool.begin().await?;
    let members: Vec<String> = sqlx::query_scalar(
        "SELECT submission_id FROM batch_members WHERE batch_id = ? ORDER BY position ASC",
    )
    .bind(batch_id)
    .fetch_all(&mut *tx)
    .await?;
    let mut settled = Vec::with_capacity(members.len());
    for id in members {
        if transition_tx(&mut tx, &id, Status::Publishing, outcome, detail, now).await? {
            settled.push(id);
        }
    }
    sqlx::query("DELETE FROM batch_members WHERE batch_id = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM batches WHERE id = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(settled)
}

/// Seconds to wait after `attempt` failures: 5s * 2^attempt, capped.
pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn backoff_batch(
    pool: &Pool,
    batch_id: i64,
    attempt: i32,
    error: &str,
    max_cap_secs: i64,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let due_at = now + Duration::seconds(backoff_secs(attempt, max_cap_secs));
    sqlx::query(
        "UPDATE batches SET state = ?, attempt = ?, due_at = ?, last_error = ? WHERE id = ?",
    )
    .bind(BatchState::Pending.as_str())
    .bind(attempt + 1)
    .bind(due_at)
    .bind(error)
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(due_at)
}

/// Batches left `dispatching` by a crashed worker go back to `pending`.
#[instrument(skip_all)]
pub async fn requeue_inflight_batches(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("UPDATE batches SET state = ? WHERE state = ?")
        .bind(BatchState::Pending.as_str())
        .bind(BatchState::Dispatching.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_batches(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batches")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// workflow executions

#[instrument(skip_all)]
pub async fn insert_workflow_execution(
    pool: &Pool,
    id: &str,
    collection_id: Option<&str>,
    input: &Value,
    status: WorkflowStatus,
    created_by: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_executions (id, collection_id, input, status, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(collection_id)
    .bind(serde_json::to_string(input)?)
    .bind(status.as_str())
    .bind(created_by)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_workflow_execution(pool: &Pool, id: &str) -> Result<Option<WorkflowExecution>> {
    let row = sqlx::query(
        "SELECT id, collection_id, status, message, created_by, created_at, updated_at \
         FROM workflow_executions WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let status: String = row.try_get("status")?;
    Ok(Some(WorkflowExecution {
        id: row.try_get("id")?,
        collection_id: row.try_get("collection_id")?,
        status: WorkflowStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("workflow execution has unknown status {}", status))?,
        message: row.try_get("message")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

#[instrument(skip_all)]
pub async fn update_workflow_status(
    pool: &Pool,
    id: &str,
    status: WorkflowStatus,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_executions SET status = ?, message = COALESCE(?, message), updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(message)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
