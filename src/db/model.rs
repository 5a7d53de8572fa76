//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Parameters for recording a freshly received submission.
#[derive(Debug, Clone)]
pub struct NewSubmission<'a> {
    pub id: &'a str,
    pub item_id: Option<&'a str>,
    pub collection_id: Option<&'a str>,
    pub payload: &'a Value,
    pub created_by: &'a str,
}

/// Queued submissions for one collection, used by the batch queue to decide
/// whether a flush threshold was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBacklog {
    pub collection_id: String,
    pub pending: i64,
    pub oldest_queued_at: DateTime<Utc>,
}

/// One submission inside a sealed batch, in insertion order.
#[derive(Debug, Clone)]
pub struct BatchMember {
    pub submission_id: String,
    pub item: Value,
}

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub username: String,
    pub expires_at: DateTime<Utc>,
}
