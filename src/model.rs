use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-submission state. Transitions follow
/// `received → validating → {validation_failed | queued} → publishing → {published | publish_failed}`,
/// with `queued → cancelled` for client cancellation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Received,
    Validating,
    ValidationFailed,
    Queued,
    Publishing,
    Published,
    PublishFailed,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Received => "received",
            Status::Validating => "validating",
            Status::ValidationFailed => "validation_failed",
            Status::Queued => "queued",
            Status::Publishing => "publishing",
            Status::Published => "published",
            Status::PublishFailed => "publish_failed",
            Status::Cancelled => "cancelled",
        }
    }

    pub fn parse_state(s: &str) -> Option<Status> {
        match s {
            "received" => Some(Status::Received),
            "validating" => Some(Status::Validating),
            "validation_failed" => Some(Status::ValidationFailed),
            "queued" => Some(Status::Queued),
            "publishing" => Some(Status::Publishing),
            "published" => Some(Status::Published),
            "publish_failed" => Some(Status::PublishFailed),
            "cancelled" => Some(Status::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::ValidationFailed | Status::Published | Status::PublishFailed | Status::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Received, Status::Validating)
                | (Status::Validating, Status::ValidationFailed)
                | (Status::Validating, Status::Queued)
                | (Status::Queued, Status::Publishing)
                | (Status::Queued, Status::Cancelled)
                | (Status::Publishing, Status::Published)
                | (Status::Publishing, Status::PublishFailed)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SpecViolation,
    MissingCollection,
    UnreachableAsset,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn spec(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::SpecViolation,
            message: message.into(),
        }
    }

    pub fn missing_collection(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::MissingCollection,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::UnreachableAsset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub reasons: Vec<FailureReason>,
}

impl ValidationResult {
    pub fn from_reasons(reasons: Vec<FailureReason>) -> Self {
        Self {
            passed: reasons.is_empty(),
            reasons,
        }
    }

    /// One-line summary stored as the submission message on failure.
    pub fn summary(&self) -> Option<String> {
        if self.passed {
            return None;
        }
        Some(
            self.reasons
                .iter()
                .map(|r| r.message.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub seq: i64,
    pub item_id: Option<String>,
    pub collection_id: Option<String>,
    pub status: Status,
    pub message: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub item: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: Status,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Dispatching,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::Dispatching => "dispatching",
        }
    }

    pub fn parse_state(s: &str) -> Option<BatchState> {
        match s {
            "pending" => Some(BatchState::Pending),
            "dispatching" => Some(BatchState::Dispatching),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: i64,
    pub collection_id: String,
    pub state: BatchState,
    pub attempt: i32,
    pub due_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Status of a discovery workflow run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Queued,
    Started,
    Succeeded,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Queued => "queued",
            WorkflowStatus::Started => "started",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<WorkflowStatus> {
        match s {
            "queued" => Some(WorkflowStatus::Queued),
            "started" => Some(WorkflowStatus::Started),
            "succeeded" => Some(WorkflowStatus::Succeeded),
            "failed" => Some(WorkflowStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Succeeded | WorkflowStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub collection_id: Option<String>,
    pub status: WorkflowStatus,
    pub message: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 8] = [
        Status::Received,
        Status::Validating,
        Status::ValidationFailed,
        Status::Queued,
        Status::Publishing,
        Status::Published,
        Status::PublishFailed,
        Status::Cancelled,
    ];

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            Status::Received,
            Status::Validating,
            Status::Queued,
            Status::Publishing,
            Status::Published,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert!(!Status::Received.can_transition_to(Status::Queued));
        assert!(!Status::Validating.can_transition_to(Status::Publishing));
        assert!(!Status::Publishing.can_transition_to(Status::Cancelled));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in ALL {
            assert_eq!(Status::parse_state(s.as_str()), Some(s));
            assert_eq!(serde_json::to_value(s).unwrap(), s.as_str());
        }
        assert_eq!(Status::parse_state("done"), None);
    }

    #[test]
    fn validation_summary_joins_reasons() {
        let ok = ValidationResult::from_reasons(vec![]);
        assert!(ok.passed);
        assert!(ok.summary().is_none());

        let failed = ValidationResult::from_reasons(vec![
            FailureReason::spec("missing id"),
            FailureReason::unreachable("asset visual: 404"),
        ]);
        assert!(!failed.passed);
        assert_eq!(failed.summary().as_deref(), Some("missing id; asset visual: 404"));
    }
}
