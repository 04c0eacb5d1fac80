use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DomainError;

/// Semantic hint describing how much history an operation should cover.
///
/// Passed through to stages untouched; the engine never interprets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// First-ever run over the requested window.
    Initial,
    /// Extend existing outputs with newly available days.
    Accumulative,
    /// Rebuild everything in the window from scratch.
    Full,
}

/// A request to run an operation, typically arriving as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Caller-chosen operation ID. Assigned by the manager when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub mode: OperationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_date: Option<NaiveDate>,
    /// Free-form stage parameters, plus the well-known planning keys
    /// [`OperationRequest::PARAM_STAGE`] and [`OperationRequest::PARAM_AUTOWIRE`].
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl OperationRequest {
    /// Parameter naming a single stage to run instead of the full pipeline.
    pub const PARAM_STAGE: &'static str = "stage";
    /// Parameter controlling whether missing prerequisites of a named stage
    /// are pulled into the plan automatically. Defaults to `true`.
    pub const PARAM_AUTOWIRE: &'static str = "autowire";

    /// Creates a full-pipeline request with no window and no parameters.
    pub fn new(mode: OperationMode) -> Self {
        Self {
            id: None,
            mode,
            from_date: None,
            to_date: None,
            parameters: Map::new(),
        }
    }

    /// Sets a caller-chosen operation ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the trading-date window.
    pub fn with_window(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from_date = Some(from);
        self.to_date = Some(to);
        self
    }

    /// Inserts a parameter. The last value wins for a repeated key.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// The single stage named by this request, if any.
    pub fn target_stage(&self) -> Option<&str> {
        self.parameters.get(Self::PARAM_STAGE).and_then(Value::as_str)
    }

    /// Whether missing prerequisites of a named stage should be autowired
    /// into the plan. Defaults to `true` when the parameter is absent.
    pub fn autowire(&self) -> bool {
        self.parameters
            .get(Self::PARAM_AUTOWIRE)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

/// Lifecycle status of an operation.
///
/// Transitions form a DAG: `pending → running`, `pending → cancelled`
/// (an operation cancelled before its worker ever starts), and
/// `running → {completed, failed, cancelled}`. Terminal states have no
/// outgoing edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    /// Terminal.
    Completed,
    /// Terminal.
    Failed,
    /// Terminal.
    Cancelled,
}

impl OperationStatus {
    /// Whether the operation has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the transition `self → next` is an edge of the status DAG.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => matches!(next, Self::Completed | Self::Failed | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Validated transition; the caller keeps the old status on error.
    pub fn transition_to(self, next: OperationStatus) -> Result<OperationStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition { from: self, to: next })
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal status of one stage attempt within an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Required inputs were absent when the stage came up in plan order.
    Skipped,
}

/// Outcome record for one stage attempt. Never revisited once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl StageResult {
    /// Builds a result with the given terminal status and no message.
    pub fn new(
        stage_id: impl Into<String>,
        status: StageStatus,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            status,
            started_at,
            ended_at,
            message: None,
            metadata: Map::new(),
        }
    }

    /// Attaches a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Merges a key/value pair into the result metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The full per-operation record retained for the lifetime of the process.
///
/// Mutated only by the scheduler worker that owns the operation; everything
/// else sees cloned snapshots of this struct.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationState {
    pub id: String,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_results: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub trace_id: Uuid,
}

impl OperationState {
    /// A fresh `pending` state with no stage history.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>, trace_id: Uuid) -> Self {
        Self {
            id: id.into(),
            status: OperationStatus::Pending,
            created_at,
            started_at: None,
            ended_at: None,
            current_stage_id: None,
            stage_results: Vec::new(),
            last_error: None,
            trace_id,
        }
    }

    /// Looks up the recorded result for a stage, if any.
    pub fn stage_result(&self, stage_id: &str) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage_id == stage_id)
    }
}
