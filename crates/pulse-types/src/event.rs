use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::operation::OperationState;

/// The closed set of progress/status events an operation can emit.
///
/// Extensible: new lifecycle notifications are added as variants here, not
/// as free-form strings. Subscribers match on variants, never on names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// First event of every operation.
    OperationStarted,
    /// A stage was handed to the runner.
    StageStarted,
    /// Stage-local progress update (0–100).
    StageProgress,
    /// Stage finished with a succeeded result.
    StageCompleted,
    /// Stage finished with a failed result (terminal for the operation).
    StageFailed,
    /// Every planned stage succeeded or was validly skipped (terminal).
    OperationCompleted,
    /// A stage failure stopped the operation (terminal).
    OperationFailed,
    /// The operation's cancellation scope was signalled (terminal).
    OperationCancelled,
}

impl EventKind {
    /// Returns the wire name of the variant for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OperationStarted => "operation-started",
            Self::StageStarted => "stage-started",
            Self::StageProgress => "stage-progress",
            Self::StageCompleted => "stage-completed",
            Self::StageFailed => "stage-failed",
            Self::OperationCompleted => "operation-completed",
            Self::OperationFailed => "operation-failed",
            Self::OperationCancelled => "operation-cancelled",
        }
    }

    /// Whether this event ends the operation (completed, failed, or cancelled).
    pub fn is_operation_terminal(&self) -> bool {
        matches!(
            self,
            Self::OperationCompleted | Self::OperationFailed | Self::OperationCancelled
        )
    }
}

/// One progress/status event, as pushed to subscribers.
///
/// `timestamp` is wall-clock and serializes as RFC 3339. `trace_id` is
/// assigned once per operation and carried by every event of that operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// Stage-local progress percent, 0–100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Uuid,
}

impl Event {
    /// Creates an [`Event`] with required fields only.
    ///
    /// Use the `with_*` helpers to attach the optional fields.
    pub fn new(
        kind: EventKind,
        operation_id: impl Into<String>,
        trace_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            operation_id: operation_id.into(),
            stage_id: None,
            progress: None,
            message: None,
            metadata: None,
            timestamp,
            trace_id,
        }
    }

    /// Attaches the originating stage ID.
    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    /// Attaches a stage-local progress percent, clamped to 100.
    pub fn with_progress(mut self, percent: u8) -> Self {
        self.progress = Some(percent.min(100));
        self
    }

    /// Attaches a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Merges a key/value pair into the event metadata.
    ///
    /// If called multiple times with the same key, the last value wins.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// In-band stream markers a subscriber may receive on its own sink.
///
/// Lag and eviction are never surfaced to publishers; the affected
/// subscriber learns of them through these frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamMarker {
    /// The subscriber's buffer overflowed; `dropped` frames were discarded.
    #[serde(rename = "subscriber:lagged")]
    Lagged { dropped: u64 },
    /// Terminal: the subscriber exceeded the lag threshold and its sink is closed.
    #[serde(rename = "subscriber:evicted")]
    Evicted { reason: String },
}

/// The `{type, data}` envelope carrying a full operation state.
///
/// Sent on subscriber attach and on milestone events, so late subscribers
/// can reconstruct state without replaying the event history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SnapshotEnvelope {
    #[serde(rename = "operation:snapshot")]
    Operation(OperationState),
}

/// One push frame: what a subscriber's sink actually yields.
///
/// Plain events serialize flat (no envelope); snapshots and markers carry
/// a `type` discriminator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushFrame {
    Event(Event),
    Snapshot(SnapshotEnvelope),
    Marker(StreamMarker),
}

impl PushFrame {
    /// The event carried by this frame, if it is one.
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }

    /// Convenience for building a snapshot frame from an operation state.
    pub fn snapshot(state: OperationState) -> Self {
        Self::Snapshot(SnapshotEnvelope::Operation(state))
    }
}

impl From<Event> for PushFrame {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

impl From<StreamMarker> for PushFrame {
    fn from(marker: StreamMarker) -> Self {
        Self::Marker(marker)
    }
}
