//! The guarded container of per-operation state.
//!
//! All reads are snapshots; all writes go through the narrow mutators
//! below, which enforce the status transition DAG. By convention only the
//! scheduler worker owning an operation calls the mutators after insert,
//! so there is exactly one writer per entry.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use pulse_types::{OperationState, OperationStatus, StageResult};
use serde::Serialize;
use tracing::{debug, error};

use crate::error::EngineError;
use crate::scope::Scope;

struct LedgerEntry {
    state: OperationState,
    scope: Scope,
}

#[derive(Default)]
pub(crate) struct OperationLedger {
    entries: RwLock<HashMap<String, LedgerEntry>>,
}

impl OperationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-flight insert: fails while a non-terminal entry holds the
    /// ID. A terminal entry may be replaced (ID reuse after completion).
    pub fn insert(&self, state: OperationState, scope: Scope) -> Result<(), EngineError> {
        let mut entries = self.entries.write().expect("ledger lock");
        if let Some(existing) = entries.get(&state.id) {
            if !existing.state.status.is_terminal() {
                return Err(EngineError::DuplicateId {
                    id: state.id.clone(),
                });
            }
        }
        entries.insert(state.id.clone(), LedgerEntry { state, scope });
        Ok(())
    }

    pub fn snapshot(&self, id: &str) -> Option<OperationState> {
        self.entries
            .read()
            .expect("ledger lock")
            .get(id)
            .map(|entry| entry.state.clone())
    }

    /// Snapshots of every known operation, oldest first.
    pub fn snapshots(&self) -> Vec<OperationState> {
        let mut states: Vec<OperationState> = self
            .entries
            .read()
            .expect("ledger lock")
            .values()
            .map(|entry| entry.state.clone())
            .collect();
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        states
    }

    pub fn scope_of(&self, id: &str) -> Option<Scope> {
        self.entries
            .read()
            .expect("ledger lock")
            .get(id)
            .map(|entry| entry.scope.clone())
    }

    fn mutate<R>(&self, id: &str, apply: impl FnOnce(&mut OperationState) -> R) -> Option<R> {
        let mut entries = self.entries.write().expect("ledger lock");
        entries.get_mut(id).map(|entry| apply(&mut entry.state))
    }

    /// `pending → running`. Returns `false` when the entry is missing or
    /// no longer pending (cancelled before its worker started).
    pub fn mark_running(&self, id: &str, at: DateTime<Utc>) -> bool {
        self.mutate(id, |state| {
            match state.status.transition_to(OperationStatus::Running) {
                Ok(next) => {
                    state.status = next;
                    state.started_at = Some(at);
                    true
                }
                Err(_) => false,
            }
        })
        .unwrap_or(false)
    }

    pub fn set_current_stage(&self, id: &str, stage_id: Option<String>) {
        self.mutate(id, |state| {
            state.current_stage_id = stage_id;
        });
    }

    pub fn push_stage_result(&self, id: &str, result: StageResult) {
        self.mutate(id, |state| {
            state.stage_results.push(result);
        });
    }

    /// Moves the operation to a terminal status, recording the end time
    /// and last error. First terminal wins: a second call is a no-op.
    ///
    /// Returns the final state for the milestone snapshot frame.
    pub fn finish(
        &self,
        id: &str,
        status: OperationStatus,
        last_error: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<OperationState> {
        self.mutate(id, |state| {
            if state.status.is_terminal() {
                debug!(operation = id, status = %state.status, "finish on terminal operation ignored");
                return None;
            }
            match state.status.transition_to(status) {
                Ok(next) => {
                    state.status = next;
                    state.ended_at = Some(at);
                    state.current_stage_id = None;
                    state.last_error = last_error;
                    Some(state.clone())
                }
                Err(violation) => {
                    // Single-writer discipline should make this unreachable.
                    error!(operation = id, %violation, "rejected status transition");
                    debug_assert!(false, "rejected status transition: {violation}");
                    None
                }
            }
        })
        .flatten()
    }

    pub fn metrics(&self) -> OperationMetrics {
        let entries = self.entries.read().expect("ledger lock");
        let mut metrics = OperationMetrics {
            total: entries.len(),
            ..OperationMetrics::default()
        };
        for entry in entries.values() {
            match entry.state.status {
                OperationStatus::Pending => metrics.pending += 1,
                OperationStatus::Running => metrics.running += 1,
                OperationStatus::Completed => metrics.completed += 1,
                OperationStatus::Failed => metrics.failed += 1,
                OperationStatus::Cancelled => metrics.cancelled += 1,
            }
        }
        metrics
    }
}

/// Operation counts by status at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OperationMetrics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}
