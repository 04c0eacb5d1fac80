//! Plan construction and the sequential data-gating loop.
//!
//! A plan is either the full pipeline or a named stage plus the
//! unsatisfied transitive producers of its inputs. Execution is strictly
//! sequential: gate on the manifest, run through the runner, stop on the
//! first failure, observe cancellation between stages. Skipped stages are
//! recorded but never revisited within the same operation.

use std::collections::HashSet;
use std::sync::Arc;

use pulse_manifest::{Manifest, ManifestSnapshot};
use pulse_types::{
    Event, EventKind, OperationRequest, OperationStatus, StageResult, StageStatus,
};
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::error::EngineError;
use crate::ledger::OperationLedger;
use crate::registry::Registry;
use crate::runner::StageRunner;
use crate::scope::{Clock, Scope};
use crate::stage::{OperationContext, Stage};

/// The ordered stage list one operation will walk.
pub(crate) struct Plan {
    stages: Vec<Arc<dyn Stage>>,
    /// Set for single-stage requests: the named stage always runs, even
    /// when its outputs already exist.
    target: Option<String>,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("stage_ids", &self.stage_ids())
            .field("target", &self.target)
            .finish()
    }
}

impl Plan {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id()).collect()
    }
}

/// Computes the plan implied by a request against a manifest snapshot.
///
/// Full pipeline: every registered stage in plan order. Named stage: the
/// stage plus, when autowiring, the unsatisfied transitive producers of
/// its required inputs; with autowiring off, absent inputs are the
/// caller's error ([`EngineError::MissingInput`]).
pub(crate) fn build_plan(
    registry: &Registry,
    snapshot: &ManifestSnapshot,
    request: &OperationRequest,
) -> Result<Plan, EngineError> {
    let Some(target) = request.target_stage() else {
        let all: HashSet<String> = registry.stages().iter().map(|s| s.id().to_string()).collect();
        return Ok(Plan {
            stages: registry.plan_order(&all)?,
            target: None,
        });
    };

    let stage = registry.get(target).ok_or_else(|| EngineError::NotFound {
        id: target.to_string(),
    })?;

    if !request.autowire() {
        let missing = snapshot.missing(&stage.required_inputs());
        if !missing.is_empty() {
            return Err(EngineError::MissingInput {
                stage_id: target.to_string(),
                tags: missing,
            });
        }
        return Ok(Plan {
            stages: vec![Arc::clone(stage)],
            target: Some(target.to_string()),
        });
    }

    // Autowire: pull in producers of absent inputs, transitively.
    let mut members: HashSet<String> = HashSet::from([target.to_string()]);
    let mut pending: Vec<Arc<dyn Stage>> = vec![Arc::clone(stage)];
    while let Some(stage) = pending.pop() {
        for tag in stage.required_inputs() {
            if snapshot.has(&tag) {
                continue;
            }
            let Some(producer) = registry.producer_of(&tag) else {
                continue;
            };
            if members.insert(producer.id().to_string()) {
                pending.push(Arc::clone(producer));
            }
        }
    }

    Ok(Plan {
        stages: registry.plan_order(&members)?,
        target: Some(target.to_string()),
    })
}

pub(crate) struct Scheduler {
    registry: Arc<Registry>,
    manifest: Arc<Manifest>,
    broadcaster: Broadcaster,
    ledger: Arc<OperationLedger>,
    runner: StageRunner,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        manifest: Arc<Manifest>,
        broadcaster: Broadcaster,
        ledger: Arc<OperationLedger>,
        runner: StageRunner,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            manifest,
            broadcaster,
            ledger,
            runner,
            clock,
        }
    }

    pub fn plan(&self, request: &OperationRequest) -> Result<Plan, EngineError> {
        build_plan(&self.registry, &self.manifest.snapshot(), request)
    }

    /// The operation worker body. Owns every mutation of this operation's
    /// ledger entry from here to the terminal state.
    pub async fn run_operation(
        &self,
        operation: OperationContext,
        plan: Plan,
        scope: Scope,
        trace_id: Uuid,
    ) {
        let id = operation.operation_id.clone();

        if scope.is_cancelled() {
            self.finish(
                &id,
                trace_id,
                OperationStatus::Cancelled,
                EventKind::OperationCancelled,
                Some("cancelled before start".to_string()),
            )
            .await;
            return;
        }
        if !self.ledger.mark_running(&id, self.clock.now()) {
            debug!(operation = %id, "worker found no pending entry; nothing to run");
            return;
        }

        info!(operation = %id, stages = plan.len(), "operation started");
        self.broadcaster
            .publish(Event::new(
                EventKind::OperationStarted,
                id.clone(),
                trace_id,
                self.clock.now(),
            ))
            .await;
        if let Some(state) = self.ledger.snapshot(&id) {
            self.broadcaster.publish_snapshot(state).await;
        }

        let total = plan.len();
        let mut completed = 0usize;
        let mut terminal: Option<(OperationStatus, EventKind, Option<String>)> = None;

        for stage in &plan.stages {
            if scope.is_cancelled() {
                terminal = Some((
                    OperationStatus::Cancelled,
                    EventKind::OperationCancelled,
                    Some(EngineError::Cancelled.to_string()),
                ));
                break;
            }

            let snapshot = self.manifest.snapshot();
            let is_target = plan.target.as_deref() == Some(stage.id());
            if let Some(result) = self.skip_reason(stage, &snapshot, is_target) {
                self.ledger.push_stage_result(&id, result);
                completed += 1;
                continue;
            }

            self.ledger
                .set_current_stage(&id, Some(stage.id().to_string()));
            let run = self
                .runner
                .run_stage(stage, &operation, &scope, trace_id, completed, total)
                .await;
            self.ledger.set_current_stage(&id, None);

            let status = run.result.status;
            let message = run.result.message.clone();
            let exit_code = run
                .result
                .metadata
                .get("exit_code")
                .and_then(Value::as_i64)
                .map(|code| code as i32);
            self.ledger.push_stage_result(&id, run.result);

            if run.cancelled {
                terminal = Some((
                    OperationStatus::Cancelled,
                    EventKind::OperationCancelled,
                    message,
                ));
                break;
            }
            match status {
                StageStatus::Succeeded | StageStatus::Skipped => completed += 1,
                StageStatus::Failed => {
                    let error = EngineError::StageFailed {
                        stage_id: stage.id().to_string(),
                        exit_code,
                        message: message.unwrap_or_default(),
                    };
                    terminal = Some((
                        OperationStatus::Failed,
                        EventKind::OperationFailed,
                        Some(error.to_string()),
                    ));
                    break;
                }
            }
        }

        let (status, kind, error) = terminal.unwrap_or((
            OperationStatus::Completed,
            EventKind::OperationCompleted,
            None,
        ));
        self.finish(&id, trace_id, status, kind, error).await;
    }

    /// Decides whether a stage is skipped at its turn in plan order:
    /// absent inputs always skip; already-satisfied outputs skip unless
    /// the stage is the request's explicit target.
    fn skip_reason(
        &self,
        stage: &Arc<dyn Stage>,
        snapshot: &ManifestSnapshot,
        is_target: bool,
    ) -> Option<StageResult> {
        let now = self.clock.now();

        if !stage.can_run(snapshot) {
            let missing: Vec<String> = snapshot
                .missing(&stage.required_inputs())
                .iter()
                .map(|tag| tag.to_string())
                .collect();
            debug!(stage = %stage.id(), ?missing, "skipping stage: missing inputs");
            return Some(
                StageResult::new(stage.id(), StageStatus::Skipped, now, now)
                    .with_message("missing-inputs")
                    .with_metadata("missing_inputs", json!(missing)),
            );
        }

        let outputs = stage.produced_outputs();
        if !is_target && !outputs.is_empty() && outputs.iter().all(|tag| snapshot.has(tag)) {
            debug!(stage = %stage.id(), "skipping stage: outputs already satisfied");
            return Some(
                StageResult::new(stage.id(), StageStatus::Skipped, now, now)
                    .with_message("outputs already satisfied"),
            );
        }

        None
    }

    async fn finish(
        &self,
        id: &str,
        trace_id: Uuid,
        status: OperationStatus,
        kind: EventKind,
        error: Option<String>,
    ) {
        let final_state = self
            .ledger
            .finish(id, status, error.clone(), self.clock.now());

        let mut event = Event::new(kind, id, trace_id, self.clock.now());
        if let Some(message) = error {
            event = event.with_message(message);
        }
        self.broadcaster.publish(event).await;
        if let Some(state) = final_state {
            self.broadcaster.publish_snapshot(state).await;
        }
        info!(operation = %id, status = %status, "operation finished");
    }
}
