//! The per-process facade over the operations engine.
//!
//! The manager accepts requests, enforces single-flight per operation ID,
//! caps cross-operation parallelism, answers status queries from ledger
//! snapshots, and owns the root cancellation scope. It never mutates
//! stage internals: after spawn, an operation belongs to its scheduler
//! worker until the terminal state.

use std::sync::Arc;

use pulse_manifest::{DataLayout, Manifest};
use pulse_types::{OperationRequest, OperationState, OperationStatus, PushFrame};
use tokio::sync::Semaphore;
use tracing::info;
use uuid::Uuid;

use crate::broadcaster::{Broadcaster, EventFilter, Subscription};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ledger::{OperationLedger, OperationMetrics};
use crate::registry::Registry;
use crate::runner::StageRunner;
use crate::scheduler::Scheduler;
use crate::scope::{Clock, Scope, SystemClock};
use crate::stage::OperationContext;

/// Pre-`execute` gate (license validation, quotas).
///
/// An external collaborator: the engine only calls `admit` and surfaces a
/// refusal as [`EngineError::AdmissionDenied`].
pub trait AdmissionGate: Send + Sync {
    fn admit(&self, request: &OperationRequest) -> Result<(), String>;
}

/// Assembles a [`Manager`] with optional overrides.
pub struct ManagerBuilder {
    config: EngineConfig,
    registry: Registry,
    manifest: Manifest,
    clock: Arc<dyn Clock>,
    gate: Option<Arc<dyn AdmissionGate>>,
}

impl ManagerBuilder {
    pub fn new(config: EngineConfig, registry: Registry, manifest: Manifest) -> Self {
        Self {
            config,
            registry,
            manifest,
            clock: Arc::new(SystemClock),
            gate: None,
        }
    }

    /// Overrides the wall-clock source (tests pin timestamps this way).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Builds the manager. Must be called within a tokio runtime: the
    /// broadcaster's publisher task starts here.
    pub fn build(self) -> Manager {
        let broadcaster = Broadcaster::new(self.config.subscriber_buffer_depth);
        let ledger = Arc::new(OperationLedger::new());
        let registry = Arc::new(self.registry);
        let manifest = Arc::new(self.manifest);
        let runner = StageRunner::new(
            broadcaster.clone(),
            Arc::clone(&manifest),
            Arc::clone(&self.clock),
            self.config.executable_dir.clone(),
            self.config.data_dir.clone(),
            self.config.default_stage_timeout(),
            self.config.subprocess_grace_period(),
        );
        let scheduler = Arc::new(Scheduler::new(
            registry,
            manifest,
            broadcaster.clone(),
            Arc::clone(&ledger),
            runner,
            Arc::clone(&self.clock),
        ));
        Manager {
            inner: Arc::new(ManagerInner {
                permits: Arc::new(Semaphore::new(self.config.max_concurrent_operations.max(1))),
                config: self.config,
                scheduler,
                broadcaster,
                ledger,
                clock: self.clock,
                root_scope: Scope::root(),
                gate: self.gate,
            }),
        }
    }
}

struct ManagerInner {
    config: EngineConfig,
    scheduler: Arc<Scheduler>,
    broadcaster: Broadcaster,
    ledger: Arc<OperationLedger>,
    clock: Arc<dyn Clock>,
    root_scope: Scope,
    permits: Arc<Semaphore>,
    gate: Option<Arc<dyn AdmissionGate>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // Tears down every in-flight operation with the process facade.
        self.root_scope.cancel();
    }
}

/// Cloneable handle to the engine facade.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    pub fn new(config: EngineConfig, registry: Registry, manifest: Manifest) -> Self {
        ManagerBuilder::new(config, registry, manifest).build()
    }

    /// A manager whose manifest projects the standard output layout
    /// rooted at `config.data_dir`.
    pub fn with_standard_layout(config: EngineConfig, registry: Registry) -> Self {
        let manifest = Manifest::new(DataLayout::under(&config.data_dir).resolvers());
        Self::new(config, registry, manifest)
    }

    pub fn builder(config: EngineConfig, registry: Registry, manifest: Manifest) -> ManagerBuilder {
        ManagerBuilder::new(config, registry, manifest)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validates and accepts a request, returning the operation ID
    /// immediately; the operation itself runs on a spawned worker.
    ///
    /// Fails with [`EngineError::DuplicateId`] while an operation with the
    /// same ID is non-terminal, and with [`EngineError::MissingInput`] /
    /// [`EngineError::NotFound`] for unsatisfiable single-stage requests.
    pub fn execute(&self, request: OperationRequest) -> Result<String, EngineError> {
        let inner = &self.inner;
        if let Some(gate) = &inner.gate {
            gate.admit(&request)
                .map_err(|reason| EngineError::AdmissionDenied { reason })?;
        }

        let plan = inner.scheduler.plan(&request)?;
        let id = match request.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let trace_id = Uuid::new_v4();
        let scope = inner.root_scope.child();
        inner
            .ledger
            .insert(
                OperationState::new(id.as_str(), inner.clock.now(), trace_id),
                scope.clone(),
            )?;
        info!(operation = %id, stages = ?plan.stage_ids(), "operation accepted");

        let full_pipeline = request.target_stage().is_none();
        let operation = OperationContext {
            operation_id: id.clone(),
            mode: request.mode,
            from_date: request.from_date.or_else(|| {
                full_pipeline
                    .then_some(inner.config.full_pipeline_default_from)
                    .flatten()
            }),
            to_date: request.to_date.or_else(|| {
                full_pipeline
                    .then_some(inner.config.full_pipeline_default_to)
                    .flatten()
            }),
            parameters: request.parameters,
        };

        let scheduler = Arc::clone(&inner.scheduler);
        let permits = Arc::clone(&inner.permits);
        tokio::spawn(async move {
            // Wait for a concurrency slot, but stay responsive to
            // cancellation while still pending.
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = scope.cancelled() => None,
            };
            scheduler.run_operation(operation, plan, scope, trace_id).await;
        });
        Ok(id)
    }

    /// A defensive snapshot of the operation state.
    pub fn get(&self, id: &str) -> Result<OperationState, EngineError> {
        self.inner
            .ledger
            .snapshot(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    /// Snapshots of every known operation, oldest first.
    pub fn list(&self) -> Vec<OperationState> {
        self.inner.ledger.snapshots()
    }

    pub fn list_by_status(&self, status: OperationStatus) -> Vec<OperationState> {
        self.inner
            .ledger
            .snapshots()
            .into_iter()
            .filter(|state| state.status == status)
            .collect()
    }

    /// Signals the operation's cancellation scope. Idempotent while the
    /// operation is live; [`EngineError::AlreadyFinished`] afterwards.
    pub fn cancel(&self, id: &str) -> Result<(), EngineError> {
        let state = self.get(id)?;
        if state.status.is_terminal() {
            return Err(EngineError::AlreadyFinished { id: id.to_string() });
        }
        if let Some(scope) = self.inner.ledger.scope_of(id) {
            scope.cancel();
        }
        info!(operation = %id, "cancellation requested");
        Ok(())
    }

    pub fn metrics(&self) -> OperationMetrics {
        self.inner.ledger.metrics()
    }

    /// Attaches a subscriber, seeding it with `operation:snapshot` frames
    /// for every matching non-terminal operation.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let seeds: Vec<PushFrame> = self
            .inner
            .ledger
            .snapshots()
            .into_iter()
            .filter(|state| !state.status.is_terminal())
            .filter(|state| filter.matches_operation_id(&state.id))
            .map(PushFrame::snapshot)
            .collect();
        self.inner.broadcaster.subscribe_seeded(filter, seeds)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulse_manifest::TagInfo;
    use pulse_types::{DataTag, Event, EventKind, OperationMode, StageStatus};
    use serde_json::json;

    use super::*;
    use crate::registry::RegistryBuilder;
    use crate::stage::{FnStage, StageFailure, StageOutcome};

    fn quick(id: &str) -> FnStage {
        FnStage::new(id, |_ctx, progress| async move {
            progress.update(50, "working").await;
            Ok(StageOutcome::default())
        })
    }

    fn pipeline_registry() -> Registry {
        registry_with_process(quick("process"))
    }

    /// The standard four-stage tag graph with a replaceable `process`.
    fn registry_with_process(process: FnStage) -> Registry {
        let mut builder = RegistryBuilder::new();
        builder
            .register(quick("scrape").produces(DataTag::excel_files()))
            .unwrap();
        builder
            .register(
                process
                    .requires(DataTag::excel_files())
                    .produces(DataTag::csv_files()),
            )
            .unwrap();
        builder
            .register(
                quick("index")
                    .requires(DataTag::csv_files())
                    .produces(DataTag::index_data()),
            )
            .unwrap();
        builder
            .register(
                quick("liquidity")
                    .requires(DataTag::csv_files())
                    .produces(DataTag::liquidity_data()),
            )
            .unwrap();
        builder.build().unwrap()
    }

    fn manager_over(registry: Registry, manifest: Manifest) -> Manager {
        let config = EngineConfig {
            default_stage_timeout_seconds: 5,
            ..EngineConfig::default()
        };
        Manager::new(config, registry, manifest)
    }

    fn initial_request() -> OperationRequest {
        OperationRequest::new(OperationMode::Initial).with_window(
            chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        )
    }

    async fn await_terminal(manager: &Manager, id: &str) -> OperationState {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let state = manager.get(id).unwrap();
                if state.status.is_terminal() {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("operation did not reach a terminal state in time")
    }

    /// Drains the subscription until the operation's terminal event,
    /// returning the events (snapshot frames are skipped).
    async fn events_until_terminal(subscription: &mut Subscription) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
                .await
                .expect("event stream stalled")
                .expect("stream closed before the terminal event");
            if let PushFrame::Event(event) = frame {
                let terminal = event.kind.is_operation_terminal();
                events.push(event);
                if terminal {
                    return events;
                }
            }
        }
    }

    fn kinds_and_stages(events: &[Event]) -> Vec<(EventKind, Option<&str>)> {
        events
            .iter()
            .map(|event| (event.kind, event.stage_id.as_deref()))
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn happy_full_pipeline_from_an_empty_manifest() {
        let manager = manager_over(pipeline_registry(), Manifest::new(Vec::new()));
        let mut subscription = manager.subscribe(EventFilter::All);

        let id = manager.execute(initial_request()).unwrap();
        let state = await_terminal(&manager, &id).await;

        assert_eq!(state.status, OperationStatus::Completed);
        assert_eq!(state.stage_results.len(), 4);
        assert!(
            state
                .stage_results
                .iter()
                .all(|result| result.status == StageStatus::Succeeded)
        );
        assert!(state.started_at.is_some());
        assert!(state.ended_at.is_some());
        assert!(state.last_error.is_none());

        let events = events_until_terminal(&mut subscription).await;
        let expected: Vec<(EventKind, Option<&str>)> = vec![
            (EventKind::OperationStarted, None),
            (EventKind::StageStarted, Some("scrape")),
            (EventKind::StageProgress, Some("scrape")),
            (EventKind::StageCompleted, Some("scrape")),
            (EventKind::StageStarted, Some("process")),
            (EventKind::StageProgress, Some("process")),
            (EventKind::StageCompleted, Some("process")),
            (EventKind::StageStarted, Some("index")),
            (EventKind::StageProgress, Some("index")),
            (EventKind::StageCompleted, Some("index")),
            (EventKind::StageStarted, Some("liquidity")),
            (EventKind::StageProgress, Some("liquidity")),
            (EventKind::StageCompleted, Some("liquidity")),
            (EventKind::OperationCompleted, None),
        ];
        similar_asserts::assert_eq!(kinds_and_stages(&events), expected);

        // One trace ID threads through the whole operation.
        assert!(events.iter().all(|event| event.trace_id == state.trace_id));
    }

    #[tokio::test]
    async fn resume_skips_stages_whose_outputs_already_exist() {
        let manifest = Manifest::new(Vec::new());
        manifest.record(
            DataTag::excel_files(),
            TagInfo::present_at("/data/downloads", chrono::Utc::now()),
        );
        manifest.record(
            DataTag::csv_files(),
            TagInfo::present_at("/data/reports", chrono::Utc::now()),
        );
        let manager = manager_over(pipeline_registry(), manifest);

        let id = manager.execute(initial_request()).unwrap();
        let state = await_terminal(&manager, &id).await;

        assert_eq!(state.status, OperationStatus::Completed);
        assert_eq!(
            state.stage_result("scrape").unwrap().status,
            StageStatus::Skipped
        );
        assert_eq!(
            state.stage_result("process").unwrap().status,
            StageStatus::Skipped
        );
        assert_eq!(
            state.stage_result("index").unwrap().status,
            StageStatus::Succeeded
        );
        assert_eq!(
            state.stage_result("liquidity").unwrap().status,
            StageStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn skipped_stage_records_its_missing_inputs() {
        // Only `index` in the plan, with nothing satisfying csv_files and
        // no producer registered to autowire.
        let mut builder = RegistryBuilder::new();
        builder
            .register(quick("index").requires(DataTag::csv_files()))
            .unwrap();
        let manager = manager_over(builder.build().unwrap(), Manifest::new(Vec::new()));

        let id = manager.execute(initial_request()).unwrap();
        let state = await_terminal(&manager, &id).await;

        // A skip is a valid way to complete; nothing failed.
        assert_eq!(state.status, OperationStatus::Completed);
        let result = state.stage_result("index").unwrap();
        assert_eq!(result.status, StageStatus::Skipped);
        assert_eq!(result.message.as_deref(), Some("missing-inputs"));
        assert_eq!(result.metadata["missing_inputs"], json!(["csv_files"]));
    }

    #[tokio::test]
    async fn mid_stage_cancellation_stops_the_pipeline() {
        let blocking_process = FnStage::new("process", |ctx, _progress| async move {
            ctx.scope.cancelled().await;
            Err(StageFailure::new("interrupted"))
        });
        let manager = manager_over(
            registry_with_process(blocking_process),
            Manifest::new(Vec::new()),
        );
        let mut subscription = manager.subscribe(EventFilter::All);

        let id = manager.execute(initial_request()).unwrap();

        // Wait for the process stage to actually start, then cancel.
        loop {
            let frame = subscription.recv().await.unwrap();
            if let Some(event) = frame.as_event() {
                if event.kind == EventKind::StageStarted
                    && event.stage_id.as_deref() == Some("process")
                {
                    break;
                }
            }
        }
        manager.cancel(&id).unwrap();

        let state = await_terminal(&manager, &id).await;
        assert_eq!(state.status, OperationStatus::Cancelled);
        assert_eq!(
            state.stage_result("scrape").unwrap().status,
            StageStatus::Succeeded
        );
        assert_eq!(
            state.stage_result("process").unwrap().status,
            StageStatus::Failed
        );
        assert!(state.stage_result("index").is_none());
        assert!(state.stage_result("liquidity").is_none());

        // Cancel on a terminal operation is an explicit error.
        assert_eq!(
            manager.cancel(&id).unwrap_err(),
            EngineError::AlreadyFinished { id: id.clone() }
        );
    }

    #[tokio::test]
    async fn stage_failure_halts_the_pipeline() {
        let failing_process = FnStage::new("process", |_ctx, _progress| async move {
            Err(StageFailure::new("malformed row 42"))
        });
        let manager = manager_over(
            registry_with_process(failing_process),
            Manifest::new(Vec::new()),
        );
        let mut subscription = manager.subscribe(EventFilter::All);

        let id = manager.execute(initial_request()).unwrap();
        let state = await_terminal(&manager, &id).await;

        assert_eq!(state.status, OperationStatus::Failed);
        assert!(state.last_error.as_deref().unwrap().contains("malformed row 42"));
        assert_eq!(state.stage_results.len(), 2);
        assert!(state.stage_result("index").is_none());

        let events = events_until_terminal(&mut subscription).await;
        let tail: Vec<(EventKind, Option<&str>)> = kinds_and_stages(&events)
            .into_iter()
            .rev()
            .take(2)
            .collect();
        assert_eq!(
            tail,
            vec![
                (EventKind::OperationFailed, None),
                (EventKind::StageFailed, Some("process")),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_id_is_single_flight_until_terminal() {
        let manager = manager_over(pipeline_registry(), Manifest::new(Vec::new()));

        let id = manager
            .execute(initial_request().with_id("op-fixed"))
            .unwrap();
        assert_eq!(id, "op-fixed");
        assert_eq!(
            manager
                .execute(initial_request().with_id("op-fixed"))
                .unwrap_err(),
            EngineError::DuplicateId {
                id: "op-fixed".to_string()
            }
        );

        await_terminal(&manager, &id).await;
        // The ID is reusable once the first run is terminal.
        manager
            .execute(initial_request().with_id("op-fixed"))
            .unwrap();
        await_terminal(&manager, "op-fixed").await;
    }

    #[tokio::test]
    async fn pending_operation_cancels_without_ever_running() {
        let slow_process = FnStage::new("process", |ctx, _progress| async move {
            // Holds the only concurrency slot until cancelled.
            ctx.scope.cancelled().await;
            Err(StageFailure::new("interrupted"))
        });
        let config = EngineConfig {
            max_concurrent_operations: 1,
            ..EngineConfig::default()
        };
        let manager = Manager::new(
            config,
            registry_with_process(slow_process),
            Manifest::new(Vec::new()),
        );

        let first = manager.execute(initial_request()).unwrap();
        // Give the first worker time to claim the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = manager.execute(initial_request()).unwrap();
        assert_eq!(
            manager.get(&second).unwrap().status,
            OperationStatus::Pending
        );

        manager.cancel(&second).unwrap();
        let state = await_terminal(&manager, &second).await;
        assert_eq!(state.status, OperationStatus::Cancelled);
        assert!(state.started_at.is_none());
        assert!(state.stage_results.is_empty());

        manager.cancel(&first).unwrap();
        await_terminal(&manager, &first).await;
    }

    #[tokio::test]
    async fn get_round_trips_and_unknown_ids_are_not_found() {
        let manager = manager_over(pipeline_registry(), Manifest::new(Vec::new()));

        let before = chrono::Utc::now();
        let id = manager.execute(initial_request()).unwrap();
        let state = manager.get(&id).unwrap();
        assert_eq!(state.id, id);
        assert!(state.created_at >= before - chrono::Duration::seconds(1));
        assert!(state.created_at <= chrono::Utc::now());

        assert_eq!(
            manager.get("unknown").unwrap_err(),
            EngineError::NotFound {
                id: "unknown".to_string()
            }
        );
        assert_eq!(
            manager.cancel("unknown").unwrap_err(),
            EngineError::NotFound {
                id: "unknown".to_string()
            }
        );

        await_terminal(&manager, &id).await;
    }

    #[tokio::test]
    async fn metrics_and_listings_reflect_terminal_states() {
        let manager = manager_over(pipeline_registry(), Manifest::new(Vec::new()));

        let a = manager.execute(initial_request()).unwrap();
        let b = manager.execute(initial_request()).unwrap();
        await_terminal(&manager, &a).await;
        await_terminal(&manager, &b).await;

        let metrics = manager.metrics();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.completed, 2);
        assert_eq!(manager.list().len(), 2);
        assert_eq!(
            manager.list_by_status(OperationStatus::Completed).len(),
            2
        );
        assert!(manager.list_by_status(OperationStatus::Failed).is_empty());
    }

    #[tokio::test]
    async fn standard_layout_probes_files_stages_actually_write() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };

        let mut builder = RegistryBuilder::new();
        builder
            .register(
                FnStage::new("scrape", |ctx, _progress| async move {
                    let downloads = ctx.data_dir.join("downloads");
                    std::fs::create_dir_all(&downloads)
                        .map_err(|err| StageFailure::new(err.to_string()))?;
                    std::fs::write(
                        downloads.join("2025 01 15 ISX Daily Report.xlsx"),
                        b"workbook",
                    )
                    .map_err(|err| StageFailure::new(err.to_string()))?;
                    Ok(StageOutcome::default())
                })
                .produces(DataTag::excel_files()),
            )
            .unwrap();
        builder
            .register(
                FnStage::new("process", |ctx, _progress| async move {
                    let workbook = ctx
                        .data_dir
                        .join("downloads")
                        .join("2025 01 15 ISX Daily Report.xlsx");
                    if !workbook.exists() {
                        return Err(StageFailure::new("input workbook missing"));
                    }
                    Ok(StageOutcome::default())
                })
                .requires(DataTag::excel_files()),
            )
            .unwrap();

        let manager = Manager::with_standard_layout(config, builder.build().unwrap());
        let id = manager.execute(initial_request()).unwrap();
        let state = await_terminal(&manager, &id).await;

        assert_eq!(state.status, OperationStatus::Completed);
        assert_eq!(state.stage_results.len(), 2);
    }

    #[tokio::test]
    async fn admission_gate_refuses_before_any_state_exists() {
        struct DenyAll;
        impl AdmissionGate for DenyAll {
            fn admit(&self, _request: &OperationRequest) -> Result<(), String> {
                Err("license expired".to_string())
            }
        }

        let manager = Manager::builder(
            EngineConfig::default(),
            pipeline_registry(),
            Manifest::new(Vec::new()),
        )
        .gate(Arc::new(DenyAll))
        .build();

        let err = manager
            .execute(initial_request().with_id("gated"))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::AdmissionDenied {
                reason: "license expired".to_string()
            }
        );
        assert!(manager.get("gated").is_err());
    }

    #[tokio::test]
    async fn operation_filtered_subscriber_sees_only_its_operation() {
        let manager = manager_over(pipeline_registry(), Manifest::new(Vec::new()));

        let mut subscription =
            manager.subscribe(EventFilter::Operation("watched".to_string()));
        let watched = manager
            .execute(initial_request().with_id("watched"))
            .unwrap();
        let _other = manager.execute(initial_request()).unwrap();

        let events = events_until_terminal(&mut subscription).await;
        assert!(!events.is_empty());
        assert!(events.iter().all(|event| event.operation_id == watched));

        await_terminal(&manager, &watched).await;
    }

    #[tokio::test]
    async fn late_subscriber_is_seeded_with_a_snapshot() {
        let blocking_process = FnStage::new("process", |ctx, _progress| async move {
            ctx.scope.cancelled().await;
            Err(StageFailure::new("interrupted"))
        });
        let manager = manager_over(
            registry_with_process(blocking_process),
            Manifest::new(Vec::new()),
        );

        let id = manager.execute(initial_request()).unwrap();
        // Let the operation get under way before attaching.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut subscription = manager.subscribe(EventFilter::Operation(id.clone()));
        let frame = subscription.recv().await.unwrap();
        match frame {
            PushFrame::Snapshot(pulse_types::SnapshotEnvelope::Operation(state)) => {
                assert_eq!(state.id, id);
                assert_eq!(state.status, OperationStatus::Running);
            }
            other => panic!("expected seeded snapshot, got {other:?}"),
        }

        manager.cancel(&id).unwrap();
        await_terminal(&manager, &id).await;
    }
}
