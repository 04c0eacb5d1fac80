//! The stage contract: declarative inputs/outputs plus a work function.
//!
//! Stages declare what they read and produce as data tags; the scheduler
//! decides when they run. Progress flows through a [`ProgressSink`] so a
//! stage never talks to the broadcaster directly.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pulse_manifest::ManifestSnapshot;
use pulse_types::{DataTag, Event, EventKind, OperationMode};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::scope::{Clock, Scope};

/// Identity and window of the operation a stage runs inside.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub operation_id: String,
    pub mode: OperationMode,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub parameters: Map<String, Value>,
}

/// Everything a stage invocation may consult.
#[derive(Clone)]
pub struct StageContext {
    pub operation: OperationContext,
    /// The stage's own cancellation scope. Long-running work must observe it.
    pub scope: Scope,
    pub executable_dir: PathBuf,
    pub data_dir: PathBuf,
}

/// What a successful stage hands back to the runner.
#[derive(Clone, Debug, Default)]
pub struct StageOutcome {
    pub message: Option<String>,
    pub metadata: Map<String, Value>,
}

impl StageOutcome {
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A stage's terminal failure. `exit_code` is set for subprocess stages.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct StageFailure {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl StageFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}

/// A unit of work with declared data dependencies.
///
/// Registered once at startup; the registry rejects duplicate IDs and
/// duplicate producers at construction.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    /// Stage IDs used only for plan-order tie-breaking and documentation;
    /// data tags are authoritative.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn required_inputs(&self) -> Vec<DataTag> {
        Vec::new()
    }

    fn produced_outputs(&self) -> Vec<DataTag> {
        Vec::new()
    }

    /// Per-stage deadline override; the engine default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn can_run(&self, manifest: &ManifestSnapshot) -> bool {
        self.required_inputs().iter().all(|tag| manifest.has(tag))
    }

    async fn run(
        &self,
        ctx: StageContext,
        progress: ProgressSink,
    ) -> Result<StageOutcome, StageFailure>;
}

/// Wraps stage progress calls into `stage-progress` events.
///
/// Cancellation is observed before every publish: once the stage scope is
/// signalled, updates become no-ops so a winding-down stage cannot emit
/// after its terminal event.
#[derive(Clone)]
pub struct ProgressSink {
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    scope: Scope,
    operation_id: String,
    stage_id: String,
    trace_id: Uuid,
    completed_stages: usize,
    total_stages: usize,
}

impl ProgressSink {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        broadcaster: Broadcaster,
        clock: Arc<dyn Clock>,
        scope: Scope,
        operation_id: String,
        stage_id: String,
        trace_id: Uuid,
        completed_stages: usize,
        total_stages: usize,
    ) -> Self {
        Self {
            broadcaster,
            clock,
            scope,
            operation_id,
            stage_id,
            trace_id,
            completed_stages,
            total_stages,
        }
    }

    fn operation_percent(&self, stage_percent: u8) -> u8 {
        operation_percent(self.completed_stages, self.total_stages, stage_percent)
    }

    /// Publishes a stage-local progress percent with a message.
    pub async fn update(&self, percent: u8, message: impl Into<String>) {
        self.update_with(percent, message, Map::new()).await;
    }

    /// Publishes a progress percent with extra metadata attached.
    pub async fn update_with(
        &self,
        percent: u8,
        message: impl Into<String>,
        metadata: Map<String, Value>,
    ) {
        if self.scope.is_cancelled() {
            return;
        }
        let mut event = Event::new(
            EventKind::StageProgress,
            self.operation_id.clone(),
            self.trace_id,
            self.clock.now(),
        )
        .with_stage(self.stage_id.clone())
        .with_progress(percent)
        .with_message(message)
        .with_metadata("operation_percent", json!(self.operation_percent(percent)));
        for (key, value) in metadata {
            event = event.with_metadata(key, value);
        }
        self.broadcaster.publish(event).await;
    }

    /// Publishes a free-text line with no percent (subprocess plain output).
    pub async fn message(&self, message: impl Into<String>) {
        if self.scope.is_cancelled() {
            return;
        }
        let event = Event::new(
            EventKind::StageProgress,
            self.operation_id.clone(),
            self.trace_id,
            self.clock.now(),
        )
        .with_stage(self.stage_id.clone())
        .with_message(message);
        self.broadcaster.publish(event).await;
    }
}

/// Operation-level completion derived from a stage-local percent:
/// `floor((completed + percent/100) / total * 100)`.
pub(crate) fn operation_percent(completed_stages: usize, total_stages: usize, stage_percent: u8) -> u8 {
    if total_stages == 0 {
        return 0;
    }
    let done = completed_stages as f64 + f64::from(stage_percent.min(100)) / 100.0;
    (done / total_stages as f64 * 100.0).floor() as u8
}

type StageFuture = Pin<Box<dyn Future<Output = Result<StageOutcome, StageFailure>> + Send>>;

/// In-process stage built from an async closure.
///
/// The standard way embedders (and tests) declare stages that do their
/// work inside this process rather than in an external executable.
pub struct FnStage {
    id: String,
    name: String,
    dependencies: Vec<String>,
    required: Vec<DataTag>,
    produced: Vec<DataTag>,
    timeout: Option<Duration>,
    run: Arc<dyn Fn(StageContext, ProgressSink) -> StageFuture + Send + Sync>,
}

impl FnStage {
    pub fn new<F, Fut>(id: impl Into<String>, run: F) -> Self
    where
        F: Fn(StageContext, ProgressSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StageOutcome, StageFailure>> + Send + 'static,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            dependencies: Vec::new(),
            required: Vec::new(),
            produced: Vec::new(),
            timeout: None,
            run: Arc::new(move |ctx, progress| -> StageFuture { Box::pin(run(ctx, progress)) }),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Declares a data tag this stage reads.
    pub fn requires(mut self, tag: DataTag) -> Self {
        self.required.push(tag);
        self
    }

    /// Declares a data tag this stage produces on success.
    pub fn produces(mut self, tag: DataTag) -> Self {
        self.produced.push(tag);
        self
    }

    /// Declares a tie-break ordering hint after another stage.
    pub fn after(mut self, stage_id: impl Into<String>) -> Self {
        self.dependencies.push(stage_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Stage for FnStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn required_inputs(&self) -> Vec<DataTag> {
        self.required.clone()
    }

    fn produced_outputs(&self) -> Vec<DataTag> {
        self.produced.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(
        &self,
        ctx: StageContext,
        progress: ProgressSink,
    ) -> Result<StageOutcome, StageFailure> {
        (self.run)(ctx, progress).await
    }
}
