//! Supervises one stage invocation.
//!
//! The runner owns the stage lifecycle events: it publishes
//! `stage-started` before handing control to the stage and exactly one
//! terminal stage event after, synthesising the terminal when the stage
//! ends abnormally (panic, timeout, abandoned cancellation). The stage
//! itself only ever emits progress.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pulse_manifest::{Manifest, TagInfo};
use pulse_types::{Event, EventKind, StageResult, StageStatus};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::error::EngineError;
use crate::scope::{Clock, Scope};
use crate::stage::{OperationContext, ProgressSink, Stage, StageContext, StageFailure};

/// Extra slack past the grace period before an unresponsive stage is
/// abandoned (detached, not joined).
const ABANDON_SLACK: Duration = Duration::from_secs(5);

/// Outcome of one supervised stage invocation.
pub(crate) struct StageRun {
    pub result: StageResult,
    /// Set when the invocation ended because the operation scope was
    /// signalled; the scheduler turns this into `cancelled`, not `failed`.
    pub cancelled: bool,
}

pub(crate) struct StageRunner {
    broadcaster: Broadcaster,
    manifest: Arc<Manifest>,
    clock: Arc<dyn Clock>,
    executable_dir: PathBuf,
    data_dir: PathBuf,
    default_timeout: Duration,
    grace_period: Duration,
}

enum Verdict {
    Finished(Result<crate::stage::StageOutcome, StageFailure>),
    TimedOut,
    Cancelled(Option<StageFailure>),
    Abandoned,
}

impl StageRunner {
    pub fn new(
        broadcaster: Broadcaster,
        manifest: Arc<Manifest>,
        clock: Arc<dyn Clock>,
        executable_dir: PathBuf,
        data_dir: PathBuf,
        default_timeout: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            broadcaster,
            manifest,
            clock,
            executable_dir,
            data_dir,
            default_timeout,
            grace_period,
        }
    }

    fn event(&self, kind: EventKind, operation_id: &str, stage_id: &str, trace_id: Uuid) -> Event {
        Event::new(kind, operation_id, trace_id, self.clock.now()).with_stage(stage_id)
    }

    /// Runs one stage on its own task and maps every way it can end into a
    /// [`StageResult`]. The spawned task isolates panics and lets an
    /// unresponsive stage be abandoned without wedging the operation worker.
    pub async fn run_stage(
        &self,
        stage: &Arc<dyn Stage>,
        operation: &OperationContext,
        op_scope: &Scope,
        trace_id: Uuid,
        completed_stages: usize,
        total_stages: usize,
    ) -> StageRun {
        let stage_id = stage.id().to_string();
        let operation_id = operation.operation_id.clone();
        let started_at = self.clock.now();
        let timeout = stage.timeout().unwrap_or(self.default_timeout);
        let stage_scope = op_scope.child_with_timeout(timeout);

        self.broadcaster
            .publish(
                self.event(EventKind::StageStarted, &operation_id, &stage_id, trace_id)
                    .with_message(stage.name().to_string()),
            )
            .await;

        let ctx = StageContext {
            operation: operation.clone(),
            scope: stage_scope.clone(),
            executable_dir: self.executable_dir.clone(),
            data_dir: self.data_dir.clone(),
        };
        let progress = ProgressSink::new(
            self.broadcaster.clone(),
            Arc::clone(&self.clock),
            stage_scope.clone(),
            operation_id.clone(),
            stage_id.clone(),
            trace_id,
            completed_stages,
            total_stages,
        );

        let task_stage = Arc::clone(stage);
        let mut handle = tokio::spawn(async move { task_stage.run(ctx, progress).await });
        let shutdown_window = self.grace_period + ABANDON_SLACK;

        let verdict = tokio::select! {
            joined = &mut handle => {
                // The stage task may observe the cancellation signal and
                // finish before this select polls the cancelled arm;
                // classify a post-cancellation failure as cancelled, not
                // failed. A success stands: the work is done.
                match (Self::map_join(joined), op_scope.is_cancelled()) {
                    (Verdict::Finished(Err(failure)), true) => Verdict::Cancelled(Some(failure)),
                    (verdict, _) => verdict,
                }
            }
            _ = tokio::time::sleep(timeout) => {
                // Deadline: signal the stage scope so a subprocess can die
                // gracefully, then give it the same shutdown window.
                stage_scope.cancel();
                match tokio::time::timeout(shutdown_window, &mut handle).await {
                    Ok(_) => Verdict::TimedOut,
                    Err(_) => {
                        handle.abort();
                        Verdict::Abandoned
                    }
                }
            }
            _ = op_scope.cancelled() => {
                // The stage scope is a child of the operation scope, so the
                // stage already sees the signal; wait out its graceful exit.
                match tokio::time::timeout(shutdown_window, &mut handle).await {
                    Ok(joined) => match Self::map_join(joined) {
                        Verdict::Finished(Err(failure)) => Verdict::Cancelled(Some(failure)),
                        _ => Verdict::Cancelled(None),
                    },
                    Err(_) => {
                        handle.abort();
                        Verdict::Abandoned
                    }
                }
            }
        };

        self.conclude(verdict, stage, &operation_id, trace_id, started_at, timeout)
            .await
    }

    fn map_join(
        joined: Result<Result<crate::stage::StageOutcome, StageFailure>, tokio::task::JoinError>,
    ) -> Verdict {
        match joined {
            Ok(result) => Verdict::Finished(result),
            Err(err) if err.is_panic() => Verdict::Finished(Err(StageFailure::new(
                "stage panicked; see logs for the panic payload",
            ))),
            // Aborted: only happens via the abandon paths, which return first.
            Err(_) => Verdict::Cancelled(None),
        }
    }

    async fn conclude(
        &self,
        verdict: Verdict,
        stage: &Arc<dyn Stage>,
        operation_id: &str,
        trace_id: Uuid,
        started_at: chrono::DateTime<chrono::Utc>,
        timeout: Duration,
    ) -> StageRun {
        let stage_id = stage.id().to_string();
        let ended_at = self.clock.now();

        match verdict {
            Verdict::Finished(Ok(outcome)) => {
                // The filesystem already holds the outputs; the record lets
                // later gating checks skip the rescan.
                for tag in stage.produced_outputs() {
                    self.manifest.record(
                        tag,
                        TagInfo {
                            present: true,
                            path: None,
                            updated_at: Some(ended_at),
                        },
                    );
                }

                let mut result =
                    StageResult::new(stage_id.as_str(), StageStatus::Succeeded, started_at, ended_at);
                result.metadata = outcome.metadata.clone();
                if let Some(message) = &outcome.message {
                    result = result.with_message(message.clone());
                }

                let mut event = self
                    .event(EventKind::StageCompleted, operation_id, &stage_id, trace_id)
                    .with_progress(100);
                if let Some(message) = outcome.message {
                    event = event.with_message(message);
                }
                self.broadcaster.publish(event).await;
                debug!(stage = %stage_id, "stage succeeded");
                StageRun {
                    result,
                    cancelled: false,
                }
            }
            Verdict::Finished(Err(failure)) => {
                let mut result = StageResult::new(
                    stage_id.as_str(),
                    StageStatus::Failed,
                    started_at,
                    ended_at,
                )
                .with_message(failure.message.clone());
                if let Some(code) = failure.exit_code {
                    result = result.with_metadata("exit_code", json!(code));
                }

                self.broadcaster
                    .publish(
                        self.event(EventKind::StageFailed, operation_id, &stage_id, trace_id)
                            .with_message(failure.message.clone()),
                    )
                    .await;
                warn!(stage = %stage_id, error = %failure.message, "stage failed");
                StageRun {
                    result,
                    cancelled: false,
                }
            }
            Verdict::TimedOut => {
                let message = EngineError::StageTimeout {
                    stage_id: stage_id.clone(),
                    timeout,
                }
                .to_string();
                self.fail(stage_id, operation_id, trace_id, started_at, ended_at, message, false)
                    .await
            }
            Verdict::Cancelled(failure) => {
                let message = match failure {
                    Some(failure) => format!("cancelled: {}", failure.message),
                    None => "cancelled".to_string(),
                };
                self.fail(stage_id, operation_id, trace_id, started_at, ended_at, message, true)
                    .await
            }
            Verdict::Abandoned => {
                let message = format!(
                    "did not stop within {}s of cancellation; stage task abandoned",
                    (self.grace_period + ABANDON_SLACK).as_secs()
                );
                self.fail(stage_id, operation_id, trace_id, started_at, ended_at, message, true)
                    .await
            }
        }
    }

    /// Synthesised terminal for the abnormal endings.
    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        stage_id: String,
        operation_id: &str,
        trace_id: Uuid,
        started_at: chrono::DateTime<chrono::Utc>,
        ended_at: chrono::DateTime<chrono::Utc>,
        message: String,
        cancelled: bool,
    ) -> StageRun {
        let result = StageResult::new(stage_id.as_str(), StageStatus::Failed, started_at, ended_at)
            .with_message(message.clone());
        self.broadcaster
            .publish(
                self.event(EventKind::StageFailed, operation_id, &stage_id, trace_id)
                    .with_message(message.clone()),
            )
            .await;
        warn!(stage = %stage_id, cancelled, error = %message, "stage terminated abnormally");
        StageRun { result, cancelled }
    }
}

#[cfg(test)]
mod tests {
    use pulse_types::{DataTag, OperationMode, PushFrame};
    use serde_json::Map;

    use super::*;
    use crate::broadcaster::EventFilter;
    use crate::scope::SystemClock;
    use crate::stage::{FnStage, StageOutcome};

    fn runner(broadcaster: &Broadcaster, manifest: Arc<Manifest>) -> StageRunner {
        StageRunner::new(
            broadcaster.clone(),
            manifest,
            Arc::new(SystemClock),
            PathBuf::from("bin"),
            PathBuf::from("data"),
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
    }

    fn operation() -> OperationContext {
        OperationContext {
            operation_id: "op-1".to_string(),
            mode: OperationMode::Initial,
            from_date: None,
            to_date: None,
            parameters: Map::new(),
        }
    }

    async fn next_kind(subscription: &mut crate::broadcaster::Subscription) -> EventKind {
        match subscription.recv().await {
            Some(PushFrame::Event(event)) => event.kind,
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_emits_started_then_completed_and_records_outputs() {
        let broadcaster = Broadcaster::new(16);
        let manifest = Arc::new(Manifest::new(Vec::new()));
        let runner = runner(&broadcaster, Arc::clone(&manifest));
        let mut subscription = broadcaster.subscribe(EventFilter::All);

        let stage: Arc<dyn Stage> = Arc::new(
            FnStage::new("process", |_ctx, progress| async move {
                progress.update(60, "converting").await;
                Ok(StageOutcome::default().with_message("14 files"))
            })
            .produces(DataTag::csv_files()),
        );

        let run = runner
            .run_stage(&stage, &operation(), &Scope::root(), Uuid::nil(), 0, 1)
            .await;

        assert!(!run.cancelled);
        assert_eq!(run.result.status, StageStatus::Succeeded);
        assert_eq!(run.result.message.as_deref(), Some("14 files"));
        assert!(manifest.has(&DataTag::csv_files()));

        assert_eq!(next_kind(&mut subscription).await, EventKind::StageStarted);
        assert_eq!(next_kind(&mut subscription).await, EventKind::StageProgress);
        assert_eq!(next_kind(&mut subscription).await, EventKind::StageCompleted);
    }

    #[tokio::test]
    async fn failure_carries_message_and_exit_code_metadata() {
        let broadcaster = Broadcaster::new(16);
        let manifest = Arc::new(Manifest::new(Vec::new()));
        let runner = runner(&broadcaster, Arc::clone(&manifest));

        let stage: Arc<dyn Stage> = Arc::new(
            FnStage::new("process", |_ctx, _progress| async move {
                Err(StageFailure::new("malformed row 42").with_exit_code(Some(3)))
            })
            .produces(DataTag::csv_files()),
        );

        let run = runner
            .run_stage(&stage, &operation(), &Scope::root(), Uuid::nil(), 0, 1)
            .await;

        assert!(!run.cancelled);
        assert_eq!(run.result.status, StageStatus::Failed);
        assert_eq!(run.result.message.as_deref(), Some("malformed row 42"));
        assert_eq!(run.result.metadata["exit_code"], json!(3));
        // Failed stages never mark their outputs as produced.
        assert!(!manifest.has(&DataTag::csv_files()));
    }

    #[tokio::test]
    async fn panic_becomes_a_failed_result() {
        let broadcaster = Broadcaster::new(16);
        let manifest = Arc::new(Manifest::new(Vec::new()));
        let runner = runner(&broadcaster, manifest);

        let stage: Arc<dyn Stage> = Arc::new(FnStage::new("process", |_ctx, _progress| async move {
            panic!("boom");
        }));

        let run = runner
            .run_stage(&stage, &operation(), &Scope::root(), Uuid::nil(), 0, 1)
            .await;

        assert!(!run.cancelled);
        assert_eq!(run.result.status, StageStatus::Failed);
        assert!(run.result.message.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn deadline_overrun_is_reported_as_timeout() {
        let broadcaster = Broadcaster::new(16);
        let manifest = Arc::new(Manifest::new(Vec::new()));
        let runner = runner(&broadcaster, manifest);

        let stage: Arc<dyn Stage> = Arc::new(
            FnStage::new("collect", |ctx, _progress| async move {
                // Observes its scope, so it exits promptly once the
                // deadline fires.
                ctx.scope.cancelled().await;
                Err(StageFailure::new("interrupted"))
            })
            .with_timeout(Duration::from_millis(50)),
        );

        let run = runner
            .run_stage(&stage, &operation(), &Scope::root(), Uuid::nil(), 0, 1)
            .await;

        assert!(!run.cancelled);
        assert_eq!(run.result.status, StageStatus::Failed);
        assert!(
            run.result
                .message
                .as_deref()
                .unwrap()
                .contains("exceeded its deadline")
        );
    }

    #[tokio::test]
    async fn operation_cancellation_ends_a_cooperative_stage() {
        let broadcaster = Broadcaster::new(16);
        let manifest = Arc::new(Manifest::new(Vec::new()));
        let runner = runner(&broadcaster, manifest);
        let scope = Scope::root();

        let stage: Arc<dyn Stage> = Arc::new(FnStage::new("process", |ctx, _progress| async move {
            ctx.scope.cancelled().await;
            Err(StageFailure::new("interrupted"))
        }));

        let cancel_scope = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_scope.cancel();
        });

        let run = runner
            .run_stage(&stage, &operation(), &scope, Uuid::nil(), 0, 1)
            .await;

        assert!(run.cancelled);
        assert_eq!(run.result.status, StageStatus::Failed);
        assert!(run.result.message.as_deref().unwrap().contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_stage_is_abandoned_after_the_window() {
        let broadcaster = Broadcaster::new(16);
        let manifest = Arc::new(Manifest::new(Vec::new()));
        // Paused clock: the 5 s abandon slack elapses virtually.
        let runner = StageRunner::new(
            broadcaster.clone(),
            manifest,
            Arc::new(SystemClock),
            PathBuf::from("bin"),
            PathBuf::from("data"),
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        let scope = Scope::root();

        let stage: Arc<dyn Stage> = Arc::new(FnStage::new("stuck", |_ctx, _progress| async move {
            // Ignores its scope entirely.
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(StageOutcome::default())
        }));

        let cancel_scope = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_scope.cancel();
        });

        let run = runner
            .run_stage(&stage, &operation(), &scope, Uuid::nil(), 0, 1)
            .await;

        assert!(run.cancelled);
        assert!(run.result.message.as_deref().unwrap().contains("abandoned"));
    }
}
