use std::time::Duration;

use pulse_types::DataTag;
use thiserror::Error;

/// Registry construction failures. All are fatal at startup: a process
/// with an inconsistent stage graph must not come up.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("stage `{id}` registered twice")]
    DuplicateStage { id: String },
    /// Producer-uniqueness: at most one stage may produce a given tag.
    #[error("data tag `{tag}` produced by both `{first}` and `{second}`")]
    DuplicateProducer {
        tag: DataTag,
        first: String,
        second: String,
    },
    #[error("stage graph cycle involving `{stage_id}`")]
    Cycle { stage_id: String },
}

/// Errors surfaced at the engine boundary.
///
/// Stage failures during a run never come out of `execute`; they become
/// terminal events and fields on the operation state. These variants are
/// what the synchronous entry points return.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("operation `{id}` already exists in a non-terminal state")]
    DuplicateId { id: String },
    #[error("operation `{id}` not found")]
    NotFound { id: String },
    #[error("operation `{id}` already finished")]
    AlreadyFinished { id: String },
    /// A single-stage request with autowiring disabled and absent inputs.
    #[error("stage `{stage_id}` cannot run: missing inputs {tags:?}")]
    MissingInput {
        stage_id: String,
        tags: Vec<DataTag>,
    },
    #[error("stage `{stage_id}` exceeded its deadline of {timeout:?}")]
    StageTimeout {
        stage_id: String,
        timeout: Duration,
    },
    #[error("stage `{stage_id}` failed: {message}")]
    StageFailed {
        stage_id: String,
        exit_code: Option<i32>,
        message: String,
    },
    #[error("operation cancelled")]
    Cancelled,
    /// The admission gate (license validation, quotas) refused the request.
    #[error("request rejected: {reason}")]
    AdmissionDenied { reason: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
