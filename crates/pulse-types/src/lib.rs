pub mod error;
pub mod event;
pub mod operation;
pub mod tag;

pub use error::DomainError;
pub use event::{Event, EventKind, PushFrame, SnapshotEnvelope, StreamMarker};
pub use operation::{
    OperationMode, OperationRequest, OperationState, OperationStatus, StageResult, StageStatus,
};
pub use tag::DataTag;
