use crate::operation::OperationStatus;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// The status DAG has no `from → to` edge; the state keeps `from`.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },
}
