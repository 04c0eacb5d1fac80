//! The ISX Pulse operations engine.
//!
//! Couples four concerns under partial-failure constraints: dependency
//! resolution over declared data tags, cancellation propagation through a
//! scope tree, real-time event fan-out with backpressure-by-eviction, and
//! supervision of in-process and subprocess stages. The [`Manager`] is
//! the facade: requests in, operation IDs out, state via snapshots,
//! progress via [`Broadcaster`] subscriptions.

pub mod broadcaster;
pub mod config;
pub mod error;
mod ledger;
pub mod manager;
pub mod registry;
mod runner;
mod scheduler;
pub mod scope;
pub mod stage;
pub mod subprocess;

pub use broadcaster::{Broadcaster, EventFilter, Subscription};
pub use config::EngineConfig;
pub use error::{EngineError, RegistryError};
pub use ledger::OperationMetrics;
pub use manager::{AdmissionGate, Manager, ManagerBuilder};
pub use registry::{Registry, RegistryBuilder};
pub use scope::{Clock, Scope, SystemClock};
pub use stage::{
    FnStage, OperationContext, ProgressSink, Stage, StageContext, StageFailure, StageOutcome,
};
pub use subprocess::SubprocessStage;
