//! Wall-clock source and the hierarchical cancellation scope tree.
//!
//! One root scope exists per manager; every operation gets a child and
//! every stage a grandchild. Cancellation propagates downward only, and a
//! scope may additionally carry an absolute deadline (a child never
//! outlives its parent's deadline).

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Monotone wall-clock source for event and state timestamps.
///
/// Injected so tests can pin time; production code uses [`SystemClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A cancellation domain with an optional absolute deadline.
#[derive(Clone, Debug)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    /// The root of a scope tree. Cancelling it cancels everything below.
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A child scope inheriting this scope's deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child scope with its own deadline `timeout` from now.
    ///
    /// The tighter of the parent deadline and the new one wins.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(own, |parent| parent.min(own))),
        }
    }

    /// Signals cancellation for this scope and all descendants. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when this scope (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_propagates_to_descendants() {
        let root = Scope::root();
        let operation = root.child();
        let stage = operation.child();

        root.cancel();

        assert!(operation.is_cancelled());
        assert!(stage.is_cancelled());
        // The future resolves immediately once cancelled.
        stage.cancelled().await;
    }

    #[tokio::test]
    async fn child_cancellation_does_not_reach_the_parent() {
        let root = Scope::root();
        let operation = root.child();

        operation.cancel();

        assert!(operation.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn child_deadline_never_exceeds_the_parent_deadline() {
        let root = Scope::root();
        let operation = root.child_with_timeout(Duration::from_secs(1));
        let stage = operation.child_with_timeout(Duration::from_secs(3600));

        let parent_deadline = operation.deadline().unwrap();
        assert!(stage.deadline().unwrap() <= parent_deadline);

        // A tighter child deadline is kept as-is.
        let quick = operation.child_with_timeout(Duration::from_millis(10));
        assert!(quick.deadline().unwrap() < parent_deadline);
    }

    #[test]
    fn remaining_is_none_without_a_deadline() {
        assert!(Scope::root().remaining().is_none());
    }
}
