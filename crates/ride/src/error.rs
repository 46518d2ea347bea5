//! Error taxonomy for the runtime.
//!
//! User hooks (init, diff, effect, cleanups, host factories) fail with
//! arbitrary errors; the runtime captures each one into an [`ErrorReport`]
//! tagged with the [`Phase`] it happened in and routes it through
//! `Runtime::report_error`. Framework-level contract violations use the
//! closed [`RideError`] enum.

use std::fmt;

use thiserror::Error;

use crate::component::ComponentId;
use crate::op::Op;

/// Where in the lifecycle a user-handler error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The host factory rejected.
    HostInit,
    /// `attach_node` threw; the component is skipped for the frame.
    Attach,
    /// A user or behavior init hook failed.
    Init,
    /// A user or behavior diff failed; forces DEFER.
    Diff,
    /// Failure during the initial commit.
    InitialDiff,
    /// A user or behavior effect failed; later handlers in the chain still run.
    Effect,
    /// A per-key or lifetime cleanup failed; remaining cleanups still run.
    Cleanup,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::HostInit => "host-init",
            Phase::Attach => "attach",
            Phase::Init => "init",
            Phase::Diff => "diff",
            Phase::InitialDiff => "initial-diff",
            Phase::Effect => "effect",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind and key of the op that was in flight when an error surfaced.
#[derive(Debug, Clone)]
pub struct OpRef {
    pub kind: String,
    pub key: String,
}

impl From<&Op> for OpRef {
    fn from(op: &Op) -> Self {
        Self {
            kind: op.kind.clone(),
            key: op.key.clone(),
        }
    }
}

/// A captured user-handler failure, as passed to error handlers.
#[derive(Debug)]
pub struct ErrorReport {
    pub error: anyhow::Error,
    pub phase: Phase,
    pub component: Option<ComponentId>,
    pub op: Option<OpRef>,
}

impl ErrorReport {
    pub fn new(error: anyhow::Error, phase: Phase) -> Self {
        Self {
            error,
            phase,
            component: None,
            op: None,
        }
    }

    pub fn with_component(mut self, id: ComponentId) -> Self {
        self.component = Some(id);
        self
    }

    pub fn with_op(mut self, op: &Op) -> Self {
        self.op = Some(op.into());
        self
    }
}

/// Framework-level failures.
#[derive(Debug, Error)]
pub enum RideError {
    /// An op was pushed with an empty kind.
    #[error("op kind must be non-empty")]
    EmptyOpKind,

    /// An op was pushed with an empty coalescing key.
    #[error("op key must be non-empty")]
    EmptyOpKey,

    /// The target component was destroyed or never existed.
    #[error("component has been destroyed")]
    Destroyed,

    /// The host factory failed, so readiness will never be reached.
    #[error("host initialization failed: {0}")]
    HostInitFailed(String),

    /// The runtime behind a handle is gone.
    #[error("runtime has shut down")]
    RuntimeShutDown,

    /// The idle barrier did not quiesce within its iteration bound.
    #[error("scheduler failed to reach idle after {max} flushes")]
    IdleExhausted { max: usize },
}
