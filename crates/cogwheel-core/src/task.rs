//! Units of work delivered to graph locations.

use std::time::Instant;

use crate::graph::LocationId;
use crate::runtime::Runtime;

/// A unit of work addressed to a location.
pub struct Task {
    pub target: LocationId,
    pub kind: TaskKind,
}

impl Task {
    pub fn new(target: LocationId, kind: TaskKind) -> Self {
        Self { target, kind }
    }
}

/// What a task does when dispatched to its target's object.
pub enum TaskKind {
    /// Invoke the object's primary action, then chain along the `next`
    /// argument if the run left no error.
    Run,
    /// Interrupt long-running work.
    Cancel,
    /// Deliver an update notification about an observed location.
    Update { updated: LocationId },
    /// Deliver an error notification about an observed location.
    Errored { errored: LocationId },
    /// A timer deadline expired. Carries the instant the deadline was set
    /// for, so handlers can compensate for delivery latency.
    TimerFired { scheduled: Instant },
    /// Run an arbitrary closure on the worker thread with graph access.
    Function(Box<dyn FnOnce(&mut Runtime, LocationId) + Send>),
}

impl TaskKind {
    /// Short label for trace output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Cancel => "cancel",
            Self::Update { .. } => "update",
            Self::Errored { .. } => "errored",
            Self::TimerFired { .. } => "timer-fired",
            Self::Function(_) => "function",
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("target", &self.target)
            .field("kind", &self.kind.label())
            .finish()
    }
}
