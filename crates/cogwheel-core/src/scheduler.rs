//! The task scheduler: a ready queue plus a dependency graph over pending
//! tasks.
//!
//! Tasks carry predecessor and successor lists. A task only becomes
//! schedulable through its dependencies once every predecessor has executed;
//! whichever predecessor discharges last schedules it. FIFO order among
//! independent tasks is an implementation detail, not a contract.
//!
//! While a task executes, its successor list is installed as the ambient
//! successor set: tasks created during execution automatically register as
//! predecessors of those successors, so a chain extends itself without the
//! executing code threading dependency edges by hand. [`ThenScope`] exposes
//! the same mechanism to graph-construction code outside task execution.

use std::collections::VecDeque;

use slotmap::{SlotMap, new_key_type};

use crate::error::TaskError;
use crate::graph::LocationId;
use crate::task::{Task, TaskKind};

new_key_type! {
    /// Generation-checked key for a pending task.
    pub struct TaskId;
}

struct TaskState {
    target: LocationId,
    /// Taken while executing; restored afterwards for persistent tasks.
    kind: Option<TaskKind>,
    predecessors: Vec<TaskId>,
    successors: Vec<TaskId>,
    scheduled: bool,
    persistent: bool,
}

/// Ready queue and dependency bookkeeping for pending tasks.
#[derive(Default)]
pub struct Scheduler {
    tasks: SlotMap<TaskId, TaskState>,
    queue: VecDeque<TaskId>,
    no_scheduling: Vec<LocationId>,
    ambient_successors: Vec<TaskId>,
    /// Ambient sets displaced by nested executions, innermost last.
    ambient_saved: Vec<Vec<TaskId>>,
}

/// Saved ambient-successor context. Obtain from [`Scheduler::begin_then`]
/// and hand back to [`Scheduler::end_then`] when the construction block
/// ends.
#[must_use = "end_then must be called to restore the previous context"]
pub struct ThenScope {
    saved: Vec<TaskId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. If an ambient successor set is installed, the new
    /// task becomes a predecessor of every task in it.
    pub fn add_task(&mut self, task: Task) -> TaskId {
        let id = self.tasks.insert(TaskState {
            target: task.target,
            kind: Some(task.kind),
            predecessors: Vec::new(),
            successors: Vec::new(),
            scheduled: false,
            persistent: false,
        });
        let ambient = std::mem::take(&mut self.ambient_successors);
        for successor in &ambient {
            self.link(id, *successor);
        }
        self.ambient_successors = ambient;
        tracing::trace!(target: "cogwheel_core::scheduler", ?id, "task added");
        id
    }

    /// Keep the task's state alive across executions so it can be
    /// rescheduled. Closure tasks cannot be persistent; their body is
    /// consumed on first dispatch.
    pub fn make_persistent(&mut self, id: TaskId) {
        if let Some(state) = self.tasks.get_mut(id) {
            debug_assert!(!matches!(state.kind, Some(TaskKind::Function(_))));
            state.persistent = true;
        }
    }

    /// Declare that `succ` must not execute before `pred`.
    pub fn depend(&mut self, pred: TaskId, succ: TaskId) {
        if self.tasks.contains_key(pred) && self.tasks.contains_key(succ) {
            self.link(pred, succ);
        }
    }

    fn link(&mut self, pred: TaskId, succ: TaskId) {
        if self.tasks[pred].successors.contains(&succ) {
            return;
        }
        self.tasks[pred].successors.push(succ);
        self.tasks[succ].predecessors.push(pred);
    }

    /// Put a task on the ready queue.
    ///
    /// While the target is under the no-scheduling guard the task is
    /// silently dropped: its state is removed, not parked. Scheduling an
    /// already-scheduled task is a loud programming error; the task still
    /// executes exactly once.
    pub fn schedule(&mut self, id: TaskId) -> Result<(), TaskError> {
        let (target, scheduled) = {
            let state = self.tasks.get(id).ok_or(TaskError::InvalidTask)?;
            (state.target, state.scheduled)
        };
        if self.no_scheduling.contains(&target) {
            tracing::trace!(
                target: "cogwheel_core::scheduler",
                ?id,
                "schedule suppressed by guard, task dropped"
            );
            self.discard(id);
            return Ok(());
        }
        if scheduled {
            tracing::error!(
                target: "cogwheel_core::scheduler",
                ?id,
                "task scheduled twice"
            );
            return Err(TaskError::AlreadyScheduled);
        }
        if let Some(state) = self.tasks.get_mut(id) {
            state.scheduled = true;
        }
        self.queue.push_back(id);
        tracing::trace!(target: "cogwheel_core::scheduler", ?id, "task scheduled");
        Ok(())
    }

    /// Remove a task outright, unlinking it from the dependency graph.
    /// Dependents whose predecessor list empties are scheduled so chains
    /// never wedge on a removed node.
    fn discard(&mut self, id: TaskId) {
        let Some(state) = self.tasks.get_mut(id) else {
            return;
        };
        let successors = std::mem::take(&mut state.successors);
        let predecessors = std::mem::take(&mut state.predecessors);
        for successor in successors {
            let ready = match self.tasks.get_mut(successor) {
                Some(state) => {
                    state.predecessors.retain(|p| *p != id);
                    state.predecessors.is_empty() && !state.scheduled
                }
                None => false,
            };
            if ready && let Err(err) = self.schedule(successor) {
                tracing::error!(
                    target: "cogwheel_core::scheduler",
                    ?successor,
                    %err,
                    "failed to schedule orphaned successor"
                );
            }
        }
        for pred in predecessors {
            if let Some(state) = self.tasks.get_mut(pred) {
                state.successors.retain(|s| *s != id);
            }
        }
        self.purge_ambient(id);
        self.tasks.remove(id);
    }

    /// Drop `id` from the active ambient set and every saved frame so no
    /// stale key survives its removal.
    fn purge_ambient(&mut self, id: TaskId) {
        self.ambient_successors.retain(|s| *s != id);
        for saved in &mut self.ambient_saved {
            saved.retain(|s| *s != id);
        }
    }

    /// Suppress scheduling for tasks targeting `loc`. Used while restoring
    /// serialized state so reconstruction has no runtime side effects.
    pub fn suppress(&mut self, loc: LocationId) {
        if !self.no_scheduling.contains(&loc) {
            self.no_scheduling.push(loc);
        }
    }

    pub fn release(&mut self, loc: LocationId) {
        self.no_scheduling.retain(|l| *l != loc);
    }

    pub fn is_suppressed(&self, loc: LocationId) -> bool {
        self.no_scheduling.contains(&loc)
    }

    /// Next ready task, skipping entries whose state has since gone away.
    pub fn pop_ready(&mut self) -> Option<TaskId> {
        while let Some(id) = self.queue.pop_front() {
            if self
                .tasks
                .get(id)
                .is_some_and(|state| state.scheduled)
            {
                return Some(id);
            }
        }
        None
    }

    /// Start executing a popped task: clears its scheduled flag, takes its
    /// kind, and installs its successors as the ambient set. The displaced
    /// ambient set is saved so nested executions nest cleanly. Must be
    /// paired with [`Scheduler::finish_execute`].
    pub fn begin_execute(&mut self, id: TaskId) -> Option<(LocationId, TaskKind)> {
        let (target, kind, successors) = {
            let state = self.tasks.get_mut(id)?;
            state.scheduled = false;
            let kind = state.kind.take()?;
            (state.target, kind, state.successors.clone())
        };
        let saved = std::mem::take(&mut self.ambient_successors);
        self.ambient_saved.push(saved);
        if !successors.is_empty() {
            self.ambient_successors = successors;
        }
        Some((target, kind))
    }

    /// Finish executing a task: restores the displaced ambient set,
    /// discharges this task from every successor's predecessor list
    /// (scheduling successors whose list emptied), and deletes the task
    /// unless persistent. `kind_back` re-arms a persistent task's kind.
    pub fn finish_execute(&mut self, id: TaskId, kind_back: Option<TaskKind>) {
        self.ambient_successors = self.ambient_saved.pop().unwrap_or_default();
        let (successors, persistent) = match self.tasks.get_mut(id) {
            Some(state) => {
                state.kind = if state.persistent { kind_back } else { None };
                (std::mem::take(&mut state.successors), state.persistent)
            }
            None => return,
        };
        for successor in successors {
            let ready = match self.tasks.get_mut(successor) {
                Some(state) => {
                    state.predecessors.retain(|p| *p != id);
                    state.predecessors.is_empty() && !state.scheduled
                }
                None => false,
            };
            if ready && let Err(err) = self.schedule(successor) {
                tracing::error!(
                    target: "cogwheel_core::scheduler",
                    ?successor,
                    %err,
                    "failed to schedule discharged successor"
                );
            }
        }
        if !persistent {
            self.purge_ambient(id);
            self.tasks.remove(id);
        }
    }

    /// Install `successors` as the ambient set for a block of construction
    /// code. Tasks created until the matching [`Scheduler::end_then`] become
    /// their predecessors.
    pub fn begin_then(&mut self, successors: Vec<TaskId>) -> ThenScope {
        ThenScope {
            saved: std::mem::replace(&mut self.ambient_successors, successors),
        }
    }

    /// Restore the previous ambient set and schedule any of the scope's
    /// successors that have no pending predecessors.
    pub fn end_then(&mut self, scope: ThenScope) {
        let successors = std::mem::replace(&mut self.ambient_successors, scope.saved);
        for successor in successors {
            let ready = self
                .tasks
                .get(successor)
                .is_some_and(|state| state.predecessors.is_empty() && !state.scheduled);
            if ready && let Err(err) = self.schedule(successor) {
                tracing::error!(
                    target: "cogwheel_core::scheduler",
                    ?successor,
                    %err,
                    "failed to schedule then-scope successor"
                );
            }
        }
    }

    pub fn target_of(&self, id: TaskId) -> Option<LocationId> {
        self.tasks.get(id).map(|state| state.target)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drop every pending task targeting `loc`. Called by the destroy
    /// cascade so stale work does not accumulate.
    pub fn drop_tasks_for(&mut self, loc: LocationId) {
        let doomed: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, state)| state.target == loc)
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            self.discard(id);
        }
    }
}
