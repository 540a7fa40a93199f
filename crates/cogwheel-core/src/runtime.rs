//! The runtime: graph, scheduler, error table, timer service and the
//! cross-thread event slot, tied together behind one facade.
//!
//! The worker thread owns the [`Runtime`] and is the sole writer of graph
//! state. Other threads interact through the event slot (see
//! [`Runtime::event_slot`] and [`post_blocking`]) or the error table handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::channel::{StopToken, TaskSlot};
use crate::error::{CoreError, GraphError, Result, TimerError};
use crate::errors::{ErrorTable, NodeError};
use crate::graph::{
    Connection, ConnectionId, Graph, LocationId, Machine, PointerBehavior,
};
use crate::object::{Argument, ArgumentId, NEXT_ARG, Object, PartKind, object_cast, object_cast_mut};
use crate::scheduler::{Scheduler, TaskId, ThenScope};
use crate::task::{Task, TaskKind};
use crate::timer::TimerService;

/// Serialized-document format version.
const STATE_VERSION: u64 = 1;

/// The execution substrate: one root machine, its graph, and the services
/// that drive it.
pub struct Runtime {
    graph: Graph,
    scheduler: Scheduler,
    errors: Arc<ErrorTable>,
    events: Arc<TaskSlot>,
    timer: TimerService,
    root: LocationId,
    prototypes: HashMap<&'static str, Box<dyn Object>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        let mut graph = Graph::new();
        let root = graph.create_location("root", None);
        graph.insert_object(root, Box::new(Machine::new("root")));
        let events = Arc::new(TaskSlot::new());
        let timer = TimerService::start(events.clone());
        let mut rt = Self {
            graph,
            scheduler: Scheduler::new(),
            errors: Arc::new(ErrorTable::new()),
            events,
            timer,
            root,
            prototypes: HashMap::new(),
        };
        rt.register_prototype(Box::new(Machine::new("machine")));
        rt
    }

    pub fn root(&self) -> LocationId {
        self.root
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Handle to the error table, shareable with other threads.
    pub fn errors(&self) -> Arc<ErrorTable> {
        self.errors.clone()
    }

    /// Handle to the cross-thread event slot.
    pub fn event_slot(&self) -> Arc<TaskSlot> {
        self.events.clone()
    }

    pub fn timer(&self) -> &TimerService {
        &self.timer
    }

    // ----- object creation ---------------------------------------------

    /// Register a prototype under its type tag.
    pub fn register_prototype(&mut self, prototype: Box<dyn Object>) {
        self.prototypes.insert(prototype.kind(), prototype);
    }

    /// Create a location inside `machine` holding `object`.
    pub fn create(
        &mut self,
        machine: LocationId,
        name: impl Into<String>,
        object: Box<dyn Object>,
    ) -> Result<LocationId> {
        if !self.graph.contains(machine) {
            return Err(GraphError::InvalidLocation.into());
        }
        let loc = self.graph.create_location(name, Some(machine));
        self.graph.insert_object(loc, object);
        let adopted = match self.graph.object_mut(machine) {
            Some(obj) => match object_cast_mut::<Machine>(obj) {
                Some(m) => {
                    m.adopt_child(loc);
                    true
                }
                None => false,
            },
            None => false,
        };
        if !adopted {
            self.graph.destroy_location(loc);
            return Err(GraphError::InvalidLocation.into());
        }
        Ok(loc)
    }

    /// Clone a registered prototype into a new location.
    pub fn create_from_prototype(
        &mut self,
        machine: LocationId,
        kind: &str,
    ) -> Result<LocationId> {
        let object = self
            .prototypes
            .get(kind)
            .map(|proto| proto.boxed_clone())
            .ok_or_else(|| GraphError::UnknownPrototype(kind.to_string()))?;
        let name = object.name().to_string();
        self.create(machine, name, object)
    }

    /// Destroy a location: cancels its deadlines, drops its pending tasks,
    /// clears its error slot, removes every connection touching it (with
    /// `connection_removed` hooks to surviving endpoints), and repairs
    /// observer sets.
    pub fn destroy(&mut self, loc: LocationId) {
        self.timer.cancel(loc);
        self.scheduler.drop_tasks_for(loc);
        // Clear through clear_error while the parent chain is still intact
        // so ancestor machines stop listing the location as errored.
        self.clear_error(loc);
        let Some((removed, _object)) = self.graph.destroy_location(loc) else {
            return;
        };
        for (conn, connection) in removed {
            if connection.from != loc && self.graph.contains(connection.from) {
                self.with_object(connection.from, |rt, obj| {
                    obj.connection_removed(rt, connection.from, connection.argument, conn);
                });
            }
        }
    }

    // ----- connections -------------------------------------------------

    /// Connect `from`'s argument to `to`.
    ///
    /// The argument's precondition and requirement predicates are checked
    /// against the target first; on failure the reason lands in the error
    /// table at `from` and no connection is made. A target satisfying a
    /// concrete-type precondition downgrades the pointer behavior to
    /// [`PointerBehavior::TerminateHere`].
    #[track_caller]
    pub fn connect_to(
        &mut self,
        from: LocationId,
        arg: &'static Argument,
        to: LocationId,
    ) -> Result<ConnectionId> {
        if !self.graph.contains(from) || !self.graph.contains(to) {
            return Err(GraphError::InvalidLocation.into());
        }
        let (checked, terminate) = {
            let target = self.graph.object(to);
            (arg.check(target), arg.concrete_type_satisfied(target))
        };
        if let Err(reason) = checked {
            self.report_error(from, reason.clone());
            return Err(GraphError::RequirementsNotMet(reason).into());
        }
        let pointer_behavior = if terminate {
            PointerBehavior::TerminateHere
        } else {
            PointerBehavior::FollowPointers
        };
        let conn = self
            .graph
            .add_connection(Connection {
                argument: arg.id(),
                from,
                to,
                pointer_behavior,
            })
            .ok_or(GraphError::InvalidLocation)?;
        self.with_object(from, |rt, obj| {
            obj.connection_added(rt, from, arg.id(), conn);
        });
        Ok(conn)
    }

    /// Remove a connection, delivering the `connection_removed` hook to the
    /// owning object.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Result<()> {
        let connection = self
            .graph
            .remove_connection(conn)
            .ok_or(GraphError::InvalidConnection)?;
        self.with_object(connection.from, |rt, obj| {
            obj.connection_removed(rt, connection.from, connection.argument, conn);
        });
        Ok(())
    }

    pub fn observe_updates(&mut self, observer: LocationId, observed: LocationId) {
        self.graph.observe_updates(observer, observed);
    }

    pub fn stop_observing_updates(&mut self, observer: LocationId, observed: LocationId) {
        self.graph.stop_observing_updates(observer, observed);
    }

    pub fn observe_errors(&mut self, observer: LocationId, observed: LocationId) {
        self.graph.observe_errors(observer, observed);
    }

    pub fn stop_observing_errors(&mut self, observer: LocationId, observed: LocationId) {
        self.graph.stop_observing_errors(observer, observed);
    }

    // ----- scheduling --------------------------------------------------

    /// Register and schedule an externally-produced task. Used by the
    /// worker loop for tasks arriving through the event slot.
    /// Register and schedule a task in one step. The returned id is stale
    /// when the target is under the no-scheduling guard; the task is
    /// dropped, not parked.
    pub fn ingest(&mut self, task: Task) -> TaskId {
        let id = self.scheduler.add_task(task);
        if let Err(err) = self.scheduler.schedule(id) {
            tracing::error!(target: "cogwheel_core::runtime", ?id, %err, "failed to schedule ingested task");
        }
        id
    }

    pub fn schedule_run(&mut self, target: LocationId) {
        self.ingest(Task::new(target, TaskKind::Run));
    }

    pub fn schedule_cancel(&mut self, target: LocationId) {
        self.ingest(Task::new(target, TaskKind::Cancel));
    }

    pub fn schedule_errored(&mut self, target: LocationId, errored: LocationId) {
        self.ingest(Task::new(target, TaskKind::Errored { errored }));
    }

    /// Notify one observer that `updated` changed.
    pub fn schedule_local_update(&mut self, observer: LocationId, updated: LocationId) {
        self.ingest(Task::new(observer, TaskKind::Update { updated }));
    }

    /// Fan `updated`'s change out to all of its update observers.
    pub fn schedule_update(&mut self, updated: LocationId) {
        let observers = match self.graph.location(updated) {
            Some(data) => data.update_observers.clone(),
            None => return,
        };
        for observer in observers {
            self.schedule_local_update(observer, updated);
        }
    }

    /// Run a closure on the worker thread with full runtime access.
    pub fn schedule_function(
        &mut self,
        target: LocationId,
        f: impl FnOnce(&mut Runtime, LocationId) + Send + 'static,
    ) {
        self.ingest(Task::new(target, TaskKind::Function(Box::new(f))));
    }

    pub fn begin_then(&mut self, successors: Vec<TaskId>) -> ThenScope {
        self.scheduler.begin_then(successors)
    }

    pub fn end_then(&mut self, scope: ThenScope) {
        self.scheduler.end_then(scope);
    }

    // ----- timers ------------------------------------------------------

    pub fn schedule_deadline(&mut self, target: LocationId, when: Instant) -> Result<()> {
        self.timer.schedule_at(target, when).map_err(CoreError::from)
    }

    pub fn cancel_deadlines(&mut self, target: LocationId) -> usize {
        self.timer.cancel(target)
    }

    pub fn reschedule_deadline(
        &mut self,
        target: LocationId,
        old: Instant,
        new: Instant,
    ) -> std::result::Result<(), TimerError> {
        self.timer.reschedule_at(target, old, new)
    }

    // ----- errors ------------------------------------------------------

    /// Attach an error to `target`. The first error wins; notifications go
    /// to the target's error observers, or to its parent machine when no
    /// one observes it.
    #[track_caller]
    pub fn report_error(&mut self, target: LocationId, text: impl Into<String>) {
        let stored = self.errors.report(NodeError::new(target, text));
        if !stored {
            return;
        }
        let (observers, parent) = match self.graph.location(target) {
            Some(data) => (data.error_observers.clone(), data.parent),
            None => return,
        };
        if observers.is_empty() {
            if let Some(parent) = parent {
                self.schedule_errored(parent, target);
            }
            return;
        }
        for observer in observers {
            self.schedule_errored(observer, target);
        }
    }

    /// Clear `target`'s error and unwind the child-error records of its
    /// ancestor machines while they have nothing else wrong.
    pub fn clear_error(&mut self, target: LocationId) {
        if self.errors.take(target).is_none() {
            return;
        }
        let mut child = target;
        loop {
            let Some(parent) = self.graph.location(child).and_then(|d| d.parent) else {
                break;
            };
            let machine_clean = self
                .with_object(parent, |_, obj| match object_cast_mut::<Machine>(obj) {
                    Some(machine) => {
                        machine.clear_child_error(child);
                        machine.children_with_errors().is_empty()
                    }
                    None => false,
                })
                .unwrap_or(false);
            if !machine_clean || self.errors.has_error(parent) {
                break;
            }
            child = parent;
        }
    }

    /// Every error recorded at or below `machine`, depth first.
    pub fn diagnostics(&self, machine: LocationId) -> Vec<(LocationId, String)> {
        let mut out = Vec::new();
        let mut stack = vec![machine];
        while let Some(loc) = stack.pop() {
            self.errors.with_error(loc, |error| {
                if let Some(error) = error {
                    out.push((loc, error.text.clone()));
                }
            });
            if let Some(obj) = self.graph.object(loc)
                && let Some(m) = object_cast::<Machine>(obj)
            {
                stack.extend(m.children().iter().rev().copied());
            }
        }
        out
    }

    // ----- autoconnect -------------------------------------------------

    /// Move a location and re-evaluate autoconnection for it and its
    /// siblings.
    pub fn set_position(&mut self, loc: LocationId, position: glam::Vec2) {
        if let Some(data) = self.graph.location_mut(loc) {
            data.position = position;
        }
        self.update_autoconnect(loc);
    }

    /// Re-evaluate every radius-bearing argument of `moved` and of its
    /// siblings. Candidates are scanned in the machine's child insertion
    /// order; an existing target keeps its seat unless a strictly closer
    /// satisfying candidate appears, and loses it when it leaves the
    /// radius.
    pub fn update_autoconnect(&mut self, moved: LocationId) {
        let Some(parent) = self.graph.location(moved).and_then(|d| d.parent) else {
            return;
        };
        let siblings = match self
            .graph
            .object(parent)
            .and_then(|obj| object_cast::<Machine>(obj))
        {
            Some(machine) => machine.children().to_vec(),
            None => return,
        };
        for source in siblings {
            let args: &'static [&'static Argument] = match self.graph.object(source) {
                Some(obj) => obj.args(),
                None => continue,
            };
            for arg in args {
                if arg.autoconnect_radius() > 0.0 {
                    self.evaluate_autoconnect(source, arg, parent);
                }
            }
        }
    }

    fn evaluate_autoconnect(
        &mut self,
        source: LocationId,
        arg: &'static Argument,
        parent: LocationId,
    ) {
        let Some(source_data) = self.graph.location(source) else {
            return;
        };
        let probe = source_data.position + arg.anchor();
        let radius2 = arg.autoconnect_radius() * arg.autoconnect_radius();
        let current = self.graph.arg_target(source, arg.id());

        let candidate_ok = |graph: &Graph, cand: LocationId| -> Option<f32> {
            let data = graph.location(cand)?;
            let d2 = data.position.distance_squared(probe);
            if d2 > radius2 {
                return None;
            }
            arg.check(graph.object(cand)).ok()?;
            Some(d2)
        };

        // The incumbent keeps its seat at equal distance.
        let mut best = current.and_then(|c| candidate_ok(&self.graph, c).map(|d2| (d2, c)));

        let children = match self
            .graph
            .object(parent)
            .and_then(|obj| object_cast::<Machine>(obj))
        {
            Some(machine) => machine.children().to_vec(),
            None => return,
        };
        for cand in children {
            if cand == source || Some(cand) == current {
                continue;
            }
            let Some(d2) = candidate_ok(&self.graph, cand) else {
                continue;
            };
            match best {
                Some((best_d2, _)) if d2 >= best_d2 => {}
                _ => best = Some((d2, cand)),
            }
        }

        let winner = best.map(|(_, cand)| cand);
        if winner == current {
            return;
        }
        for conn in self.graph.outgoing_for_arg(source, arg.id()) {
            if let Err(err) = self.disconnect(conn) {
                tracing::error!(target: "cogwheel_core::runtime", %err, "autoconnect disconnect failed");
            }
        }
        if let Some(winner) = winner
            && let Err(err) = self.connect_to(source, arg, winner)
        {
            tracing::error!(target: "cogwheel_core::runtime", %err, "autoconnect failed");
        }
    }

    // ----- execution ---------------------------------------------------

    /// Execute up to `max_iterations` ready tasks. Returns how many ran.
    pub fn run_loop(&mut self, max_iterations: usize) -> usize {
        let mut executed = 0;
        while executed < max_iterations {
            let Some(id) = self.scheduler.pop_ready() else {
                break;
            };
            let Some((target, kind)) = self.scheduler.begin_execute(id) else {
                continue;
            };
            let kind_back = self.dispatch(target, kind);
            self.scheduler.finish_execute(id, kind_back);
            executed += 1;
        }
        executed
    }

    /// Execute ready tasks until none remain.
    pub fn drain(&mut self) -> usize {
        self.run_loop(usize::MAX)
    }

    /// The worker loop: drain the scheduler, then block on the event slot
    /// for the next externally-produced task. Exits when the token stops
    /// and the slot closes.
    pub fn run_thread(&mut self, stop: &StopToken) {
        tracing::trace!(target: "cogwheel_core::runtime", "worker thread started");
        loop {
            self.drain();
            if stop.is_stopped() {
                break;
            }
            match self.events.recv() {
                Some(task) => {
                    self.ingest(task);
                }
                None => break,
            }
        }
        tracing::trace!(target: "cogwheel_core::runtime", "worker thread stopped");
    }

    /// Close the event slot and stop the timer thread.
    pub fn shutdown(&mut self) {
        self.events.close();
        self.timer.stop_and_join();
    }

    fn dispatch(&mut self, target: LocationId, kind: TaskKind) -> Option<TaskKind> {
        if !self.graph.contains(target) {
            // Target destroyed between scheduling and execution. Drop the
            // work; successors are still discharged by the caller.
            tracing::trace!(target: "cogwheel_core::runtime", ?target, "dropping task for dead target");
            return match kind {
                TaskKind::Function(_) => None,
                other => Some(other),
            };
        }
        tracing::trace!(target: "cogwheel_core::runtime", ?target, kind = kind.label(), "dispatching task");
        match kind {
            TaskKind::Run => {
                let long_running = self
                    .graph
                    .object(target)
                    .is_some_and(|obj| obj.parts().contains(&PartKind::LongRunning));
                self.with_object(target, |rt, obj| obj.run(rt, target));
                if let Some(data) = self.graph.location_mut(target) {
                    data.last_finished = Some(Instant::now());
                    data.long_running = long_running;
                }
                if !self.errors.has_error(target)
                    && let Some(next) = self.graph.arg_target(target, NEXT_ARG.id())
                {
                    self.schedule_run(next);
                }
                Some(TaskKind::Run)
            }
            TaskKind::Cancel => {
                self.with_object(target, |rt, obj| obj.cancel(rt, target));
                if let Some(data) = self.graph.location_mut(target) {
                    data.long_running = false;
                }
                Some(TaskKind::Cancel)
            }
            TaskKind::Update { updated } => {
                self.with_object(target, |rt, obj| obj.updated(rt, target, updated));
                Some(TaskKind::Update { updated })
            }
            TaskKind::Errored { errored } => {
                self.with_object(target, |rt, obj| obj.errored(rt, target, errored));
                Some(TaskKind::Errored { errored })
            }
            TaskKind::TimerFired { scheduled } => {
                self.with_object(target, |rt, obj| obj.timer_notify(rt, target, scheduled));
                Some(TaskKind::TimerFired { scheduled })
            }
            TaskKind::Function(f) => {
                f(self, target);
                None
            }
        }
    }

    /// Take the object out of its location, run `f`, and put it back.
    /// Keeps `&mut Runtime` available to the hook without aliasing the
    /// object borrow.
    fn with_object<R>(
        &mut self,
        loc: LocationId,
        f: impl FnOnce(&mut Runtime, &mut dyn Object) -> R,
    ) -> Option<R> {
        let mut object = self.graph.take_object(loc)?;
        let result = f(self, object.as_mut());
        self.graph.put_back_object(loc, object);
        Some(result)
    }

    // ----- serialization -----------------------------------------------

    /// Serialize the reachable graph into a versioned JSON document.
    pub fn serialize_state(&self) -> Result<serde_json::Value> {
        let mut order = Vec::new();
        self.collect_reachable(self.root, &mut order);
        let index: HashMap<LocationId, usize> =
            order.iter().enumerate().map(|(i, loc)| (*loc, i)).collect();

        let mut locations = Vec::with_capacity(order.len());
        let mut connections = Vec::new();
        for loc in &order {
            let data = self
                .graph
                .location(*loc)
                .ok_or_else(|| CoreError::Serialize("location vanished during walk".into()))?;
            let object = data.object.as_ref().map(|obj| {
                serde_json::json!({
                    "kind": obj.kind(),
                    "state": obj.state(),
                })
            });
            locations.push(serde_json::json!({
                "name": data.name,
                "parent": data.parent.map(|p| index[&p]),
                "position": [data.position.x, data.position.y],
                "scale": data.scale,
                "object": object,
            }));

            for conn in &data.outgoing {
                let Some(connection) = self.graph.connection(*conn) else {
                    continue;
                };
                let Some(to) = index.get(&connection.to) else {
                    continue;
                };
                let arg_name = self
                    .argument_name(*loc, connection.argument)
                    .ok_or_else(|| {
                        CoreError::Serialize(format!(
                            "connection from {:?} uses an unknown argument",
                            data.name
                        ))
                    })?;
                connections.push(serde_json::json!({
                    "from": index[loc],
                    "arg": arg_name,
                    "to": to,
                }));
            }
        }

        Ok(serde_json::json!({
            "version": STATE_VERSION,
            "locations": locations,
            "connections": connections,
        }))
    }

    fn collect_reachable(&self, loc: LocationId, out: &mut Vec<LocationId>) {
        out.push(loc);
        if let Some(obj) = self.graph.object(loc)
            && let Some(machine) = object_cast::<Machine>(obj)
        {
            for child in machine.children() {
                self.collect_reachable(*child, out);
            }
        }
    }

    fn argument_name(&self, loc: LocationId, argument: ArgumentId) -> Option<&'static str> {
        if NEXT_ARG.id() == argument {
            return Some(NEXT_ARG.name());
        }
        self.graph
            .object(loc)?
            .args()
            .iter()
            .find(|arg| arg.id() == argument)
            .map(|arg| arg.name())
    }

    fn resolve_argument(&self, loc: LocationId, name: &str) -> Option<&'static Argument> {
        if NEXT_ARG.name() == name {
            return Some(&NEXT_ARG);
        }
        self.graph
            .object(loc)?
            .args()
            .iter()
            .find(|arg| arg.name() == name)
            .copied()
    }

    /// Rebuild graph state from a document produced by
    /// [`Runtime::serialize_state`]. Call on a fresh runtime with the same
    /// prototypes registered. Every location is placed under the
    /// no-scheduling guard for the duration, so restoring triggers no
    /// runtime side effects.
    pub fn deserialize_state(&mut self, doc: &serde_json::Value) -> Result<()> {
        let version = doc
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CoreError::Deserialize("missing version".into()))?;
        if version != STATE_VERSION {
            return Err(CoreError::Deserialize(format!(
                "unsupported version {version}"
            )));
        }
        let entries = doc
            .get("locations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CoreError::Deserialize("missing locations".into()))?;

        let mut ids: Vec<LocationId> = Vec::with_capacity(entries.len());
        let restore = |rt: &mut Runtime, entries: &[serde_json::Value], ids: &mut Vec<LocationId>| -> Result<()> {
            for entry in entries {
                let name = entry
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::Deserialize("location without name".into()))?;
                let parent = entry.get("parent").and_then(|v| v.as_u64());
                let object = entry.get("object").filter(|v| !v.is_null());

                let loc = match parent {
                    None => rt.root,
                    Some(p) => {
                        let parent = *ids.get(p as usize).ok_or_else(|| {
                            CoreError::Deserialize("parent listed after child".into())
                        })?;
                        match object {
                            Some(obj_json) => {
                                let kind =
                                    obj_json.get("kind").and_then(|v| v.as_str()).ok_or_else(
                                        || CoreError::Deserialize("object without kind".into()),
                                    )?;
                                let loc = rt.create_from_prototype(parent, kind)?;
                                if let Some(data) = rt.graph.location_mut(loc) {
                                    data.name = name.to_string();
                                }
                                loc
                            }
                            None => {
                                let loc = rt.graph.create_location(name, Some(parent));
                                if let Some(obj) = rt.graph.object_mut(parent)
                                    && let Some(m) = object_cast_mut::<Machine>(obj)
                                {
                                    m.adopt_child(loc);
                                }
                                loc
                            }
                        }
                    }
                };
                rt.scheduler.suppress(loc);
                ids.push(loc);

                if let Some(data) = rt.graph.location_mut(loc) {
                    if let Some(pos) = entry.get("position").and_then(|v| v.as_array())
                        && let (Some(x), Some(y)) =
                            (pos.first().and_then(|v| v.as_f64()), pos.get(1).and_then(|v| v.as_f64()))
                    {
                        data.position = glam::Vec2::new(x as f32, y as f32);
                    }
                    if let Some(scale) = entry.get("scale").and_then(|v| v.as_f64()) {
                        data.scale = scale as f32;
                    }
                }
                if let Some(obj_json) = object
                    && let Some(state) = obj_json.get("state")
                    && let Some(obj) = rt.graph.object_mut(loc)
                {
                    obj.restore(state);
                }
            }

            let connections = doc
                .get("connections")
                .and_then(|v| v.as_array())
                .ok_or_else(|| CoreError::Deserialize("missing connections".into()))?;
            for entry in connections {
                let from = entry.get("from").and_then(|v| v.as_u64());
                let to = entry.get("to").and_then(|v| v.as_u64());
                let arg_name = entry.get("arg").and_then(|v| v.as_str());
                let (Some(from), Some(to), Some(arg_name)) = (from, to, arg_name) else {
                    return Err(CoreError::Deserialize("malformed connection".into()));
                };
                let from = *ids.get(from as usize).ok_or_else(|| {
                    CoreError::Deserialize("connection endpoint out of range".into())
                })?;
                let to = *ids.get(to as usize).ok_or_else(|| {
                    CoreError::Deserialize("connection endpoint out of range".into())
                })?;
                let arg = rt.resolve_argument(from, arg_name).ok_or_else(|| {
                    CoreError::Deserialize(format!("unknown argument {arg_name:?}"))
                })?;
                rt.connect_to(from, arg, to)?;
            }
            Ok(())
        };

        let result = restore(self, entries, &mut ids);
        // The guard comes off whether restoration succeeded or not.
        for loc in ids {
            self.scheduler.release(loc);
        }
        result
    }
}

/// Run a closure on the worker thread and block until it completes,
/// returning its result. Returns `None` when the event slot is closed.
///
/// Deadlocks if called from the worker thread itself.
pub fn post_blocking<R, F>(slot: &TaskSlot, target: LocationId, f: F) -> Option<R>
where
    R: Send + 'static,
    F: FnOnce(&mut Runtime, LocationId) -> R + Send + 'static,
{
    struct Rendezvous<R> {
        state: Mutex<(bool, Option<R>)>,
        done: Condvar,
    }
    let rendezvous = Arc::new(Rendezvous {
        state: Mutex::new((false, None)),
        done: Condvar::new(),
    });
    let shared = rendezvous.clone();
    let task = Task::new(
        target,
        TaskKind::Function(Box::new(move |rt, loc| {
            let result = f(rt, loc);
            let mut state = shared.state.lock();
            state.0 = true;
            state.1 = Some(result);
            shared.done.notify_all();
        })),
    );
    if slot.send(task).is_err() {
        return None;
    }
    let mut state = rendezvous.state.lock();
    while !state.0 {
        rendezvous.done.wait(&mut state);
    }
    state.1.take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Precondition, is_type};
    use glam::Vec2;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct ProbeLog {
        runs: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
        timer_fires: Arc<AtomicUsize>,
        conns_added: Arc<AtomicUsize>,
        conns_removed: Arc<AtomicUsize>,
        updates: Arc<Mutex<Vec<LocationId>>>,
        errors_seen: Arc<Mutex<Vec<LocationId>>>,
    }

    struct Probe {
        log: ProbeLog,
        fail_on_run: bool,
    }

    impl Probe {
        fn new(log: ProbeLog) -> Box<Self> {
            Box::new(Self {
                log,
                fail_on_run: false,
            })
        }

        fn failing(log: ProbeLog) -> Box<Self> {
            Box::new(Self {
                log,
                fail_on_run: true,
            })
        }
    }

    impl Object for Probe {
        fn kind(&self) -> &'static str {
            "probe"
        }

        fn boxed_clone(&self) -> Box<dyn Object> {
            Box::new(Self {
                log: self.log.clone(),
                fail_on_run: self.fail_on_run,
            })
        }

        fn parts(&self) -> &'static [PartKind] {
            &[PartKind::Runnable]
        }

        fn run(&mut self, rt: &mut Runtime, here: LocationId) {
            if self.fail_on_run {
                rt.report_error(here, "probe failed");
            } else {
                self.log.runs.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn cancel(&mut self, _rt: &mut Runtime, _here: LocationId) {
            self.log.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn updated(&mut self, _rt: &mut Runtime, _here: LocationId, updated: LocationId) {
            self.log.updates.lock().push(updated);
        }

        fn errored(&mut self, _rt: &mut Runtime, _here: LocationId, errored: LocationId) {
            self.log.errors_seen.lock().push(errored);
        }

        fn connection_added(
            &mut self,
            _rt: &mut Runtime,
            _here: LocationId,
            _arg: ArgumentId,
            _conn: ConnectionId,
        ) {
            self.log.conns_added.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_removed(
            &mut self,
            _rt: &mut Runtime,
            _here: LocationId,
            _arg: ArgumentId,
            _conn: ConnectionId,
        ) {
            self.log.conns_removed.fetch_add(1, Ordering::SeqCst);
        }

        fn timer_notify(&mut self, _rt: &mut Runtime, _here: LocationId, _scheduled: Instant) {
            self.log.timer_fires.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Note {
        text: String,
    }

    impl Note {
        fn new(text: &str) -> Box<Self> {
            Box::new(Self {
                text: text.to_string(),
            })
        }
    }

    impl Object for Note {
        fn kind(&self) -> &'static str {
            "note"
        }

        fn boxed_clone(&self) -> Box<dyn Object> {
            Box::new(Self {
                text: self.text.clone(),
            })
        }

        fn text(&self) -> Option<String> {
            Some(self.text.clone())
        }

        fn set_text(&mut self, text: &str) {
            self.text = text.to_string();
        }

        fn state(&self) -> serde_json::Value {
            serde_json::json!({ "text": self.text })
        }

        fn restore(&mut self, state: &serde_json::Value) {
            if let Some(text) = state.get("text").and_then(|v| v.as_str()) {
                self.text = text.to_string();
            }
        }
    }

    fn requires_probe(target: Option<&dyn Object>) -> std::result::Result<(), String> {
        match target {
            Some(obj) if is_type::<Probe>(obj) => Ok(()),
            _ => Err("target must be a probe".to_string()),
        }
    }

    /// Seeker: its `sense` argument autoconnects to nearby probes.
    struct Seeker;

    static SENSE: Argument = Argument::new("sense")
        .with_radius(0.10)
        .with_requirements(&[requires_probe]);

    impl Object for Seeker {
        fn kind(&self) -> &'static str {
            "seeker"
        }

        fn boxed_clone(&self) -> Box<dyn Object> {
            Box::new(Seeker)
        }

        fn args(&self) -> &'static [&'static Argument] {
            static ARGS: [&Argument; 1] = [&SENSE];
            &ARGS
        }
    }

    #[test]
    fn test_run_chains_along_next() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let a = rt.create(rt.root(), "a", Probe::new(log.clone())).unwrap();
        let b_log = ProbeLog::default();
        let b = rt.create(rt.root(), "b", Probe::new(b_log.clone())).unwrap();
        rt.connect_to(a, &NEXT_ARG, b).unwrap();

        rt.schedule_run(a);
        rt.drain();
        assert_eq!(log.runs.load(Ordering::SeqCst), 1);
        assert_eq!(b_log.runs.load(Ordering::SeqCst), 1);
        rt.shutdown();
    }

    #[test]
    fn test_failed_run_stops_chain() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let a = rt.create(rt.root(), "a", Probe::failing(log.clone())).unwrap();
        let b = rt.create(rt.root(), "b", Probe::new(log.clone())).unwrap();
        rt.connect_to(a, &NEXT_ARG, b).unwrap();

        rt.schedule_run(a);
        rt.drain();
        assert_eq!(log.runs.load(Ordering::SeqCst), 0);
        assert!(rt.errors.has_error(a));
        rt.shutdown();
    }

    #[test]
    fn test_update_fans_out_to_observers() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let source = rt.create(rt.root(), "src", Note::new("x")).unwrap();
        let watcher = rt.create(rt.root(), "w", Probe::new(log.clone())).unwrap();
        rt.observe_updates(watcher, source);

        rt.schedule_update(source);
        rt.drain();
        assert_eq!(*log.updates.lock(), vec![source]);
        rt.shutdown();
    }

    #[test]
    fn test_error_reaches_observer_not_machine() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let x = rt.create(rt.root(), "x", Note::new("x")).unwrap();
        let watcher = rt.create(rt.root(), "w", Probe::new(log.clone())).unwrap();
        rt.observe_errors(watcher, x);

        rt.report_error(x, "boom");
        rt.drain();
        assert_eq!(*log.errors_seen.lock(), vec![x]);

        // Observed locations do not bubble into the machine's records.
        let machine = object_cast::<Machine>(rt.graph.object(rt.root()).unwrap()).unwrap();
        assert!(machine.children_with_errors().is_empty());
        rt.shutdown();
    }

    #[test]
    fn test_unobserved_error_recorded_by_machine() {
        let mut rt = Runtime::new();
        let x = rt.create(rt.root(), "x", Note::new("x")).unwrap();

        rt.report_error(x, "boom");
        rt.drain();
        let machine = object_cast::<Machine>(rt.graph.object(rt.root()).unwrap()).unwrap();
        assert_eq!(machine.children_with_errors(), &[x]);
        assert_eq!(rt.diagnostics(rt.root()), vec![(x, "boom".to_string())]);

        rt.clear_error(x);
        let machine = object_cast::<Machine>(rt.graph.object(rt.root()).unwrap()).unwrap();
        assert!(machine.children_with_errors().is_empty());
        assert!(rt.errors.is_empty());
        rt.shutdown();
    }

    #[test]
    fn test_error_propagates_through_nested_machines() {
        let mut rt = Runtime::new();
        let inner = rt
            .create(rt.root(), "inner", Box::new(Machine::new("inner")))
            .unwrap();
        let x = rt.create(inner, "x", Note::new("x")).unwrap();

        rt.report_error(x, "boom");
        rt.drain();

        let inner_machine = object_cast::<Machine>(rt.graph.object(inner).unwrap()).unwrap();
        assert_eq!(inner_machine.children_with_errors(), &[x]);
        let root_machine = object_cast::<Machine>(rt.graph.object(rt.root()).unwrap()).unwrap();
        assert_eq!(root_machine.children_with_errors(), &[inner]);
        assert_eq!(rt.diagnostics(rt.root()), vec![(x, "boom".to_string())]);

        // Clearing unwinds both levels.
        rt.clear_error(x);
        let inner_machine = object_cast::<Machine>(rt.graph.object(inner).unwrap()).unwrap();
        assert!(inner_machine.children_with_errors().is_empty());
        let root_machine = object_cast::<Machine>(rt.graph.object(rt.root()).unwrap()).unwrap();
        assert!(root_machine.children_with_errors().is_empty());
        rt.shutdown();
    }

    #[test]
    fn test_second_report_is_dropped() {
        let mut rt = Runtime::new();
        let x = rt.create(rt.root(), "x", Note::new("x")).unwrap();
        rt.report_error(x, "first");
        rt.report_error(x, "second");
        rt.errors.with_error(x, |e| assert_eq!(e.unwrap().text, "first"));
        rt.drain();
        rt.shutdown();
    }

    #[test]
    fn test_connect_requirement_failure_lands_in_error_table() {
        let mut rt = Runtime::new();
        let seeker = rt.create(rt.root(), "s", Box::new(Seeker)).unwrap();
        let note = rt.create(rt.root(), "n", Note::new("x")).unwrap();

        let result = rt.connect_to(seeker, &SENSE, note);
        assert!(matches!(
            result,
            Err(CoreError::Graph(GraphError::RequirementsNotMet(_)))
        ));
        assert!(rt.errors.has_error(seeker));
        assert_eq!(rt.graph.connection_count(), 0);
        rt.shutdown();
    }

    #[test]
    fn test_concrete_type_match_terminates_connection() {
        static TYPED: Argument = Argument::new("typed")
            .with_precondition(Precondition::RequiresConcreteType(is_type::<Note>));

        let mut rt = Runtime::new();
        let a = rt.create(rt.root(), "a", Note::new("a")).unwrap();
        let b = rt.create(rt.root(), "b", Note::new("b")).unwrap();

        let conn = rt.connect_to(a, &TYPED, b).unwrap();
        assert_eq!(
            rt.graph.connection(conn).unwrap().pointer_behavior,
            PointerBehavior::TerminateHere
        );
        rt.shutdown();
    }

    #[test]
    fn test_connection_hooks_fire() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let a = rt.create(rt.root(), "a", Probe::new(log.clone())).unwrap();
        let b = rt.create(rt.root(), "b", Note::new("b")).unwrap();

        let conn = rt.connect_to(a, &NEXT_ARG, b).unwrap();
        assert_eq!(log.conns_added.load(Ordering::SeqCst), 1);

        rt.disconnect(conn).unwrap();
        assert_eq!(log.conns_removed.load(Ordering::SeqCst), 1);
        assert!(rt.disconnect(conn).is_err());
        assert_eq!(log.conns_removed.load(Ordering::SeqCst), 1);
        rt.shutdown();
    }

    #[test]
    fn test_autoconnect_picks_nearest_satisfying_target() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let seeker = rt.create(rt.root(), "seeker", Box::new(Seeker)).unwrap();
        // Wrong type 2cm away, satisfying probe 5cm away, probe 15cm away.
        let near_note = rt.create(rt.root(), "near", Note::new("n")).unwrap();
        let probe = rt.create(rt.root(), "probe", Probe::new(log.clone())).unwrap();
        let far_probe = rt.create(rt.root(), "far", Probe::new(log.clone())).unwrap();
        rt.graph.location_mut(near_note).unwrap().position = Vec2::new(0.02, 0.0);
        rt.graph.location_mut(probe).unwrap().position = Vec2::new(0.05, 0.0);
        rt.graph.location_mut(far_probe).unwrap().position = Vec2::new(0.15, 0.0);

        rt.set_position(seeker, Vec2::ZERO);
        assert_eq!(rt.graph.arg_target(seeker, SENSE.id()), Some(probe));
        assert_eq!(rt.graph.connection_count(), 1);
        rt.shutdown();
    }

    #[test]
    fn test_autoconnect_rewires_on_movement() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let seeker = rt.create(rt.root(), "seeker", Box::new(Seeker)).unwrap();
        let first = rt.create(rt.root(), "first", Probe::new(log.clone())).unwrap();
        let second = rt.create(rt.root(), "second", Probe::new(log.clone())).unwrap();
        rt.graph.location_mut(first).unwrap().position = Vec2::new(0.05, 0.0);
        rt.graph.location_mut(second).unwrap().position = Vec2::new(0.30, 0.0);

        rt.set_position(seeker, Vec2::ZERO);
        assert_eq!(rt.graph.arg_target(seeker, SENSE.id()), Some(first));

        // Moving the other probe closer steals the connection.
        rt.set_position(second, Vec2::new(0.01, 0.0));
        assert_eq!(rt.graph.arg_target(seeker, SENSE.id()), Some(second));
        assert_eq!(rt.graph.connection_count(), 1);

        // Moving everything out of range severs it.
        rt.set_position(seeker, Vec2::new(5.0, 5.0));
        assert_eq!(rt.graph.arg_target(seeker, SENSE.id()), None);
        assert_eq!(rt.graph.connection_count(), 0);
        rt.shutdown();
    }

    #[test]
    fn test_incumbent_keeps_seat_at_equal_distance() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let seeker = rt.create(rt.root(), "seeker", Box::new(Seeker)).unwrap();
        let left = rt.create(rt.root(), "left", Probe::new(log.clone())).unwrap();
        let right = rt.create(rt.root(), "right", Probe::new(log.clone())).unwrap();
        rt.graph.location_mut(left).unwrap().position = Vec2::new(-0.05, 0.0);
        rt.graph.location_mut(right).unwrap().position = Vec2::new(0.05, 0.0);

        rt.set_position(seeker, Vec2::ZERO);
        let target = rt.graph.arg_target(seeker, SENSE.id()).unwrap();
        // Insertion order decides the first winner.
        assert_eq!(target, left);

        // Re-evaluating with both candidates equidistant changes nothing.
        rt.update_autoconnect(seeker);
        assert_eq!(rt.graph.arg_target(seeker, SENSE.id()), Some(left));
        rt.shutdown();
    }

    /// Follows its input: watches whatever its argument connects to.
    struct Follower {
        log: ProbeLog,
    }

    static INPUT: Argument = Argument::new("input");

    impl Object for Follower {
        fn kind(&self) -> &'static str {
            "follower"
        }

        fn boxed_clone(&self) -> Box<dyn Object> {
            Box::new(Self {
                log: self.log.clone(),
            })
        }

        fn args(&self) -> &'static [&'static Argument] {
            static ARGS: [&Argument; 1] = [&INPUT];
            &ARGS
        }

        fn connection_added(
            &mut self,
            rt: &mut Runtime,
            here: LocationId,
            _arg: ArgumentId,
            conn: ConnectionId,
        ) {
            crate::object::live_connection_added(rt, here, conn);
        }

        fn updated(&mut self, _rt: &mut Runtime, _here: LocationId, updated: LocationId) {
            self.log.updates.lock().push(updated);
        }
    }

    #[test]
    fn test_live_connection_follows_target() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let follower = rt
            .create(rt.root(), "f", Box::new(Follower { log: log.clone() }))
            .unwrap();
        let source = rt.create(rt.root(), "s", Note::new("v1")).unwrap();

        rt.connect_to(follower, &INPUT, source).unwrap();
        rt.drain();
        // Connecting scheduled an immediate re-evaluation.
        assert_eq!(*log.updates.lock(), vec![source]);

        // Later changes to the target keep flowing in.
        rt.schedule_update(source);
        rt.drain();
        assert_eq!(*log.updates.lock(), vec![source, source]);
        rt.shutdown();
    }

    #[test]
    fn test_destroy_cascade() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let a = rt.create(rt.root(), "a", Probe::new(log.clone())).unwrap();
        let b = rt.create(rt.root(), "b", Note::new("b")).unwrap();
        rt.connect_to(a, &NEXT_ARG, b).unwrap();
        rt.schedule_deadline(b, Instant::now() + Duration::from_secs(60))
            .unwrap();
        rt.report_error(b, "boom");

        rt.destroy(b);
        assert!(!rt.graph.contains(b));
        assert_eq!(rt.graph.connection_count(), 0);
        // The surviving endpoint heard about the removal.
        assert_eq!(log.conns_removed.load(Ordering::SeqCst), 1);
        assert_eq!(rt.timer.pending_count(), 0);
        assert!(!rt.errors.has_error(b));
        rt.shutdown();
    }

    #[test]
    fn test_destroy_errored_location_unwinds_ancestors() {
        let mut rt = Runtime::new();
        let inner = rt
            .create(rt.root(), "inner", Box::new(Machine::new("inner")))
            .unwrap();
        let x = rt.create(inner, "x", Note::new("x")).unwrap();

        rt.report_error(x, "boom");
        rt.drain();
        let root_machine = object_cast::<Machine>(rt.graph.object(rt.root()).unwrap()).unwrap();
        assert_eq!(root_machine.children_with_errors(), &[inner]);

        // Destroying the errored location unwinds the ancestor records,
        // not just its own table entry.
        rt.destroy(x);
        let inner_machine = object_cast::<Machine>(rt.graph.object(inner).unwrap()).unwrap();
        assert!(inner_machine.children_with_errors().is_empty());
        let root_machine = object_cast::<Machine>(rt.graph.object(rt.root()).unwrap()).unwrap();
        assert!(root_machine.children_with_errors().is_empty());
        assert!(rt.errors.is_empty());
        rt.shutdown();
    }

    #[test]
    fn test_suppressed_schedule_leaves_nothing_pending() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let p = rt.create(rt.root(), "p", Probe::new(log.clone())).unwrap();

        rt.scheduler.suppress(p);
        rt.schedule_run(p);
        // The guarded task is dropped outright, not parked in the arena.
        assert_eq!(rt.scheduler.pending_count(), 0);

        rt.scheduler.release(p);
        rt.drain();
        assert_eq!(log.runs.load(Ordering::SeqCst), 0);
        assert_eq!(rt.scheduler.pending_count(), 0);
        rt.shutdown();
    }

    #[test]
    fn test_cancel_clears_long_running_flag() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let p = rt.create(rt.root(), "p", Probe::new(log.clone())).unwrap();
        rt.graph.location_mut(p).unwrap().long_running = true;

        rt.schedule_cancel(p);
        rt.drain();
        assert_eq!(log.cancels.load(Ordering::SeqCst), 1);
        assert!(!rt.graph.location(p).unwrap().long_running);

        // Cancelling again is harmless; the hook is idempotent.
        rt.schedule_cancel(p);
        rt.drain();
        assert_eq!(log.cancels.load(Ordering::SeqCst), 2);
        rt.shutdown();
    }

    #[test]
    fn test_timer_fired_reaches_object() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let p = rt.create(rt.root(), "p", Probe::new(log.clone())).unwrap();

        rt.schedule_deadline(p, Instant::now() + Duration::from_millis(5))
            .unwrap();
        let task = rt.event_slot().recv().unwrap();
        rt.ingest(task);
        rt.drain();
        assert_eq!(log.timer_fires.load(Ordering::SeqCst), 1);
        rt.shutdown();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut rt = Runtime::new();
        rt.register_prototype(Note::new("proto"));
        rt.register_prototype(Box::new(Seeker));
        let a = rt.create(rt.root(), "a", Note::new("hello")).unwrap();
        let b = rt.create(rt.root(), "b", Note::new("world")).unwrap();
        rt.connect_to(a, &NEXT_ARG, b).unwrap();
        rt.graph.location_mut(a).unwrap().position = Vec2::new(1.0, 2.0);

        let doc = rt.serialize_state().unwrap();
        rt.shutdown();

        let mut restored = Runtime::new();
        restored.register_prototype(Note::new("proto"));
        restored.register_prototype(Box::new(Seeker));
        restored.deserialize_state(&doc).unwrap();

        assert_eq!(restored.graph.location_count(), 3);
        assert_eq!(restored.graph.connection_count(), 1);
        let machine =
            object_cast::<Machine>(restored.graph.object(restored.root()).unwrap()).unwrap();
        let children = machine.children().to_vec();
        assert_eq!(children.len(), 2);
        let ra = children[0];
        let rb = children[1];
        assert_eq!(
            restored.graph.object(ra).unwrap().text().as_deref(),
            Some("hello")
        );
        assert_eq!(restored.graph.location(ra).unwrap().name, "a");
        assert_eq!(restored.graph.location(ra).unwrap().position, Vec2::new(1.0, 2.0));
        assert_eq!(restored.graph.arg_target(ra, NEXT_ARG.id()), Some(rb));

        // Restoration scheduled nothing.
        assert_eq!(restored.scheduler.queue_len(), 0);
        assert_eq!(restored.scheduler.pending_count(), 0);
        restored.shutdown();
    }

    #[test]
    fn test_deserialize_rejects_unknown_version() {
        let mut rt = Runtime::new();
        let doc = serde_json::json!({ "version": 99, "locations": [], "connections": [] });
        assert!(matches!(
            rt.deserialize_state(&doc),
            Err(CoreError::Deserialize(_))
        ));
        rt.shutdown();
    }

    #[test]
    fn test_worker_thread_with_post_blocking() {
        let mut rt = Runtime::new();
        let log = ProbeLog::default();
        let p = rt.create(rt.root(), "p", Probe::new(log.clone())).unwrap();
        let slot = rt.event_slot();
        let stop = StopToken::new();

        let worker = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                rt.run_thread(&stop);
                rt
            })
        };

        let count = post_blocking(&slot, p, |rt, loc| {
            rt.schedule_run(loc);
            rt.graph().location_count()
        })
        .unwrap();
        assert_eq!(count, 2);

        stop.stop();
        slot.close();
        let mut rt = worker.join().unwrap();
        rt.drain();
        assert_eq!(log.runs.load(Ordering::SeqCst), 1);
        rt.shutdown();
    }
}
