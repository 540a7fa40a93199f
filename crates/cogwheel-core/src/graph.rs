//! The object/connection graph.
//!
//! Locations and connections live in slotmap arenas; every reference between
//! them is a generation-checked key, so a dangling reference is observable as
//! a stale key rather than undefined behavior. The worker thread is the only
//! writer.
//!
//! Observer relationships are stored twice, once on each side
//! (`update_observers` on the observed location, `observing_updates` on the
//! observer), and the two sets are exact mutual inverses at every quiescent
//! point. The only code allowed to touch them are the paired
//! observe/stop-observing methods below and the destroy cascade.

use glam::Vec2;
use slotmap::{SlotMap, new_key_type};
use std::time::Instant;

use crate::object::{Object, ArgumentId, object_cast_mut};
use crate::runtime::Runtime;

new_key_type! {
    /// Generation-checked key for a graph location.
    pub struct LocationId;

    /// Generation-checked key for a connection between two locations.
    pub struct ConnectionId;
}

/// Whether a connection resolves through pointer-like objects or stops at
/// the location it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerBehavior {
    /// Follow pointer-like objects to their referent.
    FollowPointers,
    /// Stop at the connected location itself.
    TerminateHere,
}

/// A directed edge from one location's argument to another location.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub argument: ArgumentId,
    pub from: LocationId,
    pub to: LocationId,
    pub pointer_behavior: PointerBehavior,
}

/// A place in a machine that can hold an object.
pub struct LocationData {
    pub name: String,
    pub position: Vec2,
    pub scale: f32,
    pub parent: Option<LocationId>,
    pub object: Option<Box<dyn Object>>,
    /// Connections whose `from` endpoint is this location.
    pub outgoing: Vec<ConnectionId>,
    /// Connections whose `to` endpoint is this location.
    pub incoming: Vec<ConnectionId>,
    /// Locations that want `updated` notifications about this one.
    pub update_observers: Vec<LocationId>,
    /// Locations this one observes for updates. Inverse of the above.
    pub observing_updates: Vec<LocationId>,
    /// Locations that want `errored` notifications about this one.
    pub error_observers: Vec<LocationId>,
    /// Locations this one observes for errors. Inverse of the above.
    pub observing_errors: Vec<LocationId>,
    /// When this location's object last finished running.
    pub last_finished: Option<Instant>,
    /// Set while the object performs long-running work.
    pub long_running: bool,
}

impl LocationData {
    fn new(name: String, parent: Option<LocationId>) -> Self {
        Self {
            name,
            position: Vec2::ZERO,
            scale: 1.0,
            parent,
            object: None,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            update_observers: Vec::new(),
            observing_updates: Vec::new(),
            error_observers: Vec::new(),
            observing_errors: Vec::new(),
            last_finished: None,
            long_running: false,
        }
    }
}

/// Arena storage for locations and connections.
#[derive(Default)]
pub struct Graph {
    locations: SlotMap<LocationId, LocationData>,
    connections: SlotMap<ConnectionId, Connection>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty location. The caller is responsible for registering
    /// it with its parent machine's child list.
    pub fn create_location(
        &mut self,
        name: impl Into<String>,
        parent: Option<LocationId>,
    ) -> LocationId {
        let id = self
            .locations
            .insert(LocationData::new(name.into(), parent));
        tracing::trace!(target: "cogwheel_core::graph", ?id, "location created");
        id
    }

    pub fn contains(&self, loc: LocationId) -> bool {
        self.locations.contains_key(loc)
    }

    pub fn location(&self, loc: LocationId) -> Option<&LocationData> {
        self.locations.get(loc)
    }

    pub fn location_mut(&mut self, loc: LocationId) -> Option<&mut LocationData> {
        self.locations.get_mut(loc)
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Put an object into an empty location, returning the previous
    /// occupant, if any.
    pub fn insert_object(
        &mut self,
        loc: LocationId,
        object: Box<dyn Object>,
    ) -> Option<Box<dyn Object>> {
        let data = self.locations.get_mut(loc)?;
        data.object.replace(object)
    }

    /// Remove and return the object at `loc`. Used both for drag-extraction
    /// and for the take/put-back pattern around hook invocation.
    pub fn take_object(&mut self, loc: LocationId) -> Option<Box<dyn Object>> {
        self.locations.get_mut(loc)?.object.take()
    }

    pub fn put_back_object(&mut self, loc: LocationId, object: Box<dyn Object>) {
        if let Some(data) = self.locations.get_mut(loc) {
            data.object = Some(object);
        }
    }

    pub fn object(&self, loc: LocationId) -> Option<&dyn Object> {
        self.locations.get(loc)?.object.as_deref()
    }

    pub fn object_mut(&mut self, loc: LocationId) -> Option<&mut dyn Object> {
        self.locations.get_mut(loc)?.object.as_deref_mut()
    }

    pub fn connection(&self, conn: ConnectionId) -> Option<&Connection> {
        self.connections.get(conn)
    }

    pub fn connection_target(&self, conn: ConnectionId) -> Option<LocationId> {
        self.connections.get(conn).map(|c| c.to)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Insert a connection edge into both endpoint lists. Requirement checks
    /// and hook invocation happen in the runtime layer.
    pub fn add_connection(&mut self, connection: Connection) -> Option<ConnectionId> {
        if !self.locations.contains_key(connection.from)
            || !self.locations.contains_key(connection.to)
        {
            return None;
        }
        let id = self.connections.insert(connection);
        // from == to is legal; avoid aliasing the same location twice.
        if connection.from == connection.to {
            let data = &mut self.locations[connection.from];
            data.outgoing.push(id);
            data.incoming.push(id);
        } else {
            self.locations[connection.from].outgoing.push(id);
            self.locations[connection.to].incoming.push(id);
        }
        tracing::trace!(target: "cogwheel_core::graph", ?id, "connection added");
        Some(id)
    }

    /// Remove a connection from the arena and from both endpoint lists.
    /// Looks the edge up by id, so a second removal of the same id is a
    /// no-op returning `None` rather than a double mutation.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(conn)?;
        if let Some(from) = self.locations.get_mut(connection.from) {
            from.outgoing.retain(|c| *c != conn);
        }
        if let Some(to) = self.locations.get_mut(connection.to) {
            to.incoming.retain(|c| *c != conn);
        }
        tracing::trace!(target: "cogwheel_core::graph", id = ?conn, "connection removed");
        Some(connection)
    }

    /// Outgoing connections of `loc` attached to the given argument.
    pub fn outgoing_for_arg(&self, loc: LocationId, argument: ArgumentId) -> Vec<ConnectionId> {
        let Some(data) = self.locations.get(loc) else {
            return Vec::new();
        };
        data.outgoing
            .iter()
            .copied()
            .filter(|c| {
                self.connections
                    .get(*c)
                    .is_some_and(|conn| conn.argument == argument)
            })
            .collect()
    }

    /// First target of `loc`'s given argument, if connected.
    pub fn arg_target(&self, loc: LocationId, argument: ArgumentId) -> Option<LocationId> {
        self.outgoing_for_arg(loc, argument)
            .first()
            .and_then(|c| self.connection_target(*c))
    }

    /// Make `observer` receive `updated` notifications about `observed`.
    /// Maintains both halves of the inverse pair; duplicates are ignored.
    pub fn observe_updates(&mut self, observer: LocationId, observed: LocationId) {
        if !self.locations.contains_key(observer) || !self.locations.contains_key(observed) {
            return;
        }
        let fwd = &mut self.locations[observed].update_observers;
        if fwd.contains(&observer) {
            return;
        }
        fwd.push(observer);
        self.locations[observer].observing_updates.push(observed);
    }

    pub fn stop_observing_updates(&mut self, observer: LocationId, observed: LocationId) {
        if let Some(data) = self.locations.get_mut(observed) {
            data.update_observers.retain(|o| *o != observer);
        }
        if let Some(data) = self.locations.get_mut(observer) {
            data.observing_updates.retain(|o| *o != observed);
        }
    }

    /// Make `observer` receive `errored` notifications about `observed`.
    pub fn observe_errors(&mut self, observer: LocationId, observed: LocationId) {
        if !self.locations.contains_key(observer) || !self.locations.contains_key(observed) {
            return;
        }
        let fwd = &mut self.locations[observed].error_observers;
        if fwd.contains(&observer) {
            return;
        }
        fwd.push(observer);
        self.locations[observer].observing_errors.push(observed);
    }

    pub fn stop_observing_errors(&mut self, observer: LocationId, observed: LocationId) {
        if let Some(data) = self.locations.get_mut(observed) {
            data.error_observers.retain(|o| *o != observer);
        }
        if let Some(data) = self.locations.get_mut(observer) {
            data.observing_errors.retain(|o| *o != observed);
        }
    }

    /// Destroy a location: removes every connection touching it, repairs
    /// observer sets on both sides, and unregisters it from its parent
    /// machine's child lists. Returns the removed connections so the caller
    /// can deliver `connection_removed` hooks to surviving endpoints, and
    /// the destroyed location's object.
    pub fn destroy_location(
        &mut self,
        loc: LocationId,
    ) -> Option<(Vec<(ConnectionId, Connection)>, Option<Box<dyn Object>>)> {
        if !self.locations.contains_key(loc) {
            return None;
        }

        let touching: Vec<ConnectionId> = {
            let data = &self.locations[loc];
            data.outgoing
                .iter()
                .chain(data.incoming.iter())
                .copied()
                .collect()
        };
        let mut removed = Vec::with_capacity(touching.len());
        for conn in touching {
            if let Some(connection) = self.remove_connection(conn) {
                removed.push((conn, connection));
            }
        }

        let observers = {
            let data = &self.locations[loc];
            (
                data.update_observers.clone(),
                data.observing_updates.clone(),
                data.error_observers.clone(),
                data.observing_errors.clone(),
            )
        };
        for observer in observers.0 {
            if let Some(data) = self.locations.get_mut(observer) {
                data.observing_updates.retain(|o| *o != loc);
            }
        }
        for observed in observers.1 {
            if let Some(data) = self.locations.get_mut(observed) {
                data.update_observers.retain(|o| *o != loc);
            }
        }
        for observer in observers.2 {
            if let Some(data) = self.locations.get_mut(observer) {
                data.observing_errors.retain(|o| *o != loc);
            }
        }
        for observed in observers.3 {
            if let Some(data) = self.locations.get_mut(observed) {
                data.error_observers.retain(|o| *o != loc);
            }
        }

        let data = self.locations.remove(loc)?;
        if let Some(parent) = data.parent
            && let Some(parent_obj) = self.object_mut(parent)
            && let Some(machine) = object_cast_mut::<Machine>(parent_obj)
        {
            machine.forget_child(loc);
        }
        tracing::trace!(target: "cogwheel_core::graph", ?loc, "location destroyed");
        Some((removed, data.object))
    }

    /// Locations among `candidates` whose position lies within `radius`
    /// meters of `point`.
    pub fn locations_within(
        &self,
        candidates: &[LocationId],
        point: Vec2,
        radius: f32,
    ) -> Vec<LocationId> {
        let r2 = radius * radius;
        candidates
            .iter()
            .copied()
            .filter(|loc| {
                self.locations
                    .get(*loc)
                    .is_some_and(|data| data.position.distance_squared(point) <= r2)
            })
            .collect()
    }
}

/// A container object: a 2D canvas of child locations.
///
/// The `children` vector preserves insertion order; autoconnect candidate
/// scans iterate it front to back, which makes tie-breaking deterministic.
pub struct Machine {
    pub name: String,
    children: Vec<LocationId>,
    children_with_errors: Vec<LocationId>,
    /// Children lifted to the front panel for quick access.
    front: Vec<LocationId>,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            children_with_errors: Vec::new(),
            front: Vec::new(),
        }
    }

    pub fn children(&self) -> &[LocationId] {
        &self.children
    }

    pub fn children_with_errors(&self) -> &[LocationId] {
        &self.children_with_errors
    }

    pub fn adopt_child(&mut self, child: LocationId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    pub fn forget_child(&mut self, child: LocationId) {
        self.children.retain(|c| *c != child);
        self.children_with_errors.retain(|c| *c != child);
        self.front.retain(|c| *c != child);
    }

    pub fn bring_to_front(&mut self, child: LocationId) {
        if self.children.contains(&child) && !self.front.contains(&child) {
            self.front.push(child);
        }
    }

    pub fn front(&self) -> &[LocationId] {
        &self.front
    }

    pub(crate) fn record_child_error(&mut self, child: LocationId) {
        if !self.children_with_errors.contains(&child) {
            self.children_with_errors.push(child);
        }
    }

    pub(crate) fn clear_child_error(&mut self, child: LocationId) {
        self.children_with_errors.retain(|c| *c != child);
    }
}

impl Object for Machine {
    fn kind(&self) -> &'static str {
        "machine"
    }

    fn name(&self) -> &str {
        &self.name
    }

    // Prototype clones start empty; children are per-instance.
    fn boxed_clone(&self) -> Box<dyn Object> {
        Box::new(Machine::new(self.name.clone()))
    }

    fn errored(&mut self, rt: &mut Runtime, here: LocationId, errored: LocationId) {
        self.record_child_error(errored);
        let (has_observers, parent) = match rt.graph().location(here) {
            Some(data) => (!data.error_observers.is_empty(), data.parent),
            None => return,
        };
        if has_observers {
            return;
        }
        match parent {
            Some(parent) => rt.schedule_errored(parent, here),
            None => {
                // Root machine: nobody left to tell.
                tracing::error!(
                    target: "cogwheel_core::graph",
                    machine = %self.name,
                    ?errored,
                    "unhandled error in root machine"
                );
            }
        }
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name })
    }

    fn restore(&mut self, state: &serde_json::Value) {
        if let Some(name) = state.get("name").and_then(|v| v.as_str()) {
            self.name = name.to_string();
        }
    }
}
