//! The object model: behavior/data units held by graph locations.
//!
//! An [`Object`] is the unit of behavior in a Cogwheel machine. Objects live
//! inside graph locations and react to lifecycle hooks delivered by the task
//! scheduler: `run`, `cancel`, `updated`, `errored`, connection changes and
//! timer expiry. All hooks execute on the worker thread, which is the only
//! thread allowed to mutate objects.
//!
//! Connection points are described by [`Argument`] values. Arguments are
//! declared as `static` items so their address is stable for the lifetime of
//! the program; that address is the argument's identity ([`ArgumentId`]),
//! which lets display names repeat freely.

use std::any::Any;
use std::time::Instant;

use glam::Vec2;

use crate::graph::{ConnectionId, LocationId};
use crate::runtime::Runtime;

/// A behavior/data unit stored in a graph location.
///
/// All methods have default no-op implementations so simple data-only objects
/// implement just [`Object::name`] and [`Object::boxed_clone`].
pub trait Object: Any + Send {
    /// Stable type tag. Keys the prototype registry and the serialization
    /// boundary, so it must not change between versions.
    fn kind(&self) -> &'static str;

    /// Display name of this object. Defaults to the type tag.
    fn name(&self) -> &str {
        self.kind()
    }

    /// Clone this object into a fresh box. Used by the prototype registry.
    fn boxed_clone(&self) -> Box<dyn Object>;

    /// The connection points this object exposes.
    fn args(&self) -> &'static [&'static Argument] {
        &[]
    }

    /// Capability kinds this object participates in, for generic UI
    /// affordances (context menus, run buttons) without per-type switches.
    fn parts(&self) -> &'static [PartKind] {
        &[]
    }

    /// Textual content, if this object carries any.
    fn text(&self) -> Option<String> {
        None
    }

    /// Replace the textual content. No-op for objects without text.
    fn set_text(&mut self, _text: &str) {}

    /// Perform this object's primary action.
    ///
    /// Errors are reported through [`Runtime::report_error`] rather than
    /// returned; a run that leaves no error at its location triggers
    /// control-flow chaining along [`NEXT_ARG`].
    fn run(&mut self, _rt: &mut Runtime, _here: LocationId) {}

    /// Interrupt a long-running action. Must be idempotent.
    fn cancel(&mut self, _rt: &mut Runtime, _here: LocationId) {}

    /// An observed location changed.
    fn updated(&mut self, _rt: &mut Runtime, _here: LocationId, _updated: LocationId) {}

    /// An observed location recorded an error.
    fn errored(&mut self, _rt: &mut Runtime, _here: LocationId, _errored: LocationId) {}

    /// A connection was attached to one of this object's arguments.
    fn connection_added(
        &mut self,
        _rt: &mut Runtime,
        _here: LocationId,
        _arg: ArgumentId,
        _conn: ConnectionId,
    ) {
    }

    /// A connection on one of this object's arguments was removed.
    fn connection_removed(
        &mut self,
        _rt: &mut Runtime,
        _here: LocationId,
        _arg: ArgumentId,
        _conn: ConnectionId,
    ) {
    }

    /// A deadline scheduled for this object's location expired.
    /// `scheduled` is the instant the deadline was set for, not the instant
    /// of delivery.
    fn timer_notify(&mut self, _rt: &mut Runtime, _here: LocationId, _scheduled: Instant) {}

    /// Serializable state blob for the persistence boundary.
    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Restore state produced by [`Object::state`].
    fn restore(&mut self, _state: &serde_json::Value) {}
}

/// Attempt to downcast an object reference to a concrete type.
pub fn object_cast<T: Object>(obj: &dyn Object) -> Option<&T> {
    (obj as &dyn Any).downcast_ref::<T>()
}

/// Attempt to downcast a mutable object reference to a concrete type.
pub fn object_cast_mut<T: Object>(obj: &mut dyn Object) -> Option<&mut T> {
    (obj as &mut dyn Any).downcast_mut::<T>()
}

/// Returns true when `obj` is a `T`. Usable as a
/// [`Precondition::RequiresConcreteType`] predicate.
pub fn is_type<T: Object>(obj: &dyn Object) -> bool {
    object_cast::<T>(obj).is_some()
}

/// Capability kinds an object can advertise through [`Object::parts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    /// The object can be run.
    Runnable,
    /// The object can be switched on and off.
    OnOff,
    /// The object performs long-running work that can be cancelled.
    LongRunning,
    /// The object wants timer expiry notifications.
    TimerNotify,
}

/// How strongly an argument insists on having a target.
#[derive(Clone, Copy)]
pub enum Precondition {
    /// A missing target is fine.
    Optional,
    /// The argument must resolve to some location; an empty one is fine.
    RequiresLocation,
    /// The argument must resolve to a location holding an object.
    RequiresObject,
    /// The target object must satisfy the given concrete-type predicate.
    /// Connections to such targets terminate at the location rather than
    /// following pointer-like objects onward.
    RequiresConcreteType(fn(&dyn Object) -> bool),
}

impl std::fmt::Debug for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Optional => write!(f, "Optional"),
            Self::RequiresLocation => write!(f, "RequiresLocation"),
            Self::RequiresObject => write!(f, "RequiresObject"),
            Self::RequiresConcreteType(_) => write!(f, "RequiresConcreteType(..)"),
        }
    }
}

/// A predicate an argument imposes on candidate targets. Returns a
/// human-readable reason on rejection.
pub type Requirement = fn(Option<&dyn Object>) -> std::result::Result<(), String>;

/// A connection-point descriptor.
///
/// Declare arguments as `static` items; identity is the static's address, so
/// two arguments may share a display name without colliding:
///
/// ```ignore
/// static INPUT: Argument = Argument::new("input")
///     .with_precondition(Precondition::RequiresObject)
///     .with_radius(0.10);
/// ```
pub struct Argument {
    name: &'static str,
    precondition: Precondition,
    autoconnect_radius: f32,
    anchor: Vec2,
    requirements: &'static [Requirement],
}

impl Argument {
    /// Create an argument with the given display name and no constraints.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            precondition: Precondition::Optional,
            autoconnect_radius: 0.0,
            anchor: Vec2::ZERO,
            requirements: &[],
        }
    }

    pub const fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    /// Enable autoconnection within `radius` meters. Zero disables.
    pub const fn with_radius(mut self, radius: f32) -> Self {
        self.autoconnect_radius = radius;
        self
    }

    /// Offset of this argument's attachment point from the object origin.
    pub const fn with_anchor(mut self, x: f32, y: f32) -> Self {
        self.anchor = Vec2::new(x, y);
        self
    }

    pub const fn with_requirements(mut self, requirements: &'static [Requirement]) -> Self {
        self.requirements = requirements;
        self
    }

    /// Display name. May be shared between distinct arguments.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn precondition(&self) -> Precondition {
        self.precondition
    }

    pub fn autoconnect_radius(&self) -> f32 {
        self.autoconnect_radius
    }

    pub fn anchor(&self) -> Vec2 {
        self.anchor
    }

    /// The address-derived identity of this argument.
    pub fn id(&'static self) -> ArgumentId {
        ArgumentId(self as *const Argument as usize)
    }

    /// Check a candidate target object against this argument's precondition
    /// and requirement predicates. Location existence is checked by the
    /// caller; `target` is the object at the candidate location, if any.
    pub fn check(&self, target: Option<&dyn Object>) -> std::result::Result<(), String> {
        match self.precondition {
            Precondition::Optional | Precondition::RequiresLocation => {}
            Precondition::RequiresObject => {
                if target.is_none() {
                    return Err(format!("argument {:?} requires an object", self.name));
                }
            }
            Precondition::RequiresConcreteType(pred) => match target {
                Some(obj) if pred(obj) => {}
                Some(obj) => {
                    return Err(format!(
                        "argument {:?} cannot accept a {:?}",
                        self.name,
                        obj.name()
                    ));
                }
                None => {
                    return Err(format!("argument {:?} requires an object", self.name));
                }
            },
        }
        for requirement in self.requirements {
            requirement(target)?;
        }
        Ok(())
    }

    /// True when the precondition names a concrete type and `target`
    /// satisfies it. Such connections terminate at the matched location.
    pub fn concrete_type_satisfied(&self, target: Option<&dyn Object>) -> bool {
        match (self.precondition, target) {
            (Precondition::RequiresConcreteType(pred), Some(obj)) => pred(obj),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Argument")
            .field("name", &self.name)
            .field("precondition", &self.precondition)
            .field("autoconnect_radius", &self.autoconnect_radius)
            .finish()
    }
}

/// Address-derived argument identity. Stable for the program lifetime
/// because arguments are statics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgumentId(usize);

/// The control-flow successor argument. After an object's `run` completes
/// without recording an error, whatever this argument points at is scheduled
/// next.
pub static NEXT_ARG: Argument = Argument::new("next");

/// Helper for objects whose argument targets should be watched for changes.
///
/// Call from [`Object::connection_added`]: makes `here` observe updates on
/// the connection's target and schedules a local re-evaluation so the object
/// reacts to the new input immediately.
pub fn live_connection_added(rt: &mut Runtime, here: LocationId, conn: ConnectionId) {
    if let Some(target) = rt.graph().connection_target(conn) {
        rt.observe_updates(here, target);
        rt.schedule_local_update(here, target);
    }
}
