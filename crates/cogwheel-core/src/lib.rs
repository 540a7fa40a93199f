//! Core execution substrate for Cogwheel.
//!
//! This crate provides the runtime that visual programs execute on: an
//! object/connection graph, a dependency-aware task scheduler, a timer
//! service, an error side table and capability sync groups.
//!
//! # Architecture
//!
//! A program is a graph of [`LocationData`] nodes, each optionally holding a
//! boxed [`Object`] (the unit of behavior). Directed [`Connection`]s attach
//! an object's [`Argument`]s to other locations. The whole graph hangs off a
//! single root [`Machine`].
//!
//! All object mutation happens on one worker thread driving
//! [`Runtime::run_loop`]. Work arrives as [`Task`]s: either produced on the
//! worker thread itself, delivered by the timer thread, or posted from
//! other threads through the single-slot [`TaskSlot`] channel.
//!
//! # Quick start
//!
//! ```ignore
//! use cogwheel_core::{Runtime, Object};
//!
//! let mut rt = Runtime::new();
//! let loc = rt.create(rt.root(), "hello", Box::new(MyObject::default()))?;
//! rt.schedule_run(loc);
//! rt.drain();
//! ```
//!
//! # Task dependencies
//!
//! Tasks form a partial order: a task with predecessors stays parked until
//! the last of them executes. While a task runs, tasks it creates
//! automatically hold back its declared successors, so multi-step chains
//! extend themselves without manual edge bookkeeping. See
//! [`Scheduler::depend`] and [`Scheduler::begin_then`].
//!
//! # Errors
//!
//! Objects report failures into the [`ErrorTable`] rather than panicking or
//! returning through the call stack. An error halts the reporting node's
//! control flow, notifies its error observers and bubbles through parent
//! machines; see [`Runtime::report_error`].

pub mod channel;
pub mod error;
pub mod errors;
pub mod graph;
pub mod object;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod timer;

pub use channel::{StopToken, TaskSlot};
pub use error::{CoreError, GraphError, Result, SyncError, TaskError, TimerError};
pub use errors::{ErrorTable, NodeError};
pub use graph::{
    Connection, ConnectionId, Graph, LocationData, LocationId, Machine, PointerBehavior,
};
pub use object::{
    Argument, ArgumentId, NEXT_ARG, Object, PartKind, Precondition, Requirement,
    live_connection_added, object_cast, object_cast_mut,
};
pub use runtime::{Runtime, post_blocking};
pub use scheduler::{Scheduler, TaskId, ThenScope};
pub use sync::{
    Gear, LongRunning, OnOff, Runnable, SyncHandle, SyncPeer, forward_do, forward_notify, sync,
    unsync,
};
pub use task::{Task, TaskKind};
pub use timer::{DeadlineQueue, TimerService};
