//! The error side table.
//!
//! Errors attached to graph locations are kept out of line in a single
//! mutex-guarded table so that error creation and inspection work from any
//! thread holding a handle, without touching the graph. At most one error
//! per location; the first report wins until it is cleared.
//!
//! Lock order: this table's mutex is the innermost lock in the system.
//! Never call back into the graph, scheduler or sync groups while holding
//! it.

use std::panic::Location as SourceLocation;

use parking_lot::Mutex;

use crate::graph::LocationId;
use crate::object::Object;

/// An error attached to a graph location.
pub struct NodeError {
    /// Human-readable description.
    pub text: String,
    /// The location the error is attached to.
    pub source: LocationId,
    /// Object state captured for post-mortem repair, if any.
    pub saved_object: Option<Box<dyn Object>>,
    /// Source-code origin of the report.
    pub origin: &'static SourceLocation<'static>,
}

impl NodeError {
    #[track_caller]
    pub fn new(source: LocationId, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source,
            saved_object: None,
            origin: SourceLocation::caller(),
        }
    }

    pub fn with_saved_object(mut self, object: Box<dyn Object>) -> Self {
        self.saved_object = Some(object);
        self
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (reported at {}:{})",
            self.text,
            self.origin.file(),
            self.origin.line()
        )
    }
}

impl std::fmt::Debug for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeError")
            .field("text", &self.text)
            .field("source", &self.source)
            .field("origin", &format_args!("{}:{}", self.origin.file(), self.origin.line()))
            .field("saved_object", &self.saved_object.is_some())
            .finish()
    }
}

/// Side table mapping locations to their current error.
///
/// The entry list is small (errors are exceptional) so a vector scan beats
/// hash overhead. Invariant: no entry is ever present with its slot empty;
/// [`ErrorTable::manipulate`] removes the pair when the closure leaves
/// `None` behind.
#[derive(Default)]
pub struct ErrorTable {
    entries: Mutex<Vec<(LocationId, NodeError)>>,
}

impl ErrorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up (or lazily create) the error slot for `target`, apply `f`,
    /// and drop the entry if the slot ends up empty.
    pub fn manipulate<R>(
        &self,
        target: LocationId,
        f: impl FnOnce(&mut Option<NodeError>) -> R,
    ) -> R {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|(loc, _)| *loc == target);
        let mut slot = match index {
            Some(i) => Some(entries.swap_remove(i).1),
            None => None,
        };
        let result = f(&mut slot);
        if let Some(error) = slot {
            entries.push((target, error));
        }
        result
    }

    /// Record an error unless the target already has one. Returns whether
    /// the error was stored.
    pub fn report(&self, error: NodeError) -> bool {
        let target = error.source;
        self.manipulate(target, |slot| {
            if slot.is_some() {
                tracing::trace!(
                    target: "cogwheel_core::errors",
                    ?target,
                    text = %error.text,
                    "error dropped, location already has one"
                );
                false
            } else {
                tracing::error!(
                    target: "cogwheel_core::errors",
                    ?target,
                    text = %error.text,
                    "error reported"
                );
                *slot = Some(error);
                true
            }
        })
    }

    pub fn has_error(&self, target: LocationId) -> bool {
        self.entries.lock().iter().any(|(loc, _)| *loc == target)
    }

    /// Remove and return the error at `target`.
    pub fn take(&self, target: LocationId) -> Option<NodeError> {
        self.manipulate(target, |slot| slot.take())
    }

    /// Inspect the error at `target` without removing it.
    pub fn with_error<R>(
        &self,
        target: LocationId,
        f: impl FnOnce(Option<&NodeError>) -> R,
    ) -> R {
        let entries = self.entries.lock();
        f(entries
            .iter()
            .find(|(loc, _)| *loc == target)
            .map(|(_, e)| e))
    }

    /// Locations currently carrying an error.
    pub fn errored_locations(&self) -> Vec<LocationId> {
        self.entries.lock().iter().map(|(loc, _)| *loc).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
