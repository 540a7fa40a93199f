//! Cross-thread task handoff.
//!
//! [`TaskSlot`] is a single-slot channel: one atomic pointer exchanged with
//! compare-and-swap on the fast path, a mutex/condvar pair on the blocking
//! slow paths. Producers on any thread hand tasks to the single consumer
//! (the worker thread). The depth-one buffer is deliberate: it gives
//! `force_send` its displacement semantics, which `send` callers rely on
//! for backpressure.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;

use crate::task::Task;

/// A depth-one channel carrying [`Task`]s to the worker thread.
pub struct TaskSlot {
    slot: AtomicPtr<Task>,
    /// Guards the closed flag and condvar waits.
    closed: Mutex<bool>,
    space: Condvar,
    filled: Condvar,
}

assert_impl_all!(Task: Send);
assert_impl_all!(TaskSlot: Send, Sync);

impl Default for TaskSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSlot {
    pub fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
            closed: Mutex::new(false),
            space: Condvar::new(),
            filled: Condvar::new(),
        }
    }

    fn try_place(&self, raw: *mut Task) -> bool {
        self.slot
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn notify_filled(&self) {
        let _guard = self.closed.lock();
        self.filled.notify_one();
    }

    /// Deliver a task, blocking while the slot is occupied. Returns the
    /// task back when the channel has been closed.
    pub fn send(&self, task: Task) -> Result<(), Task> {
        let raw = Box::into_raw(Box::new(task));
        loop {
            if self.try_place(raw) {
                self.notify_filled();
                return Ok(());
            }
            let mut closed = self.closed.lock();
            if *closed {
                // Reclaim ownership of the boxed task.
                let task = *unsafe { Box::from_raw(raw) };
                return Err(task);
            }
            if self.slot.load(Ordering::Acquire).is_null() {
                continue;
            }
            self.space.wait(&mut closed);
        }
    }

    /// Deliver a task, blocking at most until `deadline` while the slot is
    /// occupied. Returns the task back when the channel has been closed or
    /// the deadline passes with the slot still full. Lets producers with
    /// their own stop signal re-check it between bounded waits.
    pub fn send_until(&self, task: Task, deadline: Instant) -> Result<(), Task> {
        let raw = Box::into_raw(Box::new(task));
        loop {
            if self.try_place(raw) {
                self.notify_filled();
                return Ok(());
            }
            let mut closed = self.closed.lock();
            if *closed {
                return Err(*unsafe { Box::from_raw(raw) });
            }
            if self.slot.load(Ordering::Acquire).is_null() {
                continue;
            }
            if self.space.wait_until(&mut closed, deadline).timed_out() {
                drop(closed);
                if self.try_place(raw) {
                    self.notify_filled();
                    return Ok(());
                }
                return Err(*unsafe { Box::from_raw(raw) });
            }
        }
    }

    /// Deliver a task only if the slot is free.
    pub fn try_send(&self, task: Task) -> Result<(), Task> {
        if *self.closed.lock() {
            return Err(task);
        }
        let raw = Box::into_raw(Box::new(task));
        if self.try_place(raw) {
            self.notify_filled();
            Ok(())
        } else {
            Err(*unsafe { Box::from_raw(raw) })
        }
    }

    /// Deliver a task without ever blocking, displacing whatever currently
    /// occupies the slot. The displaced task is returned to the caller.
    /// Used by producers that only care about the freshest value.
    pub fn force_send(&self, task: Task) -> Option<Task> {
        let raw = Box::into_raw(Box::new(task));
        let previous = self.slot.swap(raw, Ordering::AcqRel);
        self.notify_filled();
        if previous.is_null() {
            None
        } else {
            // Displacement freed the slot for no one; space waiters only
            // care when the slot empties, so no space notification here.
            Some(*unsafe { Box::from_raw(previous) })
        }
    }

    /// Take the current task without blocking.
    pub fn try_recv(&self) -> Option<Task> {
        let raw = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            None
        } else {
            let task = *unsafe { Box::from_raw(raw) };
            let _guard = self.closed.lock();
            self.space.notify_one();
            Some(task)
        }
    }

    /// Block until a task arrives. Returns `None` once the channel is
    /// closed and drained. Single consumer only.
    pub fn recv(&self) -> Option<Task> {
        loop {
            if let Some(task) = self.try_recv() {
                return Some(task);
            }
            let mut closed = self.closed.lock();
            // Re-check under the lock so a fill between the swap above and
            // this wait cannot be missed.
            if !self.slot.load(Ordering::Acquire).is_null() {
                continue;
            }
            if *closed {
                return None;
            }
            self.filled.wait(&mut closed);
        }
    }

    /// Close the channel: pending and future `send`s fail, `recv` drains
    /// the slot and then returns `None`.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        *closed = true;
        self.space.notify_all();
        self.filled.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        let raw = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

/// Cooperative stop signal shared between the worker and timer threads.
#[derive(Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
