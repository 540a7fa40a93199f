//! The timer service.
//!
//! Deadline bookkeeping lives in [`DeadlineQueue`], a pure structure driven
//! by explicit `Instant`s so tests never sleep. [`TimerService`] owns a
//! queue behind a mutex/condvar pair and a dedicated thread that sleeps
//! until the earliest deadline, then promotes every due entry into a
//! `TimerFired` task pushed through the task-handoff slot. The timer thread
//! never touches graph state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::{StopToken, TaskSlot};
use crate::error::TimerError;
use crate::graph::LocationId;
use crate::task::{Task, TaskKind};

/// Time-ordered multimap of deadlines. Multiple locations may share an
/// instant and one location may hold several deadlines.
#[derive(Default)]
pub struct DeadlineQueue {
    deadlines: BTreeMap<Instant, Vec<LocationId>>,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_at(&mut self, target: LocationId, when: Instant) {
        self.deadlines.entry(when).or_default().push(target);
    }

    /// Remove every deadline for `target`. Returns how many were dropped.
    pub fn cancel(&mut self, target: LocationId) -> usize {
        let mut dropped = 0;
        self.deadlines.retain(|_, targets| {
            let before = targets.len();
            targets.retain(|t| *t != target);
            dropped += before - targets.len();
            !targets.is_empty()
        });
        dropped
    }

    /// Remove one deadline for `target` at exactly `when`.
    pub fn cancel_at(&mut self, target: LocationId, when: Instant) -> bool {
        let Some(targets) = self.deadlines.get_mut(&when) else {
            return false;
        };
        let Some(index) = targets.iter().position(|t| *t == target) else {
            return false;
        };
        targets.swap_remove(index);
        if targets.is_empty() {
            self.deadlines.remove(&when);
        }
        true
    }

    /// Move `target`'s deadline from `old` to `new`. Fails when the old
    /// deadline is no longer present (it may have already fired).
    pub fn reschedule(
        &mut self,
        target: LocationId,
        old: Instant,
        new: Instant,
    ) -> Result<(), TimerError> {
        if !self.cancel_at(target, old) {
            return Err(TimerError::DeadlineNotFound);
        }
        self.schedule_at(target, new);
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().copied()
    }

    /// Remove and return every entry due at or before `now`, earliest
    /// first. Each entry carries the instant it was scheduled for.
    pub fn take_due(&mut self, now: Instant) -> Vec<(Instant, LocationId)> {
        let mut due = Vec::new();
        while let Some(when) = self.next_deadline() {
            if when > now {
                break;
            }
            if let Some(targets) = self.deadlines.remove(&when) {
                due.extend(targets.into_iter().map(|t| (when, t)));
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.deadlines.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

struct TimerShared {
    queue: Mutex<DeadlineQueue>,
    wakeup: Condvar,
    stop: StopToken,
    events: Arc<TaskSlot>,
}

/// Dedicated thread turning expired deadlines into `TimerFired` tasks.
pub struct TimerService {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl TimerService {
    /// Spawn the timer thread. Expired deadlines are delivered through
    /// `events`.
    pub fn start(events: Arc<TaskSlot>) -> Self {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(DeadlineQueue::new()),
            wakeup: Condvar::new(),
            stop: StopToken::new(),
            events,
        });
        let handle = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("cogwheel-timer".to_string())
                .spawn(move || timer_loop(&shared))
                .ok()
        };
        if handle.is_none() {
            tracing::error!(
                target: "cogwheel_core::timer",
                "failed to spawn timer thread"
            );
        }
        Self { shared, handle }
    }

    pub fn schedule_at(&self, target: LocationId, when: Instant) -> Result<(), TimerError> {
        if self.shared.stop.is_stopped() {
            return Err(TimerError::ServiceStopped);
        }
        self.shared.queue.lock().schedule_at(target, when);
        self.shared.wakeup.notify_one();
        tracing::trace!(target: "cogwheel_core::timer", ?target, "deadline scheduled");
        Ok(())
    }

    pub fn cancel(&self, target: LocationId) -> usize {
        let dropped = self.shared.queue.lock().cancel(target);
        if dropped > 0 {
            self.shared.wakeup.notify_one();
        }
        dropped
    }

    pub fn cancel_at(&self, target: LocationId, when: Instant) -> bool {
        let cancelled = self.shared.queue.lock().cancel_at(target, when);
        if cancelled {
            self.shared.wakeup.notify_one();
        }
        cancelled
    }

    /// Move a pending deadline. A new instant at or before the current time
    /// fires on the next timer-thread wakeup. Fails when the old deadline
    /// has already fired or was never set.
    pub fn reschedule_at(
        &self,
        target: LocationId,
        old: Instant,
        new: Instant,
    ) -> Result<(), TimerError> {
        if self.shared.stop.is_stopped() {
            return Err(TimerError::ServiceStopped);
        }
        self.shared.queue.lock().reschedule(target, old, new)?;
        self.shared.wakeup.notify_one();
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stop the timer thread and wait for it to exit. Pending deadlines
    /// are discarded.
    pub fn stop_and_join(&mut self) {
        self.shared.stop.stop();
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!(target: "cogwheel_core::timer", "timer thread panicked");
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// How long a delivery attempt may wait on a full slot before the stop
/// flag is re-checked. Bounds how long [`TimerService::stop_and_join`]
/// can take while the worker is not draining.
const DELIVERY_RETRY: Duration = Duration::from_millis(50);

fn timer_loop(shared: &TimerShared) {
    tracing::trace!(target: "cogwheel_core::timer", "timer thread started");
    let mut queue = shared.queue.lock();
    loop {
        if shared.stop.is_stopped() {
            break;
        }
        match queue.next_deadline() {
            None => {
                shared.wakeup.wait(&mut queue);
            }
            Some(when) => {
                let now = Instant::now();
                if when > now {
                    shared.wakeup.wait_until(&mut queue, when);
                    continue;
                }
                let due = queue.take_due(now);
                // Deliver without holding the queue lock; the slot may be
                // full until the worker drains.
                drop(queue);
                for (scheduled, target) in due {
                    tracing::trace!(
                        target: "cogwheel_core::timer",
                        ?target,
                        "deadline expired"
                    );
                    let mut task = Task::new(target, TaskKind::TimerFired { scheduled });
                    // Bounded sends so a stop request is honored even
                    // while the slot stays full.
                    loop {
                        if shared.stop.is_stopped() {
                            tracing::trace!(
                                target: "cogwheel_core::timer",
                                "stop requested, timer thread exiting"
                            );
                            return;
                        }
                        match shared
                            .events
                            .send_until(task, Instant::now() + DELIVERY_RETRY)
                        {
                            Ok(()) => break,
                            Err(returned) => {
                                if shared.events.is_closed() {
                                    tracing::trace!(
                                        target: "cogwheel_core::timer",
                                        "event channel closed, timer thread exiting"
                                    );
                                    return;
                                }
                                task = returned;
                            }
                        }
                    }
                }
                queue = shared.queue.lock();
            }
        }
    }
    tracing::trace!(target: "cogwheel_core::timer", "timer thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use std::time::Duration;

    fn locations(n: usize) -> Vec<LocationId> {
        let mut graph = Graph::new();
        (0..n).map(|i| graph.create_location(format!("l{i}"), None)).collect()
    }

    #[test]
    fn test_take_due_is_ordered_and_partial() {
        let locs = locations(3);
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule_at(locs[2], base + Duration::from_secs(3));
        queue.schedule_at(locs[0], base + Duration::from_secs(1));
        queue.schedule_at(locs[1], base + Duration::from_secs(2));

        assert_eq!(queue.next_deadline(), Some(base + Duration::from_secs(1)));

        let due = queue.take_due(base + Duration::from_secs(2));
        assert_eq!(
            due,
            vec![
                (base + Duration::from_secs(1), locs[0]),
                (base + Duration::from_secs(2), locs[1]),
            ]
        );
        assert_eq!(queue.len(), 1);

        // Nothing due yet at the same instant again.
        assert!(queue.take_due(base + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_shared_instant_holds_multiple_targets() {
        let locs = locations(2);
        let when = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule_at(locs[0], when);
        queue.schedule_at(locs[1], when);
        assert_eq!(queue.len(), 2);

        let due = queue.take_due(when);
        assert_eq!(due.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_removes_all_deadlines_for_target() {
        let locs = locations(2);
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule_at(locs[0], base + Duration::from_secs(1));
        queue.schedule_at(locs[0], base + Duration::from_secs(2));
        queue.schedule_at(locs[1], base + Duration::from_secs(1));

        assert_eq!(queue.cancel(locs[0]), 2);
        assert_eq!(queue.len(), 1);
        let due = queue.take_due(base + Duration::from_secs(2));
        assert_eq!(due, vec![(base + Duration::from_secs(1), locs[1])]);
    }

    #[test]
    fn test_reschedule_moves_deadline() {
        let locs = locations(1);
        let base = Instant::now();
        let old = base + Duration::from_secs(5);
        let new = base + Duration::from_secs(1);
        let mut queue = DeadlineQueue::new();
        queue.schedule_at(locs[0], old);

        queue.reschedule(locs[0], old, new).unwrap();
        assert_eq!(queue.next_deadline(), Some(new));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reschedule_missing_deadline_fails() {
        let locs = locations(1);
        let base = Instant::now();
        let mut queue = DeadlineQueue::new();
        assert_eq!(
            queue.reschedule(locs[0], base, base + Duration::from_secs(1)),
            Err(TimerError::DeadlineNotFound)
        );

        // A fired deadline behaves the same as a never-set one.
        queue.schedule_at(locs[0], base);
        queue.take_due(base);
        assert_eq!(
            queue.reschedule(locs[0], base, base + Duration::from_secs(1)),
            Err(TimerError::DeadlineNotFound)
        );
    }

    #[test]
    fn test_service_delivers_timer_fired() {
        let locs = locations(1);
        let events = Arc::new(TaskSlot::new());
        let service = TimerService::start(events.clone());

        let when = Instant::now() + Duration::from_millis(5);
        service.schedule_at(locs[0], when).unwrap();

        let task = events.recv().unwrap();
        assert_eq!(task.target, locs[0]);
        match task.kind {
            TaskKind::TimerFired { scheduled } => assert_eq!(scheduled, when),
            other => panic!("unexpected task kind {:?}", other.label()),
        }
        drop(service);
    }

    #[test]
    fn test_service_reschedule_to_past_fires_promptly() {
        let locs = locations(1);
        let events = Arc::new(TaskSlot::new());
        let service = TimerService::start(events.clone());

        let far = Instant::now() + Duration::from_secs(60);
        service.schedule_at(locs[0], far).unwrap();
        service
            .reschedule_at(locs[0], far, Instant::now())
            .unwrap();

        let task = events.recv().unwrap();
        assert_eq!(task.target, locs[0]);
        drop(service);
    }

    #[test]
    fn test_stop_returns_while_delivery_is_blocked() {
        let locs = locations(1);
        let events = Arc::new(TaskSlot::new());
        // Occupy the slot so the expired deadline cannot be delivered.
        events.send(Task::new(locs[0], TaskKind::Run)).unwrap();

        let mut service = TimerService::start(events.clone());
        service.schedule_at(locs[0], Instant::now()).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        // The thread is parked on the full slot; stop must still join.
        service.stop_and_join();
        assert_eq!(events.try_recv().unwrap().kind.label(), "run");
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn test_service_cancel_before_expiry() {
        let locs = locations(1);
        let events = Arc::new(TaskSlot::new());
        let mut service = TimerService::start(events.clone());

        service
            .schedule_at(locs[0], Instant::now() + Duration::from_secs(60))
            .unwrap();
        assert_eq!(service.cancel(locs[0]), 1);
        assert_eq!(service.pending_count(), 0);

        service.stop_and_join();
        assert!(matches!(
            service.schedule_at(locs[0], Instant::now()),
            Err(TimerError::ServiceStopped)
        ));
    }
}
