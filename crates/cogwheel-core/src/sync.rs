//! Capability sync groups.
//!
//! A capability is a trait with "do" entry points (commands) and "notify"
//! entry points (state reports). Capability instances are `Arc`-held cells
//! embedded in objects. Instances can be ganged together in a [`Gear`]:
//! commands forwarded through [`forward_do`] reach every sink member, and
//! notifications forwarded through [`forward_notify`] fan out from source
//! members to the rest of the group.
//!
//! Contract: the `on_*` trait methods are only ever invoked through the
//! forward wrappers. Calling them directly affects just that instance and
//! propagates nowhere.
//!
//! Lock order: a member's [`SyncHandle`] lock is never held across a
//! member-list lock; group merges acquire the two member-list locks ordered
//! by gear address.

use std::ptr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::SyncError;

/// One instance's membership entry in a gear.
struct Member<C: ?Sized> {
    instance: Weak<C>,
    /// Sinks receive forwarded commands.
    sink: bool,
    /// Sources fan their notifications out to the rest of the group.
    source: bool,
}

/// A group of capability instances acting as one.
pub struct Gear<C: ?Sized> {
    members: Mutex<Vec<Member<C>>>,
}

/// The back reference a capability instance embeds. Points at the gear the
/// instance currently belongs to, if any.
pub struct SyncHandle<C: ?Sized> {
    gear: Mutex<Option<Arc<Gear<C>>>>,
}

impl<C: ?Sized> Default for SyncHandle<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized> SyncHandle<C> {
    pub const fn new() -> Self {
        Self {
            gear: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<Gear<C>>> {
        self.gear.lock().clone()
    }

    pub fn is_synced(&self) -> bool {
        self.gear.lock().is_some()
    }
}

/// Implemented by capability trait objects so the sync machinery can reach
/// the embedded [`SyncHandle`].
pub trait SyncPeer<C: ?Sized> {
    fn sync_handle(&self) -> &SyncHandle<C>;
}

impl<C: SyncPeer<C> + ?Sized> Default for Gear<C> {
    fn default() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
        }
    }
}

impl<C: SyncPeer<C> + ?Sized> Gear<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add `peer` with the given roles, pointing its handle at this gear.
    /// Adding an existing member widens its roles instead.
    pub fn add_member(self: &Arc<Self>, peer: &Arc<C>, sink: bool, source: bool) {
        {
            let mut members = self.members.lock();
            members.retain(|m| m.instance.strong_count() > 0);
            let peer_ptr = Arc::as_ptr(peer);
            if let Some(member) = members
                .iter_mut()
                .find(|m| ptr::addr_eq(m.instance.as_ptr(), peer_ptr))
            {
                member.sink |= sink;
                member.source |= source;
                return;
            }
            members.push(Member {
                instance: Arc::downgrade(peer),
                sink,
                source,
            });
        }
        *peer.sync_handle().gear.lock() = Some(self.clone());
    }

    /// Add a member that receives forwarded commands.
    pub fn add_sink(self: &Arc<Self>, peer: &Arc<C>) {
        self.add_member(peer, true, false);
    }

    /// Add a member whose notifications fan out to the group.
    pub fn add_source(self: &Arc<Self>, peer: &Arc<C>) {
        self.add_member(peer, false, true);
    }

    /// Add a member that is both sink and source.
    pub fn full_sync(self: &Arc<Self>, peer: &Arc<C>) {
        self.add_member(peer, true, true);
    }

    pub fn member_count(&self) -> usize {
        self.members
            .lock()
            .iter()
            .filter(|m| m.instance.strong_count() > 0)
            .count()
    }
}

/// Forward a command: with no group, invoke on `this` alone; in a group,
/// invoke on every sink member under the group lock.
pub fn forward_do<C>(this: &Arc<C>, f: impl Fn(&C))
where
    C: SyncPeer<C> + ?Sized,
{
    match this.sync_handle().current() {
        None => f(this),
        Some(gear) => {
            let members = gear.members.lock();
            for member in members.iter() {
                if member.sink && let Some(instance) = member.instance.upgrade() {
                    f(&instance);
                }
            }
        }
    }
}

/// Forward a notification: only fans out when `this` is a source member,
/// and never loops back to `this` itself.
pub fn forward_notify<C>(this: &Arc<C>, f: impl Fn(&C))
where
    C: SyncPeer<C> + ?Sized,
{
    let Some(gear) = this.sync_handle().current() else {
        return;
    };
    let members = gear.members.lock();
    let this_ptr = Arc::as_ptr(this);
    let is_source = members
        .iter()
        .find(|m| ptr::addr_eq(m.instance.as_ptr(), this_ptr))
        .is_some_and(|m| m.source);
    if !is_source {
        return;
    }
    for member in members.iter() {
        if ptr::addr_eq(member.instance.as_ptr(), this_ptr) {
            continue;
        }
        if let Some(instance) = member.instance.upgrade() {
            f(&instance);
        }
    }
}

/// Gang two instances together as full members: creates a group when
/// neither has one, joins the existing group when exactly one does, and
/// merges the two groups when both do.
pub fn sync<C>(a: &Arc<C>, b: &Arc<C>)
where
    C: SyncPeer<C> + ?Sized,
{
    let ga = a.sync_handle().current();
    let gb = b.sync_handle().current();
    match (ga, gb) {
        (None, None) => {
            let gear = Gear::new();
            gear.full_sync(a);
            gear.full_sync(b);
        }
        (Some(gear), None) => gear.full_sync(b),
        (None, Some(gear)) => gear.full_sync(a),
        (Some(ga), Some(gb)) => merge(&ga, &gb),
    }
}

/// Merge two groups into the one at the lower address, re-pointing every
/// migrated member's handle to the survivor.
fn merge<C>(ga: &Arc<Gear<C>>, gb: &Arc<Gear<C>>)
where
    C: SyncPeer<C> + ?Sized,
{
    if Arc::ptr_eq(ga, gb) {
        return;
    }
    let (survivor, absorbed) = if (Arc::as_ptr(ga) as usize) < (Arc::as_ptr(gb) as usize) {
        (ga, gb)
    } else {
        (gb, ga)
    };
    let migrated: Vec<Member<C>> = {
        let mut surviving = survivor.members.lock();
        let mut absorbed_members = absorbed.members.lock();
        let migrated: Vec<Member<C>> = absorbed_members.drain(..).collect();
        for member in &migrated {
            surviving.push(Member {
                instance: member.instance.clone(),
                sink: member.sink,
                source: member.source,
            });
        }
        migrated
    };
    // Handle locks are taken after both member-list locks are released.
    for member in migrated {
        if let Some(instance) = member.instance.upgrade() {
            *instance.sync_handle().gear.lock() = Some(survivor.clone());
        }
    }
    tracing::trace!(target: "cogwheel_core::sync", "sync groups merged");
}

/// Remove `this` from its group. Fails when it has none.
pub fn unsync<C>(this: &Arc<C>) -> Result<(), SyncError>
where
    C: SyncPeer<C> + ?Sized,
{
    let gear = this
        .sync_handle()
        .gear
        .lock()
        .take()
        .ok_or(SyncError::NotSynced)?;
    let this_ptr = Arc::as_ptr(this);
    gear.members
        .lock()
        .retain(|m| !ptr::addr_eq(m.instance.as_ptr(), this_ptr));
    Ok(())
}

/// The run capability.
///
/// Capability traits carry their own handle accessor rather than a
/// `SyncPeer` supertrait; the trait object forwards to it below. A
/// supertrait mentioning the trait's own `dyn` type would be cyclic.
pub trait Runnable: Send + Sync {
    fn on_run(&self);

    /// Group membership handle for this instance.
    fn sync_handle(&self) -> &SyncHandle<dyn Runnable>;
}

impl SyncPeer<dyn Runnable> for dyn Runnable {
    fn sync_handle(&self) -> &SyncHandle<dyn Runnable> {
        Runnable::sync_handle(self)
    }
}

/// Command: run `this`, or every sink in its group.
pub fn run(this: &Arc<dyn Runnable>) {
    forward_do(this, |r| r.on_run());
}

/// The on/off capability.
pub trait OnOff: Send + Sync {
    fn on_turn_on(&self);
    fn on_turn_off(&self);
    fn is_on(&self) -> bool;

    /// Group membership handle for this instance.
    fn sync_handle(&self) -> &SyncHandle<dyn OnOff>;
}

impl SyncPeer<dyn OnOff> for dyn OnOff {
    fn sync_handle(&self) -> &SyncHandle<dyn OnOff> {
        OnOff::sync_handle(self)
    }
}

/// Command: switch `this` (or its group's sinks) on.
pub fn turn_on(this: &Arc<dyn OnOff>) {
    forward_do(this, |o| o.on_turn_on());
}

/// Command: switch `this` (or its group's sinks) off.
pub fn turn_off(this: &Arc<dyn OnOff>) {
    forward_do(this, |o| o.on_turn_off());
}

pub fn toggle(this: &Arc<dyn OnOff>) {
    if this.is_on() {
        turn_off(this);
    } else {
        turn_on(this);
    }
}

/// Notification: `this` switched itself on; tell the rest of the group.
pub fn notify_on(this: &Arc<dyn OnOff>) {
    forward_notify(this, |o| o.on_turn_on());
}

/// Notification: `this` switched itself off; tell the rest of the group.
pub fn notify_off(this: &Arc<dyn OnOff>) {
    forward_notify(this, |o| o.on_turn_off());
}

/// The long-running-work capability. Cancellation must be idempotent.
pub trait LongRunning: Send + Sync {
    fn on_cancel(&self);
    fn is_running(&self) -> bool;

    /// Group membership handle for this instance.
    fn sync_handle(&self) -> &SyncHandle<dyn LongRunning>;
}

impl SyncPeer<dyn LongRunning> for dyn LongRunning {
    fn sync_handle(&self) -> &SyncHandle<dyn LongRunning> {
        LongRunning::sync_handle(self)
    }
}

/// Command: cancel `this`, or every sink in its group.
pub fn cancel(this: &Arc<dyn LongRunning>) {
    forward_do(this, |l| l.on_cancel());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Bell {
        rings: AtomicUsize,
        handle: SyncHandle<dyn Runnable>,
    }

    impl Bell {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rings: AtomicUsize::new(0),
                handle: SyncHandle::new(),
            })
        }

        fn rings(&self) -> usize {
            self.rings.load(Ordering::SeqCst)
        }
    }

    impl Runnable for Bell {
        fn on_run(&self) {
            self.rings.fetch_add(1, Ordering::SeqCst);
        }

        fn sync_handle(&self) -> &SyncHandle<dyn Runnable> {
            &self.handle
        }
    }

    struct Lamp {
        lit: AtomicBool,
        handle: SyncHandle<dyn OnOff>,
    }

    impl Lamp {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lit: AtomicBool::new(false),
                handle: SyncHandle::new(),
            })
        }
    }

    impl OnOff for Lamp {
        fn on_turn_on(&self) {
            self.lit.store(true, Ordering::SeqCst);
        }

        fn on_turn_off(&self) {
            self.lit.store(false, Ordering::SeqCst);
        }

        fn is_on(&self) -> bool {
            self.lit.load(Ordering::SeqCst)
        }

        fn sync_handle(&self) -> &SyncHandle<dyn OnOff> {
            &self.handle
        }
    }

    struct Job {
        running: AtomicBool,
        handle: SyncHandle<dyn LongRunning>,
    }

    impl Job {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(true),
                handle: SyncHandle::new(),
            })
        }
    }

    impl LongRunning for Job {
        fn on_cancel(&self) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn sync_handle(&self) -> &SyncHandle<dyn LongRunning> {
            &self.handle
        }
    }

    #[test]
    fn test_forward_do_without_group_hits_self() {
        let bell = Bell::new();
        let as_runnable: Arc<dyn Runnable> = bell.clone();
        run(&as_runnable);
        assert_eq!(bell.rings(), 1);
    }

    #[test]
    fn test_forward_do_reaches_all_sinks() {
        let a = Bell::new();
        let b = Bell::new();
        let c = Bell::new();

        let gear: Arc<Gear<dyn Runnable>> = Gear::new();
        gear.add_sink(&(a.clone() as Arc<dyn Runnable>));
        gear.add_sink(&(b.clone() as Arc<dyn Runnable>));
        gear.add_source(&(c.clone() as Arc<dyn Runnable>));

        run(&(c.clone() as Arc<dyn Runnable>));
        assert_eq!(a.rings(), 1);
        assert_eq!(b.rings(), 1);
        // c is not a sink; commands pass it by.
        assert_eq!(c.rings(), 0);
    }

    #[test]
    fn test_direct_call_does_not_propagate() {
        let a = Bell::new();
        let b = Bell::new();
        let gear: Arc<Gear<dyn Runnable>> = Gear::new();
        gear.full_sync(&(a.clone() as Arc<dyn Runnable>));
        gear.full_sync(&(b.clone() as Arc<dyn Runnable>));

        a.on_run();
        assert_eq!(a.rings(), 1);
        assert_eq!(b.rings(), 0);
    }

    #[test]
    fn test_notify_only_from_source_and_excludes_self() {
        let sink = Lamp::new();
        let source = Lamp::new();
        let gear: Arc<Gear<dyn OnOff>> = Gear::new();
        gear.add_sink(&(sink.clone() as Arc<dyn OnOff>));
        gear.add_source(&(source.clone() as Arc<dyn OnOff>));

        // A non-source member's notifications go nowhere.
        notify_on(&(sink.clone() as Arc<dyn OnOff>));
        assert!(!source.is_on());

        // A source member's notifications reach everyone else, not itself.
        notify_on(&(source.clone() as Arc<dyn OnOff>));
        assert!(sink.is_on());
        assert!(!source.is_on());
    }

    #[test]
    fn test_sync_creates_joins_and_merges() {
        let a = Bell::new();
        let b = Bell::new();
        let c = Bell::new();
        let d = Bell::new();
        let (ra, rb, rc, rd): (
            Arc<dyn Runnable>,
            Arc<dyn Runnable>,
            Arc<dyn Runnable>,
            Arc<dyn Runnable>,
        ) = (a.clone(), b.clone(), c.clone(), d.clone());

        sync(&ra, &rb);
        sync(&rc, &rd);
        assert!(a.handle.is_synced());
        assert_eq!(a.handle.current().unwrap().member_count(), 2);

        // Merge the two groups; every handle points at the survivor.
        sync(&rb, &rc);
        let gear = a.handle.current().unwrap();
        assert_eq!(gear.member_count(), 4);
        for bell in [&a, &b, &c, &d] {
            assert!(Arc::ptr_eq(&bell.handle.current().unwrap(), &gear));
        }

        run(&ra);
        for bell in [&a, &b, &c, &d] {
            assert_eq!(bell.rings(), 1);
        }
    }

    #[test]
    fn test_merge_same_group_is_noop() {
        let a = Bell::new();
        let b = Bell::new();
        let (ra, rb): (Arc<dyn Runnable>, Arc<dyn Runnable>) = (a.clone(), b.clone());
        sync(&ra, &rb);
        sync(&ra, &rb);
        assert_eq!(a.handle.current().unwrap().member_count(), 2);
    }

    #[test]
    fn test_unsync_detaches_member() {
        let a = Bell::new();
        let b = Bell::new();
        let (ra, rb): (Arc<dyn Runnable>, Arc<dyn Runnable>) = (a.clone(), b.clone());
        sync(&ra, &rb);

        unsync(&ra).unwrap();
        assert!(!a.handle.is_synced());
        assert_eq!(b.handle.current().unwrap().member_count(), 1);
        assert_eq!(unsync(&ra), Err(SyncError::NotSynced));

        // Detached instances act alone again.
        run(&ra);
        assert_eq!(a.rings(), 1);
        assert_eq!(b.rings(), 0);
    }

    #[test]
    fn test_dead_members_are_pruned() {
        let a = Bell::new();
        let b = Bell::new();
        let (ra, rb): (Arc<dyn Runnable>, Arc<dyn Runnable>) = (a.clone(), b.clone());
        sync(&ra, &rb);

        let gear = a.handle.current().unwrap();
        drop(rb);
        drop(b);
        assert_eq!(gear.member_count(), 1);

        run(&ra);
        assert_eq!(a.rings(), 1);
    }

    #[test]
    fn test_cancel_reaches_grouped_jobs() {
        let a = Job::new();
        let b = Job::new();
        let (la, lb): (Arc<dyn LongRunning>, Arc<dyn LongRunning>) = (a.clone(), b.clone());
        sync(&la, &lb);

        assert!(a.is_running());
        cancel(&la);
        assert!(!a.is_running());
        assert!(!b.is_running());

        // Idempotent: cancelling again is harmless.
        cancel(&la);
        assert!(!a.is_running());
    }

    #[test]
    fn test_toggle_uses_forwarding() {
        let a = Lamp::new();
        let b = Lamp::new();
        let (oa, ob): (Arc<dyn OnOff>, Arc<dyn OnOff>) = (a.clone(), b.clone());
        sync(&oa, &ob);

        toggle(&oa);
        assert!(a.is_on());
        assert!(b.is_on());
        toggle(&oa);
        assert!(!a.is_on());
        assert!(!b.is_on());
    }
}
