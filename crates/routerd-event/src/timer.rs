//! Priority-classed timer list
//!
//! Delivers callbacks at or after an absolute [`TimeVal`], ordered by
//! (priority class, expiry, insertion order). One position-tracked
//! min-heap per priority class; priorities exist so background
//! bookkeeping (route dump replay, bulk peer reads) cannot starve
//! control-plane work (keepalives, timeouts).
//!
//! # Ownership
//!
//! A timer node is owned jointly by its heap (while scheduled) and by any
//! outstanding [`TimerHandle`]. Both shares are counted in the event
//! loop's [`RefPool`]; the node is destroyed when the counter reaches
//! zero. A callback may reschedule or unschedule its own node from
//! inside its body.
//!
//! # Failure model
//!
//! Callback panics are caught at the dispatch boundary and logged; the
//! heaps stay consistent because the node is popped before dispatch.
//! The list does not retry.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use tracing::error;

use crate::callback::{Callback0, Callback1};
use crate::clock::ClockSource;
use crate::heap::{HeapKey, HeapNode, PositionHeap};
use crate::pool::{RefPool, Slot};
use crate::timeval::TimeVal;

/// Scheduling priority classes. Numerically smaller is more urgent.
pub mod priority {
    pub const HIGHEST: i32 = 0;
    pub const HIGH: i32 = 2;
    pub const DEFAULT: i32 = 4;
    pub const BACKGROUND: i32 = 7;
    pub const LOWEST: i32 = 9;
    /// Sentinel: "no expired timer at any priority".
    pub const INFINITE: i32 = 255;
}

/// Receives scheduling notifications from a [`TimerList`].
///
/// Callbacks fire after the list has released its internal borrows, so
/// an observer may query the list but must not mutate it reentrantly.
pub trait TimerListObserver {
    fn notify_scheduled(&mut self, expiry: &TimeVal);
    fn notify_unscheduled(&mut self, expiry: &TimeVal);
}

enum TimerPayload {
    Oneoff(Callback0<()>),
    Periodic { period: TimeVal, cb: Callback0<bool> },
    Flag { flag: Rc<Cell<bool>>, to_value: bool },
    Bare(Callback1<(), TimerHandle>),
}

impl TimerPayload {
    fn clone_for_dispatch(&self) -> TimerPayload {
        match self {
            TimerPayload::Oneoff(cb) => TimerPayload::Oneoff(cb.clone()),
            TimerPayload::Periodic { period, cb } => TimerPayload::Periodic {
                period: *period,
                cb: cb.clone(),
            },
            TimerPayload::Flag { flag, to_value } => TimerPayload::Flag {
                flag: flag.clone(),
                to_value: *to_value,
            },
            TimerPayload::Bare(cb) => TimerPayload::Bare(cb.clone()),
        }
    }
}

pub struct TimerNode {
    expiry: TimeVal,
    seq: u64,
    priority: i32,
    pos: Option<usize>,
    /// True while the heap (or the in-flight fire) holds its share.
    heap_share: bool,
    payload: TimerPayload,
    pool: RefPool,
    slot: Slot,
}

impl HeapNode for TimerNode {
    fn heap_key(&self) -> HeapKey {
        (self.expiry, self.seq)
    }
    fn position(&self) -> Option<usize> {
        self.pos
    }
    fn set_position(&mut self, pos: Option<usize>) {
        self.pos = pos;
    }
}

type NodeRef = Rc<RefCell<TimerNode>>;

struct ListInner {
    /// One heap per priority class, created on first use.
    heaps: BTreeMap<i32, PositionHeap<TimerNode>>,
    clock: Rc<RefCell<dyn ClockSource>>,
    pool: RefPool,
    observer: Option<Rc<RefCell<dyn TimerListObserver>>>,
    next_seq: u64,
}

impl ListInner {
    fn schedule_node(&mut self, node: &NodeRef, when: TimeVal, priority: i32) {
        // Pull the node out of its current heap first, if any.
        self.unschedule_node_quiet(node);
        {
            let mut n = node.borrow_mut();
            n.expiry = when;
            n.priority = priority;
            n.seq = self.next_seq;
            self.next_seq += 1;
            if !n.heap_share {
                n.heap_share = true;
                let slot = n.slot;
                drop(n);
                self.pool.incr(slot);
            }
        }
        self.heaps
            .entry(priority)
            .or_default()
            .push(Rc::clone(node));
    }

    /// Remove from the heap without releasing the heap share. Used when
    /// rescheduling and when popping for dispatch.
    fn unschedule_node_quiet(&mut self, node: &NodeRef) -> bool {
        let prio = node.borrow().priority;
        match self.heaps.get_mut(&prio) {
            Some(heap) => heap.remove(node),
            None => false,
        }
    }

    /// Full unschedule: remove from heap and release the heap share.
    /// Returns the expiry for observer notification if anything changed.
    fn unschedule_node(&mut self, node: &NodeRef) -> Option<TimeVal> {
        self.unschedule_node_quiet(node);
        let mut n = node.borrow_mut();
        if !n.heap_share {
            return None;
        }
        n.heap_share = false;
        let (slot, expiry) = (n.slot, n.expiry);
        drop(n);
        self.pool.decr(slot);
        Some(expiry)
    }

    fn expired_root(&self, now: TimeVal) -> Option<i32> {
        for (prio, heap) in self.heaps.iter() {
            if let Some((expiry, _)) = heap.root_key() {
                if expiry <= now {
                    return Some(*prio);
                }
            }
        }
        None
    }

    fn pop_expired(&mut self, now: TimeVal) -> Option<NodeRef> {
        let prio = self.expired_root(now)?;
        self.heaps.get_mut(&prio).and_then(PositionHeap::pop_root)
    }
}

/// Timer creation and scheduling entity.
///
/// Cheap to clone; clones share one set of heaps.
#[derive(Clone)]
pub struct TimerList {
    inner: Rc<RefCell<ListInner>>,
}

impl TimerList {
    pub fn new(clock: Rc<RefCell<dyn ClockSource>>, pool: &RefPool) -> TimerList {
        TimerList {
            inner: Rc::new(RefCell::new(ListInner {
                heaps: BTreeMap::new(),
                clock,
                pool: pool.clone(),
                observer: None,
                next_seq: 0,
            })),
        }
    }

    /// Fire `cb` once at or after the absolute time `when`.
    pub fn new_oneoff_at(&self, when: TimeVal, cb: Callback0<()>, prio: i32) -> TimerHandle {
        let handle = self.make_node(TimerPayload::Oneoff(cb));
        handle.schedule_at(when, prio);
        handle
    }

    /// Fire `cb` once `wait` after now. The clock is sampled here.
    pub fn new_oneoff_after(&self, wait: TimeVal, cb: Callback0<()>, prio: i32) -> TimerHandle {
        let when = self.sample_now() + wait;
        self.new_oneoff_at(when, cb, prio)
    }

    /// Fire `cb` every `period`. A `false` return unschedules the timer.
    /// The expiry after a firing is `previous_expiry + period`, so a
    /// delayed timer catches up rather than drifting.
    pub fn new_periodic(&self, period: TimeVal, cb: Callback0<bool>, prio: i32) -> TimerHandle {
        let when = self.sample_now() + period;
        let handle = self.make_node(TimerPayload::Periodic { period, cb });
        handle.schedule_at(when, prio);
        handle
    }

    /// Write `to_value` into `flag` at the absolute time `when`.
    pub fn set_flag_at(
        &self,
        when: TimeVal,
        flag: &Rc<Cell<bool>>,
        to_value: bool,
        prio: i32,
    ) -> TimerHandle {
        let handle = self.make_node(TimerPayload::Flag {
            flag: flag.clone(),
            to_value,
        });
        handle.schedule_at(when, prio);
        handle
    }

    /// Write `to_value` into `flag` after `wait`.
    pub fn set_flag_after(
        &self,
        wait: TimeVal,
        flag: &Rc<Cell<bool>>,
        to_value: bool,
        prio: i32,
    ) -> TimerHandle {
        let when = self.sample_now() + wait;
        self.set_flag_at(when, flag, to_value, prio)
    }

    /// Create an unscheduled timer with a bare callback. The callback
    /// receives a handle to its own node so it can reschedule itself.
    pub fn new_timer(&self, cb: Callback1<(), TimerHandle>) -> TimerHandle {
        self.make_node(TimerPayload::Bare(cb))
    }

    /// Expire every due timer, highest-priority class first, insertion
    /// order within equal expiries.
    pub fn run(&self) {
        self.advance_time();
        loop {
            let node = {
                let mut inner = self.inner.borrow_mut();
                let now = inner.clock.borrow().current_time();
                inner.pop_expired(now)
            };
            match node {
                Some(node) => self.fire(node),
                None => break,
            }
        }
    }

    /// Expire at most one due timer whose priority class is at least as
    /// urgent as `worst_priority`. Returns true if one fired.
    pub fn expire_one(&self, worst_priority: i32) -> bool {
        let node = {
            let mut inner = self.inner.borrow_mut();
            let now = inner.clock.borrow().current_time();
            match inner.expired_root(now) {
                Some(p) if p <= worst_priority => inner.pop_expired(now),
                _ => None,
            }
        };
        match node {
            Some(node) => {
                self.fire(node);
                true
            }
            None => false,
        }
    }

    /// Soonest expiry minus now across all priorities, clamped to zero.
    /// `None` when nothing is scheduled (callers treat this as
    /// [`TimeVal::MAXIMUM`]).
    pub fn get_next_delay(&self) -> Option<TimeVal> {
        let inner = self.inner.borrow();
        let now = inner.clock.borrow().current_time();
        inner
            .heaps
            .values()
            .filter_map(PositionHeap::root_key)
            .map(|(expiry, _)| expiry)
            .min()
            .map(|soonest| soonest.saturating_sub(&now))
    }

    /// The numerically smallest priority with an expired root, or
    /// [`priority::INFINITE`] if none.
    pub fn get_expired_priority(&self) -> i32 {
        let inner = self.inner.borrow();
        let now = inner.clock.borrow().current_time();
        inner.expired_root(now).unwrap_or(priority::INFINITE)
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of scheduled timers.
    pub fn size(&self) -> usize {
        self.inner.borrow().heaps.values().map(PositionHeap::len).sum()
    }

    pub fn current_time(&self) -> TimeVal {
        self.inner.borrow().clock.borrow().current_time()
    }

    pub fn advance_time(&self) {
        self.inner.borrow().clock.borrow_mut().advance_time();
    }

    pub fn set_observer(&self, obs: Rc<RefCell<dyn TimerListObserver>>) {
        self.inner.borrow_mut().observer = Some(obs);
    }

    pub fn remove_observer(&self) {
        self.inner.borrow_mut().observer = None;
    }

    fn sample_now(&self) -> TimeVal {
        self.advance_time();
        self.current_time()
    }

    fn make_node(&self, payload: TimerPayload) -> TimerHandle {
        let pool = self.inner.borrow().pool.clone();
        let slot = pool.alloc(); // the handle's share
        let node = Rc::new(RefCell::new(TimerNode {
            expiry: TimeVal::ZERO,
            seq: 0,
            priority: priority::DEFAULT,
            pos: None,
            heap_share: false,
            payload,
            pool,
            slot,
        }));
        TimerHandle {
            node: Some(node),
            list: Rc::downgrade(&self.inner),
        }
    }

    fn notify_scheduled(&self, expiry: &TimeVal) {
        let obs = self.inner.borrow().observer.clone();
        if let Some(obs) = obs {
            obs.borrow_mut().notify_scheduled(expiry);
        }
    }

    fn notify_unscheduled(&self, expiry: &TimeVal) {
        let obs = self.inner.borrow().observer.clone();
        if let Some(obs) = obs {
            obs.borrow_mut().notify_unscheduled(expiry);
        }
    }

    fn fire(&self, node: NodeRef) {
        // The node has been popped from its heap but still holds the
        // firing share, so a callback rescheduling it sees a live node.
        let (payload, old_expiry) = {
            let n = node.borrow();
            (n.payload.clone_for_dispatch(), n.expiry)
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| match &payload {
            TimerPayload::Oneoff(cb) => {
                cb.dispatch();
                false
            }
            TimerPayload::Periodic { cb, .. } => cb.dispatch(),
            TimerPayload::Flag { flag, to_value } => {
                flag.set(*to_value);
                false
            }
            TimerPayload::Bare(cb) => {
                cb.dispatch(self.handle_for(&node));
                false
            }
        }));

        let rearm = match outcome {
            Ok(again) => again,
            Err(_) => {
                error!(expiry = %old_expiry, "timer callback panicked");
                false
            }
        };

        self.notify_unscheduled(&old_expiry);

        // Periodic catch-up re-arm, unless the callback already moved the
        // node (position set) or explicitly unscheduled it (share gone).
        if rearm {
            let rearm_at = {
                let n = node.borrow();
                match (&n.payload, n.pos, n.heap_share) {
                    (TimerPayload::Periodic { period, .. }, None, true) => {
                        Some((old_expiry + *period, n.priority))
                    }
                    _ => None,
                }
            };
            if let Some((when, prio)) = rearm_at {
                self.inner.borrow_mut().schedule_node(&node, when, prio);
                self.notify_scheduled(&when);
                return;
            }
        }

        // Release the firing share if the node did not end up scheduled.
        let release = {
            let mut n = node.borrow_mut();
            if n.pos.is_none() && n.heap_share {
                n.heap_share = false;
                Some((n.pool.clone(), n.slot))
            } else {
                None
            }
        };
        if let Some((pool, slot)) = release {
            pool.decr(slot);
        }
    }

    fn handle_for(&self, node: &NodeRef) -> TimerHandle {
        let (pool, slot) = {
            let n = node.borrow();
            (n.pool.clone(), n.slot)
        };
        pool.incr(slot);
        TimerHandle {
            node: Some(Rc::clone(node)),
            list: Rc::downgrade(&self.inner),
        }
    }
}

/// Value handle sharing ownership of one timer node.
///
/// Clone increments the node's pool counter, drop decrements it. All
/// scheduling operations delegate to the node.
pub struct TimerHandle {
    node: Option<NodeRef>,
    list: Weak<RefCell<ListInner>>,
}

impl TimerHandle {
    /// A handle referring to no timer.
    pub fn empty() -> TimerHandle {
        TimerHandle {
            node: None,
            list: Weak::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node.is_none()
    }

    /// True if scheduled and not yet fired.
    pub fn scheduled(&self) -> bool {
        self.node
            .as_ref()
            .map(|n| n.borrow().pos.is_some())
            .unwrap_or(false)
    }

    pub fn expiry(&self) -> TimeVal {
        self.node
            .as_ref()
            .map(|n| n.borrow().expiry)
            .unwrap_or(TimeVal::ZERO)
    }

    /// Time until expiry, zero if overdue, `None` if not scheduled.
    pub fn time_remaining(&self) -> Option<TimeVal> {
        let node = self.node.as_ref()?;
        if node.borrow().pos.is_none() {
            return None;
        }
        let list = self.list.upgrade()?;
        let now = list.borrow().clock.borrow().current_time();
        Some(node.borrow().expiry.saturating_sub(&now))
    }

    /// Schedule at an absolute time, replacing any existing schedule.
    pub fn schedule_at(&self, when: TimeVal, prio: i32) {
        self.with_list(|list, node, outer| {
            list.borrow_mut().schedule_node(node, when, prio);
            outer.notify_scheduled(&when);
        });
    }

    /// Schedule `wait` after the current time (sampled now).
    pub fn schedule_after(&self, wait: TimeVal, prio: i32) {
        self.with_list(|list, node, outer| {
            {
                let inner = list.borrow();
                inner.clock.borrow_mut().advance_time();
            }
            let when = list.borrow().clock.borrow().current_time() + wait;
            list.borrow_mut().schedule_node(node, when, prio);
            outer.notify_scheduled(&when);
        });
    }

    /// Millisecond convenience form of [`TimerHandle::schedule_after`].
    pub fn schedule_after_ms(&self, ms: i64, prio: i32) {
        self.schedule_after(TimeVal::from_millis(ms), prio);
    }

    /// Schedule `wait` after the most recent expiry, preserving priority.
    pub fn reschedule_after(&self, wait: TimeVal) {
        self.with_list(|list, node, outer| {
            let (when, prio) = {
                let n = node.borrow();
                (n.expiry + wait, n.priority)
            };
            list.borrow_mut().schedule_node(node, when, prio);
            outer.notify_scheduled(&when);
        });
    }

    /// Expire on the next `run()`.
    pub fn schedule_now(&self, prio: i32) {
        self.with_list(|list, node, outer| {
            let now = list.borrow().clock.borrow().current_time();
            list.borrow_mut().schedule_node(node, now, prio);
            outer.notify_scheduled(&now);
        });
    }

    /// Cancel without invoking the callback.
    pub fn unschedule(&self) {
        self.with_list(|list, node, outer| {
            let expiry = list.borrow_mut().unschedule_node(node);
            if let Some(expiry) = expiry {
                outer.notify_unscheduled(&expiry);
            }
        });
    }

    /// Release this handle's share of the node.
    pub fn clear(&mut self) {
        self.release();
        self.node = None;
        self.list = Weak::new();
    }

    fn with_list(&self, f: impl FnOnce(&Rc<RefCell<ListInner>>, &NodeRef, &TimerList)) {
        // Empty handles and handles outliving their list are no-ops.
        let (Some(node), Some(list)) = (self.node.as_ref(), self.list.upgrade()) else {
            return;
        };
        let outer = TimerList { inner: Rc::clone(&list) };
        f(&list, node, &outer);
    }

    fn release(&mut self) {
        if let Some(node) = self.node.take() {
            let (pool, slot) = {
                let n = node.borrow();
                (n.pool.clone(), n.slot)
            };
            if pool.decr(slot) {
                // Last share anywhere: the node must not linger in a heap.
                debug_assert!(node.borrow().pos.is_none());
            }
        }
    }
}

impl Clone for TimerHandle {
    fn clone(&self) -> Self {
        if let Some(node) = self.node.as_ref() {
            let (pool, slot) = {
                let n = node.borrow();
                (n.pool.clone(), n.slot)
            };
            pool.incr(slot);
        }
        TimerHandle {
            node: self.node.clone(),
            list: self.list.clone(),
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::callback0;
    use crate::clock::ManualClock;

    fn fixture() -> (TimerList, Rc<RefCell<ManualClock>>, RefPool) {
        let clock = Rc::new(RefCell::new(ManualClock::new(TimeVal::ZERO)));
        let pool = RefPool::new();
        let list = TimerList::new(clock.clone(), &pool);
        (list, clock, pool)
    }

    #[test]
    fn test_oneoff_fires_once() {
        let (list, clock, pool) = fixture();
        let fired = Rc::new(Cell::new(0u32));

        let f = fired.clone();
        let _t = list.new_oneoff_at(
            TimeVal::from_millis(10),
            callback0(&pool, move || f.set(f.get() + 1)),
            priority::DEFAULT,
        );

        list.run();
        assert_eq!(fired.get(), 0);

        clock.borrow_mut().set(TimeVal::from_millis(10));
        list.run();
        assert_eq!(fired.get(), 1);

        clock.borrow_mut().set(TimeVal::from_millis(50));
        list.run();
        assert_eq!(fired.get(), 1);
        assert!(list.empty());
    }

    #[test]
    fn test_priority_fairness() {
        // Three timers: priorities {10, 50, 10}, expiries {100, 50, 110} ms.
        // Once all are due, both priority-10 timers fire before the
        // priority-50 one, in insertion order: T1, T3, T2.
        let (list, clock, pool) = fixture();
        let order = Rc::new(RefCell::new(Vec::new()));

        let mk = |tag: u32| {
            let order = order.clone();
            callback0(&pool, move || order.borrow_mut().push(tag))
        };
        let _t1 = list.new_oneoff_at(TimeVal::from_millis(100), mk(1), 10);
        let _t2 = list.new_oneoff_at(TimeVal::from_millis(50), mk(2), 50);
        let _t3 = list.new_oneoff_at(TimeVal::from_millis(110), mk(3), 10);

        clock.borrow_mut().set(TimeVal::from_millis(111));
        list.run();
        assert_eq!(*order.borrow(), vec![1, 3, 2]);
    }

    #[test]
    fn test_same_expiry_insertion_order() {
        let (list, clock, pool) = fixture();
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut handles = Vec::new();
        for tag in 0..5u32 {
            let order = order.clone();
            handles.push(list.new_oneoff_at(
                TimeVal::from_millis(20),
                callback0(&pool, move || order.borrow_mut().push(tag)),
                priority::DEFAULT,
            ));
        }
        clock.borrow_mut().set(TimeVal::from_millis(20));
        list.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_periodic_catch_up() {
        // 20 ms periodic started at t=0 and not run until t=85: it fires
        // for every missed tick and re-arms for t=100, not t=105.
        let (list, clock, pool) = fixture();
        let fired = Rc::new(Cell::new(0u32));

        let f = fired.clone();
        let _t = list.new_periodic(
            TimeVal::from_millis(20),
            callback0(&pool, move || {
                f.set(f.get() + 1);
                true
            }),
            priority::DEFAULT,
        );

        clock.borrow_mut().set(TimeVal::from_millis(85));
        list.run();
        assert_eq!(fired.get(), 4); // expiries 20, 40, 60, 80
        assert_eq!(list.get_next_delay(), Some(TimeVal::from_millis(15)));
    }

    #[test]
    fn test_periodic_stops_on_false() {
        let (list, clock, pool) = fixture();
        let fired = Rc::new(Cell::new(0u32));

        let f = fired.clone();
        let _t = list.new_periodic(
            TimeVal::from_millis(10),
            callback0(&pool, move || {
                f.set(f.get() + 1);
                f.get() < 3
            }),
            priority::DEFAULT,
        );

        clock.borrow_mut().set(TimeVal::from_secs(1));
        list.run();
        assert_eq!(fired.get(), 3);
        assert!(list.empty());
    }

    #[test]
    fn test_unschedule_prevents_fire() {
        let (list, clock, pool) = fixture();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let t = list.new_oneoff_at(
            TimeVal::from_millis(10),
            callback0(&pool, move || f.set(true)),
            priority::DEFAULT,
        );
        assert!(t.scheduled());

        t.unschedule();
        assert!(!t.scheduled());

        clock.borrow_mut().set(TimeVal::from_millis(20));
        list.run();
        assert!(!fired.get());
    }

    #[test]
    fn test_flag_timer() {
        let (list, clock, _pool) = fixture();
        let flag = Rc::new(Cell::new(false));

        let _t = list.set_flag_after(TimeVal::from_millis(5), &flag, true, priority::DEFAULT);
        clock.borrow_mut().set(TimeVal::from_millis(5));
        list.run();
        assert!(flag.get());
    }

    #[test]
    fn test_reschedule_inside_callback() {
        // A bare timer rescheduling itself from its own callback.
        let (list, clock, pool) = fixture();
        let fired = Rc::new(Cell::new(0u32));

        let f = fired.clone();
        let t = list.new_timer(Callback1::new(&pool, move |handle: TimerHandle| {
            f.set(f.get() + 1);
            if f.get() < 2 {
                handle.schedule_after(TimeVal::from_millis(30), priority::DEFAULT);
            }
        }));
        t.schedule_at(TimeVal::from_millis(10), priority::DEFAULT);

        clock.borrow_mut().set(TimeVal::from_millis(10));
        list.run();
        assert_eq!(fired.get(), 1);
        assert!(t.scheduled());
        assert_eq!(t.expiry(), TimeVal::from_millis(40));

        clock.borrow_mut().set(TimeVal::from_millis(40));
        list.run();
        assert_eq!(fired.get(), 2);
        assert!(!t.scheduled());
    }

    #[test]
    fn test_get_next_delay_and_expired_priority() {
        let (list, clock, pool) = fixture();
        assert_eq!(list.get_next_delay(), None);
        assert_eq!(list.get_expired_priority(), priority::INFINITE);

        let _a = list.new_oneoff_at(
            TimeVal::from_millis(40),
            callback0(&pool, || ()),
            priority::BACKGROUND,
        );
        let _b = list.new_oneoff_at(
            TimeVal::from_millis(60),
            callback0(&pool, || ()),
            priority::DEFAULT,
        );

        assert_eq!(list.get_next_delay(), Some(TimeVal::from_millis(40)));

        clock.borrow_mut().set(TimeVal::from_millis(45));
        assert_eq!(list.get_next_delay(), Some(TimeVal::ZERO));
        assert_eq!(list.get_expired_priority(), priority::BACKGROUND);

        clock.borrow_mut().set(TimeVal::from_millis(60));
        assert_eq!(list.get_expired_priority(), priority::DEFAULT);
    }

    #[test]
    fn test_handle_shares_node() {
        let (list, clock, pool) = fixture();
        let fired = Rc::new(Cell::new(0u32));

        let f = fired.clone();
        let t = list.new_oneoff_at(
            TimeVal::from_millis(10),
            callback0(&pool, move || f.set(f.get() + 1)),
            priority::DEFAULT,
        );
        let t2 = t.clone();
        drop(t);

        clock.borrow_mut().set(TimeVal::from_millis(10));
        list.run();
        assert_eq!(fired.get(), 1);
        assert!(!t2.scheduled());
    }

    #[test]
    fn test_clear_releases_share() {
        let (list, _clock, pool) = fixture();
        let before = pool.balance();
        let mut t = list.new_oneoff_at(
            TimeVal::from_millis(10),
            callback0(&pool, || ()),
            priority::DEFAULT,
        );
        t.clear();
        assert!(t.is_empty());
        // The node's schedule share remains until it fires or is
        // unscheduled; the callback slot is still live inside it.
        assert!(pool.balance() > before);
        drop(list);
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let (list, clock, pool) = fixture();
        let fired = Rc::new(Cell::new(false));

        let _bad = list.new_oneoff_at(
            TimeVal::from_millis(5),
            callback0(&pool, || panic!("boom")),
            priority::DEFAULT,
        );
        let f = fired.clone();
        let _good = list.new_oneoff_at(
            TimeVal::from_millis(6),
            callback0(&pool, move || f.set(true)),
            priority::DEFAULT,
        );

        clock.borrow_mut().set(TimeVal::from_millis(10));
        list.run();
        assert!(fired.get());
        assert!(list.empty());
    }

    #[test]
    fn test_observer_notifications() {
        struct Recorder {
            scheduled: Vec<TimeVal>,
            unscheduled: Vec<TimeVal>,
        }
        impl TimerListObserver for Recorder {
            fn notify_scheduled(&mut self, expiry: &TimeVal) {
                self.scheduled.push(*expiry);
            }
            fn notify_unscheduled(&mut self, expiry: &TimeVal) {
                self.unscheduled.push(*expiry);
            }
        }

        let (list, clock, pool) = fixture();
        let rec = Rc::new(RefCell::new(Recorder {
            scheduled: Vec::new(),
            unscheduled: Vec::new(),
        }));
        list.set_observer(rec.clone());

        let t = list.new_oneoff_at(
            TimeVal::from_millis(10),
            callback0(&pool, || ()),
            priority::DEFAULT,
        );
        assert_eq!(rec.borrow().scheduled, vec![TimeVal::from_millis(10)]);

        t.unschedule();
        assert_eq!(rec.borrow().unscheduled, vec![TimeVal::from_millis(10)]);

        t.schedule_at(TimeVal::from_millis(30), priority::DEFAULT);
        clock.borrow_mut().set(TimeVal::from_millis(30));
        list.run();
        assert_eq!(
            rec.borrow().unscheduled,
            vec![TimeVal::from_millis(10), TimeVal::from_millis(30)]
        );
    }
}
