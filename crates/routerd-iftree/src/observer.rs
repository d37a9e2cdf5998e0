//! Mirror updates and observer notifications
//!
//! The forwarding-plane client delivers interface state into an
//! [`IfMirror`]; daemons register observers and re-query the tree when
//! notified. Two events exist: `tree_complete` once the initial sync
//! finishes, and `updates_made` for every later batch of changes. No
//! diff is delivered.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::tree::IfTree;

/// Implemented by daemons that track interface state.
pub trait IfTreeObserver {
    /// Initial synchronization finished; the tree is authoritative.
    fn tree_complete(&mut self);

    /// One or more changes arrived. Re-query the tree.
    fn updates_made(&mut self);
}

/// Owns the shared tree and fans change notifications out.
///
/// All mutation goes through [`IfMirror::update`], which applies a batch
/// atomically with respect to observers: they only ever see the tree
/// between batches.
pub struct IfMirror {
    tree: IfTree,
    observers: Vec<Weak<RefCell<dyn IfTreeObserver>>>,
    synced: bool,
}

impl IfMirror {
    pub fn new() -> IfMirror {
        IfMirror {
            tree: IfTree::new(),
            observers: Vec::new(),
            synced: false,
        }
    }

    pub fn tree(&self) -> &IfTree {
        &self.tree
    }

    /// Has the initial sync completed?
    pub fn synced(&self) -> bool {
        self.synced
    }

    /// Register an observer. Held weakly; dropped observers are pruned
    /// on the next notification.
    pub fn add_observer(&mut self, obs: &Rc<RefCell<dyn IfTreeObserver>>) {
        self.observers.push(Rc::downgrade(obs));
    }

    /// Apply a batch of mutations, then notify `updates_made` (only
    /// after the initial sync; pre-sync batches are part of it).
    pub fn update(&mut self, batch: impl FnOnce(&mut IfTree)) {
        batch(&mut self.tree);
        if self.synced {
            self.notify(|o| o.updates_made());
        }
    }

    /// Mark the initial sync finished and notify `tree_complete`.
    pub fn set_complete(&mut self) {
        if self.synced {
            return;
        }
        self.synced = true;
        debug!("interface mirror synchronized");
        self.notify(|o| o.tree_complete());
    }

    fn notify(&mut self, f: impl Fn(&mut dyn IfTreeObserver)) {
        self.observers.retain(|w| w.upgrade().is_some());
        // Snapshot so an observer adding observers does not invalidate
        // the iteration.
        let live: Vec<_> = self.observers.iter().filter_map(Weak::upgrade).collect();
        for obs in live {
            f(&mut *obs.borrow_mut());
        }
    }
}

impl Default for IfMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{IfFlags, IfTreeInterface};

    #[derive(Default)]
    struct Recorder {
        completes: u32,
        updates: u32,
    }

    impl IfTreeObserver for Recorder {
        fn tree_complete(&mut self) {
            self.completes += 1;
        }
        fn updates_made(&mut self) {
            self.updates += 1;
        }
    }

    fn observer() -> (Rc<RefCell<Recorder>>, Rc<RefCell<dyn IfTreeObserver>>) {
        let rec = Rc::new(RefCell::new(Recorder::default()));
        let dynamic: Rc<RefCell<dyn IfTreeObserver>> = rec.clone();
        (rec, dynamic)
    }

    #[test]
    fn test_complete_then_updates() {
        let mut mirror = IfMirror::new();
        let (rec, obs) = observer();
        mirror.add_observer(&obs);

        // Pre-sync batches are silent.
        mirror.update(|tree| {
            let mut eth0 = IfTreeInterface::new("eth0");
            eth0.flags = IfFlags::ENABLED;
            tree.add_interface(eth0);
        });
        assert_eq!(rec.borrow().updates, 0);

        mirror.set_complete();
        assert_eq!(rec.borrow().completes, 1);
        assert!(mirror.synced());

        mirror.update(|tree| {
            tree.remove_interface("eth0");
        });
        assert_eq!(rec.borrow().updates, 1);
        assert!(mirror.tree().find_interface("eth0").is_none());
    }

    #[test]
    fn test_set_complete_idempotent() {
        let mut mirror = IfMirror::new();
        let (rec, obs) = observer();
        mirror.add_observer(&obs);

        mirror.set_complete();
        mirror.set_complete();
        assert_eq!(rec.borrow().completes, 1);
    }

    #[test]
    fn test_dropped_observer_pruned() {
        let mut mirror = IfMirror::new();
        let (rec, obs) = observer();
        mirror.add_observer(&obs);

        {
            let (_rec2, obs2) = observer();
            mirror.add_observer(&obs2);
            // obs2 dropped here
        }

        mirror.set_complete();
        mirror.update(|_| {});
        assert_eq!(rec.borrow().updates, 1);
    }
}
