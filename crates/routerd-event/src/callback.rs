//! Type-erased, refcounted callbacks
//!
//! "Functions as values" passed across module boundaries and stored in
//! timers and I/O queues without the boundary knowing the concrete
//! callable type. Every callback shares one counter in the event loop's
//! [`RefPool`]; handle clones increment it, drops decrement it, and the
//! captured closure is destroyed exactly when the counter reaches zero.
//!
//! Two arities cover the codebase: [`Callback0`] for plain completions
//! and periodic ticks, [`Callback1`] for completions that carry a value
//! (I/O events, timer handles). Bound arguments are closure captures.
//!
//! Weak forms ([`WeakCallback0`], [`WeakCallback1`]) record the pool slot
//! without incrementing it. They exist to break the cycle where a timer
//! callback captures the handle of its own timer: resolution happens at
//! dispatch, and a dead slot simply skips the dispatch.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::pool::{RefPool, Slot};

/// Clonable handle to a `FnMut() -> R` closure.
pub struct Callback0<R> {
    inner: Option<Inner<dyn FnMut() -> R>>,
}

/// Clonable handle to a `FnMut(A) -> R` closure.
pub struct Callback1<R, A> {
    inner: Option<Inner<dyn FnMut(A) -> R>>,
}

struct Inner<F: ?Sized> {
    pool: RefPool,
    slot: Slot,
    func: Rc<RefCell<F>>,
}

impl<F: ?Sized> Clone for Inner<F> {
    fn clone(&self) -> Self {
        self.pool.incr(self.slot);
        Inner {
            pool: self.pool.clone(),
            slot: self.slot,
            func: Rc::clone(&self.func),
        }
    }
}

impl<F: ?Sized> Drop for Inner<F> {
    fn drop(&mut self) {
        self.pool.decr(self.slot);
    }
}

impl<R> Callback0<R> {
    /// Capture `f`, allocating one pool slot.
    pub fn new<F>(pool: &RefPool, f: F) -> Callback0<R>
    where
        F: FnMut() -> R + 'static,
    {
        Callback0 {
            inner: Some(Inner {
                pool: pool.clone(),
                slot: pool.alloc(),
                func: Rc::new(RefCell::new(f)),
            }),
        }
    }

    /// A handle referring to nothing. `dispatch` on it is a bug.
    pub fn empty() -> Callback0<R> {
        Callback0 { inner: None }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Invoke the captured closure.
    pub fn dispatch(&self) -> R {
        let inner = self.inner.as_ref().expect("dispatch on empty callback");
        (inner.func.borrow_mut())()
    }

    /// Pool slot backing this callback, if live.
    pub fn slot(&self) -> Option<Slot> {
        self.inner.as_ref().map(|i| i.slot)
    }

    /// Downgrade to a non-owning reference.
    pub fn downgrade(&self) -> WeakCallback0<R> {
        WeakCallback0 {
            inner: self.inner.as_ref().map(|i| (i.pool.clone(), i.slot, Rc::downgrade(&i.func))),
        }
    }
}

impl<R> Clone for Callback0<R> {
    fn clone(&self) -> Self {
        Callback0 {
            inner: self.inner.clone(),
        }
    }
}

impl<R> Default for Callback0<R> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<R, A> Callback1<R, A> {
    pub fn new<F>(pool: &RefPool, f: F) -> Callback1<R, A>
    where
        F: FnMut(A) -> R + 'static,
    {
        Callback1 {
            inner: Some(Inner {
                pool: pool.clone(),
                slot: pool.alloc(),
                func: Rc::new(RefCell::new(f)),
            }),
        }
    }

    pub fn empty() -> Callback1<R, A> {
        Callback1 { inner: None }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    pub fn dispatch(&self, arg: A) -> R {
        let inner = self.inner.as_ref().expect("dispatch on empty callback");
        (inner.func.borrow_mut())(arg)
    }

    pub fn slot(&self) -> Option<Slot> {
        self.inner.as_ref().map(|i| i.slot)
    }

    pub fn downgrade(&self) -> WeakCallback1<R, A> {
        WeakCallback1 {
            inner: self.inner.as_ref().map(|i| (i.pool.clone(), i.slot, Rc::downgrade(&i.func))),
        }
    }
}

impl<R, A> Clone for Callback1<R, A> {
    fn clone(&self) -> Self {
        Callback1 {
            inner: self.inner.clone(),
        }
    }
}

impl<R, A> Default for Callback1<R, A> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Capture an arity-0 closure. Shorthand for [`Callback0::new`].
pub fn callback0<R, F>(pool: &RefPool, f: F) -> Callback0<R>
where
    F: FnMut() -> R + 'static,
{
    Callback0::new(pool, f)
}

/// Capture an arity-1 closure. Shorthand for [`Callback1::new`].
pub fn callback1<R, A, F>(pool: &RefPool, f: F) -> Callback1<R, A>
where
    F: FnMut(A) -> R + 'static,
{
    Callback1::new(pool, f)
}

/// Non-owning reference to a [`Callback0`].
pub struct WeakCallback0<R> {
    inner: Option<(RefPool, Slot, Weak<RefCell<dyn FnMut() -> R>>)>,
}

impl<R> WeakCallback0<R> {
    /// Resolve to a strong handle, or `None` if the counter already hit
    /// zero (or the slot was recycled since).
    pub fn upgrade(&self) -> Option<Callback0<R>> {
        let (pool, slot, func) = self.inner.as_ref()?;
        if !pool.is_live(*slot) {
            return None;
        }
        let func = func.upgrade()?;
        pool.incr(*slot);
        Some(Callback0 {
            inner: Some(Inner {
                pool: pool.clone(),
                slot: *slot,
                func,
            }),
        })
    }
}

impl<R> Clone for WeakCallback0<R> {
    fn clone(&self) -> Self {
        WeakCallback0 {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning reference to a [`Callback1`].
pub struct WeakCallback1<R, A> {
    inner: Option<(RefPool, Slot, Weak<RefCell<dyn FnMut(A) -> R>>)>,
}

impl<R, A> WeakCallback1<R, A> {
    pub fn upgrade(&self) -> Option<Callback1<R, A>> {
        let (pool, slot, func) = self.inner.as_ref()?;
        if !pool.is_live(*slot) {
            return None;
        }
        let func = func.upgrade()?;
        pool.incr(*slot);
        Some(Callback1 {
            inner: Some(Inner {
                pool: pool.clone(),
                slot: *slot,
                func,
            }),
        })
    }
}

impl<R, A> Clone for WeakCallback1<R, A> {
    fn clone(&self) -> Self {
        WeakCallback1 {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_dispatch_with_captures() {
        let pool = RefPool::new();
        let hits = Rc::new(Cell::new(0u32));

        let h = hits.clone();
        let cb = callback0(&pool, move || h.set(h.get() + 1));
        cb.dispatch();
        cb.dispatch();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_clone_shares_one_slot() {
        let pool = RefPool::new();
        let cb = callback0(&pool, || 7u32);
        assert_eq!(pool.balance(), 1);

        let cb2 = cb.clone();
        assert_eq!(pool.balance(), 1);
        assert_eq!(cb.slot(), cb2.slot());

        drop(cb);
        assert_eq!(pool.balance(), 1);
        assert_eq!(cb2.dispatch(), 7);
        drop(cb2);
        assert_eq!(pool.balance(), 0);
    }

    #[test]
    fn test_empty_handle() {
        let cb: Callback0<()> = Callback0::empty();
        assert!(cb.is_empty());

        let pool = RefPool::new();
        let live = callback0(&pool, || ());
        assert!(!live.is_empty());
    }

    #[test]
    fn test_callback1_argument() {
        let pool = RefPool::new();
        let cb: Callback1<u32, u32> = callback1(&pool, |x| x * 2);
        assert_eq!(cb.dispatch(21), 42);
    }

    #[test]
    fn test_weak_skips_after_drop() {
        let pool = RefPool::new();
        let cb = callback0(&pool, || 1u32);
        let weak = cb.downgrade();

        assert!(weak.upgrade().is_some());
        drop(cb);
        assert!(weak.upgrade().is_none());
        assert_eq!(pool.balance(), 0);
    }

    #[test]
    fn test_weak_upgrade_counts() {
        let pool = RefPool::new();
        let cb = callback0(&pool, || 1u32);
        let weak = cb.downgrade();

        let strong = weak.upgrade().unwrap();
        drop(cb);
        // The upgraded handle keeps the closure alive.
        assert_eq!(strong.dispatch(), 1);
        drop(strong);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_destructor_runs_at_zero() {
        struct Probe(Rc<Cell<bool>>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let pool = RefPool::new();
        let dropped = Rc::new(Cell::new(false));
        let probe = Probe(dropped.clone());
        let cb = callback0(&pool, move || {
            let _ = &probe;
        });
        let cb2 = cb.clone();
        drop(cb);
        assert!(!dropped.get());
        drop(cb2);
        assert!(dropped.get());
    }
}
