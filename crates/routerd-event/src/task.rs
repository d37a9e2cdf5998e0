//! Priority-classed repeated tasks
//!
//! A task is a callback the event loop keeps invoking whenever nothing
//! more urgent is runnable; returning `false` retires it. Within one
//! priority class tasks run round-robin, with a weight controlling how
//! many consecutive turns a task gets per rotation. Route dump replay
//! and other bulk background work run here at background priority so
//! timers and I/O stay responsive.
//!
//! `TaskList` is a clonable handle; a running task may add or retire
//! tasks on the same list. Nested `run_one` from inside a task callback
//! is not supported.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::callback::Callback0;
use crate::timer::priority;

/// Default weight: one turn per rotation.
pub const DEFAULT_WEIGHT: u32 = 1;

struct TaskNode {
    cb: Callback0<bool>,
    weight: u32,
    turns_taken: u32,
    alive: bool,
}

type TaskRef = Rc<RefCell<TaskNode>>;

/// Handle to one scheduled task. Dropping the handle does not retire the
/// task; call [`TaskHandle::unschedule`] for that.
#[derive(Clone)]
pub struct TaskHandle {
    node: TaskRef,
}

impl TaskHandle {
    /// Retire the task; its callback is not invoked again.
    pub fn unschedule(&self) {
        self.node.borrow_mut().alive = false;
    }

    pub fn scheduled(&self) -> bool {
        self.node.borrow().alive
    }
}

struct ListInner {
    queues: BTreeMap<i32, VecDeque<TaskRef>>,
}

impl ListInner {
    fn runnable_priority(&self) -> i32 {
        for (prio, queue) in self.queues.iter() {
            if queue.iter().any(|t| t.borrow().alive) {
                return *prio;
            }
        }
        priority::INFINITE
    }

    /// Next task to run at the given priority, with retired tasks
    /// dropped off the front of the queue.
    fn front_task(&mut self, prio: i32) -> Option<TaskRef> {
        let queue = self.queues.get_mut(&prio)?;
        while let Some(front) = queue.front() {
            if front.borrow().alive {
                return Some(Rc::clone(front));
            }
            queue.pop_front();
        }
        self.queues.remove(&prio);
        None
    }

    fn finish_turn(&mut self, prio: i32, node: &TaskRef) {
        let mut n = node.borrow_mut();
        n.turns_taken += 1;
        let rotate = !n.alive || n.turns_taken >= n.weight;
        if rotate {
            n.turns_taken = 0;
        }
        let alive = n.alive;
        drop(n);

        let Some(queue) = self.queues.get_mut(&prio) else {
            return;
        };
        if rotate {
            // The node is still at the front: only run_one removes tasks
            // and callbacks only append or mark dead.
            if queue.front().map(|f| Rc::ptr_eq(f, node)).unwrap_or(false) {
                queue.pop_front();
            }
            if alive {
                queue.push_back(Rc::clone(node));
            }
        }
        if queue.is_empty() {
            self.queues.remove(&prio);
        }
    }
}

/// Round-robin scheduler for repeated tasks, one queue per priority.
/// Cheap to clone; clones share one set of queues.
#[derive(Clone)]
pub struct TaskList {
    inner: Rc<RefCell<ListInner>>,
}

impl TaskList {
    pub fn new() -> TaskList {
        TaskList {
            inner: Rc::new(RefCell::new(ListInner {
                queues: BTreeMap::new(),
            })),
        }
    }

    /// Add a repeated task. `weight` consecutive turns per rotation.
    pub fn new_task(&self, cb: Callback0<bool>, prio: i32, weight: u32) -> TaskHandle {
        let node = Rc::new(RefCell::new(TaskNode {
            cb,
            weight: weight.max(1),
            turns_taken: 0,
            alive: true,
        }));
        self.inner
            .borrow_mut()
            .queues
            .entry(prio)
            .or_default()
            .push_back(Rc::clone(&node));
        TaskHandle { node }
    }

    /// The most urgent priority with a live task, or
    /// [`priority::INFINITE`] if none.
    pub fn get_runnable_priority(&self) -> i32 {
        self.inner.borrow().runnable_priority()
    }

    pub fn ready(&self) -> bool {
        self.get_runnable_priority() != priority::INFINITE
    }

    pub fn empty(&self) -> bool {
        !self.ready()
    }

    /// Run one turn of the most urgent runnable task. Returns true if a
    /// task ran.
    pub fn run_one(&self) -> bool {
        let (prio, node) = {
            let mut inner = self.inner.borrow_mut();
            let prio = inner.runnable_priority();
            if prio == priority::INFINITE {
                return false;
            }
            match inner.front_task(prio) {
                Some(node) => (prio, node),
                None => return false,
            }
        };

        let cb = node.borrow().cb.clone();
        let keep = cb.dispatch();
        if !keep {
            node.borrow_mut().alive = false;
        }

        self.inner.borrow_mut().finish_turn(prio, &node);
        true
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}
