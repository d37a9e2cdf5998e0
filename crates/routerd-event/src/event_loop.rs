//! The event loop
//!
//! Orchestrates all components: clock, refcount pool, timer list, task
//! list, selector. One `run()` call performs one iteration:
//!
//! 1. refresh the clock;
//! 2. sleep in `poll(2)` for `min(next timer delay, max_poll_wait)`,
//!    or not at all when a timer or task is already runnable;
//! 3. dispatch any ready I/O callbacks;
//! 4. dispatch the more urgent of (expired timers, one task turn) -
//!    at equal priority, timers win.
//!
//! All dispatch happens on the calling thread; a callback holds the sole
//! mutation right for the duration of its execution and "waits" only by
//! scheduling a timer or registering an fd and returning.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use tracing::warn;

use crate::callback::{Callback0, Callback1};
use crate::clock::{ClockSource, SystemClock};
use crate::config::EventLoopConfig;
use crate::error::EventResult;
use crate::pool::RefPool;
use crate::selector::{IoCallback, IoEventType, Selector};
use crate::task::{TaskHandle, TaskList, DEFAULT_WEIGHT};
use crate::timer::{priority, TimerHandle, TimerList};
use crate::timeval::TimeVal;
use std::os::fd::RawFd;

pub struct EventLoop {
    clock: Rc<RefCell<dyn ClockSource>>,
    pool: RefPool,
    timers: TimerList,
    tasks: TaskList,
    selector: Selector,
    config: EventLoopConfig,
}

impl EventLoop {
    /// Event loop over the system monotonic clock.
    pub fn new(config: EventLoopConfig) -> EventLoop {
        Self::with_clock(Rc::new(RefCell::new(SystemClock::new())), config)
    }

    /// Event loop over a caller-supplied clock (tests use
    /// [`ManualClock`](crate::clock::ManualClock)).
    pub fn with_clock(clock: Rc<RefCell<dyn ClockSource>>, config: EventLoopConfig) -> EventLoop {
        config.validate().expect("invalid event loop configuration");
        let pool = RefPool::new();
        let timers = TimerList::new(clock.clone(), &pool);
        EventLoop {
            clock,
            pool,
            timers,
            tasks: TaskList::new(),
            selector: Selector::new(),
            config,
        }
    }

    pub fn pool(&self) -> &RefPool {
        &self.pool
    }

    pub fn timer_list(&self) -> &TimerList {
        &self.timers
    }

    pub fn task_list(&self) -> &TaskList {
        &self.tasks
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn current_time(&self) -> TimeVal {
        self.clock.borrow().current_time()
    }

    pub fn advance_time(&self) {
        self.clock.borrow_mut().advance_time();
    }

    // Convenience pass-throughs, so consumers hold one handle.

    pub fn new_oneoff_at(&self, when: TimeVal, cb: Callback0<()>, prio: i32) -> TimerHandle {
        self.timers.new_oneoff_at(when, cb, prio)
    }

    pub fn new_oneoff_after(&self, wait: TimeVal, cb: Callback0<()>, prio: i32) -> TimerHandle {
        self.timers.new_oneoff_after(wait, cb, prio)
    }

    pub fn new_periodic(&self, period: TimeVal, cb: Callback0<bool>, prio: i32) -> TimerHandle {
        self.timers.new_periodic(period, cb, prio)
    }

    pub fn set_flag_after(
        &self,
        wait: TimeVal,
        flag: &Rc<Cell<bool>>,
        to_value: bool,
        prio: i32,
    ) -> TimerHandle {
        self.timers.set_flag_after(wait, flag, to_value, prio)
    }

    pub fn new_timer(&self, cb: Callback1<(), TimerHandle>) -> TimerHandle {
        self.timers.new_timer(cb)
    }

    pub fn new_task(&self, cb: Callback0<bool>, prio: i32) -> TaskHandle {
        self.tasks.new_task(cb, prio, DEFAULT_WEIGHT)
    }

    pub fn add_ioevent_cb(&self, fd: RawFd, kind: IoEventType, cb: IoCallback) -> EventResult<()> {
        self.selector.add_ioevent_cb(fd, kind, cb)
    }

    pub fn remove_ioevent_cb(&self, fd: RawFd, kind: IoEventType) -> EventResult<()> {
        self.selector.remove_ioevent_cb(fd, kind)
    }

    /// Anything scheduled, runnable, or watched?
    pub fn events_pending(&self) -> bool {
        !self.timers.empty() || self.tasks.ready() || self.selector.events_pending()
    }

    /// One iteration: wait, then dispatch.
    pub fn run(&self) {
        self.advance_time();

        let timer_prio = self.timers.get_expired_priority();
        let task_ready = self.tasks.ready();

        let wait = if timer_prio != priority::INFINITE || task_ready {
            TimeVal::ZERO
        } else {
            self.timers
                .get_next_delay()
                .unwrap_or(TimeVal::MAXIMUM)
                .min(self.config.max_poll_wait)
        };

        if let Err(e) = self.selector.wait_and_dispatch(Some(wait)) {
            warn!(error = %e, "selector dispatch failed");
        }

        let dispatch_started = Instant::now();
        self.advance_time();
        let timer_prio = self.timers.get_expired_priority();
        let task_prio = self.tasks.get_runnable_priority();
        if timer_prio <= task_prio && timer_prio != priority::INFINITE {
            self.timers.run();
        } else if task_prio != priority::INFINITE {
            self.tasks.run_one();
        }

        let elapsed = dispatch_started.elapsed();
        if elapsed > self.config.aged_callback {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "aged event loop dispatch");
        }
    }

    /// Tear the loop down and report leaked pool slots.
    ///
    /// With every handle released beforehand the balance is zero; a
    /// nonzero value is a refcount leak and is logged.
    pub fn shutdown(self) -> usize {
        let EventLoop {
            clock,
            pool,
            timers,
            tasks,
            selector,
            config: _,
        } = self;
        drop(timers);
        drop(tasks);
        drop(selector);
        drop(clock);
        let leaked = pool.balance();
        if leaked != 0 {
            warn!(leaked, "refcount pool balance nonzero at teardown");
            debug_assert_eq!(leaked, 0, "refcount pool leak");
        }
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{callback0, callback1};
    use crate::clock::ManualClock;
    use crate::selector::IoEvent;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsRawFd;

    fn manual_loop() -> (EventLoop, Rc<RefCell<ManualClock>>) {
        let clock = Rc::new(RefCell::new(ManualClock::new(TimeVal::ZERO)));
        let config = EventLoopConfig::from_env().max_poll_wait(TimeVal::from_millis(1));
        (EventLoop::with_clock(clock.clone(), config), clock)
    }

    #[test]
    fn test_timer_beats_task_at_equal_priority() {
        let (evloop, clock) = manual_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let _t = evloop.new_oneoff_at(
            TimeVal::from_millis(1),
            callback0(evloop.pool(), move || o.borrow_mut().push("timer")),
            priority::DEFAULT,
        );
        let o = order.clone();
        evloop.new_task(
            callback0(evloop.pool(), move || {
                o.borrow_mut().push("task");
                false
            }),
            priority::DEFAULT,
        );

        clock.borrow_mut().set(TimeVal::from_millis(1));
        evloop.run();
        evloop.run();
        assert_eq!(*order.borrow(), vec!["timer", "task"]);
    }

    #[test]
    fn test_io_dispatch_through_loop() {
        let (evloop, _clock) = manual_loop();
        let (rd, wr) = pipe().unwrap();
        let got = Rc::new(Cell::new(false));

        let g = got.clone();
        let sel = evloop.selector().clone();
        let fd = rd.as_raw_fd();
        evloop
            .add_ioevent_cb(
                fd,
                IoEventType::Read,
                callback1(evloop.pool(), move |ev: IoEvent| {
                    g.set(true);
                    sel.remove_ioevent_cb(ev.fd, IoEventType::Read).unwrap();
                }),
            )
            .unwrap();

        write(&wr, b"ping").unwrap();
        evloop.run();
        assert!(got.get());
        assert!(!evloop.events_pending());
    }

    #[test]
    fn test_shutdown_balance_zero() {
        let (evloop, clock) = manual_loop();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let t = evloop.new_oneoff_at(
            TimeVal::from_millis(1),
            callback0(evloop.pool(), move || f.set(true)),
            priority::DEFAULT,
        );
        clock.borrow_mut().set(TimeVal::from_millis(1));
        evloop.run();
        assert!(fired.get());

        drop(t);
        assert_eq!(evloop.shutdown(), 0);
    }

    #[test]
    fn test_events_pending() {
        let (evloop, _clock) = manual_loop();
        assert!(!evloop.events_pending());

        let t = evloop.new_oneoff_after(
            TimeVal::from_secs(10),
            callback0(evloop.pool(), || ()),
            priority::DEFAULT,
        );
        assert!(evloop.events_pending());
        t.unschedule();
        assert!(!evloop.events_pending());
    }
}
