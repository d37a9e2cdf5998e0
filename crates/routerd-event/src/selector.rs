//! I/O readiness selector
//!
//! Registers per-fd read/write interest and dispatches readiness
//! callbacks from `poll(2)`. Like everything else in the loop it is
//! single-threaded: callbacks run inline from `wait_and_dispatch`, and
//! they may freely register or remove fds (including their own).
//!
//! Error conditions (`POLLERR`/`POLLHUP`/`POLLNVAL`) wake every callback
//! registered on the fd so the owner observes the failure on its next
//! read or write.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::callback::Callback1;
use crate::error::{EventError, EventResult};
use crate::timeval::TimeVal;

/// Interest classes an fd can be watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoEventType {
    Read,
    Write,
}

/// Delivered to readiness callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    pub fd: RawFd,
    pub kind: IoEventType,
}

pub type IoCallback = Callback1<(), IoEvent>;

#[derive(Default)]
struct FdEntry {
    read: Option<IoCallback>,
    write: Option<IoCallback>,
}

struct SelInner {
    entries: HashMap<RawFd, FdEntry>,
}

/// Clonable handle to one selector. Clones share the registration table.
#[derive(Clone)]
pub struct Selector {
    inner: Rc<RefCell<SelInner>>,
}

impl Selector {
    pub fn new() -> Selector {
        Selector {
            inner: Rc::new(RefCell::new(SelInner {
                entries: HashMap::new(),
            })),
        }
    }

    /// Register `cb` for readiness of `fd`. One callback per
    /// (fd, interest); re-registering without removing is an error.
    pub fn add_ioevent_cb(&self, fd: RawFd, kind: IoEventType, cb: IoCallback) -> EventResult<()> {
        let mut inner = self.inner.borrow_mut();
        let entry = inner.entries.entry(fd).or_default();
        let slot = match kind {
            IoEventType::Read => &mut entry.read,
            IoEventType::Write => &mut entry.write,
        };
        if slot.is_some() {
            return Err(EventError::AlreadyRegistered(fd, kind));
        }
        *slot = Some(cb);
        Ok(())
    }

    /// Remove the callback for (fd, interest). Pending completions for
    /// it are silently discarded.
    pub fn remove_ioevent_cb(&self, fd: RawFd, kind: IoEventType) -> EventResult<()> {
        let mut inner = self.inner.borrow_mut();
        let entry = inner
            .entries
            .get_mut(&fd)
            .ok_or(EventError::NotRegistered(fd, kind))?;
        let slot = match kind {
            IoEventType::Read => &mut entry.read,
            IoEventType::Write => &mut entry.write,
        };
        if slot.take().is_none() {
            return Err(EventError::NotRegistered(fd, kind));
        }
        if entry.read.is_none() && entry.write.is_none() {
            inner.entries.remove(&fd);
        }
        Ok(())
    }

    /// Any fds registered?
    pub fn events_pending(&self) -> bool {
        !self.inner.borrow().entries.is_empty()
    }

    pub fn fd_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Poll for readiness and dispatch every ready callback. `None`
    /// timeout blocks indefinitely; `Some(ZERO)` polls. Returns the
    /// number of callbacks dispatched.
    ///
    /// Per fd, read readiness dispatches before write readiness; across
    /// fds the order is the poll report order.
    pub fn wait_and_dispatch(&self, timeout: Option<TimeVal>) -> EventResult<usize> {
        let watched: Vec<(RawFd, PollFlags)> = {
            let inner = self.inner.borrow();
            inner
                .entries
                .iter()
                .map(|(fd, e)| {
                    let mut flags = PollFlags::empty();
                    if e.read.is_some() {
                        flags |= PollFlags::POLLIN;
                    }
                    if e.write.is_some() {
                        flags |= PollFlags::POLLOUT;
                    }
                    (*fd, flags)
                })
                .collect()
        };
        if watched.is_empty() && timeout.is_none() {
            // Nothing to watch and no timeout: blocking forever here
            // would wedge the loop.
            return Ok(0);
        }

        // An empty fd set still sleeps for the timeout; that is how the
        // loop waits for its next timer.
        let mut pollfds: Vec<PollFd> = watched
            .iter()
            .map(|(fd, flags)| {
                // Safety: the fd stays registered (hence open, per the
                // owner's contract) for the duration of this call.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(borrowed, *flags)
            })
            .collect();

        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(t) => {
                let ms = t.as_millis().clamp(0, u16::MAX as i64) as u16;
                PollTimeout::from(ms)
            }
        };
        let n = poll(&mut pollfds, timeout)?;
        if n == 0 {
            return Ok(0);
        }

        // Collect ready callbacks before dispatching: callbacks may
        // mutate the registration table.
        let mut ready: Vec<(IoCallback, IoEvent)> = Vec::new();
        {
            let inner = self.inner.borrow();
            for (i, (fd, _)) in watched.iter().enumerate() {
                let revents = match pollfds[i].revents() {
                    Some(r) if !r.is_empty() => r,
                    _ => continue,
                };
                let Some(entry) = inner.entries.get(fd) else {
                    continue;
                };
                let failed = revents
                    .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL);
                if revents.contains(PollFlags::POLLIN) || failed {
                    if let Some(cb) = &entry.read {
                        ready.push((
                            cb.clone(),
                            IoEvent {
                                fd: *fd,
                                kind: IoEventType::Read,
                            },
                        ));
                    }
                }
                if revents.contains(PollFlags::POLLOUT) || failed {
                    if let Some(cb) = &entry.write {
                        ready.push((
                            cb.clone(),
                            IoEvent {
                                fd: *fd,
                                kind: IoEventType::Write,
                            },
                        ));
                    }
                }
            }
        }

        let count = ready.len();
        for (cb, ev) in ready {
            cb.dispatch(ev);
        }
        Ok(count)
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::callback1;
    use crate::pool::RefPool;
    use nix::unistd::{pipe, write};
    use std::cell::Cell;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_register_and_remove() {
        let pool = RefPool::new();
        let sel = Selector::new();

        assert!(!sel.events_pending());
        sel.add_ioevent_cb(5, IoEventType::Read, callback1(&pool, |_| ()))
            .unwrap();
        assert!(sel.events_pending());

        // Double registration is refused.
        let err = sel.add_ioevent_cb(5, IoEventType::Read, callback1(&pool, |_| ()));
        assert!(matches!(err, Err(EventError::AlreadyRegistered(5, IoEventType::Read))));

        sel.remove_ioevent_cb(5, IoEventType::Read).unwrap();
        assert!(!sel.events_pending());
        assert!(sel.remove_ioevent_cb(5, IoEventType::Read).is_err());
    }

    #[test]
    fn test_pipe_readiness_dispatch() {
        let pool = RefPool::new();
        let sel = Selector::new();
        let (rd, wr) = pipe().unwrap();

        let got = Rc::new(Cell::new(None));
        let g = got.clone();
        sel.add_ioevent_cb(
            rd.as_raw_fd(),
            IoEventType::Read,
            callback1(&pool, move |ev: IoEvent| g.set(Some(ev))),
        )
        .unwrap();

        // Nothing readable yet.
        let n = sel.wait_and_dispatch(Some(TimeVal::ZERO)).unwrap();
        assert_eq!(n, 0);

        write(&wr, b"x").unwrap();
        let n = sel.wait_and_dispatch(Some(TimeVal::ZERO)).unwrap();
        assert_eq!(n, 1);
        let ev = got.get().unwrap();
        assert_eq!(ev.fd, rd.as_raw_fd());
        assert_eq!(ev.kind, IoEventType::Read);
    }

    #[test]
    fn test_callback_may_remove_itself() {
        let pool = RefPool::new();
        let sel = Selector::new();
        let (rd, wr) = pipe().unwrap();
        let fd = rd.as_raw_fd();

        let s = sel.clone();
        sel.add_ioevent_cb(
            fd,
            IoEventType::Read,
            callback1(&pool, move |ev: IoEvent| {
                s.remove_ioevent_cb(ev.fd, IoEventType::Read).unwrap();
            }),
        )
        .unwrap();

        write(&wr, b"x").unwrap();
        sel.wait_and_dispatch(Some(TimeVal::ZERO)).unwrap();
        assert!(!sel.events_pending());
    }
}
