//! Peer socket client
//!
//! One TCP connection per peer, driven entirely by the event loop's
//! selector: non-blocking connect with a completion event, a queued
//! writer with a busy watermark, and the header-then-body read state
//! machine that frames BGP messages. Completions are delivered
//! single-threadedly, in the order their I/O completed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
use tracing::{debug, trace, warn};

use routerd_event::callback::{Callback0, Callback1};
use routerd_event::pool::RefPool;
use routerd_event::selector::{IoEvent, IoEventType, Selector};

use crate::error::{BgpError, BgpResult};
use crate::message::parse_header;
use crate::types::BGP_HEADER_LEN;

/// More than this many queued send buffers reports the output busy.
const OUTPUT_QUEUE_BUSY: usize = 20;

/// Events delivered to the connection owner.
#[derive(Debug)]
pub enum SocketEvent {
    /// Connect completed; `true` on success.
    Connected(bool),
    /// One complete wire message (header included).
    Message(Vec<u8>),
    /// Orderly EOF from the peer.
    Closed,
    /// The connection is unusable.
    Error(BgpError),
}

struct PendingSend {
    buf: Vec<u8>,
    sent: usize,
    done: Callback0<()>,
}

struct ClientInner {
    stream: Option<TcpStream>,
    fd: RawFd,
    connected: bool,
    sendq: VecDeque<PendingSend>,
    write_registered: bool,
    /// Assembly buffer: header first, then the announced remainder.
    rdbuf: Vec<u8>,
    need: usize,
    selector: Selector,
    pool: RefPool,
    event_cb: Callback1<(), SocketEvent>,
}

impl ClientInner {
    fn teardown(&mut self) {
        if self.stream.is_some() {
            let _ = self.selector.remove_ioevent_cb(self.fd, IoEventType::Read);
            if self.write_registered {
                let _ = self.selector.remove_ioevent_cb(self.fd, IoEventType::Write);
                self.write_registered = false;
            }
            self.stream = None;
            // Pending completions are discarded with the queue.
            self.sendq.clear();
        }
    }

    /// Drain the send queue. Returns completed-send callbacks to run.
    fn flush_sends(&mut self) -> Vec<Callback0<()>> {
        let mut done = Vec::new();
        let Some(stream) = self.stream.as_mut() else {
            return done;
        };
        while let Some(front) = self.sendq.front_mut() {
            match stream.write(&front.buf[front.sent..]) {
                Ok(n) => {
                    front.sent += n;
                    if front.sent == front.buf.len() {
                        let sent = self.sendq.pop_front().expect("front exists");
                        done.push(sent.done);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(fd = self.fd, error = %e, "send failed");
                    break;
                }
            }
        }
        if self.sendq.is_empty() && self.write_registered {
            let _ = self.selector.remove_ioevent_cb(self.fd, IoEventType::Write);
            self.write_registered = false;
        }
        done
    }

    /// Read until a full message assembles or the socket would block.
    fn try_read_one(&mut self) -> Option<SocketEvent> {
        let stream = self.stream.as_mut()?;
        loop {
            let have = self.rdbuf.len();
            if have == self.need {
                if self.need == BGP_HEADER_LEN {
                    // Header complete: learn the total length.
                    let header: &[u8; BGP_HEADER_LEN] =
                        self.rdbuf[..].try_into().expect("header length");
                    match parse_header(header) {
                        Ok((_mtype, total)) => {
                            if total == BGP_HEADER_LEN {
                                let msg = std::mem::replace(
                                    &mut self.rdbuf,
                                    Vec::with_capacity(BGP_HEADER_LEN),
                                );
                                self.need = BGP_HEADER_LEN;
                                return Some(SocketEvent::Message(msg));
                            }
                            self.need = total;
                            continue;
                        }
                        Err(e) => return Some(SocketEvent::Error(e)),
                    }
                }
                let msg =
                    std::mem::replace(&mut self.rdbuf, Vec::with_capacity(BGP_HEADER_LEN));
                self.need = BGP_HEADER_LEN;
                return Some(SocketEvent::Message(msg));
            }

            let mut chunk = [0u8; 4096];
            let want = (self.need - have).min(chunk.len());
            match stream.read(&mut chunk[..want]) {
                Ok(0) => return Some(SocketEvent::Closed),
                Ok(n) => self.rdbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Some(SocketEvent::Error(BgpError::Socket(
                        nix::Error::from_raw(e.raw_os_error().unwrap_or(0)),
                    )))
                }
            }
        }
    }
}

/// A peer's TCP connection, registered with the event loop.
pub struct SocketClient {
    inner: Rc<RefCell<ClientInner>>,
}

impl SocketClient {
    /// Begin a non-blocking connect. The `Connected` event arrives via
    /// `event_cb` once the handshake resolves.
    pub fn connect(
        addr: SocketAddrV4,
        selector: &Selector,
        pool: &RefPool,
        event_cb: Callback1<(), SocketEvent>,
    ) -> BgpResult<SocketClient> {
        let fd: OwnedFd = socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let raw = fd.as_raw_fd();
        let sockaddr = SockaddrIn::from(addr);

        let in_progress = match socket::connect(raw, &sockaddr) {
            Ok(()) => false,
            Err(nix::Error::EINPROGRESS) => true,
            Err(e) => return Err(BgpError::Socket(e)),
        };
        debug!(fd = raw, %addr, in_progress, "peer connect initiated");

        let stream = TcpStream::from(fd);
        let client = Self::register(stream, selector, pool, event_cb, !in_progress)?;

        if in_progress {
            // Completion shows up as writability; check SO_ERROR there.
            let inner = Rc::clone(&client.inner);
            client.inner.borrow_mut().write_registered = true;
            selector.add_ioevent_cb(
                raw,
                IoEventType::Write,
                Callback1::new(pool, move |_ev: IoEvent| {
                    connect_writable(&inner);
                }),
            )?;
        } else {
            let cb = client.inner.borrow().event_cb.clone();
            cb.dispatch(SocketEvent::Connected(true));
        }
        Ok(client)
    }

    /// Wrap an already connected stream (e.g. an accepted connection).
    pub fn from_stream(
        stream: TcpStream,
        selector: &Selector,
        pool: &RefPool,
        event_cb: Callback1<(), SocketEvent>,
    ) -> BgpResult<SocketClient> {
        Self::register(stream, selector, pool, event_cb, true)
    }

    fn register(
        stream: TcpStream,
        selector: &Selector,
        pool: &RefPool,
        event_cb: Callback1<(), SocketEvent>,
        connected: bool,
    ) -> BgpResult<SocketClient> {
        stream
            .set_nonblocking(true)
            .map_err(|e| BgpError::Socket(nix::Error::from_raw(e.raw_os_error().unwrap_or(0))))?;
        let fd = stream.as_raw_fd();
        let inner = Rc::new(RefCell::new(ClientInner {
            stream: Some(stream),
            fd,
            connected,
            sendq: VecDeque::new(),
            write_registered: false,
            rdbuf: Vec::with_capacity(BGP_HEADER_LEN),
            need: BGP_HEADER_LEN,
            selector: selector.clone(),
            pool: pool.clone(),
            event_cb,
        }));

        let read_inner = Rc::clone(&inner);
        selector.add_ioevent_cb(
            fd,
            IoEventType::Read,
            Callback1::new(pool, move |_ev: IoEvent| {
                handle_readable(&read_inner);
            }),
        )?;
        Ok(SocketClient { inner })
    }

    pub fn is_connected(&self) -> bool {
        let inner = self.inner.borrow();
        inner.connected && inner.stream.is_some()
    }

    /// Queue a message for transmission; `done` runs when the last
    /// byte is handed to the kernel.
    pub fn send_message(&self, buf: Vec<u8>, done: Callback0<()>) -> BgpResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.stream.is_none() || !inner.connected {
            return Err(BgpError::NotConnected);
        }
        trace!(fd = inner.fd, len = buf.len(), "queueing message");
        inner.sendq.push_back(PendingSend {
            buf,
            sent: 0,
            done,
        });

        let completed = inner.flush_sends();
        if !inner.sendq.is_empty() && !inner.write_registered {
            let fd = inner.fd;
            let selector = inner.selector.clone();
            let pool = inner.pool.clone();
            inner.write_registered = true;
            let write_inner = Rc::clone(&self.inner);
            let write_cb = Callback1::new(&pool, move |_ev: IoEvent| {
                handle_writable(&write_inner);
            });
            drop(inner);
            selector.add_ioevent_cb(fd, IoEventType::Write, write_cb)?;
        } else {
            drop(inner);
        }
        for cb in completed {
            cb.dispatch();
        }
        Ok(())
    }

    /// Backpressure signal: more than 20 buffers waiting.
    pub fn output_queue_busy(&self) -> bool {
        self.inner.borrow().sendq.len() > OUTPUT_QUEUE_BUSY
    }

    pub fn pending_sends(&self) -> usize {
        self.inner.borrow().sendq.len()
    }

    /// Drop the connection. Pending completions are silently
    /// discarded.
    pub fn disconnect(&self) {
        self.inner.borrow_mut().teardown();
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.inner.borrow_mut().teardown();
    }
}

fn connect_writable(inner: &Rc<RefCell<ClientInner>>) {
    let (event_cb, event) = {
        let mut i = inner.borrow_mut();
        let _ = i.selector.remove_ioevent_cb(i.fd, IoEventType::Write);
        i.write_registered = false;
        let ok = matches!(
            socket::getsockopt(
                i.stream.as_ref().expect("connect in progress"),
                sockopt::SocketError
            ),
            Ok(0)
        );
        i.connected = ok;
        if !ok {
            i.teardown();
        }
        (i.event_cb.clone(), SocketEvent::Connected(ok))
    };
    event_cb.dispatch(event);
}

fn handle_readable(inner: &Rc<RefCell<ClientInner>>) {
    loop {
        let (event_cb, event) = {
            let mut i = inner.borrow_mut();
            match i.try_read_one() {
                Some(ev) => {
                    if matches!(ev, SocketEvent::Closed | SocketEvent::Error(_)) {
                        i.teardown();
                    }
                    (i.event_cb.clone(), ev)
                }
                None => return,
            }
        };
        let fatal = matches!(event, SocketEvent::Closed | SocketEvent::Error(_));
        event_cb.dispatch(event);
        if fatal {
            return;
        }
    }
}

fn handle_writable(inner: &Rc<RefCell<ClientInner>>) {
    let completed = inner.borrow_mut().flush_sends();
    for cb in completed {
        cb.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routerd_event::callback::{callback0, callback1};
    use routerd_event::timeval::TimeVal;
    use std::cell::Cell;
    use std::net::{Ipv4Addr, SocketAddr, TcpListener};

    fn fixture() -> (Selector, RefPool) {
        (Selector::new(), RefPool::new())
    }

    fn local_listener() -> (TcpListener, SocketAddrV4) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!("bound v4"),
        };
        (listener, addr)
    }

    fn pump(selector: &Selector, events: &Rc<RefCell<Vec<SocketEvent>>>, until: usize) {
        for _ in 0..100 {
            if events.borrow().len() >= until {
                return;
            }
            selector
                .wait_and_dispatch(Some(TimeVal::from_millis(20)))
                .unwrap();
        }
        panic!("expected {until} events, got {}", events.borrow().len());
    }

    fn event_recorder(
        pool: &RefPool,
    ) -> (Rc<RefCell<Vec<SocketEvent>>>, Callback1<(), SocketEvent>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        let cb = callback1(pool, move |ev: SocketEvent| e.borrow_mut().push(ev));
        (events, cb)
    }

    #[test]
    fn test_connect_completion() {
        let (selector, pool) = fixture();
        let (listener, addr) = local_listener();
        let (events, cb) = event_recorder(&pool);

        let client = SocketClient::connect(addr, &selector, &pool, cb).unwrap();
        let _accepted = listener.accept().unwrap();
        pump(&selector, &events, 1);

        assert!(matches!(events.borrow()[0], SocketEvent::Connected(true)));
        assert!(client.is_connected());
        assert!(!client.output_queue_busy());
    }

    #[test]
    fn test_split_message_assembly() {
        use std::io::Write as _;

        let (selector, pool) = fixture();
        let (listener, addr) = local_listener();
        let (events, cb) = event_recorder(&pool);

        let _client = SocketClient::connect(addr, &selector, &pool, cb).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();
        pump(&selector, &events, 1);

        // A keepalive delivered in two fragments: header bytes first.
        let wire = crate::message::Message::KeepAlive.encode(false);
        accepted.write_all(&wire[..10]).unwrap();
        accepted.flush().unwrap();
        selector.wait_and_dispatch(Some(TimeVal::from_millis(20))).unwrap();
        assert_eq!(events.borrow().len(), 1); // nothing assembled yet

        accepted.write_all(&wire[10..]).unwrap();
        accepted.flush().unwrap();
        pump(&selector, &events, 2);

        match &events.borrow()[1] {
            SocketEvent::Message(msg) => assert_eq!(msg, &wire),
            other => panic!("unexpected event {other:?}"),
        };
    }

    #[test]
    fn test_send_message_completion() {
        use std::io::Read as _;

        let (selector, pool) = fixture();
        let (listener, addr) = local_listener();
        let (events, cb) = event_recorder(&pool);

        let client = SocketClient::connect(addr, &selector, &pool, cb).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();
        pump(&selector, &events, 1);

        let sent = Rc::new(Cell::new(false));
        let s = sent.clone();
        let wire = crate::message::Message::KeepAlive.encode(false);
        client
            .send_message(wire.clone(), callback0(&pool, move || s.set(true)))
            .unwrap();
        for _ in 0..50 {
            if sent.get() {
                break;
            }
            selector.wait_and_dispatch(Some(TimeVal::from_millis(20))).unwrap();
        }
        assert!(sent.get());

        let mut got = vec![0u8; wire.len()];
        accepted.read_exact(&mut got).unwrap();
        assert_eq!(got, wire);
    }

    #[test]
    fn test_peer_close_reported() {
        let (selector, pool) = fixture();
        let (listener, addr) = local_listener();
        let (events, cb) = event_recorder(&pool);

        let client = SocketClient::connect(addr, &selector, &pool, cb).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        pump(&selector, &events, 1);

        drop(accepted);
        pump(&selector, &events, 2);
        assert!(matches!(events.borrow()[1], SocketEvent::Closed));
        assert!(!client.is_connected());
        assert!(!selector.events_pending());
    }

    #[test]
    fn test_corrupt_header_reported() {
        use std::io::Write as _;

        let (selector, pool) = fixture();
        let (listener, addr) = local_listener();
        let (events, cb) = event_recorder(&pool);

        let _client = SocketClient::connect(addr, &selector, &pool, cb).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();
        pump(&selector, &events, 1);

        let mut wire = crate::message::Message::KeepAlive.encode(false);
        wire[0] = 0x00; // break the marker
        accepted.write_all(&wire).unwrap();
        accepted.flush().unwrap();
        pump(&selector, &events, 2);

        match &events.borrow()[1] {
            SocketEvent::Error(e) => assert!(e.notify().is_some()),
            other => panic!("unexpected event {other:?}"),
        };
    }

    #[test]
    fn test_send_after_disconnect_fails() {
        let (selector, pool) = fixture();
        let (listener, addr) = local_listener();
        let (events, cb) = event_recorder(&pool);

        let client = SocketClient::connect(addr, &selector, &pool, cb).unwrap();
        let _accepted = listener.accept().unwrap();
        pump(&selector, &events, 1);

        client.disconnect();
        let err = client.send_message(vec![0; 4], Callback0::empty());
        assert!(matches!(err, Err(BgpError::NotConnected)));
    }
}
