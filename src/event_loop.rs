//! The event loop: backend ownership, socket/context arenas, dispatch,
//! the sweep tick and the deferred-close safe point.
//!
//! Everything here runs on one thread. Sockets and contexts live in slab
//! arenas and are addressed by stable handles; closing a socket unlinks
//! it immediately (no further events are delivered) but the arena entry
//! and descriptor are only released at the end of the current dispatch
//! batch, so a callback may close the very socket it is running for.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use slab::Slab;

use crate::backend::{
    BackendKind, Event, EventBackend, FusionBackend, Interest, LoopWaker, TOKEN_SWEEP, TOKEN_WAKEUP,
};
use crate::error::Result;
use crate::net;

/// Size of the shared receive buffer, reused across dispatches. Data
/// handed to `on_data` borrows it and must be copied to be retained.
pub(crate) const RECV_BUFFER_LEN: usize = 512 * 1024;

/// Default sweep granularity, in line with the coarse four-second tick
/// the timeout counters are counted in.
pub const DEFAULT_SWEEP_GRANULARITY: Duration = Duration::from_secs(4);

const MAX_ACCEPTS_PER_EVENT: usize = 32;

/// Stable handle to a socket in the loop's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) usize);

/// Stable handle to a socket context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) usize);

pub(crate) type ExtFactory = Rc<dyn Fn() -> Box<dyn Any>>;

pub(crate) type OpenCb = Rc<RefCell<dyn FnMut(&mut EventLoop, SocketId, bool)>>;
pub(crate) type DataCb = Rc<RefCell<dyn FnMut(&mut EventLoop, SocketId, &[u8])>>;
pub(crate) type SocketCb = Rc<RefCell<dyn FnMut(&mut EventLoop, SocketId)>>;
pub(crate) type WakeupCb = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;

pub(crate) enum PollKind {
    Stream,
    Listener { accept_ext: ExtFactory },
}

pub(crate) struct SocketEntry {
    pub(crate) fd: RawFd,
    pub(crate) kind: PollKind,
    pub(crate) interest: Interest,
    pub(crate) context: ContextId,
    pub(crate) timeout_ticks: u16,
    pub(crate) shutting_down: bool,
    pub(crate) shutdown_performed: bool,
    pub(crate) closed: bool,
    pub(crate) connecting: bool,
    pub(crate) corked: bool,
    pub(crate) ext: Box<dyn Any>,
}

#[derive(Default)]
pub(crate) struct ContextEntry {
    pub(crate) sockets: Vec<SocketId>,
    pub(crate) ext: Option<Box<dyn Any>>,
    pub(crate) on_open: Option<OpenCb>,
    pub(crate) on_data: Option<DataCb>,
    pub(crate) on_writable: Option<SocketCb>,
    pub(crate) on_close: Option<SocketCb>,
    pub(crate) on_timeout: Option<SocketCb>,
}

/// Loop creation options.
#[derive(Clone, Copy, Debug)]
pub struct LoopOptions {
    pub backend: BackendKind,
    /// Sweep timer period; socket timeouts are counted in these ticks.
    pub sweep_granularity: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        LoopOptions {
            backend: BackendKind::default(),
            sweep_granularity: DEFAULT_SWEEP_GRANULARITY,
        }
    }
}

pub struct EventLoop {
    backend: FusionBackend,
    pub(crate) sockets: Slab<SocketEntry>,
    pub(crate) contexts: Slab<ContextEntry>,
    pending_close: Vec<SocketId>,
    /// Tokens with work left behind by a bounded handler (accept cap,
    /// full receive buffer). Replayed as synthetic readable events on the
    /// next turn; edge-triggered backends deliver no fresh kernel event
    /// for them.
    resume_ready: Vec<usize>,
    recv_buf: Option<Vec<u8>>,
    spare_events: Vec<Event>,
    live_polls: usize,
    granularity: Duration,
    on_wakeup: Option<WakeupCb>,
    loop_ext: Box<dyn Any>,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        Self::with_options(LoopOptions::default())
    }

    pub fn with_options(options: LoopOptions) -> Result<EventLoop> {
        let mut backend = FusionBackend::new(options.backend)?;
        backend.arm_sweep(options.sweep_granularity)?;
        Ok(EventLoop {
            backend,
            sockets: Slab::new(),
            contexts: Slab::new(),
            pending_close: Vec::new(),
            resume_ready: Vec::new(),
            recv_buf: Some(vec![0u8; RECV_BUFFER_LEN]),
            spare_events: Vec::new(),
            live_polls: 0,
            granularity: options.sweep_granularity,
            on_wakeup: None,
            loop_ext: Box::new(()),
        })
    }

    /// Install the callback run on the loop thread after a cross-thread
    /// [`LoopWaker::wake`]. Last setter wins.
    pub fn on_wakeup(&mut self, f: impl FnMut(&mut EventLoop) + 'static) {
        self.on_wakeup = Some(Rc::new(RefCell::new(f)));
    }

    /// Hand out the cross-thread wakeup handle.
    pub fn waker(&self) -> Result<LoopWaker> {
        Ok(self.backend.waker()?)
    }

    /// Attach opaque loop-level user data.
    pub fn set_loop_ext(&mut self, ext: Box<dyn Any>) {
        self.loop_ext = ext;
    }

    pub fn loop_ext_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.loop_ext.downcast_mut::<T>()
    }

    pub(crate) fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Drive the loop until no live polls remain. Returning is an idle
    /// state, not a terminal one: registering new sockets and calling
    /// `run` again resumes service.
    pub fn run(&mut self) -> io::Result<()> {
        while self.live_polls > 0 {
            self.turn(None)?;
        }
        Ok(())
    }

    /// One wait-dispatch-drain iteration. Returns the number of events
    /// dispatched (internal wakeup and sweep ticks included).
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.turn(timeout)
    }

    fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = mem::take(&mut self.spare_events);
        events.clear();
        let resumed = mem::take(&mut self.resume_ready);
        let wait_timeout = if resumed.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        self.backend.wait(&mut events, wait_timeout)?;
        // a resumed token may have gone stale or duplicate a kernel
        // event; dispatch re-checks and a drained backlog is a no-op
        for token in resumed {
            events.push(Event::internal(token));
        }
        let count = events.len();
        for event in &events {
            self.dispatch(event);
        }
        self.spare_events = events;
        // safe point: batch is done, stale handles are gone
        self.drain_pending_close();
        Ok(count)
    }

    fn dispatch(&mut self, event: &Event) {
        match event.token {
            TOKEN_WAKEUP => {
                tracing::trace!("wakeup signal");
                if let Some(cb) = self.on_wakeup.clone() {
                    (&mut *cb.borrow_mut())(self);
                }
            }
            TOKEN_SWEEP => self.sweep(),
            token => self.dispatch_io(SocketId(token), event),
        }
    }

    fn dispatch_io(&mut self, s: SocketId, event: &Event) {
        let Some(entry) = self.sockets.get(s.0) else {
            return; // stale event for an already-freed slot
        };
        if entry.closed {
            return;
        }

        if let PollKind::Listener { .. } = entry.kind {
            if event.error {
                tracing::warn!(socket = s.0, "listener poll error");
                self.close(s);
                return;
            }
            self.accept_ready(s);
            return;
        }

        if event.error || (event.hup && !event.readable) {
            tracing::trace!(socket = s.0, "peer reset");
            self.close(s);
            return;
        }

        if event.writable {
            self.writable_ready(s);
        }

        if event.readable {
            let still_reading = self
                .sockets
                .get(s.0)
                .map(|e| !e.closed && e.interest.read)
                .unwrap_or(false);
            if still_reading {
                self.read_ready(s);
            }
        }
    }

    fn writable_ready(&mut self, s: SocketId) {
        let Some(entry) = self.sockets.get(s.0) else { return };
        if entry.closed {
            return;
        }
        if entry.connecting {
            self.finish_connect(s);
            return;
        }
        if entry.shutting_down {
            // half-close was deferred behind a pending write; the kernel
            // buffer has space again, nothing more will be queued
            if !entry.shutdown_performed {
                let fd = entry.fd;
                net::shutdown_write(fd);
                let read = entry.interest.read;
                if let Some(e) = self.sockets.get_mut(s.0) {
                    e.shutdown_performed = true;
                }
                self.set_interest(s, Interest { read, write: false });
            }
            return;
        }
        if !entry.interest.write {
            return; // interest changed within this batch
        }
        if let Some(cb) = self.writable_cb(s) {
            (&mut *cb.borrow_mut())(self, s);
        }
    }

    fn finish_connect(&mut self, s: SocketId) {
        let Some(entry) = self.sockets.get(s.0) else { return };
        let fd = entry.fd;
        let read = Interest::READ;
        match net::take_socket_error(fd) {
            Ok(None) => {
                if let Some(e) = self.sockets.get_mut(s.0) {
                    e.connecting = false;
                }
                self.set_interest(s, read);
                tracing::debug!(socket = s.0, "outbound connection established");
                if let Some(cb) = self.open_cb(s) {
                    (&mut *cb.borrow_mut())(self, s, true);
                }
            }
            Ok(Some(err)) => {
                tracing::debug!(socket = s.0, error = %err, "connect failed");
                self.close(s);
            }
            Err(err) => {
                tracing::debug!(socket = s.0, error = %err, "connect failed");
                self.close(s);
            }
        }
    }

    fn read_ready(&mut self, s: SocketId) {
        let Some(entry) = self.sockets.get(s.0) else { return };
        let fd = entry.fd;
        let mut buf = self
            .recv_buf
            .take()
            .unwrap_or_else(|| vec![0u8; RECV_BUFFER_LEN]);
        match net::recv(fd, &mut buf) {
            Ok(0) => {
                self.recv_buf = Some(buf);
                tracing::trace!(socket = s.0, "peer closed");
                self.close(s);
            }
            Ok(n) => {
                let filled = n == buf.len();
                if let Some(cb) = self.data_cb(s) {
                    (&mut *cb.borrow_mut())(self, s, &buf[..n]);
                }
                self.recv_buf = Some(buf);
                if filled {
                    // more may be queued in the kernel with no new
                    // packet to re-arm an edge-triggered backend
                    let reading = self
                        .sockets
                        .get(s.0)
                        .map(|e| !e.closed && e.interest.read)
                        .unwrap_or(false);
                    if reading {
                        self.resume_ready.push(s.0);
                    }
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                self.recv_buf = Some(buf);
            }
            Err(e) => {
                self.recv_buf = Some(buf);
                tracing::trace!(socket = s.0, error = %e, "read error");
                self.close(s);
            }
        }
    }

    fn accept_ready(&mut self, s: SocketId) {
        for _ in 0..MAX_ACCEPTS_PER_EVENT {
            let (listener_fd, context, factory) = match self.sockets.get(s.0) {
                Some(e) if !e.closed => match &e.kind {
                    PollKind::Listener { accept_ext } => (e.fd, e.context, accept_ext.clone()),
                    PollKind::Stream => return,
                },
                _ => return,
            };
            match net::accept_connection(listener_fd) {
                Ok(fd) => {
                    let ext = factory();
                    match self.add_socket(fd, context, ext, Interest::READ, false, PollKind::Stream)
                    {
                        Ok(accepted) => {
                            tracing::trace!(socket = accepted.0, "accepted connection");
                            if let Some(cb) = self.open_cb(accepted) {
                                (&mut *cb.borrow_mut())(self, accepted, false);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to register accepted socket");
                            net::close_fd(fd);
                        }
                    }
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return;
                }
                Err(ref e) if e.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(ref e) if net::is_transient_accept_error(e) => {
                    // back off for this cycle, retry next turn
                    tracing::warn!(error = %e, "accept resource exhaustion");
                    self.resume_accept(s);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "listener failed");
                    self.close(s);
                    return;
                }
            }
        }
        // cap reached with the backlog still live
        self.resume_accept(s);
    }

    fn resume_accept(&mut self, s: SocketId) {
        let live = self.sockets.get(s.0).map(|e| !e.closed).unwrap_or(false);
        if live {
            self.resume_ready.push(s.0);
        }
    }

    /// Decrement every armed timeout counter by one tick and deliver
    /// `on_timeout` for the sockets that reached the threshold. The
    /// upper layer decides whether to close them.
    fn sweep(&mut self) {
        let mut due = Vec::new();
        for (key, entry) in self.sockets.iter_mut() {
            if entry.closed || entry.timeout_ticks == 0 {
                continue;
            }
            entry.timeout_ticks -= 1;
            if entry.timeout_ticks == 0 {
                due.push(SocketId(key));
            }
        }
        for s in due {
            let live = self.sockets.get(s.0).map(|e| !e.closed).unwrap_or(false);
            if !live {
                continue;
            }
            tracing::trace!(socket = s.0, "socket timed out");
            if let Some(cb) = self.timeout_cb(s) {
                (&mut *cb.borrow_mut())(self, s);
            }
        }
    }

    /// Immediate hard close: the socket is unlinked from its context and
    /// the backend now, `on_close` is delivered exactly once, and the
    /// arena entry plus descriptor are released at the next safe point.
    /// Calling it twice is a guarded no-op.
    pub fn close(&mut self, s: SocketId) {
        let Some(entry) = self.sockets.get_mut(s.0) else { return };
        if entry.closed {
            return;
        }
        entry.closed = true;
        entry.interest = Interest::NONE;
        entry.timeout_ticks = 0;
        let fd = entry.fd;
        let context = entry.context;
        let _ = self.backend.deregister(fd);
        self.live_polls -= 1;
        if let Some(ctx) = self.contexts.get_mut(context.0) {
            ctx.sockets.retain(|other| *other != s);
        }
        self.pending_close.push(s);
        tracing::debug!(socket = s.0, "socket closed");
        let cb = self.contexts.get(context.0).and_then(|c| c.on_close.clone());
        if let Some(cb) = cb {
            (&mut *cb.borrow_mut())(self, s);
        }
    }

    fn drain_pending_close(&mut self) {
        if self.pending_close.is_empty() {
            return;
        }
        for s in mem::take(&mut self.pending_close) {
            if let Some(entry) = self.sockets.try_remove(s.0) {
                net::close_fd(entry.fd);
            }
        }
    }

    pub(crate) fn add_socket(
        &mut self,
        fd: RawFd,
        context: ContextId,
        ext: Box<dyn Any>,
        interest: Interest,
        connecting: bool,
        kind: PollKind,
    ) -> io::Result<SocketId> {
        let key = self.sockets.insert(SocketEntry {
            fd,
            kind,
            interest,
            context,
            timeout_ticks: 0,
            shutting_down: false,
            shutdown_performed: false,
            closed: false,
            connecting,
            corked: false,
            ext,
        });
        if let Err(e) = self.backend.register(fd, key, interest) {
            self.sockets.remove(key);
            return Err(e);
        }
        self.live_polls += 1;
        let s = SocketId(key);
        if let Some(ctx) = self.contexts.get_mut(context.0) {
            ctx.sockets.push(s);
        }
        Ok(s)
    }

    pub(crate) fn set_interest(&mut self, s: SocketId, interest: Interest) {
        let Some(entry) = self.sockets.get_mut(s.0) else { return };
        if entry.closed {
            return;
        }
        if entry.interest == interest {
            return;
        }
        entry.interest = interest;
        let fd = entry.fd;
        if let Err(err) = self.backend.reregister(fd, s.0, interest) {
            tracing::warn!(socket = s.0, error = %err, "interest change failed");
        }
    }

    // callback lookup helpers; cloning the Rc keeps the arena borrow short
    pub(crate) fn open_cb(&self, s: SocketId) -> Option<OpenCb> {
        let ctx = self.sockets.get(s.0)?.context;
        self.contexts.get(ctx.0)?.on_open.clone()
    }

    pub(crate) fn data_cb(&self, s: SocketId) -> Option<DataCb> {
        let ctx = self.sockets.get(s.0)?.context;
        self.contexts.get(ctx.0)?.on_data.clone()
    }

    pub(crate) fn writable_cb(&self, s: SocketId) -> Option<SocketCb> {
        let ctx = self.sockets.get(s.0)?.context;
        self.contexts.get(ctx.0)?.on_writable.clone()
    }

    pub(crate) fn timeout_cb(&self, s: SocketId) -> Option<SocketCb> {
        let ctx = self.sockets.get(s.0)?.context;
        self.contexts.get(ctx.0)?.on_timeout.clone()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for (_, entry) in self.sockets.iter() {
            net::close_fd(entry.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_starts_idle() {
        let mut lp = EventLoop::new().unwrap();
        // no polls registered: run returns immediately
        lp.run().unwrap();
        let n = lp.poll_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn close_is_idempotent_on_stale_handle() {
        let mut lp = EventLoop::new().unwrap();
        lp.close(SocketId(42));
        lp.close(SocketId(42));
    }
}
