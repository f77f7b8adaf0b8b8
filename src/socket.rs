//! Per-socket operations: write, cork/flush, timeout, half-close and
//! user-data access. Hard close lives with the loop (`EventLoop::close`)
//! because it interacts with the dispatch safe point.

use std::any::Any;
use std::io;

use crate::backend::Interest;
use crate::event_loop::{EventLoop, SocketId};
use crate::net;

impl EventLoop {
    /// Attempt an immediate non-blocking write of up to `data.len()`
    /// bytes and return how many were accepted. A short write arms
    /// write-readiness polling: `on_writable` fires once when the kernel
    /// reports the socket writable again, and the caller resends the
    /// remainder — the engine never buffers unsent bytes. `more` hints
    /// that further data is imminent (cork); a later [`flush`] or a
    /// write without the hint pushes corked data out.
    ///
    /// [`flush`]: EventLoop::flush
    pub fn write(&mut self, s: SocketId, data: &[u8], more: bool) -> usize {
        let (fd, read_interest, write_interest) = match self.sockets.get(s.0) {
            Some(e) if !e.closed && !e.shutting_down => (e.fd, e.interest.read, e.interest.write),
            _ => return 0,
        };
        if data.is_empty() {
            return 0;
        }
        match net::send(fd, data, more) {
            Ok(n) => {
                if let Some(e) = self.sockets.get_mut(s.0) {
                    e.corked = more && n == data.len();
                }
                if n < data.len() {
                    if !write_interest {
                        self.set_interest(s, Interest { read: read_interest, write: true });
                    }
                } else if write_interest {
                    self.set_interest(s, Interest { read: read_interest, write: false });
                }
                n
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                if !write_interest {
                    self.set_interest(s, Interest { read: read_interest, write: true });
                }
                0
            }
            Err(e) => {
                tracing::trace!(socket = s.0, error = %e, "write error");
                self.close(s);
                0
            }
        }
    }

    /// Withdraw the cork hint and push out anything held back by it.
    /// A no-op when nothing is corked.
    pub fn flush(&mut self, s: SocketId) {
        let fd = match self.sockets.get_mut(s.0) {
            Some(e) if !e.closed && e.corked => {
                e.corked = false;
                e.fd
            }
            _ => return,
        };
        net::flush_cork(fd);
    }

    /// Initiate half-close. No further writes are accepted; if a partial
    /// write is still pending (write-readiness armed) the transport-level
    /// shutdown is deferred until it drains. Idempotent.
    pub fn shutdown(&mut self, s: SocketId) {
        let Some(entry) = self.sockets.get_mut(s.0) else { return };
        if entry.closed || entry.shutting_down {
            return;
        }
        entry.shutting_down = true;
        if !entry.interest.write {
            entry.shutdown_performed = true;
            let fd = entry.fd;
            net::shutdown_write(fd);
        }
        tracing::debug!(socket = s.0, "shutting down");
    }

    pub fn is_shutting_down(&self, s: SocketId) -> bool {
        self.sockets
            .get(s.0)
            .map(|e| e.shutting_down)
            .unwrap_or(false)
    }

    pub fn is_closed(&self, s: SocketId) -> bool {
        self.sockets.get(s.0).map(|e| e.closed).unwrap_or(true)
    }

    /// Arm (or replace — a socket has one timer) the coarse timeout,
    /// counted in sweep ticks. `on_timeout` fires no earlier than
    /// `seconds` after this call; zero disarms.
    pub fn timeout(&mut self, s: SocketId, seconds: u32) {
        let ticks = ticks_for(seconds, self.granularity().as_secs());
        if let Some(e) = self.sockets.get_mut(s.0) {
            if !e.closed {
                e.timeout_ticks = ticks;
            }
        }
    }

    /// Borrow the socket's user-data extension, downcast to `T`.
    pub fn ext_mut<T: 'static>(&mut self, s: SocketId) -> Option<&mut T> {
        self.sockets.get_mut(s.0)?.ext.downcast_mut::<T>()
    }

    /// Replace the socket's user-data extension, returning the old one.
    pub fn replace_ext(&mut self, s: SocketId, ext: Box<dyn Any>) -> Option<Box<dyn Any>> {
        let entry = self.sockets.get_mut(s.0)?;
        Some(std::mem::replace(&mut entry.ext, ext))
    }
}

/// Timeout seconds to sweep ticks. The extra tick guarantees the
/// callback never fires before the threshold, even when the first sweep
/// lands immediately after arming.
fn ticks_for(seconds: u32, granularity_secs: u64) -> u16 {
    if seconds == 0 {
        return 0;
    }
    let g = granularity_secs.max(1);
    let ticks = (u64::from(seconds) + g - 1) / g + 1;
    ticks.min(u64::from(u16::MAX)) as u16
}
