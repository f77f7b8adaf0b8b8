//! Event backend abstraction.
//!
//! The loop drives exactly one backend: the readiness backend (`epoll`,
//! Linux only) or the portable backend (`mio`). Both expose the same
//! contract through [`EventBackend`]: register/reregister/deregister a
//! descriptor under a token, block in `wait` filling a flat event list,
//! keep a periodic sweep tick, and hand out a cross-thread [`LoopWaker`].
//! [`FusionBackend`] is the runtime selection over the two.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub(crate) mod epoll;
pub(crate) mod portable;

#[cfg(target_os = "linux")]
use epoll::EpollBackend;
use portable::PortableBackend;

/// Token reserved for the cross-thread wakeup descriptor.
pub(crate) const TOKEN_WAKEUP: usize = usize::MAX;
/// Token reserved for the sweep timer.
pub(crate) const TOKEN_SWEEP: usize = usize::MAX - 1;

/// Which readiness events a registration asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { read: false, write: false };
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };

    pub fn with_write(self, write: bool) -> Interest {
        Interest { read: self.read, write }
    }
}

/// One readiness event as returned by a backend `wait` call.
///
/// Reserved tokens ([`TOKEN_WAKEUP`], [`TOKEN_SWEEP`]) mark the loop's
/// internal fallthrough polls; every other token is a socket arena key.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Event {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

impl Event {
    pub(crate) fn internal(token: usize) -> Event {
        Event { token, readable: true, writable: false, error: false, hup: false }
    }
}

pub(crate) trait EventBackend {
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;
    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Arm the periodic sweep tick. Replaces any previous period.
    fn arm_sweep(&mut self, period: Duration) -> io::Result<()>;

    /// Block until readiness, a wakeup, the sweep tick or `timeout`,
    /// appending the drained events to `out` in kernel order.
    fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;

    fn waker(&self) -> io::Result<LoopWaker>;
}

/// Backend selected when creating a loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Linux epoll with eventfd wakeup and timerfd sweep.
    #[cfg(target_os = "linux")]
    Epoll,
    /// mio poll, works everywhere mio does.
    Portable,
}

impl Default for BackendKind {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        return BackendKind::Epoll;
        #[cfg(not(target_os = "linux"))]
        return BackendKind::Portable;
    }
}

/// Runtime fusion of the two backends behind one dispatch surface.
pub(crate) enum FusionBackend {
    #[cfg(target_os = "linux")]
    Epoll(EpollBackend),
    Portable(PortableBackend),
}

impl FusionBackend {
    pub(crate) fn new(kind: BackendKind) -> io::Result<FusionBackend> {
        match kind {
            #[cfg(target_os = "linux")]
            BackendKind::Epoll => Ok(FusionBackend::Epoll(EpollBackend::new()?)),
            BackendKind::Portable => Ok(FusionBackend::Portable(PortableBackend::new()?)),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            #[cfg(target_os = "linux")]
            FusionBackend::Epoll($inner) => $body,
            FusionBackend::Portable($inner) => $body,
        }
    };
}

impl EventBackend for FusionBackend {
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        delegate!(self, b => b.register(fd, token, interest))
    }

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        delegate!(self, b => b.reregister(fd, token, interest))
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        delegate!(self, b => b.deregister(fd))
    }

    fn arm_sweep(&mut self, period: Duration) -> io::Result<()> {
        delegate!(self, b => b.arm_sweep(period))
    }

    fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        delegate!(self, b => b.wait(out, timeout))
    }

    fn waker(&self) -> io::Result<LoopWaker> {
        delegate!(self, b => b.waker())
    }
}

/// Cross-thread wakeup handle, the only piece of the engine that may be
/// touched from outside the loop thread.
#[derive(Clone)]
pub struct LoopWaker {
    inner: WakerInner,
}

#[derive(Clone)]
enum WakerInner {
    #[cfg(target_os = "linux")]
    Eventfd(std::sync::Arc<std::os::fd::OwnedFd>),
    Mio(std::sync::Arc<mio::Waker>),
}

impl LoopWaker {
    #[cfg(target_os = "linux")]
    pub(crate) fn eventfd(fd: std::sync::Arc<std::os::fd::OwnedFd>) -> LoopWaker {
        LoopWaker { inner: WakerInner::Eventfd(fd) }
    }

    pub(crate) fn mio(waker: std::sync::Arc<mio::Waker>) -> LoopWaker {
        LoopWaker { inner: WakerInner::Mio(waker) }
    }

    /// Signal the loop to wake from its blocking wait and run the wakeup
    /// callback. Safe to call from any thread, any number of times;
    /// signals coalesce.
    pub fn wake(&self) -> io::Result<()> {
        match &self.inner {
            #[cfg(target_os = "linux")]
            WakerInner::Eventfd(fd) => {
                use std::os::fd::AsRawFd;
                let one: u64 = 1;
                let r = unsafe {
                    libc::write(fd.as_raw_fd(), &one as *const u64 as *const libc::c_void, 8)
                };
                if r == 8 {
                    Ok(())
                } else {
                    let err = io::Error::last_os_error();
                    // a full counter still wakes the loop
                    if err.kind() == io::ErrorKind::WouldBlock {
                        Ok(())
                    } else {
                        Err(err)
                    }
                }
            }
            WakerInner::Mio(w) => w.wake(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_flags() {
        assert_eq!(Interest::READ.with_write(true), Interest { read: true, write: true });
        assert_eq!(Interest::READ.with_write(false), Interest::READ);
        assert_eq!(Interest::NONE, Interest::default());
    }

    #[test]
    fn default_backend_is_constructible() {
        let backend = FusionBackend::new(BackendKind::default());
        assert!(backend.is_ok());
    }
}
