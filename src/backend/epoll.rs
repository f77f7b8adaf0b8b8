//! Readiness backend: raw epoll with eventfd wakeup and timerfd sweep.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use super::{Event, EventBackend, Interest, LoopWaker, TOKEN_SWEEP, TOKEN_WAKEUP};

const MAX_EVENTS: usize = 1024;

pub(crate) struct EpollBackend {
    epfd: OwnedFd,
    wake_fd: Arc<OwnedFd>,
    timer_fd: Option<OwnedFd>,
    ready: Vec<libc::epoll_event>,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn interest_mask(interest: Interest) -> u32 {
    let mut mask = 0;
    if interest.read {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.write {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, mask: u32, token: usize) -> io::Result<()> {
    let mut event = libc::epoll_event { events: mask, u64: token as u64 };
    cvt(unsafe { libc::epoll_ctl(epfd, op, fd, &mut event) })?;
    Ok(())
}

/// Reads the 8-byte counter of an eventfd or timerfd. One read consumes
/// the whole pending count, so a drained descriptor never re-triggers a
/// level-triggered wait.
fn drain_counter(fd: RawFd) -> u64 {
    let mut value: u64 = 0;
    let r = unsafe { libc::read(fd, &mut value as *mut u64 as *mut libc::c_void, 8) };
    if r == 8 {
        value
    } else {
        0
    }
}

impl EpollBackend {
    pub(crate) fn new() -> io::Result<EpollBackend> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };

        let wake = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        let wake_fd = Arc::new(unsafe { OwnedFd::from_raw_fd(wake) });
        epoll_ctl(
            epfd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            wake_fd.as_raw_fd(),
            libc::EPOLLIN as u32,
            TOKEN_WAKEUP,
        )?;

        Ok(EpollBackend {
            epfd,
            wake_fd,
            timer_fd: None,
            ready: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }
}

impl EventBackend for EpollBackend {
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, interest_mask(interest), token)
    }

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, interest_mask(interest), token)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let mut unused = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut unused) })?;
        Ok(())
    }

    fn arm_sweep(&mut self, period: Duration) -> io::Result<()> {
        let fd = match &self.timer_fd {
            Some(fd) => fd.as_raw_fd(),
            None => {
                let raw = cvt(unsafe {
                    libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
                })?;
                let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                epoll_ctl(
                    self.epfd.as_raw_fd(),
                    libc::EPOLL_CTL_ADD,
                    raw,
                    libc::EPOLLIN as u32,
                    TOKEN_SWEEP,
                )?;
                self.timer_fd = Some(owned);
                raw
            }
        };

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: period.as_secs() as libc::time_t,
                tv_nsec: period.subsec_nanos() as libc::c_long,
            },
            it_value: libc::timespec {
                tv_sec: period.as_secs() as libc::time_t,
                tv_nsec: period.subsec_nanos() as libc::c_long,
            },
        };
        cvt(unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) })?;
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.ready.as_mut_ptr(),
                self.ready.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for i in 0..n as usize {
            let raw = self.ready[i];
            let mask = raw.events;
            let token = raw.u64 as usize;
            match token {
                TOKEN_WAKEUP => {
                    drain_counter(self.wake_fd.as_raw_fd());
                    out.push(Event::internal(TOKEN_WAKEUP));
                }
                TOKEN_SWEEP => {
                    if let Some(fd) = &self.timer_fd {
                        drain_counter(fd.as_raw_fd());
                    }
                    out.push(Event::internal(TOKEN_SWEEP));
                }
                token => out.push(Event {
                    token,
                    readable: mask & libc::EPOLLIN as u32 != 0,
                    writable: mask & libc::EPOLLOUT as u32 != 0,
                    error: mask & libc::EPOLLERR as u32 != 0,
                    hup: mask & libc::EPOLLHUP as u32 != 0,
                }),
            }
        }
        Ok(())
    }

    fn waker(&self) -> io::Result<LoopWaker> {
        Ok(LoopWaker::eventfd(self.wake_fd.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_drains_coalesced_signals() {
        let mut backend = EpollBackend::new().unwrap();
        let waker = backend.waker().unwrap();
        waker.wake().unwrap();
        waker.wake().unwrap();
        waker.wake().unwrap();

        let mut events = Vec::new();
        backend.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
        let wakeups = events.iter().filter(|e| e.token == TOKEN_WAKEUP).count();
        assert_eq!(wakeups, 1);

        // counter was consumed in full, nothing re-triggers
        events.clear();
        backend.wait(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn sweep_timer_ticks() {
        let mut backend = EpollBackend::new().unwrap();
        backend.arm_sweep(Duration::from_millis(20)).unwrap();

        let mut events = Vec::new();
        backend.wait(&mut events, Some(Duration::from_millis(500))).unwrap();
        assert!(events.iter().any(|e| e.token == TOKEN_SWEEP));
    }
}
