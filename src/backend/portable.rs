//! Portable backend over mio's poll abstraction.
//!
//! The sweep timer has no descriptor here; the wait timeout is clamped to
//! the next sweep deadline and a synthetic sweep event is emitted once the
//! deadline passes. Everything else maps one to one onto `mio::Poll`.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token, Waker};

use super::{Event, EventBackend, Interest, LoopWaker, TOKEN_SWEEP, TOKEN_WAKEUP};

const MAX_EVENTS: usize = 1024;

pub(crate) struct PortableBackend {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    sweep_period: Option<Duration>,
    next_sweep: Option<Instant>,
}

fn mio_interest(interest: Interest) -> mio::Interest {
    match (interest.read, interest.write) {
        (true, false) => mio::Interest::READABLE,
        (false, true) => mio::Interest::WRITABLE,
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (false, false) => {
            // mio cannot express an empty set; the loop deregisters
            // instead of registering nothing
            debug_assert!(false, "empty interest has no mio mapping");
            mio::Interest::READABLE
        }
    }
}

impl PortableBackend {
    pub(crate) fn new() -> io::Result<PortableBackend> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(TOKEN_WAKEUP))?);
        Ok(PortableBackend {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            waker,
            sweep_period: None,
            next_sweep: None,
        })
    }

    fn emit_due_sweep(&mut self, out: &mut Vec<Event>) {
        let (Some(period), Some(next)) = (self.sweep_period, self.next_sweep) else {
            return;
        };
        let now = Instant::now();
        if now < next {
            return;
        }
        out.push(Event::internal(TOKEN_SWEEP));
        let mut upcoming = next + period;
        while upcoming <= now {
            upcoming += period;
        }
        self.next_sweep = Some(upcoming);
    }
}

impl EventBackend for PortableBackend {
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), mio_interest(interest))
    }

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token), mio_interest(interest))
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn arm_sweep(&mut self, period: Duration) -> io::Result<()> {
        self.sweep_period = Some(period);
        self.next_sweep = Some(Instant::now() + period);
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let until_sweep = self
            .next_sweep
            .map(|next| next.saturating_duration_since(Instant::now()));
        let effective = match (timeout, until_sweep) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        match self.poll.poll(&mut self.events, effective) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let token = event.token().0;
            if token == TOKEN_WAKEUP {
                out.push(Event::internal(TOKEN_WAKEUP));
            } else {
                out.push(Event {
                    token,
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    error: event.is_error(),
                    hup: event.is_read_closed() || event.is_write_closed(),
                });
            }
        }
        self.emit_due_sweep(out);
        Ok(())
    }

    fn waker(&self) -> io::Result<LoopWaker> {
        Ok(LoopWaker::mio(self.waker.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "empty interest")]
    fn empty_interest_is_rejected() {
        mio_interest(Interest::NONE);
    }

    #[test]
    fn wakeup_round_trip() {
        let mut backend = PortableBackend::new().unwrap();
        let waker = backend.waker().unwrap();
        waker.wake().unwrap();

        let mut events = Vec::new();
        backend.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
        assert!(events.iter().any(|e| e.token == TOKEN_WAKEUP));
    }

    #[test]
    fn sweep_deadline_fires_without_io() {
        let mut backend = PortableBackend::new().unwrap();
        backend.arm_sweep(Duration::from_millis(20)).unwrap();

        let mut events = Vec::new();
        backend.wait(&mut events, Some(Duration::from_millis(500))).unwrap();
        assert!(events.iter().any(|e| e.token == TOKEN_SWEEP));
    }
}
