//! Socket contexts: shared callback sets and the listen/connect/link
//! entry points.
//!
//! A context is the unit of shared behavior: many sockets, one set of
//! lifecycle callbacks. Exactly one callback of each kind is active per
//! context; setting a new one replaces the old (last setter wins).

use std::any::Any;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::backend::Interest;
use crate::error::Result;
use crate::event_loop::{ContextEntry, ContextId, EventLoop, PollKind, SocketId};
use crate::net::{self, ListenOptions};

impl EventLoop {
    /// Create a socket context owning `ext` as its user-data extension.
    pub fn create_context<T: Any>(&mut self, ext: T) -> ContextId {
        let key = self.contexts.insert(ContextEntry {
            ext: Some(Box::new(ext)),
            ..ContextEntry::default()
        });
        ContextId(key)
    }

    /// Borrow the context's user-data extension, downcast to `T`.
    pub fn context_ext_mut<T: 'static>(&mut self, ctx: ContextId) -> Option<&mut T> {
        self.contexts
            .get_mut(ctx.0)?
            .ext
            .as_mut()?
            .downcast_mut::<T>()
    }

    /// `on_open(loop, socket, is_client)` fires once per socket: for
    /// accepted sockets with `is_client = false`, for established
    /// outbound connections with `is_client = true`.
    pub fn on_open(
        &mut self,
        ctx: ContextId,
        f: impl FnMut(&mut EventLoop, SocketId, bool) + 'static,
    ) {
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.on_open = Some(Rc::new(RefCell::new(f)));
        }
    }

    /// `on_data(loop, socket, bytes)`; the byte slice borrows the loop's
    /// shared receive buffer and is only valid for the callback's
    /// duration — copy to retain.
    pub fn on_data(
        &mut self,
        ctx: ContextId,
        f: impl FnMut(&mut EventLoop, SocketId, &[u8]) + 'static,
    ) {
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.on_data = Some(Rc::new(RefCell::new(f)));
        }
    }

    /// Fires when a socket that previously took a short write becomes
    /// writable again. The caller tracks and resends the remainder.
    pub fn on_writable(&mut self, ctx: ContextId, f: impl FnMut(&mut EventLoop, SocketId) + 'static) {
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.on_writable = Some(Rc::new(RefCell::new(f)));
        }
    }

    /// Fires exactly once per socket, whether closed by the application
    /// or by the engine on a fatal condition.
    pub fn on_close(&mut self, ctx: ContextId, f: impl FnMut(&mut EventLoop, SocketId) + 'static) {
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.on_close = Some(Rc::new(RefCell::new(f)));
        }
    }

    /// Fires when a socket's timeout counter reaches its threshold. The
    /// socket is not closed; that decision stays with the upper layer.
    pub fn on_timeout(&mut self, ctx: ContextId, f: impl FnMut(&mut EventLoop, SocketId) + 'static) {
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.on_timeout = Some(Rc::new(RefCell::new(f)));
        }
    }

    /// Start listening. Each accepted socket joins `ctx` with a fresh
    /// extension from `socket_ext`, and `on_open(_, _, false)` fires.
    pub fn listen(
        &mut self,
        ctx: ContextId,
        host: Option<&str>,
        port: u16,
        options: ListenOptions,
        socket_ext: impl Fn() -> Box<dyn Any> + 'static,
    ) -> Result<SocketId> {
        let fd = net::create_listen_socket(host, port, options)?;
        let kind = PollKind::Listener {
            accept_ext: Rc::new(socket_ext),
        };
        let s = match self.add_socket(fd, ctx, Box::new(()), Interest::READ, false, kind) {
            Ok(s) => s,
            Err(e) => {
                net::close_fd(fd);
                return Err(e.into());
            }
        };
        tracing::debug!(socket = s.0, port, "listening");
        Ok(s)
    }

    /// Begin a non-blocking outbound connection. Completion is reported
    /// through `on_open(_, _, true)`; failure through a single
    /// `on_close` with no preceding `on_open`.
    pub fn connect(
        &mut self,
        ctx: ContextId,
        host: &str,
        port: u16,
        socket_ext: impl Any,
    ) -> Result<SocketId> {
        let fd = net::connect_to_host(host, port)?;
        let s = match self.add_socket(
            fd,
            ctx,
            Box::new(socket_ext),
            Interest::WRITE,
            true,
            PollKind::Stream,
        ) {
            Ok(s) => s,
            Err(e) => {
                net::close_fd(fd);
                return Err(e.into());
            }
        };
        tracing::debug!(socket = s.0, host, port, "connecting");
        Ok(s)
    }

    /// Move a live socket into `ctx`. Subsequent events use the new
    /// context's callbacks; used for in-place protocol upgrades.
    pub fn link(&mut self, ctx: ContextId, s: SocketId) {
        let Some(entry) = self.sockets.get(s.0) else { return };
        if entry.closed {
            return;
        }
        let old = entry.context;
        if old == ctx {
            return;
        }
        if let Some(previous) = self.contexts.get_mut(old.0) {
            previous.sockets.retain(|other| *other != s);
        }
        if let Some(next) = self.contexts.get_mut(ctx.0) {
            next.sockets.push(s);
        }
        if let Some(entry) = self.sockets.get_mut(s.0) {
            entry.context = ctx;
        }
    }

    /// The context a socket currently belongs to.
    pub fn context_of(&self, s: SocketId) -> Option<ContextId> {
        let entry = self.sockets.get(s.0)?;
        if entry.closed {
            None
        } else {
            Some(entry.context)
        }
    }

    /// Raw descriptor behind a socket handle.
    pub fn socket_fd(&self, s: SocketId) -> Option<RawFd> {
        self.sockets.get(s.0).map(|e| e.fd)
    }

    /// Bound port of a listening (or any) socket; pairs with port-0 binds.
    pub fn local_port(&self, s: SocketId) -> Result<u16> {
        let entry = self
            .sockets
            .get(s.0)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such socket"))?;
        Ok(net::local_port(entry.fd)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_callback_setter_wins() {
        let mut lp = EventLoop::new().unwrap();
        let ctx = lp.create_context(());
        lp.on_data(ctx, |_, _, _| panic!("replaced callback must not fire"));
        lp.on_data(ctx, |_, _, _| {});
        // only the second closure is retained
        assert!(lp.contexts.get(ctx.0).unwrap().on_data.is_some());
    }

    #[test]
    fn context_ext_downcast() {
        let mut lp = EventLoop::new().unwrap();
        let ctx = lp.create_context(7u32);
        assert_eq!(lp.context_ext_mut::<u32>(ctx), Some(&mut 7));
        assert!(lp.context_ext_mut::<String>(ctx).is_none());
    }

    #[test]
    fn listen_on_ephemeral_port() {
        let mut lp = EventLoop::new().unwrap();
        let ctx = lp.create_context(());
        let listener = lp
            .listen(ctx, Some("127.0.0.1"), 0, ListenOptions::default(), || Box::new(()))
            .unwrap();
        assert_ne!(lp.local_port(listener).unwrap(), 0);
        lp.close(listener);
    }
}
