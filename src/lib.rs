//! Single-threaded asynchronous socket engine with pluggable event
//! backends.
//!
//! One [`EventLoop`] drives everything: a raw epoll backend on Linux and
//! a portable mio backend everywhere (selectable at runtime), slab
//! arenas of sockets and contexts addressed by stable handles, and
//! context-level callbacks for the socket lifecycle. Sockets closed from
//! inside a callback are unlinked at once but released only at the end
//! of the dispatch batch, so handles never dangle mid-event. A coarse
//! sweep timer drives per-socket timeouts, and [`tls`] layers a rustls
//! record shim over the same plain data path.

mod backend;
mod context;
mod error;
mod event_loop;
mod net;
mod socket;
pub mod tls;

pub use backend::{BackendKind, Interest, LoopWaker};
pub use error::{Error, Result};
pub use event_loop::{
    ContextId, EventLoop, LoopOptions, SocketId, DEFAULT_SWEEP_GRANULARITY,
};
pub use net::ListenOptions;
pub use tls::{TlsContext, TlsContextOptions};
