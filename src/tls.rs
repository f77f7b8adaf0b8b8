//! TLS contexts: a record-layer shim over the plain socket engine.
//!
//! A TLS context wraps a plain context and installs its own lifecycle
//! callbacks on it. Ciphertext moves through the plain data path; each
//! socket carries a `rustls::Connection` that is pumped on every event.
//! Application callbacks see only plaintext, and `on_open` is deferred
//! until the handshake completes.

use std::any::Any;
use std::cell::RefCell;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::mem;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::{Error, Result};
use crate::event_loop::{ContextId, DataCb, EventLoop, OpenCb, SocketCb, SocketId};
use crate::net::ListenOptions;

/// Certificate material for a TLS context. A context with `cert_file`
/// and `key_file` can accept; one with `ca_file` can connect.
#[derive(Clone, Debug, Default)]
pub struct TlsContextOptions {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Encrypted private keys are not supported; a passphrase is
    /// rejected up front rather than failing deep inside the handshake.
    pub passphrase: Option<String>,
    pub ca_file: Option<PathBuf>,
}

struct TlsContextExt {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
    on_open: Option<OpenCb>,
    on_data: Option<DataCb>,
    on_writable: Option<SocketCb>,
    on_close: Option<SocketCb>,
    on_timeout: Option<SocketCb>,
}

struct TlsSocketExt {
    conn: Option<Connection>,
    handshake_done: bool,
    is_client: bool,
    server_name: Option<ServerName<'static>>,
    /// Ciphertext accepted from rustls but not yet taken by the kernel.
    out_pending: Vec<u8>,
    user: Box<dyn Any>,
}

/// Handle to a TLS-wrapped socket context.
#[derive(Clone, Copy, Debug)]
pub struct TlsContext {
    ctx: ContextId,
}

impl TlsContext {
    /// Create a TLS context over a fresh plain context. Certificate
    /// material is loaded and validated eagerly.
    pub fn create(lp: &mut EventLoop, options: TlsContextOptions) -> Result<TlsContext> {
        let server = build_server_config(&options)?;
        let client = build_client_config(&options)?;
        let ctx = lp.create_context(TlsContextExt {
            server,
            client,
            on_open: None,
            on_data: None,
            on_writable: None,
            on_close: None,
            on_timeout: None,
        });
        install_shim(lp, ctx);
        Ok(TlsContext { ctx })
    }

    /// The underlying plain context handle.
    pub fn context(&self) -> ContextId {
        self.ctx
    }

    /// Fires once the handshake has completed, not on TCP establishment.
    pub fn on_open(
        &self,
        lp: &mut EventLoop,
        f: impl FnMut(&mut EventLoop, SocketId, bool) + 'static,
    ) {
        if let Some(ext) = lp.context_ext_mut::<TlsContextExt>(self.ctx) {
            ext.on_open = Some(Rc::new(RefCell::new(f)));
        }
    }

    /// Fires with decrypted plaintext; the slice is only valid for the
    /// callback's duration.
    pub fn on_data(
        &self,
        lp: &mut EventLoop,
        f: impl FnMut(&mut EventLoop, SocketId, &[u8]) + 'static,
    ) {
        if let Some(ext) = lp.context_ext_mut::<TlsContextExt>(self.ctx) {
            ext.on_data = Some(Rc::new(RefCell::new(f)));
        }
    }

    pub fn on_writable(&self, lp: &mut EventLoop, f: impl FnMut(&mut EventLoop, SocketId) + 'static) {
        if let Some(ext) = lp.context_ext_mut::<TlsContextExt>(self.ctx) {
            ext.on_writable = Some(Rc::new(RefCell::new(f)));
        }
    }

    pub fn on_close(&self, lp: &mut EventLoop, f: impl FnMut(&mut EventLoop, SocketId) + 'static) {
        if let Some(ext) = lp.context_ext_mut::<TlsContextExt>(self.ctx) {
            ext.on_close = Some(Rc::new(RefCell::new(f)));
        }
    }

    pub fn on_timeout(&self, lp: &mut EventLoop, f: impl FnMut(&mut EventLoop, SocketId) + 'static) {
        if let Some(ext) = lp.context_ext_mut::<TlsContextExt>(self.ctx) {
            ext.on_timeout = Some(Rc::new(RefCell::new(f)));
        }
    }

    /// Start a TLS listener. Requires `cert_file` and `key_file`.
    pub fn listen(
        &self,
        lp: &mut EventLoop,
        host: Option<&str>,
        port: u16,
        options: ListenOptions,
        socket_ext: impl Fn() -> Box<dyn Any> + 'static,
    ) -> Result<SocketId> {
        let has_server = lp
            .context_ext_mut::<TlsContextExt>(self.ctx)
            .map(|e| e.server.is_some())
            .unwrap_or(false);
        if !has_server {
            return Err(Error::InvalidCertificate);
        }
        lp.listen(self.ctx, host, port, options, move || {
            Box::new(TlsSocketExt {
                conn: None,
                handshake_done: false,
                is_client: false,
                server_name: None,
                out_pending: Vec::new(),
                user: socket_ext(),
            })
        })
    }

    /// Begin a TLS client connection; `server_name` is what the peer's
    /// certificate is verified against. Requires `ca_file`.
    pub fn connect(
        &self,
        lp: &mut EventLoop,
        host: &str,
        port: u16,
        server_name: &str,
        socket_ext: impl Any,
    ) -> Result<SocketId> {
        let has_client = lp
            .context_ext_mut::<TlsContextExt>(self.ctx)
            .map(|e| e.client.is_some())
            .unwrap_or(false);
        if !has_client {
            return Err(Error::MissingClientCa);
        }
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| Error::InvalidServerName(server_name.to_owned()))?;
        lp.connect(
            self.ctx,
            host,
            port,
            TlsSocketExt {
                conn: None,
                handshake_done: false,
                is_client: true,
                server_name: Some(name),
                out_pending: Vec::new(),
                user: Box::new(socket_ext),
            },
        )
    }

    /// Queue plaintext for encryption and push as much ciphertext as the
    /// kernel will take. Returns `data.len()` once queued; rustls holds
    /// plaintext written before the handshake completes.
    pub fn write(&self, lp: &mut EventLoop, s: SocketId, data: &[u8]) -> usize {
        if lp.is_closed(s) || lp.is_shutting_down(s) {
            return 0;
        }
        let queued = match lp.ext_mut::<TlsSocketExt>(s) {
            Some(ext) => match ext.conn.as_mut() {
                Some(conn) => conn.writer().write_all(data).is_ok(),
                None => false,
            },
            None => false,
        };
        if !queued {
            return 0;
        }
        pump(lp, self.ctx, s, &[]);
        data.len()
    }

    /// Send `close_notify` and half-close the transport underneath.
    pub fn shutdown(&self, lp: &mut EventLoop, s: SocketId) {
        if let Some(ext) = lp.ext_mut::<TlsSocketExt>(s) {
            if let Some(conn) = ext.conn.as_mut() {
                conn.send_close_notify();
            }
        }
        pump(lp, self.ctx, s, &[]);
        lp.shutdown(s);
    }

    /// Borrow the socket's user-data extension, downcast to `T`.
    pub fn ext_mut<'a, T: 'static>(&self, lp: &'a mut EventLoop, s: SocketId) -> Option<&'a mut T> {
        lp.ext_mut::<TlsSocketExt>(s)?.user.downcast_mut::<T>()
    }
}

/// Wire the shim callbacks into the plain context. Transport events come
/// in here; application callbacks are looked up in the context extension
/// and fired with plaintext.
fn install_shim(lp: &mut EventLoop, ctx: ContextId) {
    lp.on_open(ctx, move |lp, s, is_client| {
        if !attach_connection(lp, ctx, s, is_client) {
            lp.close(s);
            return;
        }
        // a client connection wants to send its hello immediately
        pump(lp, ctx, s, &[]);
    });

    lp.on_data(ctx, move |lp, s, data| {
        pump(lp, ctx, s, data);
    });

    lp.on_writable(ctx, move |lp, s| {
        flush_ciphertext(lp, s, Vec::new());
        pump(lp, ctx, s, &[]);
        let drained = lp
            .ext_mut::<TlsSocketExt>(s)
            .map(|e| e.handshake_done && e.out_pending.is_empty())
            .unwrap_or(false);
        if drained {
            if let Some(cb) = ctx_socket_cb(lp, ctx, CbKind::Writable) {
                (&mut *cb.borrow_mut())(lp, s);
            }
        }
    });

    lp.on_close(ctx, move |lp, s| {
        if let Some(cb) = ctx_socket_cb(lp, ctx, CbKind::Close) {
            (&mut *cb.borrow_mut())(lp, s);
        }
    });

    lp.on_timeout(ctx, move |lp, s| {
        if let Some(cb) = ctx_socket_cb(lp, ctx, CbKind::Timeout) {
            (&mut *cb.borrow_mut())(lp, s);
        }
    });
}

/// Build the per-socket `rustls::Connection` once the transport is up.
fn attach_connection(lp: &mut EventLoop, ctx: ContextId, s: SocketId, is_client: bool) -> bool {
    let (server, client) = match lp.context_ext_mut::<TlsContextExt>(ctx) {
        Some(ext) => (ext.server.clone(), ext.client.clone()),
        None => return false,
    };
    let Some(ext) = lp.ext_mut::<TlsSocketExt>(s) else {
        return false;
    };
    let conn = if is_client {
        let (Some(config), Some(name)) = (client, ext.server_name.take()) else {
            return false;
        };
        match ClientConnection::new(config, name) {
            Ok(conn) => Connection::Client(conn),
            Err(err) => {
                tracing::warn!(socket = s.0, error = %err, "client session setup failed");
                return false;
            }
        }
    } else {
        let Some(config) = server else { return false };
        match ServerConnection::new(config) {
            Ok(conn) => Connection::Server(conn),
            Err(err) => {
                tracing::warn!(socket = s.0, error = %err, "server session setup failed");
                return false;
            }
        }
    };
    ext.conn = Some(conn);
    true
}

/// One pass through the record layer: feed `input` ciphertext, drain
/// decrypted plaintext, collect outbound records, then deliver the
/// results. Split in two phases so the session borrow ends before any
/// loop method or application callback runs.
fn pump(lp: &mut EventLoop, ctx: ContextId, s: SocketId, input: &[u8]) {
    let (fatal, just_open, is_client, peer_closed, plaintext, ciphertext) = {
        let Some(ext) = lp.ext_mut::<TlsSocketExt>(s) else { return };
        let Some(conn) = ext.conn.as_mut() else { return };

        let mut fatal = false;
        let mut peer_closed = false;
        let mut plaintext = Vec::new();
        let mut remaining = input;
        while !remaining.is_empty() {
            match conn.read_tls(&mut remaining) {
                Ok(0) => {
                    fatal = true;
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::trace!(socket = s.0, error = %err, "record intake failed");
                    fatal = true;
                    break;
                }
            }
            match conn.process_new_packets() {
                Ok(state) => {
                    let n = state.plaintext_bytes_to_read();
                    if n > 0 {
                        let start = plaintext.len();
                        plaintext.resize(start + n, 0);
                        if conn.reader().read_exact(&mut plaintext[start..]).is_err() {
                            fatal = true;
                            break;
                        }
                    }
                    if state.peer_has_closed() {
                        peer_closed = true;
                    }
                }
                Err(err) => {
                    tracing::trace!(socket = s.0, error = %err, "tls protocol error");
                    fatal = true;
                    break;
                }
            }
        }

        // drain outbound records even on a fatal error so the alert
        // reaches the peer before the close
        let mut ciphertext = Vec::new();
        while conn.wants_write() {
            if conn.write_tls(&mut ciphertext).is_err() {
                break;
            }
        }

        let mut just_open = false;
        if !fatal && !ext.handshake_done && !conn.is_handshaking() {
            ext.handshake_done = true;
            just_open = true;
        }
        (fatal, just_open, ext.is_client, peer_closed, plaintext, ciphertext)
    };

    flush_ciphertext(lp, s, ciphertext);

    if fatal {
        lp.close(s);
        return;
    }

    if just_open {
        tracing::debug!(socket = s.0, "handshake complete");
        if let Some(cb) = ctx_open_cb(lp, ctx) {
            (&mut *cb.borrow_mut())(lp, s, is_client);
        }
    }

    if !plaintext.is_empty() {
        if let Some(cb) = ctx_data_cb(lp, ctx) {
            (&mut *cb.borrow_mut())(lp, s, &plaintext);
        }
    }

    if peer_closed {
        lp.close(s);
    }
}

/// Push pending plus fresh ciphertext to the transport; whatever the
/// kernel refuses stays queued and goes out on the next writable event.
fn flush_ciphertext(lp: &mut EventLoop, s: SocketId, fresh: Vec<u8>) {
    let mut buf = match lp.ext_mut::<TlsSocketExt>(s) {
        Some(ext) => mem::take(&mut ext.out_pending),
        None => return,
    };
    buf.extend_from_slice(&fresh);
    if buf.is_empty() {
        return;
    }
    // large flights span several records; hint the kernel to batch them
    let more = buf.len() > 16 * 1024;
    let written = lp.write(s, &buf, more);
    if written < buf.len() {
        if let Some(ext) = lp.ext_mut::<TlsSocketExt>(s) {
            ext.out_pending = buf.split_off(written);
        }
    }
}

enum CbKind {
    Writable,
    Close,
    Timeout,
}

fn ctx_open_cb(lp: &mut EventLoop, ctx: ContextId) -> Option<OpenCb> {
    lp.context_ext_mut::<TlsContextExt>(ctx)?.on_open.clone()
}

fn ctx_data_cb(lp: &mut EventLoop, ctx: ContextId) -> Option<DataCb> {
    lp.context_ext_mut::<TlsContextExt>(ctx)?.on_data.clone()
}

fn ctx_socket_cb(lp: &mut EventLoop, ctx: ContextId, kind: CbKind) -> Option<SocketCb> {
    let ext = lp.context_ext_mut::<TlsContextExt>(ctx)?;
    match kind {
        CbKind::Writable => ext.on_writable.clone(),
        CbKind::Close => ext.on_close.clone(),
        CbKind::Timeout => ext.on_timeout.clone(),
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::InvalidCertificate);
    }
    Ok(certs)
}

fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or(Error::InvalidKey)
}

fn build_server_config(options: &TlsContextOptions) -> Result<Option<Arc<ServerConfig>>> {
    let (Some(cert_file), Some(key_file)) = (&options.cert_file, &options.key_file) else {
        return Ok(None);
    };
    if options.passphrase.is_some() {
        return Err(Error::EncryptedKeyUnsupported);
    }
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Some(Arc::new(config)))
}

fn build_client_config(options: &TlsContextOptions) -> Result<Option<Arc<ClientConfig>>> {
    let Some(ca_file) = &options.ca_file else {
        return Ok(None);
    };
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Some(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_is_rejected_before_file_access() {
        let mut lp = EventLoop::new().unwrap();
        let options = TlsContextOptions {
            cert_file: Some("/no/such/cert.pem".into()),
            key_file: Some("/no/such/key.pem".into()),
            passphrase: Some("secret".into()),
            ca_file: None,
        };
        assert!(matches!(
            TlsContext::create(&mut lp, options),
            Err(Error::EncryptedKeyUnsupported)
        ));
    }

    #[test]
    fn missing_certificate_file_surfaces_io_error() {
        let mut lp = EventLoop::new().unwrap();
        let options = TlsContextOptions {
            cert_file: Some("/no/such/cert.pem".into()),
            key_file: Some("/no/such/key.pem".into()),
            passphrase: None,
            ca_file: None,
        };
        assert!(matches!(
            TlsContext::create(&mut lp, options),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn listen_without_certificate_is_refused() {
        let mut lp = EventLoop::new().unwrap();
        let tls = TlsContext::create(&mut lp, TlsContextOptions::default()).unwrap();
        let err = tls
            .listen(&mut lp, Some("127.0.0.1"), 0, ListenOptions::default(), || Box::new(()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCertificate));
    }

    #[test]
    fn connect_without_roots_is_refused() {
        let mut lp = EventLoop::new().unwrap();
        let tls = TlsContext::create(&mut lp, TlsContextOptions::default()).unwrap();
        let err = tls
            .connect(&mut lp, "127.0.0.1", 1, "localhost", ())
            .unwrap_err();
        assert!(matches!(err, Error::MissingClientCa));
    }
}
