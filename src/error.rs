use std::io;

/// Errors surfaced from setup paths (loop, listen, connect, TLS context
/// construction). Runtime I/O on established sockets never returns these;
/// per-connection failures are delivered through `on_close`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("no usable certificate in chain file")]
    InvalidCertificate,

    #[error("no usable private key in key file")]
    InvalidKey,

    #[error("encrypted private keys are not supported by the rustls loader")]
    EncryptedKeyUnsupported,

    #[error("client TLS requires a CA file")]
    MissingClientCa,

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("host {0:?} did not resolve to any address")]
    Resolve(String),
}

pub type Result<T> = std::result::Result<T, Error>;
