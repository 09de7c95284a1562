//! Error types for the proxy.
//!
//! Only [`ListenError`] is fatal. Everything else is scoped to a single
//! connection attempt and ends that attempt alone.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::proxy::{BackendAddr, Direction};

/// Startup failures. These abort the process.
#[derive(Debug, Error)]
pub enum ListenError {
    /// The listen socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A certificate or key file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// PEM input could not be parsed.
    #[error("invalid PEM input: {0}")]
    Pem(#[source] io::Error),

    /// The certificate PEM contained no certificates.
    #[error("no certificates found in PEM input")]
    NoCertificates,

    /// The key PEM contained no usable private key.
    #[error("no private key found in PEM input")]
    NoPrivateKey,

    /// rustls rejected the certificate/key pair.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Directory lookup failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The directory answered with something other than 200.
    #[error("directory returned status {0}")]
    Status(u16),

    /// The directory answered 200 with an empty body.
    #[error("directory returned an empty body")]
    EmptyBody,

    /// The body does not name a host.
    #[error("directory returned a malformed host: {0:?}")]
    MalformedBody(String),

    /// Transport-level failure talking to the directory.
    #[error("directory request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The lookup exceeded the configured resolve timeout.
    #[error("directory request timed out")]
    Timeout,
}

impl ResolveError {
    /// The HTTP status carried by this failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ResolveError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Failure to open the upstream connection.
#[derive(Debug, Error)]
#[error("failed to dial {backend}: {source}")]
pub struct DialError {
    pub backend: BackendAddr,
    #[source]
    pub source: io::Error,
}

/// I/O failure in one relay direction.
///
/// Also produced by ordinary disconnects (resets, broken pipes), so it is
/// logged rather than treated as exceptional.
#[derive(Debug, Error)]
#[error("{direction} copy failed: {source}")]
pub struct RelayError {
    pub direction: Direction,
    #[source]
    pub source: io::Error,
}

/// Anything that ends a connection attempt early.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Dial(#[from] DialError),
}
