//! TLS-terminating TCP proxy.
//!
//! This module provides:
//! - TLS listener and per-connection handling
//! - Backend discovery through a directory service
//! - Full-duplex byte relay
//!
//! ## Architecture
//!
//! ```text
//! Client --TLS--> Listener -> Resolver (HTTP directory) -> dial backend:port
//!                     |                                          |
//!                     +------------------ Relay -----------------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use piper::proxy::{tls, HttpResolver, Listener, ListenerConfig};
//!
//! let acceptor = tls::load_acceptor(cert_path, key_path)?;
//! let resolver = Arc::new(HttpResolver::new(url, 8090, None)?);
//! let (events, _drain) = EventLog::spawn(1024);
//!
//! let config = ListenerConfig::new("0.0.0.0:8080".parse()?);
//! let listener = Listener::bind(config, acceptor, resolver, events).await?;
//! Arc::new(listener).run().await?;
//! ```

mod connection;
mod listener;
mod relay;
mod resolver;
pub mod tls;

pub use connection::{ConnectionAttempt, ConnectionState};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use relay::{
    relay, CopyEnd, Direction, DirectionReport, RelayOptions, RelayReport, DEFAULT_BUFFER_SIZE,
    DEFAULT_CLOSE_GRACE,
};
pub use resolver::{
    parse_backend_host, BackendAddr, HttpResolver, Resolver, StaticResolver,
    DEFAULT_RESOLVE_TIMEOUT,
};
