//! piper: TLS-terminating TCP proxy with per-connection backend discovery.
//!
//! Clients connect over TLS. For every connection the proxy asks an HTTP
//! directory service where the backend currently is, dials it in plaintext
//! and pipes bytes both ways until either side hangs up.

pub mod config;
pub mod error;
pub mod events;
pub mod proxy;

pub use error::{ConnectionError, DialError, ListenError, RelayError, ResolveError};
pub use events::{ConnectionEvent, EventLog};
pub use proxy::{
    BackendAddr, ConnectionState, Direction, HttpResolver, Listener, ListenerConfig,
    ListenerStats, RelayOptions, RelayReport, Resolver, StaticResolver,
};
