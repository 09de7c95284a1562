//! TLS listener and per-connection handling.
//!
//! Accepts TCP connections, terminates TLS, asks the resolver for the current
//! backend, dials it in plaintext and relays bytes until either side closes.
//!
//! Each accepted connection runs in its own task. Failures are scoped to that
//! task: the client stream is dropped (an abrupt close, no application-level
//! error) and the accept loop carries on.
//!
//! There is no admission limit; concurrency is bounded only by the runtime.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, Instrument};

use super::connection::{ConnectionAttempt, ConnectionState};
use super::relay::{relay, RelayOptions};
use super::resolver::{BackendAddr, Resolver};
use crate::error::{ConnectionError, DialError, ListenError};
use crate::events::{ConnectionEvent, EventLog};

/// Default deadline for dialing the backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for the client TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after an accept error so a persistent failure cannot spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Client TLS handshake deadline. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Backend dial deadline. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Relay tuning.
    pub relay: RelayOptions,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            relay: RelayOptions::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections fully torn down.
    pub connections_closed: AtomicU64,
    /// Failed `accept` calls.
    pub accept_errors: AtomicU64,
    /// TLS handshake failures and timeouts.
    pub tls_failed: AtomicU64,
    /// Directory lookups that failed.
    pub resolve_failed: AtomicU64,
    /// Backend dials started.
    pub dial_attempts: AtomicU64,
    /// Backend dials that failed.
    pub dial_failed: AtomicU64,
    /// Relays that ran to completion.
    pub relays_completed: AtomicU64,
    /// Bytes relayed to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed back to clients.
    pub bytes_from_backend: AtomicU64,
}

/// A TLS-terminating listener.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// TLS acceptor for client handshakes.
    acceptor: TlsAcceptor,
    /// Backend discovery, consulted once per connection.
    resolver: Arc<dyn Resolver>,
    /// Lifecycle event sink.
    events: EventLog,
    /// Last assigned connection id.
    next_conn_id: AtomicU64,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(
        config: ListenerConfig,
        acceptor: TlsAcceptor,
        resolver: Arc<dyn Resolver>,
        events: EventLog,
    ) -> Result<Self, ListenError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ListenError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ListenError::Bind {
            addr: config.bind_addr,
            source,
        })?;

        info!(bind_addr = %local_addr, "Listener bound");

        Ok(Self {
            config,
            listener,
            acceptor,
            resolver,
            events,
            next_conn_id: AtomicU64::new(0),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the accept loop. Only returns if the local address is unavailable.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        self.events
            .emit(ConnectionEvent::ListenerStarted { addr: local_addr });

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);

                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream, peer_addr, conn_id).await;

                            listener
                                .stats
                                .connections_active
                                .fetch_sub(1, Ordering::Relaxed);
                            listener
                                .stats
                                .connections_closed
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", conn_id, peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(ConnectionEvent::AcceptFailed {
                        error: e.to_string(),
                    });
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Drive one connection through its lifecycle and always close it.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr, conn_id: u64) {
        let _ = stream.set_nodelay(true);

        let mut attempt = ConnectionAttempt::accepted(conn_id, peer_addr, self.events.clone());

        if let Err(e) = self.serve(&mut attempt, stream).await {
            debug!(error = %e, state = %attempt.state(), "Connection attempt ended early");
        }

        attempt.close();
    }

    async fn serve(
        &self,
        attempt: &mut ConnectionAttempt,
        stream: TcpStream,
    ) -> Result<(), ConnectionError> {
        let conn_id = attempt.id();

        let downstream = match self.handshake(stream).await {
            Ok(tls) => tls,
            Err(e) => {
                self.stats.tls_failed.fetch_add(1, Ordering::Relaxed);
                attempt.advance(
                    ConnectionState::TlsFailed,
                    Some(ConnectionEvent::TlsFailed {
                        conn_id,
                        error: e.to_string(),
                    }),
                );
                return Err(e);
            }
        };
        attempt.advance(
            ConnectionState::TlsEstablished,
            Some(ConnectionEvent::TlsEstablished { conn_id }),
        );

        attempt.advance(ConnectionState::Resolving, None);
        let backend = match self.resolver.resolve().await {
            Ok(backend) => backend,
            Err(e) => {
                self.stats.resolve_failed.fetch_add(1, Ordering::Relaxed);
                attempt.advance(
                    ConnectionState::ResolveFailed,
                    Some(ConnectionEvent::ResolveFailed {
                        conn_id,
                        status: e.status(),
                        error: e.to_string(),
                    }),
                );
                return Err(e.into());
            }
        };
        attempt.advance(
            ConnectionState::Resolved,
            Some(ConnectionEvent::Resolved {
                conn_id,
                backend: backend.clone(),
            }),
        );

        attempt.advance(
            ConnectionState::Dialing,
            Some(ConnectionEvent::Dialing {
                conn_id,
                backend: backend.clone(),
            }),
        );
        self.stats.dial_attempts.fetch_add(1, Ordering::Relaxed);
        let upstream = match self.dial(&backend).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                attempt.advance(
                    ConnectionState::DialFailed,
                    Some(ConnectionEvent::DialFailed {
                        conn_id,
                        backend,
                        error: e.source.to_string(),
                    }),
                );
                return Err(e.into());
            }
        };
        attempt.advance(
            ConnectionState::Connected,
            Some(ConnectionEvent::Connected { conn_id, backend }),
        );

        attempt.advance(
            ConnectionState::Relaying,
            Some(ConnectionEvent::RelayStarted { conn_id }),
        );
        let report = relay(downstream, upstream, &self.config.relay).await;

        self.stats.relays_completed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_to_backend
            .fetch_add(report.bytes_to_upstream(), Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(report.bytes_to_downstream(), Ordering::Relaxed);
        attempt.record_relay(&report);

        Ok(())
    }

    async fn handshake(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>, ConnectionError> {
        let accept = self.acceptor.accept(stream);
        match self.config.handshake_timeout {
            Some(limit) => match timeout(limit, accept).await {
                Ok(result) => result.map_err(ConnectionError::Handshake),
                Err(_) => Err(ConnectionError::HandshakeTimeout),
            },
            None => accept.await.map_err(ConnectionError::Handshake),
        }
    }

    async fn dial(&self, backend: &BackendAddr) -> Result<TcpStream, DialError> {
        let connect = TcpStream::connect((backend.host.as_str(), backend.port));
        let result = match self.config.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => connect.await,
        };

        let stream = result.map_err(|source| DialError {
            backend: backend.clone(),
            source,
        })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.handshake_timeout, Some(DEFAULT_HANDSHAKE_TIMEOUT));
        assert_eq!(config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert!(config.relay.idle_timeout.is_none());
    }

    #[tokio::test]
    async fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.dial_attempts.load(Ordering::Relaxed), 0);
    }
}
