//! Connection lifecycle events.
//!
//! Connection tasks never log transfer outcomes inline. They push
//! [`ConnectionEvent`]s into a bounded channel with `try_send`, and a single
//! drain task turns them into `tracing` records. When the buffer is full the
//! event is dropped and counted; emitting never waits on the log sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::proxy::{BackendAddr, ConnectionState, Direction};

/// Default capacity of the event buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Smallest accepted buffer capacity.
pub const MIN_EVENT_BUFFER: usize = 16;

/// A lifecycle transition worth recording.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ListenerStarted {
        addr: SocketAddr,
    },
    Accepted {
        conn_id: u64,
        peer: SocketAddr,
    },
    AcceptFailed {
        error: String,
    },
    TlsEstablished {
        conn_id: u64,
    },
    TlsFailed {
        conn_id: u64,
        error: String,
    },
    Resolved {
        conn_id: u64,
        backend: BackendAddr,
    },
    ResolveFailed {
        conn_id: u64,
        status: Option<u16>,
        error: String,
    },
    Dialing {
        conn_id: u64,
        backend: BackendAddr,
    },
    Connected {
        conn_id: u64,
        backend: BackendAddr,
    },
    DialFailed {
        conn_id: u64,
        backend: BackendAddr,
        error: String,
    },
    RelayStarted {
        conn_id: u64,
    },
    DirectionFinished {
        conn_id: u64,
        direction: Direction,
        bytes: u64,
        end: &'static str,
        error: Option<String>,
    },
    Closed {
        conn_id: u64,
        peer: SocketAddr,
        final_state: ConnectionState,
        bytes_to_upstream: u64,
        bytes_to_downstream: u64,
        duration: Duration,
    },
}

impl ConnectionEvent {
    /// Connection the event belongs to, if any.
    pub fn conn_id(&self) -> Option<u64> {
        match self {
            ConnectionEvent::ListenerStarted { .. } | ConnectionEvent::AcceptFailed { .. } => None,
            ConnectionEvent::Accepted { conn_id, .. }
            | ConnectionEvent::TlsEstablished { conn_id }
            | ConnectionEvent::TlsFailed { conn_id, .. }
            | ConnectionEvent::Resolved { conn_id, .. }
            | ConnectionEvent::ResolveFailed { conn_id, .. }
            | ConnectionEvent::Dialing { conn_id, .. }
            | ConnectionEvent::Connected { conn_id, .. }
            | ConnectionEvent::DialFailed { conn_id, .. }
            | ConnectionEvent::RelayStarted { conn_id }
            | ConnectionEvent::DirectionFinished { conn_id, .. }
            | ConnectionEvent::Closed { conn_id, .. } => Some(*conn_id),
        }
    }
}

/// Cloneable, non-blocking handle for emitting events.
#[derive(Clone)]
pub struct EventLog {
    tx: Option<mpsc::Sender<ConnectionEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a handle plus the raw receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(MIN_EVENT_BUFFER));
        let log = Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (log, rx)
    }

    /// Create a handle and spawn the task that writes events to `tracing`.
    ///
    /// The task ends once every handle has been dropped.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (log, rx) = Self::channel(capacity);
        let dropped = Arc::clone(&log.dropped);
        let handle = tokio::spawn(drain(rx, dropped));
        (log, handle)
    }

    /// A handle that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an event. Never blocks; drops the event if the buffer is full.
    pub fn emit(&self, event: ConnectionEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Events dropped because the buffer was full and not yet reported.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn drain(mut rx: mpsc::Receiver<ConnectionEvent>, dropped: Arc<AtomicU64>) {
    while let Some(event) = rx.recv().await {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            warn!(dropped = lost, "event buffer full; events were dropped");
        }
        record(&event);
    }
}

/// Write one event to the `tracing` subscriber.
fn record(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::ListenerStarted { addr } => {
            info!(bind_addr = %addr, "listener started");
        }
        ConnectionEvent::Accepted { conn_id, peer } => {
            debug!(conn_id, peer = %peer, "connection accepted");
        }
        ConnectionEvent::AcceptFailed { error } => {
            warn!(error = %error, "accept failed");
        }
        ConnectionEvent::TlsEstablished { conn_id } => {
            debug!(conn_id, "TLS established");
        }
        ConnectionEvent::TlsFailed { conn_id, error } => {
            info!(conn_id, error = %error, "TLS handshake failed");
        }
        ConnectionEvent::Resolved { conn_id, backend } => {
            debug!(conn_id, backend = %backend, "backend resolved");
        }
        ConnectionEvent::ResolveFailed {
            conn_id,
            status,
            error,
        } => {
            warn!(conn_id, status = ?status, error = %error, "backend resolution failed");
        }
        ConnectionEvent::Dialing { conn_id, backend } => {
            debug!(conn_id, backend = %backend, "dialing backend");
        }
        ConnectionEvent::Connected { conn_id, backend } => {
            info!(conn_id, backend = %backend, "piping to backend");
        }
        ConnectionEvent::DialFailed {
            conn_id,
            backend,
            error,
        } => {
            warn!(conn_id, backend = %backend, error = %error, "backend dial failed");
        }
        ConnectionEvent::RelayStarted { conn_id } => {
            debug!(conn_id, "relay started");
        }
        ConnectionEvent::DirectionFinished {
            conn_id,
            direction,
            bytes,
            end,
            error,
        } => match error {
            Some(error) => {
                debug!(conn_id, direction = %direction, bytes, end, error = %error, "copy finished");
            }
            None => {
                debug!(conn_id, direction = %direction, bytes, end, "copy finished");
            }
        },
        ConnectionEvent::Closed {
            conn_id,
            peer,
            final_state,
            bytes_to_upstream,
            bytes_to_downstream,
            duration,
        } => {
            info!(
                conn_id,
                peer = %peer,
                final_state = %final_state,
                bytes_to_upstream,
                bytes_to_downstream,
                duration_ms = duration.as_millis() as u64,
                "connection closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let (log, mut rx) = EventLog::channel(MIN_EVENT_BUFFER);

        log.emit(ConnectionEvent::RelayStarted { conn_id: 1 });
        log.emit(ConnectionEvent::TlsEstablished { conn_id: 2 });

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::RelayStarted { conn_id: 1 })
        );
        assert_eq!(rx.recv().await.and_then(|e| e.conn_id()), Some(2));
    }

    #[test]
    fn test_full_buffer_drops_instead_of_blocking() {
        let (log, _rx) = EventLog::channel(MIN_EVENT_BUFFER);

        for conn_id in 0..(MIN_EVENT_BUFFER as u64 + 10) {
            log.emit(ConnectionEvent::RelayStarted { conn_id });
        }

        assert_eq!(log.dropped(), 10);
    }

    #[test]
    fn test_disabled_log_is_a_no_op() {
        let log = EventLog::disabled();
        log.emit(ConnectionEvent::AcceptFailed {
            error: "boom".to_string(),
        });
        assert_eq!(log.dropped(), 0);
    }

    #[test]
    fn test_emit_after_receiver_gone_is_silent() {
        let (log, rx) = EventLog::channel(MIN_EVENT_BUFFER);
        drop(rx);
        log.emit(ConnectionEvent::RelayStarted { conn_id: 7 });
        assert_eq!(log.dropped(), 0);
    }

    #[tokio::test]
    async fn test_drain_task_exits_when_handles_dropped() {
        let (log, handle) = EventLog::spawn(MIN_EVENT_BUFFER);
        log.emit(ConnectionEvent::TlsEstablished { conn_id: 3 });
        drop(log);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("drain task should stop")
            .unwrap();
    }
}
