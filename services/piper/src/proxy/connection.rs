//! Per-connection lifecycle.
//!
//! ```text
//! Accepted -> TlsEstablished -> Resolving -> Resolved -> Dialing -> Connected -> Relaying -> Closed
//!     |                             |                       |
//!     +-> TlsFailed -> Closed       +-> ResolveFailed       +-> DialFailed -> Closed
//!                                          -> Closed
//! ```
//!
//! Every path ends in `Closed`.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::error;

use crate::events::{ConnectionEvent, EventLog};
use crate::proxy::relay::RelayReport;

/// Where a connection attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Accepted,
    TlsEstablished,
    TlsFailed,
    Resolving,
    Resolved,
    ResolveFailed,
    Dialing,
    DialFailed,
    Connected,
    Relaying,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::TlsEstablished => "tls_established",
            ConnectionState::TlsFailed => "tls_failed",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Resolved => "resolved",
            ConnectionState::ResolveFailed => "resolve_failed",
            ConnectionState::Dialing => "dialing",
            ConnectionState::DialFailed => "dial_failed",
            ConnectionState::Connected => "connected",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Accepted, TlsEstablished)
                | (Accepted, TlsFailed)
                | (TlsEstablished, Resolving)
                | (Resolving, Resolved)
                | (Resolving, ResolveFailed)
                | (Resolved, Dialing)
                | (Dialing, Connected)
                | (Dialing, DialFailed)
                | (Connected, Relaying)
                | (TlsFailed, Closed)
                | (ResolveFailed, Closed)
                | (DialFailed, Closed)
                | (Relaying, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one accepted connection.
///
/// Owned by the connection's task. Streams are not stored here; the task
/// owns them directly so they drop with the task.
pub struct ConnectionAttempt {
    id: u64,
    peer: SocketAddr,
    state: ConnectionState,
    /// Last state before `Closed`.
    final_state: ConnectionState,
    started: Instant,
    bytes_to_upstream: u64,
    bytes_to_downstream: u64,
    events: EventLog,
}

impl ConnectionAttempt {
    /// Start tracking a freshly accepted connection.
    pub fn accepted(id: u64, peer: SocketAddr, events: EventLog) -> Self {
        events.emit(ConnectionEvent::Accepted { conn_id: id, peer });
        Self {
            id,
            peer,
            state: ConnectionState::Accepted,
            final_state: ConnectionState::Accepted,
            started: Instant::now(),
            bytes_to_upstream: 0,
            bytes_to_downstream: 0,
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`, emitting `event` for the transition.
    pub fn advance(&mut self, next: ConnectionState, event: Option<ConnectionEvent>) {
        let legal = self.state.can_advance_to(next);
        debug_assert!(legal, "illegal transition {} -> {}", self.state, next);
        if !legal {
            error!(
                conn_id = self.id,
                from = %self.state,
                to = %next,
                "illegal connection state transition"
            );
        }
        self.state = next;
        if next != ConnectionState::Closed {
            self.final_state = next;
        }
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    /// Record the per-direction outcomes of a finished relay.
    pub fn record_relay(&mut self, report: &RelayReport) {
        self.bytes_to_upstream = report.bytes_to_upstream();
        self.bytes_to_downstream = report.bytes_to_downstream();

        for side in [&report.to_upstream, &report.to_downstream] {
            self.events.emit(ConnectionEvent::DirectionFinished {
                conn_id: self.id,
                direction: side.direction,
                bytes: side.bytes,
                end: side.end.label(),
                error: side.end.error().map(|e| e.source.to_string()),
            });
        }
    }

    /// Enter `Closed` and emit the summary event.
    pub fn close(mut self) {
        let event = ConnectionEvent::Closed {
            conn_id: self.id,
            peer: self.peer,
            final_state: self.final_state,
            bytes_to_upstream: self.bytes_to_upstream,
            bytes_to_downstream: self.bytes_to_downstream,
            duration: self.started.elapsed(),
        };
        self.advance(ConnectionState::Closed, Some(event));
    }
}
