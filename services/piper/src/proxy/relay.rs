//! Full-duplex byte relay between a downstream and an upstream stream.
//!
//! Both directions are driven concurrently from the connection's task. The
//! first direction to stop (EOF, I/O error or idle timeout) ends the relay:
//! the surviving copy is dropped, both write halves are shut down and both
//! streams are released together. Neither side is ever left half-open.
//!
//! The idle timeout covers the connection as a whole: traffic in either
//! direction keeps both loops alive, so one-way streams are not cut off.
//!
//! The copy loop writes to exactly one destination. Byte counts are kept in
//! atomics and reported once the relay is over; nothing is logged from the
//! data path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::RelayError;

/// Default copy buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// How long to wait for a write half to shut down before dropping it.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Direction of a copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to backend.
    ToUpstream,
    /// Backend to client.
    ToDownstream,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ToUpstream => "downstream->upstream",
            Direction::ToDownstream => "upstream->downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a copy loop stopped.
#[derive(Debug)]
pub enum CopyEnd {
    /// The read side reached end of stream.
    Eof,
    /// A read or write failed.
    Failed(RelayError),
    /// Neither direction moved data within the idle timeout.
    IdleTimeout,
    /// The paired direction finished first and the relay was torn down.
    Interrupted,
}

impl CopyEnd {
    pub fn is_eof(&self) -> bool {
        matches!(self, CopyEnd::Eof)
    }

    /// Short label for structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            CopyEnd::Eof => "eof",
            CopyEnd::Failed(_) => "error",
            CopyEnd::IdleTimeout => "idle_timeout",
            CopyEnd::Interrupted => "interrupted",
        }
    }

    /// The I/O error, if the loop failed.
    pub fn error(&self) -> Option<&RelayError> {
        match self {
            CopyEnd::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of one direction.
#[derive(Debug)]
pub struct DirectionReport {
    pub direction: Direction,
    /// Bytes read from the source and fully written to the destination.
    pub bytes: u64,
    pub end: CopyEnd,
}

/// Outcome of a whole relay.
#[derive(Debug)]
pub struct RelayReport {
    pub to_upstream: DirectionReport,
    pub to_downstream: DirectionReport,
    /// The direction whose completion tore the relay down.
    pub first_finished: Direction,
}

impl RelayReport {
    pub fn bytes_to_upstream(&self) -> u64 {
        self.to_upstream.bytes
    }

    pub fn bytes_to_downstream(&self) -> u64 {
        self.to_downstream.bytes
    }
}

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Per-direction buffer size.
    pub buffer_size: usize,
    /// Stop the relay after this long without data in either direction.
    /// `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Bound on each write-half shutdown during teardown.
    pub close_grace: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Relay bytes between `downstream` and `upstream` until either side stops.
///
/// Takes ownership of both streams; they are closed and dropped before this
/// returns, whatever the exit path.
pub async fn relay<D, U>(downstream: D, upstream: U, options: &RelayOptions) -> RelayReport
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut down_read, mut down_write) = tokio::io::split(downstream);
    let (mut up_read, mut up_write) = tokio::io::split(upstream);

    let to_upstream_bytes = AtomicU64::new(0);
    let to_downstream_bytes = AtomicU64::new(0);
    let activity = Activity::new();

    let (first_finished, first_end) = {
        let to_upstream = copy_one_way(
            Direction::ToUpstream,
            &mut down_read,
            &mut up_write,
            &to_upstream_bytes,
            &activity,
            options,
        );
        let to_downstream = copy_one_way(
            Direction::ToDownstream,
            &mut up_read,
            &mut down_write,
            &to_downstream_bytes,
            &activity,
            options,
        );
        tokio::pin!(to_upstream);
        tokio::pin!(to_downstream);

        tokio::select! {
            end = &mut to_upstream => (Direction::ToUpstream, end),
            end = &mut to_downstream => (Direction::ToDownstream, end),
        }
        // The surviving copy future is dropped here.
    };

    tokio::join!(
        close_writer(&mut up_write, options.close_grace),
        close_writer(&mut down_write, options.close_grace),
    );
    drop((down_read, down_write, up_read, up_write));

    let (up_end, down_end) = match first_finished {
        Direction::ToUpstream => (first_end, CopyEnd::Interrupted),
        Direction::ToDownstream => (CopyEnd::Interrupted, first_end),
    };

    RelayReport {
        to_upstream: DirectionReport {
            direction: Direction::ToUpstream,
            bytes: to_upstream_bytes.load(Ordering::Relaxed),
            end: up_end,
        },
        to_downstream: DirectionReport {
            direction: Direction::ToDownstream,
            bytes: to_downstream_bytes.load(Ordering::Relaxed),
            end: down_end,
        },
        first_finished,
    }
}

/// Last time either direction moved data.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_deadline(&self, limit: Duration) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + limit
    }
}

async fn copy_one_way<R, W>(
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    transferred: &AtomicU64,
    activity: &Activity,
    options: &RelayOptions,
) -> CopyEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; options.buffer_size.max(1)];
    loop {
        let read_result = match options.idle_timeout {
            Some(limit) => {
                match timeout_at(activity.idle_deadline(limit), reader.read(&mut buf)).await {
                    Ok(result) => result,
                    // The paired direction moved data while this one waited.
                    Err(_) if Instant::now() < activity.idle_deadline(limit) => continue,
                    Err(_) => return CopyEnd::IdleTimeout,
                }
            }
            None => reader.read(&mut buf).await,
        };

        let n = match read_result {
            Ok(0) => return CopyEnd::Eof,
            Ok(n) => n,
            Err(source) => return CopyEnd::Failed(RelayError { direction, source }),
        };

        if let Err(source) = writer.write_all(&buf[..n]).await {
            return CopyEnd::Failed(RelayError { direction, source });
        }
        // TLS writers buffer records until flushed.
        if let Err(source) = writer.flush().await {
            return CopyEnd::Failed(RelayError { direction, source });
        }

        transferred.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

async fn close_writer<W: AsyncWrite + Unpin>(writer: &mut W, grace: Duration) {
    // Errors are expected here when the peer is already gone.
    let _ = timeout(grace, writer.shutdown()).await;
}
