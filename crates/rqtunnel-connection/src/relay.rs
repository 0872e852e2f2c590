//! Bidirectional pipe engine
//!
//! [`relay`] copies `a -> b` and `b -> a` concurrently and returns once both
//! directions have finished. A direction that reaches EOF half-closes
//! (`close_write` on its destination, `close_read` on its source) and leaves
//! the other direction draining. A direction that fails with an I/O error
//! aborts its sibling, since the session cannot be resumed. Cancelling the
//! caller's `stop` token ends both directions the same way.

use crate::connection::{ConnReader, ConnWriter, ManagedConnection};
use crate::recycler::{BufferRecycler, RecyclerClosed};
use std::io;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes moved in each direction of one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

#[derive(Debug, Error)]
enum PipeError {
    #[error("read failed: {0}")]
    Read(io::Error),

    #[error("write failed: {0}")]
    Write(io::Error),

    #[error(transparent)]
    Recycler(#[from] RecyclerClosed),
}

impl PipeError {
    fn is_disconnect(&self) -> bool {
        let err = match self {
            PipeError::Read(e) | PipeError::Write(e) => e,
            PipeError::Recycler(_) => return false,
        };
        matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        )
    }
}

enum PipeEnd {
    Eof,
    Aborted,
    Failed(PipeError),
}

/// Relay between `a` and `b` until both directions have ended or `stop`
/// is cancelled.
///
/// Byte counts include partial transfers that were cut short by an error
/// or by `stop`. Errors are logged, never returned.
pub async fn relay(
    a: ManagedConnection,
    b: ManagedConnection,
    recycler: &BufferRecycler,
    stop: &CancellationToken,
) -> RelayStats {
    let (mut a_read, mut a_write) = a.into_split();
    let (mut b_read, mut b_write) = b.into_split();
    let abort = stop.child_token();

    let (a_to_b, b_to_a) = tokio::join!(
        pipe(&mut a_read, &mut b_write, recycler, &abort, "a->b"),
        pipe(&mut b_read, &mut a_write, recycler, &abort, "b->a"),
    );

    RelayStats { a_to_b, b_to_a }
}

async fn pipe(
    src: &mut ConnReader,
    dst: &mut ConnWriter,
    recycler: &BufferRecycler,
    abort: &CancellationToken,
    direction: &'static str,
) -> u64 {
    let mut total = 0u64;

    let end = loop {
        let step = tokio::select! {
            biased;
            _ = abort.cancelled() => break PipeEnd::Aborted,
            step = copy_chunk(src, dst, recycler) => step,
        };
        match step {
            Ok(Some(n)) => total += n as u64,
            Ok(None) => break PipeEnd::Eof,
            Err(e) => break PipeEnd::Failed(e),
        }
    };

    match end {
        PipeEnd::Eof => {
            debug!(direction, bytes = total, "Source closed, half-closing");
        }
        PipeEnd::Aborted => {
            debug!(direction, bytes = total, "Relay direction aborted");
        }
        PipeEnd::Failed(e) => {
            if e.is_disconnect() {
                debug!(direction, bytes = total, error = %e, "Peer disconnected");
            } else {
                warn!(direction, bytes = total, error = %e, "Relay direction failed");
            }
            abort.cancel();
        }
    }

    if let Err(e) = dst.close_write().await {
        debug!(direction, error = %e, "close_write failed");
    }
    if let Err(e) = src.close_read() {
        debug!(direction, error = %e, "close_read failed");
    }

    total
}

/// Move one chunk. `Ok(None)` means the source reached EOF.
///
/// The buffer is only borrowed once the source is readable, so idle
/// sessions hold no pool capacity.
async fn copy_chunk(
    src: &mut ConnReader,
    dst: &mut ConnWriter,
    recycler: &BufferRecycler,
) -> Result<Option<usize>, PipeError> {
    loop {
        src.readable().await.map_err(PipeError::Read)?;
        let mut buf = recycler.borrow().await?;

        let n = match src.try_read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(PipeError::Read(e)),
        };

        dst.write_all(&mut buf[..n])
            .await
            .map_err(PipeError::Write)?;
        return Ok(Some(n));
    }
}
