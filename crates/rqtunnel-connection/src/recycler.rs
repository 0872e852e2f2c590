//! Bounded pool of reusable copy buffers
//!
//! The pool lends at most `capacity` buffers at a time. A borrow beyond that
//! waits until another holder drops its [`RecycledBuffer`], which is what
//! bounds memory when many sessions are copying at once.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Default size of each pooled buffer (32 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Returned when borrowing from a recycler that has been closed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Buffer recycler is closed")]
pub struct RecyclerClosed;

struct Inner {
    buffer_size: usize,
    capacity: usize,
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Inner {
    fn take(&self) -> Vec<u8> {
        let recycled = self.free.lock().ok().and_then(|mut free| free.pop());
        recycled.unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    fn give_back(&self, buf: Vec<u8>) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(buf);
            }
        }
    }
}

/// Bounded pool of fixed-size byte buffers
#[derive(Clone)]
pub struct BufferRecycler {
    inner: Arc<Inner>,
}

impl BufferRecycler {
    /// Create a pool lending at most `capacity` buffers of `buffer_size` bytes.
    ///
    /// Buffers are allocated lazily on first use.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        debug!(capacity, buffer_size, "Creating buffer recycler");
        Self {
            inner: Arc::new(Inner {
                buffer_size,
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Borrow a buffer, waiting while all `capacity` buffers are lent out.
    pub async fn borrow(&self) -> Result<RecycledBuffer, RecyclerClosed> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RecyclerClosed)?;
        Ok(self.lend(permit))
    }

    /// Borrow a buffer only if one is available right now.
    pub fn try_borrow(&self) -> Result<Option<RecycledBuffer>, RecyclerClosed> {
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(self.lend(permit))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(RecyclerClosed),
        }
    }

    fn lend(&self, permit: OwnedSemaphorePermit) -> RecycledBuffer {
        RecycledBuffer {
            buf: self.inner.take(),
            inner: self.inner.clone(),
            _permit: permit,
        }
    }

    /// Fail all pending and future borrows. Lent buffers stay valid.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of buffers currently lent out
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.inner.permits.available_permits()
    }
}

impl std::fmt::Debug for BufferRecycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRecycler")
            .field("capacity", &self.inner.capacity)
            .field("buffer_size", &self.inner.buffer_size)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A lent buffer. Dropping it returns the buffer and frees a pool slot.
///
/// Contents are whatever the previous holder left behind.
pub struct RecycledBuffer {
    buf: Vec<u8>,
    inner: Arc<Inner>,
    // Released after `Drop::drop` has put the buffer back
    _permit: OwnedSemaphorePermit,
}

impl Deref for RecycledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for RecycledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for RecycledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.inner.give_back(buf);
    }
}
