//! Bounded FIFO of agent links waiting for a user
//!
//! The agent-intake loop blocks in [`PendingLinkQueue::enqueue`] while the
//! queue is full, which stops it from accepting more agent links. The
//! user-intake loop blocks in [`PendingLinkQueue::dequeue`] while it is
//! empty. Both waits are fair, so pairing is strictly oldest-first.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::debug;

/// An accepted agent link that has not been paired yet
#[derive(Debug)]
pub struct PendingLink {
    stream: TcpStream,
    peer: SocketAddr,
    queued_at: Instant,
}

impl PendingLink {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            queued_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Time spent in the queue so far
    pub fn waited(&self) -> Duration {
        self.queued_at.elapsed()
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// The queue was closed; the rejected link is handed back.
#[derive(Debug, Error)]
#[error("Pending link queue is closed")]
pub struct QueueClosed(pub PendingLink);

#[derive(Debug)]
pub struct PendingLinkQueue {
    capacity: usize,
    links: Mutex<VecDeque<PendingLink>>,
    /// Free slots; enqueue waits here when the queue is full
    slots: Semaphore,
    /// Queued links; dequeue waits here when the queue is empty
    ready: Semaphore,
    closed: AtomicBool,
}

impl PendingLinkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            links: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a link, waiting while the queue is at capacity.
    pub async fn enqueue(&self, link: PendingLink) -> Result<(), QueueClosed> {
        let slot = match self.slots.acquire().await {
            Ok(slot) => slot,
            Err(_) => return Err(QueueClosed(link)),
        };
        slot.forget();

        {
            let mut links = self.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueClosed(link));
            }
            links.push_back(link);
        }
        self.ready.add_permits(1);
        Ok(())
    }

    /// Take the oldest link, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<PendingLink> {
        let ready = self.ready.acquire().await.ok()?;
        ready.forget();

        let link = self.lock().pop_front();
        if link.is_some() {
            self.slots.add_permits(1);
        }
        link
    }

    /// Close every queued link without closing the queue.
    ///
    /// Used when the agent is known to be gone; returns how many were closed.
    pub fn drain(&self) -> usize {
        let mut closed = 0;
        while let Ok(ready) = self.ready.try_acquire() {
            ready.forget();
            let Some(link) = self.lock().pop_front() else {
                break;
            };
            debug!(peer = %link.peer, "Closing pending link");
            drop(link);
            self.slots.add_permits(1);
            closed += 1;
        }
        closed
    }

    /// Close the queue for good and drop every queued link.
    ///
    /// Blocked `enqueue` calls fail and blocked `dequeue` calls return
    /// `None`. Returns how many queued links were closed.
    pub fn close(&self) -> usize {
        let dropped: Vec<PendingLink> = {
            let mut links = self.lock();
            self.closed.store(true, Ordering::Release);
            links.drain(..).collect()
        };
        self.slots.close();
        self.ready.close();
        dropped.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
