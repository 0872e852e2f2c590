//! Task tracking for the service's long-running loops
//!
//! Accept loops, agent link workers and the control channel are registered
//! by name so shutdown can wait for every one of them to exit.

use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Tracks the background loops of one tunnel service
#[derive(Debug, Default)]
pub struct TaskTracker {
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loop task under a descriptive name
    pub fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push((name.into(), handle));
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every registered task to finish.
    ///
    /// Tasks registered while waiting are picked up as well.
    pub async fn join_all(&self) {
        loop {
            let batch = match self.tasks.lock() {
                Ok(mut tasks) => std::mem::take(&mut *tasks),
                Err(_) => return,
            };
            if batch.is_empty() {
                return;
            }

            for (name, handle) in batch {
                match handle.await {
                    Ok(()) => debug!(task = %name, "Task finished"),
                    Err(e) if e.is_cancelled() => debug!(task = %name, "Task aborted"),
                    Err(e) => warn!(task = %name, error = %e, "Task panicked"),
                }
            }
        }
    }

    /// Abort every registered task
    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (name, handle) in tasks.drain(..) {
                debug!(task = %name, "Aborting task");
                handle.abort();
            }
        }
    }
}
