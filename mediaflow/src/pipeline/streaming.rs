//! Streaming tasks run by source stages while PLAYING.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// How long a downward transition waits for a cancelled task to unwind.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot signal released when a streaming task is gone.
#[derive(Debug, Default)]
pub(crate) struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn release(&self) {
        *self.released.lock() = true;
        self.cond.notify_all();
    }

    /// Waits for release. Returns false on timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self.released.lock();
        while !*released {
            if self.cond.wait_until(&mut released, deadline).timed_out() {
                return *released;
            }
        }
        true
    }
}

/// Releases the latch when the task's future is dropped, finished or aborted.
pub(crate) struct ReleaseOnDrop(pub(crate) Arc<Latch>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// A running `produce` task.
#[derive(Debug)]
pub(crate) struct StreamingTask {
    pub(crate) handle: JoinHandle<()>,
    pub(crate) done: Arc<Latch>,
}

impl StreamingTask {
    /// Cancels the task and waits for it to unwind.
    pub(crate) fn stop(self, timeout: Duration) -> bool {
        self.handle.abort();
        self.done.wait(timeout)
    }
}
