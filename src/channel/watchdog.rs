use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

/// A one-shot timer for the time a channel may spend without a connection. It runs as a separate
///  task and calls `on_expiry` when the deadline passes, unless it was cancelled (or dropped)
///  before.
pub struct Watchdog {
    deadline: Instant,
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub fn start<F>(timeout: Duration, on_expiry: F) -> Watchdog
    where F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        debug!(?timeout, "starting watchdog");

        let handle = tokio::spawn(async move {
            time::sleep_until(deadline).await;
            debug!(?timeout, "watchdog expired");
            on_expiry();
        });

        Watchdog {
            deadline,
            handle,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
