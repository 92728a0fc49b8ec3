//! Reconnection timing for controller dial loops

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Default interval between dial attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed-interval retry schedule for one agent. Retries never give up; each
/// attempt is a fresh dial and handshake.
pub struct ReconnectManager {
    interval: Duration,
    /// Failed attempts since the last established session
    failures: u32,
}

impl ReconnectManager {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            failures: 0,
        }
    }

    /// Sleep until the next dial. `established` says whether the previous
    /// attempt produced a confirmed session.
    pub async fn wait(&mut self, established: bool) {
        if established {
            self.failures = 0;
        } else {
            self.failures = self.failures.saturating_add(1);
        }

        debug!(
            failures = self.failures,
            "Redialing in {}ms",
            self.interval.as_millis()
        );
        sleep(self.interval).await;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
