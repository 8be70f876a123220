//! Timeout constants and deadline tracking for the blocking helpers.

use std::time::{Duration, Instant};

use crate::error::{ProtocolError, Result};

/// Default timeout for connect and for the synchronous send/read paths
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default readiness-poll timeout for one `SocketHandler::update` tick
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Back-off between retries while a blocking helper waits on a non-blocking socket
pub const BLOCKING_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Point in time after which a blocking operation gives up
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Sleep one retry interval, or fail with `Timeout` once the deadline has passed
    pub fn wait(&self) -> Result<()> {
        if self.expired() {
            return Err(ProtocolError::Timeout);
        }
        std::thread::sleep(BLOCKING_RETRY_INTERVAL.min(self.remaining()));
        Ok(())
    }
}
