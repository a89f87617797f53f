//! Shared state for the stub's request handlers.

use std::time::Duration;

use tokio::time::Instant;

/// When the stub started and how long it pretends to warm up.
#[derive(Debug, Clone, Copy)]
pub struct AppState {
    pub started: Instant,
    pub ready_after: Duration,
}

impl AppState {
    pub fn new(ready_after: Duration) -> Self {
        Self {
            started: Instant::now(),
            ready_after,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.started.elapsed() >= self.ready_after
    }
}
