//! Quit and termination flags shared between the supervisor and signal listeners.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// Set-once flags: "the shell wants to quit" and "termination has started".
#[derive(Debug)]
pub struct ShutdownLatch {
    quit: watch::Sender<bool>,
    terminating: AtomicBool,
}

impl ShutdownLatch {
    pub fn new() -> Arc<Self> {
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            quit,
            terminating: AtomicBool::new(false),
        })
    }

    /// Request shell quit. Returns false if quit was already requested.
    pub fn request_quit(&self) -> bool {
        self.quit.send_if_modified(|quitting| {
            if *quitting {
                false
            } else {
                *quitting = true;
                true
            }
        })
    }

    pub fn is_quitting(&self) -> bool {
        *self.quit.borrow()
    }

    /// Resolves once quit has been requested, including before this call.
    pub async fn quit_requested(&self) {
        let mut rx = self.quit.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|quitting| *quitting).await;
    }

    /// Claim the single termination sequence. Only the first caller gets true.
    pub fn try_begin_termination(&self) -> bool {
        !self.terminating.swap(true, Ordering::SeqCst)
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn quit_is_requested_once() {
        let latch = ShutdownLatch::new();
        assert!(!latch.is_quitting());
        assert!(latch.request_quit());
        assert!(!latch.request_quit());
        assert!(latch.is_quitting());
    }

    #[test]
    fn only_one_caller_begins_termination() {
        let latch = ShutdownLatch::new();
        assert!(latch.try_begin_termination());
        assert!(!latch.try_begin_termination());
        assert!(latch.is_terminating());
    }

    #[tokio::test(start_paused = true)]
    async fn late_waiters_see_an_earlier_quit() {
        let latch = ShutdownLatch::new();
        latch.request_quit();
        tokio::time::timeout(Duration::from_secs(1), latch.quit_requested())
            .await
            .expect("quit already visible");
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_wake_on_quit() {
        let latch = ShutdownLatch::new();
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.quit_requested().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        latch.request_quit();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
    }
}
