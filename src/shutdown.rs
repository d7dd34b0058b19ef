//! Shutdown coordination
//!
//! One [`Shutdown`] exists per process. A termination signal (or an explicit
//! [`Shutdown::trigger`]) cancels its token; accept loops watch the token and
//! stop, while sessions spawned through [`Shutdown::spawn`] keep running
//! until they finish on their own. [`Shutdown::drain`] waits for them.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Process-wide shutdown state
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger on Ctrl-C, and on SIGTERM where available
    pub fn listen_for_signals(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, shutting down");
                token.cancel();
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let token = self.token.clone();
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::spawn(async move {
                        if sigterm.recv().await.is_some() {
                            info!("Received SIGTERM, shutting down");
                            token.cancel();
                        }
                    });
                }
                Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
            }
        }
    }

    /// Start shutting down. Calling it again does nothing.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once shutdown has started
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Token for loops that should stop on shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a task that shutdown waits for
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Number of tracked tasks still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for tracked tasks, at most `grace` when given.
    ///
    /// Returns whether every task finished.
    pub async fn drain(&self, grace: Option<Duration>) -> bool {
        self.tracker.close();

        let pending = self.tracker.len();
        if pending > 0 {
            info!("Waiting for {} active session(s) to finish", pending);
        }

        match grace {
            None => {
                self.tracker.wait().await;
                true
            }
            Some(grace) => match tokio::time::timeout(grace, self.tracker.wait()).await {
                Ok(()) => true,
                Err(_) => {
                    warn!(
                        "{} session(s) still active after {:?}, exiting anyway",
                        self.tracker.len(),
                        grace
                    );
                    false
                }
            },
        }
    }
}
