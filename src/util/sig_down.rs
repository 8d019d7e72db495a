//! Gateway shutdown sequencing.
//!
//! SIGTERM or SIGINT first stops the HTTP listener through [`SigDown::graceful`], so no
//! new receipts are accepted. The caller then shuts the
//! [`QueueDrainer`](crate::queue::QueueDrainer) down, which settles what is still
//! queued, and finally awaits [`SigDown::recv`].

use std::future::Future;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct SigDown {
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl SigDown {
    /// Registers the signal handlers. Fails if the process cannot install them.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        let listener = token.clone();
        task_tracker.spawn(async move {
            let received = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = listener.cancelled() => return,
            };
            tracing::info!(signal = received, "Shutdown requested, draining receipt queue after HTTP stops");
            listener.cancel();
        });
        task_tracker.close();
        Ok(Self {
            task_tracker,
            cancellation_token: token,
        })
    }

    /// Resolves once shutdown is requested. Handed to `axum::serve`.
    pub fn graceful(&self) -> impl Future<Output = ()> + Send + 'static {
        self.cancellation_token.clone().cancelled_owned()
    }

    /// Requests shutdown without a signal.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Waits for shutdown and for the signal listener to exit.
    pub async fn recv(&self) {
        self.cancellation_token.cancelled().await;
        self.task_tracker.wait().await;
    }
}
