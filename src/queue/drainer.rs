//! Supervised background consumer of the [`DurableQueue`].
//!
//! One worker task, owned by a [`TaskTracker`], sleeps on a [`Notify`] and drains the
//! queue whenever it is triggered. Drains are single-flight: a guard is taken before
//! the loop body runs and released when the drain ends, including on panic unwinding.
//! A drain refused while another runs is remembered, and the worker is woken again when
//! the running drain releases its guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::metrics::MetricsRecorder;
use crate::queue::DurableQueue;
use crate::settlement::Settlement;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// This call ran the drain and settled this many items.
    Drained(usize),
    /// Another drain was in progress; this call did nothing.
    AlreadyRunning,
}

struct DrainGuard<'a>(&'a DrainerInner);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct DrainerInner {
    queue: Arc<DurableQueue>,
    settlement: Arc<dyn Settlement>,
    metrics: Arc<dyn MetricsRecorder>,
    running: AtomicBool,
    /// Set by every drain attempt, cleared by the one that takes the guard.
    rerun: AtomicBool,
    wake: Notify,
}

impl DrainerInner {
    async fn drain(&self) -> DrainOutcome {
        self.rerun.store(true, Ordering::SeqCst);
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return DrainOutcome::AlreadyRunning;
        }
        self.rerun.store(false, Ordering::SeqCst);
        let _guard = DrainGuard(self);

        let mut settled = 0;
        loop {
            let depth = self.queue.size().await;
            self.metrics.set_queue_depth(depth);
            let Some(item) = self.queue.pop().await else {
                break;
            };
            match self.settlement.settle(&item).await {
                Ok(()) => self.metrics.record_settlement("ok"),
                Err(error) => {
                    tracing::warn!(%error, id = %item.id, kind = item.kind.as_str(), "Settlement failed, item dropped");
                    self.metrics.record_settlement("failed");
                }
            }
            self.metrics.record_receipt_lag(item.lag());
            settled += 1;
        }
        self.metrics.set_queue_depth(0);
        if settled > 0 {
            tracing::debug!(settled, "Queue drained");
        }
        DrainOutcome::Drained(settled)
    }

    /// Drops the single-flight guard and wakes the worker if a drain was refused
    /// meanwhile.
    fn release(&self) {
        self.running.store(false, Ordering::SeqCst);
        if self.rerun.swap(false, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }
}

/// Handle to the drain worker.
///
/// Cloning shares the same worker.
#[derive(Clone)]
pub struct QueueDrainer {
    inner: Arc<DrainerInner>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl QueueDrainer {
    /// Starts the worker task.
    pub fn spawn(
        queue: Arc<DurableQueue>,
        settlement: Arc<dyn Settlement>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let inner = Arc::new(DrainerInner {
            queue,
            settlement,
            metrics,
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let worker = inner.clone();
        let token = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = worker.wake.notified() => {
                        worker.drain().await;
                    }
                }
            }
            if let DrainOutcome::Drained(settled) = worker.drain().await {
                tracing::info!(settled, "Final queue drain complete");
            }
        });
        tracker.close();

        Self {
            inner,
            tracker,
            cancel,
        }
    }

    /// Asks the worker to drain without waiting for it.
    pub fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    /// Drains on the calling task unless a drain is already running.
    pub async fn drain(&self) -> DrainOutcome {
        self.inner.drain().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stops the worker after a final drain and waits for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}
