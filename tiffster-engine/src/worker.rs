//! Notification Worker
//!
//! Single-flight consumer of page-changed notifications. The worker pulls
//! one [`Delivery`] at a time off the queue, reconciles it, and reports the
//! outcome back through the delivery's ack so the transport can decide
//! whether to redeliver.
//!
//! # Example
//!
//! ```ignore
//! let (tx, rx) = mpsc::channel(config.queue_capacity);
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//! let handle = tokio::spawn(reconcile_worker(reconciler, rx, shutdown_rx));
//!
//! // Later, trigger shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tiffster_core::{PageChanged, TiffsterResult};
use tiffster_storage::PageResidency;
use tokio::sync::{mpsc, oneshot, watch};

use crate::reconciler::{ReconcileOutcome, WindowReconciler};

// ============================================================================
// DELIVERY
// ============================================================================

/// Result reported back to the transport for one delivery.
pub type Ack = TiffsterResult<ReconcileOutcome>;

/// One notification as handed over by the transport.
#[derive(Debug)]
pub struct Delivery {
    pub notification: PageChanged,
    /// Receives the outcome. `Err` means nack: redeliver later.
    pub ack: Option<oneshot::Sender<Ack>>,
}

impl Delivery {
    /// Fire-and-forget delivery.
    pub fn new(notification: PageChanged) -> Self {
        Self {
            notification,
            ack: None,
        }
    }

    /// Delivery paired with the receiver its outcome will be sent to.
    pub fn with_ack(notification: PageChanged) -> (Self, oneshot::Receiver<Ack>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                notification,
                ack: Some(tx),
            },
            rx,
        )
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for worker activity.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub received: AtomicU64,
    pub committed: AtomicU64,
    pub noop: AtomicU64,
    pub rejected: AtomicU64,
    pub superseded: AtomicU64,
    /// Reconciliations that failed and were nacked
    pub aborted: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            noop: self.noop.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }

    fn record(&self, ack: &Ack) {
        let counter = match ack {
            Ok(ReconcileOutcome::Committed(_)) => &self.committed,
            Ok(ReconcileOutcome::NoOp) => &self.noop,
            Ok(ReconcileOutcome::Rejected(_)) => &self.rejected,
            Ok(ReconcileOutcome::Superseded { .. }) => &self.superseded,
            Err(_) => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of worker metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub received: u64,
    pub committed: u64,
    pub noop: u64,
    pub rejected: u64,
    pub superseded: u64,
    pub aborted: u64,
}

// ============================================================================
// WORKER LOOP
// ============================================================================

/// Consume deliveries until shutdown or until every sender is dropped.
///
/// A reconciliation in progress when shutdown is signalled runs to
/// completion; queued deliveries after it are left for redelivery.
pub async fn reconcile_worker<M>(
    reconciler: Arc<WindowReconciler<M>>,
    mut rx: mpsc::Receiver<Delivery>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<WorkerMetrics>
where
    M: PageResidency + 'static,
{
    let metrics = Arc::new(WorkerMetrics::new());

    tracing::info!(
        window_size = reconciler.window_size(),
        "Reconcile worker started"
    );

    loop {
        tokio::select! {
            // A dropped shutdown sender counts as a shutdown signal.
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Reconcile worker shutting down");
                    break;
                }
            }

            delivery = rx.recv() => {
                let Some(delivery) = delivery else {
                    tracing::info!("Notification queue closed");
                    break;
                };
                handle_delivery(&reconciler, delivery, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        received = snapshot.received,
        committed = snapshot.committed,
        noop = snapshot.noop,
        rejected = snapshot.rejected,
        superseded = snapshot.superseded,
        aborted = snapshot.aborted,
        "Reconcile worker completed"
    );

    metrics
}

async fn handle_delivery<M: PageResidency>(
    reconciler: &WindowReconciler<M>,
    delivery: Delivery,
    metrics: &WorkerMetrics,
) {
    metrics.received.fetch_add(1, Ordering::Relaxed);

    let ack = reconciler.reconcile(&delivery.notification).await;
    metrics.record(&ack);

    if let Err(e) = &ack {
        tracing::warn!(
            event_id = %delivery.notification.id,
            error = %e,
            "Notification nacked"
        );
    }

    if let Some(tx) = delivery.ack {
        if tx.send(ack).is_err() {
            tracing::debug!(
                event_id = %delivery.notification.id,
                "Ack receiver dropped"
            );
        }
    }
}
