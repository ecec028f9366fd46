//! Engine assembly: cache, materializer, service, reconciler and worker wired
//! from one [`EngineConfig`].

use std::sync::Arc;

use tiffster_core::{EngineConfig, StorageError, TiffsterError, TiffsterResult};
use tiffster_storage::{
    ContainerDecoder, DocumentCache, LocalStage, PageMaterializer, RemoteObjectStore,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::reconciler::WindowReconciler;
use crate::service::{NotificationPublisher, PageWindowService};
use crate::worker::{reconcile_worker, WorkerMetrics, WorkerSnapshot};

pub type Reconciler<D, S> = WindowReconciler<PageMaterializer<D, S>>;

/// A running engine with its worker task.
pub struct Engine<D, S>
where
    D: ContainerDecoder,
    S: RemoteObjectStore,
{
    service: PageWindowService<D, S>,
    reconciler: Arc<Reconciler<D, S>>,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<Arc<WorkerMetrics>>,
}

impl<D, S> Engine<D, S>
where
    D: ContainerDecoder + 'static,
    S: RemoteObjectStore + 'static,
{
    /// Validate `config`, wire the components and spawn the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &EngineConfig, decoder: Arc<D>, store: Arc<S>) -> TiffsterResult<Self> {
        config.validate()?;

        let cache = DocumentCache::new();
        let materializer = Arc::new(PageMaterializer::new(
            decoder,
            store,
            LocalStage::from_config(config),
            cache.clone(),
        ));
        let reconciler = Arc::new(WindowReconciler::from_config(
            Arc::clone(&materializer),
            cache,
            config,
        ));

        let (publisher, rx) = NotificationPublisher::channel(config.queue_capacity);
        let service = PageWindowService::new(materializer, publisher, config);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(reconcile_worker(Arc::clone(&reconciler), rx, shutdown_rx));

        tracing::info!(
            window_size = config.window_size,
            frames_per_page = config.frames_per_page,
            queue_capacity = config.queue_capacity,
            staging_dir = %config.staging_dir.display(),
            "Engine started"
        );

        Ok(Self {
            service,
            reconciler,
            shutdown_tx,
            worker,
        })
    }

    pub fn service(&self) -> &PageWindowService<D, S> {
        &self.service
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<D, S>> {
        &self.reconciler
    }

    /// Stop after the reconciliation in flight; queued notifications are
    /// dropped.
    pub async fn shutdown(self) -> TiffsterResult<WorkerSnapshot> {
        // The worker may already have exited, in which case nobody listens.
        let _ = self.shutdown_tx.send(true);
        join(self.worker).await
    }

    /// Close the queue and wait until every queued notification has been
    /// reconciled.
    pub async fn drain(self) -> TiffsterResult<WorkerSnapshot> {
        let Self {
            service,
            shutdown_tx,
            worker,
            ..
        } = self;
        drop(service);
        let snapshot = join(worker).await;
        drop(shutdown_tx);
        snapshot
    }
}

async fn join(worker: JoinHandle<Arc<WorkerMetrics>>) -> TiffsterResult<WorkerSnapshot> {
    worker
        .await
        .map(|metrics| metrics.snapshot())
        .map_err(|e| {
            TiffsterError::Storage(StorageError::TaskFailed {
                reason: e.to_string(),
            })
        })
}
