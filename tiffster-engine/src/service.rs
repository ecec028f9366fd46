//! Page Window Service
//!
//! Read and on-demand surface in front of the cache. Opening a page makes it
//! resident right away (fetching and indexing the document first if needed)
//! and then publishes a page-changed notification so the worker can
//! reconcile the window around it.

use std::sync::Arc;

use tiffster_core::{
    EngineConfig, ImageDescriptor, IndexError, PageChanged, PageNumber, RemoteRef, TiffsterResult,
    TransportError, WindowState,
};
use tiffster_storage::{
    ContainerDecoder, DocumentCache, PageMaterializer, PageResidency, RemoteObjectStore,
};
use tokio::sync::mpsc;

use crate::reconciler::ReconcileOutcome;
use crate::retry::RetryExecutor;
use crate::worker::Delivery;

pub const OPEN_PAGE_LABEL: &str = "PageWindowService: ensure_resident";
pub const FETCH_CONTAINER_LABEL: &str = "PageWindowService: fetch_container";

// ============================================================================
// PUBLISHER
// ============================================================================

/// Sending half of the reconciliation queue.
#[derive(Debug, Clone)]
pub struct NotificationPublisher {
    tx: mpsc::Sender<Delivery>,
}

impl NotificationPublisher {
    pub fn new(tx: mpsc::Sender<Delivery>) -> Self {
        Self { tx }
    }

    /// Bounded queue of `capacity` deliveries.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Enqueue without waiting for the outcome.
    pub async fn publish(&self, notification: PageChanged) -> TiffsterResult<()> {
        self.tx
            .send(Delivery::new(notification))
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(())
    }

    /// Enqueue and wait for the worker's ack.
    pub async fn publish_and_wait(&self, notification: PageChanged) -> TiffsterResult<ReconcileOutcome> {
        let (delivery, ack) = Delivery::with_ack(notification);
        self.tx
            .send(delivery)
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        ack.await.map_err(|_| TransportError::AckDropped)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Where a requested page stands before it is opened.
enum Lookup {
    Resident(Vec<ImageDescriptor>),
    Indexed,
    Unknown,
}

pub struct PageWindowService<D, S>
where
    D: ContainerDecoder,
    S: RemoteObjectStore,
{
    materializer: Arc<PageMaterializer<D, S>>,
    publisher: NotificationPublisher,
    retry: RetryExecutor,
    frames_per_page: u32,
}

impl<D, S> PageWindowService<D, S>
where
    D: ContainerDecoder,
    S: RemoteObjectStore,
{
    pub fn new(
        materializer: Arc<PageMaterializer<D, S>>,
        publisher: NotificationPublisher,
        config: &EngineConfig,
    ) -> Self {
        Self {
            materializer,
            publisher,
            retry: RetryExecutor::new(config.retry.clone()),
            frames_per_page: config.frames_per_page,
        }
    }

    pub fn cache(&self) -> &DocumentCache {
        self.materializer.cache()
    }

    pub fn publisher(&self) -> &NotificationPublisher {
        &self.publisher
    }

    /// Make `page` of `document_id` resident and return its descriptors.
    ///
    /// The document's container must already be in the container directory.
    pub async fn open_page(&self, document_id: &str, page: PageNumber) -> TiffsterResult<Vec<ImageDescriptor>> {
        self.open_page_from(document_id, page, None).await
    }

    /// Make `page` of `document_id` resident and return its descriptors.
    ///
    /// A document that is not active is activated and indexed from its
    /// container, and everything staged for other documents is purged. When
    /// the container is missing locally it is downloaded from `container`
    /// first. The page-changed notification is published after the page is
    /// resident.
    pub async fn open_page_from(
        &self,
        document_id: &str,
        page: PageNumber,
        container: Option<&RemoteRef>,
    ) -> TiffsterResult<Vec<ImageDescriptor>> {
        let notification = PageChanged::new(document_id, page);
        notification.validate()?;

        let descriptors = match self.lookup(document_id, page)? {
            Lookup::Resident(descriptors) => {
                tracing::debug!(document_id, page, "Page already resident");
                descriptors
            }
            Lookup::Indexed => self.materialize(document_id, page).await?,
            Lookup::Unknown => self.load_document(document_id, page, container).await?,
        };

        if let Err(e) = self.publisher.publish(notification).await {
            // The page is served either way; the window catches up on the
            // next notification that gets through.
            tracing::warn!(document_id, page, error = %e, "Failed to publish page change");
        }

        Ok(descriptors)
    }

    pub fn current_window(&self) -> TiffsterResult<Option<Vec<PageNumber>>> {
        self.cache().current_window()
    }

    pub fn window_state(&self) -> TiffsterResult<WindowState> {
        self.cache().window_state()
    }

    /// Descriptors of `page` for the active document, remote refs included.
    pub fn page_descriptors(&self, page: PageNumber) -> TiffsterResult<Option<Vec<ImageDescriptor>>> {
        Ok(self.cache().page(page)?.map(|entry| entry.descriptors))
    }

    fn lookup(&self, document_id: &str, page: PageNumber) -> TiffsterResult<Lookup> {
        if !self.cache().is_active(document_id)? {
            return Ok(Lookup::Unknown);
        }
        Ok(match self.cache().page(page)? {
            Some(entry) if entry.is_mirrored() => Lookup::Resident(entry.descriptors),
            Some(_) => Lookup::Indexed,
            // A complete index that lacks the page will not gain it by
            // walking the container again.
            None if self.cache().total_pages()?.is_some() => {
                return Err(IndexError::NotIndexed { page }.into());
            }
            None => Lookup::Unknown,
        })
    }

    async fn materialize(&self, document_id: &str, page: PageNumber) -> TiffsterResult<Vec<ImageDescriptor>> {
        let pages = [page];
        self.retry
            .run(OPEN_PAGE_LABEL, || {
                self.materializer.ensure_resident(document_id, &pages)
            })
            .await
    }

    /// Download the container unless a local copy exists.
    async fn fetch_container(&self, document_id: &str, container: &RemoteRef) -> TiffsterResult<()> {
        let stage = self.materializer.stage();
        let path = stage.container_path(document_id);
        if stage.exists(&path).await {
            return Ok(());
        }

        self.retry
            .run(FETCH_CONTAINER_LABEL, || {
                self.materializer.store().download(container, &path)
            })
            .await?;
        tracing::info!(document_id, remote_ref = %container, "Fetched container");
        Ok(())
    }

    async fn load_document(
        &self,
        document_id: &str,
        page: PageNumber,
        container: Option<&RemoteRef>,
    ) -> TiffsterResult<Vec<ImageDescriptor>> {
        if let Some(container) = container {
            self.fetch_container(document_id, container).await?;
        }
        if self.cache().activate(document_id)? {
            tracing::info!(document_id, "Switched active document");
        }

        let frames = self
            .cache()
            .index_container(
                document_id,
                self.materializer.decoder(),
                self.materializer.stage(),
                self.frames_per_page,
            )
            .await?;
        tracing::info!(
            document_id,
            frames,
            total_pages = ?self.cache().total_pages()?,
            "Indexed document"
        );

        let descriptors = self.materialize(document_id, page).await?;
        self.materializer.purge_foreign(document_id).await;
        Ok(descriptors)
    }
}
