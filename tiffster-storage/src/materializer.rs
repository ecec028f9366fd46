//! Page materialization and eviction.
//!
//! A page is resident once every descriptor has a staged local file and a
//! remote mirror. Work fans out per descriptor and is joined before the call
//! returns; the first failure fails the call, but finished work is kept, so
//! retrying a call only redoes what is still missing.
//!
//! Every call names the document it was planned for. A call for a document
//! that is no longer active fails with `InactiveDocument` before touching
//! anything, and mirrors that finish after a switch are deleted again.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use tiffster_core::{
    ImageDescriptor, IndexError, PageNumber, RemoteRef, SequenceIndex, TiffsterError,
    TiffsterResult,
};

use crate::document::DocumentCache;
use crate::stage::LocalStage;
use crate::traits::{ContainerDecoder, RemoteObjectStore};

/// Residency operations the reconciler drives.
#[async_trait]
pub trait PageResidency: Send + Sync {
    /// Decode, stage and mirror every descriptor of `pages` of
    /// `document_id`.
    ///
    /// Returns the refreshed descriptors. Fails with `NotIndexed` if any page
    /// is missing from the index.
    async fn ensure_resident(
        &self,
        document_id: &str,
        pages: &[PageNumber],
    ) -> TiffsterResult<Vec<ImageDescriptor>>;

    /// Remove remote mirrors and local files of `pages` of `document_id`.
    ///
    /// Pages that are not indexed or already evicted are skipped. Returns the
    /// number of descriptors that had something removed.
    async fn evict(&self, document_id: &str, pages: &[PageNumber]) -> TiffsterResult<usize>;
}

/// Objects reclaimed by [`PageMaterializer::purge_foreign`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub local: usize,
    pub remote: usize,
}

pub struct PageMaterializer<D, S>
where
    D: ContainerDecoder,
    S: RemoteObjectStore,
{
    decoder: Arc<D>,
    store: Arc<S>,
    stage: LocalStage,
    cache: DocumentCache,
}

impl<D, S> PageMaterializer<D, S>
where
    D: ContainerDecoder,
    S: RemoteObjectStore,
{
    pub fn new(decoder: Arc<D>, store: Arc<S>, stage: LocalStage, cache: DocumentCache) -> Self {
        Self {
            decoder,
            store,
            stage,
            cache,
        }
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn stage(&self) -> &LocalStage {
        &self.stage
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reclaim local files and remote objects that do not belong to the
    /// document identified by `prefix`. Best-effort: failures are logged.
    pub async fn purge_foreign(&self, prefix: &str) -> PurgeReport {
        let local = self.stage.purge_foreign(prefix).await;
        let remote = match self.store.remove_all_except(prefix).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(prefix, error = %e, "Remote purge failed");
                0
            }
        };

        let report = PurgeReport { local, remote };
        tracing::info!(prefix, local, remote, "Purged foreign objects");
        report
    }

    async fn materialize_one(
        &self,
        document_id: &str,
        descriptor: &ImageDescriptor,
        decode_from: Option<&D::Handle>,
    ) -> TiffsterResult<()> {
        if let Some(handle) = decode_from {
            let raster = self.decoder.decode_frame(handle, descriptor.offset).await?;
            self.stage.write_raster(&descriptor.local_path, raster).await?;
        }

        if descriptor.remote_ref.is_none() {
            let reference = self.store.upload(&descriptor.local_path).await?;
            tracing::debug!(
                document_id,
                page = descriptor.page_number,
                sequence_index = descriptor.sequence_index,
                remote_ref = %reference,
                "Mirrored frame"
            );
            let recorded = self.cache.record_remote_ref(
                document_id,
                descriptor.page_number,
                descriptor.sequence_index,
                Some(reference.clone()),
            )?;
            if !recorded {
                self.discard_orphan(document_id, &reference).await;
                return Err(self.inactive(document_id)?);
            }
        }

        Ok(())
    }

    async fn evict_one(&self, document_id: &str, descriptor: &ImageDescriptor) -> TiffsterResult<bool> {
        let Some(reference) = &descriptor.remote_ref else {
            return self.stage.remove(&descriptor.local_path).await;
        };

        self.store.delete(reference).await?;
        self.stage.remove(&descriptor.local_path).await?;
        self.cache.record_remote_ref(
            document_id,
            descriptor.page_number,
            descriptor.sequence_index,
            None,
        )?;
        Ok(true)
    }

    async fn unstaged(&self, descriptors: &[ImageDescriptor]) -> HashSet<SequenceIndex> {
        let mut missing = HashSet::new();
        for descriptor in descriptors {
            if !self.stage.exists(&descriptor.local_path).await {
                missing.insert(descriptor.sequence_index);
            }
        }
        missing
    }

    /// Delete a mirror whose descriptor vanished with a document switch.
    async fn discard_orphan(&self, document_id: &str, reference: &RemoteRef) {
        match self.store.delete(reference).await {
            Ok(()) => {
                tracing::info!(document_id, remote_ref = %reference, "Discarded mirror of inactive document");
            }
            Err(e) => {
                tracing::warn!(document_id, remote_ref = %reference, error = %e, "Failed to discard orphaned mirror");
            }
        }
    }

    fn inactive(&self, document_id: &str) -> TiffsterResult<TiffsterError> {
        Ok(IndexError::InactiveDocument {
            document_id: document_id.to_string(),
            active: self.cache.active_document()?,
        }
        .into())
    }

    fn require_active(&self, document_id: &str) -> TiffsterResult<()> {
        if self.cache.is_active(document_id)? {
            Ok(())
        } else {
            Err(self.inactive(document_id)?)
        }
    }
}

#[async_trait]
impl<D, S> PageResidency for PageMaterializer<D, S>
where
    D: ContainerDecoder,
    S: RemoteObjectStore,
{
    async fn ensure_resident(
        &self,
        document_id: &str,
        pages: &[PageNumber],
    ) -> TiffsterResult<Vec<ImageDescriptor>> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }

        self.require_active(document_id)?;
        let descriptors = self.cache.descriptors_for(pages)?;
        let missing = self.unstaged(&descriptors).await;

        // Only open the container when something actually needs decoding.
        let handle = if missing.is_empty() {
            None
        } else {
            Some(
                self.decoder
                    .open(&self.stage.container_path(document_id))
                    .await?,
            )
        };

        try_join_all(descriptors.iter().map(|descriptor| {
            let decode_from = handle
                .as_ref()
                .filter(|_| missing.contains(&descriptor.sequence_index));
            self.materialize_one(document_id, descriptor, decode_from)
        }))
        .await?;

        tracing::debug!(
            document_id,
            ?pages,
            frames = descriptors.len(),
            decoded = missing.len(),
            "Pages resident"
        );
        // A switch while the fan-out ran leaves the returned index foreign.
        self.require_active(document_id)?;
        self.cache.descriptors_for(pages)
    }

    async fn evict(&self, document_id: &str, pages: &[PageNumber]) -> TiffsterResult<usize> {
        self.require_active(document_id)?;

        let descriptors = self.cache.existing_descriptors(pages)?;
        let removed = try_join_all(
            descriptors
                .iter()
                .map(|descriptor| self.evict_one(document_id, descriptor)),
        )
        .await?
        .into_iter()
        .filter(|removed| *removed)
        .count();

        tracing::debug!(document_id, ?pages, removed, "Pages evicted");
        Ok(removed)
    }
}
