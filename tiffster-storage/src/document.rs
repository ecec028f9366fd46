//! Document cache: the page metadata index and window state of the single
//! active document.
//!
//! The page map is built once per document by walking the container's frame
//! chain. Materialization mutates descriptors' remote references in place;
//! descriptors are never added or removed after indexing. The window state
//! is written only by the reconciler.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_stream::try_stream;
use futures_util::{pin_mut, Stream, StreamExt};
use tiffster_core::{
    page_number_for, DocumentId, ImageDescriptor, IndexError, PageEntry, PageNumber, RemoteRef,
    SequenceIndex, StorageError, TiffsterError, TiffsterResult, WindowState,
};

use crate::stage::LocalStage;
use crate::traits::ContainerDecoder;

#[derive(Debug, Default)]
struct CacheState {
    document_id: Option<DocumentId>,
    pages: BTreeMap<PageNumber, PageEntry>,
    window: WindowState,
}

impl CacheState {
    fn is_active(&self, document_id: &str) -> bool {
        self.document_id.as_deref() == Some(document_id)
    }
}

/// Shared handle to the active document's index and window.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct DocumentCache {
    inner: Arc<RwLock<CacheState>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> TiffsterResult<RwLockReadGuard<'_, CacheState>> {
        self.inner
            .read()
            .map_err(|_| TiffsterError::Storage(StorageError::LockPoisoned))
    }

    fn write(&self) -> TiffsterResult<RwLockWriteGuard<'_, CacheState>> {
        self.inner
            .write()
            .map_err(|_| TiffsterError::Storage(StorageError::LockPoisoned))
    }

    // ========================================================================
    // DOCUMENT LIFECYCLE
    // ========================================================================

    /// Make `document_id` the active document.
    ///
    /// A different document replaces all state wholesale. Returns `true` if
    /// the active document changed.
    pub fn activate(&self, document_id: &str) -> TiffsterResult<bool> {
        let mut state = self.write()?;
        if state.is_active(document_id) {
            return Ok(false);
        }

        let previous = state.document_id.replace(document_id.to_string());
        state.pages.clear();
        state.window = WindowState::default();
        tracing::info!(
            document_id,
            previous = previous.as_deref().unwrap_or("-"),
            "Activated document"
        );
        Ok(true)
    }

    pub fn active_document(&self) -> TiffsterResult<Option<DocumentId>> {
        Ok(self.read()?.document_id.clone())
    }

    pub fn is_active(&self, document_id: &str) -> TiffsterResult<bool> {
        Ok(self.read()?.is_active(document_id))
    }

    // ========================================================================
    // INDEXING
    // ========================================================================

    /// Append a descriptor discovered while walking the container.
    ///
    /// `total_pages` tracks the highest page seen so far.
    pub fn append_descriptor(&self, descriptor: ImageDescriptor) -> TiffsterResult<()> {
        let mut state = self.write()?;
        let page = descriptor.page_number;
        state
            .pages
            .entry(page)
            .or_insert_with(|| PageEntry::new(page))
            .push(descriptor);
        state.window.total_pages = Some(page);
        Ok(())
    }

    /// Drop the page map and the page count.
    pub fn clear_index(&self) -> TiffsterResult<()> {
        let mut state = self.write()?;
        state.pages.clear();
        state.window.total_pages = None;
        Ok(())
    }

    /// Build the page map for `document_id` from its container.
    ///
    /// Re-indexing always starts from scratch. On failure the index is left
    /// empty so that no partial map is reused.
    pub async fn index_container<D: ContainerDecoder>(
        &self,
        document_id: &str,
        decoder: &D,
        stage: &LocalStage,
        frames_per_page: u32,
    ) -> TiffsterResult<usize> {
        self.clear_index()?;

        match self
            .walk_into_index(document_id, decoder, stage, frames_per_page)
            .await
        {
            Ok(count) => {
                let total_pages = self.total_pages()?;
                tracing::info!(document_id, frames = count, ?total_pages, "Indexed container");
                Ok(count)
            }
            Err(e) => {
                tracing::error!(document_id, error = %e, "Indexing failed, index cleared");
                self.clear_index()?;
                Err(e)
            }
        }
    }

    async fn walk_into_index<D: ContainerDecoder>(
        &self,
        document_id: &str,
        decoder: &D,
        stage: &LocalStage,
        frames_per_page: u32,
    ) -> TiffsterResult<usize> {
        let path = stage.container_path(document_id);
        let handle = decoder.open(&path).await?;

        let descriptors = walk_container(decoder, &handle, stage, document_id, frames_per_page);
        pin_mut!(descriptors);

        let mut count = 0;
        while let Some(descriptor) = descriptors.next().await {
            self.append_descriptor(descriptor?)?;
            count += 1;
        }
        Ok(count)
    }

    // ========================================================================
    // READ SURFACE
    // ========================================================================

    pub fn page(&self, page: PageNumber) -> TiffsterResult<Option<PageEntry>> {
        Ok(self.read()?.pages.get(&page).cloned())
    }

    pub fn is_indexed(&self, page: PageNumber) -> TiffsterResult<bool> {
        Ok(self.read()?.pages.contains_key(&page))
    }

    pub fn window_state(&self) -> TiffsterResult<WindowState> {
        Ok(self.read()?.window.clone())
    }

    pub fn current_page(&self) -> TiffsterResult<Option<PageNumber>> {
        Ok(self.read()?.window.current_page)
    }

    pub fn current_window(&self) -> TiffsterResult<Option<Vec<PageNumber>>> {
        Ok(self.read()?.window.current_window.clone())
    }

    /// Highest page indexed so far; final only once indexing has completed.
    pub fn total_pages(&self) -> TiffsterResult<Option<PageNumber>> {
        Ok(self.read()?.window.total_pages)
    }

    /// Descriptors of every requested page, in page then sequence order.
    ///
    /// Fails with `NotIndexed` on the first page missing from the map.
    pub fn descriptors_for(&self, pages: &[PageNumber]) -> TiffsterResult<Vec<ImageDescriptor>> {
        let state = self.read()?;
        let mut descriptors = Vec::new();
        for page in pages {
            let entry = state
                .pages
                .get(page)
                .ok_or(IndexError::NotIndexed { page: *page })?;
            descriptors.extend(entry.descriptors.iter().cloned());
        }
        Ok(descriptors)
    }

    /// Like [`descriptors_for`](Self::descriptors_for) but skips pages that
    /// are not indexed.
    pub fn existing_descriptors(&self, pages: &[PageNumber]) -> TiffsterResult<Vec<ImageDescriptor>> {
        let state = self.read()?;
        Ok(pages
            .iter()
            .filter_map(|page| state.pages.get(page))
            .flat_map(|entry| entry.descriptors.iter().cloned())
            .collect())
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Record (or clear) the remote mirror of one descriptor.
    ///
    /// Ignored if `document_id` is no longer active. Returns whether the
    /// descriptor was updated.
    pub fn record_remote_ref(
        &self,
        document_id: &str,
        page: PageNumber,
        sequence_index: SequenceIndex,
        remote_ref: Option<RemoteRef>,
    ) -> TiffsterResult<bool> {
        let mut state = self.write()?;
        if !state.is_active(document_id) {
            return Ok(false);
        }
        let Some(descriptor) = state
            .pages
            .get_mut(&page)
            .and_then(|entry| entry.descriptor_mut(sequence_index))
        else {
            return Ok(false);
        };
        descriptor.remote_ref = remote_ref;
        Ok(true)
    }

    /// Commit a reconciled window.
    ///
    /// Returns `false` without writing if another document became active in
    /// the meantime.
    pub fn commit_window(
        &self,
        document_id: &str,
        page: PageNumber,
        window: Vec<PageNumber>,
    ) -> TiffsterResult<bool> {
        let mut state = self.write()?;
        if !state.is_active(document_id) {
            return Ok(false);
        }
        state.window.commit(page, window);
        Ok(true)
    }
}

/// Lazily walk a container's frame chain, yielding one descriptor per frame.
///
/// Sequence indices start at 1 in chain order. The stream is consumed once;
/// walking again decodes the chain from the start.
pub fn walk_container<'a, D: ContainerDecoder>(
    decoder: &'a D,
    handle: &'a D::Handle,
    stage: &'a LocalStage,
    document_id: &'a str,
    frames_per_page: u32,
) -> impl Stream<Item = TiffsterResult<ImageDescriptor>> + Send + 'a {
    try_stream! {
        let mut next = decoder.first_entry_offset(handle).await?;
        let mut sequence_index: SequenceIndex = 0;

        while let Some(offset) = next {
            let entry = decoder.read_entry_at(handle, offset).await?;
            sequence_index += 1;
            let page = page_number_for(sequence_index, frames_per_page);
            let local_path = stage.frame_path(document_id, page, sequence_index);

            tracing::trace!(document_id, sequence_index, page, %offset, width = entry.width, height = entry.height, "Indexed frame");
            yield ImageDescriptor::new(offset, sequence_index, page, local_path);

            next = entry.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tiffster_core::FrameOffset;

    fn descriptor(sequence_index: SequenceIndex) -> ImageDescriptor {
        let page = page_number_for(sequence_index, 3);
        ImageDescriptor::new(
            FrameOffset(sequence_index as u64),
            sequence_index,
            page,
            PathBuf::from(format!("doc_{}_{}.jpg", page, sequence_index)),
        )
    }

    fn indexed(frames: SequenceIndex) -> DocumentCache {
        let cache = DocumentCache::new();
        cache.activate("doc").unwrap();
        for i in 1..=frames {
            cache.append_descriptor(descriptor(i)).unwrap();
        }
        cache
    }

    #[test]
    fn test_append_tracks_best_known_total() {
        let cache = DocumentCache::new();
        cache.activate("doc").unwrap();
        assert_eq!(cache.total_pages().unwrap(), None);

        cache.append_descriptor(descriptor(1)).unwrap();
        assert_eq!(cache.total_pages().unwrap(), Some(1));

        for i in 2..=4 {
            cache.append_descriptor(descriptor(i)).unwrap();
        }
        assert_eq!(cache.total_pages().unwrap(), Some(2));
        assert_eq!(cache.page(1).unwrap().unwrap().descriptors.len(), 3);
        assert_eq!(cache.page(2).unwrap().unwrap().descriptors.len(), 1);
    }

    #[test]
    fn test_activate_replaces_state_wholesale() {
        let cache = indexed(9);
        assert!(cache.commit_window("doc", 2, vec![1, 2, 3]).unwrap());

        assert!(!cache.activate("doc").unwrap());
        assert!(cache.is_indexed(1).unwrap());

        assert!(cache.activate("other").unwrap());
        assert_eq!(cache.active_document().unwrap().as_deref(), Some("other"));
        assert!(!cache.is_indexed(1).unwrap());
        assert_eq!(cache.window_state().unwrap(), WindowState::default());
    }

    #[test]
    fn test_descriptors_for_requires_every_page() {
        let cache = indexed(6);
        assert_eq!(cache.descriptors_for(&[1, 2]).unwrap().len(), 6);

        let err = cache.descriptors_for(&[2, 3]).unwrap_err();
        assert!(err.is_not_indexed());

        let existing = cache.existing_descriptors(&[2, 3]).unwrap();
        assert_eq!(existing.len(), 3);
        assert!(existing.iter().all(|d| d.page_number == 2));
    }

    #[test]
    fn test_record_remote_ref_only_for_active_document() {
        let cache = indexed(3);
        let reference = RemoteRef::new("fs://doc_1_2.jpg");

        assert!(cache
            .record_remote_ref("doc", 1, 2, Some(reference.clone()))
            .unwrap());
        let entry = cache.page(1).unwrap().unwrap();
        assert_eq!(entry.descriptors[1].remote_ref, Some(reference.clone()));

        assert!(!cache.record_remote_ref("stale", 1, 3, Some(reference.clone())).unwrap());
        assert!(!cache.record_remote_ref("doc", 1, 9, Some(reference)).unwrap());
        assert!(cache.page(1).unwrap().unwrap().descriptors[2].remote_ref.is_none());
    }

    #[test]
    fn test_commit_window_rejects_superseded_document() {
        let cache = indexed(9);
        cache.activate("other").unwrap();

        assert!(!cache.commit_window("doc", 2, vec![1, 2, 3]).unwrap());
        assert_eq!(cache.current_window().unwrap(), None);

        assert!(cache.commit_window("other", 1, vec![1, 2, 3]).unwrap());
        assert_eq!(cache.current_page().unwrap(), Some(1));
    }

    #[test]
    fn test_clear_index_keeps_committed_window() {
        let cache = indexed(9);
        cache.commit_window("doc", 2, vec![1, 2, 3]).unwrap();
        cache.clear_index().unwrap();

        assert!(!cache.is_indexed(1).unwrap());
        assert_eq!(cache.total_pages().unwrap(), None);
        assert_eq!(cache.current_window().unwrap(), Some(vec![1, 2, 3]));
    }
}
