//! Tiffster Test Utilities
//!
//! Centralized test infrastructure for the Tiffster workspace:
//! - In-memory fakes for the container decoder and remote object store, with
//!   call counters and failure injection
//! - Proptest generators for pages, windows and notifications
//! - Test fixtures wiring a cache, stage and fakes over a temp directory
//! - Custom assertions for Tiffster-specific outcomes

pub use tiffster_core::{
    compute_window, EngineConfig, FrameOffset, ImageDescriptor, IndexError, PageChanged,
    PageNumber, ReconcilePhase, RemoteRef, RetryConfig, StorageError, TiffsterError,
    TiffsterResult, ValidationError, WindowState,
};
pub use tiffster_storage::{
    ContainerDecoder, DocumentCache, FrameEntry, LocalStage, PageMaterializer, Raster,
    RemoteObjectStore,
};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

// ============================================================================
// FAILURE INJECTION
// ============================================================================

/// Number of upcoming calls that should fail.
#[derive(Debug, Default)]
pub struct FailureBudget(AtomicUsize);

impl FailureBudget {
    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }

    /// Fail every call until reset.
    pub fn fail_always(&self) {
        self.0.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Consume one failure if any remain.
    pub fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

// ============================================================================
// FAKE CONTAINER DECODER
// ============================================================================

const FAKE_STRIDE: u64 = 0x100;

/// Frame dimensions of one fake container.
#[derive(Debug, Clone)]
pub struct FakeHandle {
    frames: Arc<Vec<(u32, u32)>>,
}

/// In-memory container decoder.
///
/// Containers are registered by path with a frame count; offsets are spaced
/// `0x100` apart so they never coincide with sequence indices. Decoded
/// frames are small gray rasters.
#[derive(Debug, Default)]
pub struct FakeDecoder {
    containers: Mutex<HashMap<PathBuf, Arc<Vec<(u32, u32)>>>>,
    opens: AtomicUsize,
    reads: AtomicUsize,
    decodes: AtomicUsize,
    pub open_failures: FailureBudget,
    pub decode_failures: FailureBudget,
    fail_read_at: Mutex<Option<FrameOffset>>,
}

impl FakeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container of `frames` 4x4 frames at `path`.
    pub fn add_container(&self, path: impl Into<PathBuf>, frames: usize) {
        self.containers
            .lock()
            .unwrap()
            .insert(path.into(), Arc::new(vec![(4, 4); frames]));
    }

    /// Fail `read_entry_at` for the frame at 1-based `sequence_index`.
    pub fn fail_read_at_frame(&self, sequence_index: u64) {
        *self.fail_read_at.lock().unwrap() = Some(Self::offset_of(sequence_index));
    }

    pub fn clear_read_failure(&self) {
        *self.fail_read_at.lock().unwrap() = None;
    }

    /// Offset the fake assigns to a 1-based frame position.
    pub fn offset_of(sequence_index: u64) -> FrameOffset {
        FrameOffset(sequence_index * FAKE_STRIDE)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    fn frame_index(handle: &FakeHandle, offset: FrameOffset) -> TiffsterResult<usize> {
        let index = (offset.get() / FAKE_STRIDE) as usize;
        if offset.get() % FAKE_STRIDE != 0 || index == 0 || index > handle.frames.len() {
            return Err(IndexError::ContainerRead {
                reason: format!("no frame at {}", offset),
            }
            .into());
        }
        Ok(index - 1)
    }
}

#[async_trait]
impl ContainerDecoder for FakeDecoder {
    type Handle = FakeHandle;

    async fn open(&self, path: &Path) -> TiffsterResult<FakeHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let not_openable = |reason: &str| {
            TiffsterError::Index(IndexError::ContainerOpen {
                path: path.display().to_string(),
                reason: reason.to_string(),
            })
        };

        if self.open_failures.take() {
            return Err(not_openable("injected failure"));
        }
        let frames = self
            .containers
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| not_openable("no such container"))?;
        Ok(FakeHandle { frames })
    }

    async fn first_entry_offset(&self, handle: &FakeHandle) -> TiffsterResult<Option<FrameOffset>> {
        Ok((!handle.frames.is_empty()).then(|| Self::offset_of(1)))
    }

    async fn read_entry_at(
        &self,
        handle: &FakeHandle,
        offset: FrameOffset,
    ) -> TiffsterResult<FrameEntry> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if *self.fail_read_at.lock().unwrap() == Some(offset) {
            return Err(IndexError::ContainerRead {
                reason: format!("injected failure at {}", offset),
            }
            .into());
        }

        let index = Self::frame_index(handle, offset)?;
        let (width, height) = handle.frames[index];
        let next = (index + 1 < handle.frames.len())
            .then(|| Self::offset_of(index as u64 + 2));
        Ok(FrameEntry {
            width,
            height,
            next,
        })
    }

    async fn decode_frame(&self, handle: &FakeHandle, offset: FrameOffset) -> TiffsterResult<Raster> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if self.decode_failures.take() {
            return Err(StorageError::Decode {
                offset: offset.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }

        let index = Self::frame_index(handle, offset)?;
        let (width, height) = handle.frames[index];
        let shade = (index * 16 % 256) as u8;
        Ok(Raster::gray(
            width,
            height,
            vec![shade; (width * height) as usize],
        ))
    }
}

// ============================================================================
// IN-MEMORY OBJECT STORE
// ============================================================================

const MEMORY_SCHEME: &str = "mem://";

/// Remote object store kept in memory, with call counters.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    uploads: AtomicUsize,
    deletes: AtomicUsize,
    downloads: AtomicUsize,
    pub upload_failures: FailureBudget,
    pub delete_failures: FailureBudget,
    pub download_failures: FailureBudget,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing the counters.
    pub fn insert(&self, name: &str, bytes: Vec<u8>) -> RemoteRef {
        self.objects.lock().unwrap().insert(name.to_string(), bytes);
        RemoteRef::new(format!("{}{}", MEMORY_SCHEME, name))
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, reference: &RemoteRef) -> bool {
        reference
            .as_str()
            .strip_prefix(MEMORY_SCHEME)
            .map_or(false, |name| self.objects.lock().unwrap().contains_key(name))
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteObjectStore for MemoryObjectStore {
    async fn upload(&self, local_path: &Path) -> TiffsterResult<RemoteRef> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let upload_failed = |reason: String| {
            TiffsterError::Storage(StorageError::Upload {
                path: local_path.display().to_string(),
                reason,
            })
        };

        if self.upload_failures.take() {
            return Err(upload_failed("injected failure".to_string()));
        }
        let name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| upload_failed("no file name".to_string()))?
            .to_string();
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| upload_failed(e.to_string()))?;

        Ok(self.insert(&name, bytes))
    }

    async fn delete(&self, reference: &RemoteRef) -> TiffsterResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.delete_failures.take() {
            return Err(StorageError::RemoteDelete {
                reference: reference.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }

        let name = reference.as_str().strip_prefix(MEMORY_SCHEME).ok_or_else(|| {
            ValidationError::MalformedRemoteRef {
                reference: reference.to_string(),
            }
        })?;
        self.objects.lock().unwrap().remove(name);
        Ok(())
    }

    async fn download(&self, reference: &RemoteRef, destination: &Path) -> TiffsterResult<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let download_failed = |reason: String| {
            TiffsterError::Storage(StorageError::Download {
                reference: reference.to_string(),
                reason,
            })
        };

        if self.download_failures.take() {
            return Err(download_failed("injected failure".to_string()));
        }
        let name = reference.as_str().strip_prefix(MEMORY_SCHEME).ok_or_else(|| {
            ValidationError::MalformedRemoteRef {
                reference: reference.to_string(),
            }
        })?;
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| download_failed("no such object".to_string()))?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| download_failed(e.to_string()))?;
        }
        tokio::fs::write(destination, bytes)
            .await
            .map_err(|e| download_failed(e.to_string()))
    }

    /// Names containing `/` are folder entries and survive the sweep.
    async fn remove_all_except(&self, prefix: &str) -> TiffsterResult<usize> {
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|name, _| name.contains('/') || name.starts_with(prefix));
        Ok(before - objects.len())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for pages, windows and notifications.

    use super::*;
    use proptest::prelude::*;

    /// A plausible document id (what the container was uploaded as).
    pub fn arb_document_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{2,11}"
    }

    pub fn arb_window_size() -> impl Strategy<Value = u32> {
        1u32..8
    }

    pub fn arb_frames_per_page() -> impl Strategy<Value = u32> {
        1u32..5
    }

    /// Total pages, or `None` when the document has not been fully indexed.
    pub fn arb_total_pages() -> impl Strategy<Value = Option<PageNumber>> {
        prop_oneof![
            1 => Just(None),
            4 => (1i64..200).prop_map(Some),
        ]
    }

    /// A valid notification for `document_id` within `1..=total_pages`.
    pub fn arb_page_changed(
        document_id: String,
        total_pages: PageNumber,
    ) -> impl Strategy<Value = PageChanged> {
        (1..=total_pages).prop_map(move |page| PageChanged::new(document_id.clone(), page))
    }

    /// A notification that fails validation.
    pub fn arb_malformed_page_changed() -> impl Strategy<Value = PageChanged> {
        prop_oneof![
            (-50i64..=0).prop_map(|page| PageChanged::new("doc", page)),
            ("[ \t]{0,3}", 1i64..50).prop_map(|(id, page)| PageChanged::new(id, page)),
            ("(\\.\\./)?[a-z]{1,6}/[a-z]{1,6}", 1i64..50)
                .prop_map(|(id, page)| PageChanged::new(id, page)),
        ]
    }

    /// A navigation sequence of `1..=max_len` pages within `1..=total_pages`.
    pub fn arb_navigation(
        total_pages: PageNumber,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<PageNumber>> {
        prop::collection::vec(1..=total_pages, 1..=max_len)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built harnesses for common testing scenarios.

    use super::*;
    use tempfile::TempDir;

    /// Document id used by fixtures unless a test picks its own.
    pub const DOCUMENT_ID: &str = "scan";

    /// Cache, stage and fakes over a fresh temp directory.
    pub struct Harness {
        pub dir: TempDir,
        pub stage: LocalStage,
        pub cache: DocumentCache,
        pub decoder: Arc<FakeDecoder>,
        pub store: Arc<MemoryObjectStore>,
    }

    impl Harness {
        pub fn new() -> Self {
            let dir = TempDir::new().expect("temp dir");
            let stage = LocalStage::new(dir.path().join("jpg"), dir.path().join("tiff"));
            Self {
                dir,
                stage,
                cache: DocumentCache::new(),
                decoder: Arc::new(FakeDecoder::new()),
                store: Arc::new(MemoryObjectStore::new()),
            }
        }

        /// Register a fake container of `frames` frames for `document_id`.
        pub fn with_document(self, document_id: &str, frames: usize) -> Self {
            self.decoder
                .add_container(self.stage.container_path(document_id), frames);
            self
        }

        /// Activate and index `document_id`.
        pub async fn index(&self, document_id: &str, frames_per_page: u32) -> TiffsterResult<usize> {
            self.cache.activate(document_id)?;
            self.cache
                .index_container(document_id, self.decoder.as_ref(), &self.stage, frames_per_page)
                .await
        }

        pub fn materializer(&self) -> PageMaterializer<FakeDecoder, MemoryObjectStore> {
            PageMaterializer::new(
                Arc::clone(&self.decoder),
                Arc::clone(&self.store),
                self.stage.clone(),
                self.cache.clone(),
            )
        }

        /// Engine config rooted in the harness directory.
        pub fn config(&self) -> EngineConfig {
            EngineConfig::default()
                .with_staging_dir(self.stage.staging_dir())
                .with_container_dir(self.stage.container_dir())
                .with_remote_dir(self.dir.path().join("remote"))
                .with_retry(fast_retry(3))
        }

        /// Staged files for the active document's descriptors of `page`.
        pub fn staged_files(&self, page: PageNumber) -> Vec<PathBuf> {
            self.cache
                .page(page)
                .expect("cache readable")
                .map(|entry| {
                    entry
                        .descriptors
                        .into_iter()
                        .map(|d| d.local_path)
                        .filter(|path| path.exists())
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    impl Default for Harness {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Retry policy with millisecond backoff so tests stay fast.
    pub fn fast_retry(retry_count: u32) -> RetryConfig {
        RetryConfig::new(retry_count, 2).with_backoff_unit(std::time::Duration::from_millis(1))
    }

    /// The nine-frame, three-frames-per-page document used throughout the
    /// reconciliation scenarios (pages 1, 2, 3).
    pub async fn nine_frame_document() -> Harness {
        let harness = Harness::new().with_document(DOCUMENT_ID, 9);
        harness.index(DOCUMENT_ID, 3).await.expect("index nine frames");
        harness
    }

    /// Write a real multi-page gray TIFF with `frames` frames of
    /// `width`x`height`.
    pub fn write_multipage_tiff(path: &Path, frames: usize, width: u32, height: u32) {
        use tiff::encoder::{colortype, TiffEncoder};

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("container dir");
        }
        let file = std::fs::File::create(path).expect("create tiff");
        let mut encoder = TiffEncoder::new(file).expect("tiff encoder");
        for frame in 0..frames {
            let pixels = vec![(frame * 20 % 256) as u8; (width * height) as usize];
            encoder
                .write_image::<colortype::Gray8>(width, height, &pixels)
                .expect("write frame");
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for Tiffster-specific outcomes.

    use super::*;

    /// Assert that a result failed with `NotIndexed`.
    #[track_caller]
    pub fn assert_not_indexed<T: std::fmt::Debug>(result: &TiffsterResult<T>) {
        match result {
            Err(e) if e.is_not_indexed() => {}
            other => panic!("Expected NotIndexed error, got: {:?}", other),
        }
    }

    /// Assert that a result is a reconciliation aborted in `phase`.
    #[track_caller]
    pub fn assert_aborted<T: std::fmt::Debug>(result: &TiffsterResult<T>, phase: ReconcilePhase) {
        match result {
            Err(TiffsterError::Aborted { phase: actual, .. }) => {
                assert_eq!(*actual, phase, "Aborted in the wrong phase");
            }
            other => panic!("Expected reconciliation aborted while {}, got: {:?}", phase, other),
        }
    }

    /// Assert that the committed window is exactly what the window
    /// arithmetic yields for the committed page.
    #[track_caller]
    pub fn assert_window_consistent(state: &WindowState, window_size: u32) {
        let page = state.current_page.expect("a committed page");
        let expected = compute_window(page, window_size, state.total_pages);
        assert_eq!(
            state.current_window.as_ref(),
            Some(&expected),
            "Committed window does not match page {}",
            page
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_budget_counts_down() {
        let budget = FailureBudget::default();
        assert!(!budget.take());

        budget.fail_next(2);
        assert!(budget.take());
        assert!(budget.take());
        assert!(!budget.take());

        budget.fail_always();
        for _ in 0..10 {
            assert!(budget.take());
        }
        budget.reset();
        assert!(!budget.take());
    }

    #[tokio::test]
    async fn test_fake_decoder_walks_chain() {
        let decoder = FakeDecoder::new();
        decoder.add_container("/c/doc.tif", 3);
        let handle = decoder.open(Path::new("/c/doc.tif")).await.unwrap();

        let mut offset = decoder.first_entry_offset(&handle).await.unwrap();
        let mut seen = Vec::new();
        while let Some(current) = offset {
            seen.push(current);
            offset = decoder.read_entry_at(&handle, current).await.unwrap().next;
        }
        assert_eq!(
            seen,
            vec![
                FakeDecoder::offset_of(1),
                FakeDecoder::offset_of(2),
                FakeDecoder::offset_of(3)
            ]
        );
    }
}
