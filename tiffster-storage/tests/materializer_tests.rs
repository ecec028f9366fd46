//! Indexing, materialization and eviction against in-memory collaborators.

use tiffster_core::{page_number_for, IndexError, TiffsterError};
use tiffster_storage::PageResidency;
use tiffster_test_utils::assertions::assert_not_indexed;
use tiffster_test_utils::fixtures::{nine_frame_document, Harness, DOCUMENT_ID};
use tiffster_test_utils::FakeDecoder;

// ============================================================================
// INDEXING
// ============================================================================

#[tokio::test]
async fn test_index_groups_frames_into_pages() {
    let harness = nine_frame_document().await;

    assert_eq!(harness.cache.total_pages().unwrap(), Some(3));
    for page in 1..=3 {
        let entry = harness.cache.page(page).unwrap().unwrap();
        let sequence: Vec<_> = entry.descriptors.iter().map(|d| d.sequence_index).collect();
        let first = (page - 1) * 3 + 1;
        assert_eq!(sequence, vec![first, first + 1, first + 2]);
        assert!(entry.descriptors.iter().all(|d| d.remote_ref.is_none()));
    }

    let descriptor = &harness.cache.page(2).unwrap().unwrap().descriptors[0];
    assert_eq!(descriptor.offset, FakeDecoder::offset_of(4));
    assert_eq!(
        descriptor.local_path,
        harness.stage.frame_path(DOCUMENT_ID, 2, 4)
    );
}

#[tokio::test]
async fn test_index_partial_last_page() {
    let harness = Harness::new().with_document("short", 7);
    assert_eq!(harness.index("short", 3).await.unwrap(), 7);

    assert_eq!(harness.cache.total_pages().unwrap(), Some(3));
    assert_eq!(harness.cache.page(3).unwrap().unwrap().descriptors.len(), 1);
    assert_eq!(page_number_for(7, 3), 3);
}

#[tokio::test]
async fn test_index_failure_leaves_index_empty() {
    let harness = Harness::new().with_document(DOCUMENT_ID, 9);
    harness.decoder.fail_read_at_frame(5);

    let err = harness.index(DOCUMENT_ID, 3).await.unwrap_err();
    assert!(matches!(err, TiffsterError::Index(IndexError::ContainerRead { .. })));
    assert!(!harness.cache.is_indexed(1).unwrap());
    assert_eq!(harness.cache.total_pages().unwrap(), None);

    // Rebuilt from scratch once the container reads cleanly.
    harness.decoder.clear_read_failure();
    assert_eq!(harness.index(DOCUMENT_ID, 3).await.unwrap(), 9);
    assert_eq!(harness.cache.total_pages().unwrap(), Some(3));
    assert_eq!(harness.cache.page(1).unwrap().unwrap().descriptors.len(), 3);
}

#[tokio::test]
async fn test_index_missing_container() {
    let harness = Harness::new();
    let err = harness.index("absent", 3).await.unwrap_err();
    assert!(matches!(err, TiffsterError::Index(IndexError::ContainerOpen { .. })));
    assert!(err.is_retryable());
}

// ============================================================================
// ENSURE RESIDENT
// ============================================================================

#[tokio::test]
async fn test_ensure_resident_stages_and_mirrors() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();

    let descriptors = materializer.ensure_resident(DOCUMENT_ID, &[1, 3]).await.unwrap();

    assert_eq!(descriptors.len(), 6);
    assert!(descriptors.iter().all(|d| d.local_path.exists()));
    assert!(descriptors
        .iter()
        .all(|d| harness.store.contains(d.remote_ref.as_ref().unwrap())));
    assert_eq!(harness.decoder.decode_count(), 6);
    assert_eq!(harness.store.upload_count(), 6);
    assert!(harness.cache.page(1).unwrap().unwrap().is_mirrored());
    assert!(!harness.cache.page(2).unwrap().unwrap().is_mirrored());
    assert!(harness.staged_files(2).is_empty());
}

#[tokio::test]
async fn test_ensure_resident_is_idempotent() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();

    materializer.ensure_resident(DOCUMENT_ID, &[2]).await.unwrap();
    let opens = harness.decoder.open_count();
    materializer.ensure_resident(DOCUMENT_ID, &[2]).await.unwrap();

    assert_eq!(harness.decoder.open_count(), opens);
    assert_eq!(harness.decoder.decode_count(), 3);
    assert_eq!(harness.store.upload_count(), 3);
}

#[tokio::test]
async fn test_ensure_resident_redecodes_only_missing_files() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();
    let descriptors = materializer.ensure_resident(DOCUMENT_ID, &[1]).await.unwrap();

    std::fs::remove_file(&descriptors[1].local_path).unwrap();
    materializer.ensure_resident(DOCUMENT_ID, &[1]).await.unwrap();

    assert!(descriptors[1].local_path.exists());
    assert_eq!(harness.decoder.decode_count(), 4);
    // Still mirrored, so nothing is uploaded again.
    assert_eq!(harness.store.upload_count(), 3);
}

#[tokio::test]
async fn test_ensure_resident_not_indexed() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();

    let result = materializer.ensure_resident(DOCUMENT_ID, &[2, 4]).await;
    assert_not_indexed(&result);
    assert!(!result.unwrap_err().is_retryable());
    assert_eq!(harness.store.upload_count(), 0);
}

#[tokio::test]
async fn test_ensure_resident_without_active_document() {
    let harness = Harness::new();
    let err = harness
        .materializer()
        .ensure_resident(DOCUMENT_ID, &[1])
        .await
        .unwrap_err();
    assert!(err.is_inactive_document());
}

#[tokio::test]
async fn test_calls_for_a_replaced_document_touch_nothing() {
    let harness = Harness::new()
        .with_document("old", 6)
        .with_document("new", 6);
    let materializer = harness.materializer();
    harness.index("old", 3).await.unwrap();
    materializer.ensure_resident("old", &[1]).await.unwrap();
    harness.index("new", 3).await.unwrap();
    let (decodes, uploads, deletes) = (
        harness.decoder.decode_count(),
        harness.store.upload_count(),
        harness.store.delete_count(),
    );

    let err = materializer.ensure_resident("old", &[2]).await.unwrap_err();
    match err {
        TiffsterError::Index(IndexError::InactiveDocument {
            document_id,
            active,
        }) => {
            assert_eq!(document_id, "old");
            assert_eq!(active.as_deref(), Some("new"));
        }
        other => panic!("expected InactiveDocument, got {:?}", other),
    }
    assert!(materializer.evict("old", &[1]).await.unwrap_err().is_inactive_document());

    assert_eq!(harness.decoder.decode_count(), decodes);
    assert_eq!(harness.store.upload_count(), uploads);
    assert_eq!(harness.store.delete_count(), deletes);
    assert!(!harness.cache.page(2).unwrap().unwrap().is_mirrored());
}

#[tokio::test]
async fn test_partial_failure_keeps_finished_work() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();
    harness.store.upload_failures.fail_next(1);

    let err = materializer.ensure_resident(DOCUMENT_ID, &[1]).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!harness.cache.page(1).unwrap().unwrap().is_mirrored());

    let descriptors = materializer.ensure_resident(DOCUMENT_ID, &[1]).await.unwrap();

    assert!(harness.cache.page(1).unwrap().unwrap().is_mirrored());
    assert!(descriptors.iter().all(|d| d.local_path.exists()));
    assert_eq!(harness.store.len(), 3);
}

// ============================================================================
// EVICT
// ============================================================================

#[tokio::test]
async fn test_evict_removes_remote_and_local() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();
    let descriptors = materializer.ensure_resident(DOCUMENT_ID, &[1, 2]).await.unwrap();

    let removed = materializer.evict(DOCUMENT_ID, &[1]).await.unwrap();

    assert_eq!(removed, 3);
    assert_eq!(harness.store.delete_count(), 3);
    assert_eq!(harness.store.len(), 3);
    for descriptor in descriptors.iter().filter(|d| d.page_number == 1) {
        assert!(!descriptor.local_path.exists());
        assert!(!harness.store.contains(descriptor.remote_ref.as_ref().unwrap()));
    }
    let page = harness.cache.page(1).unwrap().unwrap();
    assert!(page.descriptors.iter().all(|d| d.remote_ref.is_none()));
    assert!(harness.cache.page(2).unwrap().unwrap().is_mirrored());
}

#[tokio::test]
async fn test_evict_is_idempotent() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();
    materializer.ensure_resident(DOCUMENT_ID, &[3]).await.unwrap();

    assert_eq!(materializer.evict(DOCUMENT_ID, &[3]).await.unwrap(), 3);
    assert_eq!(materializer.evict(DOCUMENT_ID, &[3]).await.unwrap(), 0);
    assert_eq!(harness.store.delete_count(), 3);
}

#[tokio::test]
async fn test_evict_skips_unknown_and_unmaterialized_pages() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();

    assert_eq!(materializer.evict(DOCUMENT_ID, &[2, 7, 40]).await.unwrap(), 0);
    assert_eq!(harness.store.delete_count(), 0);
}

#[tokio::test]
async fn test_evict_failure_keeps_reference() {
    let harness = nine_frame_document().await;
    let materializer = harness.materializer();
    materializer.ensure_resident(DOCUMENT_ID, &[1]).await.unwrap();
    harness.store.delete_failures.fail_always();

    assert!(materializer.evict(DOCUMENT_ID, &[1]).await.is_err());
    assert!(harness.cache.page(1).unwrap().unwrap().is_mirrored());

    harness.store.delete_failures.reset();
    assert_eq!(materializer.evict(DOCUMENT_ID, &[1]).await.unwrap(), 3);
}

// ============================================================================
// PURGE
// ============================================================================

#[tokio::test]
async fn test_purge_foreign_reclaims_previous_document() {
    let harness = Harness::new()
        .with_document("old", 3)
        .with_document("new", 3);
    let materializer = harness.materializer();

    harness.index("old", 3).await.unwrap();
    materializer.ensure_resident("old", &[1]).await.unwrap();
    harness.index("new", 3).await.unwrap();
    materializer.ensure_resident("new", &[1]).await.unwrap();

    let report = materializer.purge_foreign("new").await;

    assert_eq!(report.local, 3);
    assert_eq!(report.remote, 3);
    assert!(harness.store.object_names().iter().all(|n| n.starts_with("new")));
    assert_eq!(harness.staged_files(1).len(), 3);
}
