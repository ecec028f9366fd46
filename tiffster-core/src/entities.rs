//! Entity types: descriptors, page entries, window state, notifications.

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::{PageNumber, SequenceIndex, Timestamp};

/// Opaque location of a frame inside its container.
///
/// Only the decoder that produced it knows how to interpret the value; the
/// engine stores it and hands it back when a decode is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameOffset(pub u64);

impl FrameOffset {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle to an object in durable remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRef(String);

impl RemoteRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Page a frame belongs to, given its 1-based sequence index.
pub fn page_number_for(sequence_index: SequenceIndex, frames_per_page: u32) -> PageNumber {
    ((sequence_index - 1) / i64::from(frames_per_page)) + 1
}

/// One decodable frame inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub offset: FrameOffset,
    pub sequence_index: SequenceIndex,
    pub page_number: PageNumber,
    /// Where the decoded raster is staged locally.
    pub local_path: PathBuf,
    /// `None` until the staged file has been mirrored.
    pub remote_ref: Option<RemoteRef>,
}

impl ImageDescriptor {
    pub fn new(
        offset: FrameOffset,
        sequence_index: SequenceIndex,
        page_number: PageNumber,
        local_path: PathBuf,
    ) -> Self {
        Self {
            offset,
            sequence_index,
            page_number,
            local_path,
            remote_ref: None,
        }
    }

    pub fn is_mirrored(&self) -> bool {
        self.remote_ref.is_some()
    }
}

/// All descriptors sharing a page number, ordered by sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    pub page_number: PageNumber,
    pub descriptors: Vec<ImageDescriptor>,
}

impl PageEntry {
    pub fn new(page_number: PageNumber) -> Self {
        Self {
            page_number,
            descriptors: Vec::new(),
        }
    }

    /// Append a descriptor discovered during indexing.
    ///
    /// Descriptors arrive in chain order, so insertion order is sequence order.
    pub fn push(&mut self, descriptor: ImageDescriptor) {
        debug_assert_eq!(descriptor.page_number, self.page_number);
        debug_assert!(self
            .descriptors
            .last()
            .map_or(true, |last| last.sequence_index < descriptor.sequence_index));
        self.descriptors.push(descriptor);
    }

    pub fn descriptor_mut(&mut self, sequence_index: SequenceIndex) -> Option<&mut ImageDescriptor> {
        self.descriptors
            .iter_mut()
            .find(|d| d.sequence_index == sequence_index)
    }

    /// True when every descriptor of the page has a remote mirror.
    pub fn is_mirrored(&self) -> bool {
        !self.descriptors.is_empty() && self.descriptors.iter().all(ImageDescriptor::is_mirrored)
    }
}

/// Process-wide, single-document window state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Last page the user navigated to (committed).
    pub current_page: Option<PageNumber>,
    /// Resident pages, ascending. `None` before the first commit.
    pub current_window: Option<Vec<PageNumber>>,
    /// Highest page seen by the indexer; final only once indexing completes.
    pub total_pages: Option<PageNumber>,
}

impl WindowState {
    /// Commit the outcome of a successful reconciliation.
    pub fn commit(&mut self, page: PageNumber, window: Vec<PageNumber>) {
        self.current_page = Some(page);
        self.current_window = Some(window);
    }
}

/// Notification that the user navigated to a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageChanged {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    #[serde(default = "Utc::now")]
    pub created_at: Timestamp,
    pub document_id: String,
    pub page_number: PageNumber,
}

impl PageChanged {
    pub fn new(document_id: impl Into<String>, page_number: PageNumber) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            document_id: document_id.into(),
            page_number,
        }
    }

    /// Reject notifications that carry no usable document or a
    /// non-positive page.
    ///
    /// The document id names staged files and the container directly, so
    /// it must be a single path component.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.document_id.trim().is_empty() {
            return Err(ValidationError::EmptyDocumentId);
        }
        if !is_single_component(&self.document_id) {
            return Err(ValidationError::InvalidValue {
                field: "document_id".to_string(),
                reason: format!("{:?} is not a plain file name", self.document_id),
            });
        }
        if self.page_number <= 0 {
            return Err(ValidationError::InvalidPageNumber {
                page: self.page_number,
            });
        }
        Ok(())
    }
}

fn is_single_component(name: &str) -> bool {
    name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(sequence_index: SequenceIndex) -> ImageDescriptor {
        let page = page_number_for(sequence_index, 3);
        ImageDescriptor::new(
            FrameOffset(sequence_index as u64 * 8),
            sequence_index,
            page,
            PathBuf::from(format!("doc_{}_{}.jpg", page, sequence_index)),
        )
    }

    #[test]
    fn test_page_number_for_groups_frames() {
        let pages: Vec<_> = (1..=9).map(|i| page_number_for(i, 3)).collect();
        assert_eq!(pages, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]);
        assert_eq!(page_number_for(1, 1), 1);
        assert_eq!(page_number_for(5, 1), 5);
        assert_eq!(page_number_for(4, 4), 1);
        assert_eq!(page_number_for(5, 4), 2);
    }

    #[test]
    fn test_page_entry_mirrored() {
        let mut entry = PageEntry::new(1);
        assert!(!entry.is_mirrored());

        entry.push(descriptor(1));
        entry.push(descriptor(2));
        assert!(!entry.is_mirrored());

        for d in entry.descriptors.iter_mut() {
            d.remote_ref = Some(RemoteRef::new(format!("fs://{}", d.sequence_index)));
        }
        assert!(entry.is_mirrored());

        entry.descriptor_mut(2).unwrap().remote_ref = None;
        assert!(!entry.is_mirrored());
    }

    #[test]
    fn test_page_changed_validation() {
        assert!(PageChanged::new("doc", 1).validate().is_ok());
        assert_eq!(
            PageChanged::new("", 1).validate(),
            Err(ValidationError::EmptyDocumentId)
        );
        assert_eq!(
            PageChanged::new("   ", 1).validate(),
            Err(ValidationError::EmptyDocumentId)
        );
        assert_eq!(
            PageChanged::new("doc", 0).validate(),
            Err(ValidationError::InvalidPageNumber { page: 0 })
        );
        assert_eq!(
            PageChanged::new("doc", -4).validate(),
            Err(ValidationError::InvalidPageNumber { page: -4 })
        );
    }

    #[test]
    fn test_page_changed_rejects_path_like_document_ids() {
        for id in ["../escape", "a/b", "/abs", "dir\\file", "..", ".", "nul\0byte"] {
            assert!(
                matches!(
                    PageChanged::new(id, 1).validate(),
                    Err(ValidationError::InvalidValue { ref field, .. }) if field == "document_id"
                ),
                "{id:?} should be rejected"
            );
        }
        assert!(PageChanged::new("scan.v2", 1).validate().is_ok());
        assert!(PageChanged::new("a..b", 1).validate().is_ok());
    }

    #[test]
    fn test_page_changed_deserializes_without_envelope_fields() {
        let json = r#"{"document_id":"abc","page_number":7}"#;
        let event: PageChanged = serde_json::from_str(json).unwrap();
        assert_eq!(event.document_id, "abc");
        assert_eq!(event.page_number, 7);
    }

    #[test]
    fn test_window_state_commit() {
        let mut state = WindowState {
            total_pages: Some(10),
            ..Default::default()
        };
        state.commit(4, vec![3, 4, 5]);
        assert_eq!(state.current_page, Some(4));
        assert_eq!(state.current_window, Some(vec![3, 4, 5]));
        assert_eq!(state.total_pages, Some(10));
    }
}
