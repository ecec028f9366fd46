//! Tiffster Core - Page Window Types
//!
//! Data structures shared by every Tiffster crate: frame descriptors, page
//! entries, the process-wide window state, the page-changed notification,
//! the error taxonomy, configuration, and the pure window arithmetic.
//!
//! Nothing in this crate performs I/O.

pub mod config;
pub mod entities;
pub mod error;
pub mod window;

pub use config::{EngineConfig, RetryConfig};
pub use entities::{
    page_number_for, FrameOffset, ImageDescriptor, PageChanged, PageEntry, RemoteRef, WindowState,
};
pub use error::{
    ConfigError, IndexError, ReconcilePhase, StorageError, TiffsterError, TiffsterResult,
    TransportError, ValidationError,
};
pub use window::compute_window;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Logical page number, 1-based.
///
/// Signed so that malformed inbound notifications (zero or negative pages)
/// can be represented and rejected instead of wrapping.
pub type PageNumber = i64;

/// 1-based position of a frame across the whole container.
pub type SequenceIndex = i64;

/// Identity of a document (the session name the container was uploaded under).
pub type DocumentId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
