//! Error types for Tiffster operations

use std::fmt;

use thiserror::Error;

use crate::PageNumber;

/// Malformed input detected before any I/O.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Document id is empty")]
    EmptyDocumentId,

    #[error("Invalid page number {page}: pages start at 1")]
    InvalidPageNumber { page: PageNumber },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Malformed remote reference: {reference}")]
    MalformedRemoteRef { reference: String },
}

/// Container indexing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Page {page} has not been indexed")]
    NotIndexed { page: PageNumber },

    #[error("Failed to open container {path}: {reason}")]
    ContainerOpen { path: String, reason: String },

    #[error("Failed to read container entry: {reason}")]
    ContainerRead { reason: String },

    #[error("Document {document_id} is not active (active: {active:?})")]
    InactiveDocument {
        document_id: String,
        active: Option<String>,
    },
}

/// Local staging and remote mirroring errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to decode frame at {offset}: {reason}")]
    Decode { offset: String, reason: String },

    #[error("Failed to encode raster: {reason}")]
    Encode { reason: String },

    #[error("Local I/O failed for {path}: {reason}")]
    LocalIo { path: String, reason: String },

    #[error("Upload of {path} failed: {reason}")]
    Upload { path: String, reason: String },

    #[error("Remote delete of {reference} failed: {reason}")]
    RemoteDelete { reference: String, reason: String },

    #[error("Download of {reference} failed: {reason}")]
    Download { reference: String, reason: String },

    #[error("Remote listing failed: {reason}")]
    RemoteList { reason: String },

    #[error("Blocking task failed: {reason}")]
    TaskFailed { reason: String },

    #[error("Document cache lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Notification transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Notification channel closed")]
    ChannelClosed,

    #[error("Delivery was dropped before it was acknowledged")]
    AckDropped,
}

/// Reconciliation phase that performs side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Evicting,
    Adding,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilePhase::Evicting => f.write_str("evicting"),
            ReconcilePhase::Adding => f.write_str("adding"),
        }
    }
}

/// Master error type for all Tiffster errors.
#[derive(Debug, Clone, Error)]
pub enum TiffsterError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Reconciliation aborted while {phase}: {source}")]
    Aborted {
        phase: ReconcilePhase,
        source: Box<TiffsterError>,
    },
}

impl TiffsterError {
    pub fn aborted(phase: ReconcilePhase, source: TiffsterError) -> Self {
        TiffsterError::Aborted {
            phase,
            source: Box::new(source),
        }
    }

    /// Whether a retry could change the outcome.
    ///
    /// Validation, configuration and not-indexed failures are deterministic:
    /// repeating the call yields the same error.
    pub fn is_retryable(&self) -> bool {
        match self {
            TiffsterError::Validation(_) | TiffsterError::Config(_) => false,
            TiffsterError::Index(IndexError::NotIndexed { .. })
            | TiffsterError::Index(IndexError::InactiveDocument { .. }) => false,
            TiffsterError::Index(_) | TiffsterError::Storage(_) => true,
            TiffsterError::Transport(_) => false,
            TiffsterError::Aborted { .. } => false,
        }
    }

    /// The call targeted a document that is no longer active.
    pub fn is_inactive_document(&self) -> bool {
        matches!(self, TiffsterError::Index(IndexError::InactiveDocument { .. }))
    }

    pub fn is_not_indexed(&self) -> bool {
        matches!(self, TiffsterError::Index(IndexError::NotIndexed { .. }))
            || matches!(self, TiffsterError::Aborted { source, .. } if source.is_not_indexed())
    }
}

/// Result type alias for Tiffster operations.
pub type TiffsterResult<T> = Result<T, TiffsterError>;

// =============================================================================
// TESTS
// =============================================================================
