//! Tiffster Storage - Page Index, Staging and Mirroring
//!
//! Owns everything with side effects below the reconciler:
//!
//! - [`DocumentCache`]: page metadata index and window state of the active
//!   document
//! - [`LocalStage`]: deterministic staging paths and JPEG writes
//! - [`PageMaterializer`]: fan-out decode, stage, upload and eviction
//! - [`FsObjectStore`] and [`TiffContainerDecoder`]: concrete collaborators
//!   behind the [`RemoteObjectStore`] and [`ContainerDecoder`] traits

pub mod document;
pub mod fs_store;
pub mod materializer;
pub mod stage;
pub mod tiff_decoder;
pub mod traits;

pub use document::{walk_container, DocumentCache};
pub use fs_store::FsObjectStore;
pub use materializer::{PageMaterializer, PageResidency, PurgeReport};
pub use stage::LocalStage;
pub use tiff_decoder::{TiffContainerDecoder, TiffHandle};
pub use traits::{ContainerDecoder, FrameEntry, PixelLayout, Raster, RemoteObjectStore};
