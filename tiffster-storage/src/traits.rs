//! Collaborator traits.
//!
//! The engine depends on two narrow interfaces: a decoder that can walk and
//! decode the frames of a multi-frame container, and a remote object store
//! that mirrors staged rasters. Both are async and object-safe enough to be
//! shared behind an `Arc`.

use std::path::Path;

use async_trait::async_trait;
use tiffster_core::{FrameOffset, RemoteRef, TiffsterResult};

/// Pixel layout of a decoded raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Gray8,
    Rgb8,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb8 => 3,
        }
    }
}

/// A decoded frame, row-major with no padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub pixels: Vec<u8>,
}

impl Raster {
    pub fn gray(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            layout: PixelLayout::Gray8,
            pixels,
        }
    }

    pub fn rgb(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            layout: PixelLayout::Rgb8,
            pixels,
        }
    }

    /// Byte length implied by the dimensions and layout.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.channels()
    }
}

/// Header of one frame in the container's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    pub width: u32,
    pub height: u32,
    /// `None` at the terminal entry.
    pub next: Option<FrameOffset>,
}

/// Low-level access to a multi-frame image container.
///
/// Offsets are opaque: the decoder hands them out while walking the chain
/// and accepts them back when a frame needs to be decoded.
#[async_trait]
pub trait ContainerDecoder: Send + Sync {
    /// Open container state shared by every call for one document.
    type Handle: Clone + Send + Sync + 'static;

    async fn open(&self, path: &Path) -> TiffsterResult<Self::Handle>;

    /// First entry of the chain, or `None` for an empty container.
    async fn first_entry_offset(&self, handle: &Self::Handle) -> TiffsterResult<Option<FrameOffset>>;

    async fn read_entry_at(
        &self,
        handle: &Self::Handle,
        offset: FrameOffset,
    ) -> TiffsterResult<FrameEntry>;

    async fn decode_frame(&self, handle: &Self::Handle, offset: FrameOffset) -> TiffsterResult<Raster>;
}

/// Durable storage that mirrors staged rasters.
#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Upload a local file and return a handle to the stored object.
    async fn upload(&self, local_path: &Path) -> TiffsterResult<RemoteRef>;

    /// Delete an object. Deleting an object that no longer exists succeeds.
    async fn delete(&self, reference: &RemoteRef) -> TiffsterResult<()>;

    /// Fetch an object into `destination`, replacing any file already there.
    async fn download(&self, reference: &RemoteRef, destination: &Path) -> TiffsterResult<()>;

    /// Delete every top-level object whose name does not start with `prefix`.
    ///
    /// Objects inside folders, such as source containers, are left alone.
    /// Best-effort per object; returns how many were deleted.
    async fn remove_all_except(&self, prefix: &str) -> TiffsterResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raster_expected_len() {
        assert_eq!(Raster::gray(4, 3, vec![0; 12]).expected_len(), 12);
        assert_eq!(Raster::rgb(4, 3, vec![0; 36]).expected_len(), 36);
    }
}
