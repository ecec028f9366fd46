//! Multi-page TIFF container decoder.
//!
//! Frames are the container's image file directories. The opaque offset is
//! the directory ordinal, which the `tiff` crate can seek to directly. All
//! decoding is blocking and runs on the blocking thread pool.
//!
//! Gray samples arrive black-is-zero (the `tiff` crate inverts white-is-zero
//! images while decoding).

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::ColorType;
use tiffster_core::{
    FrameOffset, IndexError, StorageError, TiffsterError, TiffsterResult,
};

use crate::traits::{ContainerDecoder, FrameEntry, Raster};

type TiffReader = Decoder<BufReader<File>>;

/// An open TIFF container. Clones share one decoder.
#[derive(Clone)]
pub struct TiffHandle {
    path: Arc<PathBuf>,
    decoder: Arc<Mutex<TiffReader>>,
}

impl std::fmt::Debug for TiffHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiffHandle").field("path", &self.path).finish()
    }
}

impl TiffHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TiffContainerDecoder;

impl TiffContainerDecoder {
    pub fn new() -> Self {
        Self
    }
}

async fn blocking<T, F>(work: F) -> TiffsterResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> TiffsterResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        TiffsterError::Storage(StorageError::TaskFailed {
            reason: e.to_string(),
        })
    })?
}

fn ordinal(offset: FrameOffset) -> TiffsterResult<usize> {
    usize::try_from(offset.get()).map_err(|_| {
        TiffsterError::Index(IndexError::ContainerRead {
            reason: format!("frame offset {} out of range", offset),
        })
    })
}

fn with_decoder<T>(
    handle: &TiffHandle,
    on_error: impl Fn(String) -> TiffsterError,
    work: impl FnOnce(&mut TiffReader) -> Result<T, tiff::TiffError>,
) -> TiffsterResult<T> {
    let mut decoder = handle
        .decoder
        .lock()
        .map_err(|_| TiffsterError::Storage(StorageError::LockPoisoned))?;
    work(&mut decoder).map_err(|e| on_error(e.to_string()))
}

#[async_trait]
impl ContainerDecoder for TiffContainerDecoder {
    type Handle = TiffHandle;

    async fn open(&self, path: &Path) -> TiffsterResult<TiffHandle> {
        let path = path.to_path_buf();
        blocking(move || {
            let open_failed = |reason: String| {
                TiffsterError::Index(IndexError::ContainerOpen {
                    path: path.display().to_string(),
                    reason,
                })
            };

            let file = File::open(&path).map_err(|e| open_failed(e.to_string()))?;
            let decoder =
                Decoder::new(BufReader::new(file)).map_err(|e| open_failed(e.to_string()))?;

            tracing::debug!(path = %path.display(), "Opened TIFF container");
            Ok(TiffHandle {
                path: Arc::new(path),
                decoder: Arc::new(Mutex::new(decoder)),
            })
        })
        .await
    }

    async fn first_entry_offset(&self, _handle: &TiffHandle) -> TiffsterResult<Option<FrameOffset>> {
        // A valid TIFF always has at least one directory.
        Ok(Some(FrameOffset(0)))
    }

    async fn read_entry_at(
        &self,
        handle: &TiffHandle,
        offset: FrameOffset,
    ) -> TiffsterResult<FrameEntry> {
        let index = ordinal(offset)?;
        let handle = handle.clone();
        blocking(move || {
            with_decoder(
                &handle,
                |reason| TiffsterError::Index(IndexError::ContainerRead { reason }),
                |decoder| {
                    decoder.seek_to_image(index)?;
                    let (width, height) = decoder.dimensions()?;
                    let next = decoder
                        .more_images()
                        .then(|| FrameOffset(offset.get() + 1));
                    Ok(FrameEntry {
                        width,
                        height,
                        next,
                    })
                },
            )
        })
        .await
    }

    async fn decode_frame(&self, handle: &TiffHandle, offset: FrameOffset) -> TiffsterResult<Raster> {
        let index = ordinal(offset)?;
        let handle = handle.clone();
        blocking(move || {
            let decode_failed = |reason: String| {
                TiffsterError::Storage(StorageError::Decode {
                    offset: offset.to_string(),
                    reason,
                })
            };

            let (color, width, height, pixels) = with_decoder(&handle, decode_failed, |decoder| {
                decoder.seek_to_image(index)?;
                let (width, height) = decoder.dimensions()?;
                let color = decoder.colortype()?;
                let pixels = decoder.read_image()?;
                Ok((color, width, height, pixels))
            })?;

            to_raster(color, width, height, pixels).map_err(decode_failed)
        })
        .await
    }
}

/// Normalize decoded samples to 8-bit gray or RGB.
fn to_raster(
    color: ColorType,
    width: u32,
    height: u32,
    pixels: DecodingResult,
) -> Result<Raster, String> {
    match (color, pixels) {
        (ColorType::Gray(1), DecodingResult::U8(packed)) => {
            Ok(Raster::gray(width, height, unpack_bilevel(&packed, width, height)))
        }
        (ColorType::Gray(8), DecodingResult::U8(gray)) => Ok(Raster::gray(width, height, gray)),
        (ColorType::Gray(16), DecodingResult::U16(gray)) => {
            let gray = gray.into_iter().map(|v| (v >> 8) as u8).collect();
            Ok(Raster::gray(width, height, gray))
        }
        (ColorType::GrayA(8), DecodingResult::U8(samples)) => {
            Ok(Raster::gray(width, height, drop_alpha(&samples, 2)))
        }
        (ColorType::RGB(8), DecodingResult::U8(rgb)) => Ok(Raster::rgb(width, height, rgb)),
        (ColorType::RGBA(8), DecodingResult::U8(samples)) => {
            Ok(Raster::rgb(width, height, drop_alpha(&samples, 4)))
        }
        (color, _) => Err(format!("unsupported color type {:?}", color)),
    }
}

/// Expand 1-bit rows (each padded to a whole byte) to 8-bit gray.
fn unpack_bilevel(packed: &[u8], width: u32, height: u32) -> Vec<u8> {
    let width = width as usize;
    let row_bytes = width.div_ceil(8);

    let mut gray = Vec::with_capacity(width * height as usize);
    for row in packed.chunks(row_bytes).take(height as usize) {
        for x in 0..width {
            let bit = row.get(x / 8).map_or(0, |byte| (byte >> (7 - x % 8)) & 1);
            gray.push(if bit == 1 { 255 } else { 0 });
        }
    }
    gray
}

/// Keep the leading color channels of each pixel, dropping the trailing alpha.
fn drop_alpha(samples: &[u8], channels: usize) -> Vec<u8> {
    samples
        .chunks_exact(channels)
        .flat_map(|pixel| pixel[..channels - 1].iter().copied())
        .collect()
}
