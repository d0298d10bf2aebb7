//! Splits the decode process' output into fixed-size raw frames.

use std::io;

use crate::{
    error::ConversionError,
    format::{PixelFormat, Resolution},
    process::ChunkSource,
};

/// One raw frame buffer with the geometry it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

pub struct FrameDemuxer<S> {
    source: S,
    width: u32,
    height: u32,
    format: PixelFormat,
    bytes_per_pixel: usize,
    frame_size: usize,
    first_read: bool,
    dropped: u64,
}

impl<S: ChunkSource> FrameDemuxer<S> {
    /// Fails for compressed formats, which have no fixed frame size.
    pub fn new(
        source: S,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, ConversionError> {
        let bytes_per_pixel = format
            .bytes_per_pixel()
            .ok_or(ConversionError::Compressed { format })?;
        Ok(Self {
            source,
            width,
            height,
            format,
            bytes_per_pixel,
            frame_size: width as usize * height as usize * bytes_per_pixel,
            first_read: true,
            dropped: 0,
        })
    }

    /// Reads the next complete frame. `Ok(None)` marks a clean end of stream.
    ///
    /// A short first read is taken as a hint that the device ignored the
    /// requested size: if its pixel count matches a known resolution, that
    /// resolution is adopted for the rest of the stream. Any other short read
    /// is discarded and reading resumes at the next frame boundary.
    pub fn next_frame(&mut self) -> io::Result<Option<RawFrame>> {
        loop {
            let chunk = self.source.read_chunk(self.frame_size)?;
            let first = std::mem::replace(&mut self.first_read, false);

            if chunk.is_empty() {
                return Ok(None);
            }

            if chunk.len() == self.frame_size {
                return Ok(Some(self.raw(chunk)));
            }

            if first && let Some(res) = self.resolution_for(chunk.len()) {
                tracing::info!(
                    "First frame was {} bytes, switching from {}x{} to {}",
                    chunk.len(),
                    self.width,
                    self.height,
                    res
                );
                self.adopt(res);
                return Ok(Some(self.raw(chunk)));
            }

            self.dropped += 1;
            tracing::debug!(
                "Dropped partial frame ({} of {} bytes, {} dropped so far)",
                chunk.len(),
                self.frame_size,
                self.dropped
            );
        }
    }

    fn resolution_for(&self, len: usize) -> Option<Resolution> {
        if len % self.bytes_per_pixel != 0 {
            return None;
        }
        Resolution::from_pixel_count(len / self.bytes_per_pixel)
    }

    fn adopt(&mut self, res: Resolution) {
        self.width = res.width;
        self.height = res.height;
        self.frame_size = res.pixels() * self.bytes_per_pixel;
    }

    fn raw(&self, data: Vec<u8>) -> RawFrame {
        RawFrame {
            data,
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Partial frames discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}
