//! Frame types and storage boundary.
//!
//! A [`Frame`] is one pixel plane pulled from a frame source. Pixel data is kept as
//! raw little-endian bytes so the scheduler never has to care about the bit depth;
//! the closed set of depths the storage boundary accepts is [`PixelType`].

pub mod memory_sink;
pub mod storage;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AcqError, AcqResult};

/// Pixel data types accepted by a frame sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    /// 8-bit grayscale, 1 byte per pixel
    Gray8,
    /// 16-bit grayscale, 2 bytes per pixel (little endian)
    Gray16,
}

impl PixelType {
    /// Resolve a pixel type from the source's bytes-per-pixel.
    ///
    /// Any depth other than 1 or 2 bytes is rejected with `UnsupportedPixelDepth`.
    pub fn from_bytes_per_pixel(bytes_per_pixel: u32) -> AcqResult<Self> {
        match bytes_per_pixel {
            1 => Ok(PixelType::Gray8),
            2 => Ok(PixelType::Gray16),
            other => Err(AcqError::UnsupportedPixelDepth {
                bytes_per_pixel: other,
            }),
        }
    }

    /// Bytes one pixel occupies.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelType::Gray8 => 1,
            PixelType::Gray16 => 2,
        }
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelType::Gray8 => write!(f, "GRAY8"),
            PixelType::Gray16 => write!(f, "GRAY16"),
        }
    }
}

/// Represents a single image frame.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`).
/// - 8-bit images: 1 byte per pixel.
/// - 16-bit images: 2 bytes per pixel, Little Endian.
///
/// `tags` carries whatever per-frame metadata the source attached (timestamps,
/// camera counters). The scheduler merges its own keys into it before writing.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bytes per pixel (1 or 2 for storable frames)
    pub bytes_per_pixel: u32,

    /// Raw pixel data
    pub data: Vec<u8>,

    /// Source-provided metadata
    pub tags: Map<String, Value>,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            bytes_per_pixel: 2,
            data,
            tags: Map::new(),
        }
    }

    /// Create a new frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel: 1,
            data,
            tags: Map::new(),
        }
    }

    /// Attach a metadata tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Number of bytes a frame of this geometry must carry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel as usize
    }

    /// Get pixel value at (x, y) as u32.
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let idx = (y * self.width + x) as usize;

        match self.bytes_per_pixel {
            1 => self.data.get(idx).map(|&v| v as u32),
            2 => {
                let start = idx * 2;
                let bytes = self.data.get(start..start + 2)?;
                Some(u16::from_le_bytes([bytes[0], bytes[1]]) as u32)
            }
            _ => None,
        }
    }

    /// Calculate mean pixel value.
    pub fn mean(&self) -> f64 {
        match self.bytes_per_pixel {
            1 => {
                if self.data.is_empty() {
                    return 0.0;
                }
                let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
                sum as f64 / self.data.len() as f64
            }
            2 => {
                let pixels = self.data.len() / 2;
                if pixels == 0 {
                    return 0.0;
                }
                let sum: u64 = self
                    .data
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]) as u64)
                    .sum();
                sum as f64 / pixels as f64
            }
            _ => 0.0,
        }
    }
}
