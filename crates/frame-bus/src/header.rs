//! The 128-byte Frame Bus header.
//!
//! Layout (little-endian, packed):
//!
//! ```text
//! 0x00 magic u32        0x18 pixel_format u32   0x30 last_write_ns u64
//! 0x04 version u16      0x1C frame_size u32     0x38 reserved [u8; 72]
//! 0x06 flags u16        0x20 slot_count u32
//! 0x08 header_size u32  0x24 slot_stride u32
//! 0x0C width u32        0x28 seq u64
//! 0x10 height u32
//! 0x14 fps u32
//! ```

use serde::{Deserialize, Serialize};

use framebridge_common::error::{BridgeError, BridgeResult};

/// "BRGF" read as a little-endian u32.
pub const FRAME_BUS_MAGIC: u32 = 0x4647_5242;
pub const FRAME_BUS_VERSION: u16 = 1;
pub const HEADER_SIZE: u32 = 128;

pub(crate) const SEQ_OFFSET: usize = 0x28;
pub(crate) const LAST_WRITE_OFFSET: usize = 0x30;

/// Pixel layout of frames in the slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8 = 1,
    Bgra8 = 2,
    Argb8 = 3,
}

impl PixelFormat {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Rgba8),
            2 => Some(Self::Bgra8),
            3 => Some(Self::Argb8),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        4
    }
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBusHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub header_size: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: u32,
    pub frame_size: u32,
    pub slot_count: u32,
    pub slot_stride: u32,
    pub seq: u64,
    pub last_write_ns: u64,
}

impl FrameBusHeader {
    /// Build a header for a new region, validating the geometry.
    pub fn new(
        width: u32,
        height: u32,
        fps: u32,
        pixel_format: PixelFormat,
        slot_count: u32,
    ) -> BridgeResult<Self> {
        if width == 0 || height == 0 {
            return Err(BridgeError::shared_memory(format!(
                "Invalid frame size {width}x{height}"
            )));
        }
        if fps == 0 {
            return Err(BridgeError::shared_memory("Frame rate must be non-zero"));
        }
        if pixel_format != PixelFormat::Rgba8 {
            return Err(BridgeError::shared_memory(format!(
                "Unsupported pixel format {pixel_format:?} (only RGBA8 is emitted)"
            )));
        }
        if slot_count < 2 {
            return Err(BridgeError::shared_memory(format!(
                "Slot count must be at least 2, got {slot_count}"
            )));
        }

        let frame_size = width
            .checked_mul(height)
            .and_then(|px| px.checked_mul(pixel_format.bytes_per_pixel()))
            .ok_or_else(|| {
                BridgeError::shared_memory(format!("Frame size overflow for {width}x{height}"))
            })?;

        let header = Self {
            magic: FRAME_BUS_MAGIC,
            version: FRAME_BUS_VERSION,
            flags: 0,
            header_size: HEADER_SIZE,
            width,
            height,
            fps,
            pixel_format: pixel_format as u32,
            frame_size,
            slot_count,
            slot_stride: frame_size,
            seq: 0,
            last_write_ns: 0,
        };
        header.total_size()?;
        Ok(header)
    }

    /// `header_size + slot_stride * slot_count`, checked against overflow.
    pub fn total_size(&self) -> BridgeResult<usize> {
        let slots = (self.slot_stride as u64)
            .checked_mul(self.slot_count as u64)
            .and_then(|bytes| bytes.checked_add(self.header_size as u64))
            .ok_or_else(|| BridgeError::shared_memory("Region size overflow"))?;
        usize::try_from(slots).map_err(|_| BridgeError::shared_memory("Region too large"))
    }

    /// Byte offset of slot `index` from the region base.
    pub fn slot_offset(&self, index: u32) -> usize {
        self.header_size as usize + self.slot_stride as usize * index as usize
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_raw(self.pixel_format)
    }

    /// Whether another header describes the same region geometry.
    pub fn same_geometry(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.fps == other.fps
            && self.pixel_format == other.pixel_format
            && self.frame_size == other.frame_size
            && self.slot_count == other.slot_count
            && self.slot_stride == other.slot_stride
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0x00..0x04].copy_from_slice(&self.magic.to_le_bytes());
        buf[0x04..0x06].copy_from_slice(&self.version.to_le_bytes());
        buf[0x06..0x08].copy_from_slice(&self.flags.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.header_size.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.width.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.height.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.fps.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&self.pixel_format.to_le_bytes());
        buf[0x1C..0x20].copy_from_slice(&self.frame_size.to_le_bytes());
        buf[0x20..0x24].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[0x24..0x28].copy_from_slice(&self.slot_stride.to_le_bytes());
        buf[0x28..0x30].copy_from_slice(&self.seq.to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&self.last_write_ns.to_le_bytes());
        buf
    }

    /// Decode without validation. Use [`FrameBusHeader::validate`] before
    /// trusting any offsets.
    pub fn decode(buf: &[u8]) -> BridgeResult<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(BridgeError::shared_memory(format!(
                "Frame Bus region too small ({} bytes)",
                buf.len()
            )));
        }
        let u16_at = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };

        Ok(Self {
            magic: u32_at(0x00),
            version: u16_at(0x04),
            flags: u16_at(0x06),
            header_size: u32_at(0x08),
            width: u32_at(0x0C),
            height: u32_at(0x10),
            fps: u32_at(0x14),
            pixel_format: u32_at(0x18),
            frame_size: u32_at(0x1C),
            slot_count: u32_at(0x20),
            slot_stride: u32_at(0x24),
            seq: u64_at(0x28),
            last_write_ns: u64_at(0x30),
        })
    }

    /// Validate a header read from a region of `region_len` bytes.
    pub fn validate(&self, region_len: usize) -> BridgeResult<()> {
        if self.magic != FRAME_BUS_MAGIC {
            return Err(BridgeError::shared_memory(format!(
                "Frame Bus header invalid (magic 0x{:08x})",
                self.magic
            )));
        }
        if self.version != FRAME_BUS_VERSION {
            return Err(BridgeError::shared_memory(format!(
                "Unsupported Frame Bus version {}",
                self.version
            )));
        }
        if self.header_size != HEADER_SIZE {
            return Err(BridgeError::shared_memory(format!(
                "Unexpected Frame Bus header size {}",
                self.header_size
            )));
        }
        if self.slot_count < 2 || self.slot_stride < self.frame_size || self.frame_size == 0 {
            return Err(BridgeError::shared_memory(format!(
                "Inconsistent slot geometry (count={}, stride={}, frame={})",
                self.slot_count, self.slot_stride, self.frame_size
            )));
        }
        let total = self.total_size()?;
        if total > region_len {
            return Err(BridgeError::shared_memory(format!(
                "Frame Bus region truncated: header declares {total} bytes, region has {region_len}"
            )));
        }
        Ok(())
    }
}
