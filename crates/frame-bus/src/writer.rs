//! Frame Bus writer (compositing side).

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use framebridge_common::error::{BridgeError, BridgeResult};

use crate::header::{FrameBusHeader, PixelFormat};
use crate::region::{region_path, SharedRegion};

/// Parameters for creating a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
    pub slot_count: u32,
    /// Unlink any existing region first so stale readers can never observe
    /// a region built for a different format.
    pub force_recreate: bool,
    /// Directory backing the region. `None` uses the platform default.
    pub shm_dir: Option<PathBuf>,
}

impl WriterConfig {
    pub fn new(name: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            fps,
            pixel_format: PixelFormat::Rgba8,
            slot_count: 3,
            force_recreate: true,
            shm_dir: None,
        }
    }
}

/// Single writer for a named region.
pub struct FrameBusWriter {
    region: SharedRegion,
    header: FrameBusHeader,
    next_seq: u64,
    closed: bool,
}

impl std::fmt::Debug for FrameBusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBusWriter")
            .field("path", &self.region.path())
            .field("header", &self.header)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl FrameBusWriter {
    /// Allocate or reopen the region described by `config`.
    ///
    /// Every failure mode (bad name, size overflow, unsupported format,
    /// mismatching existing region) is reported here, never on
    /// [`FrameBusWriter::write_frame`].
    pub fn create(config: &WriterConfig) -> BridgeResult<Self> {
        let header = FrameBusHeader::new(
            config.width,
            config.height,
            config.fps,
            config.pixel_format,
            config.slot_count,
        )?;
        let path = region_path(config.shm_dir.as_deref(), &config.name)?;

        if path.exists() {
            if config.force_recreate {
                std::fs::remove_file(&path).map_err(|e| {
                    BridgeError::shared_memory(format!(
                        "Failed to unlink stale Frame Bus region {}: {e}",
                        path.display()
                    ))
                })?;
                tracing::debug!(path = %path.display(), "Unlinked stale Frame Bus region");
            } else {
                return Self::reopen(path, header);
            }
        }

        let region = SharedRegion::create(&path, &header)?;
        tracing::info!(
            path = %path.display(),
            width = header.width,
            height = header.height,
            fps = header.fps,
            slots = header.slot_count,
            bytes = region.len(),
            "Frame Bus writer created"
        );
        Ok(Self {
            region,
            header,
            next_seq: 0,
            closed: false,
        })
    }

    fn reopen(path: PathBuf, wanted: FrameBusHeader) -> BridgeResult<Self> {
        let region = SharedRegion::open(&path)?;
        let existing = region.header()?;
        existing.validate(region.len())?;
        if !existing.same_geometry(&wanted) {
            return Err(BridgeError::shared_memory(format!(
                "Frame Bus region {} exists with a different format ({}x{}@{} slots={}); recreate it",
                path.display(),
                existing.width,
                existing.height,
                existing.fps,
                existing.slot_count
            )));
        }
        let next_seq = region.seq().load(Ordering::Acquire);
        tracing::info!(path = %path.display(), seq = next_seq, "Frame Bus writer reopened");
        Ok(Self {
            region,
            header: existing,
            next_seq,
            closed: false,
        })
    }

    /// Header the region was created with.
    pub fn header(&self) -> &FrameBusHeader {
        &self.header
    }

    /// Bytes expected per frame.
    pub fn frame_size(&self) -> usize {
        self.header.frame_size as usize
    }

    /// Sequence number of the last published frame (0 before any write).
    pub fn seq(&self) -> u64 {
        self.next_seq
    }

    /// Publish one frame. Returns the new sequence number.
    ///
    /// The slot is `seq mod slot_count`; bytes and timestamp are written
    /// first, then `seq` is incremented with release ordering so a reader
    /// that observes the new value also observes the frame.
    pub fn write_frame(&mut self, bytes: &[u8], timestamp_ns: u64) -> BridgeResult<u64> {
        if self.closed {
            return Err(BridgeError::shared_memory("Frame Bus writer is closed"));
        }
        if bytes.len() != self.frame_size() {
            return Err(BridgeError::shared_memory(format!(
                "Frame length {} does not match frame size {}",
                bytes.len(),
                self.frame_size()
            )));
        }

        let slot = (self.next_seq % self.header.slot_count as u64) as u32;
        self.region.write_at(self.header.slot_offset(slot), bytes);
        self.region
            .last_write_ns()
            .store(timestamp_ns, Ordering::Release);
        self.next_seq = self.region.seq().fetch_add(1, Ordering::Release) + 1;
        Ok(self.next_seq)
    }

    /// Unlink the region. Readers that already mapped it keep working
    /// until they close.
    pub fn close(&mut self) -> BridgeResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.region.is_current() {
            tracing::debug!(path = %self.region.path().display(), "Frame Bus region already replaced");
            return Ok(());
        }
        match std::fs::remove_file(self.region.path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BridgeError::shared_memory(format!(
                    "Failed to unlink Frame Bus region: {e}"
                )))
            }
        }
        tracing::info!(path = %self.region.path().display(), "Frame Bus writer closed");
        Ok(())
    }
}

impl Drop for FrameBusWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
