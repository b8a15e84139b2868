//! Frame Bus reader (output helper side).

use std::path::Path;
use std::sync::atomic::{fence, Ordering};

use framebridge_common::error::{BridgeError, BridgeResult};

use crate::header::FrameBusHeader;
use crate::region::{region_path, SharedRegion};

/// Bounded retries when the writer laps the slot being copied.
const MAX_READ_ATTEMPTS: usize = 8;

/// Whether slot `(seq - 1) mod slot_count` survived a copy that ended with
/// the writer at `after`. The writer starts overwriting that slot once it
/// has published `seq - 1 + slot_count`.
fn copy_is_intact(seq: u64, after: u64, slot_count: u64) -> bool {
    after.saturating_sub(seq) + 1 < slot_count
}

/// The most recent frame observed by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub bytes: Vec<u8>,
    pub timestamp_ns: u64,
    pub seq: u64,
    /// False when this is a repeat of the previous read.
    pub fresh: bool,
}

/// Single reader for a named region.
pub struct FrameBusReader {
    region: SharedRegion,
    header: FrameBusHeader,
    last: Option<BusFrame>,
    scratch: Vec<u8>,
    torn_reads: u64,
}

impl std::fmt::Debug for FrameBusReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBusReader")
            .field("path", &self.region.path())
            .field("header", &self.header)
            .field("last_seq", &self.last.as_ref().map(|f| f.seq))
            .finish()
    }
}

impl FrameBusReader {
    /// Open an existing region and validate its header before trusting
    /// any offsets.
    pub fn open(name: &str, shm_dir: Option<&Path>) -> BridgeResult<Self> {
        let path = region_path(shm_dir, name)?;
        if !path.exists() {
            return Err(BridgeError::shared_memory(format!(
                "Frame Bus region '{name}' does not exist"
            )));
        }
        let region = SharedRegion::open(&path)?;
        let header = region.header()?;
        header.validate(region.len())?;
        if header.pixel_format().is_none() {
            return Err(BridgeError::shared_memory(format!(
                "Unknown Frame Bus pixel format {}",
                header.pixel_format
            )));
        }

        tracing::debug!(
            path = %path.display(),
            width = header.width,
            height = header.height,
            slots = header.slot_count,
            "Frame Bus reader opened"
        );
        Ok(Self {
            scratch: vec![0u8; header.frame_size as usize],
            region,
            header,
            last: None,
            torn_reads: 0,
        })
    }

    /// Header as validated at open time.
    pub fn header(&self) -> &FrameBusHeader {
        &self.header
    }

    /// Number of reads that had to be retried because the writer lapped
    /// the slot mid-copy.
    pub fn torn_reads(&self) -> u64 {
        self.torn_reads
    }

    /// Current published sequence number.
    pub fn current_seq(&self) -> u64 {
        self.region.seq().load(Ordering::Acquire)
    }

    /// Read the most recently published frame.
    ///
    /// Returns `None` until the writer has published anything. When the
    /// sequence has not moved since the last call the previous frame is
    /// returned again with `fresh == false`, byte-identical.
    pub fn read_latest(&mut self) -> Option<&BusFrame> {
        let slot_count = self.header.slot_count as u64;

        for _ in 0..MAX_READ_ATTEMPTS {
            let seq = self.region.seq().load(Ordering::Acquire);
            if seq == 0 {
                return None;
            }
            if let Some(last) = self.last.as_mut() {
                if last.seq == seq {
                    last.fresh = false;
                    return self.last.as_ref();
                }
            }

            let timestamp_ns = self.region.last_write_ns().load(Ordering::Acquire);
            let slot = ((seq - 1) % slot_count) as u32;
            self.region
                .read_at(self.header.slot_offset(slot), &mut self.scratch);
            fence(Ordering::Acquire);
            let after = self.region.seq().load(Ordering::Acquire);

            if !copy_is_intact(seq, after, slot_count) {
                self.torn_reads += 1;
                continue;
            }

            let bytes = std::mem::take(&mut self.scratch);
            self.scratch = self
                .last
                .take()
                .map(|prev| prev.bytes)
                .unwrap_or_else(|| vec![0u8; bytes.len()]);
            self.last = Some(BusFrame {
                bytes,
                timestamp_ns,
                seq,
                fresh: true,
            });
            return self.last.as_ref();
        }

        // Writer kept racing us; fall back to the last complete frame.
        if let Some(last) = self.last.as_mut() {
            last.fresh = false;
        }
        self.last.as_ref()
    }

    /// Unmap the region. The region itself belongs to the writer.
    pub fn close(self) {
        tracing::debug!(path = %self.region.path().display(), "Frame Bus reader closed");
    }
}

#[cfg(test)]
mod tests {
    use super::copy_is_intact;

    #[test]
    fn copy_survives_until_the_writer_laps_the_slot() {
        assert!(copy_is_intact(5, 5, 3));
        assert!(copy_is_intact(5, 6, 3));
        assert!(!copy_is_intact(5, 7, 3));
        assert!(!copy_is_intact(5, 6, 2));
    }
}
