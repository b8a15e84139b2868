//! FrameBridge Frame Bus
//!
//! Shared-memory transport between the compositing host and output
//! helpers. One writer and one reader per name; no locks, no queue. The
//! writer publishes into a small ring of slots and bumps an atomic
//! sequence number; the reader copies whatever slot the sequence points
//! at. Latest frame wins.
//!
//! ```text
//! ┌──────────────┬──────────┬──────────┬──────────┐
//! │ header (128) │  slot 0  │  slot 1  │  slot 2  │
//! └──────────────┴──────────┴──────────┴──────────┘
//!        ▲ seq (atomic, bumped last)
//! ```

pub mod header;
pub mod reader;
pub mod region;
pub mod writer;

use std::path::Path;

use framebridge_common::error::BridgeResult;

pub use header::{FrameBusHeader, PixelFormat, FRAME_BUS_MAGIC, FRAME_BUS_VERSION, HEADER_SIZE};
pub use reader::{BusFrame, FrameBusReader};
pub use region::{default_shm_dir, normalize_name, region_path};
pub use writer::{FrameBusWriter, WriterConfig};

/// Allocate (or reopen) a named region for writing.
pub fn create_writer(config: &WriterConfig) -> BridgeResult<FrameBusWriter> {
    FrameBusWriter::create(config)
}

/// Open a named region for reading.
pub fn open_reader(name: &str, shm_dir: Option<&Path>) -> BridgeResult<FrameBusReader> {
    FrameBusReader::open(name, shm_dir)
}

/// Read and validate the header of a region without keeping it open.
pub fn inspect(name: &str, shm_dir: Option<&Path>) -> BridgeResult<FrameBusHeader> {
    let reader = FrameBusReader::open(name, shm_dir)?;
    let mut header = *reader.header();
    header.seq = reader.current_seq();
    reader.close();
    Ok(header)
}
