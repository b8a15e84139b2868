//! Named shared-memory regions.
//!
//! A region is a file in the shm directory mapped with `memmap2`. On Linux
//! the directory is `/dev/shm`, so a region named `foo` is the same object
//! native helpers open with `shm_open("/foo")`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;

use framebridge_common::error::{BridgeError, BridgeResult};

use crate::header::{FrameBusHeader, HEADER_SIZE, LAST_WRITE_OFFSET, SEQ_OFFSET};

const MAX_NAME_LEN: usize = 64;

/// Validate a region name and strip a leading `/`.
pub fn normalize_name(name: &str) -> BridgeResult<&str> {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    if trimmed.is_empty() {
        return Err(BridgeError::shared_memory("Frame Bus name is empty"));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(BridgeError::shared_memory(format!(
            "Frame Bus name longer than {MAX_NAME_LEN} characters"
        )));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        || trimmed.starts_with('.')
    {
        return Err(BridgeError::shared_memory(format!(
            "Invalid Frame Bus name '{trimmed}'"
        )));
    }
    Ok(trimmed)
}

/// Platform default directory backing shared regions.
pub fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Path of the region `name` inside `dir` (or the default directory).
pub fn region_path(dir: Option<&Path>, name: &str) -> BridgeResult<PathBuf> {
    let name = normalize_name(name)?;
    let dir = dir.map(Path::to_path_buf).unwrap_or_else(default_shm_dir);
    Ok(dir.join(name))
}

/// A mapped region. Header fields other than `seq` and `last_write_ns`
/// are immutable after creation; those two are only touched atomically.
pub(crate) struct SharedRegion {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
    base: *mut u8,
    len: usize,
}

// The mapping is owned by this value; concurrent access from the other
// process is coordinated through the atomic sequence number.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Create (or truncate) a region sized for `header` and write the header.
    pub(crate) fn create(path: &Path, header: &FrameBusHeader) -> BridgeResult<Self> {
        let total = header.total_size()?;
        let file = owner_only_options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                BridgeError::shared_memory(format!(
                    "Failed to create Frame Bus region {}: {e}",
                    path.display()
                ))
            })?;
        file.set_len(total as u64).map_err(|e| {
            BridgeError::shared_memory(format!("Failed to size Frame Bus region: {e}"))
        })?;

        let mut region = Self::map(path, file)?;
        region.mmap[..HEADER_SIZE as usize].copy_from_slice(&header.encode());
        Ok(region)
    }

    /// Map an existing region.
    pub(crate) fn open(path: &Path) -> BridgeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                BridgeError::shared_memory(format!(
                    "Failed to open Frame Bus region {}: {e}",
                    path.display()
                ))
            })?;
        Self::map(path, file)
    }

    fn map(path: &Path, file: File) -> BridgeResult<Self> {
        // Safety: the region file is private to this user (0600) and its
        // length is only changed by a writer recreating it, which unlinks
        // the old file first so existing mappings stay valid.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            BridgeError::shared_memory(format!("Failed to map Frame Bus region: {e}"))
        })?;
        let len = mmap.len();
        if len < HEADER_SIZE as usize {
            return Err(BridgeError::shared_memory("Frame Bus shared memory too small"));
        }
        let base = mmap.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            mmap,
            base,
            len,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Whether the file at our path is still the one we mapped. A writer
    /// recreating the same name replaces it with a new file.
    #[cfg(unix)]
    pub(crate) fn is_current(&self) -> bool {
        use std::os::unix::fs::MetadataExt;
        match (self._file.metadata(), std::fs::metadata(&self.path)) {
            (Ok(ours), Ok(on_disk)) => ours.dev() == on_disk.dev() && ours.ino() == on_disk.ino(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn is_current(&self) -> bool {
        self.path.exists()
    }

    /// Decode the header currently in the region.
    pub(crate) fn header(&self) -> BridgeResult<FrameBusHeader> {
        FrameBusHeader::decode(&self.mmap[..HEADER_SIZE as usize])
    }

    pub(crate) fn seq(&self) -> &AtomicU64 {
        self.atomic_at(SEQ_OFFSET)
    }

    pub(crate) fn last_write_ns(&self) -> &AtomicU64 {
        self.atomic_at(LAST_WRITE_OFFSET)
    }

    fn atomic_at(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= HEADER_SIZE as usize);
        // Safety: the mapping is page aligned and `offset` is a multiple of
        // 8 inside the header, so the pointer is valid and aligned for the
        // lifetime of `self`.
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    /// Copy `src` into the region at `offset`.
    pub(crate) fn write_at(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "write past end of region");
        // Safety: bounds checked above; slots never overlap the atomics.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) }
    }

    /// Copy `dst.len()` bytes out of the region at `offset`.
    pub(crate) fn read_at(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "read past end of region");
        // Safety: bounds checked above.
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len()) }
    }
}

#[cfg(unix)]
fn owner_only_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.mode(0o600);
    options
}

#[cfg(not(unix))]
fn owner_only_options() -> OpenOptions {
    OpenOptions::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_normalized_and_checked() {
        assert_eq!(normalize_name("/bridge-main").unwrap(), "bridge-main");
        assert_eq!(normalize_name("bus_01.a").unwrap(), "bus_01.a");
        assert!(normalize_name("").is_err());
        assert!(normalize_name("/").is_err());
        assert!(normalize_name("../etc/passwd").is_err());
        assert!(normalize_name("a/b").is_err());
        assert!(normalize_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn region_path_joins_directory() {
        let dir = std::env::temp_dir();
        let path = region_path(Some(&dir), "/bus").unwrap();
        assert_eq!(path, dir.join("bus"));
    }
}
