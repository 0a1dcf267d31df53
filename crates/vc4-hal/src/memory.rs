//! # Bus Memory Mapping
//!
//! GPU buffers are allocated by the firmware and identified by their
//! VideoCore bus address. A [`PhysicalMapper`] turns such a range into a
//! [`HostMapping`] the ARM side can read and write.

use std::any::Any;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use vc4_core::{BusAddr, ByteSize, Error, Result};

// =============================================================================
// PHYSICAL MAPPER
// =============================================================================

/// Maps GPU bus ranges into the host address space
pub trait PhysicalMapper: Send + Sync {
    /// Map `size` bytes starting at `bus`
    fn map(&self, bus: BusAddr, size: usize) -> Result<HostMapping>;
}

// =============================================================================
// HOST MAPPING
// =============================================================================

enum Backing {
    Mmap(#[allow(dead_code)] MmapRaw),
    Shared(#[allow(dead_code)] Arc<dyn Any + Send + Sync>),
}

/// Host view of a GPU memory range
///
/// All accessors are bounds-checked against the mapped length. Concurrent
/// access to the same bytes from host and GPU is ordered by the command
/// engine, not by this type.
pub struct HostMapping {
    ptr: NonNull<u8>,
    len: usize,
    _backing: Backing,
}

// SAFETY: the mapping is plain memory and the backing keeps it alive; every
// access goes through raw pointer copies with explicit bounds.
unsafe impl Send for HostMapping {}
// SAFETY: see above.
unsafe impl Sync for HostMapping {}

impl HostMapping {
    /// Wrap memory owned by `owner`
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay valid for reads and writes while `owner`
    /// is alive.
    pub unsafe fn from_shared(
        ptr: NonNull<u8>,
        len: usize,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            len,
            _backing: Backing::Shared(owner),
        }
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw host pointer to the first byte
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::InvalidBufferSize),
        }
    }

    /// Copy bytes out of the mapping
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // SAFETY: range checked above; `dst` is a distinct host slice
        unsafe {
            core::ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy bytes into the mapping
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // SAFETY: range checked above; `src` is a distinct host slice
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Repeat `pattern` over `len` bytes starting at `offset`
    pub fn fill(&self, offset: usize, len: usize, pattern: &[u8]) -> Result<()> {
        if pattern.is_empty() || len % pattern.len() != 0 {
            return Err(Error::InvalidValue);
        }
        self.check(offset, len)?;
        for chunk in 0..len / pattern.len() {
            self.write(offset + chunk * pattern.len(), pattern)?;
        }
        Ok(())
    }

    /// Copy `len` bytes from another mapping, which may be this one
    pub fn copy_from(
        &self,
        dst_offset: usize,
        src: &HostMapping,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.check(dst_offset, len)?;
        src.check(src_offset, len)?;
        // SAFETY: both ranges checked; `copy` tolerates overlap
        unsafe {
            core::ptr::copy(src.as_ptr().add(src_offset), self.as_ptr().add(dst_offset), len);
        }
        Ok(())
    }
}

impl fmt::Debug for HostMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMapping")
            .field("ptr", &self.ptr)
            .field("len", &ByteSize::from_bytes(self.len as u64))
            .finish()
    }
}

// =============================================================================
// /dev/mem MAPPER
// =============================================================================

/// Maps bus ranges through `/dev/mem`
#[derive(Debug)]
pub struct DevMemMapper {
    file: File,
}

impl DevMemMapper {
    /// Open the physical memory device
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| {
                log::error!("cannot open {}: {}", path.display(), e);
                Error::DeviceNotAvailable
            })?;
        Ok(Self { file })
    }
}

impl PhysicalMapper for DevMemMapper {
    fn map(&self, bus: BusAddr, size: usize) -> Result<HostMapping> {
        let phys = bus.to_phys();
        let delta = ByteSize::PAGE.offset_of(phys);
        let aligned = phys - delta;
        let delta = delta as usize;

        let map = MmapOptions::new()
            .offset(aligned)
            .len(size + delta)
            .map_raw(&self.file)
            .map_err(|e| {
                log::error!("cannot map {} at {}: {}", ByteSize::from_bytes(size as u64), bus, e);
                Error::MappingFailed
            })?;

        // SAFETY: `delta` is below one page and the mapping covers
        // `size + delta` bytes.
        let ptr = unsafe { map.as_mut_ptr().add(delta) };
        let ptr = NonNull::new(ptr).ok_or(Error::MappingFailed)?;
        Ok(HostMapping {
            ptr,
            len: size,
            _backing: Backing::Mmap(map),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_mapping(len: usize) -> HostMapping {
        let mut storage = vec![0u8; len];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        let owner: Arc<Vec<u8>> = Arc::new(storage);
        // SAFETY: the vector is kept alive by the mapping and never resized
        unsafe { HostMapping::from_shared(ptr, len, owner) }
    }

    #[test]
    fn test_read_write_bounds() {
        let m = heap_mapping(8);
        m.write(4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        m.read(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(m.write(6, &[0; 4]), Err(Error::InvalidBufferSize));
        assert_eq!(m.read(usize::MAX, &mut out), Err(Error::InvalidBufferSize));
    }

    #[test]
    fn test_fill_pattern() {
        let m = heap_mapping(8);
        m.fill(2, 6, &[0xAB, 0xCD]).unwrap();
        let mut out = [0u8; 8];
        m.read(0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD]);
        assert_eq!(m.fill(0, 5, &[1, 2]), Err(Error::InvalidValue));
    }

    #[test]
    fn test_copy_between_mappings() {
        let a = heap_mapping(4);
        let b = heap_mapping(4);
        a.write(0, b"abcd").unwrap();
        b.copy_from(1, &a, 0, 3).unwrap();
        let mut out = [0u8; 4];
        b.read(0, &mut out).unwrap();
        assert_eq!(&out, b"\0abc");
    }
}
