//! # Memory-Mapped I/O Operations
//!
//! Register windows over the V3D block. The hardware window maps a page of
//! `/dev/mem`; the simulated window in [`crate::sim`] implements the same
//! trait so everything above this layer is backend-agnostic.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use memmap2::{MmapOptions, MmapRaw};
use vc4_core::{ByteSize, Error, Result};

// =============================================================================
// REGISTER WINDOW
// =============================================================================

/// A block of 32-bit registers
///
/// Implementations perform the raw access only. Bounds and alignment are
/// checked by [`check_offset`] before any call reaches them.
pub trait RegisterWindow: Send + Sync {
    /// Window size in bytes
    fn size(&self) -> u32;

    /// Read one register
    fn read32(&self, offset: u32) -> u32;

    /// Write one register
    fn write32(&self, offset: u32, value: u32);
}

/// Validate a register offset against a window
pub fn check_offset(window: &dyn RegisterWindow, offset: u32) -> Result<()> {
    if offset % 4 != 0 {
        return Err(Error::MisalignedAddress);
    }
    if offset.checked_add(4).map_or(true, |end| end > window.size()) {
        return Err(Error::MmioError);
    }
    Ok(())
}

// =============================================================================
// MMIO REGION
// =============================================================================

/// Physical register block mapped through `/dev/mem`
#[derive(Debug)]
pub struct MmioRegion {
    map: MmapRaw,
    size: ByteSize,
}

impl MmioRegion {
    /// Map `size` bytes of physical memory at `phys`
    ///
    /// `phys` must be page aligned. The device node is opened with `O_SYNC`
    /// so the mapping is uncached.
    pub fn map(dev_mem: &Path, phys: u64, size: usize) -> Result<Self> {
        if ByteSize::PAGE.offset_of(phys) != 0 {
            return Err(Error::MisalignedAddress);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(dev_mem)
            .map_err(|e| {
                log::error!("cannot open {}: {}", dev_mem.display(), e);
                Error::DeviceNotAvailable
            })?;

        let map = MmapOptions::new()
            .offset(phys)
            .len(size)
            .map_raw(&file)
            .map_err(|e| {
                log::error!("cannot map registers at 0x{:x}: {}", phys, e);
                Error::MappingFailed
            })?;

        log::debug!("mapped {} of registers at 0x{:x}", ByteSize::from_bytes(size as u64), phys);
        Ok(Self {
            map,
            size: ByteSize::from_bytes(size as u64),
        })
    }

    /// Get region size
    pub fn size(&self) -> ByteSize {
        self.size
    }

    fn register_ptr(&self, offset: u32) -> *mut u32 {
        // SAFETY: offsets are validated by `check_offset` before access, so
        // the resulting pointer stays inside the mapping.
        unsafe { self.map.as_mut_ptr().add(offset as usize) as *mut u32 }
    }
}

impl RegisterWindow for MmioRegion {
    fn size(&self) -> u32 {
        self.size.as_bytes() as u32
    }

    fn read32(&self, offset: u32) -> u32 {
        fence::mmio_read_barrier();
        // SAFETY: aligned in-bounds register of a live mapping
        unsafe { core::ptr::read_volatile(self.register_ptr(offset)) }
    }

    fn write32(&self, offset: u32, value: u32) {
        fence::mmio_write_barrier();
        // SAFETY: aligned in-bounds register of a live mapping
        unsafe { core::ptr::write_volatile(self.register_ptr(offset), value) }
    }
}

// =============================================================================
// MMIO UTILS
// =============================================================================

/// Helper to extract fields from register values
pub const fn extract_field(value: u32, low_bit: u8, high_bit: u8) -> u32 {
    let width = high_bit - low_bit + 1;
    let mask = if width >= 32 {
        u32::MAX
    } else {
        ((1u32 << width) - 1) << low_bit
    };
    (value & mask) >> low_bit
}

/// Helper to insert field into register value
pub const fn insert_field(value: u32, field: u32, low_bit: u8, high_bit: u8) -> u32 {
    let width = high_bit - low_bit + 1;
    let mask = if width >= 32 {
        u32::MAX
    } else {
        ((1u32 << width) - 1) << low_bit
    };
    (value & !mask) | ((field << low_bit) & mask)
}

// =============================================================================
// MEMORY FENCE OPERATIONS
// =============================================================================

/// Memory barrier types for MMIO
pub mod fence {
    use core::sync::atomic::{fence, Ordering};

    /// Barrier before an MMIO write
    #[inline(always)]
    pub fn mmio_write_barrier() {
        fence(Ordering::Release);
    }

    /// Barrier after an MMIO read
    #[inline(always)]
    pub fn mmio_read_barrier() {
        fence(Ordering::Acquire);
    }
}
