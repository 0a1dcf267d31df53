//! # VC4CL Core Types
//!
//! Fundamental type definitions used across the runtime.
//!
//! These types provide:
//! - Strong typing for addresses (VideoCore bus vs ARM physical)
//! - Byte sizes with alignment helpers
//! - Generation-checked object handles

use core::fmt;
use core::marker::PhantomData;
use core::ops::Add;

// =============================================================================
// BUS ADDRESS
// =============================================================================

/// Alias bits the VideoCore places above the physical address
pub const BUS_ALIAS_MASK: u32 = 0xC000_0000;

/// VideoCore bus address
///
/// This is the address the GPU and firmware see. It carries cache-alias bits
/// in its top two bits and must be converted before the ARM side can map it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct BusAddr(u32);

impl BusAddr {
    /// Create a new bus address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Create a null bus address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u32) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// ARM physical address of this bus address
    #[inline]
    pub const fn to_phys(self) -> u64 {
        (self.0 & !BUS_ALIAS_MASK) as u64
    }
}

impl Add<u32> for BusAddr {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        self.offset(rhs)
    }
}

impl fmt::Debug for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddr(0x{:08x})", self.0)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// One ARM page, the granularity of `/dev/mem` mappings
    pub const PAGE: Self = Self(4096);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Bytes `addr` lies past the previous multiple of this power-of-two size
    #[inline]
    pub const fn offset_of(self, addr: u64) -> u64 {
        addr & (self.0 - 1)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a runtime object
///
/// The low 32 bits index a slot in an [`ObjectTable`](crate::ObjectTable),
/// the high 32 bits carry the slot generation. Generations start at one, so
/// a live handle is never zero.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a handle from a raw id
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Build a handle from slot index and generation
    #[inline]
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self::from_raw(((generation as u64) << 32) | index as u64)
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::from_raw(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn raw(self) -> u64 {
        self.id
    }

    /// Slot index
    #[inline]
    pub const fn index(self) -> u32 {
        self.id as u32
    }

    /// Slot generation
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.id >> 32) as u32
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>({}:{})", short, self.index(), self.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    struct Marker;

    #[test]
    fn test_bus_to_phys_strips_alias() {
        assert_eq!(BusAddr::new(0xC000_1000).to_phys(), 0x1000);
        assert_eq!(BusAddr::new(0x4000_2000).to_phys(), 0x2000);
        assert_eq!(BusAddr::new(0x3EFF_F000).to_phys(), 0x3EFF_F000);
    }

    #[test]
    fn test_handle_parts() {
        let h: Handle<Marker> = Handle::from_parts(7, 3);
        assert_eq!(h.index(), 7);
        assert_eq!(h.generation(), 3);
        assert!(!h.is_null());
        assert_eq!(Handle::<Marker>::from_raw(h.raw()), h);
        assert!(Handle::<Marker>::null().is_null());
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(ByteSize::PAGE.offset_of(0x3F00_0000), 0);
        assert_eq!(ByteSize::PAGE.offset_of(0x3F00_0C10), 0xC10);
        assert_eq!(format!("{}", ByteSize::from_bytes(3 * 1024 * 1024)), "3 MiB");
    }
}
