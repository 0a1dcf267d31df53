//! # Buffers
//!
//! Device-visible memory allocated through the firmware, locked for its
//! whole lifetime and mapped into the host once at creation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use vc4_core::{BusAddr, ByteSize, Error, Handle, Result};
use vc4_hal::HostMapping;
use vc4_mailbox::GpuMemory;

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::device::Device;
use crate::info::InfoValue;

bitflags! {
    /// Buffer creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u64 {
        /// Kernels read and write
        const READ_WRITE = 1 << 0;
        /// Kernels only write
        const WRITE_ONLY = 1 << 1;
        /// Kernels only read
        const READ_ONLY = 1 << 2;
        /// Use the caller's memory as storage
        const USE_HOST_PTR = 1 << 3;
        /// Host-accessible storage
        const ALLOC_HOST_PTR = 1 << 4;
        /// Initialise from caller data
        const COPY_HOST_PTR = 1 << 5;
    }
}

impl BufferFlags {
    const ACCESS: Self = Self::READ_WRITE.union(Self::WRITE_ONLY).union(Self::READ_ONLY);

    /// Check flag combinations against the supplied host data
    ///
    /// Returns the flags with the default access mode filled in.
    pub fn validate(raw: u64, has_host_data: bool) -> Result<Self> {
        let flags = Self::from_bits(raw).ok_or(Error::InvalidValue)?;
        if (flags & Self::ACCESS).bits().count_ones() > 1 {
            return Err(Error::InvalidValue);
        }
        // device memory must come from the firmware allocator
        if flags.contains(Self::USE_HOST_PTR) {
            return Err(Error::InvalidValue);
        }
        if flags.contains(Self::COPY_HOST_PTR) != has_host_data {
            return Err(Error::InvalidHostPtr);
        }
        if flags.intersects(Self::ACCESS) {
            Ok(flags)
        } else {
            Ok(flags | Self::READ_WRITE)
        }
    }
}

// =============================================================================
// BUFFER
// =============================================================================

/// GPU memory object
#[derive(Debug)]
pub struct Buffer {
    context: Handle<Context>,
    flags: BufferFlags,
    size: usize,
    // dropped before the allocation it maps
    mapping: HostMapping,
    memory: GpuMemory,
    in_flight: AtomicU32,
}

impl Buffer {
    /// Allocate, lock and map `size` bytes, copying `host_data` in if given
    pub fn create(
        context: Handle<Context>,
        device: &Device,
        config: &RuntimeConfig,
        flags: u64,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> Result<Self> {
        let flags = BufferFlags::validate(flags, host_data.is_some())?;
        if size == 0 || size as u64 > device.max_alloc_size() || size > u32::MAX as usize {
            return Err(Error::InvalidBufferSize);
        }
        if host_data.is_some_and(|data| data.len() < size) {
            return Err(Error::InvalidHostPtr);
        }

        let memory = GpuMemory::allocate(
            device.mailbox(),
            size as u32,
            config.alloc_alignment,
            config.alloc_flags,
        )?;
        let mapping = device.mapper().map(memory.bus_addr(), size)?;
        if let Some(data) = host_data {
            mapping.write(0, &data[..size])?;
        }
        log::debug!(
            "buffer: {} at {} ({:?})",
            ByteSize::from_bytes(size as u64),
            memory.bus_addr(),
            flags
        );

        Ok(Self {
            context,
            flags,
            size,
            mapping,
            memory,
            in_flight: AtomicU32::new(0),
        })
    }

    /// Owning context
    pub fn context(&self) -> Handle<Context> {
        self.context
    }

    /// Creation flags
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address kernels see
    pub fn bus_addr(&self) -> BusAddr {
        self.memory.bus_addr()
    }

    /// Host view of the storage
    pub(crate) fn mapping(&self) -> &HostMapping {
        &self.mapping
    }

    /// Commands currently reading or writing the buffer
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Mark the buffer used by a running command
    pub(crate) fn begin_use(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(Arc::clone(self))
    }

    /// Check that `offset..offset + len` lies within the buffer
    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::InvalidValue),
        }
    }

    /// Answer a memory object query other than reference count and context
    pub fn info(&self, param: u32) -> Result<InfoValue> {
        use crate::info::mem::*;
        match param {
            TYPE => Ok(InfoValue::U32(OBJECT_BUFFER)),
            FLAGS => Ok(InfoValue::U64(self.flags.bits())),
            SIZE => Ok(InfoValue::Usize(self.size)),
            HOST_PTR => Ok(InfoValue::Usize(0)),
            MAP_COUNT => Ok(InfoValue::U32(0)),
            ASSOCIATED_MEMOBJECT => Ok(InfoValue::Handle(0)),
            OFFSET => Ok(InfoValue::Usize(0)),
            _ => Err(Error::InvalidValue),
        }
    }
}

/// In-flight mark released when the command finishes
#[derive(Debug)]
pub(crate) struct InFlight(Arc<Buffer>);

impl InFlight {
    pub(crate) fn buffer(&self) -> &Buffer {
        &self.0
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;

    fn device() -> (Device, vc4_mailbox::sim::SimulatedFirmware) {
        let (platform, firmware) = Platform::simulated(256 * 1024).unwrap();
        (Device::new(platform).unwrap(), firmware)
    }

    #[test]
    fn test_flag_validation() {
        let rw = BufferFlags::READ_WRITE.bits();
        let copy = BufferFlags::COPY_HOST_PTR.bits();
        assert_eq!(BufferFlags::validate(0, false), Ok(BufferFlags::READ_WRITE));
        assert_eq!(
            BufferFlags::validate(rw | BufferFlags::READ_ONLY.bits(), false),
            Err(Error::InvalidValue)
        );
        assert_eq!(BufferFlags::validate(copy, false), Err(Error::InvalidHostPtr));
        assert_eq!(BufferFlags::validate(rw, true), Err(Error::InvalidHostPtr));
        assert_eq!(
            BufferFlags::validate(BufferFlags::USE_HOST_PTR.bits(), true),
            Err(Error::InvalidValue)
        );
        assert_eq!(BufferFlags::validate(1 << 40, false), Err(Error::InvalidValue));
    }

    #[test]
    fn test_create_copies_host_data() {
        let (device, _fw) = device();
        let config = RuntimeConfig::default();
        let ctx = Handle::from_parts(0, 1);
        let data = [7u8; 32];
        let buffer = Buffer::create(
            ctx,
            &device,
            &config,
            BufferFlags::COPY_HOST_PTR.bits(),
            32,
            Some(&data),
        )
        .unwrap();
        let mut out = [0u8; 32];
        buffer.mapping().read(0, &mut out).unwrap();
        assert_eq!(out, data);
        assert!(buffer.bus_addr().is_aligned(config.alloc_alignment));
    }

    #[test]
    fn test_size_limits() {
        let (device, _fw) = device();
        let config = RuntimeConfig::default();
        let ctx = Handle::from_parts(0, 1);
        assert_eq!(
            Buffer::create(ctx, &device, &config, 0, 0, None).err(),
            Some(Error::InvalidBufferSize)
        );
        assert_eq!(
            Buffer::create(ctx, &device, &config, 0, 1 << 20, None).err(),
            Some(Error::AllocationFailed)
        );
    }

    #[test]
    fn test_memory_released_on_drop() {
        let (device, fw) = device();
        let config = RuntimeConfig::default();
        let buffer = Buffer::create(Handle::from_parts(0, 1), &device, &config, 0, 64, None).unwrap();
        assert_eq!(fw.allocation_count(), 1);
        drop(buffer);
        assert_eq!(fw.allocation_count(), 0);
    }

    #[test]
    fn test_in_flight_guard() {
        let (device, _fw) = device();
        let config = RuntimeConfig::default();
        let buffer = Arc::new(
            Buffer::create(Handle::from_parts(0, 1), &device, &config, 0, 16, None).unwrap(),
        );
        let guard = buffer.begin_use();
        assert_eq!(buffer.in_flight(), 1);
        assert_eq!(guard.buffer().size(), 16);
        drop(guard);
        assert_eq!(buffer.in_flight(), 0);
    }
}
