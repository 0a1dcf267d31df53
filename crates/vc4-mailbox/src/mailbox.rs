//! # Mailbox Channel
//!
//! Typed property requests over a [`Transport`]. Each call is one complete
//! round-trip; concurrent callers are serialized so buffers never interleave.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use vc4_core::{BusAddr, Error, Result};

use crate::message::{self, Tag};
use crate::transport::Transport;

// =============================================================================
// REQUEST TYPES
// =============================================================================

/// Clock identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Clock {
    /// SD card controller
    Emmc = 1,
    /// UART
    Uart = 2,
    /// ARM cores
    Arm = 3,
    /// VideoCore core
    Core = 4,
    /// V3D block
    V3d = 5,
    /// H.264 block
    H264 = 6,
    /// Image sensor pipeline
    Isp = 7,
    /// SDRAM
    Sdram = 8,
    /// Pixel valve
    Pixel = 9,
    /// PWM
    Pwm = 10,
}

impl Clock {
    /// Look up a clock by its raw id
    pub fn from_raw(raw: u32) -> Option<Self> {
        use Clock::*;
        [Emmc, Uart, Arm, Core, V3d, H264, Isp, Sdram, Pixel, Pwm]
            .into_iter()
            .find(|c| *c as u32 == raw)
    }
}

bitflags! {
    /// GPU memory allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        /// Uncached alias (0xC bus prefix)
        const DIRECT = 1 << 2;
        /// Non-allocating in L2 (0x8 bus prefix)
        const COHERENT = 1 << 3;
        /// Allocating in L2 but not L1
        const L1_NONALLOCATING = Self::DIRECT.bits() | Self::COHERENT.bits();
        /// Zero the memory on allocation
        const ZERO = 1 << 4;
        /// Skip initialisation
        const NO_INIT = 1 << 5;
        /// Likely to stay locked
        const HINT_PERMALOCK = 1 << 6;
    }
}

/// Base and size of a memory split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Base address
    pub base: u32,
    /// Size in bytes
    pub size: u32,
}

/// Firmware handle of a GPU memory allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemHandle(pub u32);

// =============================================================================
// MAILBOX
// =============================================================================

/// Property channel to the VideoCore firmware
pub struct Mailbox {
    transport: Mutex<Box<dyn Transport>>,
}

impl Mailbox {
    /// Wrap a transport
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
        }
    }

    /// Send one tag and return its response words
    pub fn send(&self, tag: Tag, request: &[u32]) -> Result<Vec<u32>> {
        let mut buffer = message::encode(tag, request);
        {
            let transport = self
                .transport
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            transport.exchange(&mut buffer)?;
        }
        message::decode(tag, &buffer).map_err(|e| {
            log::debug!("mailbox {:?} failed: {}", tag, e);
            e
        })
    }

    fn single(&self, tag: Tag, request: &[u32]) -> Result<u32> {
        Ok(self.send(tag, request)?[0])
    }

    fn status(&self, tag: Tag, request: &[u32]) -> Result<()> {
        match self.single(tag, request)? {
            0 => Ok(()),
            status => {
                log::warn!("mailbox {:?} returned status 0x{:08x}", tag, status);
                Err(Error::FirmwareRejected)
            }
        }
    }

    // =========================================================================
    // Board information
    // =========================================================================

    /// Firmware revision
    pub fn firmware_revision(&self) -> Result<u32> {
        self.single(Tag::FirmwareRevision, &[])
    }

    /// Board model
    pub fn board_model(&self) -> Result<u32> {
        self.single(Tag::BoardModel, &[])
    }

    /// Board revision
    pub fn board_revision(&self) -> Result<u32> {
        self.single(Tag::BoardRevision, &[])
    }

    /// MAC address in network byte order
    pub fn mac_address(&self) -> Result<[u8; 6]> {
        let words = self.send(Tag::MacAddress, &[])?;
        let low = words[0].to_le_bytes();
        let high = words[1].to_le_bytes();
        Ok([low[0], low[1], low[2], low[3], high[0], high[1]])
    }

    /// Board serial number
    pub fn board_serial(&self) -> Result<u64> {
        let words = self.send(Tag::BoardSerial, &[])?;
        Ok(u64::from(words[0]) | (u64::from(words[1]) << 32))
    }

    /// ARM memory split
    pub fn arm_memory(&self) -> Result<MemoryRegion> {
        let words = self.send(Tag::ArmMemory, &[])?;
        Ok(MemoryRegion {
            base: words[0],
            size: words[1],
        })
    }

    /// VideoCore memory split
    pub fn vc_memory(&self) -> Result<MemoryRegion> {
        let words = self.send(Tag::VcMemory, &[])?;
        Ok(MemoryRegion {
            base: words[0],
            size: words[1],
        })
    }

    // =========================================================================
    // Clocks and temperature
    // =========================================================================

    fn clock_query(&self, tag: Tag, clock: Clock) -> Result<u32> {
        let words = self.send(tag, &[clock as u32])?;
        if words[0] != clock as u32 {
            return Err(Error::MalformedResponse);
        }
        Ok(words[1])
    }

    /// Current clock rate in Hz
    pub fn clock_rate(&self, clock: Clock) -> Result<u32> {
        self.clock_query(Tag::GetClockRate, clock)
    }

    /// Maximum clock rate in Hz
    pub fn max_clock_rate(&self, clock: Clock) -> Result<u32> {
        self.clock_query(Tag::GetMaxClockRate, clock)
    }

    /// Minimum clock rate in Hz
    pub fn min_clock_rate(&self, clock: Clock) -> Result<u32> {
        self.clock_query(Tag::GetMinClockRate, clock)
    }

    /// Set a clock rate, returning the rate the firmware applied
    pub fn set_clock_rate(&self, clock: Clock, hz: u32) -> Result<u32> {
        let words = self.send(Tag::SetClockRate, &[clock as u32, hz, 0])?;
        if words[0] != clock as u32 {
            return Err(Error::MalformedResponse);
        }
        Ok(words[1])
    }

    /// SoC temperature in thousandths of a degree Celsius
    pub fn temperature(&self) -> Result<u32> {
        Ok(self.send(Tag::GetTemperature, &[0])?[1])
    }

    /// Maximum safe SoC temperature in thousandths of a degree Celsius
    pub fn max_temperature(&self) -> Result<u32> {
        Ok(self.send(Tag::GetMaxTemperature, &[0])?[1])
    }

    // =========================================================================
    // GPU memory
    // =========================================================================

    /// Allocate GPU memory
    pub fn allocate_memory(&self, size: u32, align: u32, flags: MemFlags) -> Result<MemHandle> {
        match self.single(Tag::AllocateMemory, &[size, align, flags.bits()])? {
            0 => Err(Error::AllocationFailed),
            handle => Ok(MemHandle(handle)),
        }
    }

    /// Lock an allocation in place and return its bus address
    pub fn lock_memory(&self, handle: MemHandle) -> Result<BusAddr> {
        match self.single(Tag::LockMemory, &[handle.0])? {
            0 => Err(Error::AllocationFailed),
            bus => Ok(BusAddr::new(bus)),
        }
    }

    /// Unlock an allocation
    pub fn unlock_memory(&self, handle: MemHandle) -> Result<()> {
        self.status(Tag::UnlockMemory, &[handle.0])
    }

    /// Release an allocation
    pub fn release_memory(&self, handle: MemHandle) -> Result<()> {
        self.status(Tag::ReleaseMemory, &[handle.0])
    }

    // =========================================================================
    // QPU control
    // =========================================================================

    /// Power the QPUs on or off
    pub fn enable_qpu(&self, enable: bool) -> Result<()> {
        self.status(Tag::EnableQpu, &[u32::from(enable)])
    }

    /// Run `num_qpus` programs described by `(uniforms, code)` address pairs
    /// at `control`, blocking until they finish or `timeout_ms` elapses
    pub fn execute_qpu(&self, num_qpus: u32, control: BusAddr, no_flush: bool, timeout_ms: u32) -> Result<()> {
        let result = self.single(
            Tag::ExecuteQpu,
            &[num_qpus, control.raw(), u32::from(no_flush), timeout_ms],
        )?;
        if result != 0 {
            log::warn!("QPU execution via firmware returned 0x{:08x}", result);
            return Err(Error::Timeout);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").finish_non_exhaustive()
    }
}

// =============================================================================
// GPU MEMORY
// =============================================================================

/// Locked GPU allocation, unlocked and released on drop
#[derive(Debug)]
pub struct GpuMemory {
    mailbox: Arc<Mailbox>,
    handle: MemHandle,
    bus: BusAddr,
    size: u32,
}

impl GpuMemory {
    /// Allocate and lock `size` bytes
    pub fn allocate(mailbox: &Arc<Mailbox>, size: u32, align: u32, flags: MemFlags) -> Result<Self> {
        let handle = mailbox.allocate_memory(size, align, flags)?;
        let bus = match mailbox.lock_memory(handle) {
            Ok(bus) => bus,
            Err(e) => {
                if let Err(release) = mailbox.release_memory(handle) {
                    log::warn!("releasing unlockable GPU memory {:?}: {}", handle, release);
                }
                return Err(e);
            }
        };
        log::debug!("GPU memory {:?}: {} bytes at {}", handle, size, bus);
        Ok(Self {
            mailbox: Arc::clone(mailbox),
            handle,
            bus,
            size,
        })
    }

    /// Bus address of the first byte
    pub fn bus_addr(&self) -> BusAddr {
        self.bus
    }

    /// Size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Firmware handle
    pub fn handle(&self) -> MemHandle {
        self.handle
    }
}

impl Drop for GpuMemory {
    fn drop(&mut self) {
        if let Err(e) = self.mailbox.unlock_memory(self.handle) {
            log::warn!("unlocking GPU memory {:?}: {}", self.handle, e);
        }
        if let Err(e) = self.mailbox.release_memory(self.handle) {
            log::warn!("releasing GPU memory {:?}: {}", self.handle, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Fault, SimulatedFirmware};
    use vc4_hal::sim::{SimulatedGpu, SimulatedMemory};

    fn sim() -> (Arc<Mailbox>, SimulatedFirmware) {
        let gpu = SimulatedGpu::new(SimulatedMemory::new(256 * 1024));
        let firmware = SimulatedFirmware::new(gpu);
        (Arc::new(Mailbox::new(Box::new(firmware.clone()))), firmware)
    }

    #[test]
    fn test_board_queries() {
        let (mailbox, _) = sim();
        assert!(mailbox.firmware_revision().unwrap() > 0);
        let mac = mailbox.mac_address().unwrap();
        assert_eq!(&mac[..3], &[0xB8, 0x27, 0xEB]);
        let arm = mailbox.arm_memory().unwrap();
        let vc = mailbox.vc_memory().unwrap();
        assert_eq!(arm.base + arm.size, vc.base);
    }

    #[test]
    fn test_clock_rates() {
        let (mailbox, _) = sim();
        let max = mailbox.max_clock_rate(Clock::V3d).unwrap();
        let min = mailbox.min_clock_rate(Clock::V3d).unwrap();
        assert!(min <= max);
        assert_eq!(mailbox.set_clock_rate(Clock::V3d, max).unwrap(), max);
        assert_eq!(mailbox.clock_rate(Clock::V3d).unwrap(), max);
    }

    #[test]
    fn test_temperature() {
        let (mailbox, _) = sim();
        assert!(mailbox.temperature().unwrap() < mailbox.max_temperature().unwrap());
    }

    #[test]
    fn test_short_response_is_error() {
        let (mailbox, firmware) = sim();
        firmware.inject(Fault::ShortResponse);
        assert_eq!(mailbox.board_serial(), Err(Error::ShortResponse));
        assert!(mailbox.board_serial().is_ok());
    }

    #[test]
    fn test_transport_failure_is_error() {
        let (mailbox, firmware) = sim();
        firmware.inject(Fault::Transport);
        assert_eq!(mailbox.board_model(), Err(Error::MailboxTransport));
    }

    #[test]
    fn test_gpu_memory_lifecycle() {
        let (mailbox, firmware) = sim();
        {
            let mem = GpuMemory::allocate(&mailbox, 1000, 4096, MemFlags::DIRECT | MemFlags::ZERO).unwrap();
            assert!(mem.bus_addr().is_aligned(4096));
            assert_eq!(firmware.gpu().memory().allocated_bytes(), 1000);
        }
        assert_eq!(firmware.gpu().memory().allocated_bytes(), 0);
    }

    #[test]
    fn test_release_unknown_handle_rejected() {
        let (mailbox, _) = sim();
        assert_eq!(mailbox.release_memory(MemHandle(99)), Err(Error::FirmwareRejected));
    }

    #[test]
    fn test_concurrent_exchanges_do_not_interleave() {
        let (mailbox, _) = sim();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mailbox = Arc::clone(&mailbox);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(mailbox.clock_rate(Clock::Arm).map(|hz| hz > 0), Ok(true));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }
}
