//! # V3D Register Interface
//!
//! Identification decoding and the user-program request queue of the
//! VideoCore IV 3D block.
//!
//! The register window is mapped once and shared. All access goes through a
//! single lock: short queries take it for one read, a dispatch holds it for
//! the whole submit-and-poll sequence through a [`V3dGuard`].

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use vc4_core::{BusAddr, Error, Result};

use crate::mmio::{check_offset, extract_field, MmioRegion, RegisterWindow};
use crate::platform::{PlatformInfo, V3D_WINDOW_SIZE};

// =============================================================================
// REGISTER MAP
// =============================================================================

/// V3D register offsets
pub mod registers {
    /// Identification 0: technology version and "V3D" signature
    pub const IDENT0: u32 = 0x0000;
    /// Identification 1: slice, QPU, semaphore and VPM counts
    pub const IDENT1: u32 = 0x0004;
    /// Identification 2: cache and tile configuration
    pub const IDENT2: u32 = 0x0008;
    /// L2 cache control
    pub const L2CACTL: u32 = 0x0020;
    /// Slice cache control
    pub const SLCACTL: u32 = 0x0024;
    /// Interrupt control
    pub const INTCTL: u32 = 0x0030;
    /// Interrupt enables
    pub const INTENA: u32 = 0x0034;
    /// Interrupt disables
    pub const INTDIS: u32 = 0x0038;
    /// QPU reservation 0 (QPUs 0..7)
    pub const SQRSV0: u32 = 0x0410;
    /// QPU reservation 1 (QPUs 8..15)
    pub const SQRSV1: u32 = 0x0414;
    /// QPU scheduler control
    pub const SQCNTL: u32 = 0x0418;
    /// User program request program counter (starts the request)
    pub const SRQPC: u32 = 0x0430;
    /// User program request uniforms address
    pub const SRQUA: u32 = 0x0434;
    /// User program request uniforms length
    pub const SRQUL: u32 = 0x0438;
    /// User program request control/status
    pub const SRQCS: u32 = 0x043C;
    /// VPM base (user memory reservation)
    pub const VPMBASE: u32 = 0x0504;
    /// QPU interrupt enables
    pub const DBQITE: u32 = 0x0E2C;
    /// QPU interrupt control
    pub const DBQITC: u32 = 0x0E30;
    /// Miscellaneous error signals
    pub const ERRSTAT: u32 = 0x0F20;
}

/// `SRQCS` fields
pub mod srqcs {
    /// Queue error flag (write 1 to clear)
    pub const ERROR: u32 = 1 << 7;
    /// Clear the request count
    pub const RESET_REQUESTS: u32 = 1 << 8;
    /// Clear the completed count
    pub const RESET_COMPLETED: u32 = 1 << 16;
    /// Clears error and both counters
    pub const RESET_ALL: u32 = ERROR | RESET_REQUESTS | RESET_COMPLETED;
    /// Low bit of the completed-request count
    pub const COMPLETED_LOW: u8 = 16;
    /// High bit of the completed-request count
    pub const COMPLETED_HIGH: u8 = 23;
}

/// Signature in the low 24 bits of `IDENT0` ("V3D" in little-endian ASCII)
pub const V3D_SIGNATURE: u32 = 0x0044_3356;

// =============================================================================
// SYSTEM INFO
// =============================================================================

/// Capacity fields decoded from the identification registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemInfo {
    /// Total VPM size in bytes
    VpmMemorySize,
    /// VPM bytes reserved for user programs
    VpmUserMemorySize,
    /// Number of hardware semaphores
    SemaphoresCount,
    /// Total number of QPUs
    QpuCount,
    /// Number of slices
    SlicesCount,
}

// =============================================================================
// V3D
// =============================================================================

/// Shared handle to the V3D register window
pub struct V3d {
    window: Box<dyn RegisterWindow>,
    lock: Mutex<()>,
}

impl V3d {
    /// Wrap a register window, checking the identification signature
    pub fn new(window: Box<dyn RegisterWindow>) -> Result<Self> {
        let v3d = Self {
            window,
            lock: Mutex::new(()),
        };
        let ident0 = v3d.read_register(registers::IDENT0)?;
        if ident0 & 0x00FF_FFFF != V3D_SIGNATURE {
            log::error!("V3D signature mismatch: IDENT0 = 0x{:08x}", ident0);
            return Err(Error::DeviceNotFound);
        }
        log::info!(
            "V3D technology version {}, {} QPUs",
            ident0 >> 24,
            v3d.system_info(SystemInfo::QpuCount)?
        );
        Ok(v3d)
    }

    /// Map the hardware registers through `/dev/mem`
    pub fn open(dev_mem: &std::path::Path, platform: &PlatformInfo) -> Result<Self> {
        let region = MmioRegion::map(dev_mem, platform.v3d_base(), V3D_WINDOW_SIZE)?;
        Self::new(Box::new(region))
    }

    /// Take exclusive access to the register window
    pub fn lock(&self) -> V3dGuard<'_> {
        let guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        V3dGuard {
            v3d: self,
            _guard: guard,
        }
    }

    /// Read one register
    pub fn read_register(&self, offset: u32) -> Result<u32> {
        self.lock().read(offset)
    }

    /// Write one register
    pub fn write_register(&self, offset: u32, value: u32) -> Result<()> {
        self.lock().write(offset, value)
    }

    /// Decode one capacity field
    pub fn system_info(&self, field: SystemInfo) -> Result<u32> {
        let guard = self.lock();
        let ident1 = guard.read(registers::IDENT1)?;
        let value = match field {
            SystemInfo::VpmMemorySize => {
                // 0 encodes the full 16 KiB
                match extract_field(ident1, 28, 31) {
                    0 => 16 * 1024,
                    kib => kib * 1024,
                }
            }
            SystemInfo::VpmUserMemorySize => {
                extract_field(guard.read(registers::VPMBASE)?, 0, 4) * 256
            }
            SystemInfo::SemaphoresCount => extract_field(ident1, 16, 23),
            SystemInfo::QpuCount => extract_field(ident1, 8, 11) * extract_field(ident1, 4, 7),
            SystemInfo::SlicesCount => extract_field(ident1, 4, 7),
        };
        Ok(value)
    }
}

impl std::fmt::Debug for V3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V3d")
            .field("window_size", &self.window.size())
            .finish()
    }
}

// =============================================================================
// LOCKED ACCESS
// =============================================================================

/// Exclusive access to the V3D registers
#[derive(Debug)]
pub struct V3dGuard<'a> {
    v3d: &'a V3d,
    _guard: MutexGuard<'a, ()>,
}

impl V3dGuard<'_> {
    /// Read one register
    pub fn read(&self, offset: u32) -> Result<u32> {
        check_offset(self.v3d.window.as_ref(), offset)?;
        Ok(self.v3d.window.read32(offset))
    }

    /// Write one register
    pub fn write(&self, offset: u32, value: u32) -> Result<()> {
        check_offset(self.v3d.window.as_ref(), offset)?;
        self.v3d.window.write32(offset, value);
        Ok(())
    }

    /// Clear the user-program queue counters and error flag and mask QPU
    /// interrupts so completion is observed by polling
    pub fn reset_user_queue(&self) -> Result<()> {
        self.write(registers::DBQITE, 0)?;
        self.write(registers::DBQITC, 0xFFFF)?;
        self.write(registers::SRQCS, srqcs::RESET_ALL)
    }

    /// Number of user programs completed since the last reset (mod 256)
    pub fn completed_programs(&self) -> Result<u32> {
        let status = self.read(registers::SRQCS)?;
        Ok(extract_field(status, srqcs::COMPLETED_LOW, srqcs::COMPLETED_HIGH))
    }

    /// Queue one user program
    pub fn submit_program(&self, code: BusAddr, uniforms: BusAddr, uniform_count: u32) -> Result<()> {
        self.write(registers::SRQUL, uniform_count)?;
        self.write(registers::SRQUA, uniforms.raw())?;
        self.write(registers::SRQPC, code.raw())
    }

    /// Poll until `expected` programs have completed
    pub fn wait_for_programs(&self, expected: u32, timeout: Duration, interval: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let status = self.read(registers::SRQCS)?;
            if status & srqcs::ERROR != 0 {
                let errstat = self.read(registers::ERRSTAT)?;
                log::error!("QPU user program fault: SRQCS 0x{:08x} ERRSTAT 0x{:08x}", status, errstat);
                return Err(Error::GpuFault);
            }
            let completed = extract_field(status, srqcs::COMPLETED_LOW, srqcs::COMPLETED_HIGH);
            if completed >= expected {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                log::warn!("QPU dispatch timed out: {}/{} programs done", completed, expected);
                return Err(Error::Timeout);
            }
            if interval.is_zero() {
                std::hint::spin_loop();
            } else {
                thread::sleep(interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedGpu, SimulatedMemory};

    fn sim_v3d() -> V3d {
        let memory = SimulatedMemory::new(64 * 1024);
        V3d::new(Box::new(SimulatedGpu::new(memory))).unwrap()
    }

    #[test]
    fn test_system_info_decoding() {
        let v3d = sim_v3d();
        assert_eq!(v3d.system_info(SystemInfo::SlicesCount), Ok(3));
        assert_eq!(v3d.system_info(SystemInfo::QpuCount), Ok(12));
        assert_eq!(v3d.system_info(SystemInfo::SemaphoresCount), Ok(16));
        assert_eq!(v3d.system_info(SystemInfo::VpmMemorySize), Ok(16 * 1024));
        assert_eq!(v3d.system_info(SystemInfo::VpmUserMemorySize), Ok(4096));
    }

    #[test]
    fn test_register_bounds() {
        let v3d = sim_v3d();
        assert!(v3d.read_register(registers::ERRSTAT).is_ok());
        assert_eq!(v3d.read_register(0x1000), Err(Error::MmioError));
        assert_eq!(v3d.write_register(0x0002, 0), Err(Error::MisalignedAddress));
    }

    #[test]
    fn test_bad_signature_rejected() {
        struct Blank;
        impl RegisterWindow for Blank {
            fn size(&self) -> u32 {
                0x1000
            }
            fn read32(&self, _offset: u32) -> u32 {
                0
            }
            fn write32(&self, _offset: u32, _value: u32) {}
        }
        assert_eq!(V3d::new(Box::new(Blank)).err(), Some(Error::DeviceNotFound));
    }

    #[test]
    fn test_queue_reset_clears_counters() {
        let v3d = sim_v3d();
        let guard = v3d.lock();
        guard.write(registers::SRQCS, 0).unwrap();
        guard.reset_user_queue().unwrap();
        assert_eq!(guard.completed_programs(), Ok(0));
    }
}
