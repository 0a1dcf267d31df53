//! # Device
//!
//! The single VideoCore IV GPU: its firmware channel, register window and
//! memory mapper, plus the capacity values reported by device queries.

use std::sync::Arc;

use vc4_core::{Error, Result};
use vc4_hal::platform::DEFAULT_PERIPHERAL_BASE;
use vc4_hal::sim::{SimulatedGpu, SimulatedMemory};
use vc4_hal::{DevMemMapper, PhysicalMapper, PlatformInfo, SystemInfo, V3d};
use vc4_mailbox::sim::SimulatedFirmware;
use vc4_mailbox::{Clock, Mailbox, VcioTransport};

use crate::config::RuntimeConfig;
use crate::info::{self, InfoValue};

/// Broadcom PCI vendor id
pub const VENDOR_ID: u32 = 0xA5C;
/// Device name
pub const DEVICE_NAME: &str = "VideoCore IV GPU";
/// Vendor name
pub const VENDOR_NAME: &str = "Broadcom";
/// Supported API version
pub const API_VERSION: &str = "OpenCL 1.2 VC4CL";

// =============================================================================
// PLATFORM
// =============================================================================

/// Hardware access points the runtime is built on
#[derive(Clone)]
pub struct Platform {
    /// Firmware property channel
    pub mailbox: Arc<Mailbox>,
    /// V3D register window
    pub v3d: Arc<V3d>,
    /// Bus-to-host memory mapper
    pub mapper: Arc<dyn PhysicalMapper>,
}

impl Platform {
    /// Open the real hardware through the configured device nodes
    pub fn open(config: &RuntimeConfig) -> Result<Self> {
        let transport = VcioTransport::open(&config.mailbox_path)?;
        let layout = match config.peripheral_base {
            Some(base) => PlatformInfo::with_base(base),
            None => PlatformInfo::detect(DEFAULT_PERIPHERAL_BASE),
        };
        let v3d = V3d::open(&config.mem_path, &layout)?;
        let mapper = DevMemMapper::open(&config.mem_path)?;
        Ok(Self {
            mailbox: Arc::new(Mailbox::new(Box::new(transport))),
            v3d: Arc::new(v3d),
            mapper: Arc::new(mapper),
        })
    }

    /// Software platform over `memory_len` bytes of simulated GPU memory
    ///
    /// The returned firmware exposes the GPU for registering program
    /// emulators.
    pub fn simulated(memory_len: usize) -> Result<(Self, SimulatedFirmware)> {
        let memory = SimulatedMemory::new(memory_len);
        let gpu = SimulatedGpu::new(memory.clone());
        let firmware = SimulatedFirmware::new(gpu.clone());
        let platform = Self {
            mailbox: Arc::new(Mailbox::new(Box::new(firmware.clone()))),
            v3d: Arc::new(V3d::new(Box::new(gpu))?),
            mapper: Arc::new(memory),
        };
        Ok((platform, firmware))
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("mailbox", &self.mailbox)
            .field("v3d", &self.v3d)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// The GPU, with QPUs powered for its lifetime
#[derive(Debug)]
pub struct Device {
    platform: Platform,
    qpu_count: u32,
    local_mem_size: u32,
    max_clock_mhz: u32,
    global_mem_size: u64,
}

impl Device {
    /// Power the QPUs and read the capacity values
    pub fn new(platform: Platform) -> Result<Self> {
        platform.mailbox.enable_qpu(true).map_err(|e| {
            log::error!("cannot enable QPUs: {}", e);
            Error::DeviceNotAvailable
        })?;

        let qpu_count = platform.v3d.system_info(SystemInfo::QpuCount)?;
        let local_mem_size = platform.v3d.system_info(SystemInfo::VpmUserMemorySize)?;
        let max_clock_mhz = match platform.mailbox.max_clock_rate(Clock::V3d) {
            Ok(hz) => hz / 1_000_000,
            Err(e) => {
                log::warn!("V3D clock rate unavailable: {}", e);
                0
            }
        };
        let global_mem_size = u64::from(platform.mailbox.vc_memory()?.size);

        log::info!(
            "{}: {} QPUs, {} MHz, {} KiB VPM user memory",
            DEVICE_NAME,
            qpu_count,
            max_clock_mhz,
            local_mem_size / 1024
        );

        Ok(Self {
            platform,
            qpu_count,
            local_mem_size,
            max_clock_mhz,
            global_mem_size,
        })
    }

    /// Firmware channel
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.platform.mailbox
    }

    /// Register window
    pub fn v3d(&self) -> &Arc<V3d> {
        &self.platform.v3d
    }

    /// Memory mapper
    pub fn mapper(&self) -> &Arc<dyn PhysicalMapper> {
        &self.platform.mapper
    }

    /// Number of QPUs
    pub fn qpu_count(&self) -> u32 {
        self.qpu_count
    }

    /// Largest work-group; one work-item per QPU
    pub fn max_work_group_size(&self) -> usize {
        self.qpu_count as usize
    }

    /// VPM bytes reserved for user programs
    pub fn local_mem_size(&self) -> u32 {
        self.local_mem_size
    }

    /// Largest buffer the runtime will try to allocate
    pub fn max_alloc_size(&self) -> u64 {
        self.global_mem_size
    }

    /// Answer a device query
    pub fn info(&self, param: u32) -> Result<InfoValue> {
        use info::device::*;
        let value = match param {
            TYPE => InfoValue::U64(TYPE_GPU),
            VENDOR_ID => InfoValue::U32(self::VENDOR_ID),
            MAX_COMPUTE_UNITS => InfoValue::U32(1),
            MAX_WORK_ITEM_DIMENSIONS => InfoValue::U32(3),
            MAX_WORK_GROUP_SIZE => InfoValue::Usize(self.max_work_group_size()),
            MAX_WORK_ITEM_SIZES => InfoValue::Sizes(vec![self.max_work_group_size(); 3]),
            MAX_CLOCK_FREQUENCY => InfoValue::U32(self.max_clock_mhz),
            MAX_MEM_ALLOC_SIZE => InfoValue::U64(self.max_alloc_size()),
            GLOBAL_MEM_SIZE => InfoValue::U64(self.global_mem_size),
            LOCAL_MEM_SIZE => InfoValue::U64(u64::from(self.local_mem_size)),
            AVAILABLE => InfoValue::Bool(true),
            NAME => InfoValue::Str(DEVICE_NAME.into()),
            VENDOR => InfoValue::Str(VENDOR_NAME.into()),
            DRIVER_VERSION => InfoValue::Str(env!("CARGO_PKG_VERSION").into()),
            VERSION => InfoValue::Str(API_VERSION.into()),
            _ => return Err(Error::InvalidValue),
        };
        Ok(value)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.platform.mailbox.enable_qpu(false) {
            log::warn!("cannot disable QPUs: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qpus_powered_for_device_lifetime() {
        let (platform, firmware) = Platform::simulated(64 * 1024).unwrap();
        let device = Device::new(platform).unwrap();
        assert!(firmware.qpu_enabled());
        assert_eq!(device.qpu_count(), 12);
        drop(device);
        assert!(!firmware.qpu_enabled());
    }

    #[test]
    fn test_device_info() {
        let (platform, _firmware) = Platform::simulated(64 * 1024).unwrap();
        let device = Device::new(platform).unwrap();
        assert_eq!(device.info(info::device::MAX_WORK_GROUP_SIZE), Ok(InfoValue::Usize(12)));
        assert_eq!(device.info(info::device::MAX_CLOCK_FREQUENCY), Ok(InfoValue::U32(300)));
        assert_eq!(device.info(info::device::LOCAL_MEM_SIZE), Ok(InfoValue::U64(4096)));
        assert_eq!(
            device.info(info::device::NAME).unwrap().as_str(),
            Some(DEVICE_NAME)
        );
        assert_eq!(device.info(0xDEAD), Err(Error::InvalidValue));
    }
}
