//! # Simulated Firmware
//!
//! Answers property requests against a [`SimulatedGpu`]: memory tags manage
//! allocations in its bus memory, `ExecuteQpu` runs the control block through
//! its program emulators, and board queries return Raspberry Pi 3 values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use spin::Mutex;
use vc4_core::{BusAddr, Error, Result};
use vc4_hal::sim::SimulatedGpu;

use crate::mailbox::{Clock, MemFlags};
use crate::message::{code, Tag, HEADER_WORDS, RESPONSE_BIT};
use crate::transport::Transport;

// =============================================================================
// FAULT INJECTION
// =============================================================================

/// Misbehaviour applied to the next exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with one word fewer than the tag defines
    ShortResponse,
    /// Report a buffer parsing error
    Rejected,
    /// Echo a different tag id
    WrongTag,
    /// Fail the exchange itself
    Transport,
}

// =============================================================================
// FIRMWARE STATE
// =============================================================================

const FIRMWARE_REVISION: u32 = 0x5D9_5D9E;
const BOARD_REVISION: u32 = 0x00A0_2082;
const MAC_LOW: u32 = 0x12EB_27B8;
const MAC_HIGH: u32 = 0x0000_5634;
const SERIAL: [u32; 2] = [0x1234_ABCD, 0x0000_0000];
const ARM_MEMORY: (u32, u32) = (0x0000_0000, 0x3B00_0000);
const VC_MEMORY: (u32, u32) = (0x3B00_0000, 0x0500_0000);
const TEMPERATURE: u32 = 45_464;
const MAX_TEMPERATURE: u32 = 85_000;

#[derive(Debug, Clone, Copy)]
struct ClockState {
    current: u32,
    min: u32,
    max: u32,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    bus: BusAddr,
    locked: bool,
}

struct FirmwareState {
    gpu: SimulatedGpu,
    allocations: Mutex<BTreeMap<u32, Allocation>>,
    clocks: Mutex<BTreeMap<u32, ClockState>>,
    next_handle: AtomicU32,
    qpu_enabled: AtomicBool,
    fault: Mutex<Option<Fault>>,
}

/// Firmware stand-in implementing the mailbox transport
#[derive(Clone)]
pub struct SimulatedFirmware {
    state: Arc<FirmwareState>,
}

impl SimulatedFirmware {
    /// Firmware driving `gpu`
    pub fn new(gpu: SimulatedGpu) -> Self {
        let mhz = 1_000_000;
        let mut clocks = BTreeMap::new();
        for (clock, min, max) in [
            (Clock::Arm, 600 * mhz, 1200 * mhz),
            (Clock::Core, 250 * mhz, 400 * mhz),
            (Clock::V3d, 250 * mhz, 300 * mhz),
            (Clock::Pwm, 0, 500 * mhz),
        ] {
            clocks.insert(
                clock as u32,
                ClockState {
                    current: max,
                    min,
                    max,
                },
            );
        }

        Self {
            state: Arc::new(FirmwareState {
                gpu,
                allocations: Mutex::new(BTreeMap::new()),
                clocks: Mutex::new(clocks),
                next_handle: AtomicU32::new(1),
                qpu_enabled: AtomicBool::new(false),
                fault: Mutex::new(None),
            }),
        }
    }

    /// GPU behind this firmware
    pub fn gpu(&self) -> &SimulatedGpu {
        &self.state.gpu
    }

    /// Whether the QPUs are powered
    pub fn qpu_enabled(&self) -> bool {
        self.state.qpu_enabled.load(Ordering::Acquire)
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.state.allocations.lock().len()
    }

    /// Misbehave on the next exchange
    pub fn inject(&self, fault: Fault) {
        *self.state.fault.lock() = Some(fault);
    }

    fn answer(&self, tag: Tag, request: &[u32]) -> Vec<u32> {
        let arg = |i: usize| request.get(i).copied().unwrap_or(0);
        match tag {
            Tag::FirmwareRevision => vec![FIRMWARE_REVISION],
            Tag::BoardModel => vec![0],
            Tag::BoardRevision => vec![BOARD_REVISION],
            Tag::MacAddress => vec![MAC_LOW, MAC_HIGH],
            Tag::BoardSerial => SERIAL.to_vec(),
            Tag::ArmMemory => vec![ARM_MEMORY.0, ARM_MEMORY.1],
            Tag::VcMemory => vec![VC_MEMORY.0, VC_MEMORY.1],
            Tag::GetClockRate | Tag::GetMaxClockRate | Tag::GetMinClockRate => {
                let clocks = self.state.clocks.lock();
                let rate = clocks.get(&arg(0)).map_or(0, |c| match tag {
                    Tag::GetMaxClockRate => c.max,
                    Tag::GetMinClockRate => c.min,
                    _ => c.current,
                });
                vec![arg(0), rate]
            }
            Tag::SetClockRate => {
                let mut clocks = self.state.clocks.lock();
                let rate = clocks.get_mut(&arg(0)).map_or(0, |c| {
                    c.current = arg(1).clamp(c.min, c.max);
                    c.current
                });
                vec![arg(0), rate]
            }
            Tag::GetTemperature => vec![arg(0), TEMPERATURE],
            Tag::GetMaxTemperature => vec![arg(0), MAX_TEMPERATURE],
            Tag::AllocateMemory => vec![self.allocate(arg(0), arg(1), MemFlags::from_bits_truncate(arg(2)))],
            Tag::LockMemory => {
                let mut allocations = self.state.allocations.lock();
                let bus = allocations.get_mut(&arg(0)).map_or(0, |a| {
                    a.locked = true;
                    a.bus.raw()
                });
                vec![bus]
            }
            Tag::UnlockMemory => {
                let mut allocations = self.state.allocations.lock();
                let status = allocations.get_mut(&arg(0)).map_or(1, |a| {
                    a.locked = false;
                    0
                });
                vec![status]
            }
            Tag::ReleaseMemory => vec![self.release(arg(0))],
            Tag::EnableQpu => {
                self.state.qpu_enabled.store(arg(0) != 0, Ordering::Release);
                vec![0]
            }
            Tag::ExecuteQpu => vec![self.execute(arg(0), BusAddr::new(arg(1)))],
        }
    }

    fn allocate(&self, size: u32, align: u32, flags: MemFlags) -> u32 {
        let memory = self.state.gpu.memory();
        let Ok(bus) = memory.allocate(size, align.max(1)) else {
            return 0;
        };
        if flags.contains(MemFlags::ZERO) && memory.write(bus, &vec![0u8; size as usize]).is_err() {
            return 0;
        }
        let handle = self.state.next_handle.fetch_add(1, Ordering::AcqRel);
        self.state.allocations.lock().insert(
            handle,
            Allocation { bus, locked: false },
        );
        handle
    }

    fn release(&self, handle: u32) -> u32 {
        let Some(allocation) = self.state.allocations.lock().remove(&handle) else {
            return 1;
        };
        if allocation.locked {
            log::warn!("simulated firmware: releasing locked allocation {}", handle);
        }
        match self.state.gpu.memory().free(allocation.bus) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }

    fn execute(&self, num_qpus: u32, control: BusAddr) -> u32 {
        if !self.qpu_enabled() {
            return 0x8000_0000;
        }
        let memory = self.state.gpu.memory();
        for qpu in 0..num_qpus {
            let entry = control + qpu * 8;
            let run = memory.read_u32(entry).and_then(|uniforms| {
                let code = memory.read_u32(entry + 4)?;
                self.state
                    .gpu
                    .execute(BusAddr::new(code), BusAddr::new(uniforms), u32::MAX)
            });
            if let Err(e) = run {
                log::warn!("simulated firmware: QPU {} failed: {}", qpu, e);
                return 0x8000_0000;
            }
        }
        0
    }
}

impl Transport for SimulatedFirmware {
    fn exchange(&self, buffer: &mut [u32]) -> Result<()> {
        let fault = self.state.fault.lock().take();
        if fault == Some(Fault::Transport) {
            return Err(Error::MailboxTransport);
        }
        if buffer.len() < HEADER_WORDS + 1 || buffer[0] as usize != buffer.len() * 4 {
            return Err(Error::InvalidValue);
        }

        let capacity = buffer[3] as usize / 4;
        let Some(tag) = Tag::from_raw(buffer[2]) else {
            buffer[1] = code::SUCCESS;
            return Ok(());
        };
        let request = buffer[HEADER_WORDS..HEADER_WORDS + capacity].to_vec();
        let mut values = self.answer(tag, &request);

        match fault {
            Some(Fault::ShortResponse) => {
                values.pop();
            }
            Some(Fault::Rejected) => {
                buffer[1] = code::ERROR;
                return Ok(());
            }
            Some(Fault::WrongTag) => buffer[2] = !buffer[2],
            _ => {}
        }

        let written = values.len().min(capacity);
        buffer[HEADER_WORDS..HEADER_WORDS + written].copy_from_slice(&values[..written]);
        buffer[1] = code::SUCCESS;
        buffer[4] = RESPONSE_BIT | (values.len() * 4) as u32;
        Ok(())
    }
}

impl fmt::Debug for SimulatedFirmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedFirmware")
            .field("gpu", &self.state.gpu)
            .field("allocations", &self.allocation_count())
            .field("qpu_enabled", &self.qpu_enabled())
            .finish()
    }
}
