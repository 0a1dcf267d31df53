//! # Simulated Hardware
//!
//! A software V3D for running the runtime without a VideoCore: a register
//! file with the user-program queue semantics, a block of bus-addressable
//! memory, and host-side emulators standing in for QPU code.
//!
//! QPU programs are identified by the first 64-bit instruction word at their
//! entry address. [`SimulatedGpu::register_program`] binds that word to an
//! emulator; starting a user program whose first word is unknown faults.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use spin::{Mutex, RwLock};
use vc4_core::{BusAddr, Error, Result};

use crate::memory::{HostMapping, PhysicalMapper};
use crate::mmio::{extract_field, insert_field, RegisterWindow};
use crate::platform::V3D_WINDOW_SIZE;
use crate::v3d::{registers, srqcs};

// =============================================================================
// SIMULATED MEMORY
// =============================================================================

/// Bus address where simulated GPU memory starts (uncached alias)
pub const SIM_MEMORY_BASE: u32 = 0xC000_1000;

struct Arena {
    base: BusAddr,
    storage: NonNull<u8>,
    len: usize,
    allocations: Mutex<BTreeMap<u32, u32>>,
}

// SAFETY: storage is a heap block owned by the arena; accesses are raw
// byte copies bounded by `len`.
unsafe impl Send for Arena {}
// SAFETY: see above.
unsafe impl Sync for Arena {}

impl Drop for Arena {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.storage.as_ptr(), self.len);
        // SAFETY: produced by `Box::into_raw` in `SimulatedMemory::new`
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Bus-addressable memory shared by the simulated GPU and firmware
#[derive(Clone)]
pub struct SimulatedMemory {
    arena: Arc<Arena>,
}

impl SimulatedMemory {
    /// Create `len` bytes of zeroed memory
    pub fn new(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u8;
        let storage = NonNull::new(raw).unwrap_or(NonNull::dangling());
        Self {
            arena: Arc::new(Arena {
                base: BusAddr::new(SIM_MEMORY_BASE),
                storage,
                len,
                allocations: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// First bus address of the arena
    pub fn base(&self) -> BusAddr {
        self.arena.base
    }

    /// Arena size in bytes
    pub fn len(&self) -> usize {
        self.arena.len
    }

    /// Whether the arena has no storage
    pub fn is_empty(&self) -> bool {
        self.arena.len == 0
    }

    /// First-fit allocation of `size` bytes aligned to `align`
    pub fn allocate(&self, size: u32, align: u32) -> Result<BusAddr> {
        if size == 0 || !align.is_power_of_two() {
            return Err(Error::InvalidValue);
        }
        let mask = align - 1;
        let mut allocations = self.arena.allocations.lock();

        let mut cursor = 0u32;
        let mut placed = None;
        for (&start, &len) in allocations.iter() {
            let candidate = (cursor + mask) & !mask;
            if candidate as u64 + size as u64 <= start as u64 {
                placed = Some(candidate);
                break;
            }
            cursor = start + len;
        }
        let offset = match placed {
            Some(offset) => offset,
            None => {
                let candidate = (cursor + mask) & !mask;
                if candidate as u64 + size as u64 > self.arena.len as u64 {
                    return Err(Error::AllocationFailed);
                }
                candidate
            }
        };

        allocations.insert(offset, size);
        Ok(self.arena.base + offset)
    }

    /// Release an allocation by its start address
    pub fn free(&self, bus: BusAddr) -> Result<()> {
        let offset = self.offset_of(bus)?;
        self.arena
            .allocations
            .lock()
            .remove(&offset)
            .map(|_| ())
            .ok_or(Error::InvalidBusAddress)
    }

    /// Total bytes currently allocated
    pub fn allocated_bytes(&self) -> usize {
        self.arena.allocations.lock().values().map(|&v| v as usize).sum()
    }

    fn offset_of(&self, bus: BusAddr) -> Result<u32> {
        bus.raw()
            .checked_sub(self.arena.base.raw())
            .filter(|&o| (o as usize) < self.arena.len)
            .ok_or(Error::InvalidBusAddress)
    }

    fn range(&self, bus: BusAddr, len: usize) -> Result<*mut u8> {
        let offset = self.offset_of(bus)? as usize;
        if offset + len > self.arena.len {
            return Err(Error::InvalidBusAddress);
        }
        // SAFETY: offset + len is within the arena
        Ok(unsafe { self.arena.storage.as_ptr().add(offset) })
    }

    /// Copy bytes out of GPU memory
    pub fn read(&self, bus: BusAddr, dst: &mut [u8]) -> Result<()> {
        let src = self.range(bus, dst.len())?;
        // SAFETY: range checked; dst is a separate host buffer
        unsafe { core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copy bytes into GPU memory
    pub fn write(&self, bus: BusAddr, src: &[u8]) -> Result<()> {
        let dst = self.range(bus, src.len())?;
        // SAFETY: range checked; src is a separate host buffer
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    /// Read a little-endian word
    pub fn read_u32(&self, bus: BusAddr) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read(bus, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write a little-endian word
    pub fn write_u32(&self, bus: BusAddr, value: u32) -> Result<()> {
        self.write(bus, &value.to_le_bytes())
    }

    /// Read a little-endian 64-bit word
    pub fn read_u64(&self, bus: BusAddr) -> Result<u64> {
        let mut word = [0u8; 8];
        self.read(bus, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }
}

impl PhysicalMapper for SimulatedMemory {
    fn map(&self, bus: BusAddr, size: usize) -> Result<HostMapping> {
        let ptr = self.range(bus, size)?;
        let ptr = NonNull::new(ptr).ok_or(Error::MappingFailed)?;
        let owner: Arc<Arena> = Arc::clone(&self.arena);
        // SAFETY: the arena outlives the mapping through `owner`
        Ok(unsafe { HostMapping::from_shared(ptr, size, owner) })
    }
}

impl fmt::Debug for SimulatedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedMemory")
            .field("base", &self.arena.base)
            .field("len", &self.arena.len)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

// =============================================================================
// QPU EMULATION
// =============================================================================

/// Execution environment handed to an emulated QPU program
#[derive(Debug)]
pub struct QpuContext<'a> {
    memory: &'a SimulatedMemory,
    uniforms: BusAddr,
    remaining: u32,
}

impl<'a> QpuContext<'a> {
    /// Context reading `count` uniforms starting at `uniforms`
    pub fn new(memory: &'a SimulatedMemory, uniforms: BusAddr, count: u32) -> Self {
        Self {
            memory,
            uniforms,
            remaining: count,
        }
    }

    /// Pop the next uniform word
    pub fn next_uniform(&mut self) -> Result<u32> {
        if self.remaining == 0 {
            return Err(Error::GpuFault);
        }
        let value = self.memory.read_u32(self.uniforms)?;
        self.uniforms = self.uniforms + 4;
        self.remaining -= 1;
        Ok(value)
    }

    /// GPU memory visible to the program
    pub fn memory(&self) -> &SimulatedMemory {
        self.memory
    }
}

/// Host-side stand-in for a QPU program
pub trait QpuProgram: Send + Sync {
    /// Run one QPU's share of the work
    fn run(&self, qpu: &mut QpuContext<'_>) -> Result<()>;
}

impl<F> QpuProgram for F
where
    F: Fn(&mut QpuContext<'_>) -> Result<()> + Send + Sync,
{
    fn run(&self, qpu: &mut QpuContext<'_>) -> Result<()> {
        self(qpu)
    }
}

// =============================================================================
// SIMULATED GPU
// =============================================================================

/// `IDENT0`: technology version 2 and the "V3D" signature
const SIM_IDENT0: u32 = 0x0244_3356;
/// `IDENT1`: rev 1, 3 slices, 4 QPUs/slice, 1 TMU, 16 semaphores, 16K VPM
const SIM_IDENT1: u32 = 0x0110_1431;
/// `VPMBASE`: 16 * 256 bytes reserved for user programs
const SIM_VPMBASE: u32 = 16;
/// `ERRSTAT` bit raised on a QPU fault
const SIM_ERRSTAT_FAULT: u32 = 1 << 15;

struct GpuState {
    memory: SimulatedMemory,
    registers: Mutex<Vec<u32>>,
    programs: RwLock<BTreeMap<u64, Arc<dyn QpuProgram>>>,
    executed: AtomicU32,
}

/// Software V3D implementing the register window
#[derive(Clone)]
pub struct SimulatedGpu {
    state: Arc<GpuState>,
}

impl SimulatedGpu {
    /// Create a GPU over `memory` with VideoCore IV identification values
    pub fn new(memory: SimulatedMemory) -> Self {
        let mut registers = vec![0u32; V3D_WINDOW_SIZE / 4];
        registers[(registers::IDENT0 / 4) as usize] = SIM_IDENT0;
        registers[(registers::IDENT1 / 4) as usize] = SIM_IDENT1;
        registers[(registers::VPMBASE / 4) as usize] = SIM_VPMBASE;
        Self {
            state: Arc::new(GpuState {
                memory,
                registers: Mutex::new(registers),
                programs: RwLock::new(BTreeMap::new()),
                executed: AtomicU32::new(0),
            }),
        }
    }

    /// Memory the GPU executes against
    pub fn memory(&self) -> &SimulatedMemory {
        &self.state.memory
    }

    /// Bind a program emulator to the code word identifying it
    pub fn register_program(&self, code_word: u64, program: impl QpuProgram + 'static) {
        self.state.programs.write().insert(code_word, Arc::new(program));
    }

    /// Number of QPU programs executed so far
    pub fn programs_executed(&self) -> u32 {
        self.state.executed.load(Ordering::Acquire)
    }

    /// Run the program at `code` on one QPU
    pub fn execute(&self, code: BusAddr, uniforms: BusAddr, uniform_count: u32) -> Result<()> {
        let word = self.state.memory.read_u64(code)?;
        let program = self
            .state
            .programs
            .read()
            .get(&word)
            .cloned()
            .ok_or_else(|| {
                log::error!("no QPU program for code word 0x{:016x} at {}", word, code);
                Error::GpuFault
            })?;

        let mut qpu = QpuContext::new(&self.state.memory, uniforms, uniform_count);
        let result = program.run(&mut qpu);
        self.state.executed.fetch_add(1, Ordering::AcqRel);
        result
    }

    fn start_user_program(&self, code: u32) {
        let (uniforms, count) = {
            let mut regs = self.state.registers.lock();
            let cs = regs[(registers::SRQCS / 4) as usize];
            let requested = (extract_field(cs, 8, 15) + 1) & 0xFF;
            regs[(registers::SRQCS / 4) as usize] = insert_field(cs, requested, 8, 15);
            (
                regs[(registers::SRQUA / 4) as usize],
                regs[(registers::SRQUL / 4) as usize],
            )
        };

        let result = self.execute(BusAddr::new(code), BusAddr::new(uniforms), count);

        let mut regs = self.state.registers.lock();
        let cs_index = (registers::SRQCS / 4) as usize;
        let mut cs = regs[cs_index];
        if result.is_err() {
            cs |= srqcs::ERROR;
            regs[(registers::ERRSTAT / 4) as usize] |= SIM_ERRSTAT_FAULT;
        }
        let completed = (extract_field(cs, srqcs::COMPLETED_LOW, srqcs::COMPLETED_HIGH) + 1) & 0xFF;
        regs[cs_index] = insert_field(cs, completed, srqcs::COMPLETED_LOW, srqcs::COMPLETED_HIGH);
    }
}

impl RegisterWindow for SimulatedGpu {
    fn size(&self) -> u32 {
        V3D_WINDOW_SIZE as u32
    }

    fn read32(&self, offset: u32) -> u32 {
        self.state.registers.lock()[(offset / 4) as usize]
    }

    fn write32(&self, offset: u32, value: u32) {
        match offset {
            registers::IDENT0 | registers::IDENT1 | registers::IDENT2 | registers::ERRSTAT => {}
            registers::SRQCS => {
                let mut regs = self.state.registers.lock();
                let mut cs = regs[(offset / 4) as usize];
                if value & srqcs::ERROR != 0 {
                    cs &= !srqcs::ERROR;
                    regs[(registers::ERRSTAT / 4) as usize] = 0;
                }
                if value & srqcs::RESET_REQUESTS != 0 {
                    cs = insert_field(cs, 0, 8, 15);
                }
                if value & srqcs::RESET_COMPLETED != 0 {
                    cs = insert_field(cs, 0, srqcs::COMPLETED_LOW, srqcs::COMPLETED_HIGH);
                }
                regs[(offset / 4) as usize] = cs;
            }
            registers::SRQPC => self.start_user_program(value),
            _ => self.state.registers.lock()[(offset / 4) as usize] = value,
        }
    }
}

impl fmt::Debug for SimulatedGpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedGpu")
            .field("memory", &self.state.memory)
            .field("programs", &self.state.programs.read().len())
            .field("executed", &self.programs_executed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v3d::V3d;
    use std::time::Duration;

    #[test]
    fn test_allocate_first_fit_and_free() {
        let mem = SimulatedMemory::new(16 * 1024);
        let a = mem.allocate(4096, 4096).unwrap();
        let b = mem.allocate(100, 16).unwrap();
        assert_eq!(a, mem.base());
        assert_eq!(b, mem.base() + 4096);
        mem.free(a).unwrap();
        let c = mem.allocate(64, 8).unwrap();
        assert_eq!(c, mem.base());
        assert_eq!(mem.free(BusAddr::new(0x10)), Err(Error::InvalidBusAddress));
        assert_eq!(mem.allocated_bytes(), 164);
    }

    #[test]
    fn test_allocation_exhaustion() {
        let mem = SimulatedMemory::new(4096);
        mem.allocate(4096, 4).unwrap();
        assert_eq!(mem.allocate(4, 4), Err(Error::AllocationFailed));
    }

    #[test]
    fn test_mapping_shares_storage() {
        let mem = SimulatedMemory::new(4096);
        let bus = mem.allocate(16, 4).unwrap();
        let map = mem.map(bus, 16).unwrap();
        map.write(0, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        assert_eq!(mem.read_u32(bus), Ok(0xDEAD_BEEF));
    }

    #[test]
    fn test_user_program_runs_and_counts() {
        let mem = SimulatedMemory::new(64 * 1024);
        let gpu = SimulatedGpu::new(mem.clone());
        gpu.register_program(0x1234, |qpu: &mut QpuContext<'_>| {
            let dst = BusAddr::new(qpu.next_uniform()?);
            let value = qpu.next_uniform()?;
            qpu.memory().write_u32(dst, value)
        });

        let code = mem.allocate(8, 8).unwrap();
        mem.write(code, &0x1234u64.to_le_bytes()).unwrap();
        let out = mem.allocate(4, 4).unwrap();
        let uniforms = mem.allocate(8, 4).unwrap();
        mem.write_u32(uniforms, out.raw()).unwrap();
        mem.write_u32(uniforms + 4, 77).unwrap();

        let v3d = V3d::new(Box::new(gpu.clone())).unwrap();
        let guard = v3d.lock();
        guard.reset_user_queue().unwrap();
        guard.submit_program(code, uniforms, 2).unwrap();
        guard
            .wait_for_programs(1, Duration::from_millis(100), Duration::ZERO)
            .unwrap();
        assert_eq!(mem.read_u32(out), Ok(77));
        assert_eq!(gpu.programs_executed(), 1);
    }

    #[test]
    fn test_unknown_program_faults() {
        let mem = SimulatedMemory::new(64 * 1024);
        let gpu = SimulatedGpu::new(mem.clone());
        let code = mem.allocate(8, 8).unwrap();
        let v3d = V3d::new(Box::new(gpu)).unwrap();
        let guard = v3d.lock();
        guard.reset_user_queue().unwrap();
        guard.submit_program(code, code, 0).unwrap();
        assert_eq!(
            guard.wait_for_programs(1, Duration::from_millis(100), Duration::ZERO),
            Err(Error::GpuFault)
        );
        guard.reset_user_queue().unwrap();
        assert_eq!(guard.read(registers::ERRSTAT), Ok(0));
    }
}
