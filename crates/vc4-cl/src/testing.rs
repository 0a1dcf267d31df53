//! Shared fixtures: a runtime over the simulated GPU with a small program
//! whose kernels are emulated on the host.

use vc4_core::{BusAddr, Handle, Result};
use vc4_hal::sim::QpuContext;
use vc4_mailbox::sim::SimulatedFirmware;

use crate::binary::{ArgMeta, KernelMeta, ProgramBinary};
use crate::config::{CompletionMode, RuntimeConfig};
use crate::context::Context;
use crate::marshal::HEADER_WORDS;
use crate::program::Program;
use crate::queue::CommandQueue;
use crate::runtime::Runtime;

pub const HELLO_CODE: u64 = 0x4845_4C4C_4F00_0001;
pub const ADD_CODE: u64 = 0x4144_4400_0000_0002;
/// Code word with no emulator behind it; running it faults
pub const FAULT_CODE: u64 = 0xDEAD_0000_0000_0003;

pub const SIM_MEMORY: usize = 1 << 20;

/// `hello_world(char16* in, char16* out)`, `add(int* data, int value)` and
/// `fault()`
pub fn program_binary() -> ProgramBinary {
    ProgramBinary {
        kernels: vec![
            KernelMeta {
                name: "hello_world".into(),
                entry_offset: 0,
                local_mem: 0,
                private_mem: 0,
                required_wg: Some([1, 1, 1]),
                args: vec![ArgMeta::buffer("in", "char16*"), ArgMeta::buffer("out", "char16*")],
            },
            KernelMeta {
                name: "add".into(),
                entry_offset: 8,
                local_mem: 0,
                private_mem: 0,
                required_wg: None,
                args: vec![ArgMeta::buffer("data", "int*"), ArgMeta::scalar("value", "int", 4)],
            },
            KernelMeta {
                name: "fault".into(),
                entry_offset: 16,
                local_mem: 0,
                private_mem: 0,
                required_wg: None,
                args: vec![],
            },
        ],
        code: vec![HELLO_CODE, ADD_CODE, FAULT_CODE],
    }
}

/// Linear global id of the work-item whose header is in `header`
fn global_id(header: &[u32; HEADER_WORDS]) -> u32 {
    let unpack = |w: u32| [w & 0xFF, (w >> 8) & 0xFF, (w >> 16) & 0xFF];
    let local = unpack(header[1]);
    let local_id = unpack(header[2]);
    let size: Vec<u32> = (0..3).map(|d| header[3 + d] * local[d]).collect();
    let id: Vec<u32> = (0..3).map(|d| header[6 + d] * local[d] + local_id[d]).collect();
    id[0] + id[1] * size[0] + id[2] * size[0] * size[1]
}

fn read_header(qpu: &mut QpuContext<'_>) -> Result<[u32; HEADER_WORDS]> {
    let mut header = [0u32; HEADER_WORDS];
    for word in header.iter_mut() {
        *word = qpu.next_uniform()?;
    }
    Ok(header)
}

fn hello_world(qpu: &mut QpuContext<'_>) -> Result<()> {
    let header = read_header(qpu)?;
    let input = BusAddr::new(qpu.next_uniform()?);
    let output = BusAddr::new(qpu.next_uniform()?);
    let at = global_id(&header) * 16;
    let mut chunk = [0u8; 16];
    qpu.memory().read(input + at, &mut chunk)?;
    qpu.memory().write(output + at, &chunk)
}

fn add(qpu: &mut QpuContext<'_>) -> Result<()> {
    let header = read_header(qpu)?;
    let data = BusAddr::new(qpu.next_uniform()?);
    let value = qpu.next_uniform()?;
    let slot = data + global_id(&header) * 4;
    let current = qpu.memory().read_u32(slot)?;
    qpu.memory().write_u32(slot, current.wrapping_add(value))
}

/// A runtime with one context, an in-order queue and a built program
#[derive(Debug)]
pub struct Fixture {
    pub runtime: Runtime,
    pub firmware: SimulatedFirmware,
    pub context: Handle<Context>,
    pub queue: Handle<CommandQueue>,
    pub program: Handle<Program>,
}

pub fn fixture(completion: CompletionMode) -> Fixture {
    let config = RuntimeConfig {
        completion,
        ..RuntimeConfig::default()
    };
    let (runtime, firmware) = Runtime::simulated(SIM_MEMORY, config).unwrap();
    firmware.gpu().register_program(HELLO_CODE, hello_world);
    firmware.gpu().register_program(ADD_CODE, add);

    let devices = runtime.device_ids();
    let context = runtime.create_context(&devices, &[]).unwrap();
    let queue = runtime.create_command_queue(context, devices[0], 0).unwrap();
    let program = runtime
        .create_program_with_binary(context, &devices, &program_binary().to_bytes())
        .unwrap();
    runtime.build_program(program, &devices, "").unwrap();
    Fixture {
        runtime,
        firmware,
        context,
        queue,
        program,
    }
}

/// Handle bytes as passed to `set_kernel_arg`
pub fn arg<T>(handle: Handle<T>) -> [u8; 8] {
    handle.raw().to_le_bytes()
}
