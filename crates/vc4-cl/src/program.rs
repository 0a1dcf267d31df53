//! # Programs
//!
//! A program wraps one kernel binary container. Building validates it and
//! uploads the code section into locked GPU memory; kernels created from the
//! program share that upload through an `Arc`, so it stays resident while
//! any kernel or in-flight dispatch still refers to it.

use std::sync::{Arc, Mutex, MutexGuard};

use vc4_core::{BusAddr, Error, Handle, Result};
use vc4_mailbox::GpuMemory;

use crate::binary::{KernelMeta, ProgramBinary};
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::device::Device;
use crate::info::{self, InfoValue};

// =============================================================================
// BUILD STATE
// =============================================================================

/// Build status of a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// Never built
    None,
    /// Last build failed
    Error,
    /// Built and resident
    Success,
    /// Build running
    InProgress,
}

impl BuildStatus {
    /// Raw value reported by build queries
    pub fn as_raw(self) -> i32 {
        match self {
            Self::None => info::build::STATUS_NONE,
            Self::Error => info::build::STATUS_ERROR,
            Self::Success => info::build::STATUS_SUCCESS,
            Self::InProgress => info::build::STATUS_IN_PROGRESS,
        }
    }
}

/// Code uploaded to the GPU together with its kernel table
#[derive(Debug)]
pub struct BuiltProgram {
    binary: ProgramBinary,
    code: GpuMemory,
}

impl BuiltProgram {
    /// Kernel table
    pub fn kernels(&self) -> &[KernelMeta] {
        &self.binary.kernels
    }

    /// Kernel descriptor by index
    pub fn kernel(&self, index: usize) -> Option<&KernelMeta> {
        self.binary.kernels.get(index)
    }

    /// Bus address of a kernel's first instruction
    pub fn entry(&self, index: usize) -> Result<BusAddr> {
        let meta = self.kernel(index).ok_or(Error::InvalidKernel)?;
        Ok(self.code.bus_addr() + meta.entry_offset)
    }
}

#[derive(Debug)]
struct ProgramState {
    status: BuildStatus,
    options: String,
    log: String,
    built: Option<Arc<BuiltProgram>>,
}

// =============================================================================
// PROGRAM
// =============================================================================

/// Compiled program
#[derive(Debug)]
pub struct Program {
    context: Handle<Context>,
    device: Handle<Device>,
    bytes: Vec<u8>,
    binary: ProgramBinary,
    state: Mutex<ProgramState>,
}

impl Program {
    /// Program from a binary container
    pub fn with_binary(context: Handle<Context>, device: Handle<Device>, bytes: &[u8]) -> Result<Self> {
        let binary = ProgramBinary::parse(bytes)?;
        Ok(Self {
            context,
            device,
            bytes: bytes.to_vec(),
            binary,
            state: Mutex::new(ProgramState {
                status: BuildStatus::None,
                options: String::new(),
                log: String::new(),
                built: None,
            }),
        })
    }

    /// Owning context
    pub fn context(&self) -> Handle<Context> {
        self.context
    }

    fn lock(&self) -> MutexGuard<'_, ProgramState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upload the code section
    ///
    /// Rebuilding a built program only records the new options.
    pub fn build(&self, device: &Device, config: &RuntimeConfig, options: &str) -> Result<()> {
        let mut state = self.lock();
        state.options = options.to_string();
        if state.status == BuildStatus::Success {
            return Ok(());
        }
        state.status = BuildStatus::InProgress;

        match self.upload(device, config) {
            Ok(built) => {
                log::debug!(
                    "program: {} kernels, code at {}",
                    built.kernels().len(),
                    built.code.bus_addr()
                );
                state.status = BuildStatus::Success;
                state.log.clear();
                state.built = Some(Arc::new(built));
                Ok(())
            }
            Err(e) => {
                log::warn!("program build failed: {}", e);
                state.status = BuildStatus::Error;
                state.log = format!("uploading code failed: {}", e);
                Err(Error::BuildProgramFailure)
            }
        }
    }

    fn upload(&self, device: &Device, config: &RuntimeConfig) -> Result<BuiltProgram> {
        let code = self.binary.code_bytes();
        if code.is_empty() {
            return Err(Error::InvalidBinary);
        }
        let size = u32::try_from(code.len()).map_err(|_| Error::InvalidBinary)?;
        let memory = GpuMemory::allocate(device.mailbox(), size, config.alloc_alignment, config.alloc_flags)?;
        device.mapper().map(memory.bus_addr(), code.len())?.write(0, &code)?;
        Ok(BuiltProgram {
            binary: self.binary.clone(),
            code: memory,
        })
    }

    /// Build status
    pub fn build_status(&self) -> BuildStatus {
        self.lock().status
    }

    /// Uploaded program
    pub fn built(&self) -> Result<Arc<BuiltProgram>> {
        self.lock().built.clone().ok_or(Error::InvalidProgramExecutable)
    }

    /// Answer a program query other than reference count and context
    pub fn info(&self, param: u32) -> Result<InfoValue> {
        use crate::info::program::*;
        match param {
            NUM_DEVICES => Ok(InfoValue::U32(1)),
            DEVICES => Ok(InfoValue::Handles(vec![self.device.raw()])),
            SOURCE => Ok(InfoValue::Str(String::new())),
            BINARY_SIZES => Ok(InfoValue::Sizes(vec![self.bytes.len()])),
            BINARIES => Ok(InfoValue::Bytes(self.bytes.clone())),
            NUM_KERNELS => {
                let built = self.built()?;
                Ok(InfoValue::Usize(built.kernels().len()))
            }
            KERNEL_NAMES => {
                let built = self.built()?;
                let names: Vec<&str> = built.kernels().iter().map(|k| k.name.as_str()).collect();
                Ok(InfoValue::Str(names.join(";")))
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Answer a build query
    pub fn build_info(&self, param: u32) -> Result<InfoValue> {
        use crate::info::build::*;
        let state = self.lock();
        match param {
            STATUS => Ok(InfoValue::I32(state.status.as_raw())),
            OPTIONS => Ok(InfoValue::Str(state.options.clone())),
            LOG => Ok(InfoValue::Str(state.log.clone())),
            _ => Err(Error::InvalidValue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::ArgMeta;
    use crate::device::Platform;

    fn binary() -> Vec<u8> {
        ProgramBinary {
            kernels: vec![
                KernelMeta {
                    name: "a".into(),
                    entry_offset: 0,
                    local_mem: 0,
                    private_mem: 0,
                    required_wg: None,
                    args: vec![ArgMeta::buffer("out", "int*")],
                },
                KernelMeta {
                    name: "b".into(),
                    entry_offset: 8,
                    local_mem: 0,
                    private_mem: 0,
                    required_wg: None,
                    args: vec![],
                },
            ],
            code: vec![1, 2],
        }
        .to_bytes()
    }

    fn program() -> Program {
        Program::with_binary(Handle::from_parts(0, 1), Handle::from_parts(0, 1), &binary()).unwrap()
    }

    #[test]
    fn test_build_uploads_code() {
        let (platform, firmware) = Platform::simulated(64 * 1024).unwrap();
        let device = Device::new(platform).unwrap();
        let program = program();
        assert_eq!(program.build_status(), BuildStatus::None);
        assert_eq!(program.built().err(), Some(Error::InvalidProgramExecutable));

        program.build(&device, &RuntimeConfig::default(), "-cl-fast-relaxed-math").unwrap();
        let built = program.built().unwrap();
        let entry = built.entry(1).unwrap();
        assert_eq!(firmware.gpu().memory().read_u64(entry), Ok(2));
        assert_eq!(
            program.build_info(info::build::OPTIONS).unwrap().as_str(),
            Some("-cl-fast-relaxed-math")
        );
        assert_eq!(
            program.info(info::program::KERNEL_NAMES).unwrap().as_str(),
            Some("a;b")
        );
    }

    #[test]
    fn test_build_failure_recorded() {
        let (platform, _firmware) = Platform::simulated(4).unwrap();
        let device = Device::new(platform).unwrap();
        let program = program();
        assert_eq!(
            program.build(&device, &RuntimeConfig::default(), ""),
            Err(Error::BuildProgramFailure)
        );
        assert_eq!(
            program.build_info(info::build::STATUS),
            Ok(InfoValue::I32(info::build::STATUS_ERROR))
        );
        assert!(!program.build_info(info::build::LOG).unwrap().as_str().unwrap_or("").is_empty());
        assert_eq!(program.info(info::program::NUM_KERNELS).err(), Some(Error::InvalidProgramExecutable));
    }

    #[test]
    fn test_invalid_binary_rejected() {
        assert_eq!(
            Program::with_binary(Handle::from_parts(0, 1), Handle::from_parts(0, 1), &[0u8; 12]).err(),
            Some(Error::InvalidBinary)
        );
    }
}
