//! # Kernels and Argument Binding
//!
//! A kernel is one entry point of a built program plus a fixed table of
//! argument slots. Binding validates against the declared signature before
//! touching the slot, so a rejected call leaves the previous binding in
//! place. Enqueues copy the table; later bindings never reach commands
//! already queued.

use std::sync::{Arc, Mutex, MutexGuard};

use vc4_core::{BusAddr, Error, Handle, Result};

use crate::binary::{ArgKind, ArgMeta, KernelMeta};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::device::Device;
use crate::info::{self, InfoValue};
use crate::marshal::group_size;
use crate::program::{BuiltProgram, Program};

/// Size of a buffer argument value: one object handle
pub const BUFFER_ARG_SIZE: usize = core::mem::size_of::<u64>();

/// Value bound to an argument slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// Buffer, or null; not retained by the kernel
    Buffer(Option<Handle<Buffer>>),
    /// Scalar bytes, exactly the declared size
    Scalar(Vec<u8>),
}

/// Entry point with its argument table
#[derive(Debug)]
pub struct Kernel {
    context: Handle<Context>,
    program: Handle<Program>,
    built: Arc<BuiltProgram>,
    index: usize,
    args: Mutex<Vec<Option<ArgValue>>>,
}

impl Kernel {
    /// Kernel `name` of a built program
    pub fn new(
        context: Handle<Context>,
        program: Handle<Program>,
        built: Arc<BuiltProgram>,
        name: &str,
    ) -> Result<Self> {
        let index = built
            .kernels()
            .iter()
            .position(|k| k.name == name)
            .ok_or(Error::InvalidKernelName)?;
        Ok(Self::at(context, program, built, index))
    }

    /// Kernel at `index` of a built program
    pub(crate) fn at(
        context: Handle<Context>,
        program: Handle<Program>,
        built: Arc<BuiltProgram>,
        index: usize,
    ) -> Self {
        let slots = built.kernels()[index].args.len();
        Self {
            context,
            program,
            built,
            index,
            args: Mutex::new(vec![None; slots]),
        }
    }

    /// Duplicate with an independent copy of the current bindings
    pub fn duplicate(&self) -> Self {
        Self {
            context: self.context,
            program: self.program,
            built: Arc::clone(&self.built),
            index: self.index,
            args: Mutex::new(self.lock().clone()),
        }
    }

    /// Owning context
    pub fn context(&self) -> Handle<Context> {
        self.context
    }

    /// Owning program
    pub fn program(&self) -> Handle<Program> {
        self.program
    }

    /// Uploaded program shared with every kernel from the same build
    pub(crate) fn built(&self) -> &Arc<BuiltProgram> {
        &self.built
    }

    /// Position in the program's kernel table
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Compiled descriptor
    pub fn meta(&self) -> &KernelMeta {
        &self.built.kernels()[self.index]
    }

    /// Bus address of the first instruction
    pub fn entry(&self) -> Result<BusAddr> {
        self.built.entry(self.index)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<ArgValue>>> {
        self.args.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arg(&self, index: u32) -> Result<&ArgMeta> {
        self.meta().args.get(index as usize).ok_or(Error::InvalidArgIndex)
    }

    /// Bind slot `index`
    ///
    /// Buffer slots take a `BUFFER_ARG_SIZE` handle value (zero or `None`
    /// binds null); `check_buffer` vets non-null handles. Scalar slots take
    /// exactly the declared size.
    pub fn set_arg(
        &self,
        index: u32,
        size: usize,
        value: Option<&[u8]>,
        check_buffer: impl FnOnce(Handle<Buffer>) -> Result<()>,
    ) -> Result<()> {
        let meta = self.arg(index)?;
        let bound = match meta.kind {
            ArgKind::Buffer => {
                if size != BUFFER_ARG_SIZE {
                    return Err(Error::InvalidArgSize);
                }
                match value {
                    None => ArgValue::Buffer(None),
                    Some(bytes) => {
                        let raw: [u8; BUFFER_ARG_SIZE] =
                            bytes.try_into().map_err(|_| Error::InvalidArgValue)?;
                        match u64::from_le_bytes(raw) {
                            0 => ArgValue::Buffer(None),
                            raw => {
                                let handle = Handle::from_raw(raw);
                                check_buffer(handle).map_err(|_| Error::InvalidMemObject)?;
                                ArgValue::Buffer(Some(handle))
                            }
                        }
                    }
                }
            }
            ArgKind::Scalar { size: declared } => {
                if size != declared {
                    return Err(Error::InvalidArgSize);
                }
                match value {
                    Some(bytes) if bytes.len() == size => ArgValue::Scalar(bytes.to_vec()),
                    _ => return Err(Error::InvalidArgValue),
                }
            }
        };
        self.lock()[index as usize] = Some(bound);
        Ok(())
    }

    /// Copy of every binding; fails if any slot is unbound
    pub fn snapshot(&self) -> Result<Vec<ArgValue>> {
        self.lock()
            .iter()
            .map(|slot| slot.clone().ok_or(Error::KernelArgsNotSet))
            .collect()
    }

    /// Answer a kernel query other than reference count, context and program
    pub fn info(&self, param: u32) -> Result<InfoValue> {
        use crate::info::kernel::*;
        let meta = self.meta();
        match param {
            FUNCTION_NAME => Ok(InfoValue::Str(meta.name.clone())),
            NUM_ARGS => Ok(InfoValue::U32(meta.args.len() as u32)),
            ATTRIBUTES => Ok(InfoValue::Str(match meta.required_wg {
                Some([x, y, z]) => format!("reqd_work_group_size({},{},{})", x, y, z),
                None => String::new(),
            })),
            _ => Err(Error::InvalidValue),
        }
    }

    /// Answer a work-group query for `device`
    pub fn work_group_info(&self, device: &Device, param: u32) -> Result<InfoValue> {
        use crate::info::work_group::*;
        let meta = self.meta();
        match param {
            WORK_GROUP_SIZE => Ok(InfoValue::Usize(match meta.required_wg {
                Some(wg) => group_size(&wg).ok_or(Error::InvalidKernel)?,
                None => device.max_work_group_size(),
            })),
            COMPILE_WORK_GROUP_SIZE => Ok(InfoValue::Sizes(meta.required_wg.unwrap_or([0; 3]).to_vec())),
            LOCAL_MEM_SIZE => Ok(InfoValue::U64(u64::from(meta.local_mem))),
            PREFERRED_WORK_GROUP_SIZE_MULTIPLE => Ok(InfoValue::Usize(1)),
            PRIVATE_MEM_SIZE => Ok(InfoValue::U64(u64::from(meta.private_mem))),
            _ => Err(Error::InvalidValue),
        }
    }

    /// Answer an argument query
    pub fn arg_info(&self, index: u32, param: u32) -> Result<InfoValue> {
        let arg = self.arg(index)?;
        match param {
            info::arg::ADDRESS_QUALIFIER => arg
                .address
                .map(|q| InfoValue::U32(q.info_value()))
                .ok_or(Error::ArgInfoNotAvailable),
            info::arg::ACCESS_QUALIFIER => arg
                .access
                .map(|q| InfoValue::U32(q.info_value()))
                .ok_or(Error::ArgInfoNotAvailable),
            info::arg::TYPE_NAME => Ok(InfoValue::Str(arg.type_name.clone())),
            info::arg::TYPE_QUALIFIER => arg
                .type_qualifier
                .map(InfoValue::U64)
                .ok_or(Error::ArgInfoNotAvailable),
            info::arg::NAME => arg
                .name
                .clone()
                .map(InfoValue::Str)
                .ok_or(Error::ArgInfoNotAvailable),
            _ => Err(Error::InvalidValue),
        }
    }
}
