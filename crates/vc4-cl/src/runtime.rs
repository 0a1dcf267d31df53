//! # Runtime
//!
//! Entry points for object creation, reference counting and queries. Every
//! object lives in a generation-checked table; children hold a reference on
//! their parent (context, or program for kernels) which is dropped when the
//! child's count reaches zero.
//!
//! Enqueue and event entry points live in `enqueue.rs`.

use std::sync::Arc;

use vc4_core::{Error, Handle, ObjectTable, Result};
use vc4_mailbox::sim::SimulatedFirmware;

use crate::buffer::Buffer;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::device::{Device, Platform};
use crate::engine::{Engine, Executor};
use crate::event::Event;
use crate::info::{self, InfoValue};
use crate::kernel::Kernel;
use crate::program::Program;
use crate::queue::{CommandQueue, QueueProperties};

/// Copy a query answer into the caller's buffer
fn answer(value: Result<InfoValue>, dst: Option<&mut [u8]>) -> Result<usize> {
    value?.write_to(dst)
}

// =============================================================================
// RUNTIME
// =============================================================================

/// Compute runtime over one VideoCore IV GPU
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) device: Arc<Device>,
    device_handle: Handle<Device>,
    devices: ObjectTable<Device>,
    pub(crate) contexts: ObjectTable<Context>,
    pub(crate) queues: ObjectTable<CommandQueue>,
    pub(crate) programs: ObjectTable<Program>,
    pub(crate) kernels: ObjectTable<Kernel>,
    pub(crate) buffers: ObjectTable<Buffer>,
    pub(crate) events: ObjectTable<Event>,
    pub(crate) engine: Engine,
}

impl Runtime {
    /// Bring up the device and start the engine
    pub fn new(platform: Platform, config: RuntimeConfig) -> Result<Self> {
        let device = Arc::new(Device::new(platform)?);
        let devices = ObjectTable::new(Error::InvalidDevice);
        let device_handle = devices.insert_arc(Arc::clone(&device));
        let engine = Engine::start(Executor::new(Arc::clone(&device), config.clone()))?;
        log::info!("runtime up, {:?} completion", config.completion);
        Ok(Self {
            config,
            device,
            device_handle,
            devices,
            contexts: ObjectTable::new(Error::InvalidContext),
            queues: ObjectTable::new(Error::InvalidCommandQueue),
            programs: ObjectTable::new(Error::InvalidProgram),
            kernels: ObjectTable::new(Error::InvalidKernel),
            buffers: ObjectTable::new(Error::InvalidMemObject),
            events: ObjectTable::new(Error::InvalidEvent),
            engine,
        })
    }

    /// Open the real hardware
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        let platform = Platform::open(&config)?;
        Self::new(platform, config)
    }

    /// Runtime over a simulated GPU with `memory_len` bytes of memory
    pub fn simulated(memory_len: usize, config: RuntimeConfig) -> Result<(Self, SimulatedFirmware)> {
        let (platform, firmware) = Platform::simulated(memory_len)?;
        Ok((Self::new(platform, config)?, firmware))
    }

    /// Active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// The one GPU
    pub fn device_ids(&self) -> Vec<Handle<Device>> {
        vec![self.device_handle]
    }

    fn check_device(&self, device: Handle<Device>) -> Result<()> {
        if self.devices.contains(device) {
            Ok(())
        } else {
            Err(Error::InvalidDevice)
        }
    }

    fn check_devices(&self, devices: &[Handle<Device>]) -> Result<()> {
        if devices.is_empty() {
            return Err(Error::InvalidValue);
        }
        devices.iter().try_for_each(|&d| self.check_device(d))
    }

    /// Device query
    pub fn get_device_info(&self, device: Handle<Device>, param: u32, dst: Option<&mut [u8]>) -> Result<usize> {
        answer(self.devices.get(device)?.info(param), dst)
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// Create a context over `devices`
    pub fn create_context(&self, devices: &[Handle<Device>], properties: &[u64]) -> Result<Handle<Context>> {
        self.check_devices(devices)?;
        let context = Context::new(Arc::clone(&self.device), self.device_handle, properties)?;
        Ok(self.contexts.insert(context))
    }

    /// Increment a context's reference count
    pub fn retain_context(&self, context: Handle<Context>) -> Result<()> {
        self.contexts.retain(context).map(drop)
    }

    /// Decrement a context's reference count
    pub fn release_context(&self, context: Handle<Context>) -> Result<()> {
        if self.contexts.release(context)?.is_some() {
            log::debug!("context {:?} destroyed", context);
        }
        Ok(())
    }

    /// Drop the reference a child object held on its context
    pub(crate) fn release_parent(&self, context: Handle<Context>) {
        if let Err(e) = self.release_context(context) {
            log::warn!("releasing parent context {:?}: {}", context, e);
        }
    }

    /// Context query
    pub fn get_context_info(&self, context: Handle<Context>, param: u32, dst: Option<&mut [u8]>) -> Result<usize> {
        let object = self.contexts.get(context)?;
        let value = match param {
            info::context::REFERENCE_COUNT => self.contexts.reference_count(context).map(InfoValue::U32),
            _ => object.info(param),
        };
        answer(value, dst)
    }

    // =========================================================================
    // Command queues
    // =========================================================================

    /// Create a queue on `device` in `context`
    pub fn create_command_queue(
        &self,
        context: Handle<Context>,
        device: Handle<Device>,
        properties: u64,
    ) -> Result<Handle<CommandQueue>> {
        let ctx = self.contexts.get(context)?;
        self.check_device(device)?;
        if ctx.device_handle() != device {
            return Err(Error::InvalidDevice);
        }
        let properties = CommandQueue::parse_properties(properties)?;
        self.contexts.retain(context)?;
        let lane = self
            .engine
            .open_lane(properties.contains(QueueProperties::OUT_OF_ORDER_EXEC_MODE));
        Ok(self.queues.insert(CommandQueue::new(context, device, properties, lane)))
    }

    /// Increment a queue's reference count
    pub fn retain_command_queue(&self, queue: Handle<CommandQueue>) -> Result<()> {
        self.queues.retain(queue).map(drop)
    }

    /// Decrement a queue's reference count; pending commands still run
    pub fn release_command_queue(&self, queue: Handle<CommandQueue>) -> Result<()> {
        if let Some(queue) = self.queues.release(queue)? {
            self.engine.close_lane(queue.lane());
            self.release_parent(queue.context());
        }
        Ok(())
    }

    /// Queue query
    pub fn get_command_queue_info(
        &self,
        queue: Handle<CommandQueue>,
        param: u32,
        dst: Option<&mut [u8]>,
    ) -> Result<usize> {
        let object = self.queues.get(queue)?;
        let value = match param {
            info::queue::CONTEXT => Ok(InfoValue::Handle(object.context().raw())),
            info::queue::REFERENCE_COUNT => self.queues.reference_count(queue).map(InfoValue::U32),
            _ => object.info(param),
        };
        answer(value, dst)
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Allocate a buffer of `size` bytes
    pub fn create_buffer(
        &self,
        context: Handle<Context>,
        flags: u64,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> Result<Handle<Buffer>> {
        let ctx = self.contexts.get(context)?;
        let buffer = Buffer::create(context, ctx.device(), &self.config, flags, size, host_data)?;
        self.contexts.retain(context)?;
        Ok(self.buffers.insert(buffer))
    }

    /// Increment a buffer's reference count
    pub fn retain_mem_object(&self, buffer: Handle<Buffer>) -> Result<()> {
        self.buffers.retain(buffer).map(drop)
    }

    /// Decrement a buffer's reference count
    ///
    /// Storage is freed once no running command uses it.
    pub fn release_mem_object(&self, buffer: Handle<Buffer>) -> Result<()> {
        if let Some(buffer) = self.buffers.release(buffer)? {
            if buffer.in_flight() > 0 {
                log::debug!("buffer released while {} commands use it", buffer.in_flight());
            }
            self.release_parent(buffer.context());
        }
        Ok(())
    }

    /// Memory object query
    pub fn get_mem_object_info(&self, buffer: Handle<Buffer>, param: u32, dst: Option<&mut [u8]>) -> Result<usize> {
        let object = self.buffers.get(buffer)?;
        let value = match param {
            info::mem::CONTEXT => Ok(InfoValue::Handle(object.context().raw())),
            info::mem::REFERENCE_COUNT => self.buffers.reference_count(buffer).map(InfoValue::U32),
            _ => object.info(param),
        };
        answer(value, dst)
    }

    // =========================================================================
    // Programs
    // =========================================================================

    /// Create a program from a kernel binary container
    pub fn create_program_with_binary(
        &self,
        context: Handle<Context>,
        devices: &[Handle<Device>],
        binary: &[u8],
    ) -> Result<Handle<Program>> {
        self.contexts.get(context)?;
        self.check_devices(devices)?;
        let program = Program::with_binary(context, self.device_handle, binary)?;
        self.contexts.retain(context)?;
        Ok(self.programs.insert(program))
    }

    /// Upload a program's code to the GPU
    pub fn build_program(&self, program: Handle<Program>, devices: &[Handle<Device>], options: &str) -> Result<()> {
        let object = self.programs.get(program)?;
        if !devices.is_empty() {
            self.check_devices(devices)?;
        }
        object.build(&self.device, &self.config, options)
    }

    /// Increment a program's reference count
    pub fn retain_program(&self, program: Handle<Program>) -> Result<()> {
        self.programs.retain(program).map(drop)
    }

    /// Decrement a program's reference count
    pub fn release_program(&self, program: Handle<Program>) -> Result<()> {
        if let Some(program) = self.programs.release(program)? {
            self.release_parent(program.context());
        }
        Ok(())
    }

    /// Program query
    pub fn get_program_info(&self, program: Handle<Program>, param: u32, dst: Option<&mut [u8]>) -> Result<usize> {
        let object = self.programs.get(program)?;
        let value = match param {
            info::program::CONTEXT => Ok(InfoValue::Handle(object.context().raw())),
            info::program::REFERENCE_COUNT => self.programs.reference_count(program).map(InfoValue::U32),
            _ => object.info(param),
        };
        answer(value, dst)
    }

    /// Program build query
    pub fn get_program_build_info(
        &self,
        program: Handle<Program>,
        device: Handle<Device>,
        param: u32,
        dst: Option<&mut [u8]>,
    ) -> Result<usize> {
        let object = self.programs.get(program)?;
        self.check_device(device)?;
        answer(object.build_info(param), dst)
    }

    // =========================================================================
    // Kernels
    // =========================================================================

    fn add_kernel(&self, kernel: Kernel) -> Result<Handle<Kernel>> {
        self.programs.retain(kernel.program())?;
        Ok(self.kernels.insert(kernel))
    }

    /// Create the kernel `name`
    pub fn create_kernel(&self, program: Handle<Program>, name: &str) -> Result<Handle<Kernel>> {
        let object = self.programs.get(program)?;
        let kernel = Kernel::new(object.context(), program, object.built()?, name)?;
        self.add_kernel(kernel)
    }

    /// Create one kernel per entry point
    pub fn create_kernels_in_program(&self, program: Handle<Program>) -> Result<Vec<Handle<Kernel>>> {
        let object = self.programs.get(program)?;
        let built = object.built()?;
        (0..built.kernels().len())
            .map(|index| self.add_kernel(Kernel::at(object.context(), program, Arc::clone(&built), index)))
            .collect()
    }

    /// Duplicate a kernel with its current bindings
    pub fn clone_kernel(&self, kernel: Handle<Kernel>) -> Result<Handle<Kernel>> {
        let copy = self.kernels.get(kernel)?.duplicate();
        self.add_kernel(copy)
    }

    /// Increment a kernel's reference count
    pub fn retain_kernel(&self, kernel: Handle<Kernel>) -> Result<()> {
        self.kernels.retain(kernel).map(drop)
    }

    /// Decrement a kernel's reference count
    pub fn release_kernel(&self, kernel: Handle<Kernel>) -> Result<()> {
        if let Some(kernel) = self.kernels.release(kernel)? {
            if let Err(e) = self.release_program(kernel.program()) {
                log::warn!("releasing parent program {:?}: {}", kernel.program(), e);
            }
        }
        Ok(())
    }

    /// Bind argument `index` of a kernel
    ///
    /// Buffer arguments are passed as the buffer handle's raw value in
    /// little-endian byte order.
    pub fn set_kernel_arg(&self, kernel: Handle<Kernel>, index: u32, size: usize, value: Option<&[u8]>) -> Result<()> {
        let object = self.kernels.get(kernel)?;
        object.set_arg(index, size, value, |buffer| {
            let buffer = self.buffers.get(buffer)?;
            if buffer.context() != object.context() {
                return Err(Error::InvalidMemObject);
            }
            Ok(())
        })
    }

    /// Kernel query
    pub fn get_kernel_info(&self, kernel: Handle<Kernel>, param: u32, dst: Option<&mut [u8]>) -> Result<usize> {
        let object = self.kernels.get(kernel)?;
        let value = match param {
            info::kernel::REFERENCE_COUNT => self.kernels.reference_count(kernel).map(InfoValue::U32),
            info::kernel::CONTEXT => Ok(InfoValue::Handle(object.context().raw())),
            info::kernel::PROGRAM => Ok(InfoValue::Handle(object.program().raw())),
            _ => object.info(param),
        };
        answer(value, dst)
    }

    /// Kernel work-group query
    pub fn get_kernel_work_group_info(
        &self,
        kernel: Handle<Kernel>,
        device: Handle<Device>,
        param: u32,
        dst: Option<&mut [u8]>,
    ) -> Result<usize> {
        let object = self.kernels.get(kernel)?;
        let device = self.devices.get(device)?;
        answer(object.work_group_info(&device, param), dst)
    }

    /// Kernel argument query
    pub fn get_kernel_arg_info(
        &self,
        kernel: Handle<Kernel>,
        index: u32,
        param: u32,
        dst: Option<&mut [u8]>,
    ) -> Result<usize> {
        answer(self.kernels.get(kernel)?.arg_info(index, param), dst)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.engine.shutdown();
        log::debug!(
            "runtime down: {} contexts, {} buffers, {} events still referenced",
            self.contexts.len(),
            self.buffers.len(),
            self.events.len()
        );
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("device", &self.device)
            .field("contexts", &self.contexts)
            .field("queues", &self.queues)
            .field("programs", &self.programs)
            .field("kernels", &self.kernels)
            .field("buffers", &self.buffers)
            .field("events", &self.events)
            .field("engine", &self.engine)
            .finish()
    }
}
