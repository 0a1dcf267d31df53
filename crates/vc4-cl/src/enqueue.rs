//! # Enqueue and Event Entry Points
//!
//! Every enqueue validates synchronously, captures what the command needs
//! and returns a fresh event handle without waiting for the device. Callers
//! that do not want the event release it straight away; the command still
//! runs and still completes the event internally.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vc4_core::{BusAddr, Error, Handle, Result};

use crate::buffer::Buffer;
use crate::command::{command_type, Command, CommandKind, Dispatch, NativeFn};
use crate::context::Context;
use crate::event::Event;
use crate::info::{self, InfoValue};
use crate::kernel::{ArgValue, Kernel};
use crate::marshal::BoundArg;
use crate::queue::{CommandQueue, NdRange};
use crate::runtime::Runtime;
use crate::status::ExecutionStatus;

impl Runtime {
    // =========================================================================
    // Plumbing
    // =========================================================================

    fn resolve_wait_list(&self, context: Handle<Context>, wait_list: &[Handle<Event>]) -> Result<Vec<Arc<Event>>> {
        wait_list
            .iter()
            .map(|&handle| {
                let event = self
                    .events
                    .get(handle)
                    .map_err(|_| Error::InvalidEventWaitList)?;
                if event.context() != context {
                    return Err(Error::InvalidContext);
                }
                Ok(event)
            })
            .collect()
    }

    fn buffer_in(&self, context: Handle<Context>, buffer: Handle<Buffer>) -> Result<Arc<Buffer>> {
        let buffer = self.buffers.get(buffer)?;
        if buffer.context() != context {
            return Err(Error::InvalidContext);
        }
        Ok(buffer)
    }

    fn submit(
        &self,
        queue: Handle<CommandQueue>,
        object: &CommandQueue,
        kind_code: u32,
        kind: CommandKind,
        wait_list: Vec<Arc<Event>>,
    ) -> Result<Handle<Event>> {
        let context = object.context();
        let event = Arc::new(Event::for_command(context, queue, kind_code, self.engine.waker()));
        self.contexts.retain(context)?;
        let handle = self.events.insert_arc(Arc::clone(&event));
        let command = Command {
            kind,
            wait_list,
            event,
        };
        if let Err(e) = self.engine.submit(object.lane(), command) {
            self.release_event(handle)?;
            return Err(e);
        }
        Ok(handle)
    }

    fn bind_args(&self, args: Vec<ArgValue>) -> Result<(Vec<BoundArg>, Vec<Arc<Buffer>>)> {
        let mut bound = Vec::with_capacity(args.len());
        let mut buffers = Vec::new();
        for arg in args {
            match arg {
                ArgValue::Buffer(None) => bound.push(BoundArg::Buffer(BusAddr::null())),
                ArgValue::Buffer(Some(handle)) => {
                    // released since it was bound
                    let buffer = self.buffers.get(handle).map_err(|_| Error::KernelArgsNotSet)?;
                    bound.push(BoundArg::Buffer(buffer.bus_addr()));
                    buffers.push(buffer);
                }
                ArgValue::Scalar(bytes) => bound.push(BoundArg::Scalar(bytes)),
            }
        }
        Ok((bound, buffers))
    }

    fn enqueue_kernel(
        &self,
        queue: Handle<CommandQueue>,
        kernel: Handle<Kernel>,
        range: NdRange<'_>,
        kind_code: u32,
        wait_list: &[Handle<Event>],
    ) -> Result<Handle<Event>> {
        let object = self.queues.get(queue)?;
        let kernel = self.kernels.get(kernel)?;
        if kernel.context() != object.context() {
            return Err(Error::InvalidContext);
        }
        let wait = self.resolve_wait_list(object.context(), wait_list)?;

        range.check_dimensions()?;
        let args = kernel.snapshot()?;
        let geometry = range.resolve(kernel.meta(), self.device.max_work_group_size())?;
        let (args, buffers) = self.bind_args(args)?;

        let dispatch = Dispatch {
            program: Arc::clone(kernel.built()),
            kernel: kernel.index(),
            geometry,
            args,
            buffers,
        };
        self.submit(queue, &object, kind_code, CommandKind::NdRange(dispatch), wait)
    }

    // =========================================================================
    // Kernels
    // =========================================================================

    /// Run a kernel over an NDRange
    pub fn enqueue_nd_range_kernel(
        &self,
        queue: Handle<CommandQueue>,
        kernel: Handle<Kernel>,
        range: NdRange<'_>,
        wait_list: &[Handle<Event>],
    ) -> Result<Handle<Event>> {
        self.enqueue_kernel(queue, kernel, range, command_type::NDRANGE_KERNEL, wait_list)
    }

    /// Run a kernel as a single work-item
    pub fn enqueue_task(
        &self,
        queue: Handle<CommandQueue>,
        kernel: Handle<Kernel>,
        wait_list: &[Handle<Event>],
    ) -> Result<Handle<Event>> {
        self.enqueue_kernel(queue, kernel, NdRange::TASK, command_type::TASK, wait_list)
    }

    /// Run a host routine once the wait-list is satisfied
    pub fn enqueue_native_kernel(
        &self,
        queue: Handle<CommandQueue>,
        routine: Option<NativeFn>,
        wait_list: &[Handle<Event>],
    ) -> Result<Handle<Event>> {
        let object = self.queues.get(queue)?;
        let routine = routine.ok_or(Error::InvalidValue)?;
        let wait = self.resolve_wait_list(object.context(), wait_list)?;
        self.submit(
            queue,
            &object,
            command_type::NATIVE_KERNEL,
            CommandKind::Native(routine),
            wait,
        )
    }

    /// Mark a point in the queue; completes after everything before it
    pub fn enqueue_marker(&self, queue: Handle<CommandQueue>, wait_list: &[Handle<Event>]) -> Result<Handle<Event>> {
        let object = self.queues.get(queue)?;
        let wait = self.resolve_wait_list(object.context(), wait_list)?;
        self.submit(queue, &object, command_type::MARKER, CommandKind::Marker, wait)
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Repeat `pattern` over `len` bytes from `offset`
    pub fn enqueue_fill_buffer(
        &self,
        queue: Handle<CommandQueue>,
        buffer: Handle<Buffer>,
        pattern: &[u8],
        offset: usize,
        len: usize,
        wait_list: &[Handle<Event>],
    ) -> Result<Handle<Event>> {
        let object = self.queues.get(queue)?;
        let buffer = self.buffer_in(object.context(), buffer)?;
        if pattern.is_empty() || len % pattern.len() != 0 {
            return Err(Error::InvalidValue);
        }
        buffer.check_range(offset, len)?;
        let wait = self.resolve_wait_list(object.context(), wait_list)?;
        let kind = CommandKind::Fill {
            buffer,
            offset,
            len,
            pattern: pattern.to_vec(),
        };
        self.submit(queue, &object, command_type::FILL_BUFFER, kind, wait)
    }

    /// Copy host bytes into a buffer
    pub fn enqueue_write_buffer(
        &self,
        queue: Handle<CommandQueue>,
        buffer: Handle<Buffer>,
        offset: usize,
        data: &[u8],
        wait_list: &[Handle<Event>],
    ) -> Result<Handle<Event>> {
        let object = self.queues.get(queue)?;
        let buffer = self.buffer_in(object.context(), buffer)?;
        if data.is_empty() {
            return Err(Error::InvalidValue);
        }
        buffer.check_range(offset, data.len())?;
        let wait = self.resolve_wait_list(object.context(), wait_list)?;
        let kind = CommandKind::Write {
            buffer,
            offset,
            data: data.to_vec(),
        };
        self.submit(queue, &object, command_type::WRITE_BUFFER, kind, wait)
    }

    /// Read `len` bytes from a buffer, blocking until the read has run
    pub fn read_buffer(
        &self,
        queue: Handle<CommandQueue>,
        buffer: Handle<Buffer>,
        offset: usize,
        len: usize,
        wait_list: &[Handle<Event>],
    ) -> Result<Vec<u8>> {
        let object = self.queues.get(queue)?;
        let buffer = self.buffer_in(object.context(), buffer)?;
        if len == 0 {
            return Err(Error::InvalidValue);
        }
        buffer.check_range(offset, len)?;
        let wait = self.resolve_wait_list(object.context(), wait_list)?;

        let (out, data) = mpsc::channel();
        let kind = CommandKind::Read {
            buffer,
            offset,
            len,
            out,
        };
        let handle = self.submit(queue, &object, command_type::READ_BUFFER, kind, wait)?;
        let event = self.events.get(handle)?;
        self.release_event(handle)?;

        match event.wait(None)? {
            ExecutionStatus::Complete => data.try_recv().map_err(|_| Error::OutOfResources),
            _ => Err(Error::DependencyFailed),
        }
    }

    /// Copy `len` bytes between buffers
    pub fn enqueue_copy_buffer(
        &self,
        queue: Handle<CommandQueue>,
        src: Handle<Buffer>,
        dst: Handle<Buffer>,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        wait_list: &[Handle<Event>],
    ) -> Result<Handle<Event>> {
        let object = self.queues.get(queue)?;
        let src_buffer = self.buffer_in(object.context(), src)?;
        let dst_buffer = self.buffer_in(object.context(), dst)?;
        if len == 0 {
            return Err(Error::InvalidValue);
        }
        src_buffer.check_range(src_offset, len)?;
        dst_buffer.check_range(dst_offset, len)?;
        if src == dst && src_offset < dst_offset + len && dst_offset < src_offset + len {
            return Err(Error::InvalidValue);
        }
        let wait = self.resolve_wait_list(object.context(), wait_list)?;
        let kind = CommandKind::Copy {
            src: src_buffer,
            dst: dst_buffer,
            src_offset,
            dst_offset,
            len,
        };
        self.submit(queue, &object, command_type::COPY_BUFFER, kind, wait)
    }

    // =========================================================================
    // Queue control
    // =========================================================================

    /// Block until every command enqueued so far has finished
    pub fn finish(&self, queue: Handle<CommandQueue>) -> Result<()> {
        let marker = self.enqueue_marker(queue, &[])?;
        let event = self.events.get(marker)?;
        self.release_event(marker)?;
        event.wait(None).map(drop)
    }

    /// Commands are handed to the engine at enqueue; nothing is buffered
    pub fn flush(&self, queue: Handle<CommandQueue>) -> Result<()> {
        self.queues.get(queue).map(drop)
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn wait_until(&self, events: &[Handle<Event>], deadline: Option<Instant>) -> Result<()> {
        let (first, rest) = events.split_first().ok_or(Error::InvalidValue)?;
        let first = self.events.get(*first)?;
        let mut all = vec![Arc::clone(&first)];
        for &handle in rest {
            let event = self.events.get(handle)?;
            if event.context() != first.context() {
                return Err(Error::InvalidContext);
            }
            all.push(event);
        }

        let mut failed = false;
        for event in all {
            let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if let ExecutionStatus::Error(status) = event.wait(timeout)? {
                log::debug!("waited event ended in {}", status);
                failed = true;
            }
        }
        if failed {
            Err(Error::DependencyFailed)
        } else {
            Ok(())
        }
    }

    /// Block until every event is terminal
    ///
    /// Fails with `DependencyFailed` if any of them ended in error.
    pub fn wait_for_events(&self, events: &[Handle<Event>]) -> Result<()> {
        self.wait_until(events, None)
    }

    /// As [`Runtime::wait_for_events`], giving up with `Timeout` after `timeout`
    pub fn wait_for_events_timeout(&self, events: &[Handle<Event>], timeout: Duration) -> Result<()> {
        self.wait_until(events, Some(Instant::now() + timeout))
    }

    /// Current status, without blocking
    pub fn get_event_status(&self, event: Handle<Event>) -> Result<ExecutionStatus> {
        Ok(self.events.get(event)?.status())
    }

    /// Create an event the host completes
    pub fn create_user_event(&self, context: Handle<Context>) -> Result<Handle<Event>> {
        self.contexts.retain(context)?;
        Ok(self.events.insert(Event::user(context, self.engine.waker())))
    }

    /// Complete a user event with 0 or a negative error code
    pub fn set_user_event_status(&self, event: Handle<Event>, status: i32) -> Result<()> {
        self.events.get(event)?.set_user_status(status)
    }

    /// Increment an event's reference count
    pub fn retain_event(&self, event: Handle<Event>) -> Result<()> {
        self.events.retain(event).map(drop)
    }

    /// Decrement an event's reference count
    pub fn release_event(&self, event: Handle<Event>) -> Result<()> {
        if let Some(event) = self.events.release(event)? {
            self.release_parent(event.context());
        }
        Ok(())
    }

    /// Event query
    pub fn get_event_info(&self, event: Handle<Event>, param: u32, dst: Option<&mut [u8]>) -> Result<usize> {
        let object = self.events.get(event)?;
        let value = match param {
            info::event::REFERENCE_COUNT => self.events.reference_count(event).map(InfoValue::U32),
            _ => object.info(param),
        };
        value?.write_to(dst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::buffer::BufferFlags;
    use crate::config::CompletionMode;
    use crate::queue::QueueProperties;
    use crate::status::Status;
    use crate::testing::{arg, fixture, program_binary, Fixture};

    const HELLO: &[u8; 16] = b"Hello World!\0\0\0\0";

    fn buffer(f: &Fixture, size: usize) -> Handle<Buffer> {
        f.runtime
            .create_buffer(f.context, BufferFlags::READ_WRITE.bits(), size, None)
            .unwrap()
    }

    fn hello_round_trip(completion: CompletionMode) {
        let f = fixture(completion);
        let rt = &f.runtime;
        let a = rt
            .create_buffer(f.context, BufferFlags::READ_ONLY.bits(), 32, None)
            .unwrap();
        let b = rt
            .create_buffer(f.context, BufferFlags::WRITE_ONLY.bits(), 32, None)
            .unwrap();
        let fill = rt.enqueue_fill_buffer(f.queue, a, HELLO, 0, 32, &[]).unwrap();

        let kernel = rt.create_kernel(f.program, "hello_world").unwrap();
        rt.set_kernel_arg(kernel, 0, 8, Some(&arg(a))).unwrap();
        rt.set_kernel_arg(kernel, 1, 8, Some(&arg(b))).unwrap();
        let run = rt
            .enqueue_nd_range_kernel(f.queue, kernel, NdRange::new(3, &[1, 2, 1]), &[fill])
            .unwrap();

        rt.wait_for_events(&[run]).unwrap();
        assert_eq!(rt.get_event_status(run), Ok(ExecutionStatus::Complete));
        assert_eq!(f.firmware.gpu().programs_executed(), 2);

        let out = rt.read_buffer(f.queue, b, 0, 32, &[]).unwrap();
        assert_eq!(&out[..16], HELLO);
        assert_eq!(&out[16..], HELLO);

        for event in [fill, run] {
            rt.release_event(event).unwrap();
        }
        rt.release_kernel(kernel).unwrap();
        rt.release_mem_object(a).unwrap();
        rt.release_mem_object(b).unwrap();
    }

    #[test]
    fn test_hello_world_polling() {
        hello_round_trip(CompletionMode::Polling);
    }

    #[test]
    fn test_hello_world_firmware() {
        hello_round_trip(CompletionMode::Firmware);
    }

    #[test]
    fn test_scalar_argument_across_groups() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let data = buffer(&f, 24 * 4);
        let initial: Vec<u8> = (0u32..24).flat_map(u32::to_le_bytes).collect();
        rt.enqueue_write_buffer(f.queue, data, 0, &initial, &[]).unwrap();

        let kernel = rt.create_kernel(f.program, "add").unwrap();
        rt.set_kernel_arg(kernel, 0, 8, Some(&arg(data))).unwrap();
        rt.set_kernel_arg(kernel, 1, 4, Some(&3u32.to_le_bytes())).unwrap();
        rt.enqueue_nd_range_kernel(f.queue, kernel, NdRange::new(1, &[24]), &[])
            .unwrap();

        let out = rt.read_buffer(f.queue, data, 0, 24 * 4, &[]).unwrap();
        let words: Vec<u32> = out
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, (3u32..27).collect::<Vec<_>>());
        assert_eq!(f.firmware.gpu().programs_executed(), 24);
    }

    #[test]
    fn test_unset_arguments_rejected() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 16);
        let kernel = rt.create_kernel(f.program, "hello_world").unwrap();
        rt.set_kernel_arg(kernel, 0, 8, Some(&arg(a))).unwrap();

        let before = rt.events.len();
        assert_eq!(
            rt.enqueue_nd_range_kernel(f.queue, kernel, NdRange::new(1, &[1]), &[]),
            Err(Error::KernelArgsNotSet)
        );
        assert_eq!(rt.events.len(), before);
    }

    #[test]
    fn test_rejected_arg_keeps_binding() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 16);
        let b = buffer(&f, 16);
        rt.enqueue_write_buffer(f.queue, a, 0, HELLO, &[]).unwrap();

        let kernel = rt.create_kernel(f.program, "hello_world").unwrap();
        rt.set_kernel_arg(kernel, 0, 8, Some(&arg(a))).unwrap();
        assert_eq!(rt.set_kernel_arg(kernel, 0, 4, Some(&[0; 4])), Err(Error::InvalidArgSize));
        rt.set_kernel_arg(kernel, 1, 8, Some(&arg(b))).unwrap();

        rt.enqueue_task(f.queue, kernel, &[]).unwrap();
        assert_eq!(rt.read_buffer(f.queue, b, 0, 16, &[]).unwrap(), HELLO.to_vec());
    }

    #[test]
    fn test_stale_buffer_argument() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 16);
        let b = buffer(&f, 16);
        let kernel = rt.create_kernel(f.program, "hello_world").unwrap();
        rt.set_kernel_arg(kernel, 0, 8, Some(&arg(a))).unwrap();
        rt.set_kernel_arg(kernel, 1, 8, Some(&arg(b))).unwrap();
        rt.release_mem_object(a).unwrap();
        assert_eq!(rt.enqueue_task(f.queue, kernel, &[]), Err(Error::KernelArgsNotSet));
    }

    #[test]
    fn test_work_group_must_divide() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let data = buffer(&f, 12 * 4);
        let kernel = rt.create_kernel(f.program, "add").unwrap();
        rt.set_kernel_arg(kernel, 0, 8, Some(&arg(data))).unwrap();
        rt.set_kernel_arg(kernel, 1, 4, Some(&1u32.to_le_bytes())).unwrap();
        assert_eq!(
            rt.enqueue_nd_range_kernel(f.queue, kernel, NdRange::new(1, &[12]).with_local(&[5]), &[]),
            Err(Error::InvalidWorkGroupSize)
        );
        assert_eq!(
            rt.enqueue_nd_range_kernel(f.queue, kernel, NdRange::new(0, &[12]), &[]),
            Err(Error::InvalidWorkDimension)
        );
    }

    #[test]
    fn test_required_size_beyond_qpus_rejected() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let devices = rt.device_ids();
        let mut binary = program_binary();
        binary.kernels[0].required_wg = Some([16, 1, 1]);
        let program = rt
            .create_program_with_binary(f.context, &devices, &binary.to_bytes())
            .unwrap();
        rt.build_program(program, &devices, "").unwrap();

        let a = buffer(&f, 16 * 16);
        let b = buffer(&f, 16 * 16);
        let kernel = rt.create_kernel(program, "hello_world").unwrap();
        rt.set_kernel_arg(kernel, 0, 8, Some(&arg(a))).unwrap();
        rt.set_kernel_arg(kernel, 1, 8, Some(&arg(b))).unwrap();
        assert_eq!(
            rt.enqueue_nd_range_kernel(f.queue, kernel, NdRange::new(1, &[16]), &[]),
            Err(Error::InvalidWorkGroupSize)
        );
        assert_eq!(f.firmware.gpu().programs_executed(), 0);
    }

    #[test]
    fn test_user_event_gates_out_of_order_queue() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let device = rt.device_ids()[0];
        let queue = rt
            .create_command_queue(f.context, device, QueueProperties::OUT_OF_ORDER_EXEC_MODE.bits())
            .unwrap();
        let gate = rt.create_user_event(f.context).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let gated = rt
            .enqueue_native_kernel(queue, Some(Box::new(move || flag.store(true, Ordering::SeqCst))), &[gate])
            .unwrap();
        let free = rt.enqueue_native_kernel(queue, Some(Box::new(|| {})), &[]).unwrap();

        rt.wait_for_events(&[free]).unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(rt.get_event_status(gated), Ok(ExecutionStatus::Queued));

        rt.set_user_event_status(gate, 0).unwrap();
        rt.wait_for_events(&[gated]).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_user_event_error_propagates() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 16);
        let gate = rt.create_user_event(f.context).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let gated = rt
            .enqueue_native_kernel(f.queue, Some(Box::new(move || flag.store(true, Ordering::SeqCst))), &[gate])
            .unwrap();
        let after = rt.enqueue_write_buffer(f.queue, a, 0, HELLO, &[]).unwrap();

        rt.set_user_event_status(gate, Status::OutOfResources.as_raw()).unwrap();
        assert_eq!(rt.wait_for_events(&[gated, after]), Err(Error::DependencyFailed));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(
            rt.get_event_status(gated),
            Ok(ExecutionStatus::Error(Status::ExecStatusErrorForEventsInWaitList))
        );
        // only commands listing the failed event fail
        assert_eq!(rt.get_event_status(after), Ok(ExecutionStatus::Complete));
        assert_eq!(rt.read_buffer(f.queue, a, 0, 16, &[]).unwrap(), HELLO.to_vec());
        assert_eq!(
            rt.get_event_status(gate),
            Ok(ExecutionStatus::Error(Status::OutOfResources))
        );
    }

    #[test]
    fn test_kernel_fault_fails_event() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let kernel = rt.create_kernel(f.program, "fault").unwrap();
        let run = rt.enqueue_task(f.queue, kernel, &[]).unwrap();

        assert_eq!(rt.wait_for_events(&[run]), Err(Error::DependencyFailed));
        assert!(matches!(rt.get_event_status(run), Ok(ExecutionStatus::Error(_))));
        let after = rt.enqueue_marker(f.queue, &[run]).unwrap();
        assert_eq!(rt.wait_for_events(&[after]), Err(Error::DependencyFailed));
        rt.finish(f.queue).unwrap();
    }

    #[test]
    fn test_queue_runs_on_after_kernel_fault() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 16);
        let b = buffer(&f, 16);
        rt.enqueue_write_buffer(f.queue, a, 0, HELLO, &[]).unwrap();

        let fault = rt.create_kernel(f.program, "fault").unwrap();
        let failed = rt.enqueue_task(f.queue, fault, &[]).unwrap();

        let hello = rt.create_kernel(f.program, "hello_world").unwrap();
        rt.set_kernel_arg(hello, 0, 8, Some(&arg(a))).unwrap();
        rt.set_kernel_arg(hello, 1, 8, Some(&arg(b))).unwrap();
        let run = rt.enqueue_task(f.queue, hello, &[]).unwrap();
        let marker = rt.enqueue_marker(f.queue, &[]).unwrap();

        rt.wait_for_events(&[run, marker]).unwrap();
        assert!(matches!(rt.get_event_status(failed), Ok(ExecutionStatus::Error(_))));
        assert_eq!(rt.read_buffer(f.queue, b, 0, 16, &[]).unwrap(), HELLO.to_vec());
        rt.finish(f.queue).unwrap();
    }

    #[test]
    fn test_queue_runs_on_after_native_panic() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let failed = rt
            .enqueue_native_kernel(f.queue, Some(Box::new(|| panic!("native routine"))), &[])
            .unwrap();
        let marker = rt.enqueue_marker(f.queue, &[]).unwrap();

        rt.wait_for_events(&[marker]).unwrap();
        assert_eq!(
            rt.get_event_status(failed),
            Ok(ExecutionStatus::Error(Status::OutOfResources))
        );
    }

    #[test]
    fn test_kernel_release_during_dispatch() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 16);
        let b = buffer(&f, 16);
        rt.enqueue_write_buffer(f.queue, a, 0, HELLO, &[]).unwrap();

        let kernel = rt.create_kernel(f.program, "hello_world").unwrap();
        rt.set_kernel_arg(kernel, 0, 8, Some(&arg(a))).unwrap();
        rt.set_kernel_arg(kernel, 1, 8, Some(&arg(b))).unwrap();
        let copy = rt.clone_kernel(kernel).unwrap();

        let gate = rt.create_user_event(f.context).unwrap();
        let run = rt.enqueue_task(f.queue, copy, &[gate]).unwrap();
        rt.release_kernel(copy).unwrap();
        rt.release_kernel(kernel).unwrap();
        rt.release_program(f.program).unwrap();

        rt.set_user_event_status(gate, 0).unwrap();
        rt.wait_for_events(&[run]).unwrap();
        assert_eq!(rt.read_buffer(f.queue, b, 0, 16, &[]).unwrap(), HELLO.to_vec());
    }

    #[test]
    fn test_native_kernel_requires_routine() {
        let f = fixture(CompletionMode::Polling);
        assert_eq!(
            f.runtime.enqueue_native_kernel(f.queue, None, &[]),
            Err(Error::InvalidValue)
        );
    }

    #[test]
    fn test_copy_buffer() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 32);
        let b = buffer(&f, 32);
        rt.enqueue_write_buffer(f.queue, a, 8, HELLO, &[]).unwrap();
        rt.enqueue_copy_buffer(f.queue, a, b, 8, 0, 16, &[]).unwrap();
        assert_eq!(rt.read_buffer(f.queue, b, 0, 16, &[]).unwrap(), HELLO.to_vec());

        assert_eq!(
            rt.enqueue_copy_buffer(f.queue, a, a, 0, 8, 16, &[]),
            Err(Error::InvalidValue)
        );
        rt.enqueue_copy_buffer(f.queue, a, a, 8, 24, 8, &[]).unwrap();
        assert_eq!(
            rt.enqueue_copy_buffer(f.queue, a, b, 24, 0, 16, &[]),
            Err(Error::InvalidValue)
        );
    }

    #[test]
    fn test_fill_pattern_checks() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 32);
        assert_eq!(rt.enqueue_fill_buffer(f.queue, a, &[], 0, 32, &[]), Err(Error::InvalidValue));
        assert_eq!(rt.enqueue_fill_buffer(f.queue, a, &[1, 2, 3], 0, 32, &[]), Err(Error::InvalidValue));
        assert_eq!(rt.enqueue_fill_buffer(f.queue, a, &[1, 2], 16, 32, &[]), Err(Error::InvalidValue));

        rt.enqueue_fill_buffer(f.queue, a, &[0xAB, 0xCD], 4, 4, &[]).unwrap();
        let out = rt.read_buffer(f.queue, a, 0, 10, &[]).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 0xAB, 0xCD, 0xAB, 0xCD, 0, 0]);
    }

    #[test]
    fn test_wait_list_validation() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let other = rt.create_context(&rt.device_ids(), &[]).unwrap();
        let foreign = rt.create_user_event(other).unwrap();
        assert_eq!(rt.enqueue_marker(f.queue, &[foreign]), Err(Error::InvalidContext));
        assert_eq!(
            rt.enqueue_marker(f.queue, &[Handle::from_parts(77, 1)]),
            Err(Error::InvalidEventWaitList)
        );

        let local = rt.create_user_event(f.context).unwrap();
        assert_eq!(rt.wait_for_events(&[]), Err(Error::InvalidValue));
        assert_eq!(rt.wait_for_events(&[local, foreign]), Err(Error::InvalidContext));
    }

    #[test]
    fn test_wait_timeout() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let gate = rt.create_user_event(f.context).unwrap();
        assert_eq!(
            rt.wait_for_events_timeout(&[gate], Duration::from_millis(10)),
            Err(Error::Timeout)
        );
        rt.set_user_event_status(gate, 0).unwrap();
        rt.wait_for_events_timeout(&[gate], Duration::from_millis(10)).unwrap();
        assert_eq!(rt.set_user_event_status(gate, 0), Err(Error::InvalidOperation));
    }

    #[test]
    fn test_released_event_still_runs() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let a = buffer(&f, 16);
        let write = rt.enqueue_write_buffer(f.queue, a, 0, HELLO, &[]).unwrap();
        rt.release_event(write).unwrap();
        assert_eq!(rt.get_event_status(write), Err(Error::InvalidEvent));

        rt.finish(f.queue).unwrap();
        rt.flush(f.queue).unwrap();
        assert_eq!(rt.read_buffer(f.queue, a, 0, 16, &[]).unwrap(), HELLO.to_vec());
    }

    #[test]
    fn test_event_info() {
        let f = fixture(CompletionMode::Polling);
        let rt = &f.runtime;
        let marker = rt.enqueue_marker(f.queue, &[]).unwrap();
        rt.retain_event(marker).unwrap();

        let mut word = [0u8; 4];
        rt.get_event_info(marker, info::event::REFERENCE_COUNT, Some(&mut word))
            .unwrap();
        assert_eq!(u32::from_le_bytes(word), 2);
        rt.get_event_info(marker, info::event::COMMAND_TYPE, Some(&mut word))
            .unwrap();
        assert_eq!(u32::from_le_bytes(word), command_type::MARKER);
        assert_eq!(
            rt.get_event_info(marker, info::event::COMMAND_TYPE, Some(&mut [0u8; 2])),
            Err(Error::InvalidValue)
        );
    }

    #[test]
    fn test_shutdown_fails_blocked_commands() {
        let f = fixture(CompletionMode::Polling);
        let gate = f.runtime.create_user_event(f.context).unwrap();
        let marker = f.runtime.enqueue_marker(f.queue, &[gate]).unwrap();
        let event = f.runtime.events.get(marker).unwrap();

        drop(f);
        assert_eq!(
            event.status(),
            ExecutionStatus::Error(Status::DeviceNotAvailable)
        );
    }
}
