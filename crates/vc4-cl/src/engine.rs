//! # Execution Engine
//!
//! One worker thread drains every queue. Each queue is a lane of pending
//! commands: in-order lanes only ever look at their head, out-of-order lanes
//! start the first command whose wait-list is satisfied. A failed command
//! fails only the commands that list its event.
//!
//! ```text
//!   enqueue ──► Lane (VecDeque<Command>) ──► take_ready ──► Executor
//!                        ▲                                     │
//!                        └──── Event terminal ─► notify ◄──────┘
//! ```
//!
//! The worker sleeps on a condition variable guarded by the engine state.
//! Every terminal event transition takes that lock before notifying, so a
//! completion between the readiness scan and the sleep is never lost.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use vc4_core::{BusAddr, Error, Result};
use vc4_mailbox::GpuMemory;

use crate::buffer::InFlight;
use crate::command::{Command, CommandKind, Dispatch};
use crate::config::{CompletionMode, RuntimeConfig};
use crate::device::Device;
use crate::marshal::{self, HEADER_WORDS};
use crate::status::{ExecutionStatus, Status};

// =============================================================================
// SHARED STATE
// =============================================================================

#[derive(Debug)]
struct Lane {
    out_of_order: bool,
    pending: VecDeque<Command>,
    closed: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    lanes: BTreeMap<u64, Lane>,
    next_lane: u64,
    shutdown: bool,
}

impl EngineState {
    fn take_ready(&mut self) -> Option<Command> {
        for lane in self.lanes.values_mut() {
            let position = if lane.out_of_order {
                lane.pending.iter().position(Command::is_ready)
            } else {
                lane.pending.front().filter(|c| c.is_ready()).map(|_| 0)
            };
            if let Some(position) = position {
                return lane.pending.remove(position);
            }
        }
        self.lanes.retain(|_, lane| !(lane.closed && lane.pending.is_empty()));
        None
    }
}

/// State shared between the API side and the worker
#[derive(Debug, Default)]
pub(crate) struct EngineShared {
    state: Mutex<EngineState>,
    wake: Condvar,
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wake the worker to rescan the lanes
    pub(crate) fn notify(&self) {
        let _state = self.lock();
        self.wake.notify_all();
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Handle on the worker thread
pub(crate) struct Engine {
    shared: Arc<EngineShared>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawn the worker
    pub fn start(executor: Executor) -> Result<Self> {
        let shared = Arc::new(EngineShared::default());
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("vc4-engine".into())
                .spawn(move || worker(&shared, &executor))
                .map_err(|e| {
                    log::error!("cannot start engine thread: {}", e);
                    Error::OutOfResources
                })?
        };
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Wake-up target for events
    pub fn waker(&self) -> Weak<EngineShared> {
        Arc::downgrade(&self.shared)
    }

    /// Register a queue
    pub fn open_lane(&self, out_of_order: bool) -> u64 {
        let mut state = self.shared.lock();
        let id = state.next_lane;
        state.next_lane += 1;
        state.lanes.insert(
            id,
            Lane {
                out_of_order,
                pending: VecDeque::new(),
                closed: false,
            },
        );
        id
    }

    /// Forget a queue once its pending commands have run
    pub fn close_lane(&self, lane: u64) {
        if let Some(lane) = self.shared.lock().lanes.get_mut(&lane) {
            lane.closed = true;
        }
    }

    /// Append a command to a lane
    pub fn submit(&self, lane: u64, mut command: Command) -> Result<()> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(Error::DeviceNotAvailable);
        }
        let lane = state.lanes.get_mut(&lane).ok_or(Error::InvalidCommandQueue)?;

        if lane.out_of_order && matches!(command.kind, CommandKind::Marker) {
            command
                .wait_list
                .extend(lane.pending.iter().map(|c| Arc::clone(&c.event)));
        }
        log::trace!("engine: {:?} queued on lane", command.kind);
        lane.pending.push_back(command);
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Run what can still run, fail what is blocked, and join the worker
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("engine thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("lanes", &self.shared.lock().lanes.len())
            .field("running", &self.worker.is_some())
            .finish()
    }
}

fn worker(shared: &EngineShared, executor: &Executor) {
    loop {
        let command = {
            let mut state = shared.lock();
            loop {
                if let Some(command) = state.take_ready() {
                    break Some(command);
                }
                if state.shutdown {
                    break None;
                }
                state = shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        match command {
            Some(command) => executor.run(command),
            None => break,
        }
    }

    let abandoned: Vec<Command> = {
        let mut state = shared.lock();
        let lanes = std::mem::take(&mut state.lanes);
        lanes.into_values().flat_map(|lane| lane.pending).collect()
    };
    if !abandoned.is_empty() {
        log::warn!("engine shutdown: failing {} blocked commands", abandoned.len());
    }
    for command in abandoned {
        command
            .event
            .advance(ExecutionStatus::Error(Status::DeviceNotAvailable));
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// Runs commands against the device
#[derive(Debug)]
pub(crate) struct Executor {
    device: Arc<Device>,
    config: RuntimeConfig,
}

impl Executor {
    pub fn new(device: Arc<Device>, config: RuntimeConfig) -> Self {
        Self { device, config }
    }

    fn run(&self, command: Command) {
        if command.dependency_failed() {
            log::debug!("engine: {:?} skipped, dependency failed", command.kind);
            command
                .event
                .advance(ExecutionStatus::Error(Status::ExecStatusErrorForEventsInWaitList));
            return;
        }
        let Command { kind, event, .. } = command;

        event.advance(ExecutionStatus::Submitted);
        event.advance(ExecutionStatus::Running);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(kind)))
            .unwrap_or_else(|_| {
                log::error!("engine: command panicked");
                Err(Error::OutOfResources)
            });
        match outcome {
            Ok(()) => {
                event.advance(ExecutionStatus::Complete);
            }
            Err(e) => {
                log::warn!("engine: command failed: {}", e);
                event.advance(ExecutionStatus::Error(Status::from(e)));
            }
        }
    }

    fn execute(&self, kind: CommandKind) -> Result<()> {
        match kind {
            CommandKind::NdRange(dispatch) => self.dispatch(&dispatch),
            CommandKind::Fill {
                buffer,
                offset,
                len,
                pattern,
            } => {
                let buffer = buffer.begin_use();
                buffer.buffer().mapping().fill(offset, len, &pattern)
            }
            CommandKind::Native(routine) => {
                routine();
                Ok(())
            }
            CommandKind::Read {
                buffer,
                offset,
                len,
                out,
            } => {
                let buffer = buffer.begin_use();
                let mut data = vec![0u8; len];
                buffer.buffer().mapping().read(offset, &mut data)?;
                // the reader may have given up waiting
                let _ = out.send(data);
                Ok(())
            }
            CommandKind::Write {
                buffer,
                offset,
                data,
            } => {
                let buffer = buffer.begin_use();
                buffer.buffer().mapping().write(offset, &data)
            }
            CommandKind::Copy {
                src,
                dst,
                src_offset,
                dst_offset,
                len,
            } => {
                let src = src.begin_use();
                let dst = dst.begin_use();
                dst.buffer()
                    .mapping()
                    .copy_from(dst_offset, src.buffer().mapping(), src_offset, len)
            }
            CommandKind::Marker => Ok(()),
        }
    }

    /// Run every work-group of a kernel, one group at a time
    fn dispatch(&self, dispatch: &Dispatch) -> Result<()> {
        let _in_flight: Vec<InFlight> = dispatch.buffers.iter().map(|b| b.begin_use()).collect();

        let entry = dispatch.program.entry(dispatch.kernel)?;
        let geometry = &dispatch.geometry;
        let args = marshal::arg_words(&dispatch.args);
        let per_qpu = HEADER_WORDS + args.len();
        let qpus = geometry.local_count();
        let stream_bytes = qpus * per_qpu * 4;
        let total = stream_bytes + qpus * 8;

        let block = GpuMemory::allocate(
            self.device.mailbox(),
            u32::try_from(total).map_err(|_| Error::OutOfResources)?,
            self.config.alloc_alignment,
            self.config.alloc_flags,
        )?;
        let map = self.device.mapper().map(block.bus_addr(), total)?;
        let uniforms_of = |qpu: usize| block.bus_addr() + (qpu * per_qpu * 4) as u32;
        let control = block.bus_addr() + stream_bytes as u32;

        if self.config.completion == CompletionMode::Firmware {
            let pairs: Vec<u8> = (0..qpus)
                .flat_map(|q| [uniforms_of(q).raw(), entry.raw()])
                .flat_map(u32::to_le_bytes)
                .collect();
            map.write(stream_bytes, &pairs)?;
        }

        log::debug!(
            "dispatch: entry {} global {:?} local {:?}, {} uniforms per QPU",
            entry,
            geometry.global,
            geometry.local,
            per_qpu
        );

        for group in geometry.groups() {
            for qpu in 0..qpus {
                let words = marshal::uniforms(geometry, group, geometry.local_id(qpu), &args);
                let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
                map.write(qpu * per_qpu * 4, &bytes)?;
            }
            match self.config.completion {
                CompletionMode::Polling => self.run_polled(entry, qpus, per_qpu, &uniforms_of)?,
                CompletionMode::Firmware => self.run_firmware(qpus, control)?,
            }
        }
        Ok(())
    }

    fn run_polled(
        &self,
        entry: BusAddr,
        qpus: usize,
        per_qpu: usize,
        uniforms_of: &dyn Fn(usize) -> BusAddr,
    ) -> Result<()> {
        let regs = self.device.v3d().lock();
        regs.reset_user_queue()?;
        for qpu in 0..qpus {
            regs.submit_program(entry, uniforms_of(qpu), per_qpu as u32)?;
        }
        regs.wait_for_programs(qpus as u32, self.config.dispatch_timeout, self.config.poll_interval)
    }

    fn run_firmware(&self, qpus: usize, control: BusAddr) -> Result<()> {
        // keeps register users out while the firmware drives the QPUs
        let _regs = self.device.v3d().lock();
        self.device
            .mailbox()
            .execute_qpu(qpus as u32, control, false, self.config.timeout_ms())
    }
}
