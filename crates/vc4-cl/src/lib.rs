//! # VC4CL Compute Runtime
//!
//! OpenCL-style compute on the VideoCore IV GPU: contexts, buffers,
//! precompiled programs, kernels, command queues and events over the
//! mailbox and V3D layers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             vc4-cl                               │
//! │  ┌───────────┐   ┌──────────────────────────────────────────┐    │
//! │  │  Runtime  │──►│ object tables (context, queue, buffer,   │    │
//! │  │ (entry    │   │ program, kernel, event)                  │    │
//! │  │  points)  │   └──────────────────────────────────────────┘    │
//! │  └─────┬─────┘                                                   │
//! │        │ enqueue     ┌──────────┐    ┌─────────────────────┐     │
//! │        └────────────►│  Engine  │───►│ Executor            │     │
//! │                      │ (lanes)  │    │ (marshal, dispatch) │     │
//! │                      └──────────┘    └──────────┬──────────┘     │
//! └─────────────────────────────────────────────────┼────────────────┘
//!                                                   ▼
//!                            vc4-mailbox (memory, QPU execute)
//!                            vc4-hal     (V3D registers, mapping)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use vc4_cl::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::open(RuntimeConfig::from_env())?;
//! let devices = runtime.device_ids();
//! let context = runtime.create_context(&devices, &[])?;
//! let queue = runtime.create_command_queue(context, devices[0], 0)?;
//! # let _ = queue;
//! # Ok::<(), vc4_cl::Error>(())
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod binary;
pub mod buffer;
pub mod command;
pub mod config;
pub mod context;
pub mod device;
mod engine;
mod enqueue;
pub mod event;
pub mod info;
pub mod kernel;
pub mod marshal;
pub mod program;
pub mod queue;
pub mod runtime;
pub mod status;

#[cfg(test)]
mod testing;

pub use binary::{AccessQualifier, AddressQualifier, ArgKind, ArgMeta, KernelMeta, ProgramBinary};
pub use buffer::{Buffer, BufferFlags};
pub use command::{command_type, NativeFn};
pub use config::{CompletionMode, RuntimeConfig};
pub use context::Context;
pub use device::{Device, Platform};
pub use event::Event;
pub use info::InfoValue;
pub use kernel::Kernel;
pub use program::{BuildStatus, Program};
pub use queue::{CommandQueue, NdRange, QueueProperties};
pub use runtime::Runtime;
pub use status::{ExecutionStatus, Status};
pub use vc4_core::{Error, Handle, Result};

// =============================================================================
// COMPILE-TIME CHECKS
// =============================================================================

static_assertions::assert_impl_all!(Runtime: Send, Sync);
static_assertions::assert_impl_all!(Event: Send, Sync);
static_assertions::assert_impl_all!(Buffer: Send, Sync);
static_assertions::assert_impl_all!(Kernel: Send, Sync);
