//! # VC4CL Mailbox
//!
//! Communication with the VideoCore firmware over the property channel.
//!
//! The firmware owns GPU memory and QPU power, so every buffer the runtime
//! hands to the GPU is allocated here, and firmware-signalled dispatch goes
//! through the `ExecuteQpu` tag.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod mailbox;
pub mod message;
pub mod sim;
pub mod transport;

pub use mailbox::{Clock, GpuMemory, Mailbox, MemFlags, MemHandle, MemoryRegion};
pub use message::Tag;
pub use transport::{Transport, VcioTransport};

static_assertions::assert_impl_all!(Mailbox: Send, Sync);
static_assertions::assert_impl_all!(GpuMemory: Send, Sync);
