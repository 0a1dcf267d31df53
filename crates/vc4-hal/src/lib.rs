//! # VC4CL Hardware Abstraction Layer
//!
//! Access to the VideoCore IV V3D block from user space.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        vc4-hal                           │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────────┐  │
//! │  │  platform  │  │    mmio    │  │       v3d          │  │
//! │  │ (periph    │─►│ (/dev/mem  │─►│ (ident decode,     │  │
//! │  │  base)     │  │  window)   │  │  user-program      │  │
//! │  └────────────┘  └────────────┘  │  queue)            │  │
//! │                  ┌────────────┐  └────────────────────┘  │
//! │                  │   memory   │  ┌────────────────────┐  │
//! │                  │ (bus ->    │  │        sim         │  │
//! │                  │  host map) │  │ (register file +   │  │
//! │                  └────────────┘  │  bus memory)       │  │
//! │                                  └────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod memory;
pub mod mmio;
pub mod platform;
pub mod sim;
pub mod v3d;

pub use memory::{DevMemMapper, HostMapping, PhysicalMapper};
pub use mmio::{MmioRegion, RegisterWindow};
pub use platform::PlatformInfo;
pub use v3d::{SystemInfo, V3d};

static_assertions::assert_impl_all!(V3d: Send, Sync);
static_assertions::assert_impl_all!(HostMapping: Send, Sync);
