//! # VC4CL Core
//!
//! Foundational types shared by every layer of the VideoCore IV compute
//! runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        vc4-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Error     │  │   Types     │  │   Object tables     │  │
//! │  │  Handling   │  │ (BusAddr,   │  │  (ref-counted,      │  │
//! │  │             │  │  Handle)    │  │   generational)     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod object;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use object::ObjectTable;
pub use types::*;

// =============================================================================
// COMPILE-TIME CHECKS
// =============================================================================

static_assertions::assert_impl_all!(BusAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(Error: Send, Sync, Copy);
static_assertions::assert_impl_all!(ObjectTable<u32>: Send, Sync);
