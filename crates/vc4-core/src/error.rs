//! # VC4CL Error Handling
//!
//! One error type for the whole runtime stack.
//!
//! Errors are grouped by the subsystem that raises them. The compute layer
//! maps every variant onto its closed status enumeration, so adding a variant
//! here means adding a mapping there.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// VC4CL Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// VC4CL unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter value
    InvalidValue,
    /// Operation is not valid in the current state
    InvalidOperation,
    /// Operation not supported on this hardware
    NotSupported,
    /// Operation timed out
    Timeout,

    // =========================================================================
    // Object Errors
    // =========================================================================
    /// Device handle does not name the accelerator
    InvalidDevice,
    /// Context handle is stale or unknown
    InvalidContext,
    /// Command queue handle is stale or unknown
    InvalidCommandQueue,
    /// Unsupported command queue properties
    InvalidQueueProperties,
    /// Program handle is stale or unknown
    InvalidProgram,
    /// Program has not been built successfully
    InvalidProgramExecutable,
    /// Kernel handle is stale or unknown
    InvalidKernel,
    /// No kernel with the requested name
    InvalidKernelName,
    /// Buffer handle is stale or unknown
    InvalidMemObject,
    /// Event handle is stale or unknown
    InvalidEvent,
    /// Wait-list contains invalid events or mixes contexts
    InvalidEventWaitList,

    // =========================================================================
    // Kernel Argument Errors
    // =========================================================================
    /// Argument index beyond the kernel signature
    InvalidArgIndex,
    /// Argument size does not match the slot
    InvalidArgSize,
    /// Argument value is not acceptable for the slot
    InvalidArgValue,
    /// At least one argument slot is unbound
    KernelArgsNotSet,
    /// Requested argument metadata was not recorded
    ArgInfoNotAvailable,

    // =========================================================================
    // Dispatch Errors
    // =========================================================================
    /// Work dimension outside 1..=3
    InvalidWorkDimension,
    /// Local size does not divide the global size or exceeds limits
    InvalidWorkGroupSize,
    /// Per-dimension local size above the device limit
    InvalidWorkItemSize,
    /// Global size is zero or too large
    InvalidGlobalWorkSize,
    /// Buffer range or size is out of bounds
    InvalidBufferSize,
    /// Host pointer usage is inconsistent with the flags
    InvalidHostPtr,
    /// A wait-list dependency finished in error
    DependencyFailed,

    // =========================================================================
    // Program Errors
    // =========================================================================
    /// Kernel binary container is malformed
    InvalidBinary,
    /// Program could not be built
    BuildProgramFailure,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Device-side resources exhausted
    OutOfResources,
    /// Host-side allocation failed
    OutOfHostMemory,
    /// GPU memory allocation failed
    AllocationFailed,

    // =========================================================================
    // Firmware Errors
    // =========================================================================
    /// Mailbox transport failed to exchange a message
    MailboxTransport,
    /// Firmware response has an unexpected layout
    MalformedResponse,
    /// Firmware response carried fewer words than requested
    ShortResponse,
    /// Firmware reported failure for the request
    FirmwareRejected,

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    /// Accelerator device not found
    DeviceNotFound,
    /// Accelerator present but unusable
    DeviceNotAvailable,
    /// Register access outside the mapped window
    MmioError,
    /// Memory mapping failed
    MappingFailed,
    /// Bus address outside any known mapping
    InvalidBusAddress,
    /// Address not aligned
    MisalignedAddress,
    /// GPU reported a fault during execution
    GpuFault,
}

impl Error {
    /// Whether the error was raised by hardware or firmware rather than by
    /// the caller
    pub const fn is_hardware(self) -> bool {
        matches!(
            self,
            Self::MailboxTransport
                | Self::MalformedResponse
                | Self::ShortResponse
                | Self::FirmwareRejected
                | Self::DeviceNotFound
                | Self::DeviceNotAvailable
                | Self::MmioError
                | Self::MappingFailed
                | Self::InvalidBusAddress
                | Self::GpuFault
                | Self::Timeout
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidValue => write!(f, "invalid value"),
            Self::InvalidOperation => write!(f, "invalid operation"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Timeout => write!(f, "operation timed out"),

            // Objects
            Self::InvalidDevice => write!(f, "invalid device"),
            Self::InvalidContext => write!(f, "invalid context"),
            Self::InvalidCommandQueue => write!(f, "invalid command queue"),
            Self::InvalidQueueProperties => write!(f, "invalid queue properties"),
            Self::InvalidProgram => write!(f, "invalid program"),
            Self::InvalidProgramExecutable => write!(f, "program not built"),
            Self::InvalidKernel => write!(f, "invalid kernel"),
            Self::InvalidKernelName => write!(f, "no kernel with this name"),
            Self::InvalidMemObject => write!(f, "invalid memory object"),
            Self::InvalidEvent => write!(f, "invalid event"),
            Self::InvalidEventWaitList => write!(f, "invalid event wait-list"),

            // Arguments
            Self::InvalidArgIndex => write!(f, "invalid argument index"),
            Self::InvalidArgSize => write!(f, "invalid argument size"),
            Self::InvalidArgValue => write!(f, "invalid argument value"),
            Self::KernelArgsNotSet => write!(f, "kernel arguments not set"),
            Self::ArgInfoNotAvailable => write!(f, "argument info not available"),

            // Dispatch
            Self::InvalidWorkDimension => write!(f, "invalid work dimension"),
            Self::InvalidWorkGroupSize => write!(f, "invalid work-group size"),
            Self::InvalidWorkItemSize => write!(f, "invalid work-item size"),
            Self::InvalidGlobalWorkSize => write!(f, "invalid global work size"),
            Self::InvalidBufferSize => write!(f, "invalid buffer size or range"),
            Self::InvalidHostPtr => write!(f, "invalid host pointer"),
            Self::DependencyFailed => write!(f, "wait-list event finished in error"),

            // Program
            Self::InvalidBinary => write!(f, "invalid kernel binary"),
            Self::BuildProgramFailure => write!(f, "program build failed"),

            // Resources
            Self::OutOfResources => write!(f, "out of device resources"),
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::AllocationFailed => write!(f, "GPU memory allocation failed"),

            // Firmware
            Self::MailboxTransport => write!(f, "mailbox transport failure"),
            Self::MalformedResponse => write!(f, "malformed firmware response"),
            Self::ShortResponse => write!(f, "short firmware response"),
            Self::FirmwareRejected => write!(f, "firmware rejected request"),

            // Hardware
            Self::DeviceNotFound => write!(f, "GPU device not found"),
            Self::DeviceNotAvailable => write!(f, "GPU device not available"),
            Self::MmioError => write!(f, "register access outside window"),
            Self::MappingFailed => write!(f, "memory mapping failed"),
            Self::InvalidBusAddress => write!(f, "invalid bus address"),
            Self::MisalignedAddress => write!(f, "misaligned address"),
            Self::GpuFault => write!(f, "GPU fault detected"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
