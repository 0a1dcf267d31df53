//! # Status Codes
//!
//! The closed set of status codes every entry point reports, and the
//! execution states of events.

use core::fmt;

use vc4_core::Error;

// =============================================================================
// STATUS
// =============================================================================

/// Entry-point status code
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Call completed
    Success = 0,
    /// No accelerator found
    DeviceNotFound = -1,
    /// Accelerator unavailable
    DeviceNotAvailable = -2,
    /// Buffer allocation failed
    MemObjectAllocationFailure = -4,
    /// Device resources exhausted
    OutOfResources = -5,
    /// Host allocation failed
    OutOfHostMemory = -6,
    /// Program build failed
    BuildProgramFailure = -11,
    /// A wait-list event finished in error
    ExecStatusErrorForEventsInWaitList = -14,
    /// Argument metadata not recorded
    KernelArgInfoNotAvailable = -19,
    /// Invalid parameter value
    InvalidValue = -30,
    /// Invalid device
    InvalidDevice = -33,
    /// Invalid context
    InvalidContext = -34,
    /// Unsupported queue properties
    InvalidQueueProperties = -35,
    /// Invalid command queue
    InvalidCommandQueue = -36,
    /// Inconsistent host pointer
    InvalidHostPtr = -37,
    /// Invalid memory object
    InvalidMemObject = -38,
    /// Malformed kernel binary
    InvalidBinary = -42,
    /// Invalid program
    InvalidProgram = -44,
    /// Program not built
    InvalidProgramExecutable = -45,
    /// Unknown kernel name
    InvalidKernelName = -46,
    /// Invalid kernel
    InvalidKernel = -48,
    /// Argument index out of range
    InvalidArgIndex = -49,
    /// Invalid argument value
    InvalidArgValue = -50,
    /// Argument size mismatch
    InvalidArgSize = -51,
    /// Unbound kernel arguments
    InvalidKernelArgs = -52,
    /// Work dimension outside 1..=3
    InvalidWorkDimension = -53,
    /// Invalid work-group size
    InvalidWorkGroupSize = -54,
    /// Invalid work-item size
    InvalidWorkItemSize = -55,
    /// Invalid event wait-list
    InvalidEventWaitList = -57,
    /// Invalid event
    InvalidEvent = -58,
    /// Invalid operation
    InvalidOperation = -59,
    /// Invalid buffer size
    InvalidBufferSize = -61,
    /// Invalid global work size
    InvalidGlobalWorkSize = -63,
}

impl Status {
    const ALL: [Status; 33] = [
        Self::Success,
        Self::DeviceNotFound,
        Self::DeviceNotAvailable,
        Self::MemObjectAllocationFailure,
        Self::OutOfResources,
        Self::OutOfHostMemory,
        Self::BuildProgramFailure,
        Self::ExecStatusErrorForEventsInWaitList,
        Self::KernelArgInfoNotAvailable,
        Self::InvalidValue,
        Self::InvalidDevice,
        Self::InvalidContext,
        Self::InvalidQueueProperties,
        Self::InvalidCommandQueue,
        Self::InvalidHostPtr,
        Self::InvalidMemObject,
        Self::InvalidBinary,
        Self::InvalidProgram,
        Self::InvalidProgramExecutable,
        Self::InvalidKernelName,
        Self::InvalidKernel,
        Self::InvalidArgIndex,
        Self::InvalidArgValue,
        Self::InvalidArgSize,
        Self::InvalidKernelArgs,
        Self::InvalidWorkDimension,
        Self::InvalidWorkGroupSize,
        Self::InvalidWorkItemSize,
        Self::InvalidEventWaitList,
        Self::InvalidEvent,
        Self::InvalidOperation,
        Self::InvalidBufferSize,
        Self::InvalidGlobalWorkSize,
    ];

    /// Check if the status is success
    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }

    /// Convert to raw i32
    pub fn as_raw(&self) -> i32 {
        *self as i32
    }

    /// Create from raw i32
    pub fn from_raw(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_raw() == value)
    }

    /// Status of a call result
    pub fn of<T>(result: &vc4_core::Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => Self::from(*e),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "CL_SUCCESS",
            Self::DeviceNotFound => "CL_DEVICE_NOT_FOUND",
            Self::DeviceNotAvailable => "CL_DEVICE_NOT_AVAILABLE",
            Self::MemObjectAllocationFailure => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            Self::OutOfResources => "CL_OUT_OF_RESOURCES",
            Self::OutOfHostMemory => "CL_OUT_OF_HOST_MEMORY",
            Self::BuildProgramFailure => "CL_BUILD_PROGRAM_FAILURE",
            Self::ExecStatusErrorForEventsInWaitList => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
            Self::KernelArgInfoNotAvailable => "CL_KERNEL_ARG_INFO_NOT_AVAILABLE",
            Self::InvalidValue => "CL_INVALID_VALUE",
            Self::InvalidDevice => "CL_INVALID_DEVICE",
            Self::InvalidContext => "CL_INVALID_CONTEXT",
            Self::InvalidQueueProperties => "CL_INVALID_QUEUE_PROPERTIES",
            Self::InvalidCommandQueue => "CL_INVALID_COMMAND_QUEUE",
            Self::InvalidHostPtr => "CL_INVALID_HOST_PTR",
            Self::InvalidMemObject => "CL_INVALID_MEM_OBJECT",
            Self::InvalidBinary => "CL_INVALID_BINARY",
            Self::InvalidProgram => "CL_INVALID_PROGRAM",
            Self::InvalidProgramExecutable => "CL_INVALID_PROGRAM_EXECUTABLE",
            Self::InvalidKernelName => "CL_INVALID_KERNEL_NAME",
            Self::InvalidKernel => "CL_INVALID_KERNEL",
            Self::InvalidArgIndex => "CL_INVALID_ARG_INDEX",
            Self::InvalidArgValue => "CL_INVALID_ARG_VALUE",
            Self::InvalidArgSize => "CL_INVALID_ARG_SIZE",
            Self::InvalidKernelArgs => "CL_INVALID_KERNEL_ARGS",
            Self::InvalidWorkDimension => "CL_INVALID_WORK_DIMENSION",
            Self::InvalidWorkGroupSize => "CL_INVALID_WORK_GROUP_SIZE",
            Self::InvalidWorkItemSize => "CL_INVALID_WORK_ITEM_SIZE",
            Self::InvalidEventWaitList => "CL_INVALID_EVENT_WAIT_LIST",
            Self::InvalidEvent => "CL_INVALID_EVENT",
            Self::InvalidOperation => "CL_INVALID_OPERATION",
            Self::InvalidBufferSize => "CL_INVALID_BUFFER_SIZE",
            Self::InvalidGlobalWorkSize => "CL_INVALID_GLOBAL_WORK_SIZE",
        };
        f.write_str(name)
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidValue => Self::InvalidValue,
            Error::InvalidOperation => Self::InvalidOperation,
            Error::NotSupported => Self::InvalidOperation,
            Error::Timeout => Self::OutOfResources,

            Error::InvalidDevice => Self::InvalidDevice,
            Error::InvalidContext => Self::InvalidContext,
            Error::InvalidCommandQueue => Self::InvalidCommandQueue,
            Error::InvalidQueueProperties => Self::InvalidQueueProperties,
            Error::InvalidProgram => Self::InvalidProgram,
            Error::InvalidProgramExecutable => Self::InvalidProgramExecutable,
            Error::InvalidKernel => Self::InvalidKernel,
            Error::InvalidKernelName => Self::InvalidKernelName,
            Error::InvalidMemObject => Self::InvalidMemObject,
            Error::InvalidEvent => Self::InvalidEvent,
            Error::InvalidEventWaitList => Self::InvalidEventWaitList,

            Error::InvalidArgIndex => Self::InvalidArgIndex,
            Error::InvalidArgSize => Self::InvalidArgSize,
            Error::InvalidArgValue => Self::InvalidArgValue,
            Error::KernelArgsNotSet => Self::InvalidKernelArgs,
            Error::ArgInfoNotAvailable => Self::KernelArgInfoNotAvailable,

            Error::InvalidWorkDimension => Self::InvalidWorkDimension,
            Error::InvalidWorkGroupSize => Self::InvalidWorkGroupSize,
            Error::InvalidWorkItemSize => Self::InvalidWorkItemSize,
            Error::InvalidGlobalWorkSize => Self::InvalidGlobalWorkSize,
            Error::InvalidBufferSize => Self::InvalidBufferSize,
            Error::InvalidHostPtr => Self::InvalidHostPtr,
            Error::DependencyFailed => Self::ExecStatusErrorForEventsInWaitList,

            Error::InvalidBinary => Self::InvalidBinary,
            Error::BuildProgramFailure => Self::BuildProgramFailure,

            Error::OutOfResources => Self::OutOfResources,
            Error::OutOfHostMemory => Self::OutOfHostMemory,
            Error::AllocationFailed => Self::MemObjectAllocationFailure,

            Error::DeviceNotFound => Self::DeviceNotFound,
            Error::DeviceNotAvailable => Self::DeviceNotAvailable,
            Error::MailboxTransport
            | Error::MalformedResponse
            | Error::ShortResponse
            | Error::FirmwareRejected
            | Error::MmioError
            | Error::MappingFailed
            | Error::InvalidBusAddress
            | Error::MisalignedAddress
            | Error::GpuFault => Self::OutOfResources,

            _ => Self::OutOfResources,
        }
    }
}

// =============================================================================
// EXECUTION STATUS
// =============================================================================

/// Execution state of an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    /// Enqueued, not yet picked up
    Queued,
    /// Picked up by the engine
    Submitted,
    /// Handed to the hardware
    Running,
    /// Finished successfully
    Complete,
    /// Finished with an error
    Error(Status),
}

impl ExecutionStatus {
    /// Raw value as reported by event queries
    pub fn as_raw(&self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Running => 1,
            Self::Submitted => 2,
            Self::Queued => 3,
            Self::Error(status) => status.as_raw(),
        }
    }

    /// Decode a raw value; negative values are errors
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Complete),
            1 => Some(Self::Running),
            2 => Some(Self::Submitted),
            3 => Some(Self::Queued),
            v if v < 0 => Some(Self::Error(Status::from_raw(v).unwrap_or(Status::OutOfResources))),
            _ => None,
        }
    }

    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error(_))
    }

    /// Position in the queued → complete order
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Submitted => 1,
            Self::Running => 2,
            Self::Complete | Self::Error(_) => 3,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("CL_QUEUED"),
            Self::Submitted => f.write_str("CL_SUBMITTED"),
            Self::Running => f.write_str("CL_RUNNING"),
            Self::Complete => f.write_str("CL_COMPLETE"),
            Self::Error(status) => write!(f, "error ({})", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip_of_named_codes() {
        assert_eq!(Status::from_raw(-52), Some(Status::InvalidKernelArgs));
        assert_eq!(Status::from_raw(0), Some(Status::Success));
        assert_eq!(Status::from_raw(-1000), None);
        assert_eq!(Status::InvalidArgIndex.as_raw(), -49);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(Status::from(Error::KernelArgsNotSet), Status::InvalidKernelArgs);
        assert_eq!(Status::from(Error::DependencyFailed), Status::ExecStatusErrorForEventsInWaitList);
        assert_eq!(Status::from(Error::ArgInfoNotAvailable), Status::KernelArgInfoNotAvailable);
        assert_eq!(Status::from(Error::AllocationFailed), Status::MemObjectAllocationFailure);
        assert_eq!(Status::from(Error::GpuFault), Status::OutOfResources);
    }

    #[test]
    fn test_execution_status_values() {
        assert_eq!(ExecutionStatus::Complete.as_raw(), 0);
        assert_eq!(ExecutionStatus::Queued.as_raw(), 3);
        assert_eq!(ExecutionStatus::Error(Status::OutOfResources).as_raw(), -5);
        assert_eq!(ExecutionStatus::from_raw(-5), Some(ExecutionStatus::Error(Status::OutOfResources)));
        assert!(ExecutionStatus::Error(Status::InvalidValue).is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::InvalidArgSize.to_string(), "CL_INVALID_ARG_SIZE");
        assert_eq!(ExecutionStatus::Complete.to_string(), "CL_COMPLETE");
    }
}
