//! # Info Queries
//!
//! Every `get_*_info` entry point resolves its parameter to an [`InfoValue`]
//! and copies the encoded bytes out with [`InfoValue::write_to`], which
//! implements the size-query convention: no destination reports the size,
//! a destination smaller than the value is rejected without a partial write.

use vc4_core::{Error, Result};

// =============================================================================
// VALUES
// =============================================================================

/// Encoded answer to an info query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoValue {
    /// `cl_uint`
    U32(u32),
    /// `cl_int`
    I32(i32),
    /// `cl_ulong` and 64-bit bitfields
    U64(u64),
    /// `size_t`
    Usize(usize),
    /// `cl_bool`, encoded as a 32-bit 0/1
    Bool(bool),
    /// NUL-terminated string
    Str(String),
    /// Single object handle
    Handle(u64),
    /// `size_t[]`
    Sizes(Vec<usize>),
    /// Handle array
    Handles(Vec<u64>),
    /// Opaque bytes
    Bytes(Vec<u8>),
}

impl InfoValue {
    /// Little-endian encoding of the value
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::I32(v) => v.to_le_bytes().to_vec(),
            Self::U64(v) | Self::Handle(v) => v.to_le_bytes().to_vec(),
            Self::Usize(v) => v.to_le_bytes().to_vec(),
            Self::Bool(v) => u32::from(*v).to_le_bytes().to_vec(),
            Self::Str(s) => {
                let mut bytes = Vec::with_capacity(s.len() + 1);
                bytes.extend_from_slice(s.as_bytes());
                bytes.push(0);
                bytes
            }
            Self::Sizes(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
            Self::Handles(v) => v.iter().flat_map(|h| h.to_le_bytes()).collect(),
            Self::Bytes(v) => v.clone(),
        }
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }

    /// Copy the value into `dst` and return its size
    ///
    /// With `dst == None` only the size is reported.
    pub fn write_to(&self, dst: Option<&mut [u8]>) -> Result<usize> {
        let bytes = self.to_bytes();
        if let Some(dst) = dst {
            if dst.len() < bytes.len() {
                return Err(Error::InvalidValue);
            }
            dst[..bytes.len()].copy_from_slice(&bytes);
        }
        Ok(bytes.len())
    }

    /// Decode a string value, without its terminator
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

// =============================================================================
// PARAMETER CODES
// =============================================================================

/// Device parameters
pub mod device {
    /// Device type bitfield
    pub const TYPE: u32 = 0x1000;
    /// Vendor id
    pub const VENDOR_ID: u32 = 0x1001;
    /// Compute unit count
    pub const MAX_COMPUTE_UNITS: u32 = 0x1002;
    /// Work-item dimensions
    pub const MAX_WORK_ITEM_DIMENSIONS: u32 = 0x1003;
    /// Largest work-group
    pub const MAX_WORK_GROUP_SIZE: u32 = 0x1004;
    /// Largest local size per dimension
    pub const MAX_WORK_ITEM_SIZES: u32 = 0x1005;
    /// Clock in MHz
    pub const MAX_CLOCK_FREQUENCY: u32 = 0x100C;
    /// Largest single allocation
    pub const MAX_MEM_ALLOC_SIZE: u32 = 0x1010;
    /// GPU memory size
    pub const GLOBAL_MEM_SIZE: u32 = 0x101F;
    /// VPM bytes for user programs
    pub const LOCAL_MEM_SIZE: u32 = 0x1023;
    /// Availability
    pub const AVAILABLE: u32 = 0x1027;
    /// Device name
    pub const NAME: u32 = 0x102B;
    /// Vendor name
    pub const VENDOR: u32 = 0x102C;
    /// Driver version
    pub const DRIVER_VERSION: u32 = 0x102D;
    /// Supported version string
    pub const VERSION: u32 = 0x102F;

    /// GPU device type
    pub const TYPE_GPU: u64 = 1 << 2;
}

/// Context parameters
pub mod context {
    /// Reference count
    pub const REFERENCE_COUNT: u32 = 0x1080;
    /// Devices
    pub const DEVICES: u32 = 0x1081;
    /// Creation properties
    pub const PROPERTIES: u32 = 0x1082;
    /// Device count
    pub const NUM_DEVICES: u32 = 0x1083;
}

/// Command queue parameters
pub mod queue {
    /// Owning context
    pub const CONTEXT: u32 = 0x1090;
    /// Device
    pub const DEVICE: u32 = 0x1091;
    /// Reference count
    pub const REFERENCE_COUNT: u32 = 0x1092;
    /// Properties bitfield
    pub const PROPERTIES: u32 = 0x1093;
}

/// Memory object parameters
pub mod mem {
    /// Object type
    pub const TYPE: u32 = 0x1100;
    /// Creation flags
    pub const FLAGS: u32 = 0x1101;
    /// Size in bytes
    pub const SIZE: u32 = 0x1102;
    /// Host pointer
    pub const HOST_PTR: u32 = 0x1103;
    /// Outstanding maps
    pub const MAP_COUNT: u32 = 0x1104;
    /// Reference count
    pub const REFERENCE_COUNT: u32 = 0x1105;
    /// Owning context
    pub const CONTEXT: u32 = 0x1106;
    /// Parent buffer of a sub-buffer
    pub const ASSOCIATED_MEMOBJECT: u32 = 0x1107;
    /// Offset in the parent buffer
    pub const OFFSET: u32 = 0x1108;

    /// Plain buffer object type
    pub const OBJECT_BUFFER: u32 = 0x10F0;
}

/// Program parameters
pub mod program {
    /// Reference count
    pub const REFERENCE_COUNT: u32 = 0x1160;
    /// Owning context
    pub const CONTEXT: u32 = 0x1161;
    /// Device count
    pub const NUM_DEVICES: u32 = 0x1162;
    /// Devices
    pub const DEVICES: u32 = 0x1163;
    /// Source text
    pub const SOURCE: u32 = 0x1164;
    /// Binary size per device
    pub const BINARY_SIZES: u32 = 0x1165;
    /// Binaries
    pub const BINARIES: u32 = 0x1166;
    /// Kernel count
    pub const NUM_KERNELS: u32 = 0x1167;
    /// Semicolon-separated kernel names
    pub const KERNEL_NAMES: u32 = 0x1168;
}

/// Program build parameters
pub mod build {
    /// Build status
    pub const STATUS: u32 = 0x1181;
    /// Build options
    pub const OPTIONS: u32 = 0x1182;
    /// Build log
    pub const LOG: u32 = 0x1183;

    /// Never built
    pub const STATUS_NONE: i32 = -1;
    /// Build failed
    pub const STATUS_ERROR: i32 = -2;
    /// Build succeeded
    pub const STATUS_SUCCESS: i32 = 0;
    /// Build running
    pub const STATUS_IN_PROGRESS: i32 = -3;
}

/// Kernel parameters
pub mod kernel {
    /// Entry-point name
    pub const FUNCTION_NAME: u32 = 0x1190;
    /// Argument count
    pub const NUM_ARGS: u32 = 0x1191;
    /// Reference count
    pub const REFERENCE_COUNT: u32 = 0x1192;
    /// Owning context
    pub const CONTEXT: u32 = 0x1193;
    /// Owning program
    pub const PROGRAM: u32 = 0x1194;
    /// Source attributes
    pub const ATTRIBUTES: u32 = 0x1195;
}

/// Kernel work-group parameters
pub mod work_group {
    /// Largest work-group for this kernel
    pub const WORK_GROUP_SIZE: u32 = 0x11B0;
    /// Required work-group size, zeros when free
    pub const COMPILE_WORK_GROUP_SIZE: u32 = 0x11B1;
    /// Local memory used
    pub const LOCAL_MEM_SIZE: u32 = 0x11B2;
    /// Preferred work-group size multiple
    pub const PREFERRED_WORK_GROUP_SIZE_MULTIPLE: u32 = 0x11B3;
    /// Private memory used
    pub const PRIVATE_MEM_SIZE: u32 = 0x11B4;
    /// Only valid for built-in kernels
    pub const GLOBAL_WORK_SIZE: u32 = 0x11B5;
}

/// Kernel argument parameters
pub mod arg {
    /// Address space qualifier
    pub const ADDRESS_QUALIFIER: u32 = 0x1196;
    /// Image access qualifier
    pub const ACCESS_QUALIFIER: u32 = 0x1197;
    /// Type name
    pub const TYPE_NAME: u32 = 0x1198;
    /// Type qualifier bitfield
    pub const TYPE_QUALIFIER: u32 = 0x1199;
    /// Argument name
    pub const NAME: u32 = 0x119A;

    /// `__global`
    pub const ADDRESS_GLOBAL: u32 = 0x119B;
    /// `__local`
    pub const ADDRESS_LOCAL: u32 = 0x119C;
    /// `__constant`
    pub const ADDRESS_CONSTANT: u32 = 0x119D;
    /// `__private`
    pub const ADDRESS_PRIVATE: u32 = 0x119E;

    /// `read_only`
    pub const ACCESS_READ_ONLY: u32 = 0x11A0;
    /// `write_only`
    pub const ACCESS_WRITE_ONLY: u32 = 0x11A1;
    /// `read_write`
    pub const ACCESS_READ_WRITE: u32 = 0x11A2;
    /// Not an image
    pub const ACCESS_NONE: u32 = 0x11A3;

    /// `const`
    pub const TYPE_CONST: u64 = 1 << 0;
    /// `restrict`
    pub const TYPE_RESTRICT: u64 = 1 << 1;
    /// `volatile`
    pub const TYPE_VOLATILE: u64 = 1 << 2;
}

/// Event parameters
pub mod event {
    /// Queue the command was enqueued on
    pub const COMMAND_QUEUE: u32 = 0x11D0;
    /// Command type
    pub const COMMAND_TYPE: u32 = 0x11D1;
    /// Reference count
    pub const REFERENCE_COUNT: u32 = 0x11D2;
    /// Execution status
    pub const COMMAND_EXECUTION_STATUS: u32 = 0x11D3;
    /// Owning context
    pub const CONTEXT: u32 = 0x11D4;
}
