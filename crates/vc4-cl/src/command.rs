//! # Commands
//!
//! Internal record of one enqueued operation. Everything a command needs is
//! captured at enqueue time: argument snapshots, the buffers it touches and
//! the uploaded program, so releasing the API objects afterwards cannot
//! change what runs.

use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::event::Event;
use crate::marshal::{BoundArg, Geometry};
use crate::program::BuiltProgram;
use crate::status::ExecutionStatus;

/// Command type codes reported by event queries
pub mod command_type {
    /// NDRange kernel
    pub const NDRANGE_KERNEL: u32 = 0x11F0;
    /// Single work-item kernel
    pub const TASK: u32 = 0x11F1;
    /// Host callback
    pub const NATIVE_KERNEL: u32 = 0x11F2;
    /// Buffer read
    pub const READ_BUFFER: u32 = 0x11F3;
    /// Buffer write
    pub const WRITE_BUFFER: u32 = 0x11F4;
    /// Buffer copy
    pub const COPY_BUFFER: u32 = 0x11F5;
    /// Marker
    pub const MARKER: u32 = 0x11FE;
    /// Buffer fill
    pub const FILL_BUFFER: u32 = 0x1207;
}

/// Host routine run by a native-kernel command
pub type NativeFn = Box<dyn FnOnce() + Send + 'static>;

/// Kernel dispatch captured at enqueue
#[derive(Debug)]
pub(crate) struct Dispatch {
    /// Keeps the code resident while the dispatch exists
    pub program: Arc<BuiltProgram>,
    /// Kernel index within the program
    pub kernel: usize,
    pub geometry: Geometry,
    pub args: Vec<BoundArg>,
    /// Buffers bound to the arguments
    pub buffers: Vec<Arc<Buffer>>,
}

/// What a command does
pub(crate) enum CommandKind {
    NdRange(Dispatch),
    Fill {
        buffer: Arc<Buffer>,
        offset: usize,
        len: usize,
        pattern: Vec<u8>,
    },
    Native(NativeFn),
    Read {
        buffer: Arc<Buffer>,
        offset: usize,
        len: usize,
        out: Sender<Vec<u8>>,
    },
    Write {
        buffer: Arc<Buffer>,
        offset: usize,
        data: Vec<u8>,
    },
    Copy {
        src: Arc<Buffer>,
        dst: Arc<Buffer>,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    },
    /// Completes once everything before it on the queue has
    Marker,
}

impl fmt::Debug for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NdRange(d) => f.debug_tuple("NdRange").field(&d.geometry).finish(),
            Self::Fill { offset, len, .. } => write!(f, "Fill({}+{})", offset, len),
            Self::Native(_) => f.write_str("Native"),
            Self::Read { offset, len, .. } => write!(f, "Read({}+{})", offset, len),
            Self::Write { offset, data, .. } => write!(f, "Write({}+{})", offset, data.len()),
            Self::Copy { len, .. } => write!(f, "Copy({})", len),
            Self::Marker => f.write_str("Marker"),
        }
    }
}

/// Enqueued command
#[derive(Debug)]
pub(crate) struct Command {
    pub kind: CommandKind,
    /// Events that must be terminal before the command may start
    pub wait_list: Vec<Arc<Event>>,
    /// Event the command completes
    pub event: Arc<Event>,
}

impl Command {
    /// Whether every dependency has finished
    pub fn is_ready(&self) -> bool {
        self.wait_list.iter().all(|e| e.status().is_terminal())
    }

    /// Whether a dependency finished in error
    pub fn dependency_failed(&self) -> bool {
        self.wait_list
            .iter()
            .any(|e| matches!(e.status(), ExecutionStatus::Error(_)))
    }
}
