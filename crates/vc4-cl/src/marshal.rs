//! # Uniform Marshalling
//!
//! Builds the per-QPU uniform stream a dispatch reads: a fixed header
//! describing the work-item's position, followed by the argument words.
//!
//! ```text
//!  0      work_dim
//!  1      local sizes   x | y << 8 | z << 16
//!  2      local ids     x | y << 8 | z << 16
//!  3..5   group counts
//!  6..8   group ids
//!  9..11  global offsets
//! 12..    arguments in slot order
//! ```

use vc4_core::BusAddr;

/// Words before the first argument
pub const HEADER_WORDS: usize = 12;

/// Largest local size a header dimension carries
pub const MAX_LOCAL_EXTENT: usize = 0xFF;

// =============================================================================
// GEOMETRY
// =============================================================================

/// Validated NDRange shape; unused dimensions have extent 1 and offset 0
///
/// Every global id, offset included, fits in a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Dimensions in use (1..=3)
    pub work_dim: u32,
    /// Global extent per dimension
    pub global: [usize; 3],
    /// Work-group extent per dimension
    pub local: [usize; 3],
    /// Global id offset per dimension
    pub offset: [usize; 3],
}

impl Geometry {
    /// Work-groups per dimension
    pub fn num_groups(&self) -> [usize; 3] {
        [
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
            self.global[2] / self.local[2],
        ]
    }

    /// Work-items per work-group, one QPU each
    pub fn local_count(&self) -> usize {
        self.local.iter().product()
    }

    /// Every work-group id, x fastest
    pub fn groups(&self) -> impl Iterator<Item = [usize; 3]> {
        let [nx, ny, nz] = self.num_groups();
        (0..nz).flat_map(move |z| (0..ny).flat_map(move |y| (0..nx).map(move |x| [x, y, z])))
    }

    /// Local id of the work-item run on QPU `qpu`
    pub fn local_id(&self, qpu: usize) -> [usize; 3] {
        let [lx, ly, _] = self.local;
        [qpu % lx, (qpu / lx) % ly, qpu / (lx * ly)]
    }
}

/// Work-items in a group of shape `local`, `None` on overflow
pub fn group_size(local: &[usize; 3]) -> Option<usize> {
    local.iter().try_fold(1usize, |acc, &l| acc.checked_mul(l))
}

fn pack(v: [usize; 3]) -> u32 {
    let mask = |x: usize| x as u32 & MAX_LOCAL_EXTENT as u32;
    mask(v[0]) | (mask(v[1]) << 8) | (mask(v[2]) << 16)
}

// =============================================================================
// ARGUMENTS
// =============================================================================

/// Argument value resolved for the hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundArg {
    /// Buffer bus address (null for an unset buffer)
    Buffer(BusAddr),
    /// Scalar bytes
    Scalar(Vec<u8>),
}

impl BoundArg {
    /// Uniform words the argument occupies
    pub fn word_count(&self) -> usize {
        match self {
            Self::Buffer(_) => 1,
            Self::Scalar(bytes) => bytes.len().div_ceil(4),
        }
    }

    fn push_words(&self, out: &mut Vec<u32>) {
        match self {
            Self::Buffer(addr) => out.push(addr.raw()),
            Self::Scalar(bytes) => {
                for chunk in bytes.chunks(4) {
                    let mut word = [0u8; 4];
                    word[..chunk.len()].copy_from_slice(chunk);
                    out.push(u32::from_le_bytes(word));
                }
            }
        }
    }
}

/// Argument section shared by every QPU of a dispatch
pub fn arg_words(args: &[BoundArg]) -> Vec<u32> {
    let mut out = Vec::with_capacity(args.iter().map(BoundArg::word_count).sum());
    for arg in args {
        arg.push_words(&mut out);
    }
    out
}

/// Full uniform stream for one work-item
pub fn uniforms(geometry: &Geometry, group: [usize; 3], local_id: [usize; 3], args: &[u32]) -> Vec<u32> {
    let groups = geometry.num_groups();
    let mut out = Vec::with_capacity(HEADER_WORDS + args.len());
    out.push(geometry.work_dim);
    out.push(pack(geometry.local));
    out.push(pack(local_id));
    // lossless: see `Geometry`
    out.extend(groups.iter().map(|&n| n as u32));
    out.extend(group.iter().map(|&g| g as u32));
    out.extend(geometry.offset.iter().map(|&o| o as u32));
    out.extend_from_slice(args);
    out
}
