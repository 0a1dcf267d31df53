//! # Command Queues
//!
//! A queue binds a context to the device and owns one engine lane. This
//! module also holds the enqueue-time validation of NDRange geometry.

use bitflags::bitflags;
use vc4_core::{Error, Handle, Result};

use crate::binary::KernelMeta;
use crate::context::Context;
use crate::device::Device;
use crate::info::InfoValue;
use crate::marshal::{group_size, Geometry};

bitflags! {
    /// Queue creation properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueProperties: u64 {
        /// Commands may start out of enqueue order
        const OUT_OF_ORDER_EXEC_MODE = 1 << 0;
        /// Record command timestamps
        const PROFILING_ENABLE = 1 << 1;
    }
}

/// Command queue
#[derive(Debug)]
pub struct CommandQueue {
    context: Handle<Context>,
    device: Handle<Device>,
    properties: QueueProperties,
    lane: u64,
}

impl CommandQueue {
    pub(crate) fn new(
        context: Handle<Context>,
        device: Handle<Device>,
        properties: QueueProperties,
        lane: u64,
    ) -> Self {
        Self {
            context,
            device,
            properties,
            lane,
        }
    }

    /// Decode raw properties
    pub fn parse_properties(raw: u64) -> Result<QueueProperties> {
        QueueProperties::from_bits(raw).ok_or(Error::InvalidQueueProperties)
    }

    /// Owning context
    pub fn context(&self) -> Handle<Context> {
        self.context
    }

    /// Creation properties
    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    pub(crate) fn lane(&self) -> u64 {
        self.lane
    }

    /// Answer a queue query other than reference count and context
    pub fn info(&self, param: u32) -> Result<InfoValue> {
        use crate::info::queue::*;
        match param {
            DEVICE => Ok(InfoValue::Handle(self.device.raw())),
            PROPERTIES => Ok(InfoValue::U64(self.properties.bits())),
            _ => Err(Error::InvalidValue),
        }
    }
}

// =============================================================================
// GEOMETRY VALIDATION
// =============================================================================

/// Caller-supplied NDRange shape
#[derive(Debug, Clone, Copy)]
pub struct NdRange<'a> {
    /// Dimensions in use
    pub work_dim: u32,
    /// Global id offsets, zero when absent
    pub offset: Option<&'a [usize]>,
    /// Global extent
    pub global: &'a [usize],
    /// Work-group extent, chosen by the runtime when absent
    pub local: Option<&'a [usize]>,
}

impl<'a> NdRange<'a> {
    /// One work-item on three dimensions
    pub const TASK: NdRange<'static> = NdRange {
        work_dim: 3,
        offset: None,
        global: &[1, 1, 1],
        local: Some(&[1, 1, 1]),
    };

    /// Range without offset and with a runtime-chosen local size
    pub fn new(work_dim: u32, global: &'a [usize]) -> Self {
        Self {
            work_dim,
            offset: None,
            global,
            local: None,
        }
    }

    /// Set the work-group extent
    pub fn with_local(mut self, local: &'a [usize]) -> Self {
        self.local = Some(local);
        self
    }

    /// Set the global offset
    pub fn with_offset(mut self, offset: &'a [usize]) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Check the range against the dimension limits only
    pub(crate) fn check_dimensions(&self) -> Result<usize> {
        if !(1..=3).contains(&self.work_dim) {
            return Err(Error::InvalidWorkDimension);
        }
        let dims = self.work_dim as usize;
        if self.global.len() < dims
            || self.global[..dims].iter().any(|&g| g == 0 || g > u32::MAX as usize)
        {
            return Err(Error::InvalidGlobalWorkSize);
        }
        Ok(dims)
    }

    /// Resolve into a dispatch shape for `kernel` on a device with
    /// `max_group` QPUs
    pub(crate) fn resolve(&self, kernel: &KernelMeta, max_group: usize) -> Result<Geometry> {
        let dims = self.check_dimensions()?;

        let mut global = [1usize; 3];
        global[..dims].copy_from_slice(&self.global[..dims]);

        let mut offset = [0usize; 3];
        if let Some(given) = self.offset {
            if given.len() < dims {
                return Err(Error::InvalidValue);
            }
            offset[..dims].copy_from_slice(&given[..dims]);
        }
        // Global ids travel as 32-bit uniforms
        if offset
            .iter()
            .zip(&global)
            .any(|(&o, &g)| o.checked_add(g - 1).map_or(true, |last| last > u32::MAX as usize))
        {
            return Err(Error::InvalidValue);
        }

        let local = match self.local {
            Some(given) => {
                if given.len() < dims {
                    return Err(Error::InvalidValue);
                }
                let mut local = [1usize; 3];
                local[..dims].copy_from_slice(&given[..dims]);
                if local.iter().zip(&global).any(|(&l, &g)| l == 0 || g % l != 0) {
                    return Err(Error::InvalidWorkGroupSize);
                }
                if local.iter().any(|&l| l > max_group) {
                    return Err(Error::InvalidWorkItemSize);
                }
                if !fits_group(&local, max_group) {
                    return Err(Error::InvalidWorkGroupSize);
                }
                if kernel.required_wg.is_some_and(|required| required != local) {
                    return Err(Error::InvalidWorkGroupSize);
                }
                local
            }
            None => match kernel.required_wg {
                Some(required) => {
                    if !fits_group(&required, max_group)
                        || required.iter().zip(&global).any(|(&l, &g)| g % l != 0)
                    {
                        return Err(Error::InvalidWorkGroupSize);
                    }
                    required
                }
                None => default_local(&global, max_group),
            },
        };

        Ok(Geometry {
            work_dim: self.work_dim,
            global,
            local,
            offset,
        })
    }
}

/// Whether a work-group of shape `local` runs on `max_group` QPUs at once
fn fits_group(local: &[usize; 3], max_group: usize) -> bool {
    group_size(local).is_some_and(|count| count > 0 && count <= max_group)
}

/// Largest divisor of each global extent, greedily, keeping the product
/// within `max_group`
fn default_local(global: &[usize; 3], max_group: usize) -> [usize; 3] {
    let mut remaining = max_group.max(1);
    let mut local = [1usize; 3];
    for (l, &g) in local.iter_mut().zip(global) {
        *l = (1..=remaining.min(g)).rev().find(|d| g % d == 0).unwrap_or(1);
        remaining /= *l;
    }
    local
}
