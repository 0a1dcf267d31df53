//! # Context
//!
//! Anchor for every other object. Children hold a reference on their
//! context, so it outlives everything created in it.

use std::sync::Arc;

use vc4_core::{Error, Handle, Result};

use crate::device::Device;
use crate::info::InfoValue;

/// `CL_CONTEXT_PLATFORM` property key
pub const PROPERTY_PLATFORM: u64 = 0x1084;

/// Compute context over the GPU
#[derive(Debug)]
pub struct Context {
    device: Arc<Device>,
    device_handle: Handle<Device>,
    properties: Vec<u64>,
}

impl Context {
    /// Context for `device`, with a zero-terminated key/value property list
    pub fn new(device: Arc<Device>, device_handle: Handle<Device>, properties: &[u64]) -> Result<Self> {
        let properties = validate_properties(properties)?;
        Ok(Self {
            device,
            device_handle,
            properties,
        })
    }

    /// The context's device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Handle of the context's device
    pub fn device_handle(&self) -> Handle<Device> {
        self.device_handle
    }

    /// Answer a context query other than the reference count
    pub fn info(&self, param: u32) -> Result<InfoValue> {
        use crate::info::context::*;
        match param {
            DEVICES => Ok(InfoValue::Handles(vec![self.device_handle.raw()])),
            NUM_DEVICES => Ok(InfoValue::U32(1)),
            PROPERTIES => Ok(InfoValue::Bytes(
                self.properties.iter().flat_map(|p| p.to_le_bytes()).collect(),
            )),
            _ => Err(Error::InvalidValue),
        }
    }
}

/// Keep the list as given (terminator included) if every key is known
fn validate_properties(properties: &[u64]) -> Result<Vec<u64>> {
    if properties.is_empty() {
        return Ok(Vec::new());
    }
    let mut seen_platform = false;
    let mut pairs = properties.chunks(2);
    loop {
        match pairs.next() {
            Some([0]) | Some([0, _]) => break,
            Some([PROPERTY_PLATFORM, _]) if !seen_platform => seen_platform = true,
            _ => return Err(Error::InvalidValue),
        }
    }
    let end = properties.iter().step_by(2).position(|&k| k == 0).map_or(0, |i| i * 2 + 1);
    Ok(properties[..end].to_vec())
}
