//! # Platform Detection
//!
//! Locates the SoC peripheral window. The device tree publishes it in
//! `/proc/device-tree/soc/ranges` as big-endian cells; the first range maps
//! the VideoCore peripheral bus address onto the ARM physical base.

use std::fs;
use std::path::Path;

use vc4_core::{Error, Result};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Device-tree node carrying the peripheral ranges
pub const SOC_RANGES: &str = "/proc/device-tree/soc/ranges";

/// Peripheral base of BCM2835 (Pi 1, Zero)
pub const BCM2835_PERIPHERAL_BASE: u64 = 0x2000_0000;
/// Peripheral base of BCM2836/BCM2837 (Pi 2, Pi 3)
pub const BCM2836_PERIPHERAL_BASE: u64 = 0x3F00_0000;

/// Offset of the V3D block inside the peripheral window
pub const V3D_OFFSET: u64 = 0x00C0_0000;
/// Size of the V3D register window
pub const V3D_WINDOW_SIZE: usize = 0x1000;

/// Fallback used when the device tree cannot be read
#[cfg(feature = "bcm2835")]
pub const DEFAULT_PERIPHERAL_BASE: u64 = BCM2835_PERIPHERAL_BASE;
/// Fallback used when the device tree cannot be read
#[cfg(not(feature = "bcm2835"))]
pub const DEFAULT_PERIPHERAL_BASE: u64 = BCM2836_PERIPHERAL_BASE;

// =============================================================================
// PLATFORM INFO
// =============================================================================

/// Physical layout of the SoC peripherals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// ARM physical base of the peripheral window
    pub peripheral_base: u64,
}

impl PlatformInfo {
    /// Layout with an explicit peripheral base
    pub const fn with_base(peripheral_base: u64) -> Self {
        Self { peripheral_base }
    }

    /// Detect the layout from the device tree, falling back to `fallback`
    pub fn detect(fallback: u64) -> Self {
        match read_ranges(Path::new(SOC_RANGES)) {
            Ok(base) => {
                log::info!("peripheral base 0x{:08x} from device tree", base);
                Self::with_base(base)
            }
            Err(e) => {
                log::warn!(
                    "device tree ranges unavailable ({}), using 0x{:08x}",
                    e,
                    fallback
                );
                Self::with_base(fallback)
            }
        }
    }

    /// ARM physical address of the V3D registers
    pub const fn v3d_base(&self) -> u64 {
        self.peripheral_base + V3D_OFFSET
    }
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self::with_base(DEFAULT_PERIPHERAL_BASE)
    }
}

fn read_ranges(path: &Path) -> Result<u64> {
    let bytes = fs::read(path).map_err(|_| Error::DeviceNotFound)?;
    parse_ranges(&bytes)
}

/// Decode the ARM-side base from a `soc/ranges` blob
///
/// Single-cell parents store the base in the second word. Two-cell parents
/// (BCM2711) leave it zero and store the base in the third word.
pub fn parse_ranges(bytes: &[u8]) -> Result<u64> {
    let cell = |index: usize| -> Option<u32> {
        let raw = bytes.get(index * 4..index * 4 + 4)?;
        Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    };

    match cell(1) {
        Some(0) => cell(2).map(u64::from).ok_or(Error::MalformedResponse),
        Some(base) => Ok(u64::from(base)),
        None => Err(Error::MalformedResponse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_cell_ranges() {
        let blob = [
            0x7E, 0x00, 0x00, 0x00, 0x3F, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        ];
        assert_eq!(parse_ranges(&blob), Ok(0x3F00_0000));
    }

    #[test]
    fn test_parse_two_cell_ranges() {
        let blob = [
            0x7E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFE, 0x00, 0x00, 0x00,
        ];
        assert_eq!(parse_ranges(&blob), Ok(0xFE00_0000));
    }

    #[test]
    fn test_parse_truncated_ranges() {
        assert_eq!(parse_ranges(&[0x7E, 0, 0]), Err(Error::MalformedResponse));
    }

    #[test]
    fn test_v3d_base() {
        assert_eq!(PlatformInfo::with_base(0x3F00_0000).v3d_base(), 0x3FC0_0000);
    }
}
