//! # Property Messages
//!
//! Single-tag property buffers exchanged with the VideoCore firmware.
//!
//! ```text
//! word 0   total buffer size in bytes
//! word 1   request code (0) / response code (0x8000_0000 ok, 0x8000_0001 error)
//! word 2   tag id
//! word 3   value buffer size in bytes
//! word 4   request: 0, response: 0x8000_0000 | response length in bytes
//! word 5.. value buffer
//! last     end tag (0)
//! ```

use vc4_core::{Error, Result};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Buffer codes
pub mod code {
    /// Process request
    pub const REQUEST: u32 = 0x0000_0000;
    /// Request successful
    pub const SUCCESS: u32 = 0x8000_0000;
    /// Error parsing request buffer
    pub const ERROR: u32 = 0x8000_0001;
}

/// Set in word 4 when the firmware answered the tag
pub const RESPONSE_BIT: u32 = 0x8000_0000;

/// Words before the value buffer
pub const HEADER_WORDS: usize = 5;

// =============================================================================
// TAGS
// =============================================================================

/// Property tags used by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Tag {
    /// Firmware revision
    FirmwareRevision = 0x0000_0001,
    /// Board model
    BoardModel = 0x0001_0001,
    /// Board revision
    BoardRevision = 0x0001_0002,
    /// Board MAC address
    MacAddress = 0x0001_0003,
    /// Board serial number
    BoardSerial = 0x0001_0004,
    /// ARM memory base and size
    ArmMemory = 0x0001_0005,
    /// VideoCore memory base and size
    VcMemory = 0x0001_0006,
    /// Current clock rate
    GetClockRate = 0x0003_0002,
    /// Maximum clock rate
    GetMaxClockRate = 0x0003_0004,
    /// SoC temperature
    GetTemperature = 0x0003_0006,
    /// Minimum clock rate
    GetMinClockRate = 0x0003_0007,
    /// Maximum safe temperature
    GetMaxTemperature = 0x0003_000A,
    /// Allocate GPU memory
    AllocateMemory = 0x0003_000C,
    /// Lock GPU memory, returning its bus address
    LockMemory = 0x0003_000D,
    /// Unlock GPU memory
    UnlockMemory = 0x0003_000E,
    /// Release GPU memory
    ReleaseMemory = 0x0003_000F,
    /// Execute code on the QPUs
    ExecuteQpu = 0x0003_0011,
    /// Power the QPUs on or off
    EnableQpu = 0x0003_0012,
    /// Set clock rate
    SetClockRate = 0x0003_8002,
}

impl Tag {
    /// Raw tag id
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Look up a tag by its raw id
    pub fn from_raw(raw: u32) -> Option<Self> {
        use Tag::*;
        [
            FirmwareRevision,
            BoardModel,
            BoardRevision,
            MacAddress,
            BoardSerial,
            ArmMemory,
            VcMemory,
            GetClockRate,
            GetMaxClockRate,
            GetTemperature,
            GetMinClockRate,
            GetMaxTemperature,
            AllocateMemory,
            LockMemory,
            UnlockMemory,
            ReleaseMemory,
            ExecuteQpu,
            EnableQpu,
            SetClockRate,
        ]
        .into_iter()
        .find(|t| t.raw() == raw)
    }

    /// Number of words the firmware answers with
    pub const fn response_words(self) -> usize {
        match self {
            Self::FirmwareRevision | Self::BoardModel | Self::BoardRevision => 1,
            Self::MacAddress | Self::BoardSerial | Self::ArmMemory | Self::VcMemory => 2,
            Self::GetClockRate
            | Self::GetMaxClockRate
            | Self::GetMinClockRate
            | Self::SetClockRate
            | Self::GetTemperature
            | Self::GetMaxTemperature => 2,
            Self::AllocateMemory
            | Self::LockMemory
            | Self::UnlockMemory
            | Self::ReleaseMemory
            | Self::ExecuteQpu
            | Self::EnableQpu => 1,
        }
    }
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// Build a single-tag request buffer
///
/// The value buffer is sized for the larger of request and response.
pub fn encode(tag: Tag, request: &[u32]) -> Vec<u32> {
    let value_words = request.len().max(tag.response_words());
    let total_words = HEADER_WORDS + value_words + 1;

    let mut buffer = Vec::with_capacity(total_words);
    buffer.push((total_words * 4) as u32);
    buffer.push(code::REQUEST);
    buffer.push(tag.raw());
    buffer.push((value_words * 4) as u32);
    buffer.push(0);
    buffer.extend_from_slice(request);
    buffer.resize(HEADER_WORDS + value_words, 0);
    buffer.push(0);
    buffer
}

/// Validate a response buffer and extract the value words
pub fn decode(tag: Tag, buffer: &[u32]) -> Result<Vec<u32>> {
    if buffer.len() < HEADER_WORDS + 1 {
        return Err(Error::MalformedResponse);
    }

    match buffer[1] {
        code::SUCCESS => {}
        code::ERROR => return Err(Error::FirmwareRejected),
        other => {
            log::warn!("mailbox: unexpected buffer code 0x{:08x} for {:?}", other, tag);
            return Err(Error::MalformedResponse);
        }
    }

    if buffer[2] != tag.raw() {
        log::warn!("mailbox: tag 0x{:08x} answered as 0x{:08x}", tag.raw(), buffer[2]);
        return Err(Error::MalformedResponse);
    }

    let indicator = buffer[4];
    if indicator & RESPONSE_BIT == 0 {
        return Err(Error::MalformedResponse);
    }

    let capacity = buffer[3] as usize / 4;
    let returned = (indicator & !RESPONSE_BIT) as usize / 4;
    let wanted = tag.response_words();
    if returned < wanted {
        return Err(Error::ShortResponse);
    }
    if capacity < wanted || buffer.len() < HEADER_WORDS + wanted {
        return Err(Error::MalformedResponse);
    }

    Ok(buffer[HEADER_WORDS..HEADER_WORDS + wanted].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(buffer: &mut [u32], values: &[u32]) {
        buffer[1] = code::SUCCESS;
        buffer[4] = RESPONSE_BIT | (values.len() * 4) as u32;
        buffer[HEADER_WORDS..HEADER_WORDS + values.len()].copy_from_slice(values);
    }

    #[test]
    fn test_encode_layout() {
        let buf = encode(Tag::AllocateMemory, &[4096, 4096, 0xC]);
        assert_eq!(buf.len(), 9);
        assert_eq!(buf[0], 36);
        assert_eq!(buf[2], 0x0003_000C);
        assert_eq!(buf[3], 12);
        assert_eq!(&buf[5..8], &[4096, 4096, 0xC]);
        assert_eq!(buf[8], 0);
    }

    #[test]
    fn test_encode_reserves_response_space() {
        let buf = encode(Tag::BoardSerial, &[]);
        assert_eq!(buf[3], 8);
        assert_eq!(buf.len(), HEADER_WORDS + 2 + 1);
    }

    #[test]
    fn test_decode_success() {
        let mut buf = encode(Tag::ArmMemory, &[]);
        answer(&mut buf, &[0, 0x3B00_0000]);
        assert_eq!(decode(Tag::ArmMemory, &buf), Ok(vec![0, 0x3B00_0000]));
    }

    #[test]
    fn test_decode_short_response() {
        let mut buf = encode(Tag::MacAddress, &[]);
        answer(&mut buf, &[0x12345678]);
        assert_eq!(decode(Tag::MacAddress, &buf), Err(Error::ShortResponse));
    }

    #[test]
    fn test_decode_rejects_wrong_tag_and_code() {
        let mut buf = encode(Tag::BoardModel, &[]);
        answer(&mut buf, &[1]);
        buf[2] = Tag::BoardRevision.raw();
        assert_eq!(decode(Tag::BoardModel, &buf), Err(Error::MalformedResponse));

        let mut buf = encode(Tag::BoardModel, &[]);
        buf[1] = code::ERROR;
        assert_eq!(decode(Tag::BoardModel, &buf), Err(Error::FirmwareRejected));

        let buf = encode(Tag::BoardModel, &[]);
        assert_eq!(decode(Tag::BoardModel, &buf), Err(Error::MalformedResponse));
    }

    #[test]
    fn test_tag_lookup() {
        assert_eq!(Tag::from_raw(0x0003_0011), Some(Tag::ExecuteQpu));
        assert_eq!(Tag::from_raw(0xFFFF), None);
    }
}
