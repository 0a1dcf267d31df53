//! # Kernel Binary Container
//!
//! Compiled programs arrive as a little-endian word stream: a header, one
//! descriptor per kernel (entry offset, memory footprint, required work-group
//! size, argument signature) and the QPU code itself.
//!
//! ```text
//! ┌────────┬─────────┬──────────────┬────────────┐
//! │ "VC4B" │ version │ kernel_count │ code_words │
//! ├────────┴─────────┴──────────────┴────────────┤
//! │ kernel descriptors (names, args, metadata)   │
//! ├──────────────────────────────────────────────┤
//! │ code: code_words × u64                       │
//! └──────────────────────────────────────────────┘
//! ```

use vc4_core::{Error, Result};

use crate::info;
use crate::marshal::MAX_LOCAL_EXTENT;

/// Container magic ("VC4B")
pub const MAGIC: u32 = 0x4234_4356;
/// Container version
pub const VERSION: u32 = 1;
/// Type-qualifier word meaning "not recorded"
pub const TYPE_QUALIFIER_UNKNOWN: u32 = 0xFFFF_FFFF;

// =============================================================================
// METADATA
// =============================================================================

/// Kind of an argument slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Value copied into the uniform stream
    Scalar {
        /// Size in bytes
        size: usize,
    },
    /// Buffer passed by bus address
    Buffer,
}

/// Address space of a pointer argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressQualifier {
    /// `__global`
    Global,
    /// `__local`
    Local,
    /// `__constant`
    Constant,
    /// `__private`
    Private,
}

impl AddressQualifier {
    fn decode(raw: u32) -> Result<Option<Self>> {
        Ok(match raw {
            0 => None,
            1 => Some(Self::Global),
            2 => Some(Self::Local),
            3 => Some(Self::Constant),
            4 => Some(Self::Private),
            _ => return Err(Error::InvalidBinary),
        })
    }

    fn encode(q: Option<Self>) -> u32 {
        match q {
            None => 0,
            Some(Self::Global) => 1,
            Some(Self::Local) => 2,
            Some(Self::Constant) => 3,
            Some(Self::Private) => 4,
        }
    }

    /// Value reported by argument queries
    pub fn info_value(self) -> u32 {
        match self {
            Self::Global => info::arg::ADDRESS_GLOBAL,
            Self::Local => info::arg::ADDRESS_LOCAL,
            Self::Constant => info::arg::ADDRESS_CONSTANT,
            Self::Private => info::arg::ADDRESS_PRIVATE,
        }
    }
}

/// Access qualifier of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessQualifier {
    /// `read_only`
    ReadOnly,
    /// `write_only`
    WriteOnly,
    /// `read_write`
    ReadWrite,
    /// Not an image
    None,
}

impl AccessQualifier {
    fn decode(raw: u32) -> Result<Option<Self>> {
        Ok(match raw {
            0 => None,
            1 => Some(Self::ReadOnly),
            2 => Some(Self::WriteOnly),
            3 => Some(Self::ReadWrite),
            4 => Some(Self::None),
            _ => return Err(Error::InvalidBinary),
        })
    }

    fn encode(q: Option<Self>) -> u32 {
        match q {
            None => 0,
            Some(Self::ReadOnly) => 1,
            Some(Self::WriteOnly) => 2,
            Some(Self::ReadWrite) => 3,
            Some(Self::None) => 4,
        }
    }

    /// Value reported by argument queries
    pub fn info_value(self) -> u32 {
        match self {
            Self::ReadOnly => info::arg::ACCESS_READ_ONLY,
            Self::WriteOnly => info::arg::ACCESS_WRITE_ONLY,
            Self::ReadWrite => info::arg::ACCESS_READ_WRITE,
            Self::None => info::arg::ACCESS_NONE,
        }
    }
}

/// Declared argument slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgMeta {
    /// Slot kind
    pub kind: ArgKind,
    /// Address space, if recorded
    pub address: Option<AddressQualifier>,
    /// Access qualifier, if recorded
    pub access: Option<AccessQualifier>,
    /// Type qualifier bits, if recorded
    pub type_qualifier: Option<u64>,
    /// Argument name, if recorded
    pub name: Option<String>,
    /// Type name
    pub type_name: String,
}

impl ArgMeta {
    /// Buffer argument in the global address space
    pub fn buffer(name: &str, type_name: &str) -> Self {
        Self {
            kind: ArgKind::Buffer,
            address: Some(AddressQualifier::Global),
            access: None,
            type_qualifier: Some(0),
            name: (!name.is_empty()).then(|| name.to_string()),
            type_name: type_name.to_string(),
        }
    }

    /// Private scalar argument of `size` bytes
    pub fn scalar(name: &str, type_name: &str, size: usize) -> Self {
        Self {
            kind: ArgKind::Scalar { size },
            address: Some(AddressQualifier::Private),
            access: None,
            type_qualifier: Some(0),
            name: (!name.is_empty()).then(|| name.to_string()),
            type_name: type_name.to_string(),
        }
    }

}

/// Compiled kernel entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelMeta {
    /// Entry-point name
    pub name: String,
    /// Byte offset of the first instruction in the code section
    pub entry_offset: u32,
    /// Local memory footprint in bytes
    pub local_mem: u32,
    /// Private memory footprint in bytes
    pub private_mem: u32,
    /// Work-group size fixed at compile time
    pub required_wg: Option<[usize; 3]>,
    /// Argument signature in slot order
    pub args: Vec<ArgMeta>,
}

/// Parsed program binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramBinary {
    /// Kernels in declaration order
    pub kernels: Vec<KernelMeta>,
    /// QPU instructions
    pub code: Vec<u64>,
}

impl ProgramBinary {
    /// Find a kernel by name
    pub fn kernel(&self, name: &str) -> Option<(usize, &KernelMeta)> {
        self.kernels.iter().enumerate().find(|(_, k)| k.name == name)
    }

    /// Code section as little-endian bytes
    pub fn code_bytes(&self) -> Vec<u8> {
        self.code.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Decode and validate a container
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes)?;
        if r.word()? != MAGIC {
            return Err(Error::InvalidBinary);
        }
        if r.word()? != VERSION {
            return Err(Error::InvalidBinary);
        }
        let kernel_count = r.word()? as usize;
        let code_words = r.word()? as usize;
        let code_bytes = code_words.checked_mul(8).ok_or(Error::InvalidBinary)?;

        let mut kernels = Vec::new();
        for _ in 0..kernel_count {
            let kernel = r.kernel()?;
            if kernel.entry_offset % 8 != 0 || kernel.entry_offset as usize >= code_bytes {
                return Err(Error::InvalidBinary);
            }
            if kernels.iter().any(|k: &KernelMeta| k.name == kernel.name) {
                return Err(Error::InvalidBinary);
            }
            kernels.push(kernel);
        }

        let mut code = Vec::with_capacity(code_words);
        for _ in 0..code_words {
            let low = r.word()? as u64;
            let high = r.word()? as u64;
            code.push(low | (high << 32));
        }
        if !r.is_done() {
            return Err(Error::InvalidBinary);
        }
        Ok(Self { kernels, code })
    }

    /// Encode into the container format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.word(MAGIC);
        w.word(VERSION);
        w.word(self.kernels.len() as u32);
        w.word(self.code.len() as u32);
        for kernel in &self.kernels {
            w.string(&kernel.name);
            w.word(kernel.entry_offset);
            w.word(kernel.local_mem);
            w.word(kernel.private_mem);
            for dim in kernel.required_wg.unwrap_or([0; 3]) {
                w.word(dim as u32);
            }
            w.word(kernel.args.len() as u32);
            for arg in &kernel.args {
                let (kind, size) = match arg.kind {
                    ArgKind::Scalar { size } => (0, size as u32),
                    ArgKind::Buffer => (1, 0),
                };
                w.word(kind);
                w.word(size);
                w.word(AddressQualifier::encode(arg.address));
                w.word(AccessQualifier::encode(arg.access));
                w.word(arg.type_qualifier.map_or(TYPE_QUALIFIER_UNKNOWN, |q| q as u32));
                w.string(arg.name.as_deref().unwrap_or(""));
                w.string(&arg.type_name);
            }
        }
        for &word in &self.code {
            w.word(word as u32);
            w.word((word >> 32) as u32);
        }
        w.bytes
    }
}

// =============================================================================
// READER
// =============================================================================

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(Error::InvalidBinary);
        }
        Ok(Self { bytes, pos: 0 })
    }

    fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::InvalidBinary)?;
        let slice = self.bytes.get(self.pos..end).ok_or(Error::InvalidBinary)?;
        self.pos = end;
        Ok(slice)
    }

    fn word(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.word()? as usize;
        let padded = len.checked_add(3).ok_or(Error::InvalidBinary)? & !3;
        let raw = self.take(padded)?;
        let text = core::str::from_utf8(&raw[..len]).map_err(|_| Error::InvalidBinary)?;
        Ok(text.to_string())
    }

    fn arg(&mut self) -> Result<ArgMeta> {
        let kind = match (self.word()?, self.word()?) {
            (0, 0) => return Err(Error::InvalidBinary),
            (0, size) => ArgKind::Scalar { size: size as usize },
            (1, _) => ArgKind::Buffer,
            _ => return Err(Error::InvalidBinary),
        };
        let address = AddressQualifier::decode(self.word()?)?;
        let access = AccessQualifier::decode(self.word()?)?;
        let type_qualifier = match self.word()? {
            TYPE_QUALIFIER_UNKNOWN => None,
            bits => Some(u64::from(bits)),
        };
        let name = self.string()?;
        let type_name = self.string()?;
        Ok(ArgMeta {
            kind,
            address,
            access,
            type_qualifier,
            name: (!name.is_empty()).then_some(name),
            type_name,
        })
    }

    fn kernel(&mut self) -> Result<KernelMeta> {
        let name = self.string()?;
        if name.is_empty() {
            return Err(Error::InvalidBinary);
        }
        let entry_offset = self.word()?;
        let local_mem = self.word()?;
        let private_mem = self.word()?;
        let wg = [
            self.word()? as usize,
            self.word()? as usize,
            self.word()? as usize,
        ];
        let required_wg = match wg {
            [0, 0, 0] => None,
            _ if wg.iter().all(|d| (1..=MAX_LOCAL_EXTENT).contains(d)) => Some(wg),
            _ => return Err(Error::InvalidBinary),
        };
        let arg_count = self.word()? as usize;
        let mut args = Vec::new();
        for _ in 0..arg_count {
            args.push(self.arg()?);
        }
        Ok(KernelMeta {
            name,
            entry_offset,
            local_mem,
            private_mem,
            required_wg,
            args,
        })
    }
}

// =============================================================================
// WRITER
// =============================================================================

#[derive(Default)]
struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn word(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.word(s.len() as u32);
        self.bytes.extend_from_slice(s.as_bytes());
        while self.bytes.len() % 4 != 0 {
            self.bytes.push(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProgramBinary {
        ProgramBinary {
            kernels: vec![
                KernelMeta {
                    name: "hello_world".into(),
                    entry_offset: 0,
                    local_mem: 0,
                    private_mem: 16,
                    required_wg: Some([1, 1, 1]),
                    args: vec![
                        ArgMeta::buffer("in", "char16*"),
                        ArgMeta::buffer("out", "char16*"),
                    ],
                },
                KernelMeta {
                    name: "scale".into(),
                    entry_offset: 8,
                    local_mem: 64,
                    private_mem: 0,
                    required_wg: None,
                    args: vec![ArgMeta::scalar("", "float", 4)],
                },
            ],
            code: vec![0x1111_2222_3333_4444, 0x5555],
        }
    }

    #[test]
    fn test_parse_encoded_container() {
        let binary = sample();
        let parsed = ProgramBinary::parse(&binary.to_bytes()).unwrap();
        assert_eq!(parsed, binary);
        let (index, scale) = parsed.kernel("scale").unwrap();
        assert_eq!(index, 1);
        assert_eq!(scale.args[0].name, None);
        assert_eq!(scale.args[0].kind, ArgKind::Scalar { size: 4 });
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] ^= 0xFF;
        assert_eq!(ProgramBinary::parse(&bytes), Err(Error::InvalidBinary));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().to_bytes();
        assert_eq!(
            ProgramBinary::parse(&bytes[..bytes.len() - 8]),
            Err(Error::InvalidBinary)
        );
        assert_eq!(ProgramBinary::parse(&[]), Err(Error::InvalidBinary));
    }

    #[test]
    fn test_entry_outside_code_rejected() {
        let mut binary = sample();
        binary.kernels[1].entry_offset = 16;
        assert_eq!(
            ProgramBinary::parse(&binary.to_bytes()),
            Err(Error::InvalidBinary)
        );
        binary.kernels[1].entry_offset = 4;
        assert_eq!(
            ProgramBinary::parse(&binary.to_bytes()),
            Err(Error::InvalidBinary)
        );
    }

    #[test]
    fn test_required_size_bounds() {
        let mut binary = sample();
        binary.kernels[0].required_wg = Some([255, 1, 1]);
        let parsed = ProgramBinary::parse(&binary.to_bytes()).unwrap();
        assert_eq!(parsed.kernels[0].required_wg, Some([255, 1, 1]));

        for wg in [[256, 1, 1], [1, 1, 4096], [u32::MAX as usize; 3], [0, 2, 2]] {
            binary.kernels[0].required_wg = Some(wg);
            assert_eq!(
                ProgramBinary::parse(&binary.to_bytes()),
                Err(Error::InvalidBinary)
            );
        }
    }

    #[test]
    fn test_duplicate_kernel_names_rejected() {
        let mut binary = sample();
        binary.kernels[1].name = "hello_world".into();
        assert_eq!(
            ProgramBinary::parse(&binary.to_bytes()),
            Err(Error::InvalidBinary)
        );
    }

    #[test]
    fn test_code_bytes_little_endian() {
        let bytes = sample().code_bytes();
        assert_eq!(&bytes[..8], &[0x44, 0x44, 0x33, 0x33, 0x22, 0x22, 0x11, 0x11]);
        assert_eq!(bytes.len(), 16);
    }
}
